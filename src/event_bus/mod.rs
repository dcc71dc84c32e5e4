//! Run lifecycle event stream.
//!
//! The engine publishes run transitions and stage messages here; sinks fan
//! them out to stdout, memory buffers, or channels. The status tracker is a
//! channel consumer of this stream.

mod bus;
mod event;
mod sink;

pub use bus::EventBus;
pub use event::{DiagnosticEvent, Event, RunTransitionEvent, StageEvent};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
