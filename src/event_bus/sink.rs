use std::io::{self, Result as IoResult, Stdout, Write};
use std::sync::{Arc, Mutex};

use super::event::Event;
use crate::telemetry::{FormatterMode, render_event};

/// Abstraction over an output target that consumes full [`Event`] objects.
pub trait EventSink: Send + Sync {
    /// Handle a structured event. The sink decides how to serialize it.
    fn handle(&mut self, event: &Event) -> IoResult<()>;
}

/// Stdout sink with TTY-aware formatting.
pub struct StdOutSink {
    handle: Stdout,
    mode: FormatterMode,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
            mode: FormatterMode::Auto,
        }
    }
}

impl StdOutSink {
    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self {
            handle: io::stdout(),
            mode,
        }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        let mut rendered = render_event(event, self.mode);
        rendered.push('\n');
        self.handle.write_all(rendered.as_bytes())?;
        self.handle.flush()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event captured so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().expect("memory sink poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        self.entries
            .lock()
            .expect("memory sink poisoned")
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events into a flume channel, for per-consumer streaming.
pub struct ChannelSink {
    sender: flume::Sender<Event>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(sender: flume::Sender<Event>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &Event) -> IoResult<()> {
        // A dropped receiver is a consumer choice, not a bus fault.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}
