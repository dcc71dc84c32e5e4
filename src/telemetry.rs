//! Tracing setup and event rendering.

use std::io::IsTerminal;

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::event_bus::Event;

const STAGE_COLOR: &str = "\x1b[36m"; // cyan
const RUN_COLOR: &str = "\x1b[32m"; // green
const RESET_COLOR: &str = "\x1b[0m";

/// Formatter color mode for event output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Auto-detect TTY capability (checks `stderr.is_terminal()`).
    #[default]
    Auto,
    /// Always include ANSI color codes.
    Colored,
    /// Never include color codes (for logs/files).
    Plain,
}

impl FormatterMode {
    /// Returns true if this mode should use colored output.
    #[must_use]
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Render one event as a single log line.
#[must_use]
pub fn render_event(event: &Event, mode: FormatterMode) -> String {
    let colored = mode.is_colored();
    let paint = |color: &str, text: &str| {
        if colored {
            format!("{color}{text}{RESET_COLOR}")
        } else {
            text.to_string()
        }
    };

    match event {
        Event::Run(run) => format!(
            "{} run={} status={} stage={} {}",
            paint(RUN_COLOR, "[run]"),
            run.run_id,
            run.status,
            run.stage.as_deref().unwrap_or("-"),
            run.message,
        ),
        Event::Stage(stage) => format!(
            "{} run={} stage={} attempt={} scope={} {}",
            paint(STAGE_COLOR, "[stage]"),
            stage.run_id,
            stage.stage,
            stage.attempt,
            stage.scope,
            stage.message,
        ),
        Event::Diagnostic(diag) => format!("[diag] scope={} {}", diag.scope, diag.message),
    }
}

/// Install the global tracing subscriber: `RUST_LOG`-driven filtering,
/// compact fmt output, and span-trace capture for error reports.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(ErrorLayer::default())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;

    #[test]
    fn plain_mode_has_no_ansi_codes() {
        let event = Event::run_transition("run_1", RunStatus::Running, None, "started");
        let rendered = render_event(&event, FormatterMode::Plain);
        assert!(!rendered.contains("\x1b["));
        assert!(rendered.contains("run_1"));
    }

    #[test]
    fn colored_mode_paints_the_tag() {
        let event = Event::stage_message("run_1", "research", 1, "fetch", "pulling sources");
        let rendered = render_event(&event, FormatterMode::Colored);
        assert!(rendered.starts_with(STAGE_COLOR));
    }
}
