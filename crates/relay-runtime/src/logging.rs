//! Structured logging setup (§4.10, AMBIENT): a `LoggingBuilder`/`SpanEvents`
//! pair namespaced to this crate's own targets (`relay_listener::control`,
//! `relay_listener::rendezvous`, `relay_listener::http`).

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogLevel;

/// Span event configuration covering the relay engine's suspension points
/// (§5): connect, reconnect backoff, and rendezvous promotion.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    pub const NONE: Self = Self { new: false, enter: false, exit: false, close: false };
    pub const LIFECYCLE: Self = Self { new: true, enter: false, exit: false, close: true };
    pub const FULL: Self = Self { new: true, enter: true, exit: true, close: true };

    fn to_fmt_span(self) -> fmt::format::FmtSpan {
        let mut span = fmt::format::FmtSpan::NONE;
        if self.new {
            span |= fmt::format::FmtSpan::NEW;
        }
        if self.enter {
            span |= fmt::format::FmtSpan::ENTER;
        }
        if self.exit {
            span |= fmt::format::FmtSpan::EXIT;
        }
        if self.close {
            span |= fmt::format::FmtSpan::CLOSE;
        }
        span
    }
}

/// Default filter: the named level across the board, with the control
/// connection, rendezvous engine, and HTTP tunnel independently steerable
/// via `RUST_LOG` (e.g. `relay_listener::control=trace`).
pub fn default_relay_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Fluent builder for the process-wide `tracing` subscriber.
#[derive(Default)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: Option<LogLevel>,
    span_events: SpanEvents,
    with_target: bool,
    with_thread_ids: bool,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    pub fn with_span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let mut filter = default_relay_filter(self.level.unwrap_or_default());
        for directive in &self.directives {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }

    /// Initializes the global subscriber. Panics if one is already set.
    pub fn init(self) {
        let filter = self.build_filter();
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_span_events(self.span_events.to_fmt_span())
                    .with_target(self.with_target)
                    .with_thread_ids(self.with_thread_ids),
            )
            .with(filter)
            .init();
    }

    pub fn try_init(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let filter = self.build_filter();
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_span_events(self.span_events.to_fmt_span())
                    .with_target(self.with_target)
                    .with_thread_ids(self.with_thread_ids),
            )
            .with(filter)
            .try_init()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

/// Convenience entry point used by `relay`'s own examples/tests: initializes
/// with the level from a loaded [`crate::config::RelayConfig`].
pub fn init_from_config(logging: &crate::config::LoggingSection) {
    LoggingBuilder::new().with_level(logging.level).with_span_events(SpanEvents::LIFECYCLE).init();
}
