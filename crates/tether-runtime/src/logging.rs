//! Logging setup on top of `tracing-subscriber`.
//!
//! Every bot runs its tasks inside a [`bot_span`] carrying the bot name, so
//! span events are the quickest way to see when a controller's pump,
//! heartbeat or reconnect tails start and finish. `global.debug` turns on
//! request tracing in the HTTP layer.
//!
//! ```rust,ignore
//! use tether_runtime::logging::{LoggingBuilder, SpanEvents};
//!
//! // From configuration
//! tether_runtime::logging::init_from_config(&config);
//!
//! // By hand
//! LoggingBuilder::new()
//!     .directive("tether_transport=trace")
//!     .span_events(SpanEvents::LIFECYCLE)
//!     .init();
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{Span, info_span, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, SpanEventConfig, TetherConfig};

const DEFAULT_LOG_FILE: &str = "tether.log";

/// Directive added when `global.debug` is set.
const DEBUG_DIRECTIVE: &str = "tether_transport=trace";

/// Span wrapping every task a bot spawns.
pub fn bot_span(name: &str) -> Span {
    info_span!("bot", name)
}

/// Which span lifecycle events are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanEvents {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

impl SpanEvents {
    /// Creation and close only: one line when a bot task starts and one
    /// when it ends.
    pub const LIFECYCLE: Self = Self {
        new: true,
        enter: false,
        exit: false,
        close: true,
    };

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

impl From<&SpanEventConfig> for SpanEvents {
    fn from(config: &SpanEventConfig) -> Self {
        Self {
            new: config.new,
            enter: config.enter,
            exit: config.exit,
            close: config.close,
        }
    }
}

/// Initializes logging from configuration. A second call is a no-op.
pub fn init_from_config(config: &TetherConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

/// A builder for the global subscriber.
#[derive(Debug, Default)]
pub struct LoggingBuilder {
    directives: Vec<String>,
    level: Option<tracing::Level>,
    span_events: SpanEvents,
    format: LogFormat,
    output: LogOutput,
    rotation: LogRotation,
    file_path: Option<PathBuf>,
    thread_ids: bool,
    file_location: bool,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the `logging` section plus the `global.debug` switch.
    pub fn from_config(config: &TetherConfig) -> Self {
        let logging = &config.logging;
        let mut builder = Self {
            level: Some(logging.level.to_tracing_level()),
            span_events: SpanEvents::from(&logging.span_events),
            format: logging.format,
            output: logging.output,
            rotation: logging.rotation,
            file_path: logging.file_path.clone(),
            thread_ids: logging.thread_ids,
            file_location: logging.file_location,
            ..Self::default()
        };

        let mut filters: Vec<_> = logging.filters.iter().collect();
        filters.sort_by(|a, b| a.0.cmp(b.0));
        for (target, level) in filters {
            builder.directives.push(format!("{target}={level}"));
        }
        if config.global.debug {
            builder.directives.push(DEBUG_DIRECTIVE.to_string());
        }

        builder
    }

    pub fn with_level(mut self, level: tracing::Level) -> Self {
        self.level = Some(level);
        self
    }

    /// Adds a filter directive such as `tether_runtime::session=debug`.
    pub fn directive(mut self, directive: &str) -> Self {
        self.directives.push(directive.to_string());
        self
    }

    pub fn span_events(mut self, events: SpanEvents) -> Self {
        self.span_events = events;
        self
    }

    /// `RUST_LOG` wins over the configured level; directives are added on top.
    fn build_filter(&self) -> EnvFilter {
        let base = self
            .level
            .unwrap_or(tracing::Level::INFO)
            .to_string()
            .to_lowercase();

        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));

        for directive in &self.directives {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring invalid log directive '{directive}': {e}"),
            }
        }

        filter
    }

    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Installs the subscriber, failing if one is already set.
    pub fn try_init(self) -> Result<(), TryInitError> {
        let filter = self.build_filter();
        let span_events = self.span_events.to_fmt_span();

        macro_rules! configure_layer {
            ($layer:expr) => {
                $layer
                    .with_span_events(span_events.clone())
                    .with_thread_ids(self.thread_ids)
                    .with_file(self.file_location)
                    .with_line_number(self.file_location)
            };
        }

        macro_rules! init_with_writer {
            ($writer:expr) => {
                match self.format {
                    #[cfg(feature = "json-log")]
                    LogFormat::Json => tracing_subscriber::registry()
                        .with(
                            fmt::layer()
                                .json()
                                .with_span_events(span_events.clone())
                                .with_writer($writer),
                        )
                        .with(filter)
                        .try_init(),
                    LogFormat::Compact => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().compact().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Full => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                    LogFormat::Pretty => tracing_subscriber::registry()
                        .with(configure_layer!(fmt::layer().pretty().with_writer($writer)))
                        .with(filter)
                        .try_init(),
                }
            };
        }

        match self.output {
            LogOutput::Stdout => init_with_writer!(std::io::stdout),
            LogOutput::Stderr => init_with_writer!(std::io::stderr),
            LogOutput::File => match &self.file_path {
                Some(path) => {
                    let directory = path.parent().unwrap_or_else(|| Path::new("."));
                    let file_name = path
                        .file_name()
                        .unwrap_or_else(|| OsStr::new(DEFAULT_LOG_FILE));
                    let appender = match self.rotation {
                        LogRotation::Never => tracing_appender::rolling::never(directory, file_name),
                        LogRotation::Hourly => {
                            tracing_appender::rolling::hourly(directory, file_name)
                        }
                        LogRotation::Daily => tracing_appender::rolling::daily(directory, file_name),
                    };
                    init_with_writer!(appender)
                }
                None => {
                    let result = init_with_writer!(std::io::stdout);
                    warn!("File output requested without a file path, logging to stdout");
                    result
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::{LogLevel, LoggingConfig};

    #[test]
    fn test_from_config_collects_sorted_filters() {
        let logging = LoggingConfig {
            level: LogLevel::Debug,
            filters: HashMap::from([
                ("tether_runtime::session".to_string(), LogLevel::Trace),
                ("hyper".to_string(), LogLevel::Warn),
            ]),
            span_events: SpanEventConfig {
                new: true,
                close: true,
                ..Default::default()
            },
            thread_ids: true,
            ..Default::default()
        };
        let config = TetherConfig {
            logging,
            ..Default::default()
        };

        let builder = LoggingBuilder::from_config(&config);

        assert_eq!(builder.level, Some(tracing::Level::DEBUG));
        assert_eq!(
            builder.directives,
            vec![
                "hyper=warn".to_string(),
                "tether_runtime::session=trace".to_string()
            ]
        );
        assert_eq!(builder.span_events, SpanEvents::LIFECYCLE);
        assert!(builder.thread_ids);
    }

    #[test]
    fn test_global_debug_traces_requests() {
        let mut config = TetherConfig::default();
        assert!(LoggingBuilder::from_config(&config).directives.is_empty());

        config.global.debug = true;
        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.directives, vec![DEBUG_DIRECTIVE.to_string()]);
    }

    #[test]
    fn test_bot_span_carries_the_bot_name() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = bot_span("main");
            let metadata = span.metadata().unwrap();
            assert_eq!(metadata.name(), "bot");
            assert!(metadata.fields().field("name").is_some());
        });
    }
}
