//! Diagnostic output for the helper.
//!
//! Every event is written to stderr as a single line starting with
//! [`LOG_PREFIX`]. Levels other than `INFO` are spelled out after the prefix,
//! structured fields follow the message:
//!
//! ```text
//! [helper] accepted connection from agent
//! [helper] ERROR: ruleset application failed error=rule compiler exited with status 1
//! ```

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Prefix on every log line.
pub const LOG_PREFIX: &str = "[helper]";

/// Event formatter producing `[helper] LEVEL: message key=value` lines.
#[derive(Debug, Clone)]
pub struct HelperFormat {
    prefix: &'static str,
}

impl Default for HelperFormat {
    fn default() -> Self {
        Self { prefix: LOG_PREFIX }
    }
}

impl<S, N> FormatEvent<S, N> for HelperFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        write!(writer, "{} ", self.prefix)?;
        if level != Level::INFO {
            write!(writer, "{level}: ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` when it is set and valid.
pub fn init(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .event_format(HelperFormat::default())
        .try_init()
}
