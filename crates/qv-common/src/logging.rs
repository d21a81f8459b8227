//! Logging bootstrap.
//!
//! JSON output for production (`LOG_FORMAT=json`), human-readable text
//! otherwise. Level filtering follows `RUST_LOG` (default: info). Use the
//! `tracing` macros with structured fields throughout:
//!
//! ```rust,ignore
//! tracing::info!(message_id = %id, "message dispatched");
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn format_from_env() -> LogFormat {
    match std::env::var("LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// Install the global subscriber. Call once, from the application entry
/// point; library code only emits events.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format_from_env() {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_target(true)
                        .flatten_event(true)
                        .with_span_events(FmtSpan::CLOSE),
                )
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(true),
                )
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_text_format() {
        std::env::remove_var("LOG_FORMAT");
        assert_eq!(format_from_env(), LogFormat::Text);
    }
}
