use tracing_subscriber::{fmt, EnvFilter};

/// Variable holding the log filter, e.g. `TILESEG_LOG=tileseg_rs=debug`.
pub const LOG_ENV: &str = "TILESEG_LOG";

/// Filter used by both binaries when `TILESEG_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a stderr subscriber. Stdout is left to the job protocol.
///
/// Calling it again is harmless; only the first subscriber sticks.
pub fn init() {
    let filter = filter_from(std::env::var(LOG_ENV).ok().as_deref());
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn filter_from(value: Option<&str>) -> EnvFilter {
    value
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_invalid_filter_falls_back_to_info() {
        assert_eq!(filter_from(None).to_string(), "info");
        assert_eq!(filter_from(Some("tileseg_rs=loud")).to_string(), "info");
        assert_eq!(filter_from(Some("debug")).to_string(), "debug");
    }
}
