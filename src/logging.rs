use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Initialize the global tracing subscriber.
///
/// `level` is an EnvFilter directive (e.g. "info" or "spritessh=debug,russh=warn").
/// Falls back to "info" when the directive does not parse.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
