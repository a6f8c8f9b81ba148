use crate::config::LoggingSettings;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives: `RUST_LOG` when set, otherwise the configured level.
/// Under `warn` and `error` the dedicated server's own output (target
/// `bds`) stays at `info`.
fn filter_directives(level: &str, rust_log: Option<&str>) -> String {
    match rust_log.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None if matches!(level, "warn" | "error") => format!("{level},bds=info"),
        None => level.to_string(),
    }
}

/// Installs the global subscriber.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(&config.level, rust_log.as_deref());
    let filter = EnvFilter::try_new(&directives)?;

    // Exactly one of the two layers is present.
    let json = json_format || config.json_format;
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_thread_names(true)
    });
    let text_layer = (!json).then(|| fmt::layer().with_target(true).compact());

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;

    info!("🔧 Logging initialized ({})", directives);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_log_wins() {
        assert_eq!(filter_directives("info", Some("link_server=trace")), "link_server=trace");
        assert_eq!(filter_directives("debug", Some("  ")), "debug");
        assert_eq!(filter_directives("trace", None), "trace");
    }

    #[test]
    fn test_quiet_levels_keep_server_output() {
        assert_eq!(filter_directives("warn", None), "warn,bds=info");
        assert_eq!(filter_directives("error", None), "error,bds=info");
    }

    #[test]
    fn test_directives_parse() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(EnvFilter::try_new(filter_directives(level, None)).is_ok());
        }
    }
}
