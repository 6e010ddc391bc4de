use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const ENABLED_KEY: &str = "RESILIENT_STREAM_OBSERVABILITY";
const LEVEL_KEY: &str = "RESILIENT_STREAM_LOG_LEVEL";
const JSON_PATH_KEY: &str = "RESILIENT_STREAM_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "resilient-stream.logs.jsonl";

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn logging_enabled() -> bool {
    std::env::var(ENABLED_KEY)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var(LEVEL_KEY)
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Installs the process-wide tracing subscriber once.
///
/// Environment variables:
/// - `RESILIENT_STREAM_OBSERVABILITY`: optional on/off switch (default on).
/// - `RESILIENT_STREAM_LOG_LEVEL`: filter override (`info`, `resilient_stream=debug`, ...).
/// - `RESILIENT_STREAM_JSON_LOG_PATH`: when set, JSON lines go to that file;
///   otherwise compact console logs go to stderr so stdout stays free for
///   streamed content.
/// - `RUST_LOG`: fallback filter.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !logging_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        match std::env::var(JSON_PATH_KEY) {
            Ok(path_raw) => {
                let path = std::path::PathBuf::from(path_raw);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_LOG_FILE);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            Err(_) => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::parse_bool_env;

    #[test]
    fn bool_env_accepts_common_spellings() {
        assert_eq!(parse_bool_env(" ON "), Some(true));
        assert_eq!(parse_bool_env("0"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }
}
