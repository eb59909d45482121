use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::types::PeerId;

/// The webrtc stack logs every packet-level hiccup; keep it at warn unless a
/// target override says otherwise
const QUIET_DEPENDENCIES: &[&str] = &[
    "webrtc=warn",
    "webrtc_ice=warn",
    "webrtc_dtls=warn",
    "webrtc_srtp=warn",
    "webrtc_sctp=warn",
    "webrtc_mdns=error",
];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over everything else. Otherwise the filter is
/// the configured level, the webrtc crates held at warn, then
/// `logging.targets` overrides such as `roomcast_core::session=trace`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(config)?)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        // Session spans carry local/peer, so every actor line is attributable
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true);

        if let Some(file_path) = &config.file_path {
            let file = open_log_file(file_path)?;
            registry.with(json_layer.with_writer(file)).try_init()?;
        } else {
            registry.with(json_layer).try_init()?;
        }
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);

        if let Some(file_path) = &config.file_path {
            let file = open_log_file(file_path)?;
            registry
                .with(pretty_layer.with_ansi(false).with_writer(file))
                .try_init()?;
        } else {
            registry.with(pretty_layer).try_init()?;
        }
    }

    Ok(())
}

/// Filter directives for `config`, lowest precedence first
fn filter_directives(config: &LoggingConfig) -> anyhow::Result<String> {
    let level = parse_log_level(&config.level)?;
    let mut directives = vec![level.to_string().to_lowercase()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(ToString::to_string));

    for target in &config.targets {
        let Some((module, level)) = target.split_once('=') else {
            return Err(anyhow::anyhow!(
                "Invalid log target {target:?}, expected module=level"
            ));
        };
        let level = parse_log_level(level)?;
        directives.push(format!("{module}={}", level.to_string().to_lowercase()));
    }

    Ok(directives.join(","))
}

/// Span wrapping one peer session's actor
#[must_use]
pub fn session_span(local: &PeerId, peer: &PeerId, polite: bool) -> Span {
    tracing::info_span!("session", local = %local, peer = %peer, polite)
}

fn open_log_file(path: &str) -> anyhow::Result<std::sync::Arc<std::fs::File>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(std::sync::Arc::new(file))
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(level: &str, targets: &[&str]) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            targets: targets.iter().map(ToString::to_string).collect(),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("DEBUG").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_directives_quiet_webrtc_before_overrides() {
        let directives =
            filter_directives(&logging("debug", &["roomcast_core::session=TRACE", "webrtc_ice=info"]))
                .unwrap();
        assert!(directives.starts_with("debug,webrtc=warn,"));
        assert!(directives.ends_with("roomcast_core::session=trace,webrtc_ice=info"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_malformed_targets_are_rejected() {
        assert!(filter_directives(&logging("info", &["roomcast_core"])).is_err());
        assert!(filter_directives(&logging("info", &["roomcast_core=chatty"])).is_err());
        assert!(init_logging(&logging("loud", &[])).is_err());
    }

    #[test]
    fn test_session_span_names_both_ends() {
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = session_span(&PeerId::from("alice"), &PeerId::from("bob"), true);
            let metadata = span.metadata().unwrap();
            assert_eq!(metadata.name(), "session");
            for field in ["local", "peer", "polite"] {
                assert!(metadata.fields().field(field).is_some(), "missing {field}");
            }
        });
    }
}
