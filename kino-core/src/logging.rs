//! Process-wide `tracing` setup shared by `serve`, `worker` and `enqueue`

use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Dependencies that log every query, request or frame at `info`/`debug`.
/// They stay at `warn` unless the configured level asks for `trace`.
const NOISY_TARGETS: [&str; 5] = ["sqlx", "opendal", "redis", "hyper", "tungstenite"];

/// Initialize structured logging.
///
/// `RUST_LOG` overrides the configured filter. JSON output carries the span
/// list so a job's `storage_key`/`video_id` fields follow every event of its run.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let directives = filter_directives(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let to_file = config.file_path.is_some();
    let writer = make_writer(config)?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_ansi(!to_file)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

/// Filter directives for `level`, capping the noisy dependencies
fn filter_directives(level: &str) -> anyhow::Result<String> {
    let level = parse_log_level(level)?;
    let dependency_level = if level == Level::TRACE { Level::TRACE } else { Level::WARN };

    let mut directives = level.as_str().to_lowercase();
    for target in NOISY_TARGETS {
        directives.push_str(&format!(",{target}={}", dependency_level.as_str().to_lowercase()));
    }
    Ok(directives)
}

fn make_writer(config: &LoggingConfig) -> anyhow::Result<BoxMakeWriter> {
    match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            Ok(BoxMakeWriter::new(Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
    }
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
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

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("DEBUG").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_dependencies_are_capped() {
        assert_eq!(
            filter_directives("debug").unwrap(),
            "debug,sqlx=warn,opendal=warn,redis=warn,hyper=warn,tungstenite=warn"
        );
        assert!(filter_directives("warning").unwrap().starts_with("warn,"));
    }

    #[test]
    fn test_trace_opens_dependencies() {
        let directives = filter_directives("trace").unwrap();
        assert!(directives.contains("sqlx=trace"));
        assert!(!directives.contains("=warn"));
        assert!(directives.parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_init_rejects_unknown_level() {
        let config = LoggingConfig {
            level: "verbose".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
