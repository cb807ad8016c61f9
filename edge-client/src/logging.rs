use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingArgs;

pub const LOG_FILE_PREFIX: &str = "edge-client.log";

pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

pub fn parse_rotation(rotation: &str) -> Result<Rotation> {
    Ok(match rotation.to_lowercase().as_str() {
        "never" => Rotation::NEVER,
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        other => bail!("Unknown log rotation {:?}", other),
    })
}

/// Install the global subscriber: stdout, plus rotated JSON files when a log
/// directory is set. `RUST_LOG` overrides the level. Keep the returned guard
/// alive or buffered file output is lost.
pub fn init(args: &LoggingArgs) -> Result<Option<WorkerGuard>> {
    let level = parse_level(&args.log_level);
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = file_appender(dir, &args.log_rotation)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(false)
                .with_span_list(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    if let Some(dir) = &args.log_dir {
        tracing::info!("Logs will also be written to {}", dir.display());
    }
    Ok(guard)
}

fn file_appender(dir: &Path, rotation: &str) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log dir {:?}", dir))?;
    Ok(RollingFileAppender::new(
        parse_rotation(rotation)?,
        dir,
        LOG_FILE_PREFIX,
    ))
}
