//! Log setup for the agent process
//!
//! Logs always go to stderr. When a file is configured the same events are
//! also appended to it, without ANSI colours. The returned [`LogGuard`] owns
//! the background writers: keep it alive for the lifetime of the process,
//! dropping it flushes whatever is still buffered.

use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "timeguard_agent=info";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Flushes the log writers when dropped
#[must_use = "dropping the guard stops log output"]
pub struct LogGuard {
    _workers: Vec<WorkerGuard>,
}

pub fn init(config: &LogConfig) -> Result<LogGuard, LogInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let (subscriber, guard) = build(config, filter)?;
    subscriber
        .try_init()
        .map_err(|e| LogInitError::Configure(e.to_string()))?;
    Ok(guard)
}

fn build(
    config: &LogConfig,
    filter: EnvFilter,
) -> Result<(impl Subscriber + Send + Sync + 'static, LogGuard), LogInitError> {
    let (stderr, stderr_worker) = tracing_appender::non_blocking(std::io::stderr());
    let mut workers = vec![stderr_worker];

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogInitError::Io {
                    path: path.clone(),
                    source,
                })?;
            let (writer, worker) = tracing_appender::non_blocking(file);
            workers.push(worker);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .with(file_layer);

    Ok((subscriber, LogGuard { _workers: workers }))
}
