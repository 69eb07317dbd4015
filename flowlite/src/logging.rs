//! Tracing subscriber setup for binaries and tests embedding the engine.
//!
//! The engine itself only emits `tracing` events; nothing is printed unless a
//! subscriber is installed.

use crate::options::LoggingOptions;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const LOG_FILE_PREFIX: &str = "flowlite";

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `options.level`. When `log_dir` is set,
/// events go to a daily rolling file through a non-blocking writer and the
/// returned guard must be held for as long as logs should be flushed.
/// Installing a second subscriber is silently ignored.
pub fn init_logging(options: &LoggingOptions) -> FlowliteResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| FlowliteError::Config(format!("invalid log level '{}': {e}", options.level)))?;

    let (layer, guard) = output_layer(options)?;

    if tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed, keeping it");
    }

    Ok(guard)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(options: &LoggingOptions) -> FlowliteResult<(BoxedLayer, Option<WorkerGuard>)> {
    let Some(dir) = &options.log_dir else {
        let layer = fmt::layer()
            .with_ansi(options.ansi)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed();
        return Ok((layer, None));
    };

    std::fs::create_dir_all(dir).map_err(|e| {
        FlowliteError::Config(format!("cannot create log dir {}: {e}", dir.display()))
    })?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| FlowliteError::Config(format!("cannot open log file: {e}")))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .boxed();
    Ok((layer, Some(guard)))
}
