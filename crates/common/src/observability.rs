use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("tracing_error_events").increment(1);
        }
    }
}

/// Log file for one loader run, named after the run's wall-clock start.
pub fn run_log_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "january_load_simple_{}.log",
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Build a `tracing` dispatcher configured for:
/// - human-readable logs to stdout
/// - EnvFilter that respects `RUST_LOG` (takes precedence) and falls back to
///   `default_level`
/// - `tracing_error_events` counter for ERROR events
/// - an additional plain-text layer into `log_dir` when given (one file per run)
pub fn build_dispatch(
    default_level: &str,
    log_dir: Option<&Path>,
) -> Result<(tracing::Dispatch, Option<PathBuf>)> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let error_counter_layer = ErrorCounterLayer;

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;
        let path = run_log_path(dir);
        let file = std::fs::File::create(&path)?;
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Arc::new(file));

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(error_counter_layer)
            .with(file_layer);
        Ok((tracing::Dispatch::new(subscriber), Some(path)))
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(error_counter_layer);
        Ok((tracing::Dispatch::new(subscriber), None))
    }
}
