//! Cross-process cooperative shutdown. Two channels fire one
//! `CancellationToken`: the rendezvous file (polled, so any process or the
//! dashboard can request a stop) and the process signals. Neither channel
//! exits the process; workers observe the token at transaction boundaries.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Spawn the flag poller and the signal listener. The rendezvous file is
    /// never removed here — it persists until an explicit resume so that
    /// later invocations also see it.
    pub fn start(flag_path: PathBuf, poll_interval: Duration) -> Self {
        let token = CancellationToken::new();

        tokio::spawn({
            let token = token.clone();
            async move {
                loop {
                    if token.is_cancelled() {
                        break;
                    }
                    if common::flag::flag_exists(&flag_path) {
                        tracing::info!(flag = %flag_path.display(), "shutdown flag detected");
                        token.cancel();
                        break;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        });

        tokio::spawn({
            let token = token.clone();
            async move {
                wait_for_signal().await;
                tracing::info!("shutdown signal received; will stop at next safe point");
                token.cancel();
            }
        });

        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; listening for ctrl-c only");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
