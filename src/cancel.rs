use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::warn;

use crate::error::CutoverError;

/// Operator interrupt flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Cancelled` if an interrupt arrived before `stage` could start.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(CutoverError::Cancelled {
                stage: stage.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Sets `token` on the first Ctrl+C or SIGTERM; a second one exits immediately.
pub fn install_signal_handler(token: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("cutover-signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(?err, "failed to start signal runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                shutdown_signal().await;
                warn!("interrupt received; stopping at the next stage boundary");
                token.cancel();
                shutdown_signal().await;
                warn!("second interrupt received; exiting");
                std::process::exit(130);
            });
        });
    if let Err(err) = spawned {
        warn!(?err, "failed to spawn signal thread");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
