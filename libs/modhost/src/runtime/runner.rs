//! Host runner entry point.
//!
//! A thin wrapper around [`HostRuntime`] that sets up the shutdown trigger
//! (OS signals, an external token, or an arbitrary future) and then runs the
//! full scan -> install -> start -> wait -> stop cycle.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::context::ConfigProvider;
use crate::contracts::ModuleScanner;
use crate::runtime::{shutdown, HostRuntime};

/// How the runtime should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, shutdown begins.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    /// Source of module descriptors.
    pub scanner: Box<dyn ModuleScanner>,
    /// Provider of module config sections (raw JSON by module name).
    pub modules_cfg: Arc<dyn ConfigProvider>,
    /// Shutdown strategy.
    pub shutdown: ShutdownOptions,
}

/// Run one host to completion.
pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match shutdown::wait_for_shutdown().await {
                    Ok(()) => {
                        tracing::info!("shutdown: signal received");
                    }
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    let host = HostRuntime::new(opts.scanner, opts.modules_cfg, cancel);
    host.run_full_cycle().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoConfig;
    use crate::contracts::StaticScanner;

    #[tokio::test]
    async fn external_token_drives_the_cycle() {
        let token = CancellationToken::new();
        token.cancel();

        run(RunOptions {
            scanner: Box::new(StaticScanner::new(Vec::new())),
            modules_cfg: Arc::new(NoConfig),
            shutdown: ShutdownOptions::Token(token),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn future_completion_triggers_shutdown() {
        run(RunOptions {
            scanner: Box::new(StaticScanner::new(Vec::new())),
            modules_cfg: Arc::new(NoConfig),
            shutdown: ShutdownOptions::Future(Box::pin(async {})),
        })
        .await
        .unwrap();
    }
}
