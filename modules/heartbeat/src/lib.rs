//! Heartbeat module pair: a clock provider and a monitor that consumes it.
//!
//! Mostly a working reference for module authors - one module publishing a
//! capability as a trait object, another importing it and running a
//! cancel-aware background task.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use modhost::{register_activator, ActivationCtx, ModuleActivator, ServiceProvision};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Millisecond wall clock, published under `clock.millis`.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Publishes the system clock.
#[derive(Default)]
pub struct ClockActivator;

#[async_trait]
impl ModuleActivator for ClockActivator {
    async fn activate(&self, _ctx: &ActivationCtx) -> anyhow::Result<Vec<ServiceProvision>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(vec![ServiceProvision::new("clock.millis", clock)])
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

register_activator!("heartbeat.clock", ClockActivator);

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub period_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { period_ms: 1000 }
    }
}

/// Imports `clock.millis` and logs a heartbeat on a fixed period until
/// stopped.
#[derive(Default)]
pub struct MonitorActivator {
    task_token: parking_lot::Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl ModuleActivator for MonitorActivator {
    async fn activate(&self, ctx: &ActivationCtx) -> anyhow::Result<Vec<ServiceProvision>> {
        let config: MonitorConfig = ctx.config()?;
        let clock: Arc<dyn Clock> = ctx
            .services()
            .lookup_one("clock.millis")?
            .instance::<dyn Clock>()
            .ok_or_else(|| anyhow::anyhow!("clock.millis provider has an unexpected type"))?;

        let token = ctx.cancellation_token().clone();
        *self.task_token.lock() = Some(token.clone());

        let started_at = clock.now_millis();
        let period = std::time::Duration::from_millis(config.period_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let uptime_ms = clock.now_millis().saturating_sub(started_at);
                        tracing::info!(uptime_ms, "heartbeat");
                    }
                }
            }
            tracing::debug!("heartbeat monitor task stopped");
        });

        Ok(Vec::new())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        if let Some(token) = self.task_token.lock().take() {
            token.cancel();
        }
        Ok(())
    }
}

register_activator!("heartbeat.monitor", MonitorActivator);
