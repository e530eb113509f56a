//! Host runtime - owns the process-wide registries and drives the full
//! module lifecycle: scan -> install -> start -> wait -> stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{ActivationCtxBuilder, ConfigProvider};
use crate::contracts::ModuleScanner;
use crate::descriptor::ModuleDescriptor;
use crate::registry::{ModuleRegistry, RegistryError, StartReport};
use crate::services::ServiceRegistry;

#[derive(Debug, Error)]
pub enum HostError {
    /// The host's start pass runs at most once per process.
    #[error("host runtime already started")]
    AlreadyStarted,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Orchestrates one process worth of modules.
///
/// `start` runs at most once, `stop` is idempotent, and `run_full_cycle`
/// wires the two around the cancellation token for the common
/// start-wait-stop shape.
pub struct HostRuntime {
    scanner: Box<dyn ModuleScanner>,
    services: Arc<ServiceRegistry>,
    registry: ModuleRegistry,
    ctx_builder: ActivationCtxBuilder,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl HostRuntime {
    pub fn new(
        scanner: Box<dyn ModuleScanner>,
        modules_cfg: Arc<dyn ConfigProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let services = Arc::new(ServiceRegistry::new());
        Self {
            scanner,
            registry: ModuleRegistry::new(services.clone()),
            ctx_builder: ActivationCtxBuilder::new(modules_cfg, services.clone(), cancel.clone()),
            services,
            cancel,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// SCAN phase: collect descriptors, skipping (and logging) candidates the
    /// scanner could not read.
    fn run_scan_phase(&self) -> Vec<ModuleDescriptor> {
        tracing::info!("Phase: scan");

        let mut descriptors = Vec::new();
        for result in self.scanner.find_modules() {
            match result {
                Ok(descriptor) => {
                    tracing::debug!(module = %descriptor.identity(), "Discovered module");
                    descriptors.push(descriptor);
                }
                Err(err) => {
                    tracing::warn!(candidate = %err.candidate, error = %err.source, "Skipping invalid module candidate");
                }
            }
        }
        descriptors
    }

    /// Scan, install and start all modules. Second and later calls fail with
    /// [`HostError::AlreadyStarted`] without touching any module.
    pub async fn start(&self) -> Result<StartReport, HostError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyStarted);
        }

        let descriptors = self.run_scan_phase();

        tracing::info!(count = descriptors.len(), "Phase: install");
        self.registry.install_all(descriptors)?;

        tracing::info!("Phase: start");
        let report = self.registry.start_all(&self.ctx_builder).await?;
        Ok(report)
    }

    /// Stop everything that started, uninstall, and drop remaining
    /// registrations. Later calls are no-ops.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stop already performed; ignoring");
            return;
        }

        tracing::info!("Phase: stop");
        self.cancel.cancel();
        self.registry.stop_all().await;
        self.registry.uninstall_all();
        self.services.clear();
        tracing::info!("Host runtime stopped");
    }

    /// Start, wait for the cancellation token, stop.
    ///
    /// Individual module failures during start are logged and tolerated (the
    /// rest of the system keeps running); only graph-level errors abort.
    pub async fn run_full_cycle(self) -> anyhow::Result<()> {
        let report = self.start().await?;
        if !report.all_started() {
            tracing::warn!(
                failed = report.failed.len(),
                "Some modules failed to start; continuing with the rest"
            );
        }

        self.cancel.cancelled().await;

        self.stop().await;
        Ok(())
    }
}
