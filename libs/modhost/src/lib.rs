//! # ModHost - In-Process Dynamic Module Runtime
//!
//! A host process discovers module manifests, resolves declared capability
//! imports against declared exports, starts modules in dependency order, and
//! gives each active module an import-scoped view of a shared service
//! registry.
//!
//! ## Pieces
//!
//! - **Descriptors** ([`descriptor`]): immutable manifest metadata, one per
//!   deployable unit (identity, entry point, exported and imported
//!   capabilities).
//! - **Contracts** ([`contracts`]): the [`ModuleActivator`] trait a module
//!   implements, the [`ModuleScanner`] trait a discovery source implements,
//!   and the link-time activator table populated by [`register_activator!`].
//! - **Service registry** ([`services`]): ranked publish/lookup/withdraw of
//!   capability instances plus synchronous change listeners.
//! - **Lifecycle** ([`lifecycle`]): the per-module state machine
//!   (installed, resolved, starting, active, stopping, uninstalled).
//! - **Module registry** ([`registry`]): batch install, capability dependency
//!   ordering with cycle detection, failure-isolated start, reverse-order
//!   stop.
//! - **Runtime** ([`runtime`]): the [`HostRuntime`] orchestrator and the
//!   [`runtime::run`] entry point with signal/token/future shutdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modhost::{register_activator, ModuleActivator, ServiceProvision};
//!
//! #[derive(Default)]
//! struct ClockActivator;
//!
//! #[async_trait::async_trait]
//! impl ModuleActivator for ClockActivator {
//!     async fn activate(&self, ctx: &modhost::ActivationCtx)
//!         -> anyhow::Result<Vec<ServiceProvision>>
//!     {
//!         let clock: std::sync::Arc<dyn Clock> = std::sync::Arc::new(SystemClock);
//!         Ok(vec![ServiceProvision::new("clock.millis", clock)])
//!     }
//!
//!     async fn deactivate(&self) -> anyhow::Result<()> { Ok(()) }
//! }
//!
//! register_activator!("heartbeat.clock", ClockActivator);
//! ```

pub mod context;
pub mod contracts;
pub mod descriptor;
pub mod lifecycle;
pub mod registry;
pub mod runtime;
pub mod services;

pub use context::{ActivationCtx, ActivationCtxBuilder, ConfigProvider, NoConfig};
pub use contracts::{
    find_activator, ActivatorEntry, ModuleActivator, ModuleScanner, ScanError, ServiceProvision,
    StaticScanner,
};
pub use descriptor::{CapabilityId, ExportSpec, ImportSpec, ModuleDescriptor, ModuleIdentity};
pub use lifecycle::{LifecycleError, ModuleLifecycle, ModuleState};
pub use registry::{ModuleRegistry, RegistryError, StartReport};
pub use runtime::{run, HostError, HostRuntime, RunOptions, ShutdownOptions};
pub use services::{
    ListenerToken, RegistrationToken, ServiceError, ServiceEvent, ServiceHandle,
    ServiceRegistration, ServiceRegistry,
};

// Re-exported so module crates can use `register_activator!` without
// depending on inventory directly.
pub use inventory;
