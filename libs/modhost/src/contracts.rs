//! Traits and link-time tables that modules implement against.
//!
//! A module crate implements [`ModuleActivator`] and registers a constructor
//! under its manifest entry point with [`register_activator!`]. The host never
//! names module types directly; it finds them through the inventory table.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::ActivationCtx;
use crate::descriptor::{CapabilityId, ModuleDescriptor};

/// One capability instance an activator hands back from `activate`.
pub struct ServiceProvision {
    pub capability: CapabilityId,
    pub(crate) instance: Arc<dyn Any + Send + Sync>,
    /// Overrides the rank declared in the manifest when set.
    pub rank: Option<i32>,
}

impl ServiceProvision {
    /// Wrap `instance` for publication under `capability`.
    ///
    /// `T` may be a trait object (`Arc<dyn MyContract>`); consumers recover it
    /// with [`crate::services::ServiceRegistration::instance`] using the same
    /// `T`.
    pub fn new<T>(capability: impl Into<CapabilityId>, instance: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            capability: capability.into(),
            instance: Arc::new(instance),
            rank: None,
        }
    }

    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// The runnable part of a module.
///
/// `activate` is called at most once per successful start; `deactivate` is
/// called exactly once per successful `activate`, even when the process is
/// shutting down because of another module's failure.
#[async_trait]
pub trait ModuleActivator: Send + Sync + 'static {
    /// Bring the module up and return the capability instances it exposes.
    ///
    /// Every returned provision must correspond to an export declared in the
    /// module's manifest; the host publishes them on the activator's behalf
    /// and withdraws them on stop.
    async fn activate(&self, ctx: &ActivationCtx) -> anyhow::Result<Vec<ServiceProvision>>;

    /// Release everything `activate` acquired. Registrations are withdrawn by
    /// the host before this is called.
    async fn deactivate(&self) -> anyhow::Result<()>;
}

/// Failure to read one module candidate during a scan.
#[derive(Debug, Error)]
#[error("invalid module candidate '{candidate}'")]
pub struct ScanError {
    pub candidate: String,
    #[source]
    pub source: anyhow::Error,
}

/// Discovers module descriptors from some external source (a manifest
/// directory, a static list, a test fixture).
///
/// A scan yields one result per candidate so a single malformed manifest
/// never hides the valid ones.
pub trait ModuleScanner: Send + Sync {
    fn find_modules(&self) -> Vec<Result<ModuleDescriptor, ScanError>>;
}

/// Scanner over a fixed descriptor list. Useful in tests and embedders that
/// assemble descriptors programmatically.
pub struct StaticScanner {
    descriptors: Vec<ModuleDescriptor>,
}

impl StaticScanner {
    pub fn new(descriptors: Vec<ModuleDescriptor>) -> Self {
        Self { descriptors }
    }
}

impl ModuleScanner for StaticScanner {
    fn find_modules(&self) -> Vec<Result<ModuleDescriptor, ScanError>> {
        self.descriptors.iter().cloned().map(Ok).collect()
    }
}

/// Link-time record binding a manifest entry point to an activator
/// constructor. Submitted via [`register_activator!`].
pub struct ActivatorEntry {
    pub entry_point: &'static str,
    pub construct: fn() -> Arc<dyn ModuleActivator>,
}

inventory::collect!(ActivatorEntry);

/// Construct the activator registered under `entry_point`, if any.
pub fn find_activator(entry_point: &str) -> Option<Arc<dyn ModuleActivator>> {
    inventory::iter::<ActivatorEntry>
        .into_iter()
        .find(|e| e.entry_point == entry_point)
        .map(|e| (e.construct)())
}

/// Register an activator type under a manifest entry point:
///
/// ```ignore
/// register_activator!("heartbeat.clock", ClockActivator);
/// ```
///
/// The type must implement [`ModuleActivator`] and `Default`.
#[macro_export]
macro_rules! register_activator {
    ($entry_point:literal, $ty:ty) => {
        $crate::inventory::submit! {
            $crate::contracts::ActivatorEntry {
                entry_point: $entry_point,
                construct: || ::std::sync::Arc::new(<$ty as ::core::default::Default>::default()),
            }
        }
    };
}
