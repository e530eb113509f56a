//! Per-module activation context.
//!
//! Everything an activator is allowed to touch comes through its
//! [`ActivationCtx`]: an import-scoped view of the service registry, the
//! module's own configuration section, and a cancellation token that is a
//! child of the host's root token.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::descriptor::{ModuleDescriptor, ModuleIdentity};
use crate::services::{ServiceHandle, ServiceRegistry};

/// Source of raw per-module configuration sections.
pub trait ConfigProvider: Send + Sync {
    /// Raw config value for the module named `module_name`, if present.
    fn module_config(&self, module_name: &str) -> Option<serde_json::Value>;
}

/// Provider with no configuration at all.
pub struct NoConfig;

impl ConfigProvider for NoConfig {
    fn module_config(&self, _module_name: &str) -> Option<serde_json::Value> {
        None
    }
}

/// Handed to [`crate::contracts::ModuleActivator::activate`].
pub struct ActivationCtx {
    identity: ModuleIdentity,
    services: ServiceHandle,
    config: Option<serde_json::Value>,
    cancellation_token: CancellationToken,
}

impl ActivationCtx {
    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    /// Service registry view restricted to this module's declared imports.
    pub fn services(&self) -> &ServiceHandle {
        &self.services
    }

    pub fn raw_config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }

    /// Deserialize this module's config section into `T`, falling back to
    /// `T::default()` when no section exists.
    pub fn config<T>(&self) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match &self.config {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(T::default()),
        }
    }

    /// Cancelled when the host shuts down. Long-running module tasks must
    /// select on it; tasks that should end earlier, at module stop, are the
    /// activator's to cancel from `deactivate`.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

/// Builds one [`ActivationCtx`] per module from process-wide parts.
pub struct ActivationCtxBuilder {
    config_provider: Arc<dyn ConfigProvider>,
    services: Arc<ServiceRegistry>,
    root_token: CancellationToken,
}

impl ActivationCtxBuilder {
    pub fn new(
        config_provider: Arc<dyn ConfigProvider>,
        services: Arc<ServiceRegistry>,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            config_provider,
            services,
            root_token,
        }
    }

    pub fn for_module(&self, descriptor: &ModuleDescriptor) -> ActivationCtx {
        let identity = descriptor.identity();
        ActivationCtx {
            services: ServiceHandle::new(
                self.services.clone(),
                identity.clone(),
                descriptor.imports.iter().map(|i| i.capability.clone()),
            ),
            config: self.config_provider.module_config(&descriptor.name),
            cancellation_token: self.root_token.child_token(),
            identity,
        }
    }
}
