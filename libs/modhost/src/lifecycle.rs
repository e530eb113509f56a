//! Per-module state machine.
//!
//! States move `Installed -> Resolved -> Starting -> Active -> Stopping ->
//! Resolved`, with `Uninstalled` as the terminal state. Failed activation
//! rolls back to `Resolved`; a module is never left half-started.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::ActivationCtx;
use crate::contracts::ModuleActivator;
use crate::descriptor::{CapabilityId, ModuleDescriptor, ModuleIdentity};
use crate::services::ServiceRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Installed => "installed",
            ModuleState::Resolved => "resolved",
            ModuleState::Starting => "starting",
            ModuleState::Active => "active",
            ModuleState::Stopping => "stopping",
            ModuleState::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("module '{module}' cannot resolve: no provider for mandatory import '{import}'")]
    Resolution {
        module: ModuleIdentity,
        import: CapabilityId,
    },

    #[error("module '{module}' failed to start")]
    Start {
        module: ModuleIdentity,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' failed to stop cleanly")]
    Stop {
        module: ModuleIdentity,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' is {state}, expected {expected}")]
    InvalidState {
        module: ModuleIdentity,
        state: ModuleState,
        expected: ModuleState,
    },
}

/// Lifecycle driver for one installed module.
pub struct ModuleLifecycle {
    descriptor: ModuleDescriptor,
    identity: ModuleIdentity,
    activator: Arc<dyn ModuleActivator>,
    services: Arc<ServiceRegistry>,
    /// Held across activate/deactivate awaits so transitions never interleave.
    transition: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<ModuleState>,
}

impl ModuleLifecycle {
    pub fn new(
        descriptor: ModuleDescriptor,
        activator: Arc<dyn ModuleActivator>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        let identity = descriptor.identity();
        Self {
            descriptor,
            identity,
            activator,
            services,
            transition: tokio::sync::Mutex::new(()),
            state: parking_lot::Mutex::new(ModuleState::Installed),
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    /// Check mandatory imports against live providers plus the declared
    /// exports of the co-installed batch (`available`), and move
    /// `Installed -> Resolved`. Idempotent on an already resolved module.
    pub fn resolve(&self, available: &HashSet<CapabilityId>) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match *state {
            ModuleState::Resolved => return Ok(()),
            ModuleState::Installed => {}
            current => {
                return Err(LifecycleError::InvalidState {
                    module: self.identity.clone(),
                    state: current,
                    expected: ModuleState::Installed,
                })
            }
        }

        for import in self.descriptor.mandatory_imports() {
            if !self.services.has_provider(&import.capability)
                && !available.contains(&import.capability)
            {
                return Err(LifecycleError::Resolution {
                    module: self.identity.clone(),
                    import: import.capability.clone(),
                });
            }
        }

        *state = ModuleState::Resolved;
        tracing::debug!(module = %self.identity, "Module resolved");
        Ok(())
    }

    /// `Resolved -> Starting -> Active`: run the activator and publish its
    /// provisions. On any failure the module rolls back to `Resolved` with
    /// nothing published.
    pub async fn start(&self, ctx: &ActivationCtx) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;

        {
            let mut state = self.state.lock();
            if *state != ModuleState::Resolved {
                return Err(LifecycleError::InvalidState {
                    module: self.identity.clone(),
                    state: *state,
                    expected: ModuleState::Resolved,
                });
            }
            *state = ModuleState::Starting;
        }
        tracing::info!(module = %self.identity, "Starting module");

        let provisions = match self.activator.activate(ctx).await {
            Ok(provisions) => provisions,
            Err(source) => {
                *self.state.lock() = ModuleState::Resolved;
                return Err(LifecycleError::Start {
                    module: self.identity.clone(),
                    source,
                });
            }
        };

        let mut tokens = Vec::with_capacity(provisions.len());
        for provision in provisions {
            let Some(spec) = self.descriptor.export(&provision.capability) else {
                // Undeclared provision: withdraw what was published and back out.
                for token in tokens {
                    self.services.withdraw(token);
                }
                *self.state.lock() = ModuleState::Resolved;
                return Err(LifecycleError::Start {
                    module: self.identity.clone(),
                    source: anyhow::anyhow!(
                        "activator provided capability '{}' not declared in manifest exports",
                        provision.capability
                    ),
                });
            };
            let rank = provision.rank.unwrap_or(spec.rank);
            tokens.push(self.services.publish(
                provision.capability,
                provision.instance,
                rank,
                self.identity.clone(),
            ));
        }

        *self.state.lock() = ModuleState::Active;
        tracing::info!(module = %self.identity, "Module active");
        Ok(())
    }

    /// `Active -> Stopping -> Resolved`. A no-op on non-active modules, so
    /// calling stop twice (or on a module that never started) is safe.
    ///
    /// Everything the module published is withdrawn before the activator's
    /// `deactivate` runs; a deactivation error is reported but the module
    /// still lands on `Resolved`.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let _transition = self.transition.lock().await;

        {
            let mut state = self.state.lock();
            if *state != ModuleState::Active {
                return Ok(());
            }
            *state = ModuleState::Stopping;
        }
        tracing::info!(module = %self.identity, "Stopping module");

        self.services.withdraw_owned(&self.identity);

        let result = self.activator.deactivate().await;
        *self.state.lock() = ModuleState::Resolved;

        match result {
            Ok(()) => Ok(()),
            Err(source) => Err(LifecycleError::Stop {
                module: self.identity.clone(),
                source,
            }),
        }
    }

    /// Retire the module for good. Valid from `Installed` or `Resolved`;
    /// an active module must be stopped first.
    pub fn uninstall(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        match *state {
            ModuleState::Installed | ModuleState::Resolved => {
                *state = ModuleState::Uninstalled;
                tracing::debug!(module = %self.identity, "Module uninstalled");
                Ok(())
            }
            ModuleState::Uninstalled => Ok(()),
            current => Err(LifecycleError::InvalidState {
                module: self.identity.clone(),
                state: current,
                expected: ModuleState::Resolved,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ActivationCtxBuilder, NoConfig};
    use crate::contracts::ServiceProvision;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Activator scripted per test: what to provide, whether to fail.
    #[derive(Default)]
    struct ScriptedActivator {
        provide: Vec<(&'static str, Option<i32>)>,
        fail_activate: bool,
        fail_deactivate: bool,
        activations: AtomicUsize,
        deactivations: AtomicUsize,
    }

    #[async_trait]
    impl ModuleActivator for ScriptedActivator {
        async fn activate(&self, _ctx: &ActivationCtx) -> anyhow::Result<Vec<ServiceProvision>> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.fail_activate {
                anyhow::bail!("scripted activation failure");
            }
            Ok(self
                .provide
                .iter()
                .map(|(cap, rank)| {
                    let p = ServiceProvision::new(*cap, Arc::new(String::from(*cap)));
                    match rank {
                        Some(r) => p.with_rank(*r),
                        None => p,
                    }
                })
                .collect())
        }

        async fn deactivate(&self) -> anyhow::Result<()> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            if self.fail_deactivate {
                anyhow::bail!("scripted deactivation failure");
            }
            Ok(())
        }
    }

    struct Fixture {
        services: Arc<ServiceRegistry>,
        ctx_builder: ActivationCtxBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            let services = Arc::new(ServiceRegistry::new());
            let ctx_builder = ActivationCtxBuilder::new(
                Arc::new(NoConfig),
                services.clone(),
                CancellationToken::new(),
            );
            Self {
                services,
                ctx_builder,
            }
        }

        fn lifecycle(
            &self,
            descriptor: ModuleDescriptor,
            activator: ScriptedActivator,
        ) -> ModuleLifecycle {
            ModuleLifecycle::new(descriptor, Arc::new(activator), self.services.clone())
        }
    }

    fn no_batch() -> HashSet<CapabilityId> {
        HashSet::new()
    }

    #[tokio::test]
    async fn full_cycle_publishes_and_withdraws() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main")
            .with_export("clock.millis", 4);
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                provide: vec![("clock.millis", None)],
                ..Default::default()
            },
        );

        assert_eq!(lc.state(), ModuleState::Installed);
        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();
        assert_eq!(lc.state(), ModuleState::Active);

        let found = fx.services.lookup_one(&"clock.millis".into()).unwrap();
        assert_eq!(found.rank(), 4); // manifest rank used when unset
        assert_eq!(found.owner().name, "clock");

        lc.stop().await.unwrap();
        assert_eq!(lc.state(), ModuleState::Resolved);
        assert!(fx.services.is_empty());
    }

    #[tokio::test]
    async fn provision_rank_overrides_manifest_rank() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main")
            .with_export("clock.millis", 4);
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                provide: vec![("clock.millis", Some(99))],
                ..Default::default()
            },
        );

        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();
        assert_eq!(
            fx.services.lookup_one(&"clock.millis".into()).unwrap().rank(),
            99
        );
    }

    #[test]
    fn resolution_fails_on_missing_mandatory_import() {
        let fx = Fixture::new();
        let lc = fx.lifecycle(
            ModuleDescriptor::new("web", "1.0.0", "web.main").with_import("log.sink", false),
            ScriptedActivator::default(),
        );

        match lc.resolve(&no_batch()) {
            Err(LifecycleError::Resolution { module, import }) => {
                assert_eq!(module.name, "web");
                assert_eq!(import.as_str(), "log.sink");
            }
            other => panic!("expected Resolution error, got {other:?}"),
        }
        assert_eq!(lc.state(), ModuleState::Installed);
    }

    #[test]
    fn resolution_accepts_batch_declared_exports() {
        let fx = Fixture::new();
        let lc = fx.lifecycle(
            ModuleDescriptor::new("web", "1.0.0", "web.main").with_import("log.sink", false),
            ScriptedActivator::default(),
        );

        let batch: HashSet<CapabilityId> = [CapabilityId::from("log.sink")].into();
        lc.resolve(&batch).unwrap();
        assert_eq!(lc.state(), ModuleState::Resolved);

        // Idempotent.
        lc.resolve(&batch).unwrap();
    }

    #[test]
    fn optional_imports_never_block_resolution() {
        let fx = Fixture::new();
        let lc = fx.lifecycle(
            ModuleDescriptor::new("web", "1.0.0", "web.main").with_import("metrics.sink", true),
            ScriptedActivator::default(),
        );
        lc.resolve(&no_batch()).unwrap();
        assert_eq!(lc.state(), ModuleState::Resolved);
    }

    #[tokio::test]
    async fn failed_activation_rolls_back_to_resolved() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("flaky", "1.0.0", "flaky.main");
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                fail_activate: true,
                ..Default::default()
            },
        );

        lc.resolve(&no_batch()).unwrap();
        assert!(matches!(
            lc.start(&ctx).await,
            Err(LifecycleError::Start { .. })
        ));
        assert_eq!(lc.state(), ModuleState::Resolved);
        assert!(fx.services.is_empty());
    }

    #[tokio::test]
    async fn undeclared_provision_fails_start_and_publishes_nothing() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main")
            .with_export("clock.millis", 0);
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                provide: vec![("clock.millis", None), ("clock.secret", None)],
                ..Default::default()
            },
        );

        lc.resolve(&no_batch()).unwrap();
        assert!(matches!(
            lc.start(&ctx).await,
            Err(LifecycleError::Start { .. })
        ));
        assert_eq!(lc.state(), ModuleState::Resolved);
        assert!(fx.services.is_empty());
    }

    #[tokio::test]
    async fn stop_withdraws_all_owned_registrations_and_spares_others() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main")
            .with_export("clock.millis", 0)
            .with_export("clock.seconds", 0);
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                provide: vec![("clock.millis", None), ("clock.seconds", None)],
                ..Default::default()
            },
        );

        let bystander: Arc<str> = Arc::from("file");
        fx.services.publish(
            "log.sink",
            Arc::new(bystander),
            0,
            ModuleIdentity::new("logger", "1.0.0"),
        );

        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();
        assert_eq!(fx.services.len(), 3);

        lc.stop().await.unwrap();
        assert!(fx.services.lookup(&"clock.millis".into()).is_empty());
        assert!(fx.services.lookup(&"clock.seconds".into()).is_empty());
        assert_eq!(fx.services.len(), 1);
        assert!(fx.services.lookup_one(&"log.sink".into()).is_ok());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_deactivates_once() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main");
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let activator = Arc::new(ScriptedActivator::default());
        let lc = ModuleLifecycle::new(descriptor, activator.clone(), fx.services.clone());

        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();

        lc.stop().await.unwrap();
        lc.stop().await.unwrap();
        assert_eq!(lc.state(), ModuleState::Resolved);

        assert_eq!(activator.activations.load(Ordering::SeqCst), 1);
        assert_eq!(activator.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_deactivation_still_lands_on_resolved() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main")
            .with_export("clock.millis", 0);
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(
            descriptor,
            ScriptedActivator {
                provide: vec![("clock.millis", None)],
                fail_deactivate: true,
                ..Default::default()
            },
        );

        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();

        assert!(matches!(lc.stop().await, Err(LifecycleError::Stop { .. })));
        assert_eq!(lc.state(), ModuleState::Resolved);
        // Registrations were withdrawn before deactivate ran.
        assert!(fx.services.is_empty());
    }

    #[tokio::test]
    async fn start_requires_resolved() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main");
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(descriptor, ScriptedActivator::default());

        match lc.start(&ctx).await {
            Err(LifecycleError::InvalidState { state, expected, .. }) => {
                assert_eq!(state, ModuleState::Installed);
                assert_eq!(expected, ModuleState::Resolved);
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uninstall_is_terminal_and_guards_active() {
        let fx = Fixture::new();
        let descriptor = ModuleDescriptor::new("clock", "1.0.0", "clock.main");
        let ctx = fx.ctx_builder.for_module(&descriptor);
        let lc = fx.lifecycle(descriptor, ScriptedActivator::default());

        lc.resolve(&no_batch()).unwrap();
        lc.start(&ctx).await.unwrap();
        assert!(lc.uninstall().is_err()); // active modules must stop first

        lc.stop().await.unwrap();
        lc.uninstall().unwrap();
        assert_eq!(lc.state(), ModuleState::Uninstalled);

        // Terminal: no further transitions.
        assert!(lc.resolve(&no_batch()).is_err());
        assert!(lc.start(&ctx).await.is_err());
        lc.uninstall().unwrap(); // repeated uninstall is a no-op
    }
}
