//! Service registry - the process-wide directory of published capabilities.
//!
//! Providers publish an implementation under a [`CapabilityId`] while their
//! owning module is active; consumers look implementations up by capability
//! without any compile-time linkage to the provider.
//!
//! Implementation details:
//! - Value = `Arc<T>` stored as `Arc<dyn Any + Send + Sync>` (downcast on read),
//!   so `T` can be a trait object like `dyn my_module::contract::Clock`.
//! - Lookups take a read lock only; `publish`/`withdraw` serialize through a
//!   write-side lock whose order also drives listener notification order.
//! - Providers for one capability are kept sorted: highest rank first, then
//!   oldest publish first.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::descriptor::{CapabilityId, ModuleIdentity};

/// Opaque handle returned by [`ServiceRegistry::publish`], used to withdraw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationToken(u64);

/// Opaque handle returned by [`ServiceRegistry::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// One published capability instance.
pub struct ServiceRegistration {
    capability: CapabilityId,
    owner: ModuleIdentity,
    instance: Arc<dyn Any + Send + Sync>,
    rank: i32,
    seq: u64,
    token: RegistrationToken,
}

impl ServiceRegistration {
    pub fn capability(&self) -> &CapabilityId {
        &self.capability
    }

    pub fn owner(&self) -> &ModuleIdentity {
        &self.owner
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn token(&self) -> RegistrationToken {
        self.token
    }

    /// Downcast the published instance to the interface it was published as.
    ///
    /// Returns `None` when `T` is not the type the provider published.
    pub fn instance<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.instance.downcast_ref::<Arc<T>>().cloned()
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("capability", &self.capability)
            .field("owner", &self.owner.to_string())
            .field("rank", &self.rank)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Change notification delivered to capability listeners.
#[derive(Clone)]
pub enum ServiceEvent {
    Published(Arc<ServiceRegistration>),
    Withdrawn(Arc<ServiceRegistration>),
}

impl ServiceEvent {
    pub fn registration(&self) -> &Arc<ServiceRegistration> {
        match self {
            ServiceEvent::Published(r) | ServiceEvent::Withdrawn(r) => r,
        }
    }
}

type Listener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no provider for capability '{capability}'")]
    NoProvider { capability: CapabilityId },

    #[error("module '{module}' did not declare an import of '{capability}'")]
    UndeclaredImport {
        module: ModuleIdentity,
        capability: CapabilityId,
    },
}

#[derive(Default)]
struct RegistrationMap {
    /// Providers per capability, kept sorted (rank desc, seq asc).
    by_capability: HashMap<CapabilityId, Vec<Arc<ServiceRegistration>>>,
    by_token: HashMap<RegistrationToken, CapabilityId>,
}

/// Concurrency-safe directory of published capabilities.
pub struct ServiceRegistry {
    map: RwLock<RegistrationMap>,
    listeners: RwLock<HashMap<CapabilityId, Vec<(ListenerToken, Listener)>>>,
    /// Serializes writers so the mutation order equals notification order.
    write_order: Mutex<()>,
    next_seq: AtomicU64,
    next_listener: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(RegistrationMap::default()),
            listeners: RwLock::new(HashMap::new()),
            write_order: Mutex::new(()),
            next_seq: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Publish one capability instance. Visible to lookups immediately.
    pub fn publish(
        &self,
        capability: impl Into<CapabilityId>,
        instance: Arc<dyn Any + Send + Sync>,
        rank: i32,
        owner: ModuleIdentity,
    ) -> RegistrationToken {
        let capability = capability.into();
        let _order = self.write_order.lock();

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = RegistrationToken(seq);
        let registration = Arc::new(ServiceRegistration {
            capability: capability.clone(),
            owner,
            instance,
            rank,
            seq,
            token,
        });

        {
            let mut map = self.map.write();
            let providers = map.by_capability.entry(capability.clone()).or_default();
            let at = providers
                .iter()
                .position(|r| (Reverse(r.rank), r.seq) > (Reverse(rank), seq))
                .unwrap_or(providers.len());
            providers.insert(at, registration.clone());
            map.by_token.insert(token, capability);
        }

        tracing::debug!(
            capability = %registration.capability,
            owner = %registration.owner,
            rank,
            "Service published"
        );
        self.notify(ServiceEvent::Published(registration));
        token
    }

    /// Withdraw one registration. Idempotent; withdrawing twice is a no-op.
    pub fn withdraw(&self, token: RegistrationToken) {
        let _order = self.write_order.lock();
        let removed = {
            let mut map = self.map.write();
            let Some(capability) = map.by_token.remove(&token) else {
                return;
            };
            let mut removed = None;
            if let Some(providers) = map.by_capability.get_mut(&capability) {
                if let Some(at) = providers.iter().position(|r| r.token == token) {
                    removed = Some(providers.remove(at));
                }
                if providers.is_empty() {
                    map.by_capability.remove(&capability);
                }
            }
            removed
        };

        if let Some(registration) = removed {
            tracing::debug!(
                capability = %registration.capability,
                owner = %registration.owner,
                "Service withdrawn"
            );
            self.notify(ServiceEvent::Withdrawn(registration));
        }
    }

    /// Withdraw every registration owned by `owner`, notifying listeners in
    /// the original publish order. Returns the number of registrations
    /// removed. Called on module stop so a stopping module never leaves
    /// stale providers behind.
    pub fn withdraw_owned(&self, owner: &ModuleIdentity) -> usize {
        let _order = self.write_order.lock();
        let mut removed = Vec::new();
        {
            let mut map = self.map.write();
            map.by_capability.retain(|_, providers| {
                providers.retain(|r| {
                    if r.owner == *owner {
                        removed.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
                !providers.is_empty()
            });
            for registration in &removed {
                map.by_token.remove(&registration.token);
            }
        }

        removed.sort_by_key(|r| r.seq);
        let count = removed.len();
        for registration in removed {
            tracing::debug!(
                capability = %registration.capability,
                owner = %registration.owner,
                "Service withdrawn"
            );
            self.notify(ServiceEvent::Withdrawn(registration));
        }
        count
    }

    /// All current providers of `capability`, highest rank first, ties broken
    /// by publish order (oldest first). Empty when none - absence is not an
    /// error.
    pub fn lookup(&self, capability: &CapabilityId) -> Vec<Arc<ServiceRegistration>> {
        self.map
            .read()
            .by_capability
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    /// The top-ranked provider of `capability`.
    pub fn lookup_one(
        &self,
        capability: &CapabilityId,
    ) -> Result<Arc<ServiceRegistration>, ServiceError> {
        self.map
            .read()
            .by_capability
            .get(capability)
            .and_then(|providers| providers.first().cloned())
            .ok_or_else(|| ServiceError::NoProvider {
                capability: capability.clone(),
            })
    }

    pub fn has_provider(&self, capability: &CapabilityId) -> bool {
        self.map.read().by_capability.contains_key(capability)
    }

    /// Register a listener for publish/withdraw events on one capability.
    ///
    /// Listeners run synchronously on the publishing/withdrawing thread, in
    /// subscription order. A panicking listener is caught and logged; it never
    /// reaches the publisher.
    pub fn subscribe(
        &self,
        capability: impl Into<CapabilityId>,
        listener: impl Fn(&ServiceEvent) + Send + Sync + 'static,
    ) -> ListenerToken {
        let token = ListenerToken(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(capability.into())
            .or_default()
            .push((token, Arc::new(listener)));
        token
    }

    /// Remove a listener. Idempotent.
    pub fn unsubscribe(&self, token: ListenerToken) {
        let mut listeners = self.listeners.write();
        for entries in listeners.values_mut() {
            entries.retain(|(t, _)| *t != token);
        }
        listeners.retain(|_, entries| !entries.is_empty());
    }

    /// Total number of live registrations.
    pub fn len(&self) -> usize {
        self.map.read().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().by_token.is_empty()
    }

    /// Drop all registrations and listeners without notification.
    ///
    /// Final teardown only; normal withdrawal happens module by module.
    pub fn clear(&self) {
        let _order = self.write_order.lock();
        let mut map = self.map.write();
        map.by_capability.clear();
        map.by_token.clear();
        self.listeners.write().clear();
    }

    fn notify(&self, event: ServiceEvent) {
        // Snapshot so a listener may subscribe/unsubscribe from its callback.
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .get(event.registration().capability())
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                tracing::warn!(
                    capability = %event.registration().capability(),
                    "Service listener panicked; ignoring"
                );
            }
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// View of the registry scoped to one module's declared imports.
///
/// Handed to activators through the activation context; lookups outside the
/// module's declared imports are refused, which keeps a module's visible
/// surface exactly what its descriptor says it is.
#[derive(Clone)]
pub struct ServiceHandle {
    registry: Arc<ServiceRegistry>,
    owner: ModuleIdentity,
    imports: Arc<std::collections::HashSet<CapabilityId>>,
}

impl ServiceHandle {
    pub(crate) fn new(
        registry: Arc<ServiceRegistry>,
        owner: ModuleIdentity,
        imports: impl IntoIterator<Item = CapabilityId>,
    ) -> Self {
        Self {
            registry,
            owner,
            imports: Arc::new(imports.into_iter().collect()),
        }
    }

    fn check_scope(&self, capability: &CapabilityId) -> Result<(), ServiceError> {
        if self.imports.contains(capability) {
            Ok(())
        } else {
            Err(ServiceError::UndeclaredImport {
                module: self.owner.clone(),
                capability: capability.clone(),
            })
        }
    }

    pub fn lookup(
        &self,
        capability: impl Into<CapabilityId>,
    ) -> Result<Vec<Arc<ServiceRegistration>>, ServiceError> {
        let capability = capability.into();
        self.check_scope(&capability)?;
        Ok(self.registry.lookup(&capability))
    }

    pub fn lookup_one(
        &self,
        capability: impl Into<CapabilityId>,
    ) -> Result<Arc<ServiceRegistration>, ServiceError> {
        let capability = capability.into();
        self.check_scope(&capability)?;
        self.registry.lookup_one(&capability)
    }

    pub fn subscribe(
        &self,
        capability: impl Into<CapabilityId>,
        listener: impl Fn(&ServiceEvent) + Send + Sync + 'static,
    ) -> Result<ListenerToken, ServiceError> {
        let capability = capability.into();
        self.check_scope(&capability)?;
        Ok(self.registry.subscribe(capability, listener))
    }

    pub fn unsubscribe(&self, token: ListenerToken) {
        self.registry.unsubscribe(token);
    }
}
