//! Module registry - installs a batch of descriptors and drives them through
//! their lifecycles in capability-dependency order.
//!
//! Ordering is computed from declared imports/exports alone (exporter before
//! importer); what activators actually publish at runtime never changes the
//! order. Cycles among mandatory imports are install-time errors with the
//! offending path reported; cycles introduced only by optional imports
//! degrade to mandatory-only ordering instead of failing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::context::ActivationCtxBuilder;
use crate::contracts::{find_activator, ModuleActivator};
use crate::descriptor::{CapabilityId, ModuleDescriptor, ModuleIdentity};
use crate::lifecycle::{LifecycleError, ModuleLifecycle};
use crate::services::ServiceRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate module identity '{0}'")]
    DuplicateModule(ModuleIdentity),

    #[error("module '{module}' references unknown entry point '{entry_point}'")]
    UnknownEntryPoint {
        module: ModuleIdentity,
        entry_point: String,
    },

    #[error("cyclic mandatory dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
}

/// Outcome of one `start_all` pass.
///
/// A failed module never aborts the pass; it is reported here and left
/// `Resolved` (or `Installed` when resolution itself failed).
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<ModuleIdentity>,
    pub failed: Vec<(ModuleIdentity, LifecycleError)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ModuleRegistry {
    services: Arc<ServiceRegistry>,
    /// Installed modules in installation order.
    modules: RwLock<Vec<Arc<ModuleLifecycle>>>,
    /// Identities started by the last `start_all` pass, in start order.
    start_order: Mutex<Vec<ModuleIdentity>>,
}

impl ModuleRegistry {
    pub fn new(services: Arc<ServiceRegistry>) -> Self {
        Self {
            services,
            modules: RwLock::new(Vec::new()),
            start_order: Mutex::new(Vec::new()),
        }
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn modules(&self) -> Vec<Arc<ModuleLifecycle>> {
        self.modules.read().clone()
    }

    pub fn get(&self, identity: &ModuleIdentity) -> Option<Arc<ModuleLifecycle>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.identity() == identity)
            .cloned()
    }

    /// Install one module with an explicit activator, bypassing entry-point
    /// lookup. Embedders and tests use this; `install_all` is the manifest
    /// path.
    pub fn install(
        &self,
        descriptor: ModuleDescriptor,
        activator: Arc<dyn ModuleActivator>,
    ) -> Result<Arc<ModuleLifecycle>, RegistryError> {
        let identity = descriptor.identity();
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.identity() == &identity) {
            return Err(RegistryError::DuplicateModule(identity));
        }
        let lifecycle = Arc::new(ModuleLifecycle::new(
            descriptor,
            activator,
            self.services.clone(),
        ));
        modules.push(lifecycle.clone());
        tracing::debug!(module = %identity, "Module installed");
        Ok(lifecycle)
    }

    /// Install a batch of descriptors, resolving each entry point against the
    /// link-time activator table.
    ///
    /// All-or-nothing: duplicate identities (within the batch or against
    /// already installed modules) and unknown entry points are detected
    /// before anything is installed.
    pub fn install_all(&self, descriptors: Vec<ModuleDescriptor>) -> Result<(), RegistryError> {
        let mut seen: HashSet<ModuleIdentity> = self
            .modules
            .read()
            .iter()
            .map(|m| m.identity().clone())
            .collect();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.identity()) {
                return Err(RegistryError::DuplicateModule(descriptor.identity()));
            }
        }

        let mut resolved = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let Some(activator) = find_activator(&descriptor.entry_point) else {
                return Err(RegistryError::UnknownEntryPoint {
                    module: descriptor.identity(),
                    entry_point: descriptor.entry_point.clone(),
                });
            };
            resolved.push((descriptor, activator));
        }

        for (descriptor, activator) in resolved {
            self.install(descriptor, activator)?;
        }
        Ok(())
    }

    /// Installed modules in start order: every exporter before each of its
    /// importers, ties broken by installation order.
    pub fn dependency_order(&self) -> Result<Vec<Arc<ModuleLifecycle>>, RegistryError> {
        let modules = self.modules.read().clone();
        let order = sort_by_dependencies(&modules)?;
        Ok(order.into_iter().map(|i| modules[i].clone()).collect())
    }

    /// Resolve and start every installed module in dependency order.
    ///
    /// Graph-level problems (mandatory cycles) abort before any module runs;
    /// per-module failures are isolated and reported in the [`StartReport`].
    pub async fn start_all(
        &self,
        ctx_builder: &ActivationCtxBuilder,
    ) -> Result<StartReport, RegistryError> {
        let ordered = self.dependency_order()?;

        // Declared exports of the whole batch satisfy resolution; actual
        // publication happens as each exporter starts.
        let declared: HashSet<CapabilityId> = ordered
            .iter()
            .flat_map(|m| m.descriptor().exports.iter())
            .map(|e| e.capability.clone())
            .collect();

        let mut report = StartReport::default();
        for module in &ordered {
            let outcome = match module.resolve(&declared) {
                Ok(()) => {
                    let ctx = ctx_builder.for_module(module.descriptor());
                    module.start(&ctx).await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => report.started.push(module.identity().clone()),
                Err(err) => {
                    tracing::error!(module = %module.identity(), error = %err, "Module failed to start");
                    report.failed.push((module.identity().clone(), err));
                }
            }
        }

        *self.start_order.lock() = report.started.clone();
        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Start pass complete"
        );
        Ok(report)
    }

    /// Stop every started module in reverse start order.
    ///
    /// Best effort: a failing stop is logged and reported, never skipped
    /// over. Safe to call again; the second pass has nothing left to stop.
    pub async fn stop_all(&self) -> Vec<(ModuleIdentity, LifecycleError)> {
        let order = std::mem::take(&mut *self.start_order.lock());
        let mut failures = Vec::new();

        for identity in order.iter().rev() {
            let Some(module) = self.get(identity) else {
                continue;
            };
            if let Err(err) = module.stop().await {
                tracing::warn!(module = %identity, error = %err, "Module failed to stop cleanly");
                failures.push((identity.clone(), err));
            }
        }
        failures
    }

    /// Uninstall every non-active module and drop it from the collection.
    /// Called after `stop_all` during teardown; active modules are kept and
    /// reported.
    pub fn uninstall_all(&self) {
        self.modules.write().retain(|module| {
            if let Err(err) = module.uninstall() {
                tracing::warn!(module = %module.identity(), error = %err, "Skipping uninstall");
                true
            } else {
                false
            }
        });
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

struct DependencyGraph {
    /// adjacency[i] = indices of modules importing something module i exports.
    mandatory: Vec<Vec<usize>>,
    full: Vec<Vec<usize>>,
}

fn build_graph(modules: &[Arc<ModuleLifecycle>]) -> DependencyGraph {
    let mut exporters: HashMap<&CapabilityId, Vec<usize>> = HashMap::new();
    for (i, module) in modules.iter().enumerate() {
        for export in &module.descriptor().exports {
            exporters.entry(&export.capability).or_default().push(i);
        }
    }

    let mut mandatory = vec![Vec::new(); modules.len()];
    let mut full = vec![Vec::new(); modules.len()];
    for (i, module) in modules.iter().enumerate() {
        for import in &module.descriptor().imports {
            for &exporter in exporters.get(&import.capability).into_iter().flatten() {
                if exporter == i {
                    continue; // self-import never orders
                }
                full[exporter].push(i);
                if !import.optional {
                    mandatory[exporter].push(i);
                }
            }
        }
    }
    DependencyGraph { mandatory, full }
}

/// DFS with a gray-path stack; returns the cycle closed back on its first
/// node when one exists.
fn detect_cycle_with_path(
    modules: &[Arc<ModuleLifecycle>],
    adjacency: &[Vec<usize>],
) -> Option<Vec<String>> {
    fn visit(
        node: usize,
        adjacency: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &adjacency[node] {
            match colors[next] {
                Color::Gray => {
                    let from = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, adjacency, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; modules.len()];
    let mut path = Vec::new();
    for start in 0..modules.len() {
        if colors[start] == Color::White {
            if let Some(cycle) = visit(start, adjacency, &mut colors, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|i| modules[i].identity().to_string())
                        .collect(),
                );
            }
        }
    }
    None
}

/// Kahn's algorithm; the smallest installation index among ready nodes goes
/// first, which keeps the order deterministic.
fn kahn(adjacency: &[Vec<usize>]) -> Option<Vec<usize>> {
    let n = adjacency.len();
    let mut indegree = vec![0usize; n];
    for targets in adjacency {
        for &t in targets {
            indegree[t] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let at = ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &node)| node)
            .map(|(at, _)| at)
            .unwrap_or(0);
        let node = ready.swap_remove(at);
        order.push(node);
        for &next in &adjacency[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }

    (order.len() == n).then_some(order)
}

fn sort_by_dependencies(modules: &[Arc<ModuleLifecycle>]) -> Result<Vec<usize>, RegistryError> {
    let graph = build_graph(modules);

    if let Some(path) = detect_cycle_with_path(modules, &graph.mandatory) {
        return Err(RegistryError::CyclicDependency { path });
    }

    // Optional edges participate in ordering when they can; a cycle they
    // introduce falls back to the mandatory-only order.
    if let Some(order) = kahn(&graph.full) {
        return Ok(order);
    }
    tracing::warn!("Optional imports form a cycle; ordering by mandatory imports only");
    kahn(&graph.mandatory).ok_or_else(|| RegistryError::CyclicDependency {
        path: modules.iter().map(|m| m.identity().to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ActivationCtx, ActivationCtxBuilder, NoConfig};
    use crate::contracts::{ModuleActivator, ServiceProvision};
    use crate::lifecycle::ModuleState;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    /// Records start/stop order into a shared journal.
    struct JournalingActivator {
        name: &'static str,
        provide: Vec<String>,
        fail_activate: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ModuleActivator for JournalingActivator {
        async fn activate(&self, _ctx: &ActivationCtx) -> anyhow::Result<Vec<ServiceProvision>> {
            if self.fail_activate {
                anyhow::bail!("refusing to start");
            }
            self.journal.lock().push(format!("+{}", self.name));
            Ok(self
                .provide
                .iter()
                .map(|cap| ServiceProvision::new(cap.clone(), Arc::new(cap.clone())))
                .collect())
        }

        async fn deactivate(&self) -> anyhow::Result<()> {
            self.journal.lock().push(format!("-{}", self.name));
            Ok(())
        }
    }

    struct Fixture {
        registry: ModuleRegistry,
        ctx_builder: ActivationCtxBuilder,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let services = Arc::new(ServiceRegistry::new());
            Self {
                registry: ModuleRegistry::new(services.clone()),
                ctx_builder: ActivationCtxBuilder::new(
                    Arc::new(NoConfig),
                    services,
                    CancellationToken::new(),
                ),
                journal: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn install(&self, name: &'static str, descriptor: ModuleDescriptor) {
            self.install_with(name, descriptor, false);
        }

        fn install_with(&self, name: &'static str, descriptor: ModuleDescriptor, fail: bool) {
            let provide: Vec<String> = descriptor
                .exports
                .iter()
                .map(|e| e.capability.as_str().to_owned())
                .collect();
            self.registry
                .install(
                    descriptor,
                    Arc::new(JournalingActivator {
                        name,
                        provide,
                        fail_activate: fail,
                        journal: self.journal.clone(),
                    }),
                )
                .unwrap();
        }

        fn journal(&self) -> Vec<String> {
            self.journal.lock().clone()
        }
    }

    fn descriptor(name: &str) -> ModuleDescriptor {
        ModuleDescriptor::new(name, "1.0.0", format!("{name}.main"))
    }

    #[tokio::test]
    async fn start_all_orders_exporters_before_importers() {
        let fx = Fixture::new();
        // Installed out of dependency order on purpose.
        fx.install("web", descriptor("web").with_import("kv.store", false));
        fx.install("cache", descriptor("cache").with_export("kv.store", 0).with_import("log.sink", false));
        fx.install("logger", descriptor("logger").with_export("log.sink", 0));

        let report = fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert!(report.all_started());
        assert_eq!(fx.journal(), vec!["+logger", "+cache", "+web"]);
    }

    #[tokio::test]
    async fn stop_all_reverses_start_order() {
        let fx = Fixture::new();
        fx.install("logger", descriptor("logger").with_export("log.sink", 0));
        fx.install("cache", descriptor("cache").with_export("kv.store", 0).with_import("log.sink", false));
        fx.install("web", descriptor("web").with_import("kv.store", false));

        fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        let failures = fx.registry.stop_all().await;
        assert!(failures.is_empty());

        assert_eq!(
            fx.journal(),
            vec!["+logger", "+cache", "+web", "-web", "-cache", "-logger"]
        );

        // Second stop pass finds nothing to do.
        assert!(fx.registry.stop_all().await.is_empty());
        assert_eq!(fx.journal().len(), 6);
    }

    #[tokio::test]
    async fn mandatory_cycle_aborts_with_path() {
        let fx = Fixture::new();
        fx.install("a", descriptor("a").with_export("cap.a", 0).with_import("cap.b", false));
        fx.install("b", descriptor("b").with_export("cap.b", 0).with_import("cap.a", false));

        match fx.registry.start_all(&fx.ctx_builder).await {
            Err(RegistryError::CyclicDependency { path }) => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }

        // Nothing was resolved or started.
        for module in fx.registry.modules() {
            assert_eq!(module.state(), ModuleState::Installed);
        }
        assert!(fx.journal().is_empty());
    }

    #[tokio::test]
    async fn optional_cycle_degrades_instead_of_failing() {
        let fx = Fixture::new();
        fx.install("a", descriptor("a").with_export("cap.a", 0).with_import("cap.b", true));
        fx.install("b", descriptor("b").with_export("cap.b", 0).with_import("cap.a", true));

        let report = fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert!(report.all_started());
        assert_eq!(report.started.len(), 2);
    }

    #[tokio::test]
    async fn optional_imports_order_when_acyclic() {
        let fx = Fixture::new();
        fx.install("web", descriptor("web").with_import("metrics.sink", true));
        fx.install("metrics", descriptor("metrics").with_export("metrics.sink", 0));

        fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert_eq!(fx.journal(), vec!["+metrics", "+web"]);
    }

    #[tokio::test]
    async fn failed_module_is_isolated_from_the_rest() {
        let fx = Fixture::new();
        fx.install("logger", descriptor("logger").with_export("log.sink", 0));
        fx.install_with("flaky", descriptor("flaky"), true);
        fx.install("web", descriptor("web").with_import("log.sink", false));

        let report = fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert_eq!(report.started.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.name, "flaky");

        let flaky = fx.registry.get(&ModuleIdentity::new("flaky", "1.0.0")).unwrap();
        assert_eq!(flaky.state(), ModuleState::Resolved);

        // Reports render for logging and assertion messages.
        let rendered = format!("{report:?}");
        assert!(rendered.contains("flaky"));

        // Stop touches only what started.
        fx.registry.stop_all().await;
        assert_eq!(fx.journal(), vec!["+logger", "+web", "-web", "-logger"]);
    }

    #[tokio::test]
    async fn unresolvable_module_does_not_block_others() {
        let fx = Fixture::new();
        fx.install("orphan", descriptor("orphan").with_import("absent.cap", false));
        fx.install("logger", descriptor("logger").with_export("log.sink", 0));

        let report = fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert_eq!(report.started, vec![ModuleIdentity::new("logger", "1.0.0")]);
        assert_eq!(report.failed.len(), 1);

        let orphan = fx.registry.get(&ModuleIdentity::new("orphan", "1.0.0")).unwrap();
        assert_eq!(orphan.state(), ModuleState::Installed);
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let fx = Fixture::new();
        fx.install("logger", descriptor("logger"));

        let dup = fx.registry.install(
            descriptor("logger"),
            Arc::new(JournalingActivator {
                name: "logger",
                provide: Vec::new(),
                fail_activate: false,
                journal: fx.journal.clone(),
            }),
        );
        assert!(matches!(dup, Err(RegistryError::DuplicateModule(_))));

        // Same name, different version: distinct identity, allowed.
        fx.registry
            .install(
                ModuleDescriptor::new("logger", "2.0.0", "logger.main"),
                Arc::new(JournalingActivator {
                    name: "logger2",
                    provide: Vec::new(),
                    fail_activate: false,
                    journal: fx.journal.clone(),
                }),
            )
            .unwrap();
    }

    #[test]
    fn install_all_rejects_unknown_entry_points_before_installing() {
        let services = Arc::new(ServiceRegistry::new());
        let registry = ModuleRegistry::new(services);

        let err = registry
            .install_all(vec![descriptor("ghost")])
            .unwrap_err();
        match err {
            RegistryError::UnknownEntryPoint { entry_point, .. } => {
                assert_eq!(entry_point, "ghost.main");
            }
            other => panic!("expected UnknownEntryPoint, got {other:?}"),
        }
        assert!(registry.modules().is_empty());
    }

    #[test]
    fn install_all_detects_batch_duplicates_before_installing() {
        let services = Arc::new(ServiceRegistry::new());
        let registry = ModuleRegistry::new(services);

        let err = registry
            .install_all(vec![descriptor("twin"), descriptor("twin")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateModule(_)));
        assert!(registry.modules().is_empty());
    }

    #[tokio::test]
    async fn independent_modules_start_in_install_order() {
        let fx = Fixture::new();
        fx.install("c", descriptor("c"));
        fx.install("a", descriptor("a"));
        fx.install("b", descriptor("b"));

        fx.registry.start_all(&fx.ctx_builder).await.unwrap();
        assert_eq!(fx.journal(), vec!["+c", "+a", "+b"]);
    }
}
