// Copyright 2025 Plugify Contributors
// SPDX-License-Identifier: MIT

//! The orchestrator: owns module/plugin lifecycles and drives the nine
//! startup/steady-state/shutdown phases.
//!
//! The registry is an owning map keyed by package name, with handles that
//! borrow from it; every state change goes through a `StateTransition`
//! guard requiring an explicit `commit()` or `rollback()`, enforced at
//! compile time via `#[must_use]` rather than a runtime assertion.

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::time::{Duration, Instant};

use crate::error::LifecycleError;
use crate::manifest::{Manifest, ModuleManifest, PackageId, PluginManifest};
use crate::provider::Provider;
use crate::types::Method;

/// A module's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    NotLoaded,
    Loaded,
    Error,
    Unknown,
}

/// A plugin's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    NotLoaded,
    Loaded,
    Running,
    Terminating,
    Unloaded,
    Skipped,
    Error,
}

/// Which optional lifecycle callbacks a module or plugin advertises,
/// returned alongside `InitData`/`LoadData`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    pub has_update: bool,
    pub has_plugin_start: bool,
    pub has_plugin_update: bool,
    pub has_plugin_end: bool,
    pub has_method_export: bool,
}

/// Returned by `LanguageModule::initialize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitData {
    pub table: CapabilityTable,
}

/// Returned by `LanguageModule::on_plugin_load`. `user_data`
/// and each method's native address are raw pointers owned by the
/// language module; the host never dereferences them except to hand them
/// back unchanged to that same module.
pub struct LoadData {
    pub methods: Vec<(Method, *const ())>,
    pub user_data: *mut c_void,
    pub table: CapabilityTable,
}

/// Non-owning reference to a registered module, valid for the duration of
/// the callback it was handed to: non-owning, with a lifetime tied to
/// the orchestrator's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle<'a> {
    pub id: &'a str,
}

/// Non-owning reference to a registered plugin, same lifetime contract as
/// [`ModuleHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginHandle<'a> {
    pub id: &'a str,
}

/// The language-module vtable interface, expressed as a trait.
///
/// A shared library implements this by exporting `GetLanguageModule`; the
/// narrow, platform-specific code that turns that raw symbol into a
/// `Box<dyn LanguageModule>` lives behind [`LanguageModuleBinder`], not
/// here, so this trait's only job is describing the calls the orchestrator
/// makes once binding has already happened. Every method here is called
/// from the host thread only; none may block indefinitely
/// without blocking the host.
pub trait LanguageModule {
    fn initialize(&self, provider: &Provider<'_>, module: ModuleHandle<'_>) -> Result<InitData, LifecycleError>;
    fn shutdown(&self);
    fn on_update(&self, delta_time: f64);
    fn on_plugin_load(&self, plugin: PluginHandle<'_>) -> Result<LoadData, LifecycleError>;
    fn on_plugin_start(&self, plugin: PluginHandle<'_>);
    fn on_plugin_update(&self, plugin: PluginHandle<'_>, delta_time: f64);
    fn on_plugin_end(&self, plugin: PluginHandle<'_>);
    fn on_method_export(&self, plugin: PluginHandle<'_>);
    fn is_debug_build(&self) -> bool;
}

/// Binds a loaded [`crate::loader::Assembly`] to its `ILanguageModule`
/// implementation. Production code looks up `GetLanguageModule` and
/// reconstructs a trait object from the raw vtable the library exports;
/// tests substitute a binder that hands back a canned in-process
/// `LanguageModule` with no real dynamic loading involved, which is how
/// this crate's own test suite drives the orchestrator without a
/// companion `.so`/`.dll` fixture.
pub trait LanguageModuleBinder {
    fn bind(&self, module: &ModuleManifest) -> Result<Box<dyn LanguageModule>, LifecycleError>;
}

/// Supplies the current set of manifests at the Discover phase. An
/// embedder's real implementation walks the configs directory; this crate
/// treats it as an external collaborator.
pub trait ManifestSource {
    fn discover(&self) -> Vec<Manifest>;
}

/// RAII state-transition guard: asserts the expected prior state on
/// construction, and requires an explicit `commit()` or `rollback()` to
/// produce the next state. Marking the guard `#[must_use]` and consuming
/// `self` in both `commit` and `rollback` makes forgetting to resolve a
/// transition a compile error rather than a runtime assertion.
#[must_use = "a state transition must be resolved with commit() or rollback()"]
struct StateTransition<S> {
    next: S,
}

impl<S> StateTransition<S> {
    fn begin<T: PartialEq + std::fmt::Debug>(current: &T, expected: T, next: S) -> Self {
        debug_assert_eq!(*current, expected, "invalid state transition");
        Self { next }
    }

    fn commit(self) -> S {
        self.next
    }

    fn rollback(self, error_state: S) -> S {
        error_state
    }
}

/// Per-host timing and throughput counters accumulated across the
/// initialize/load phases.
#[derive(Debug, Clone, Default)]
pub struct LoadStatistics {
    pub modules_loaded: usize,
    pub plugins_loaded: usize,
    pub total_load_time: Duration,
    pub slowest_load: Duration,
    pub slowest_package: Option<PackageId>,
}

impl LoadStatistics {
    fn record(&mut self, package: &str, elapsed: Duration) {
        self.total_load_time += elapsed;
        if elapsed > self.slowest_load {
            self.slowest_load = elapsed;
            self.slowest_package = Some(package.to_string());
        }
    }
}

/// Outcome of the Validate phase.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub accepted: HashMap<PackageId, Manifest>,
    pub rejected: Vec<(PackageId, crate::error::ValidationError)>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

struct ModuleRecord {
    manifest: ModuleManifest,
    state: ModuleState,
    language_module: Option<Box<dyn LanguageModule>>,
    table: CapabilityTable,
    bound_plugins: HashSet<PackageId>,
}

struct PluginRecord {
    manifest: PluginManifest,
    state: PluginState,
    module_id: PackageId,
    table: CapabilityTable,
    user_data: *mut c_void,
    methods: Vec<(Method, *const ())>,
}

/// Looked up by a [`Provider`] on a peer plugin's behalf.
/// Implemented by [`Orchestrator`] itself; kept as a separate trait so
/// `Provider` does not need a lifetime tied to the orchestrator's full
/// internal state, only to the borrow of this narrow interface.
pub trait PeerLookup {
    fn find_plugin(&self, name: &str) -> Option<PluginHandle<'_>>;
    fn find_method(&self, plugin: &str, method: &str) -> Option<*const ()>;
}

/// Drives modules and plugins through nine phases. Owns the
/// module/plugin registries exclusively.
pub struct Orchestrator {
    modules: HashMap<PackageId, ModuleRecord>,
    plugins: HashMap<PackageId, PluginRecord>,
    load_order: Vec<PackageId>,
    config: crate::config::HostConfig,
    current_platform: String,
    stats: LoadStatistics,
}

impl Orchestrator {
    pub fn new(config: crate::config::HostConfig, current_platform: impl Into<String>) -> Self {
        Self {
            modules: HashMap::new(),
            plugins: HashMap::new(),
            load_order: Vec::new(),
            config,
            current_platform: current_platform.into(),
            stats: LoadStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &LoadStatistics {
        &self.stats
    }

    pub fn module_state(&self, id: &str) -> Option<ModuleState> {
        self.modules.get(id).map(|m| m.state)
    }

    pub fn plugin_state(&self, id: &str) -> Option<PluginState> {
        self.plugins.get(id).map(|p| p.state)
    }

    /// Phase 1: Discover.
    pub fn discover(&self, source: &dyn ManifestSource) -> Vec<Manifest> {
        source.discover()
    }

    /// Phase 2: Validate. Rejects duplicate names, illegal property
    /// shapes, and manifests that do not support `self.current_platform`.
    pub fn validate(&self, manifests: Vec<Manifest>) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut seen = HashSet::new();

        for manifest in manifests {
            let name = manifest.name().to_string();

            if !seen.insert(name.clone()) {
                report.rejected.push((name, crate::error::ValidationError::DuplicateName(manifest.name().to_string())));
                continue;
            }

            if !manifest.supports_platform(&self.current_platform) {
                report.rejected.push((name, crate::error::ValidationError::PlatformMismatch(manifest.name().to_string())));
                continue;
            }

            if let Manifest::Plugin(p) = &manifest {
                if let Err(e) = Self::validate_methods(p) {
                    report.rejected.push((name, e));
                    continue;
                }
            }

            report.accepted.insert(name, manifest);
        }

        report
    }

    fn validate_methods(plugin: &PluginManifest) -> Result<(), crate::error::ValidationError> {
        for method in &plugin.methods {
            method.validate().map_err(|e| {
                crate::error::ValidationError::IllegalPropertyShape(plugin.common.name.clone(), e.to_string())
            })?;
        }
        Ok(())
    }

    /// Phase 3: Resolve. Returns the resolver's report unchanged; the
    /// caller decides (via `self.config.allow_partial_load`) whether to
    /// abort or proceed to initialization with the loadable subset.
    pub fn resolve(&self, accepted: &HashMap<PackageId, Manifest>) -> crate::resolver::DependencyReport {
        crate::resolver::DependencyResolver::new().resolve(accepted)
    }

    /// Phase 4: Initialize modules in resolver order. A module whose
    /// `initialize` call fails enters `Error`; every package that
    /// transitively depends on it (direct or indirect) is cascade-marked
    /// `Skipped`/`Error` later, once plugin loading reaches them, rather
    /// than eagerly here: on failure, every package that depends on it is
    /// marked Skipped, without assuming dependents are necessarily plugins.
    pub fn initialize_modules(
        &mut self,
        manifests: &HashMap<PackageId, Manifest>,
        report: &crate::resolver::DependencyReport,
        binder: &dyn LanguageModuleBinder,
    ) -> Vec<(PackageId, LifecycleError)> {
        let mut failures = Vec::new();
        self.load_order = report.load_order.clone();

        for id in &report.load_order {
            let Some(Manifest::Module(module_manifest)) = manifests.get(id) else {
                continue;
            };

            let start = Instant::now();
            self.modules.insert(
                id.clone(),
                ModuleRecord {
                    manifest: module_manifest.clone(),
                    state: ModuleState::NotLoaded,
                    language_module: None,
                    table: CapabilityTable::default(),
                    bound_plugins: HashSet::new(),
                },
            );

            let scope = StateTransition::begin(&self.modules[id].state, ModuleState::NotLoaded, ModuleState::Loaded);

            let outcome = binder.bind(module_manifest).and_then(|language_module| {
                let provider = self.provider_for(module_manifest.common.name.clone());
                let handle = ModuleHandle { id: id.as_str() };
                language_module.initialize(&provider, handle).map(|init| (language_module, init))
            });

            // A module built in a different flavor than the host (debug vs
            // release) has an incompatible ABI assumption around allocator
            // and assertion behavior; refuse to run mixed-flavor modules.
            let outcome = outcome.and_then(|(language_module, init)| {
                if language_module.is_debug_build() == cfg!(debug_assertions) {
                    Ok((language_module, init))
                } else {
                    Err(LifecycleError::new(
                        id.clone(),
                        "module build flavor (debug/release) does not match the host",
                    ))
                }
            });

            let state = match outcome {
                Ok((language_module, init)) => {
                    let record = self.modules.get_mut(id).expect("just inserted");
                    record.language_module = Some(language_module);
                    record.table = init.table;
                    self.stats.modules_loaded += 1;
                    scope.commit()
                }
                Err(e) => {
                    failures.push((id.clone(), e));
                    scope.rollback(ModuleState::Error)
                }
            };

            self.modules.get_mut(id).expect("just inserted").state = state;
            self.stats.record(id, start.elapsed());
        }

        failures
    }

    /// Phase 5: Load plugins in resolver order. A plugin whose declaring
    /// module is missing, not `Loaded`, or whose module returned a
    /// mismatched method list is marked `Error`; a plugin whose direct or
    /// transitive hard dependency is `Error`/`Skipped` is cascade-marked
    /// `Skipped` without ever calling into a language module for it
    /// — a plugin is Skipped if any transitive dependency ended in Error
    /// or Skipped.
    pub fn load_plugins(
        &mut self,
        manifests: &HashMap<PackageId, Manifest>,
        report: &crate::resolver::DependencyReport,
    ) -> Vec<(PackageId, LifecycleError)> {
        let mut failures = Vec::new();
        let mut cascaded: HashSet<PackageId> = HashSet::new();
        if self.load_order.is_empty() {
            self.load_order = report.load_order.clone();
        }

        for id in &report.load_order {
            let Some(Manifest::Plugin(plugin_manifest)) = manifests.get(id) else {
                continue;
            };

            let blocked_on = report
                .dependency_graph
                .get(id)
                .into_iter()
                .flatten()
                .find(|dep| cascaded.contains(*dep) || self.is_failed_module_or_plugin(dep));

            if let Some(dep) = blocked_on {
                cascaded.insert(id.clone());
                self.plugins.insert(
                    id.clone(),
                    PluginRecord {
                        manifest: plugin_manifest.clone(),
                        state: PluginState::Skipped,
                        module_id: plugin_manifest.language.clone(),
                        table: CapabilityTable::default(),
                        user_data: std::ptr::null_mut(),
                        methods: Vec::new(),
                    },
                );
                tracing::warn!(plugin = %id, blocked_on = %dep, "cascade-skipping plugin");
                continue;
            }

            let start = Instant::now();
            let module_id = self.module_id_for_language(&plugin_manifest.language);

            let result = self.load_one_plugin(id, plugin_manifest, module_id.as_deref());
            self.stats.record(id, start.elapsed());

            match result {
                Ok(()) => self.stats.plugins_loaded += 1,
                Err(e) => {
                    cascaded.insert(id.clone());
                    failures.push((id.clone(), e));
                }
            }
        }

        failures
    }

    fn is_failed_module_or_plugin(&self, id: &str) -> bool {
        matches!(self.modules.get(id).map(|m| m.state), Some(ModuleState::Error))
            || matches!(self.plugins.get(id).map(|p| p.state), Some(PluginState::Error) | Some(PluginState::Skipped))
    }

    fn module_id_for_language(&self, language: &str) -> Option<PackageId> {
        self.modules
            .iter()
            .find(|(_, m)| m.manifest.language == language)
            .map(|(id, _)| id.clone())
    }

    fn load_one_plugin(
        &mut self,
        id: &str,
        plugin_manifest: &PluginManifest,
        module_id: Option<&str>,
    ) -> Result<(), LifecycleError> {
        let module_id = module_id.ok_or_else(|| {
            LifecycleError::new(id, format!("no loaded language module declares language '{}'", plugin_manifest.language))
        })?;

        if !matches!(self.modules.get(module_id).map(|m| m.state), Some(ModuleState::Loaded)) {
            return Err(LifecycleError::new(id, "declaring module is not loaded"));
        }

        self.plugins.insert(
            id.to_string(),
            PluginRecord {
                manifest: plugin_manifest.clone(),
                state: PluginState::NotLoaded,
                module_id: module_id.to_string(),
                table: CapabilityTable::default(),
                user_data: std::ptr::null_mut(),
                methods: Vec::new(),
            },
        );

        let scope = StateTransition::begin(&self.plugins[id].state, PluginState::NotLoaded, PluginState::Loaded);

        let provider = self.provider_for(id.to_string());
        let language_module = self
            .modules
            .get(module_id)
            .and_then(|m| m.language_module.as_deref())
            .ok_or_else(|| LifecycleError::new(id, "declaring module has no bound language module"))?;

        let handle = PluginHandle { id };
        let load_result = Self::guard_call(id, || language_module.on_plugin_load(handle));
        let _ = &provider;

        let state = match load_result {
            Ok(data) => {
                if data.methods.len() != plugin_manifest.methods.len() {
                    let err = LifecycleError::new(
                        id,
                        format!("method count mismatch: expected {}, got {}", plugin_manifest.methods.len(), data.methods.len()),
                    );
                    self.plugins.get_mut(id).expect("just inserted").state = scope.rollback(PluginState::Error);
                    return Err(err);
                }
                if data.methods.iter().any(|(_, addr)| addr.is_null()) {
                    let err = LifecycleError::new(id, "language module returned a null native address");
                    self.plugins.get_mut(id).expect("just inserted").state = scope.rollback(PluginState::Error);
                    return Err(err);
                }

                let record = self.plugins.get_mut(id).expect("just inserted");
                record.table = data.table;
                record.user_data = data.user_data;
                record.methods = data.methods;
                self.modules.get_mut(module_id).expect("checked above").bound_plugins.insert(id.to_string());
                scope.commit()
            }
            Err(e) => {
                self.plugins.get_mut(id).expect("just inserted").state = scope.rollback(PluginState::Error);
                return Err(e);
            }
        };

        self.plugins.get_mut(id).expect("just inserted").state = state;
        Ok(())
    }

    /// Phase 6: Export methods, in load order, for every loaded plugin
    /// whose table advertises `has_method_export`.
    pub fn export_methods(&self) {
        for id in &self.load_order_of_loaded_plugins() {
            let record = &self.plugins[id];
            if !record.table.has_method_export {
                continue;
            }
            if let Some(module) = self.modules.get(&record.module_id).and_then(|m| m.language_module.as_deref()) {
                let handle = PluginHandle { id };
                Self::guard_void_call(id, || module.on_method_export(handle));
            }
        }
    }

    /// Phase 7: Start plugins, in load order, transitioning `Loaded →
    /// Running` for every plugin whose table advertises `has_plugin_start`
    /// (plugins without it go straight from `Loaded` to `Running` with no
    /// callback, since "Running" describes eligibility for the update
    /// pump, not that a start hook fired).
    pub fn start_plugins(&mut self) {
        for id in self.load_order_of_loaded_plugins() {
            if self.plugins[&id].state != PluginState::Loaded {
                continue;
            }

            let (module_id, has_start) = {
                let record = &self.plugins[&id];
                (record.module_id.clone(), record.table.has_plugin_start)
            };

            let scope = StateTransition::begin(&self.plugins[&id].state, PluginState::Loaded, PluginState::Running);

            if has_start {
                if let Some(module) = self.modules.get(&module_id).and_then(|m| m.language_module.as_deref()) {
                    let handle = PluginHandle { id: &id };
                    Self::guard_void_call(&id, || module.on_plugin_start(handle));
                }
            }

            self.plugins.get_mut(&id).expect("exists").state = scope.commit();
        }
    }

    /// Phase 8: Update pump. Modules precede plugins within a tick; each
    /// group iterates in load order.
    pub fn update(&self, delta_time: f64) {
        for id in &self.load_order {
            if let Some(module) = self.modules.get(id) {
                if module.state == ModuleState::Loaded && module.table.has_update {
                    if let Some(lm) = module.language_module.as_deref() {
                        Self::guard_void_call(id, || lm.on_update(delta_time));
                    }
                }
            }
        }

        for id in self.load_order_of_loaded_plugins() {
            let record = &self.plugins[&id];
            if record.state != PluginState::Running || !record.table.has_plugin_update {
                continue;
            }
            if let Some(module) = self.modules.get(&record.module_id).and_then(|m| m.language_module.as_deref()) {
                let handle = PluginHandle { id: &id };
                Self::guard_void_call(&id, || module.on_plugin_update(handle, delta_time));
            }
        }
    }

    /// Phase 9: Shutdown. Reverse-order walk: plugins end and unload
    /// first, then modules shut down and release their assemblies —
    /// teardown order is plugins, then trampolines, then modules, then
    /// assemblies. A failure here is logged, never propagated, and never
    /// stops the teardown of siblings.
    pub fn shutdown(&mut self) {
        let plugin_order: Vec<PackageId> = self.load_order_of_loaded_plugins().into_iter().rev().collect();

        for id in &plugin_order {
            let (module_id, has_end) = {
                let Some(record) = self.plugins.get(id) else { continue };
                (record.module_id.clone(), record.table.has_plugin_end)
            };

            if self.plugins[id].state == PluginState::Running {
                let scope = StateTransition::begin(&self.plugins[id].state, PluginState::Running, PluginState::Terminating);
                if has_end {
                    if let Some(module) = self.modules.get(&module_id).and_then(|m| m.language_module.as_deref()) {
                        let handle = PluginHandle { id };
                        Self::guard_void_call(id, || module.on_plugin_end(handle));
                    }
                }
                self.plugins.get_mut(id).expect("exists").state = scope.commit();
            }

            if self.plugins[id].state == PluginState::Terminating {
                let scope = StateTransition::begin(&self.plugins[id].state, PluginState::Terminating, PluginState::Unloaded);
                let record = self.plugins.get_mut(id).expect("exists");
                record.user_data = std::ptr::null_mut();
                record.methods.clear();
                record.state = scope.commit();
            }
        }

        let mut module_order: Vec<PackageId> = self.modules.keys().cloned().collect();
        module_order.sort();
        for id in module_order.into_iter().rev() {
            let Some(record) = self.modules.get(&id) else { continue };
            if record.state != ModuleState::Loaded {
                continue;
            }
            if let Some(module) = record.language_module.as_deref() {
                Self::guard_void_call(&id, || module.shutdown());
            }
            let scope = StateTransition::begin(&self.modules[&id].state, ModuleState::Loaded, ModuleState::NotLoaded);
            let record = self.modules.get_mut(&id).expect("exists");
            record.language_module = None;
            record.state = scope.commit();
        }
    }

    /// Plugins present in the registry, in resolved load order. Plugins
    /// are not themselves nodes the module update-pump walk visits, but
    /// every plugin-side phase (load, export, start, update,
    /// shutdown-reverse) follows this same order: the resolver's
    /// topological order, not registry iteration order.
    fn load_order_of_loaded_plugins(&self) -> Vec<PackageId> {
        let mut order: Vec<PackageId> = self.load_order.iter().filter(|id| self.plugins.contains_key(*id)).cloned().collect();
        let ordered: HashSet<&PackageId> = order.iter().collect();
        let mut stragglers: Vec<PackageId> = self.plugins.keys().filter(|id| !ordered.contains(id)).cloned().collect();
        stragglers.sort();
        order.extend(stragglers);
        order
    }

    fn provider_for(&self, requester: PackageId) -> Provider<'_> {
        let _ = requester;
        Provider::new(&self.config, self)
    }

    /// Converts a panic escaping a language-module callback into a
    /// `LifecycleError` instead of unwinding across the FFI boundary: a
    /// guard at every vtable call site forbids exceptions from crossing it.
    fn guard_call<T>(package: &str, f: impl FnOnce() -> Result<T, LifecycleError>) -> Result<T, LifecycleError> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(LifecycleError::from_panic(package, payload.as_ref())),
        }
    }

    fn guard_void_call(package: &str, f: impl FnOnce()) {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            let err = LifecycleError::from_panic(package, payload.as_ref());
            tracing::error!(package, error = %err, "language module callback panicked");
        }
    }
}

impl PeerLookup for Orchestrator {
    fn find_plugin(&self, name: &str) -> Option<PluginHandle<'_>> {
        self.plugins.get(name).map(|_| PluginHandle { id: name })
    }

    fn find_method(&self, plugin: &str, method: &str) -> Option<*const ()> {
        self.plugins.get(plugin)?.methods.iter().find(|(m, _)| m.name == method).map(|(_, addr)| *addr)
    }
}
