//! Logical submitters ("modules"), their weights and counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SchedulerError;
use crate::metrics::RunningMean;
use crate::task::TaskName;
use crate::types::Weights;

/// Static description supplied at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Weights this module asks for. `None` leaves the global weights alone.
    #[serde(default)]
    pub default_weights: Option<Weights>,
}

impl ModuleInfo {
    pub fn new(version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            default_weights: None,
        }
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.default_weights = Some(weights);
        self
    }
}

/// Per-module statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub name: String,
    pub version: String,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub average_duration_ms: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub weights: Option<Weights>,
}

/// Live record for one registered module.
#[derive(Debug)]
pub struct ModuleRecord {
    id: u64,
    name: String,
    info: ModuleInfo,
    weights: RwLock<Option<Weights>>,
    enabled: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicUsize,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    durations: Mutex<RunningMean>,
}

impl ModuleRecord {
    fn new(id: u64, name: &str, info: ModuleInfo) -> Self {
        Self {
            id,
            name: name.to_string(),
            weights: RwLock::new(info.default_weights),
            info,
            enabled: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            last_activity: Mutex::new(None),
            durations: Mutex::new(RunningMean::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Weights this module contributes to the effective weights, if any.
    pub fn weights(&self) -> Option<Weights> {
        *self.weights.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_weights(&self, weights: Weights) -> Result<(), SchedulerError> {
        weights.validate()?;
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = Some(weights);
        info!(module = %self.name, %weights, "Module weights updated");
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    fn release_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(1)));
    }

    pub(crate) fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// Completion callback, invoked once per executed task.
    pub(crate) fn on_complete(&self, success: bool, duration: Duration) {
        if success {
            self.completed.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        self.durations.lock().unwrap_or_else(PoisonError::into_inner).record(duration);
        self.release_pending();
        self.touch();
    }

    /// A queued task was dropped without running.
    pub(crate) fn on_discard(&self) {
        self.release_pending();
    }

    pub fn stats(&self) -> ModuleStats {
        let durations = *self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        ModuleStats {
            name: self.name.clone(),
            version: self.info.version.clone(),
            submitted: self.submitted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
            pending: self.pending(),
            average_duration_ms: durations.mean_ms(),
            last_activity: *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner),
            enabled: self.is_enabled(),
            weights: self.weights(),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

/// Thread-safe table of registered modules. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: Arc<RwLock<HashMap<String, Arc<ModuleRecord>>>>,
    next_id: Arc<AtomicU64>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`. Re-registering a name replaces the previous record;
    /// handles to the old record stop affecting the registry.
    pub fn register(&self, name: &str, info: ModuleInfo) -> Result<ModuleHandle, SchedulerError> {
        if let Some(weights) = info.default_weights {
            weights.validate()?;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let weights = info.default_weights;
        let record = Arc::new(ModuleRecord::new(id, name, info));
        let previous = self
            .modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::clone(&record));
        if previous.is_some() {
            info!(module = name, "Module re-registered, previous record replaced");
        } else {
            info!(module = name, weights = ?weights, "Registered module");
        }
        Ok(ModuleHandle { record, registry: self.clone() })
    }

    /// Remove `name`. Returns false when it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.modules.write().unwrap_or_else(PoisonError::into_inner).remove(name);
        if removed.is_some() {
            info!(module = name, "Unregistered module");
        }
        removed.is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleRecord>> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set explicit weights for `name`, opting it into the effective weights.
    pub fn configure_weights(&self, name: &str, weights: Weights) -> Result<(), SchedulerError> {
        weights.validate()?;
        let record = self.get(name).ok_or_else(|| SchedulerError::UnknownModule(name.to_string()))?;
        record.set_weights(weights)
    }

    pub fn module_stats(&self, name: &str) -> Option<ModuleStats> {
        self.get(name).map(|r| r.stats())
    }

    /// Stats for every module, sorted by name.
    pub fn all_stats(&self) -> Vec<ModuleStats> {
        let mut stats: Vec<ModuleStats> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|r| r.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// `global` raised per class by every enabled module that set explicit
    /// weights. Modules without weights leave `global` untouched.
    pub fn effective_weights(&self, global: Weights) -> Weights {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.is_enabled())
            .filter_map(|r| r.weights())
            .fold(global, Weights::max)
    }

    fn is_current(&self, record: &Arc<ModuleRecord>) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(record.name())
            .is_some_and(|current| Arc::ptr_eq(current, record))
    }
}

// ── Handle ──────────────────────────────────────────────────────

/// Capability returned by [`ModuleRegistry::register`]. Safe to share
/// across threads.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    record: Arc<ModuleRecord>,
    registry: ModuleRegistry,
}

impl ModuleHandle {
    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Task name attributed to this module.
    pub fn task(&self, label: impl Into<String>) -> TaskName {
        TaskName::attributed(label, Arc::clone(&self.record))
    }

    /// Remove this module from the registry. A no-op when the name has
    /// since been re-registered by someone else.
    pub fn unregister(&self) -> bool {
        if self.registry.is_current(&self.record) {
            self.registry.unregister(self.record.name())
        } else {
            false
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registry.is_current(&self.record)
    }

    pub fn update_weights(&self, weights: Weights) -> Result<(), SchedulerError> {
        self.record.set_weights(weights)
    }

    pub fn weights(&self) -> Option<Weights> {
        self.record.weights()
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.record.enabled.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            debug!(module = self.name(), enabled, "Module enable state changed");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.record.is_enabled()
    }

    pub fn stats(&self) -> ModuleStats {
        self.record.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = ModuleRegistry::new();
        let handle = registry.register("terrain", ModuleInfo::new("1.0", "terrain updates")).unwrap();
        assert_eq!(handle.name(), "terrain");
        assert_eq!(registry.len(), 1);

        let stats = registry.module_stats("terrain").unwrap();
        assert_eq!(stats.version, "1.0");
        assert!(stats.enabled);
        assert_eq!(stats.weights, None);
        assert!(registry.module_stats("missing").is_none());
    }

    #[test]
    fn attributed_task_names_carry_module() {
        let registry = ModuleRegistry::new();
        let handle = registry.register("fx", ModuleInfo::default()).unwrap();
        let name = handle.task("spawn_particles");
        assert_eq!(name.module_name(), Some("fx"));
        assert_eq!(name.label(), "spawn_particles");
        assert_eq!(name.to_string(), "fx/spawn_particles");
    }

    #[test]
    fn completion_callbacks_update_counters() {
        let registry = ModuleRegistry::new();
        let handle = registry.register("m", ModuleInfo::default()).unwrap();
        let record = registry.get("m").unwrap();

        record.on_submit();
        record.on_submit();
        record.on_submit();
        record.on_complete(true, Duration::from_millis(10));
        record.on_complete(false, Duration::from_millis(30));
        record.on_discard();

        let stats = handle.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
        assert!((stats.average_duration_ms - 20.0).abs() < 1.0);
        assert!(stats.last_activity.is_some());
    }

    #[test]
    fn effective_weights_ignore_disabled_modules() {
        let registry = ModuleRegistry::new();
        let global = Weights::balanced();
        let heavy = registry
            .register("heavy", ModuleInfo::default().with_weights(Weights { high: 9, normal: 1, low: 1 }))
            .unwrap();
        registry
            .register("bg", ModuleInfo::default().with_weights(Weights::background_focused()))
            .unwrap();

        assert_eq!(registry.effective_weights(global), Weights { high: 9, normal: 1, low: 3 });
        heavy.set_enabled(false);
        assert_eq!(registry.effective_weights(global), Weights { high: 1, normal: 1, low: 3 });
    }

    #[test]
    fn modules_without_weights_leave_global_alone() {
        let registry = ModuleRegistry::new();
        let plain = registry.register("plain", ModuleInfo::new("1.0", "no weights")).unwrap();
        assert_eq!(registry.effective_weights(Weights::balanced()), Weights::balanced());

        plain.update_weights(Weights { high: 1, normal: 4, low: 1 }).unwrap();
        assert_eq!(plain.weights(), Some(Weights { high: 1, normal: 4, low: 1 }));
        assert_eq!(registry.effective_weights(Weights::balanced()), Weights { high: 1, normal: 4, low: 1 });
    }

    #[test]
    fn configure_weights_validates_and_requires_known_module() {
        let registry = ModuleRegistry::new();
        registry.register("m", ModuleInfo::default()).unwrap();

        assert!(registry.configure_weights("m", Weights::high_focused()).is_ok());
        assert_eq!(registry.get("m").unwrap().weights(), Some(Weights::high_focused()));
        assert_eq!(
            registry.configure_weights("nope", Weights::balanced()),
            Err(SchedulerError::UnknownModule("nope".into()))
        );
        assert!(matches!(
            registry.configure_weights("m", Weights { high: 0, normal: 1, low: 1 }),
            Err(SchedulerError::InvalidWeights(_))
        ));
    }

    #[test]
    fn stale_handle_cannot_unregister_replacement() {
        let registry = ModuleRegistry::new();
        let old = registry.register("m", ModuleInfo::default()).unwrap();
        let new = registry.register("m", ModuleInfo::new("2.0", "")).unwrap();
        assert_ne!(old.id(), new.id());
        assert!(!old.is_registered());
        assert!(!old.unregister());
        assert_eq!(registry.module_stats("m").unwrap().version, "2.0");
        assert!(new.unregister());
        assert!(registry.is_empty());
    }
}
