//! Scoped service registry with dependent-tracked lifetimes
//!
//! Environments form a tree; lookups fall back to the parent unless the
//! child owns the service. Dependent handles are tracked at the root so a
//! shared service is only closed once the owning environment and every
//! dependent have released it.

use crate::error::{Error, Result};
use crate::observable::Observable;
use parking_lot::{Mutex, RwLock};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A service that can live in an [`Environment`].
pub trait Service: Any + Send + Sync {
    /// Invoked when the last reference (owner plus dependents) releases the
    /// service.
    fn close(&self) {}
}

/// A service the environment can construct on demand.
pub trait Environmental: Service {
    fn create(environment: &Arc<Environment>) -> Arc<Self>
    where
        Self: Sized;
}

/// Emitted on service registration and removal.
#[derive(Clone, Copy, Debug)]
pub struct ServiceEvent {
    pub type_id: TypeId,
    pub type_name: &'static str,
}

struct ServiceEntry {
    any: Arc<dyn Any + Send + Sync>,
    service: Arc<dyn Service>,
    type_name: &'static str,
}

#[derive(Default)]
struct DependentState {
    holders: HashSet<u64>,
    owner_released: bool,
}

#[derive(Default)]
struct RootTracking {
    dependents: HashMap<TypeId, DependentState>,
}

/// Scoped service registry.
pub struct Environment {
    name: String,
    parent: Option<Arc<Environment>>,
    services: RwLock<HashMap<TypeId, ServiceEntry>>,
    // Populated on the root only.
    tracking: Mutex<RootTracking>,
    next_dependent_id: AtomicU64,
    /// Emitted after a service is registered.
    pub added: Observable<ServiceEvent>,
    /// Emitted after a service is removed via delete.
    pub deleted: Observable<ServiceEvent>,
}

impl Environment {
    /// Create a root environment.
    pub fn new_root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            services: RwLock::new(HashMap::new()),
            tracking: Mutex::new(RootTracking::default()),
            next_dependent_id: AtomicU64::new(1),
            added: Observable::new(),
            deleted: Observable::new(),
        })
    }

    /// Create a child scope.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Some(self.clone()),
            services: RwLock::new(HashMap::new()),
            tracking: Mutex::new(RootTracking::default()),
            next_dependent_id: AtomicU64::new(1),
            added: Observable::new(),
            deleted: Observable::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root of this environment tree.
    pub fn root(self: &Arc<Self>) -> Arc<Environment> {
        let mut current = self.clone();
        while let Some(parent) = current.parent.clone() {
            current = parent;
        }
        current
    }

    /// Register a service instance in this scope.
    pub fn set<T: Service>(&self, instance: Arc<T>) {
        let type_name = std::any::type_name::<T>();
        let entry = ServiceEntry {
            any: instance.clone(),
            service: instance,
            type_name,
        };
        self.services.write().insert(TypeId::of::<T>(), entry);
        debug!(env = %self.name, service = type_name, "service added");
        self.added.emit(&ServiceEvent {
            type_id: TypeId::of::<T>(),
            type_name,
        });
    }

    /// Look up a service, falling back to the parent chain.
    pub fn maybe_get<T: Service>(&self) -> Option<Arc<T>> {
        if let Some(entry) = self.services.read().get(&TypeId::of::<T>()) {
            return entry.any.clone().downcast::<T>().ok();
        }
        self.parent.as_ref().and_then(|p| p.maybe_get::<T>())
    }

    /// Look up a service, constructing it in this scope when the type
    /// declares a factory and no instance exists yet.
    pub fn get<T: Environmental>(self: &Arc<Self>) -> Arc<T> {
        if let Some(existing) = self.maybe_get::<T>() {
            return existing;
        }
        let instance = T::create(self);
        // A concurrent get may have won the race; prefer the stored one.
        if let Some(existing) = self.maybe_get::<T>() {
            return existing;
        }
        self.set(instance.clone());
        instance
    }

    /// Look up a service that cannot be constructed on demand.
    pub fn load<T: Service>(&self) -> Result<Arc<T>> {
        self.maybe_get::<T>().ok_or_else(|| {
            Error::Implementation(format!(
                "service {} is not registered",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Whether the service is visible from this scope.
    pub fn has<T: Service>(&self) -> bool {
        if self.services.read().contains_key(&TypeId::of::<T>()) {
            return true;
        }
        self.parent.as_ref().map(|p| p.has::<T>()).unwrap_or(false)
    }

    /// Whether this scope itself holds the service.
    pub fn owns<T: Service>(&self) -> bool {
        self.services.read().contains_key(&TypeId::of::<T>())
    }

    /// Remove a service without invoking its close hook. When `expected` is
    /// given and does not match the registered instance, the registration is
    /// still removed but the `deleted` event is suppressed.
    pub fn delete<T: Service>(self: &Arc<Self>, expected: Option<&Arc<T>>) {
        let removed = self.services.write().remove(&TypeId::of::<T>());
        self.root()
            .tracking
            .lock()
            .dependents
            .remove(&TypeId::of::<T>());
        if let Some(entry) = removed {
            let matches = match expected {
                Some(expected) => {
                    match entry.any.clone().downcast::<T>() {
                        Ok(stored) => Arc::ptr_eq(&stored, expected),
                        Err(_) => false,
                    }
                }
                None => true,
            };
            if matches {
                self.deleted.emit(&ServiceEvent {
                    type_id: TypeId::of::<T>(),
                    type_name: entry.type_name,
                });
            }
        }
    }

    /// Release the owner's reference. The service closes immediately when no
    /// dependents hold it; otherwise it stays registered until the last
    /// dependent releases it.
    pub fn close_service<T: Service>(self: &Arc<Self>) {
        let type_id = TypeId::of::<T>();
        let root = self.root();
        let mut tracking = root.tracking.lock();
        let has_holders = tracking
            .dependents
            .get(&type_id)
            .map(|s| !s.holders.is_empty())
            .unwrap_or(false);
        if has_holders {
            tracking
                .dependents
                .entry(type_id)
                .or_default()
                .owner_released = true;
            return;
        }
        tracking.dependents.remove(&type_id);
        drop(tracking);

        if let Some(entry) = self.services.write().remove(&type_id) {
            debug!(env = %self.name, service = entry.type_name, "service closed");
            entry.service.close();
        }
    }

    /// Close every service owned by this scope.
    pub fn close_all(self: &Arc<Self>) {
        let entries: Vec<ServiceEntry> = {
            let mut services = self.services.write();
            services.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.service.close();
        }
    }

    /// Obtain a dependent handle; accesses through it are tracked at the
    /// root environment.
    pub fn as_dependent(self: &Arc<Self>) -> DependentEnvironment {
        let root = self.root();
        let id = root.next_dependent_id.fetch_add(1, Ordering::Relaxed);
        DependentEnvironment {
            env: self.clone(),
            id,
            closed: AtomicBool::new(false),
            held: Mutex::new(HashSet::new()),
        }
    }

    fn owning_env<'a>(self: &'a Arc<Self>, type_id: TypeId) -> Option<Arc<Environment>> {
        let mut current = self.clone();
        loop {
            if current.services.read().contains_key(&type_id) {
                return Some(current);
            }
            let parent = current.parent.clone()?;
            current = parent;
        }
    }
}

/// Tracked handle onto an environment; see [`Environment::as_dependent`].
pub struct DependentEnvironment {
    env: Arc<Environment>,
    id: u64,
    closed: AtomicBool,
    held: Mutex<HashSet<TypeId>>,
}

impl DependentEnvironment {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Implementation(
                "Dependent environment is closed".into(),
            ));
        }
        Ok(())
    }

    /// Tracked lookup with on-demand construction.
    pub fn get<T: Environmental>(&self) -> Result<Arc<T>> {
        self.ensure_open()?;
        let instance = self.env.get::<T>();
        self.track(TypeId::of::<T>());
        Ok(instance)
    }

    /// Tracked lookup of an already-registered service.
    pub fn load<T: Service>(&self) -> Result<Arc<T>> {
        self.ensure_open()?;
        let instance = self.env.load::<T>()?;
        self.track(TypeId::of::<T>());
        Ok(instance)
    }

    fn track(&self, type_id: TypeId) {
        if self.held.lock().insert(type_id) {
            let root = self.env.root();
            root.tracking
                .lock()
                .dependents
                .entry(type_id)
                .or_default()
                .holders
                .insert(self.id);
        }
    }

    /// Release all tracked services. Services whose owner already released
    /// them close once the last holder is gone.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let held: Vec<TypeId> = self.held.lock().drain().collect();
        let root = self.env.root();
        for type_id in held {
            let close_now = {
                let mut tracking = root.tracking.lock();
                match tracking.dependents.get_mut(&type_id) {
                    Some(state) => {
                        state.holders.remove(&self.id);
                        if state.holders.is_empty() && state.owner_released {
                            tracking.dependents.remove(&type_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                }
            };
            if close_now {
                if let Some(owner) = self.env.owning_env(type_id) {
                    if let Some(entry) = owner.services.write().remove(&type_id) {
                        entry.service.close();
                    }
                }
            }
        }
    }
}
