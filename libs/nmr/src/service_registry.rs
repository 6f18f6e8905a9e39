//! # Service Registry
//!
//! Generic "register a shared object together with metadata" table that the
//! endpoint, listener and flow registries are built on.
//!
//! Services are keyed by the identity of their `Arc` allocation, so the same
//! handle (or any clone of it) always maps to the same entry. Registration is
//! insert-if-absent on a `DashMap` entry: when several threads register the
//! same service concurrently exactly one of them runs the register hook and
//! the others return `Ok(false)`.
//!
//! A failing register hook removes the entry again before the error is
//! returned, so a half-registered service is never visible. A failing
//! unregister hook is reported but the entry stays removed.

use crate::{NmrError, NmrResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// String-keyed metadata attached to every registration
pub type Properties = HashMap<String, Value>;

/// Side effects run after an insert / after a removal
pub trait RegistryHooks<T: ?Sized>: Send + Sync {
    fn on_register(&self, _service: &Arc<T>, _properties: &Properties) -> NmrResult<()> {
        Ok(())
    }

    fn on_unregister(&self, _service: &Arc<T>, _properties: &Properties) -> NmrResult<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl<T: ?Sized> RegistryHooks<T> for NoHooks {}

struct Registration<T: ?Sized> {
    service: Arc<T>,
    properties: Arc<Properties>,
}

/// Race-free service table
pub struct ServiceRegistry<T: ?Sized, H = NoHooks> {
    name: &'static str,
    services: DashMap<usize, Registration<T>>,
    hooks: H,
}

/// Identity of a shared service handle
pub(crate) fn service_key<T: ?Sized>(service: &Arc<T>) -> usize {
    Arc::as_ptr(service) as *const () as usize
}

impl<T: ?Sized + Send + Sync> ServiceRegistry<T, NoHooks> {
    pub fn new(name: &'static str) -> Self {
        Self::with_hooks(name, NoHooks)
    }
}

impl<T, H> ServiceRegistry<T, H>
where
    T: ?Sized + Send + Sync,
    H: RegistryHooks<T>,
{
    pub fn with_hooks(name: &'static str, hooks: H) -> Self {
        Self {
            name,
            services: DashMap::new(),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Register a service; returns `Ok(false)` if it was already registered
    pub fn register(&self, service: Arc<T>, properties: Option<Properties>) -> NmrResult<bool> {
        let key = service_key(&service);
        let properties = Arc::new(properties.unwrap_or_default());

        match self.services.entry(key) {
            Entry::Occupied(_) => {
                debug!(registry = self.name, "Service already registered, ignoring");
                return Ok(false);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Registration {
                    service: service.clone(),
                    properties: properties.clone(),
                });
            }
        }

        // The entry guard is released before running the hook so hooks may
        // query this registry.
        if let Err(e) = self.hooks.on_register(&service, &properties) {
            self.services.remove(&key);
            error!(registry = self.name, error = %e, "Register hook failed, registration rolled back");
            return Err(wrap_hook_error(self.name, e));
        }

        Ok(true)
    }

    /// Unregister a service; returns whether an entry was removed
    pub fn unregister(&self, service: &Arc<T>) -> NmrResult<bool> {
        let Some((_, registration)) = self.services.remove(&service_key(service)) else {
            return Ok(false);
        };

        if let Err(e) = self
            .hooks
            .on_unregister(&registration.service, &registration.properties)
        {
            error!(registry = self.name, error = %e, "Unregister hook failed");
            return Err(wrap_hook_error(self.name, e));
        }

        Ok(true)
    }

    /// Weakly consistent snapshot of the registered services
    pub fn services(&self) -> Vec<Arc<T>> {
        self.services
            .iter()
            .map(|entry| entry.value().service.clone())
            .collect()
    }

    /// Services paired with their metadata
    pub fn entries(&self) -> Vec<(Arc<T>, Arc<Properties>)> {
        self.services
            .iter()
            .map(|entry| (entry.value().service.clone(), entry.value().properties.clone()))
            .collect()
    }

    /// Stored metadata, `None` if the service is not registered
    pub fn properties(&self, service: &Arc<T>) -> Option<Arc<Properties>> {
        self.services
            .get(&service_key(service))
            .map(|entry| entry.value().properties.clone())
    }

    pub fn contains(&self, service: &Arc<T>) -> bool {
        self.services.contains_key(&service_key(service))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn wrap_hook_error(registry: &str, e: NmrError) -> NmrError {
    match e {
        NmrError::Registration { .. } => e,
        other => NmrError::registration(format!("{} entry", registry), other),
    }
}
