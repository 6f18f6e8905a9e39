//! # Endpoint Registry
//!
//! Registered endpoints and their metadata. Application endpoints are
//! wrapped in an [`InternalEndpoint`] on registration; either handle can be
//! used to unregister or query afterwards.
//!
//! ```text
//!   register(app, props)
//!     ├─ wrap: InternalEndpoint { app, Channel { WorkerPool } }
//!     ├─ ServiceRegistry::register(wrapper, props)
//!     │    └─ hook: app.set_channel(channel), notify EndpointListeners
//!     └─ publish app ─▶ wrapper
//!
//!   unregister(app | wrapper)
//!     ├─ forget app ─▶ wrapper
//!     └─ ServiceRegistry::unregister(wrapper)
//!          └─ hook: channel.close(), notify EndpointListeners
//! ```
//!
//! Each application endpoint gets a [`Slot`] whose turn lock serializes its
//! registration and unregistration. The app ─▶ wrapper mapping is published
//! only once the register hook succeeded, so concurrent callers never see a
//! wrapper that is later rolled back, and an unregister racing a
//! registration waits for it instead of orphaning the wrapper.
//!
//! `lookup` is a plain linear scan with exact value matching and is never
//! cached; use one of the [`reference`](crate::reference) types as a
//! long-lived target instead.

use crate::config::ExecutorConfig;
use crate::endpoint::{Endpoint, InternalEndpoint};
use crate::reference::{properties_match, EndpointsReference, Reference};
use crate::router::NmrInner;
use crate::service_registry::{service_key, Properties, RegistryHooks, ServiceRegistry};
use crate::{NmrError, NmrResult};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Side effects of endpoint (un)registration
struct EndpointHooks {
    nmr: OnceLock<Weak<NmrInner>>,
}

impl EndpointHooks {
    fn router(&self) -> NmrResult<Option<Arc<NmrInner>>> {
        match self.nmr.get() {
            None => Ok(None),
            Some(nmr) => match nmr.upgrade() {
                Some(nmr) if !nmr.is_shut_down() => Ok(Some(nmr)),
                _ => Err(NmrError::Shutdown),
            },
        }
    }
}

impl RegistryHooks<InternalEndpoint> for EndpointHooks {
    fn on_register(&self, endpoint: &Arc<InternalEndpoint>, properties: &Properties) -> NmrResult<()> {
        let router = self.router()?;
        endpoint.endpoint().set_channel(endpoint.channel().clone());
        info!(endpoint = %endpoint.id(), "Endpoint registered");
        if let Some(router) = router {
            router.listeners.endpoint_registered(endpoint, properties);
        }
        Ok(())
    }

    fn on_unregister(&self, endpoint: &Arc<InternalEndpoint>, properties: &Properties) -> NmrResult<()> {
        endpoint.channel().close();
        info!(endpoint = %endpoint.id(), "Endpoint unregistered");
        if let Some(router) = self.nmr.get().and_then(Weak::upgrade) {
            router.listeners.endpoint_unregistered(endpoint, properties);
        }
        Ok(())
    }
}

/// Registration state of one application endpoint
#[derive(Default)]
struct Slot {
    /// Held for the whole of a register or unregister of this endpoint
    turn: Mutex<()>,
    /// Published wrapper, `None` until registration succeeded
    wrapper: RwLock<Option<Arc<InternalEndpoint>>>,
}

/// Registry of endpoints known to a router
pub struct EndpointRegistry {
    id: Uuid,
    registry: ServiceRegistry<InternalEndpoint, EndpointHooks>,
    /// Application endpoint key to its registration slot
    slots: DashMap<usize, Arc<Slot>>,
    /// Pool sizing for the channels of newly wrapped endpoints
    executor: ExecutorConfig,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl EndpointRegistry {
    /// Registry whose endpoint channels use pools sized by `executor`
    pub fn new(executor: ExecutorConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry: ServiceRegistry::with_hooks(
                "endpoints",
                EndpointHooks {
                    nmr: OnceLock::new(),
                },
            ),
            slots: DashMap::new(),
            executor,
        }
    }

    /// Identity of this registry instance
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Attach to a router; endpoints registered afterwards can send
    pub(crate) fn bind(&self, nmr: Weak<NmrInner>) -> NmrResult<()> {
        if !self.registry.is_empty() {
            return Err(NmrError::illegal_state(
                "endpoint registry must be empty when bound to a router",
            ));
        }
        self.registry
            .hooks()
            .nmr
            .set(nmr)
            .map_err(|_| NmrError::illegal_state("endpoint registry is already bound to a router"))
    }

    fn router(&self) -> Weak<NmrInner> {
        self.registry.hooks().nmr.get().cloned().unwrap_or_default()
    }

    /// Register an application endpoint, returning its wrapper
    ///
    /// Registering an endpoint that is already registered returns the
    /// existing wrapper and keeps the original metadata.
    pub fn register(
        &self,
        endpoint: Arc<dyn Endpoint>,
        properties: Option<Properties>,
    ) -> NmrResult<Arc<InternalEndpoint>> {
        self.registry.hooks().router()?;

        let key = service_key(&endpoint);
        loop {
            let slot = self.slots.entry(key).or_default().clone();
            let _turn = slot.turn.lock();
            if let Some(existing) = slot.wrapper.read().clone() {
                debug!(endpoint = %existing.id(), "Endpoint already registered");
                return Ok(existing);
            }
            // a failed registration or an unregister retired this slot while we waited
            if !self.is_current(key, &slot) {
                continue;
            }

            let wrapper = InternalEndpoint::new(endpoint, self.router(), &self.executor);
            if let Err(e) = self.registry.register(wrapper.clone(), properties) {
                self.retire(key, &slot);
                wrapper.channel().close();
                warn!(endpoint = %wrapper.id(), error = %e, "Endpoint registration failed");
                return Err(e);
            }
            *slot.wrapper.write() = Some(wrapper.clone());
            return Ok(wrapper);
        }
    }

    fn slot(&self, key: usize) -> Option<Arc<Slot>> {
        self.slots.get(&key).map(|slot| slot.value().clone())
    }

    fn is_current(&self, key: usize, slot: &Arc<Slot>) -> bool {
        self.slot(key).is_some_and(|current| Arc::ptr_eq(&current, slot))
    }

    fn retire(&self, key: usize, slot: &Arc<Slot>) {
        self.slots.remove_if(&key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Unregister by application endpoint
    ///
    /// Waits for a registration of the same endpoint that is in progress.
    pub fn unregister(&self, endpoint: &Arc<dyn Endpoint>) -> NmrResult<bool> {
        let key = service_key(endpoint);
        let Some(slot) = self.slot(key) else {
            return Ok(false);
        };
        let _turn = slot.turn.lock();
        let Some(wrapper) = slot.wrapper.write().take() else {
            return Ok(false);
        };
        self.retire(key, &slot);
        self.registry.unregister(&wrapper)
    }

    /// Unregister by wrapper
    pub fn unregister_internal(&self, endpoint: &Arc<InternalEndpoint>) -> NmrResult<bool> {
        let key = service_key(endpoint.endpoint());
        if let Some(slot) = self.slot(key) {
            let _turn = slot.turn.lock();
            let mut published = slot.wrapper.write();
            if published.as_ref().is_some_and(|wrapper| Arc::ptr_eq(wrapper, endpoint)) {
                *published = None;
                drop(published);
                self.retire(key, &slot);
            }
        }
        self.registry.unregister(endpoint)
    }

    /// Wrapper of a registered application endpoint
    pub fn internal_endpoint(&self, endpoint: &Arc<dyn Endpoint>) -> Option<Arc<InternalEndpoint>> {
        self.slot(service_key(endpoint))
            .and_then(|slot| slot.wrapper.read().clone())
    }

    pub fn properties(&self, endpoint: &Arc<dyn Endpoint>) -> Option<Arc<Properties>> {
        self.internal_endpoint(endpoint)
            .and_then(|wrapper| self.registry.properties(&wrapper))
    }

    pub fn internal_properties(&self, endpoint: &Arc<InternalEndpoint>) -> Option<Arc<Properties>> {
        self.registry.properties(endpoint)
    }

    /// Reference over exactly the endpoints whose metadata contains
    /// `properties`
    ///
    /// Fails with [`NmrError::NoMatchingEndpoint`] rather than returning an
    /// empty reference.
    pub fn lookup(&self, properties: &Properties) -> NmrResult<Arc<dyn Reference>> {
        let matches = self.query(properties);
        if matches.is_empty() {
            let wanted = serde_json::to_string(properties).unwrap_or_default();
            return Err(NmrError::NoMatchingEndpoint(wanted));
        }
        Ok(Arc::new(EndpointsReference::new(matches)))
    }

    /// Endpoints whose metadata contains `properties`, possibly none
    pub fn query(&self, properties: &Properties) -> Vec<Arc<InternalEndpoint>> {
        self.registry
            .entries()
            .into_iter()
            .filter(|(_, registered)| properties_match(properties, registered))
            .map(|(endpoint, _)| endpoint)
            .collect()
    }

    pub fn endpoints(&self) -> Vec<Arc<InternalEndpoint>> {
        self.registry.services()
    }

    pub fn entries(&self) -> Vec<(Arc<InternalEndpoint>, Arc<Properties>)> {
        self.registry.entries()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Unregister every endpoint, returning the first hook failure
    pub(crate) fn unregister_all(&self) -> NmrResult<()> {
        let mut first_error = None;
        for endpoint in self.endpoints() {
            if let Err(e) = self.unregister_internal(&endpoint) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
