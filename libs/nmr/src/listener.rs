//! Listener capabilities and their registry.
//!
//! Listeners are called inline on the task that triggers the event, so they
//! must be quick and must not block.

use crate::endpoint::InternalEndpoint;
use crate::service_registry::{Properties, ServiceRegistry};
use crate::{Exchange, NmrResult};
use std::sync::Arc;

/// Observes exchanges crossing channel boundaries
pub trait ExchangeListener: Send + Sync {
    /// The exchange is about to be dispatched by a channel
    fn exchange_sent(&self, _exchange: &Exchange) {}

    /// The exchange reached the endpoint that will process it
    fn exchange_delivered(&self, _exchange: &Exchange) {}

    /// Dispatch or processing failed
    fn exchange_failed(&self, _exchange: &Exchange) {}
}

/// Observes endpoint registration changes
///
/// Typical use is invalidating cached references with
/// [`CacheableReference::set_dirty`](crate::CacheableReference::set_dirty).
pub trait EndpointListener: Send + Sync {
    fn endpoint_registered(&self, _endpoint: &Arc<InternalEndpoint>, _properties: &Properties) {}

    fn endpoint_unregistered(&self, _endpoint: &Arc<InternalEndpoint>, _properties: &Properties) {}
}

/// Registered exchange and endpoint listeners
pub struct ListenerRegistry {
    exchange: ServiceRegistry<dyn ExchangeListener>,
    endpoint: ServiceRegistry<dyn EndpointListener>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            exchange: ServiceRegistry::new("exchange-listeners"),
            endpoint: ServiceRegistry::new("endpoint-listeners"),
        }
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_exchange_listener(
        &self,
        listener: Arc<dyn ExchangeListener>,
        properties: Option<Properties>,
    ) -> NmrResult<bool> {
        self.exchange.register(listener, properties)
    }

    pub fn remove_exchange_listener(&self, listener: &Arc<dyn ExchangeListener>) -> NmrResult<bool> {
        self.exchange.unregister(listener)
    }

    pub fn add_endpoint_listener(
        &self,
        listener: Arc<dyn EndpointListener>,
        properties: Option<Properties>,
    ) -> NmrResult<bool> {
        self.endpoint.register(listener, properties)
    }

    pub fn remove_endpoint_listener(&self, listener: &Arc<dyn EndpointListener>) -> NmrResult<bool> {
        self.endpoint.unregister(listener)
    }

    pub fn exchange_listeners(&self) -> Vec<Arc<dyn ExchangeListener>> {
        self.exchange.services()
    }

    pub fn endpoint_listeners(&self) -> Vec<Arc<dyn EndpointListener>> {
        self.endpoint.services()
    }

    pub(crate) fn exchange_sent(&self, exchange: &Exchange) {
        for listener in self.exchange.services() {
            listener.exchange_sent(exchange);
        }
    }

    pub(crate) fn exchange_delivered(&self, exchange: &Exchange) {
        for listener in self.exchange.services() {
            listener.exchange_delivered(exchange);
        }
    }

    pub(crate) fn exchange_failed(&self, exchange: &Exchange) {
        for listener in self.exchange.services() {
            listener.exchange_failed(exchange);
        }
    }

    pub(crate) fn endpoint_registered(&self, endpoint: &Arc<InternalEndpoint>, properties: &Properties) {
        for listener in self.endpoint.services() {
            listener.endpoint_registered(endpoint, properties);
        }
    }

    pub(crate) fn endpoint_unregistered(
        &self,
        endpoint: &Arc<InternalEndpoint>,
        properties: &Properties,
    ) {
        for listener in self.endpoint.services() {
            listener.endpoint_unregistered(endpoint, properties);
        }
    }
}
