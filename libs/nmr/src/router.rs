//! # Router Facade
//!
//! [`Nmr`] owns the endpoint, listener and flow registries of one router
//! instance. There is no process-wide state: every router is built
//! explicitly, usually once per application and once per test.
//!
//! ```rust,no_run
//! use nmr::{Nmr, Pattern};
//! use serde_json::json;
//!
//! # async fn example() -> nmr::NmrResult<()> {
//! let nmr = Nmr::new()?;
//! let client = nmr.create_channel()?;
//!
//! let exchange = client.create_exchange(Pattern::InOut);
//! exchange.set_target(nmr.property_reference(
//!     serde_json::from_value(json!({"service": "echo"})).unwrap_or_default(),
//! ));
//! exchange.in_message().set_body("ping");
//! client.send_sync(&exchange).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Endpoint channels only keep a `Weak` handle to the router internals;
//! once every `Nmr` clone is dropped their sends fail with
//! [`NmrError::Shutdown`].

use crate::config::NmrConfig;
use crate::endpoint::{ClientEndpoint, Endpoint, InternalEndpoint};
use crate::endpoint_registry::EndpointRegistry;
use crate::flow::{FlowRegistry, StraightThroughFlow};
use crate::listener::ListenerRegistry;
use crate::reference::{
    DynamicReference, FilterMatchingReference, PropertyMatchingReference, Reference,
};
use crate::service_registry::Properties;
use crate::{Channel, NmrError, NmrResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// State shared between the facade and the channels it created
pub(crate) struct NmrInner {
    pub(crate) endpoints: Arc<EndpointRegistry>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) flows: Arc<FlowRegistry>,
    config: NmrConfig,
    shut_down: AtomicBool,
}

impl NmrInner {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Assembles a router from optional injected parts
#[derive(Default)]
pub struct NmrBuilder {
    config: Option<NmrConfig>,
    endpoints: Option<Arc<EndpointRegistry>>,
    listeners: Option<Arc<ListenerRegistry>>,
    flows: Option<Arc<FlowRegistry>>,
}

impl NmrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NmrConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an existing, still empty endpoint registry
    pub fn endpoint_registry(mut self, endpoints: Arc<EndpointRegistry>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn listener_registry(mut self, listeners: Arc<ListenerRegistry>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    pub fn flow_registry(mut self, flows: Arc<FlowRegistry>) -> Self {
        self.flows = Some(flows);
        self
    }

    /// Build missing registries and wire everything together
    ///
    /// A [`StraightThroughFlow`] is registered when the flow registry is
    /// empty.
    pub fn init(self) -> NmrResult<Nmr> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let endpoints = self
            .endpoints
            .unwrap_or_else(|| Arc::new(EndpointRegistry::new(config.executor.clone())));
        let listeners = self.listeners.unwrap_or_default();
        let flows = self.flows.unwrap_or_default();
        if flows.is_empty() {
            flows.register(Arc::new(StraightThroughFlow), None)?;
        }

        let inner = Arc::new(NmrInner {
            endpoints,
            listeners,
            flows,
            config,
            shut_down: AtomicBool::new(false),
        });
        inner.endpoints.bind(Arc::downgrade(&inner))?;

        info!(
            router = %inner.config.router.name,
            flows = inner.flows.len(),
            workers = inner.config.executor.workers,
            "Router initialized"
        );
        Ok(Nmr { inner })
    }
}

/// Normalized message router
#[derive(Clone)]
pub struct Nmr {
    inner: Arc<NmrInner>,
}

impl Nmr {
    /// Router with default configuration
    pub fn new() -> NmrResult<Self> {
        NmrBuilder::new().init()
    }

    pub fn with_config(config: NmrConfig) -> NmrResult<Self> {
        NmrBuilder::new().config(config).init()
    }

    pub fn builder() -> NmrBuilder {
        NmrBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.router.name
    }

    pub fn config(&self) -> &NmrConfig {
        &self.inner.config
    }

    pub fn endpoint_registry(&self) -> &Arc<EndpointRegistry> {
        &self.inner.endpoints
    }

    pub fn listener_registry(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    pub fn flow_registry(&self) -> &Arc<FlowRegistry> {
        &self.inner.flows
    }

    pub fn register_endpoint(
        &self,
        endpoint: Arc<dyn Endpoint>,
        properties: Option<Properties>,
    ) -> NmrResult<Arc<InternalEndpoint>> {
        self.inner.endpoints.register(endpoint, properties)
    }

    pub fn unregister_endpoint(&self, endpoint: &Arc<dyn Endpoint>) -> NmrResult<bool> {
        self.inner.endpoints.unregister(endpoint)
    }

    pub fn lookup(&self, properties: &Properties) -> NmrResult<Arc<dyn Reference>> {
        self.inner.endpoints.lookup(properties)
    }

    /// Channel for client code that only sends
    ///
    /// The channel is not registered, so it can never be a destination; its
    /// endpoint fails any inbound exchange with [`NmrError::IllegalState`].
    pub fn create_channel(&self) -> NmrResult<Channel> {
        if self.is_shut_down() {
            return Err(NmrError::Shutdown);
        }
        let client: Arc<dyn Endpoint> = Arc::new(ClientEndpoint);
        let wrapper = InternalEndpoint::new(
            client,
            Arc::downgrade(&self.inner),
            &self.inner.config.executor,
        );
        Ok(Channel::anchored(wrapper))
    }

    pub fn property_reference(&self, properties: Properties) -> Arc<PropertyMatchingReference> {
        Arc::new(PropertyMatchingReference::new(properties))
    }

    pub fn filter_reference(&self, expression: impl Into<String>) -> Arc<FilterMatchingReference> {
        Arc::new(FilterMatchingReference::new(expression))
    }

    pub fn dynamic_reference<F>(&self, predicate: F) -> Arc<DynamicReference>
    where
        F: Fn(&InternalEndpoint, &Properties) -> bool + Send + Sync + 'static,
    {
        Arc::new(DynamicReference::new(predicate))
    }

    /// Unregister every endpoint and refuse further registrations and sends
    pub fn shutdown(&self) -> NmrResult<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let endpoints = self.inner.endpoints.len();
        let result = self.inner.endpoints.unregister_all();
        match &result {
            Ok(()) => info!(router = %self.name(), endpoints, "Router shut down"),
            Err(e) => warn!(router = %self.name(), error = %e, "Router shut down with errors"),
        }
        result
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}
