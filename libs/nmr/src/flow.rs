//! # Flows
//!
//! A [`Flow`] decides whether, and how, an exchange crosses from one channel
//! to another. The [`FlowRegistry`] resolves the endpoint an exchange is
//! heading for and hands it to the first flow that accepts it:
//!
//! | role     | destination | endpoint tried                          |
//! |----------|-------------|-----------------------------------------|
//! | Consumer | unset       | first candidate of `target.choose()`    |
//! | Consumer | set         | destination                             |
//! | Provider | any         | source                                  |
//!
//! Only the first candidate a reference yields is tried. The in-process
//! [`StraightThroughFlow`] is registered by default and accepts everything.

use crate::endpoint::InternalEndpoint;
use crate::endpoint_registry::EndpointRegistry;
use crate::service_registry::{Properties, ServiceRegistry};
use crate::{Exchange, NmrError, NmrResult, Role};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Strategy moving an exchange across the router
pub trait Flow: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether this flow can carry `exchange` to or from `endpoint`
    fn can_dispatch(&self, exchange: &Exchange, endpoint: &InternalEndpoint) -> bool;

    /// Move the exchange to its next channel
    fn dispatch(&self, exchange: &Arc<Exchange>) -> NmrResult<()>;
}

/// Direct in-process hand-off to the receiving channel
#[derive(Debug, Default, Clone, Copy)]
pub struct StraightThroughFlow;

impl Flow for StraightThroughFlow {
    fn name(&self) -> &str {
        "straight-through"
    }

    fn can_dispatch(&self, _exchange: &Exchange, _endpoint: &InternalEndpoint) -> bool {
        true
    }

    fn dispatch(&self, exchange: &Arc<Exchange>) -> NmrResult<()> {
        let receiver = match exchange.role() {
            Role::Consumer => exchange.destination(),
            Role::Provider => exchange.source(),
        };
        let receiver = receiver.ok_or_else(|| {
            NmrError::illegal_state(format!(
                "exchange {} has no endpoint to deliver to",
                exchange.id()
            ))
        })?;
        trace!(exchange_id = %exchange.id(), endpoint = %receiver.id(), "Straight-through delivery");
        receiver.channel().deliver(exchange)
    }
}

/// Registered flows
pub struct FlowRegistry {
    flows: ServiceRegistry<dyn Flow>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self {
            flows: ServiceRegistry::new("flows"),
        }
    }
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, flow: Arc<dyn Flow>, properties: Option<Properties>) -> NmrResult<bool> {
        debug!(flow = flow.name(), "Registering flow");
        self.flows.register(flow, properties)
    }

    pub fn unregister(&self, flow: &Arc<dyn Flow>) -> NmrResult<bool> {
        self.flows.unregister(flow)
    }

    pub fn flows(&self) -> Vec<Arc<dyn Flow>> {
        self.flows.services()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    fn find(&self, exchange: &Exchange, endpoint: &InternalEndpoint) -> Option<Arc<dyn Flow>> {
        self.flows
            .services()
            .into_iter()
            .find(|flow| flow.can_dispatch(exchange, endpoint))
    }

    fn no_flow(exchange: &Exchange, endpoint: &InternalEndpoint) -> NmrError {
        NmrError::NoFlowAvailable {
            exchange_id: exchange.id().to_string(),
            endpoint: endpoint.id().to_string(),
        }
    }

    /// Resolve where `exchange` goes next and dispatch it there
    pub fn dispatch(&self, exchange: &Arc<Exchange>, endpoints: &EndpointRegistry) -> NmrResult<()> {
        let endpoint = match (exchange.role(), exchange.destination()) {
            (Role::Consumer, None) => {
                let target = exchange
                    .target()
                    .ok_or_else(|| NmrError::MissingTarget(exchange.id().to_string()))?;
                let candidates = target.choose(endpoints)?;
                let Some(first) = candidates.first() else {
                    return Err(NmrError::NoMatchingEndpoint(format!("{:?}", target)));
                };
                let flow = self
                    .find(exchange, first)
                    .ok_or_else(|| Self::no_flow(exchange, first))?;
                exchange.set_destination(first.clone());
                debug!(exchange_id = %exchange.id(), endpoint = %first.id(), flow = flow.name(), "Resolved destination");
                return flow.dispatch(exchange);
            }
            (Role::Consumer, Some(destination)) => destination,
            (Role::Provider, _) => exchange.source().ok_or_else(|| {
                NmrError::illegal_state(format!("provider exchange {} has no source", exchange.id()))
            })?,
        };

        let flow = self
            .find(exchange, &endpoint)
            .ok_or_else(|| Self::no_flow(exchange, &endpoint))?;
        flow.dispatch(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ClientEndpoint;
    use crate::reference::EndpointsReference;
    use crate::{Endpoint, Pattern};

    #[derive(Debug)]
    struct Refusing;

    impl Flow for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        fn can_dispatch(&self, _exchange: &Exchange, _endpoint: &InternalEndpoint) -> bool {
            false
        }

        fn dispatch(&self, _exchange: &Arc<Exchange>) -> NmrResult<()> {
            unreachable!("never accepts")
        }
    }

    fn endpoint(registry: &EndpointRegistry) -> Arc<InternalEndpoint> {
        let endpoint: Arc<dyn Endpoint> = Arc::new(ClientEndpoint);
        registry.register(endpoint, None).unwrap()
    }

    #[tokio::test]
    async fn test_missing_target() {
        let flows = FlowRegistry::new();
        let registry = EndpointRegistry::default();
        let exchange = Arc::new(Exchange::new(Pattern::InOnly));

        assert!(matches!(
            flows.dispatch(&exchange, &registry),
            Err(NmrError::MissingTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let flows = FlowRegistry::new();
        let registry = EndpointRegistry::default();
        let exchange = Arc::new(Exchange::new(Pattern::InOnly));
        exchange.set_target(Arc::new(EndpointsReference::new(Vec::new())));

        assert!(matches!(
            flows.dispatch(&exchange, &registry),
            Err(NmrError::NoMatchingEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_no_flow_leaves_destination_unset() {
        let flows = FlowRegistry::new();
        flows.register(Arc::new(Refusing), None).unwrap();
        let registry = EndpointRegistry::default();
        let target = endpoint(&registry);
        let exchange = Arc::new(Exchange::new(Pattern::InOnly));
        exchange.set_target(Arc::new(EndpointsReference::new(vec![target])));

        assert!(matches!(
            flows.dispatch(&exchange, &registry),
            Err(NmrError::NoFlowAvailable { .. })
        ));
        assert!(exchange.destination().is_none());
    }

    #[tokio::test]
    async fn test_first_candidate_is_chosen() {
        let flows = FlowRegistry::new();
        flows.register(Arc::new(StraightThroughFlow), None).unwrap();
        let registry = EndpointRegistry::default();
        let first = endpoint(&registry);
        let second = endpoint(&registry);
        let exchange = Arc::new(Exchange::new(Pattern::InOnly));
        exchange.set_target(Arc::new(EndpointsReference::new(vec![
            first.clone(),
            second.clone(),
        ])));

        flows.dispatch(&exchange, &registry).unwrap();
        assert!(Arc::ptr_eq(&exchange.destination().unwrap(), &first));
        assert_eq!(first.channel().stats().deliveries, 1);
        assert_eq!(second.channel().stats().deliveries, 0);
    }

    #[tokio::test]
    async fn test_provider_without_source_is_rejected() {
        let flows = FlowRegistry::new();
        flows.register(Arc::new(StraightThroughFlow), None).unwrap();
        let registry = EndpointRegistry::default();
        let exchange = Arc::new(Exchange::new(Pattern::InOut));
        exchange.flip_role();

        assert!(matches!(
            flows.dispatch(&exchange, &registry),
            Err(NmrError::IllegalState(_))
        ));
    }
}
