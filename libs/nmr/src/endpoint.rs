//! # Endpoints
//!
//! [`Endpoint`] is what application code implements. When an endpoint is
//! registered the router wraps it in an [`InternalEndpoint`], which owns the
//! endpoint's dedicated [`Channel`] (and through it the channel's worker
//! pool). Only the wrapper takes part in routing.
//!
//! The channel refers back to its wrapper through a `Weak` handle, so the
//! registry is the only long-lived owner of a wrapper. Exchanges hold wrapper
//! handles (source/destination) while they are in flight, which keeps an
//! endpoint that is unregistered mid-flight alive until its pending work ran.

use crate::channel::{Channel, ChannelCore};
use crate::config::ExecutorConfig;
use crate::executor::WorkerPool;
use crate::router::NmrInner;
use crate::service_registry::Properties;
use crate::{Exchange, NmrError, NmrResult};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Metadata key marking an endpoint that must never be chosen by a reference
pub const UNTARGETABLE: &str = "untargetable";

/// Application-supplied endpoint
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Receives the endpoint's channel once it is registered
    fn set_channel(&self, channel: Channel);

    /// Handle an inbound exchange
    ///
    /// Runs on the endpoint's worker pool. Typical providers fill the out or
    /// fault message and `send` the exchange back on their channel. An error
    /// marks the exchange as failed.
    async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()>;
}

/// Router-side wrapper of a registered endpoint
pub struct InternalEndpoint {
    id: String,
    endpoint: Arc<dyn Endpoint>,
    channel: Channel,
}

impl InternalEndpoint {
    pub(crate) fn new(
        endpoint: Arc<dyn Endpoint>,
        nmr: Weak<NmrInner>,
        executor: &ExecutorConfig,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        Arc::new_cyclic(|me| {
            let pool = WorkerPool::new(format!("channel-{}", id), executor);
            let core = ChannelCore::new(id.clone(), me.clone(), nmr, pool);
            InternalEndpoint {
                id,
                endpoint,
                channel: Channel::new(Arc::new(core)),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The wrapped application endpoint
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl fmt::Debug for InternalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalEndpoint")
            .field("id", &self.id)
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}

/// Whether registration metadata marks an endpoint as untargetable
pub fn is_untargetable(properties: &Properties) -> bool {
    match properties.get(UNTARGETABLE) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Endpoint behind a client channel; it never receives inbound work
pub(crate) struct ClientEndpoint;

#[async_trait]
impl Endpoint for ClientEndpoint {
    fn set_channel(&self, _channel: Channel) {}

    async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()> {
        Err(NmrError::illegal_state(format!(
            "client channel received inbound exchange {}",
            exchange.id()
        )))
    }
}
