//! # Normalized Message Router
//!
//! In-process message exchange fabric. Endpoints register with metadata,
//! get a dedicated [`Channel`], and exchange request/reply or
//! fire-and-forget [`Exchange`]s with each other without knowing where the
//! other side lives.
//!
//! ## Architecture
//!
//! ```mermaid
//! graph LR
//!     Client[Client Channel] -->|send / send_sync| Flows[FlowRegistry]
//!     Flows -->|target.choose| Registry[EndpointRegistry]
//!     Flows -->|StraightThroughFlow| Deliver[Channel::deliver]
//!     Deliver -->|forward leg| Pool[WorkerPool]
//!     Pool -->|process| Provider[Endpoint]
//!     Provider -->|send reply| Flows
//!     Deliver -->|return leg| Client
//! ```
//!
//! ## Modules
//!
//! - [`exchange`] / [`message`]: the exchange data model and its message
//!   pattern slot table
//! - [`channel`]: send, send_sync and deliver with rendezvous semantics
//! - [`endpoint_registry`] / [`reference`]: registration and endpoint
//!   selection, including LDAP-style filters
//! - [`flow`]: pluggable dispatch strategies
//! - [`router`]: the [`Nmr`] facade wiring everything together
//! - [`executor`]: bounded per-channel worker pools

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod endpoint_registry;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod flow;
pub mod listener;
pub mod message;
pub mod reference;
pub mod router;
pub mod service_registry;

// Re-export commonly used types
pub use channel::{Channel, ChannelMetrics, ChannelStats};
pub use config::{ExecutorConfig, NmrConfig, RouterSettings};
pub use endpoint::{is_untargetable, Endpoint, InternalEndpoint, UNTARGETABLE};
pub use endpoint_registry::EndpointRegistry;
pub use error::{NmrError, NmrResult};
pub use exchange::{Exchange, MessageType, Pattern, Role, Status};
pub use executor::WorkerPool;
pub use flow::{Flow, FlowRegistry, StraightThroughFlow};
pub use listener::{EndpointListener, ExchangeListener, ListenerRegistry};
pub use message::Message;
pub use reference::{
    CacheableReference, Candidates, DynamicReference, EndpointsReference, Filter,
    FilterMatchingReference, PropertyMatchingReference, Reference,
};
pub use router::{Nmr, NmrBuilder};
pub use service_registry::{NoHooks, Properties, RegistryHooks, ServiceRegistry};
