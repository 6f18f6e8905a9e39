//! # Message Exchange
//!
//! An [`Exchange`] is the single object that travels between a consumer and a
//! provider for the whole lifetime of a message exchange pattern. The same
//! instance carries the request, the response and the final status, so it is
//! always shared as `Arc<Exchange>` and mutated through interior locks.
//!
//! ## Role and status
//!
//! ```text
//!  consumer                      provider
//!  role=Consumer ── send ──▶ process(): role=Provider
//!                                 sets out / fault
//!  role=Consumer ◀── send ──  role=Provider
//! ```
//!
//! The role is the lens through which the current holder sees the exchange
//! and flips once per hop. Status starts `Active` and ends in `Done` or
//! `Error`.
//!
//! ## Message slots
//!
//! | Pattern         | in | out | fault |
//! |-----------------|----|-----|-------|
//! | InOnly          | ✓  |     |       |
//! | RobustInOnly    | ✓  |     |       |
//! | InOut           | ✓  | ✓   | ✓     |
//! | InOptionalOut   | ✓  | ✓   | ✓     |
//!
//! Slots are created lazily on first access; illegal slots stay empty.

use crate::endpoint::InternalEndpoint;
use crate::reference::Reference;
use crate::{Message, NmrError, NmrResult};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Message exchange pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    InOnly,
    RobustInOnly,
    InOut,
    InOptionalOut,
}

impl Pattern {
    /// Whether this pattern carries the given message slot
    pub fn allows(self, message: MessageType) -> bool {
        match (self, message) {
            (_, MessageType::In) => true,
            (Pattern::InOnly | Pattern::RobustInOnly, _) => false,
            (Pattern::InOut | Pattern::InOptionalOut, _) => true,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Pattern::InOnly => "InOnly",
            Pattern::RobustInOnly => "RobustInOnly",
            Pattern::InOut => "InOut",
            Pattern::InOptionalOut => "InOptionalOut",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Message slot of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    In,
    Out,
    Fault,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::In => "in",
            MessageType::Out => "out",
            MessageType::Fault => "fault",
        })
    }
}

/// Point of view of the current holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Consumer => Role::Provider,
            Role::Provider => Role::Consumer,
        }
    }
}

/// Exchange status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Active,
    Done,
    Error,
}

struct ExchangeState {
    role: Role,
    status: Status,
    target: Option<Arc<dyn Reference>>,
    source: Option<Arc<InternalEndpoint>>,
    destination: Option<Arc<InternalEndpoint>>,
    operation: Option<String>,
    properties: Option<HashMap<String, Value>>,
    error: Option<NmrError>,
}

/// Zero-permit gate a `send_sync` caller parks on until the exchange returns
#[derive(Debug)]
pub(crate) struct Rendezvous {
    permits: Semaphore,
    /// Set while a `send_sync` caller is parked on this gate
    waiting: AtomicBool,
}

impl Rendezvous {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            waiting: AtomicBool::new(false),
        }
    }

    /// Mark a live waiter until the returned guard drops
    pub(crate) fn arm(&self) -> Waiting<'_> {
        self.waiting.store(true, Ordering::SeqCst);
        Waiting(self)
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for one permit; `false` if the gate was closed
    pub(crate) async fn wait(&self) -> bool {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Hand out one permit, returning whether a waiter was parked
    pub(crate) fn release(&self) -> bool {
        let waiting = self.is_waiting();
        self.permits.add_permits(1);
        waiting
    }

    pub(crate) fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Clears the waiter mark of a [`Rendezvous`] on drop
pub(crate) struct Waiting<'a>(&'a Rendezvous);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.waiting.store(false, Ordering::SeqCst);
    }
}

/// Unit of routable work shared by consumer and provider
pub struct Exchange {
    id: String,
    pattern: Pattern,
    state: Mutex<ExchangeState>,
    in_message: Mutex<Option<Message>>,
    out_message: Mutex<Option<Message>>,
    fault_message: Mutex<Option<Message>>,
    consumer_lock: Mutex<Option<Arc<Rendezvous>>>,
    provider_lock: Mutex<Option<Arc<Rendezvous>>>,
}

impl Exchange {
    /// Create an active exchange seen from the consumer side
    pub fn new(pattern: Pattern) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern,
            state: Mutex::new(ExchangeState {
                role: Role::Consumer,
                status: Status::Active,
                target: None,
                source: None,
                destination: None,
                operation: None,
                properties: None,
                error: None,
            }),
            in_message: Mutex::new(None),
            out_message: Mutex::new(None),
            fault_message: Mutex::new(None),
            consumer_lock: Mutex::new(None),
            provider_lock: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Flip the role, returning the new one
    pub(crate) fn flip_role(&self) -> Role {
        let mut state = self.state.lock();
        state.role = state.role.opposite();
        state.role
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }

    pub fn error(&self) -> Option<NmrError> {
        self.state.lock().error.clone()
    }

    /// Record a failure; also moves the exchange to [`Status::Error`]
    pub fn set_error(&self, error: NmrError) {
        let mut state = self.state.lock();
        state.error = Some(error);
        state.status = Status::Error;
    }

    pub fn target(&self) -> Option<Arc<dyn Reference>> {
        self.state.lock().target.clone()
    }

    pub fn set_target(&self, target: Arc<dyn Reference>) {
        self.state.lock().target = Some(target);
    }

    pub fn source(&self) -> Option<Arc<InternalEndpoint>> {
        self.state.lock().source.clone()
    }

    /// First write wins; returns false if a source was already set
    pub(crate) fn set_source(&self, endpoint: Arc<InternalEndpoint>) -> bool {
        let mut state = self.state.lock();
        if state.source.is_some() {
            return false;
        }
        state.source = Some(endpoint);
        true
    }

    pub fn destination(&self) -> Option<Arc<InternalEndpoint>> {
        self.state.lock().destination.clone()
    }

    /// First write wins; returns false if a destination was already set
    pub(crate) fn set_destination(&self, endpoint: Arc<InternalEndpoint>) -> bool {
        let mut state = self.state.lock();
        if state.destination.is_some() {
            return false;
        }
        state.destination = Some(endpoint);
        true
    }

    pub fn operation(&self) -> Option<String> {
        self.state.lock().operation.clone()
    }

    pub fn set_operation(&self, operation: impl Into<String>) {
        self.state.lock().operation = Some(operation.into());
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .properties
            .as_ref()
            .and_then(|props| props.get(name).cloned())
    }

    /// Set a property, returning the previous value
    pub fn set_property(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.state
            .lock()
            .properties
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into())
    }

    pub fn remove_property(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .properties
            .as_mut()
            .and_then(|props| props.remove(name))
    }

    /// Snapshot of all properties
    pub fn properties(&self) -> HashMap<String, Value> {
        self.state.lock().properties.clone().unwrap_or_default()
    }

    fn slot(&self, message: MessageType) -> &Mutex<Option<Message>> {
        match message {
            MessageType::In => &self.in_message,
            MessageType::Out => &self.out_message,
            MessageType::Fault => &self.fault_message,
        }
    }

    /// Access a message slot, creating the message on first access
    ///
    /// Returns `None` when the pattern does not allow the slot. The guard
    /// must not be held across an `.await`.
    pub fn message(&self, message: MessageType) -> Option<MappedMutexGuard<'_, Message>> {
        if !self.pattern.allows(message) {
            return None;
        }
        let guard = self.slot(message).lock();
        Some(MutexGuard::map(guard, |slot| slot.get_or_insert_with(Message::new)))
    }

    /// The in message; every pattern carries one
    pub fn in_message(&self) -> MappedMutexGuard<'_, Message> {
        let guard = self.in_message.lock();
        MutexGuard::map(guard, |slot| slot.get_or_insert_with(Message::new))
    }

    pub fn out_message(&self) -> Option<MappedMutexGuard<'_, Message>> {
        self.message(MessageType::Out)
    }

    pub fn fault_message(&self) -> Option<MappedMutexGuard<'_, Message>> {
        self.message(MessageType::Fault)
    }

    /// Whether a slot holds a message, without creating it
    pub fn has_message(&self, message: MessageType) -> bool {
        self.slot(message).lock().is_some()
    }

    /// Replace a slot's content
    pub fn set_message(&self, message_type: MessageType, message: Message) -> NmrResult<()> {
        if !self.pattern.allows(message_type) {
            return Err(NmrError::IllegalMessage {
                pattern: self.pattern.to_string(),
                message: message_type.to_string(),
            });
        }
        *self.slot(message_type).lock() = Some(message);
        Ok(())
    }

    /// Remove and return a slot's content
    pub fn take_message(&self, message: MessageType) -> Option<Message> {
        self.slot(message).lock().take()
    }

    /// Rendezvous lock for `role`, without creating it
    pub(crate) fn rendezvous(&self, role: Role) -> Option<Arc<Rendezvous>> {
        self.rendezvous_slot(role).lock().clone()
    }

    /// Rendezvous lock for `role`, created with zero permits if absent
    pub(crate) fn ensure_rendezvous(&self, role: Role) -> Arc<Rendezvous> {
        self.rendezvous_slot(role)
            .lock()
            .get_or_insert_with(|| Arc::new(Rendezvous::new()))
            .clone()
    }

    fn rendezvous_slot(&self, role: Role) -> &Mutex<Option<Arc<Rendezvous>>> {
        match role {
            Role::Consumer => &self.consumer_lock,
            Role::Provider => &self.provider_lock,
        }
    }

    /// New exchange with a fresh id and copies of the messages
    ///
    /// Routing state (source, destination, rendezvous locks) is not copied.
    pub fn copy(&self) -> Exchange {
        let copy = Exchange::new(self.pattern);
        {
            let state = self.state.lock();
            let mut target = copy.state.lock();
            target.role = state.role;
            target.status = state.status;
            target.target = state.target.clone();
            target.operation = state.operation.clone();
            target.properties = state.properties.clone();
            target.error = state.error.clone();
        }
        for message in [MessageType::In, MessageType::Out, MessageType::Fault] {
            if let Some(msg) = self.slot(message).lock().as_ref() {
                *copy.slot(message).lock() = Some(msg.copy());
            }
        }
        copy
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("role", &state.role)
            .field("status", &state.status)
            .field("operation", &state.operation)
            .field("source", &state.source.as_ref().map(|e| e.id().to_string()))
            .field(
                "destination",
                &state.destination.as_ref().map(|e| e.id().to_string()),
            )
            .field("error", &state.error)
            .finish()
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "[id: {}, pattern: {}, role: {:?}, status: {:?}",
            self.id, self.pattern, state.role, state.status
        )?;
        if let Some(operation) = &state.operation {
            write!(f, ", operation: {}", operation)?;
        }
        if let Some(source) = &state.source {
            write!(f, ", source: {}", source.id())?;
        }
        if let Some(destination) = &state.destination {
            write!(f, ", destination: {}", destination.id())?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_exchange_defaults() {
        let exchange = Exchange::new(Pattern::InOut);
        assert_eq!(exchange.role(), Role::Consumer);
        assert_eq!(exchange.status(), Status::Active);
        assert!(exchange.target().is_none());
        assert!(exchange.source().is_none());
        assert!(exchange.destination().is_none());
        assert!(exchange.properties().is_empty());
        assert_ne!(exchange.id(), Exchange::new(Pattern::InOut).id());
    }

    #[test]
    fn test_slot_table() {
        for pattern in [Pattern::InOnly, Pattern::RobustInOnly] {
            let exchange = Exchange::new(pattern);
            assert!(exchange.out_message().is_none());
            assert!(exchange.fault_message().is_none());
            assert!(!exchange.has_message(MessageType::Out));
            assert!(matches!(
                exchange.set_message(MessageType::Out, Message::new()),
                Err(NmrError::IllegalMessage { .. })
            ));
        }

        for pattern in [Pattern::InOut, Pattern::InOptionalOut] {
            let exchange = Exchange::new(pattern);
            assert!(!exchange.has_message(MessageType::Out));
            exchange.out_message().unwrap().set_body("pong");
            assert!(exchange.has_message(MessageType::Out));
            assert!(exchange.fault_message().is_some());
        }
    }

    #[test]
    fn test_in_message_created_lazily() {
        let exchange = Exchange::new(Pattern::InOnly);
        assert!(!exchange.has_message(MessageType::In));
        exchange.in_message().set_body(json!({"n": 1}));
        assert!(exchange.has_message(MessageType::In));
        assert_eq!(
            *exchange.in_message().body().unwrap(),
            json!({"n": 1})
        );
    }

    #[test]
    fn test_role_flip_and_error() {
        let exchange = Exchange::new(Pattern::InOut);
        assert_eq!(exchange.flip_role(), Role::Provider);
        assert_eq!(exchange.flip_role(), Role::Consumer);

        exchange.set_error(NmrError::Interrupted(exchange.id().to_string()));
        assert_eq!(exchange.status(), Status::Error);
        assert!(matches!(exchange.error(), Some(NmrError::Interrupted(_))));
    }

    #[test]
    fn test_properties_lazily_allocated() {
        let exchange = Exchange::new(Pattern::InOnly);
        assert!(exchange.remove_property("missing").is_none());
        assert!(exchange.set_property("k", "v").is_none());
        assert_eq!(exchange.set_property("k", "w"), Some(json!("v")));
        assert_eq!(exchange.property("k"), Some(json!("w")));
        assert_eq!(exchange.properties().len(), 1);
    }

    #[test]
    fn test_rendezvous_existence_check_does_not_create() {
        let exchange = Exchange::new(Pattern::InOut);
        assert!(exchange.rendezvous(Role::Consumer).is_none());

        let lock = exchange.ensure_rendezvous(Role::Consumer);
        assert_eq!(lock.available_permits(), 0);
        assert!(Arc::ptr_eq(
            &lock,
            &exchange.rendezvous(Role::Consumer).unwrap()
        ));
        assert!(exchange.rendezvous(Role::Provider).is_none());
    }

    #[test]
    fn test_rendezvous_waiter_mark_follows_guard() {
        let exchange = Exchange::new(Pattern::InOut);
        let lock = exchange.ensure_rendezvous(Role::Consumer);
        assert!(!lock.is_waiting());

        {
            let _waiting = lock.arm();
            assert!(lock.is_waiting());
            assert!(lock.release());
        }
        assert!(!lock.is_waiting());
        assert!(!lock.release());
        assert_eq!(lock.available_permits(), 2);
    }

    #[test]
    fn test_copy_is_independent() {
        let exchange = Exchange::new(Pattern::InOut);
        exchange.in_message().set_body("ping");
        exchange.in_message().set_header("h", 1);
        exchange.set_operation("echo");
        exchange.ensure_rendezvous(Role::Consumer);

        let copy = exchange.copy();
        assert_ne!(copy.id(), exchange.id());
        assert_eq!(copy.operation().as_deref(), Some("echo"));
        assert!(copy.rendezvous(Role::Consumer).is_none());

        copy.in_message().set_header("h", 2);
        assert_eq!(exchange.in_message().header("h"), Some(&json!(1)));
        assert_eq!(*copy.in_message().body().unwrap(), json!("ping"));
    }

    #[test]
    fn test_display() {
        let exchange = Exchange::new(Pattern::RobustInOnly);
        exchange.set_operation("notify");
        let text = exchange.to_string();
        assert!(text.contains("RobustInOnly"));
        assert!(text.contains("operation: notify"));
        assert!(text.starts_with(&format!("[id: {}", exchange.id())));
    }
}
