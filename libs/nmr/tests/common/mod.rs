//! Shared endpoints and helpers for router integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use nmr::{Channel, Endpoint, Exchange, Message, MessageType, NmrError, NmrResult, Properties, Role, Status};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn props(value: Value) -> Properties {
    serde_json::from_value(value).unwrap()
}

/// Replies to active exchanges with `out = "pong"` after an optional delay
#[derive(Default)]
pub struct Pong {
    channel: Mutex<Option<Channel>>,
    delay: Duration,
    pub roles: Mutex<Vec<Role>>,
}

impl Pong {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }
}

#[async_trait]
impl Endpoint for Pong {
    fn set_channel(&self, channel: Channel) {
        *self.channel.lock() = Some(channel);
    }

    async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()> {
        self.roles.lock().push(exchange.role());
        if exchange.status() != Status::Active {
            return Ok(());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| NmrError::illegal_state("no channel"))?;
        exchange.set_message(MessageType::Out, Message::with_body("pong"))?;
        channel.send(&exchange)
    }
}

/// Reports every processed exchange and optionally waits for a gate first
pub struct Recorder {
    pub gate: Option<Arc<Notify>>,
    pub fail: bool,
    seen: mpsc::UnboundedSender<Arc<Exchange>>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Exchange>>) {
        Self::build(None, false)
    }

    pub fn gated(gate: Arc<Notify>) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Exchange>>) {
        Self::build(Some(gate), false)
    }

    pub fn failing() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Exchange>>) {
        Self::build(None, true)
    }

    fn build(
        gate: Option<Arc<Notify>>,
        fail: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Exchange>>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { gate, fail, seen }), rx)
    }
}

#[async_trait]
impl Endpoint for Recorder {
    fn set_channel(&self, _channel: Channel) {}

    async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let _ = self.seen.send(exchange.clone());
        if self.fail {
            return Err(NmrError::illegal_state("recorder refused exchange"));
        }
        Ok(())
    }
}
