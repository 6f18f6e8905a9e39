//! # Channels
//!
//! A [`Channel`] is the gateway between one endpoint and the router. Every
//! registered endpoint owns exactly one; client code gets a standalone one
//! from [`Nmr::create_channel`](crate::Nmr::create_channel).
//!
//! ## Hops
//!
//! ```text
//!   consumer channel                               provider channel
//!   ───────────────                                ───────────────
//!   send / send_sync ─▶ flows.dispatch ─▶ deliver ─▶ pool.submit(process)
//!                                                     set destination
//!                                                     flip role
//!                                                     endpoint.process()
//!   deliver ◀─ flows.dispatch ◀─ send ◀──────────────  (reply)
//!     │
//!     ├─ consumer waiting in send_sync? release its rendezvous permit
//!     └─ otherwise pool.submit(process) on the consumer's own pool
//! ```
//!
//! ## Rendezvous
//!
//! `send_sync` parks on a zero-permit semaphore stored on the exchange under
//! the sender's role. When the exchange comes back, `deliver` sees that the
//! lock for the opposite role of the arriving exchange exists and releases a
//! single permit instead of invoking an endpoint. The lock outlives the wait,
//! so an exchange re-sent after its round trip is swallowed on return; that
//! case is logged at debug level. A single `deliver` call
//! therefore either wakes a waiter or schedules `process`, never both.
//!
//! Closing a channel rejects further sends and new process tasks and
//! interrupts `send_sync` callers blocked on it. Tasks already accepted by
//! the pool run to completion.

use crate::endpoint::InternalEndpoint;
use crate::executor::WorkerPool;
use crate::router::NmrInner;
use crate::{Exchange, NmrError, NmrResult, Pattern};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Per-channel counters
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// `send` and `send_sync` calls accepted by an open channel
    pub sent: AtomicU64,
    /// Subset of `sent` that waited for the return leg
    pub sync_sent: AtomicU64,
    /// Process tasks handed to the worker pool
    pub deliveries: AtomicU64,
    /// Rendezvous permits released on return legs
    pub wakeups: AtomicU64,
    /// Endpoint `process` calls that returned `Ok`
    pub processed: AtomicU64,
    /// Endpoint `process` calls that returned an error
    pub failures: AtomicU64,
    /// `send_sync_timeout` waits that ran out
    pub timeouts: AtomicU64,
    /// Dispatches or deliveries refused with an error
    pub rejected: AtomicU64,
}

impl ChannelMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`ChannelMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// `send` and `send_sync` calls that reached dispatch
    pub sent: u64,
    pub sync_sent: u64,
    /// Process tasks accepted by this channel's pool
    pub deliveries: u64,
    /// Return legs that released a waiting `send_sync`
    pub wakeups: u64,
    pub processed: u64,
    /// Endpoint `process` calls that returned an error
    pub failures: u64,
    pub timeouts: u64,
    /// Dispatches that failed (routing errors, full queues)
    pub rejected: u64,
    pub in_flight: usize,
}

pub(crate) struct ChannelCore {
    id: String,
    endpoint: Weak<InternalEndpoint>,
    nmr: Weak<NmrInner>,
    pool: WorkerPool,
    closed: watch::Sender<bool>,
    metrics: ChannelMetrics,
}

impl ChannelCore {
    pub(crate) fn new(
        id: String,
        endpoint: Weak<InternalEndpoint>,
        nmr: Weak<NmrInner>,
        pool: WorkerPool,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            endpoint,
            nmr,
            pool,
            closed,
            metrics: ChannelMetrics::default(),
        }
    }
}

enum Wakeup {
    Released,
    TimedOut(Duration),
    Interrupted,
}

/// Endpoint gateway for sending and receiving exchanges
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
    /// Keeps a client wrapper alive; registered wrappers are owned by the
    /// registry instead
    anchor: Option<Arc<InternalEndpoint>>,
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        Self { core, anchor: None }
    }

    pub(crate) fn anchored(endpoint: Arc<InternalEndpoint>) -> Self {
        Self {
            core: endpoint.channel().core.clone(),
            anchor: Some(endpoint),
        }
    }

    /// Id of the owning endpoint
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Endpoint this channel belongs to, if it is still alive
    pub fn endpoint(&self) -> Option<Arc<InternalEndpoint>> {
        match &self.anchor {
            Some(endpoint) => Some(endpoint.clone()),
            None => self.core.endpoint.upgrade(),
        }
    }

    /// New active exchange seen from the consumer side
    pub fn create_exchange(&self, pattern: Pattern) -> Arc<Exchange> {
        Arc::new(Exchange::new(pattern))
    }

    /// Dispatch without waiting for the other side
    pub fn send(&self, exchange: &Arc<Exchange>) -> NmrResult<()> {
        self.ensure_open()?;
        ChannelMetrics::incr(&self.core.metrics.sent);
        self.dispatch(exchange)
    }

    /// Dispatch and wait until the exchange comes back
    ///
    /// Returns `Ok(false)` (with the exchange marked as failed) if the wait
    /// is interrupted by closing this channel.
    pub async fn send_sync(&self, exchange: &Arc<Exchange>) -> NmrResult<bool> {
        self.sync_send(exchange, None).await
    }

    /// Like [`send_sync`](Self::send_sync), giving up after `timeout`
    pub async fn send_sync_timeout(
        &self,
        exchange: &Arc<Exchange>,
        timeout: Duration,
    ) -> NmrResult<bool> {
        self.sync_send(exchange, Some(timeout)).await
    }

    async fn sync_send(&self, exchange: &Arc<Exchange>, timeout: Option<Duration>) -> NmrResult<bool> {
        self.ensure_open()?;
        let lock = exchange.ensure_rendezvous(exchange.role());
        let _waiting = lock.arm();
        let mut closed = self.core.closed.subscribe();

        ChannelMetrics::incr(&self.core.metrics.sent);
        ChannelMetrics::incr(&self.core.metrics.sync_sent);
        self.dispatch(exchange)?;

        let wait = async {
            tokio::select! {
                released = lock.wait() => if released {
                    Wakeup::Released
                } else {
                    Wakeup::Interrupted
                },
                _ = closed.wait_for(|closed| *closed) => Wakeup::Interrupted,
            }
        };

        let wakeup = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .unwrap_or(Wakeup::TimedOut(limit)),
            None => wait.await,
        };

        match wakeup {
            Wakeup::Released => {
                exchange.flip_role();
                Ok(true)
            }
            Wakeup::TimedOut(limit) => {
                warn!(channel = %self.core.id, exchange_id = %exchange.id(), timeout = ?limit, "send_sync timed out");
                ChannelMetrics::incr(&self.core.metrics.timeouts);
                exchange.set_error(NmrError::Timeout {
                    exchange_id: exchange.id().to_string(),
                    timeout: limit,
                });
                Ok(false)
            }
            Wakeup::Interrupted => {
                warn!(channel = %self.core.id, exchange_id = %exchange.id(), "send_sync interrupted by channel close");
                exchange.set_error(NmrError::Interrupted(exchange.id().to_string()));
                Ok(false)
            }
        }
    }

    fn dispatch(&self, exchange: &Arc<Exchange>) -> NmrResult<()> {
        let nmr = self.core.nmr.upgrade().ok_or(NmrError::Shutdown)?;
        if nmr.is_shut_down() {
            return Err(NmrError::Shutdown);
        }

        if let Some(me) = self.endpoint() {
            exchange.set_source(me);
        }
        nmr.listeners.exchange_sent(exchange);
        debug!(channel = %self.core.id, exchange_id = %exchange.id(), role = ?exchange.role(), "Dispatching exchange");

        if let Err(e) = nmr.flows.dispatch(exchange, &nmr.endpoints) {
            warn!(channel = %self.core.id, exchange_id = %exchange.id(), error = %e, "Dispatch failed");
            ChannelMetrics::incr(&self.core.metrics.rejected);
            nmr.listeners.exchange_failed(exchange);
            return Err(e);
        }
        Ok(())
    }

    /// Hand an arriving exchange to this channel
    ///
    /// Wakes the `send_sync` caller waiting for it if there is one,
    /// otherwise schedules the endpoint's `process` on this channel's pool.
    pub fn deliver(&self, exchange: &Arc<Exchange>) -> NmrResult<()> {
        let waiting = exchange.role().opposite();
        if let Some(lock) = exchange.rendezvous(waiting) {
            if !lock.release() {
                debug!(
                    channel = %self.core.id,
                    exchange_id = %exchange.id(),
                    "No send_sync waiting, dropping returned exchange (sent twice or wait abandoned)"
                );
            }
            ChannelMetrics::incr(&self.core.metrics.wakeups);
            return Ok(());
        }

        let endpoint = self
            .endpoint()
            .ok_or_else(|| NmrError::ChannelClosed(self.core.id.clone()))?;
        let core = self.core.clone();
        let task = process(core, endpoint, exchange.clone());

        if let Err(e) = self.core.pool.submit(task) {
            ChannelMetrics::incr(&self.core.metrics.rejected);
            return Err(e);
        }
        ChannelMetrics::incr(&self.core.metrics.deliveries);
        Ok(())
    }

    /// Reject further work and interrupt blocked `send_sync` callers
    pub fn close(&self) {
        if !self.core.closed.send_replace(true) {
            debug!(channel = %self.core.id, "Channel closed");
        }
        self.core.pool.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        *self.core.closed.borrow()
    }

    fn ensure_open(&self) -> NmrResult<()> {
        if self.is_closed() {
            return Err(NmrError::ChannelClosed(self.core.id.clone()));
        }
        Ok(())
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.core.metrics
    }

    pub fn stats(&self) -> ChannelStats {
        let m = &self.core.metrics;
        ChannelStats {
            sent: m.sent.load(Ordering::Relaxed),
            sync_sent: m.sync_sent.load(Ordering::Relaxed),
            deliveries: m.deliveries.load(Ordering::Relaxed),
            wakeups: m.wakeups.load(Ordering::Relaxed),
            processed: m.processed.load(Ordering::Relaxed),
            failures: m.failures.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            rejected: m.rejected.load(Ordering::Relaxed),
            in_flight: self.core.pool.in_flight(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("closed", &self.is_closed())
            .field("client", &self.anchor.is_some())
            .finish()
    }
}

/// Forward leg on the receiving endpoint's pool
async fn process(core: Arc<ChannelCore>, endpoint: Arc<InternalEndpoint>, exchange: Arc<Exchange>) {
    exchange.set_destination(endpoint.clone());
    let nmr = core.nmr.upgrade();
    if let Some(nmr) = &nmr {
        nmr.listeners.exchange_delivered(&exchange);
    }

    let role = exchange.flip_role();
    debug!(endpoint = %endpoint.id(), exchange_id = %exchange.id(), role = ?role, "Processing exchange");

    match endpoint.endpoint().process(exchange.clone()).await {
        Ok(()) => ChannelMetrics::incr(&core.metrics.processed),
        Err(e) => {
            error!(endpoint = %endpoint.id(), exchange_id = %exchange.id(), error = %e, "Endpoint failed to process exchange");
            ChannelMetrics::incr(&core.metrics.failures);
            exchange.set_error(e);
            if let Some(nmr) = &nmr {
                nmr.listeners.exchange_failed(&exchange);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::{Endpoint, Role, Status};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Recorder {
        seen: mpsc::UnboundedSender<(String, Role)>,
        fail: bool,
    }

    #[async_trait]
    impl Endpoint for Recorder {
        fn set_channel(&self, _channel: Channel) {}

        async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()> {
            let _ = self.seen.send((exchange.id().to_string(), exchange.role()));
            if self.fail {
                return Err(NmrError::illegal_state("refused"));
            }
            Ok(())
        }
    }

    fn detached(fail: bool) -> (Arc<InternalEndpoint>, mpsc::UnboundedReceiver<(String, Role)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint: Arc<dyn Endpoint> = Arc::new(Recorder { seen: tx, fail });
        let config = ExecutorConfig {
            workers: 2,
            queue_capacity: 4,
        };
        (InternalEndpoint::new(endpoint, Weak::new(), &config), rx)
    }

    #[tokio::test]
    async fn test_forward_leg_schedules_process() {
        let (wrapper, mut rx) = detached(false);
        let exchange = wrapper.channel().create_exchange(Pattern::InOut);

        wrapper.channel().deliver(&exchange).unwrap();

        let (id, role) = rx.recv().await.unwrap();
        assert_eq!(id, exchange.id());
        assert_eq!(role, Role::Provider);
        assert!(Arc::ptr_eq(&exchange.destination().unwrap(), &wrapper));
        assert_eq!(wrapper.channel().stats().deliveries, 1);
    }

    #[tokio::test]
    async fn test_return_leg_only_releases_lock() {
        let (wrapper, mut rx) = detached(false);
        let exchange = wrapper.channel().create_exchange(Pattern::InOut);

        // consumer waiting, exchange arrives back in provider role
        let lock = exchange.ensure_rendezvous(Role::Consumer);
        let _waiting = lock.arm();
        exchange.flip_role();
        wrapper.channel().deliver(&exchange).unwrap();

        assert_eq!(lock.available_permits(), 1);
        assert!(rx.try_recv().is_err());
        let stats = wrapper.channel().stats();
        assert_eq!((stats.wakeups, stats.deliveries), (1, 0));
    }

    #[tokio::test]
    async fn test_failed_process_marks_exchange() {
        let (wrapper, mut rx) = detached(true);
        let exchange = wrapper.channel().create_exchange(Pattern::InOnly);

        wrapper.channel().deliver(&exchange).unwrap();
        rx.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while exchange.status() != Status::Error {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(exchange.error(), Some(NmrError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_work() {
        let (wrapper, _rx) = detached(false);
        let channel = wrapper.channel().clone();
        let exchange = channel.create_exchange(Pattern::InOnly);

        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(channel.send(&exchange), Err(NmrError::ChannelClosed(_))));
        assert!(matches!(
            channel.send_sync(&exchange).await,
            Err(NmrError::ChannelClosed(_))
        ));
        assert!(matches!(channel.deliver(&exchange), Err(NmrError::ChannelClosed(_))));
        assert_eq!(channel.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_send_without_router_fails() {
        let (wrapper, _rx) = detached(false);
        let exchange = wrapper.channel().create_exchange(Pattern::InOnly);
        assert_eq!(wrapper.channel().send(&exchange), Err(NmrError::Shutdown));
    }
}
