//! Connection pool.
//!
//! All bookkeeping (idle slots, waiters, in-progress connects) lives in one
//! pool task; handles and connection hooks talk to it through its inbox.
//!
//! Two strategies share the same waiter discipline:
//! - `Exclusive`: up to `max_size` physical connections, each checked out by
//!   one caller at a time. Waiters are served in strict FIFO order.
//! - `Shared`: one physical connection created on first use and shared by
//!   every caller. Releasing is a no-op; when the connection closes, every
//!   holder is told and the next acquire reconnects.
//!
//! The pool task also runs the timers: a cleaner that closes connections
//! idle for longer than `idle_timeout`, and per-waiter deadlines that fail
//! an acquire still unserved after `connection_timeout`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, Holder};
use crate::error::{Error, Result};

// ============================================================================
// Factory
// ============================================================================

/// Creates fully handshaken connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Poolable;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// What the pool needs from a connection.
#[async_trait]
pub trait Poolable: Send + Sync + 'static {
    /// Install the holder that receives the connection's events and close.
    fn set_holder(&self, holder: Option<Arc<dyn Holder>>);

    fn is_open(&self) -> bool;

    async fn close(&self);
}

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection sharing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStrategy {
    #[default]
    Exclusive,
    Shared,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Maximum number of physical connections
    pub max_size: usize,
    /// Maximum number of callers allowed to wait (`None` = unbounded)
    pub max_wait_queue_size: Option<usize>,
    /// Sharing strategy
    pub strategy: PoolStrategy,
    /// Close connections left idle this long (`None` = keep them)
    #[serde(rename = "idle_timeout_ms", deserialize_with = "optional_millis")]
    pub idle_timeout: Option<Duration>,
    /// How often idle connections are checked against `idle_timeout`
    #[serde(rename = "cleaner_period_ms", deserialize_with = "millis")]
    pub cleaner_period: Duration,
    /// Fail an acquire not served within this long (`None` = wait forever)
    #[serde(rename = "connection_timeout_ms", deserialize_with = "optional_millis")]
    pub connection_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 4,
            max_wait_queue_size: None,
            strategy: PoolStrategy::Exclusive,
            idle_timeout: None,
            cleaner_period: Duration::from_millis(1000),
            connection_timeout: Some(Duration::from_secs(30)),
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn optional_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

impl PoolOptions {
    /// Set the maximum number of connections.
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Bound the wait queue. Callers beyond it fail immediately.
    pub fn max_wait_queue_size(mut self, max: usize) -> Self {
        self.max_wait_queue_size = Some(max);
        self
    }

    /// Set the sharing strategy.
    pub fn strategy(mut self, strategy: PoolStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Close connections that stay idle for `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn cleaner_period(mut self, period: Duration) -> Self {
        self.cleaner_period = period;
        self
    }

    /// Bound how long an acquire may wait; `None` waits forever.
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be greater than 0".to_string()));
        }
        if self.cleaner_period.is_zero() {
            return Err(Error::Config(
                "cleaner_period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of the pool's bookkeeping.
///
/// `idle + checked_out == size` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub connecting: usize,
    pub waiters: usize,
}

type SlotId = u64;
type LeaseId = u64;
type Waiter<T> = oneshot::Sender<Result<PooledConnection<T>>>;

struct Queued<T: Poolable> {
    reply: Waiter<T>,
    deadline: Option<Instant>,
}

enum PoolRequest<T: Poolable> {
    Acquire(Waiter<T>),
    Release { slot: SlotId, lease: LeaseId },
    Connected(Result<T>),
    Closed(SlotId),
    Close(oneshot::Sender<()>),
    Status(oneshot::Sender<PoolStatus>),
}

// ============================================================================
// Pool Handle
// ============================================================================

/// Handle to a connection pool. Cheap to clone.
pub struct Pool<F: ConnectionFactory> {
    inbox: mpsc::UnboundedSender<PoolRequest<F::Connection>>,
    options: PoolOptions,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            options: self.options.clone(),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool. No connection is opened until the first acquire.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(factory: F, options: PoolOptions) -> Result<Self> {
        options.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PoolWorker {
            factory: Arc::new(factory),
            options: options.clone(),
            inbox: rx,
            handle: tx.downgrade(),
            slots: HashMap::new(),
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            connecting: 0,
            next_id: 0,
            closed: false,
        };
        tokio::spawn(worker.run());

        Ok(Self { inbox: tx, options })
    }

    /// Check out a connection.
    ///
    /// The request is queued when this is called, so the order of `acquire`
    /// calls is the order in which waiters are served.
    pub fn acquire(
        &self,
    ) -> impl Future<Output = Result<PooledConnection<F::Connection>>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self.inbox.send(PoolRequest::Acquire(tx)).is_ok();
        async move {
            if !sent {
                return Err(Error::PoolClosed);
            }
            rx.await.unwrap_or(Err(Error::PoolClosed))
        }
    }

    /// Give a connection back. Same as dropping it.
    pub fn release(&self, connection: PooledConnection<F::Connection>) {
        connection.release();
    }

    /// Fail all waiters and close every physical connection once.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(PoolRequest::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(PoolRequest::Status(tx)).is_err() {
            return PoolStatus::default();
        }
        rx.await.unwrap_or_default()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool and any holder
/// installed through it is removed.
pub struct PooledConnection<T: Poolable> {
    conn: Arc<T>,
    hooks: Arc<SlotHooks<T>>,
    slot: SlotId,
    lease: LeaseId,
    pool: mpsc::WeakUnboundedSender<PoolRequest<T>>,
    armed: bool,
}

impl<T: Poolable> PooledConnection<T> {
    /// Receive this connection's events and close notification while it is
    /// checked out.
    pub fn set_holder(&self, holder: Arc<dyn Holder>) {
        self.hooks.set_owner(self.lease, holder);
    }

    pub fn clear_holder(&self) {
        self.hooks.remove_owner(self.lease);
    }

    /// The underlying connection, for use beyond this checkout.
    pub fn connection(&self) -> &Arc<T> {
        &self.conn
    }

    pub fn release(self) {}

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Poolable> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T: Poolable> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.hooks.remove_owner(self.lease);
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.send(PoolRequest::Release {
                slot: self.slot,
                lease: self.lease,
            });
        }
    }
}

// ============================================================================
// Slot Hooks
// ============================================================================

/// Holder installed on every pooled connection.
///
/// Forwards events to whoever has the connection checked out and reports
/// the close back to the pool.
struct SlotHooks<T: Poolable> {
    slot: SlotId,
    pool: mpsc::WeakUnboundedSender<PoolRequest<T>>,
    owners: Mutex<Vec<(LeaseId, Arc<dyn Holder>)>>,
}

impl<T: Poolable> SlotHooks<T> {
    fn set_owner(&self, lease: LeaseId, holder: Arc<dyn Holder>) {
        let mut owners = self.owners.lock();
        owners.retain(|(l, _)| *l != lease);
        owners.push((lease, holder));
    }

    fn remove_owner(&self, lease: LeaseId) {
        self.owners.lock().retain(|(l, _)| *l != lease);
    }

    fn owners(&self) -> Vec<Arc<dyn Holder>> {
        self.owners.lock().iter().map(|(_, h)| h.clone()).collect()
    }
}

impl<T: Poolable> Holder for SlotHooks<T> {
    fn handle_event(&self, event: ConnectionEvent) {
        for owner in self.owners() {
            owner.handle_event(event.clone());
        }
    }

    fn handle_closed(&self) {
        for owner in self.owners() {
            owner.handle_closed();
        }
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.send(PoolRequest::Closed(self.slot));
        }
    }

    fn handle_exception(&self, error: &Error) {
        for owner in self.owners() {
            owner.handle_exception(error);
        }
    }
}

// ============================================================================
// Pool Worker
// ============================================================================

struct Slot<T: Poolable> {
    conn: Arc<T>,
    hooks: Arc<SlotHooks<T>>,
    /// Exclusive checkout currently holding the slot
    lease: Option<LeaseId>,
    /// Number of shared checkouts
    holders: usize,
    /// Last time the slot went unused
    idle_since: Instant,
}

struct PoolWorker<F: ConnectionFactory> {
    factory: Arc<F>,
    options: PoolOptions,
    inbox: mpsc::UnboundedReceiver<PoolRequest<F::Connection>>,
    handle: mpsc::WeakUnboundedSender<PoolRequest<F::Connection>>,
    slots: HashMap<SlotId, Slot<F::Connection>>,
    available: VecDeque<SlotId>,
    waiters: VecDeque<Queued<F::Connection>>,
    connecting: usize,
    next_id: u64,
    closed: bool,
}

impl<F: ConnectionFactory> PoolWorker<F> {
    async fn run(mut self) {
        let mut cleaner = self.options.idle_timeout.map(|_| {
            let mut cleaner = tokio::time::interval(self.options.cleaner_period);
            cleaner.set_missed_tick_behavior(MissedTickBehavior::Delay);
            cleaner
        });

        loop {
            // Deadlines are uniform, so the oldest waiter expires first
            let deadline = self.waiters.front().and_then(|w| w.deadline);
            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = tick(&mut cleaner) => self.evict_idle(),
                _ = sleep_until(deadline) => self.expire_waiters(),
            }
        }
        debug!("all pool handles dropped");
    }

    fn handle(&mut self, request: PoolRequest<F::Connection>) {
        match request {
            PoolRequest::Acquire(waiter) => self.acquire(waiter),
            PoolRequest::Release { slot, lease } => self.release(slot, lease),
            PoolRequest::Connected(result) => self.connected(result),
            PoolRequest::Closed(slot) => self.slot_closed(slot),
            PoolRequest::Close(reply) => self.close(reply),
            PoolRequest::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn acquire(&mut self, waiter: Waiter<F::Connection>) {
        if self.closed {
            let _ = waiter.send(Err(Error::PoolClosed));
            return;
        }
        self.waiters.push_back(Queued {
            reply: waiter,
            deadline: self.options.connection_timeout.map(|t| Instant::now() + t),
        });
        self.dispatch();

        // Waiters backed by an in-progress connect are not queued
        if let Some(max) = self.options.max_wait_queue_size {
            if self.waiters.len().saturating_sub(self.connecting) > max {
                if let Some(rejected) = self.waiters.pop_back() {
                    debug!(max, "wait queue full, rejecting acquire");
                    let _ = rejected.reply.send(Err(Error::WaitQueueFull));
                }
            }
        }
    }

    fn dispatch(&mut self) {
        self.waiters.retain(|w| !w.reply.is_closed());
        match self.options.strategy {
            PoolStrategy::Exclusive => self.dispatch_exclusive(),
            PoolStrategy::Shared => self.dispatch_shared(),
        }
    }

    fn dispatch_exclusive(&mut self) {
        while !self.waiters.is_empty() {
            if let Some(id) = self.available.pop_front() {
                let alive = self.slots.get(&id).is_some_and(|s| s.conn.is_open());
                if !alive {
                    // Close notification still on its way
                    self.slots.remove(&id);
                    continue;
                }
                if let Some(waiter) = self.waiters.pop_front() {
                    self.hand_over(id, waiter.reply);
                }
                continue;
            }

            let live = self.slots.len() + self.connecting;
            if self.waiters.len() > self.connecting && live < self.options.max_size {
                self.spawn_connect();
                continue;
            }
            break;
        }
    }

    fn dispatch_shared(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        self.slots.retain(|_, s| s.conn.is_open());
        let shared = self.slots.keys().next().copied();
        match shared {
            Some(id) => {
                while let Some(waiter) = self.waiters.pop_front() {
                    self.hand_over(id, waiter.reply);
                }
            }
            None if self.connecting == 0 => self.spawn_connect(),
            None => {}
        }
    }

    fn hand_over(&mut self, id: SlotId, waiter: Waiter<F::Connection>) {
        let lease = self.next_id();
        let exclusive = self.options.strategy == PoolStrategy::Exclusive;
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };

        let handle = PooledConnection {
            conn: slot.conn.clone(),
            hooks: slot.hooks.clone(),
            slot: id,
            lease,
            pool: self.handle.clone(),
            armed: true,
        };
        if exclusive {
            slot.lease = Some(lease);
        } else {
            slot.holders += 1;
        }

        if let Err(Ok(mut handle)) = waiter.send(Ok(handle)) {
            // Caller gave up between the check and the send
            handle.disarm();
            if exclusive {
                slot.lease = None;
                self.available.push_front(id);
            } else {
                slot.holders -= 1;
            }
            slot.idle_since = Instant::now();
        }
    }

    fn spawn_connect(&mut self) {
        self.connecting += 1;
        let factory = self.factory.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = factory.connect().await;
            match handle.upgrade() {
                Some(pool) => {
                    let _ = pool.send(PoolRequest::Connected(result));
                }
                None => {
                    if let Ok(conn) = result {
                        conn.close().await;
                    }
                }
            }
        });
    }

    fn connected(&mut self, result: Result<F::Connection>) {
        self.connecting = self.connecting.saturating_sub(1);
        match result {
            Ok(conn) => {
                if self.closed {
                    tokio::spawn(async move { conn.close().await });
                    return;
                }
                let id = self.next_id();
                let conn = Arc::new(conn);
                let hooks = Arc::new(SlotHooks {
                    slot: id,
                    pool: self.handle.clone(),
                    owners: Mutex::new(Vec::new()),
                });
                conn.set_holder(Some(hooks.clone() as Arc<dyn Holder>));
                self.slots.insert(
                    id,
                    Slot {
                        conn,
                        hooks,
                        lease: None,
                        holders: 0,
                        idle_since: Instant::now(),
                    },
                );
                if self.options.strategy == PoolStrategy::Exclusive {
                    self.available.push_back(id);
                }
                debug!(slot = id, size = self.slots.len(), "pool connection opened");
            }
            Err(e) => {
                warn!(error = %e, "pool connection attempt failed");
                match self.options.strategy {
                    PoolStrategy::Exclusive => {
                        if let Some(waiter) = self.waiters.pop_front() {
                            let _ = waiter.reply.send(Err(e));
                        }
                    }
                    PoolStrategy::Shared => {
                        for waiter in self.waiters.drain(..) {
                            let _ = waiter.reply.send(Err(e.clone()));
                        }
                    }
                }
            }
        }
        self.dispatch();
    }

    fn release(&mut self, id: SlotId, lease: LeaseId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        match self.options.strategy {
            PoolStrategy::Shared => {
                slot.holders = slot.holders.saturating_sub(1);
                if slot.holders == 0 {
                    slot.idle_since = Instant::now();
                }
            }
            PoolStrategy::Exclusive => {
                if slot.lease != Some(lease) {
                    return;
                }
                slot.lease = None;
                slot.idle_since = Instant::now();
                if slot.conn.is_open() {
                    self.available.push_back(id);
                } else {
                    self.slots.remove(&id);
                }
                self.dispatch();
            }
        }
    }

    fn slot_closed(&mut self, id: SlotId) {
        if self.slots.remove(&id).is_some() {
            self.available.retain(|s| *s != id);
            debug!(slot = id, size = self.slots.len(), "pool connection closed");
        }
        self.dispatch();
    }

    fn close(&mut self, reply: oneshot::Sender<()>) {
        if self.closed {
            let _ = reply.send(());
            return;
        }
        self.closed = true;

        for waiter in self.waiters.drain(..) {
            let _ = waiter.reply.send(Err(Error::PoolClosed));
        }
        self.available.clear();
        let conns: Vec<_> = self.slots.drain().map(|(_, slot)| slot.conn).collect();
        info!(connections = conns.len(), "closing pool");

        tokio::spawn(async move {
            futures::future::join_all(conns.iter().map(|conn| conn.close())).await;
            let _ = reply.send(());
        });
    }

    /// Close every unused connection idle for at least `idle_timeout`.
    fn evict_idle(&mut self) {
        let Some(timeout) = self.options.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<SlotId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.lease.is_none() && s.holders == 0)
            .filter(|(_, s)| now.duration_since(s.idle_since) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(slot) = self.slots.remove(&id) else {
                continue;
            };
            self.available.retain(|s| *s != id);
            debug!(slot = id, size = self.slots.len(), "closing idle pool connection");
            slot.conn.set_holder(None);
            tokio::spawn(async move { slot.conn.close().await });
        }
    }

    fn expire_waiters(&mut self) {
        let now = Instant::now();
        while self
            .waiters
            .front()
            .is_some_and(|w| w.deadline.is_some_and(|d| d <= now))
        {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let timeout = self.options.connection_timeout.unwrap_or_default();
            debug!(?timeout, "acquire timed out");
            let _ = waiter.reply.send(Err(Error::AcquireTimeout(timeout)));
        }
    }

    fn status(&self) -> PoolStatus {
        let (idle, checked_out) = match self.options.strategy {
            PoolStrategy::Exclusive => (
                self.available.len(),
                self.slots.values().filter(|s| s.lease.is_some()).count(),
            ),
            PoolStrategy::Shared => {
                let busy = self.slots.values().filter(|s| s.holders > 0).count();
                (self.slots.len() - busy, busy)
            }
        };
        PoolStatus {
            size: self.slots.len(),
            idle,
            checked_out,
            connecting: self.connecting,
            waiters: self.waiters.len(),
        }
    }
}

async fn tick(cleaner: &mut Option<Interval>) {
    match cleaner {
        Some(cleaner) => {
            cleaner.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
