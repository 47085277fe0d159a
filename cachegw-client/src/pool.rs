//! # Connection Pool
//!
//! Purpose: Multiplex many concurrent gateway operations over a bounded set
//! of reusable backend connections.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a free set of connections and hand them
//!    out as exclusively-owned RAII handles.
//! 2. **Admission Control**: A fair semaphore caps outstanding handles at
//!    `max_connections`; waiters are served in FIFO order.
//! 3. **Minimal Locking**: The mutex guards only the free set and counters and
//!    is never held across an await point.
//! 4. **Never Reuse Suspect Connections**: A discarded connection is closed in
//!    the background and, capacity permitting, replaced.
//!
//! ## Handle Accounting
//!
//! ```text
//! borrow ──► permit ──► free set pop ──────────────► handle
//!                  └──► reserve live slot ─► connect ┘
//! release ─► free set push ─► permit dropped (next FIFO waiter wakes)
//! discard ─► close task ─► replacement task (if live < max)
//! drop    ─► same as discard, transport closed by its own drop
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cachegw_common::{BackendResult, ConfigError, PoolConfig, PoolError, PoolResult};

use crate::connection::{BackendConnection, Connector};

/// A live connection tagged with a pool-unique id.
struct Slot<T> {
    id: u64,
    conn: T,
}

struct PoolState<T> {
    /// Free set, oldest first.
    idle: VecDeque<Slot<T>>,
    /// Connections that exist or are being opened: idle + outstanding + connecting.
    live: usize,
    /// Handles currently borrowed.
    outstanding: usize,
    peak_outstanding: usize,
    /// Set once `drain` has swept the free set.
    drained: bool,
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    closed: AtomicU64,
    discarded: AtomicU64,
    saturated: AtomicU64,
    exhausted: AtomicU64,
    waiting: AtomicUsize,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<C::Connection>>,
    closed: AtomicBool,
    /// Signalled whenever a handle goes back, so `drain` can re-check.
    returned: Notify,
    /// Background closes and replacement connects.
    tasks: TaskTracker,
    next_id: AtomicU64,
    counters: PoolCounters,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: usize,
    pub outstanding: usize,
    /// Highest number of simultaneously outstanding handles ever observed.
    pub peak_outstanding: usize,
    pub idle: usize,
    pub live: usize,
    /// Borrowers currently queued for a permit.
    pub waiting: usize,
    pub opened: u64,
    pub closed: u64,
    pub discarded: u64,
    /// Borrows that found no free permit and had to queue.
    pub saturated: u64,
    /// Borrows that gave up after the acquisition timeout.
    pub exhausted: u64,
}

impl PoolStats {
    /// Fraction of the admission ceiling currently in use.
    pub fn saturation(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        self.outstanding as f64 / self.max_connections as f64
    }
}

/// Result of draining the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Free connections closed by the drain sweep.
    pub closed: usize,
}

/// Bounded, FIFO-fair connection pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        ConnectionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates an empty pool. Connections are opened lazily on borrow or by
    /// `warm_up`.
    pub fn new(connector: C, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.min_idle),
            live: 0,
            outstanding: 0,
            peak_outstanding: 0,
            drained: false,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections)),
                connector,
                config,
                state: Mutex::new(state),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
                tasks: TaskTracker::new(),
                next_id: AtomicU64::new(1),
                counters: PoolCounters::default(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Opens `min_idle` connections concurrently and adds them to the free set.
    ///
    /// Returns how many connections were opened. If any connect failed, the
    /// first error is returned once every attempt has finished; successful
    /// connections stay in the free set either way.
    pub async fn warm_up(&self) -> PoolResult<usize> {
        let target = self.inner.config.min_idle;
        if target == 0 {
            return Ok(0);
        }

        let mut connects = JoinSet::new();
        for _ in 0..target {
            if !self.inner.reserve_live() {
                break;
            }
            let inner = self.inner.clone();
            connects.spawn(async move { inner.open().await });
        }

        let mut opened = 0;
        let mut first_err = None;
        while let Some(joined) = connects.join_next().await {
            match joined {
                Ok(Ok(slot)) => {
                    self.inner.park(slot);
                    opened += 1;
                }
                Ok(Err(err)) => {
                    self.inner.unreserve_live();
                    first_err.get_or_insert(err);
                }
                Err(join_err) => {
                    self.inner.unreserve_live();
                    warn!(error = %join_err, "warm-up connect task failed");
                }
            }
        }

        match first_err {
            Some(err) => Err(PoolError::Connect(err)),
            None => {
                info!(opened, "connection pool warmed up");
                Ok(opened)
            }
        }
    }

    /// Opens one connection, checks it with a ping and keeps it in the free set.
    pub async fn preflight(&self) -> PoolResult<()> {
        if !self.inner.reserve_live() {
            return Ok(());
        }
        let mut slot = match self.inner.open().await {
            Ok(slot) => slot,
            Err(err) => {
                self.inner.unreserve_live();
                return Err(PoolError::Connect(err));
            }
        };
        if let Err(err) = slot.conn.ping().await {
            self.inner.unreserve_live();
            self.inner.close_now(slot).await;
            return Err(PoolError::Connect(err));
        }
        self.inner.park(slot);
        Ok(())
    }

    /// Borrows a connection, waiting up to the acquisition timeout.
    ///
    /// Fails fast with `PoolError::Closed` once `drain` has begun.
    pub async fn borrow(&self) -> PoolResult<PooledConnection<C>> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => self.wait_for_permit().await?,
        };

        let reused = {
            let mut state = self.inner.state.lock();
            if state.drained {
                return Err(PoolError::Closed);
            }
            state.outstanding += 1;
            state.peak_outstanding = state.peak_outstanding.max(state.outstanding);
            let reused = state.idle.pop_front();
            if reused.is_none() {
                // Reserved before connecting so the handle's drop can undo it.
                state.live += 1;
            }
            reused
        };

        // A failed or cancelled connect drops the lease, which gives the
        // permit and the live reservation back.
        let mut lease = Lease {
            pool: self.inner.clone(),
            permit: Some(permit),
            conn_id: None,
        };
        let slot = match reused {
            Some(slot) => slot,
            None => self.inner.open().await.map_err(PoolError::Connect)?,
        };
        lease.conn_id = Some(slot.id);

        debug!(conn_id = slot.id, "connection borrowed");
        Ok(PooledConnection { slot, lease })
    }

    async fn wait_for_permit(&self) -> PoolResult<OwnedSemaphorePermit> {
        let counters = &self.inner.counters;
        counters.saturated.fetch_add(1, Ordering::Relaxed);
        counters.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitingGuard(&counters.waiting);

        let limit = self.inner.config.acquire_timeout;
        let started = Instant::now();
        match timeout(limit, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                counters.exhausted.fetch_add(1, Ordering::Relaxed);
                let waited = started.elapsed();
                warn!(?waited, "connection pool exhausted");
                Err(PoolError::Exhausted { waited })
            }
        }
    }

    /// Returns a healthy handle to the free set.
    pub fn release(&self, handle: PooledConnection<C>) {
        handle.release();
    }

    /// Retires a handle whose connection is broken.
    ///
    /// Closing and any replacement happen in the background.
    pub fn discard(&self, handle: PooledConnection<C>) {
        handle.discard();
    }

    /// Stops new borrows, waits for every outstanding handle, then closes all
    /// connections and waits for background work to finish.
    pub async fn drain(&self) -> DrainReport {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!("draining connection pool");
        }
        self.inner.permits.close();

        let idle: Vec<_> = loop {
            let returned = self.inner.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.outstanding == 0 {
                    state.drained = true;
                    let swept = state.idle.len();
                    state.live -= swept;
                    break state.idle.drain(..).collect();
                }
            }
            returned.await;
        };

        let closed = idle.len();
        for slot in idle {
            self.inner.close_now(slot).await;
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        info!(closed, "connection pool drained");
        DrainReport { closed }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let counters = &self.inner.counters;
        PoolStats {
            max_connections: self.inner.config.max_connections,
            outstanding: state.outstanding,
            peak_outstanding: state.peak_outstanding,
            idle: state.idle.len(),
            live: state.live,
            waiting: counters.waiting.load(Ordering::Acquire),
            opened: counters.opened.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            saturated: counters.saturated.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl<C: Connector> PoolInner<C> {
    async fn open(&self) -> BackendResult<Slot<C::Connection>> {
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.opened.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = id, "connection opened");
        Ok(Slot { id, conn })
    }

    async fn close_now(&self, mut slot: Slot<C::Connection>) {
        if let Err(err) = slot.conn.close().await {
            debug!(conn_id = slot.id, error = %err, "error while closing connection");
        }
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn reserve_live(&self) -> bool {
        let mut state = self.state.lock();
        if state.live >= self.config.max_connections {
            return false;
        }
        state.live += 1;
        true
    }

    fn unreserve_live(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
    }

    /// Puts an unborrowed connection (warm-up, preflight, replacement) in the
    /// free set, or closes it when the pool is shutting down or over its
    /// ceiling.
    ///
    /// A borrow that finds the free set empty connects lazily even while a
    /// background replacement is in flight, so `live` can briefly exceed
    /// `max_connections`; the surplus is closed here.
    fn park(self: &Arc<Self>, slot: Slot<C::Connection>) {
        let mut state = self.state.lock();
        let surplus = state.live > self.config.max_connections;
        if self.closed.load(Ordering::Acquire) || surplus {
            state.live = state.live.saturating_sub(1);
            drop(state);
            if surplus {
                debug!(conn_id = slot.id, "closing surplus connection");
            }
            self.spawn_close(slot);
            return;
        }
        state.idle.push_back(slot);
    }

    fn check_in(self: &Arc<Self>, slot: Slot<C::Connection>, permit: OwnedSemaphorePermit) {
        let id = slot.id;
        let mut state = self.state.lock();
        state.outstanding -= 1;
        let leftover = if state.drained || state.live > self.config.max_connections {
            state.live = state.live.saturating_sub(1);
            Some(slot)
        } else {
            state.idle.push_back(slot);
            None
        };
        drop(state);

        // Parked before the permit goes back so the next waiter finds it.
        drop(permit);
        self.returned.notify_waiters();
        debug!(conn_id = id, "connection released");

        if let Some(slot) = leftover {
            self.spawn_close(slot);
        }
    }

    /// Gives back a handle's permit and live reservation. `conn_id` is set
    /// when a connection was retired, in which case it counts as discarded and
    /// a replacement may be started; the caller disposes of the connection.
    fn retire(self: &Arc<Self>, permit: OwnedSemaphorePermit, conn_id: Option<u64>) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.live = state.live.saturating_sub(1);
        let replace = conn_id.is_some()
            && !self.closed.load(Ordering::Acquire)
            && state.live < self.config.max_connections;
        if replace {
            state.live += 1;
        }
        drop(state);

        drop(permit);
        self.returned.notify_waiters();

        if let Some(id) = conn_id {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            warn!(conn_id = id, "connection discarded");
        }
        if replace {
            self.spawn_replacement();
        }
    }

    fn spawn_close(self: &Arc<Self>, slot: Slot<C::Connection>) {
        match Handle::try_current() {
            Ok(runtime) => {
                let inner = self.clone();
                self.tasks
                    .spawn_on(async move { inner.close_now(slot).await }, &runtime);
            }
            Err(_) => {
                // No runtime left to close on; dropping the transport closes it.
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                drop(slot);
            }
        }
    }

    fn spawn_replacement(self: &Arc<Self>) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                self.unreserve_live();
                return;
            }
        };
        let inner = self.clone();
        self.tasks.spawn_on(
            async move {
                match inner.open().await {
                    Ok(slot) => {
                        debug!(conn_id = slot.id, "replacement connection ready");
                        inner.park(slot);
                    }
                    Err(err) => {
                        inner.unreserve_live();
                        warn!(error = %err, "replacement connect failed; next borrow connects lazily");
                    }
                }
            },
            &runtime,
        );
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusively-borrowed connection.
///
/// Give it back with `release` when healthy or `discard` when broken. Dropping
/// it without either (e.g. a cancelled request) discards it, since the
/// connection may be mid-command.
pub struct PooledConnection<C: Connector> {
    // Declared before `lease` so a dropped handle closes its transport before
    // the permit goes back.
    slot: Slot<C::Connection>,
    lease: Lease<C>,
}

/// A handle's claim on the pool: one permit plus one live reservation.
///
/// Dropped with the permit still held, it retires the claim.
struct Lease<C: Connector> {
    pool: Arc<PoolInner<C>>,
    permit: Option<OwnedSemaphorePermit>,
    /// Set once a connection has been attached.
    conn_id: Option<u64>,
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pool.retire(permit, self.conn_id);
            if self.conn_id.is_some() {
                // The connection was dropped with the handle.
                self.pool.counters.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<C: Connector> PooledConnection<C> {
    /// Pool-unique id of the underlying connection.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Returns the connection to the free set.
    pub fn release(self) {
        let PooledConnection { slot, mut lease } = self;
        if let Some(permit) = lease.permit.take() {
            lease.pool.check_in(slot, permit);
        }
    }

    /// Retires the connection; it is never handed out again.
    pub fn discard(self) {
        let PooledConnection { slot, mut lease } = self;
        if let Some(permit) = lease.permit.take() {
            lease.pool.retire(permit, Some(slot.id));
            lease.pool.spawn_close(slot);
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        &self.slot.conn
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.conn
    }
}
