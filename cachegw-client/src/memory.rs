//! # In-Memory Backend
//!
//! A `Connector` whose connections share one hash map. Used by tests and the
//! benchmark to exercise the pool and gateway without a real backing store.
//!
//! Knobs: artificial per-operation and connect latency, injected connect failures,
//! injected I/O failures and server error replies. Counters record connects,
//! closes and the peak number of operations running at once.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use cachegw_common::{BackendError, BackendResult};

use crate::connection::{BackendConnection, Connector};

#[derive(Default)]
struct MemoryBackend {
    data: Mutex<HashMap<String, Bytes>>,
    latency: Mutex<Duration>,
    connect_latency: Mutex<Duration>,
    refuse_connects: AtomicBool,
    io_failures: AtomicUsize,
    server_errors: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    active_ops: AtomicUsize,
    peak_ops: AtomicUsize,
}

impl MemoryBackend {
    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Shared handle to an in-memory backing store.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps for `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        let connector = Self::default();
        connector.set_latency(latency);
        connector
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.backend.latency.lock() = latency;
    }

    /// Every `connect()` sleeps for `latency` before succeeding.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.backend.connect_latency.lock() = latency;
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.backend.data.lock().insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.backend.data.lock().get(key).cloned()
    }

    /// Makes subsequent `connect()` calls fail until reset.
    pub fn refuse_connects(&self, refuse: bool) {
        self.backend.refuse_connects.store(refuse, Ordering::Release);
    }

    /// The next `count` operations fail with an I/O error.
    pub fn fail_next_ops(&self, count: usize) {
        self.backend.io_failures.store(count, Ordering::Release);
    }

    /// The next `count` operations answer with a server error reply.
    pub fn reject_next_ops(&self, count: usize) {
        self.backend.server_errors.store(count, Ordering::Release);
    }

    pub fn connects(&self) -> usize {
        self.backend.connects.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.backend.closes.load(Ordering::Acquire)
    }

    /// Highest number of operations observed running at the same time.
    pub fn peak_concurrent_ops(&self) -> usize {
        self.backend.peak_ops.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> BackendResult<MemoryConnection> {
        let latency = *self.backend.connect_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.backend.refuse_connects.load(Ordering::Acquire) {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory backend refused the connection",
            )));
        }
        self.backend.connects.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryConnection {
            backend: self.backend.clone(),
            closed: false,
        })
    }
}

/// Connection to a `MemoryConnector` backend.
pub struct MemoryConnection {
    backend: Arc<MemoryBackend>,
    closed: bool,
}

impl MemoryConnection {
    async fn run<T>(&mut self, op: impl FnOnce(&MemoryBackend) -> T) -> BackendResult<T> {
        if self.closed {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )));
        }

        let active = self.backend.active_ops.fetch_add(1, Ordering::AcqRel) + 1;
        self.backend.peak_ops.fetch_max(active, Ordering::AcqRel);
        let _active = ActiveOp(&self.backend.active_ops);

        let latency = *self.backend.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if MemoryBackend::take_one(&self.backend.io_failures) {
            return Err(BackendError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected io failure",
            )));
        }
        if MemoryBackend::take_one(&self.backend.server_errors) {
            return Err(BackendError::Server {
                message: "ERR injected failure".to_string(),
            });
        }
        Ok(op(&self.backend))
    }
}

struct ActiveOp<'a>(&'a AtomicUsize);

impl Drop for ActiveOp<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn get(&mut self, key: &str) -> BackendResult<Option<Bytes>> {
        self.run(|backend| backend.data.lock().get(key).cloned()).await
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> BackendResult<bool> {
        let value = Bytes::copy_from_slice(value);
        self.run(move |backend| {
            backend.data.lock().insert(key.to_string(), value);
            true
        })
        .await
    }

    async fn ping(&mut self) -> BackendResult<()> {
        self.run(|_| ()).await
    }

    async fn close(&mut self) -> BackendResult<()> {
        if !self.closed {
            self.closed = true;
            self.backend.closes.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}
