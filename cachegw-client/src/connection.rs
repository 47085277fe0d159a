//! # Backend Connections
//!
//! Purpose: Describe the backing store as `connect / get / set / close` and
//! provide the RESP2-over-TCP implementation used in production.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: The pool and gateway only see `Connector` and
//!    `BackendConnection`; tests swap in an in-memory backend.
//! 2. **Buffer Reuse**: Each connection owns its read and write buffers.
//! 3. **Bounded Round Trips**: An optional I/O timeout turns a stalled backend
//!    into a `Timeout` error instead of a hung request.
//! 4. **Sequential Use**: `&mut self` on every call guarantees one command in
//!    flight per connection.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use cachegw_common::{BackendError, BackendResult, PoolConfig};

use crate::resp::{decode_frame, encode_command, Decoded, RespValue};

/// One exclusively-owned connection to the backing store.
#[async_trait]
pub trait BackendConnection: Send + 'static {
    /// Reads `key`. `Ok(None)` means the key is absent.
    async fn get(&mut self, key: &str) -> BackendResult<Option<Bytes>>;

    /// Writes `key`. Returns true when the backend acknowledged the write.
    async fn set(&mut self, key: &str, value: &[u8]) -> BackendResult<bool>;

    /// Liveness check.
    async fn ping(&mut self) -> BackendResult<()>;

    /// Closes the underlying transport.
    async fn close(&mut self) -> BackendResult<()>;
}

/// Factory for backend connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BackendConnection;

    async fn connect(&self) -> BackendResult<Self::Connection>;
}

/// Opens RESP2 connections to a `host:port` backing store.
#[derive(Debug, Clone)]
pub struct RespConnector {
    addr: String,
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
}

impl RespConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        RespConnector {
            addr: addr.into(),
            connect_timeout: None,
            io_timeout: None,
        }
    }

    /// Builds a connector from the pool's target and timeouts.
    pub fn from_config(config: &PoolConfig) -> Self {
        RespConnector {
            addr: config.addr(),
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn open_stream(&self) -> BackendResult<TcpStream> {
        let addrs: Vec<_> = lookup_host(self.addr.as_str()).await?.collect();
        if addrs.is_empty() {
            return Err(BackendError::InvalidAddress(self.addr.clone()));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(BackendError::Io)
            .unwrap_or_else(|| BackendError::InvalidAddress(self.addr.clone())))
    }
}

#[async_trait]
impl Connector for RespConnector {
    type Connection = RespConnection;

    async fn connect(&self) -> BackendResult<RespConnection> {
        let stream = match self.connect_timeout {
            Some(limit) => timeout(limit, self.open_stream())
                .await
                .map_err(|_| BackendError::Timeout(limit))??,
            None => self.open_stream().await?,
        };
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "backend connection established");

        Ok(RespConnection {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(256),
            io_timeout: self.io_timeout,
        })
    }
}

/// Single RESP2 connection with reusable buffers.
pub struct RespConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    io_timeout: Option<Duration>,
}

impl RespConnection {
    /// Sends one command and waits for its reply.
    pub async fn exec(&mut self, args: &[&[u8]]) -> BackendResult<RespValue> {
        match self.io_timeout {
            Some(limit) => timeout(limit, self.round_trip(args))
                .await
                .map_err(|_| BackendError::Timeout(limit))?,
            None => self.round_trip(args).await,
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> BackendResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;

        // Bytes the pending frame needs before it is worth decoding again.
        let mut needed = 0;
        loop {
            if self.read_buf.len() >= needed {
                match decode_frame(&self.read_buf)? {
                    Decoded::Frame(value, used) => {
                        self.read_buf.advance(used);
                        return Ok(value);
                    }
                    Decoded::Incomplete(hint) => {
                        needed = hint;
                        self.read_buf.reserve(hint.saturating_sub(self.read_buf.len()));
                    }
                }
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(BackendError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed the connection",
                )));
            }
        }
    }
}

fn server_error(message: Bytes) -> BackendError {
    BackendError::Server {
        message: String::from_utf8_lossy(&message).into_owned(),
    }
}

#[async_trait]
impl BackendConnection for RespConnection {
    async fn get(&mut self, key: &str) -> BackendResult<Option<Bytes>> {
        match self.exec(&[b"GET", key.as_bytes()]).await? {
            RespValue::Bulk(data) => Ok(data),
            RespValue::Error(message) => Err(server_error(message)),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> BackendResult<bool> {
        match self.exec(&[b"SET", key.as_bytes(), value]).await? {
            RespValue::Simple(_) => Ok(true),
            // Conditional writes answer with a null bulk when refused.
            RespValue::Bulk(None) => Ok(false),
            RespValue::Error(message) => Err(server_error(message)),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    async fn ping(&mut self) -> BackendResult<()> {
        match self.exec(&[b"PING"]).await? {
            RespValue::Simple(text) if &text[..] == b"PONG" => Ok(()),
            RespValue::Error(message) => Err(server_error(message)),
            _ => Err(BackendError::UnexpectedResponse),
        }
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
