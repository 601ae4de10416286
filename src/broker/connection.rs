//! Broker connection lifecycle management.
//!
//! This module provides:
//!
//! - `ConnectionProvider`: one lazily-established, health-checked broker
//!   connection, resettable after connection-class failures
//! - `ProviderRegistry`: an explicit map from concurrency-context identity
//!   (worker name) to its provider, with process-level teardown
//!
//! A provider is scoped to exactly one concurrency context. Workers each own
//! a registry entry and must never share a provider across contexts. After
//! any broker operation fails with a connection-class error the owning
//! context calls `reset()` and retries the operation; the next
//! `get_connection()` rebuilds everything from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker was unreachable while establishing a connection.
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation was attempted before any connection was opened.
    /// This is a programmer error and is never retried internally.
    #[error("No open broker connection")]
    NoOpenConnection,

    /// A broker command failed.
    #[error("Broker command failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize a task payload.
    #[error("Task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Returns whether this error indicates a lost or unreachable
    /// connection, i.e. whether `ConnectionProvider::reset` + retry is the
    /// appropriate recovery.
    pub fn is_connection_error(&self) -> bool {
        match self {
            BrokerError::ConnectionFailed(_) => true,
            BrokerError::Redis(e) => e.is_connection_dropped() || e.is_io_error(),
            _ => false,
        }
    }
}

/// Owns at most one live connection to the broker, created lazily.
///
/// The multiplexed connection is cheap to clone; clones share the underlying
/// socket, so handing out clones from `get_connection`/`current` is the
/// intended usage.
pub struct ConnectionProvider {
    redis_url: String,
    state: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl ConnectionProvider {
    /// Creates a provider for the given broker URL. No connection is
    /// established until `get_connection` is called.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the live connection, establishing one if necessary.
    ///
    /// An already-open connection is health-checked with a PING and
    /// returned; a stale one is dropped and redialed in the same call.
    /// This sits on the connect/reconnect path only. Per-operation
    /// liveness is the callers' concern: they treat connection-class
    /// command failures as the health signal, `reset()` and retry.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::ConnectionFailed` if the broker is unreachable.
    pub async fn get_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut state = self.state.lock().await;

        // Double-check inside the lock: a concurrent caller may have
        // reconnected while we were waiting.
        if let Some(conn) = state.as_mut() {
            match redis::cmd("PING").query_async::<_, String>(conn).await {
                Ok(_) => return Ok(conn.clone()),
                Err(e) => {
                    warn!(url = %self.redis_url, error = %e, "Cached broker connection failed health check, reconnecting");
                    *state = None;
                }
            }
        }

        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        // Verify the connection is actually usable before handing it out.
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        debug!(url = %self.redis_url, "Established broker connection");
        *state = Some(conn.clone());
        Ok(conn)
    }

    /// Returns the currently open connection without establishing one.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NoOpenConnection` if `get_connection` has not
    /// succeeded since creation or the last `reset`/`close`.
    pub async fn current(&self) -> Result<MultiplexedConnection, BrokerError> {
        let state = self.state.lock().await;
        state.as_ref().cloned().ok_or(BrokerError::NoOpenConnection)
    }

    /// Returns whether a connection is currently open.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Drops the current connection, if any, and clears all state so the
    /// next `get_connection` builds everything fresh.
    ///
    /// Errors from an already-broken connection are swallowed; reset is
    /// called precisely when the connection is suspected broken.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            warn!(url = %self.redis_url, "Broker connection reset");
        }
        // The multiplexed connection closes its socket once every clone is
        // dropped; there is no explicit close handshake to fail.
    }

    /// Graceful shutdown. Idempotent; equivalent to `reset` without the
    /// warning log.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            debug!(url = %self.redis_url, "Broker connection closed");
        }
    }
}

/// Explicit registry mapping concurrency-context identity to a provider.
///
/// Owned by a process-level object (pool, dispatcher or CLI entry point)
/// with an init/teardown lifecycle. Each context gets its own provider; a
/// provider obtained for context "worker-0" must never be used from
/// "worker-1".
pub struct ProviderRegistry {
    redis_url: String,
    providers: std::sync::Mutex<HashMap<String, Arc<ConnectionProvider>>>,
}

impl ProviderRegistry {
    /// Creates an empty registry for the given broker URL.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            providers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the provider for the given context, creating it on first use.
    pub fn provider_for(&self, context: &str) -> Arc<ConnectionProvider> {
        let mut providers = self.providers.lock().expect("provider registry poisoned");
        providers
            .entry(context.to_string())
            .or_insert_with(|| Arc::new(ConnectionProvider::new(self.redis_url.clone())))
            .clone()
    }

    /// Removes a context's provider, closing its connection. Used when a
    /// context ends so stale providers do not accumulate.
    pub async fn remove(&self, context: &str) {
        let provider = {
            let mut providers = self.providers.lock().expect("provider registry poisoned");
            providers.remove(context)
        };
        if let Some(provider) = provider {
            provider.close().await;
        }
    }

    /// Closes every provider and empties the registry.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<ConnectionProvider>> = {
            let mut providers = self.providers.lock().expect("provider registry poisoned");
            providers.drain().map(|(_, p)| p).collect()
        };
        for provider in drained {
            provider.close().await;
        }
    }

    /// Returns the number of registered contexts.
    pub fn len(&self) -> usize {
        self.providers.lock().expect("provider registry poisoned").len()
    }

    /// Returns whether the registry has no registered contexts.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
