//! # Collaborator Ports
//!
//! The engine talks to the outside world through three narrow traits:
//!
//! - [`PersistenceGateway`]: device registry reads and delta writes.
//! - [`TopicSubscriber`]: subscription requests to the broker.
//! - [`FeedHandler`]: what a transport adapter calls on connect and on every
//!   delivered message. Implemented by the ingestion dispatcher.
//!
//! Nothing in `core` names a concrete broker or database client.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Registry key of a gateway in the store.
pub type DeviceId = i32;

/// One row of the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRecord {
    pub name: String,
    pub protocol: i32,
}

impl DeviceRecord {
    pub fn new(name: impl Into<String>, protocol: i32) -> Self {
        Self {
            name: name.into(),
            protocol,
        }
    }
}

/// Failures of the persistence gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to obtain a database connection: {0}")]
    Pool(String),
    #[error("query execution failed: {0}")]
    Query(String),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Failures of the broker transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
    #[error("connection error: {0}")]
    Connection(String),
}

/// Durable sink for deltas and read path for the device registry.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Every registered gateway with its protocol class, in registry order.
    async fn lookup_devices_by_protocol(&self) -> Result<Vec<DeviceRecord>, GatewayError>;

    /// Registry id of a gateway, `None` when the name is unknown.
    async fn lookup_device_id(&self, device_name: &str) -> Result<Option<DeviceId>, GatewayError>;

    /// Persists one consumption delta.
    async fn write_delta(
        &self,
        device_name: &str,
        utc_timestamp: i64,
        delta_kwh: f64,
        device_id: DeviceId,
    ) -> Result<(), GatewayError>;
}

/// Issues subscription requests to the broker.
///
/// Subscribing to a topic that is already subscribed must be harmless.
#[async_trait]
pub trait TopicSubscriber: Send + Sync {
    /// `Ok` means the request was handed to the transport. A transport that
    /// learns the broker's answer later reports refusals via `take_rejected`.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Drains the topics whose subscription the broker refused, or that were
    /// lost unconfirmed with the connection, since the last call.
    fn take_rejected(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Callbacks a transport adapter drives.
#[async_trait]
pub trait FeedHandler: Send + Sync {
    /// The broker accepted the connection (initially or after a reconnect).
    async fn on_connect(&self);

    /// A message arrived on `topic`.
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Runs a store call with an upper bound on its duration.
pub async fn bounded_store<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(what, limit)),
    }
}

/// Runs a broker call with an upper bound on its duration.
pub async fn bounded_transport<T, F>(what: &'static str, limit: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(what, limit)),
    }
}
