//! # Core Ingestion Module
//!
//! The broker- and database-agnostic part of the ingestion engine. Everything
//! here talks to the outside world only through the traits in [`ports`].
//!
//! ## Core Components:
//!
//! - **`payload`**: topic relevance, device name extraction and payload
//!   decoding into a `Sample`.
//!
//! - **`window`** / **`engine`**: the per-device sliding windows and the
//!   delta engine that decides when a consumption delta is due.
//!
//! - **`registry`**: the topic resolver. Compares registry snapshots with the
//!   owned `SubscriptionSet` and issues subscribe requests for new devices.
//!
//! - **`dispatcher`**: the message pipeline. Implements `FeedHandler` so a
//!   transport adapter can drive it.
//!
//! - **`liveness`** / **`watchdog`**: the last-accepted-message clock and the
//!   timer task that detects a stalled feed and runs recovery.

/// Collaborator traits and their error types.
pub mod ports;
/// Topic filtering and payload decoding.
pub mod payload;
/// Per-device sliding window.
pub mod window;
/// Windowed delta engine.
pub mod engine;
/// Registry to subscription reconciliation.
pub mod registry;
/// Shared time of the last accepted message.
pub mod liveness;
/// Message pipeline from transport to store.
pub mod dispatcher;
/// Stalled-feed detection and recovery.
pub mod watchdog;

// --- Public API Re-exports ---
pub use ports::{
    DeviceId, DeviceRecord, FeedHandler, GatewayError, PersistenceGateway, TopicSubscriber, TransportError,
};
pub use payload::{DecodeError, DecodedReading, Sample};
pub use window::{DeviceWindow, EmitDecision};
pub use engine::DeltaEngine;
pub use registry::{SubscriptionSet, TopicResolver};
pub use liveness::LivenessClock;
pub use dispatcher::{IngestDispatcher, IngestStats, MessageOutcome};
pub use watchdog::{FeedHealth, TickOutcome, Watchdog, WatchdogExit};
