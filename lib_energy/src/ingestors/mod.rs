//! # Transport Adapters
//!
//! Clients that connect the ingestion core to a message broker. An adapter
//! implements `TopicSubscriber` for the topic resolver and drives a
//! `FeedHandler` (the ingestion dispatcher) with connect and message events.
//!
//! ## Contained Modules:
//! - **`mqtt_feed`**: MQTT 3.1.1 client built on `rumqttc`, with reconnect
//!   handling and graceful teardown of subscriptions on shutdown.

/// The MQTT event loop driver and subscriber.
pub mod mqtt_feed;

// --- Public API Re-exports ---
pub use mqtt_feed::{MqttFeed, MqttSettings, MqttSubscriber};
