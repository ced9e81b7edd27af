//! # Ingestion Dispatcher
//!
//! Receives every message the transport delivers and walks it through the
//! pipeline:
//!
//! 1. **Relevance**: topics outside `energy/consumption/` are dropped.
//! 2. **Decode**: device name from the topic, reading from the payload. A bad
//!    topic or payload is logged and dropped; nothing else happens.
//! 3. **Liveness**: a decoded message refreshes the shared liveness clock.
//! 4. **Identity**: the device's registry id is looked up *before* the engine
//!    sees the sample, so an unknown device never gets a window.
//! 5. **Engine**: the sample enters the device's window; the engine answers
//!    whether a delta is due.
//! 6. **Persist**: a ready delta is written through the gateway. A failed
//!    write is logged and not retried; the window has already moved on.
//!
//! The engine lock is never held across an `.await`: the lookup happens
//! before it is taken and the write after it is released. Every store call is
//! bounded by the configured timeout.
//!
//! The dispatcher is also the [`FeedHandler`] given to the transport adapter:
//! a broker connect triggers a full subscription pass through the resolver.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::configs::PayloadProfile;
use crate::core::engine::DeltaEngine;
use crate::core::liveness::LivenessClock;
use crate::core::payload::{decode_payload, device_from_topic, is_relevant, DecodedReading};
use crate::core::ports::{bounded_store, DeviceId, FeedHandler, PersistenceGateway};
use crate::core::registry::TopicResolver;
use crate::core::window::{DeviceWindow, EmitDecision};

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageOutcome {
    Irrelevant,
    Undecodable,
    UnknownDevice,
    LookupFailed,
    Suppressed,
    Incomplete,
    Accumulating,
    Rejected,
    Written { delta: f64, utc_timestamp: i64 },
    WriteFailed,
}

/// Running totals since start.
#[derive(Debug, Default)]
struct IngestCounters {
    irrelevant: AtomicU64,
    undecodable: AtomicU64,
    decoded: AtomicU64,
    accepted: AtomicU64,
    unknown_device: AtomicU64,
    lookup_failures: AtomicU64,
    duplicates: AtomicU64,
    emitted: AtomicU64,
    rejected: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of the ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub irrelevant: u64,
    pub undecodable: u64,
    /// Messages that decoded and refreshed liveness.
    pub decoded: u64,
    /// Samples that entered a device window.
    pub accepted: u64,
    pub unknown_device: u64,
    pub lookup_failures: u64,
    pub duplicates: u64,
    pub emitted: u64,
    pub rejected: u64,
    pub write_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct IngestDispatcher {
    engine: Mutex<DeltaEngine>,
    profile: PayloadProfile,
    gateway: Arc<dyn PersistenceGateway>,
    resolver: Arc<TopicResolver>,
    liveness: Arc<LivenessClock>,
    store_timeout: Duration,
    counters: IngestCounters,
}

impl IngestDispatcher {
    pub fn new(
        engine: DeltaEngine,
        profile: PayloadProfile,
        gateway: Arc<dyn PersistenceGateway>,
        resolver: Arc<TopicResolver>,
        liveness: Arc<LivenessClock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            engine: Mutex::new(engine),
            profile,
            gateway,
            resolver,
            liveness,
            store_timeout,
            counters: IngestCounters::default(),
        }
    }

    pub fn resolver(&self) -> &Arc<TopicResolver> {
        &self.resolver
    }

    pub fn liveness(&self) -> &Arc<LivenessClock> {
        &self.liveness
    }

    /// Processes one transport message end to end.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        if !is_relevant(topic) {
            bump(&self.counters.irrelevant);
            log::trace!("Ignoring message on unrelated topic {}", topic);
            return MessageOutcome::Irrelevant;
        }
        log::debug!("Message received on topic: {}", topic);

        let device = match device_from_topic(topic) {
            Ok(device) => device,
            Err(e) => {
                bump(&self.counters.undecodable);
                log::warn!("Message discarded: {}", e);
                return MessageOutcome::Undecodable;
            }
        };

        let reading = match decode_payload(payload, &self.profile) {
            Ok(reading) => reading,
            Err(e) => {
                bump(&self.counters.undecodable);
                log::warn!("Message from {} discarded: {}", device, e);
                return MessageOutcome::Undecodable;
            }
        };

        self.liveness.touch();
        bump(&self.counters.decoded);
        log_reading(device, &reading);

        let lookup = bounded_store(
            "lookup_device_id",
            self.store_timeout,
            self.gateway.lookup_device_id(device),
        )
        .await;
        let device_id = match lookup {
            Ok(Some(id)) => id,
            Ok(None) => {
                bump(&self.counters.unknown_device);
                log::warn!("Gateway {} is not registered, message discarded", device);
                return MessageOutcome::UnknownDevice;
            }
            Err(e) => {
                bump(&self.counters.lookup_failures);
                log::error!("Device lookup for {} failed, message discarded: {}", device, e);
                return MessageOutcome::LookupFailed;
            }
        };

        let (decision, total_received) = {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            let decision = engine.ingest(device, payload, reading.sample);
            let total = engine.window(device).map(DeviceWindow::total_received).unwrap_or_default();
            (decision, total)
        };
        if decision != EmitDecision::Suppressed {
            bump(&self.counters.accepted);
        }

        match decision {
            EmitDecision::Suppressed => {
                bump(&self.counters.duplicates);
                log::info!("Message already processed for {}, ignored", device);
                MessageOutcome::Suppressed
            }
            EmitDecision::Incomplete { held } => {
                log::debug!(
                    "Messages received from {}: {}. Not enough values yet ({}), nothing written",
                    device,
                    total_received,
                    held
                );
                MessageOutcome::Incomplete
            }
            EmitDecision::Accumulating { seen_full } => {
                log::debug!(
                    "Messages received from {}: {}. Window full {} time(s), waiting for threshold",
                    device,
                    total_received,
                    seen_full
                );
                MessageOutcome::Accumulating
            }
            EmitDecision::Rejected { delta } => {
                bump(&self.counters.rejected);
                log::warn!("Negative delta {:.3} kWh for {} dropped by policy", delta, device);
                MessageOutcome::Rejected
            }
            EmitDecision::Ready { delta, utc_timestamp } => {
                if delta < 0.0 {
                    log::warn!(
                        "Negative delta {:.3} kWh for {} (meter reset or rollover?), passed through",
                        delta,
                        device
                    );
                }
                self.persist(device, device_id, delta, utc_timestamp).await
            }
        }
    }

    async fn persist(&self, device: &str, device_id: DeviceId, delta: f64, utc_timestamp: i64) -> MessageOutcome {
        let write = bounded_store(
            "write_delta",
            self.store_timeout,
            self.gateway.write_delta(device, utc_timestamp, delta, device_id),
        )
        .await;
        match write {
            Ok(()) => {
                bump(&self.counters.emitted);
                log::info!("Delta of {:.3} kWh written for {}", delta, device);
                MessageOutcome::Written { delta, utc_timestamp }
            }
            Err(e) => {
                bump(&self.counters.write_failures);
                log::error!("Writing delta for {} failed, value lost: {}", device, e);
                MessageOutcome::WriteFailed
            }
        }
    }

    /// Copy of a device's window, if it has one.
    pub fn window(&self, device: &str) -> Option<DeviceWindow> {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .window(device)
            .cloned()
    }

    pub fn tracked_devices(&self) -> usize {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            irrelevant: c.irrelevant.load(Ordering::Relaxed),
            undecodable: c.undecodable.load(Ordering::Relaxed),
            decoded: c.decoded.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            unknown_device: c.unknown_device.load(Ordering::Relaxed),
            lookup_failures: c.lookup_failures.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            emitted: c.emitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl FeedHandler for IngestDispatcher {
    async fn on_connect(&self) {
        log::info!("Connected to broker, subscribing eligible gateways");
        match self.resolver.subscribe_all().await {
            Ok(count) => log::info!("{} gateway topic(s) subscribed", count),
            Err(e) => log::error!("Registry read failed on connect, next reconciliation will retry: {}", e),
        }
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle(topic, payload).await;
    }
}

fn log_reading(device: &str, reading: &DecodedReading) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let when = chrono::DateTime::from_timestamp(reading.sample.utc_timestamp, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| reading.sample.utc_timestamp.to_string());
    log::debug!("UTC timestamp: {}", when);
    for (key, kwh) in &reading.registers {
        log::debug!("{}: {} kWh", key, kwh);
    }
    for key in &reading.unavailable {
        log::debug!("{}: field unavailable for {}", key, device);
    }
}
