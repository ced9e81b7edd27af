//! # Topic Resolver
//!
//! Maps the device registry to the set of MQTT topics that must be
//! subscribed, and keeps the broker in step with the registry as gateways are
//! added.
//!
//! The decision logic is pure: [`reconcile`] takes the previous
//! [`SubscriptionSet`] by value together with a fresh registry snapshot and
//! returns the next set plus the topics that need a subscription request.
//! [`TopicResolver`] wraps that with the I/O (registry read, subscribe calls)
//! and owns the current set.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::configs::TopicScheme;
use crate::core::ports::{bounded_store, DeviceRecord, GatewayError, PersistenceGateway, TopicSubscriber};

/// Registry rows last known to the resolver. Replaced wholesale, never edited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    devices: BTreeSet<DeviceRecord>,
}

impl SubscriptionSet {
    pub fn from_snapshot(snapshot: impl IntoIterator<Item = DeviceRecord>) -> Self {
        Self {
            devices: snapshot.into_iter().collect(),
        }
    }

    pub fn contains(&self, record: &DeviceRecord) -> bool {
        self.devices.contains(record)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }
}

/// Result of comparing a registry snapshot with the previous set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The snapshot, which becomes the new previous set.
    pub next: SubscriptionSet,
    /// New eligible devices with their topics, in snapshot order.
    pub to_subscribe: Vec<(DeviceRecord, String)>,
    /// New devices whose protocol class is not eligible.
    pub skipped: Vec<DeviceRecord>,
}

/// Topic of `record` when its protocol class is subscribed.
fn eligible_topic(record: &DeviceRecord, scheme: &TopicScheme) -> Option<String> {
    (record.protocol == scheme.eligible_protocol).then(|| scheme.topic_for(&record.name))
}

/// Topic of every eligible device in the snapshot.
pub fn resolve_eligible_topics(snapshot: &[DeviceRecord], scheme: &TopicScheme) -> BTreeSet<String> {
    snapshot.iter().filter_map(|d| eligible_topic(d, scheme)).collect()
}

/// Eligible devices of `devices` whose topic is in `topics`.
fn devices_for_topics<'a>(
    devices: impl IntoIterator<Item = &'a DeviceRecord>,
    topics: &BTreeSet<String>,
    scheme: &TopicScheme,
) -> BTreeSet<DeviceRecord> {
    devices
        .into_iter()
        .filter(|d| eligible_topic(d, scheme).is_some_and(|t| topics.contains(&t)))
        .cloned()
        .collect()
}

/// Finds the `(name, class)` pairs of `snapshot` absent from `previous`.
pub fn reconcile(previous: SubscriptionSet, snapshot: Vec<DeviceRecord>, scheme: &TopicScheme) -> Reconciliation {
    let mut to_subscribe = Vec::new();
    let mut skipped = Vec::new();

    for record in snapshot.iter().filter(|r| !previous.contains(r)) {
        match eligible_topic(record, scheme) {
            Some(topic) => to_subscribe.push((record.clone(), topic)),
            None => skipped.push(record.clone()),
        }
    }

    Reconciliation {
        next: SubscriptionSet::from_snapshot(snapshot),
        to_subscribe,
        skipped,
    }
}

#[derive(Debug, Default)]
struct ResolverState {
    current: SubscriptionSet,
    /// Eligible devices whose last subscribe request failed.
    retry: BTreeSet<DeviceRecord>,
}

/// Owns the subscription set and issues the subscribe requests.
///
/// `subscribe_all` (connect, soft recovery) and `reconcile` (periodic) are
/// serialized through one async mutex, held for the whole pass.
pub struct TopicResolver {
    gateway: Arc<dyn PersistenceGateway>,
    subscriber: Arc<dyn TopicSubscriber>,
    scheme: TopicScheme,
    store_timeout: Duration,
    state: Mutex<ResolverState>,
}

impl TopicResolver {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        subscriber: Arc<dyn TopicSubscriber>,
        scheme: TopicScheme,
        store_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            subscriber,
            scheme,
            store_timeout,
            state: Mutex::new(ResolverState::default()),
        }
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Subscribes every eligible device of the registry and replaces the set.
    ///
    /// Returns the number of successful subscribe requests.
    pub async fn subscribe_all(&self) -> Result<usize, GatewayError> {
        let mut state = self.state.lock().await;
        let snapshot = self.fetch_registry().await?;
        // Everything is requested again below.
        self.subscriber.take_rejected();

        for record in snapshot.iter().filter(|r| r.protocol != self.scheme.eligible_protocol) {
            log::info!(
                "Gateway {} skipped: protocol class {} is not subscribed",
                record.name,
                record.protocol
            );
        }

        let mut issued = 0;
        let mut failed = BTreeSet::new();
        for topic in resolve_eligible_topics(&snapshot, &self.scheme) {
            if self.issue(&topic).await {
                issued += 1;
            } else {
                failed.insert(topic);
            }
        }

        state.retry = devices_for_topics(&snapshot, &failed, &self.scheme);
        state.current = SubscriptionSet::from_snapshot(snapshot);
        Ok(issued)
    }

    /// Subscribes devices added to the registry since the last pass, plus any
    /// whose earlier subscribe request failed or was refused by the broker.
    pub async fn reconcile(&self) -> Result<usize, GatewayError> {
        let mut state = self.state.lock().await;
        let snapshot = self.fetch_registry().await?;

        let rejected: BTreeSet<String> = self.subscriber.take_rejected().into_iter().collect();
        if !rejected.is_empty() {
            let refused = devices_for_topics(state.current.iter(), &rejected, &self.scheme);
            for record in &refused {
                log::warn!("Subscription for {} was not confirmed by the broker, will retry", record.name);
            }
            state.retry.extend(refused);
        }

        let previous = std::mem::take(&mut state.current);
        let outcome = reconcile(previous, snapshot, &self.scheme);

        for record in &outcome.skipped {
            log::info!(
                "New gateway {} skipped: protocol class {} is not subscribed",
                record.name,
                record.protocol
            );
        }

        let mut pending: Vec<(DeviceRecord, String)> = state
            .retry
            .iter()
            .filter(|r| outcome.next.contains(r))
            .filter_map(|r| eligible_topic(r, &self.scheme).map(|t| (r.clone(), t)))
            .collect();
        pending.extend(
            outcome
                .to_subscribe
                .into_iter()
                .filter(|(r, _)| !state.retry.contains(r)),
        );

        let mut issued = 0;
        let mut retry = BTreeSet::new();
        for (record, topic) in pending {
            if self.issue(&topic).await {
                log::info!("New subscription to topic: {}", topic);
                issued += 1;
            } else {
                retry.insert(record);
            }
        }

        state.current = outcome.next;
        state.retry = retry;
        Ok(issued)
    }

    /// Copy of the current set.
    pub async fn current(&self) -> SubscriptionSet {
        self.state.lock().await.current.clone()
    }

    /// Devices waiting for a subscribe retry.
    pub async fn pending_retries(&self) -> Vec<DeviceRecord> {
        self.state.lock().await.retry.iter().cloned().collect()
    }

    async fn fetch_registry(&self) -> Result<Vec<DeviceRecord>, GatewayError> {
        bounded_store(
            "lookup_devices_by_protocol",
            self.store_timeout,
            self.gateway.lookup_devices_by_protocol(),
        )
        .await
    }

    async fn issue(&self, topic: &str) -> bool {
        match self.subscriber.subscribe(topic).await {
            Ok(()) => {
                log::info!("Subscribed to topic: {}", topic);
                true
            }
            Err(e) => {
                log::error!("Subscription to {} failed, will retry: {}", topic, e);
                false
            }
        }
    }
}
