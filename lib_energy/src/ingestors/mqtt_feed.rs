//! # MQTT Feed
//!
//! Broker connection for the consumption feed.
//!
//! [`MqttFeed::new`] returns two halves sharing one `rumqttc` client:
//!
//! - [`MqttSubscriber`]: the `TopicSubscriber` handed to the topic resolver.
//!   It remembers every topic it subscribed so they can be released on
//!   shutdown, and matches SUBACKs back to topics so a refused subscription
//!   is reported to the resolver for retry.
//! - [`MqttFeed`]: owns the event loop. [`MqttFeed::run`] polls it, hands
//!   connect acknowledgements and publishes to a `FeedHandler`, and reconnects
//!   after connection errors.
//!
//! Publishes are delivered inline, one at a time, so a message is fully
//! handled before the next one is read. Connect handling is spawned: it issues
//! subscribe requests, which only drain while the event loop keeps polling.

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::core::ports::{bounded_transport, FeedHandler, TopicSubscriber, TransportError};

/// Connection parameters for the broker.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// `(username, password)`; `None` connects anonymously.
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    /// Upper bound on queuing one subscribe or unsubscribe request.
    pub request_timeout: Duration,
    /// Pause between a connection error and the next attempt.
    pub reconnect_delay: Duration,
    /// Upper bound on unsubscribing and disconnecting at shutdown.
    pub teardown_timeout: Duration,
    /// Capacity of the client request queue.
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "energy_ingest".to_string(),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(5),
            request_capacity: 64,
        }
    }
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        options
    }
}

#[derive(Debug, Default)]
struct Subscriptions {
    /// Requested and not refused.
    active: BTreeSet<String>,
    /// Queued in the client, packet id not yet assigned. Requests leave the
    /// queue in the order they were made.
    queued: VecDeque<String>,
    /// Sent to the broker, waiting for the SUBACK.
    in_flight: HashMap<u16, String>,
    /// Refused or lost, not yet collected by the resolver.
    rejected: BTreeSet<String>,
}

/// Subscribe side of the broker connection.
pub struct MqttSubscriber {
    client: AsyncClient,
    request_timeout: Duration,
    subscriptions: Mutex<Subscriptions>,
}

impl MqttSubscriber {
    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Topics subscribed so far, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        self.subscriptions().active.iter().cloned().collect()
    }

    /// A subscribe request left the client with packet id `pkid`.
    fn on_subscribe_sent(&self, pkid: u16) {
        let mut subs = self.subscriptions();
        if let Some(topic) = subs.queued.pop_front() {
            subs.in_flight.insert(pkid, topic);
        }
    }

    /// The broker answered the subscribe request `pkid`.
    fn on_suback(&self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let mut subs = self.subscriptions();
        let Some(topic) = subs.in_flight.remove(&pkid) else {
            return;
        };
        if codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
            log::warn!("Broker rejected subscription to {}", topic);
            subs.active.remove(&topic);
            subs.rejected.insert(topic);
        }
    }

    /// The connection dropped. Requests already sent without a SUBACK are
    /// lost; those still queued in the client go out after the reconnect.
    fn on_connection_lost(&self) {
        let mut subs = self.subscriptions();
        let in_flight = std::mem::take(&mut subs.in_flight);
        for topic in in_flight.into_values() {
            subs.active.remove(&topic);
            subs.rejected.insert(topic);
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.client.clone();
        bounded_transport("unsubscribe", self.request_timeout, async move {
            client.unsubscribe(topic).await.map_err(|e| TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        })
        .await?;
        self.subscriptions().active.remove(topic);
        Ok(())
    }

    /// Unsubscribes every active topic, then disconnects.
    async fn release_all(&self) {
        for topic in self.active_topics() {
            match self.unsubscribe(&topic).await {
                Ok(()) => log::info!("Unsubscribed from topic: {}", topic),
                Err(e) => log::warn!("{}", e),
            }
        }
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Disconnect request failed: {}", e);
        }
    }
}

#[async_trait]
impl TopicSubscriber for MqttSubscriber {
    /// Queues a subscribe request. The broker's answer arrives later as a
    /// SUBACK on the event loop.
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        // Queued before the request so the event loop can never see the
        // outgoing packet first.
        self.subscriptions().queued.push_back(topic.to_string());

        let client = self.client.clone();
        let sent = bounded_transport("subscribe", self.request_timeout, async move {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Subscribe {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        })
        .await;

        let mut subs = self.subscriptions();
        match sent {
            Ok(()) => {
                subs.rejected.remove(topic);
                subs.active.insert(topic.to_string());
                Ok(())
            }
            Err(e) => {
                if let Some(pos) = subs.queued.iter().rposition(|t| t == topic) {
                    subs.queued.remove(pos);
                }
                Err(e)
            }
        }
    }

    fn take_rejected(&self) -> Vec<String> {
        std::mem::take(&mut self.subscriptions().rejected).into_iter().collect()
    }
}

/// Event loop side of the broker connection.
pub struct MqttFeed {
    eventloop: EventLoop,
    subscriber: Arc<MqttSubscriber>,
    endpoint: String,
    reconnect_delay: Duration,
    teardown_timeout: Duration,
}

impl MqttFeed {
    /// Prepares the client. Nothing touches the network until [`MqttFeed::run`].
    pub fn new(settings: &MqttSettings) -> (Self, Arc<MqttSubscriber>) {
        let (client, eventloop) = AsyncClient::new(settings.options(), settings.request_capacity.max(1));
        let subscriber = Arc::new(MqttSubscriber {
            client,
            request_timeout: settings.request_timeout,
            subscriptions: Mutex::new(Subscriptions::default()),
        });
        let feed = Self {
            eventloop,
            subscriber: subscriber.clone(),
            endpoint: format!("{}:{}", settings.host, settings.port),
            reconnect_delay: settings.reconnect_delay,
            teardown_timeout: settings.teardown_timeout,
        };
        (feed, subscriber)
    }

    /// Drives the connection until `shutdown` is cancelled, then releases
    /// every subscription and disconnects.
    pub async fn run(mut self, handler: Arc<dyn FeedHandler>, shutdown: CancellationToken) {
        log::info!("Connecting to MQTT broker at {}", self.endpoint);
        let mut connect_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("MQTT feed received shutdown signal.");
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("Connected to MQTT broker at {}", self.endpoint);
                        if let Some(previous) = connect_task.take() {
                            previous.abort();
                        }
                        let handler = handler.clone();
                        connect_task = Some(tokio::spawn(async move { handler.on_connect().await }));
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handler.on_message(&publish.topic, &publish.payload).await;
                    }
                    Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                        self.subscriber.on_subscribe_sent(pkid);
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        self.subscriber.on_suback(ack.pkid, &ack.return_codes);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.subscriber.on_connection_lost();
                        let err = TransportError::Connection(e.to_string());
                        log::error!("{}. Reconnecting in {}s...", err, self.reconnect_delay.as_secs());
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        if let Some(task) = connect_task {
            task.abort();
        }
        self.teardown().await;
    }

    /// Releases subscriptions while still polling so the requests reach the
    /// broker.
    async fn teardown(&mut self) {
        let subscriber = self.subscriber.clone();
        let eventloop = &mut self.eventloop;

        let release = subscriber.release_all();
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        let both = async { tokio::join!(release, drain) };
        match tokio::time::timeout(self.teardown_timeout, both).await {
            Ok(_) => log::info!("Disconnected from MQTT broker at {}", self.endpoint),
            Err(_) => log::warn!(
                "MQTT teardown did not finish within {}s, closing anyway",
                self.teardown_timeout.as_secs()
            ),
        }
    }
}
