//! # Liveness Watchdog
//!
//! A single timer task. On every tick it:
//!
//! 1. Measures the silence since the last accepted message.
//! 2. If the silence exceeds the threshold and has not been handled yet,
//!    marks the feed `Degraded` and runs recovery:
//!    - **soft**: re-subscribes every eligible topic (`Resubscribing`),
//!    - **hard**: stops and asks the caller to restart the process.
//! 3. Optionally reconciles the registry so new gateways are subscribed.
//! 4. Logs the ingestion counters.
//!
//! Recovery fires once per silence period. The watchdog remembers the
//! last-accepted instant it recovered for and re-arms only when a newer
//! message has been accepted. A recovery whose registry read failed re-arms
//! immediately so the next tick tries again.
//!
//! Ticks run one at a time inside the task, so the watchdog never overlaps
//! with itself. It never touches the engine lock, so message ingestion is not
//! blocked while it works.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::{RecoveryStrategy, WatchdogPolicy};
use crate::core::dispatcher::IngestDispatcher;

/// Health of the feed as seen by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedHealth {
    Healthy,
    /// Silence exceeded the threshold.
    Degraded,
    /// Soft recovery issued, waiting for data.
    Resubscribing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    /// Soft recovery ran and issued this many subscriptions.
    Recovered { resubscribed: usize },
    /// Soft recovery could not read the registry.
    RecoveryFailed,
    /// Silence already handled, still no data.
    StillSilent,
    RestartRequested,
}

/// Why [`Watchdog::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    Shutdown,
    /// Hard recovery: the process must be re-executed.
    RestartRequested,
}

pub struct Watchdog {
    policy: WatchdogPolicy,
    dispatcher: Arc<IngestDispatcher>,
    health: FeedHealth,
    /// Last-accepted instant the current recovery was run for.
    handled: Option<Instant>,
}

impl Watchdog {
    pub fn new(policy: WatchdogPolicy, dispatcher: Arc<IngestDispatcher>) -> Self {
        Self {
            policy,
            dispatcher,
            health: FeedHealth::Healthy,
            handled: None,
        }
    }

    pub fn health(&self) -> FeedHealth {
        self.health
    }

    /// Ticks every check interval until cancelled or a restart is needed.
    pub async fn run(&mut self, shutdown: CancellationToken) -> WatchdogExit {
        let mut ticker = interval(self.policy.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        log::info!(
            "Watchdog started: checking every {}s, silence threshold {}s, {} recovery",
            self.policy.check_interval.as_secs(),
            self.policy.silence_threshold.as_secs(),
            self.policy.strategy
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("Watchdog received shutdown signal.");
                    return WatchdogExit::Shutdown;
                }
                _ = ticker.tick() => {
                    if self.tick().await == TickOutcome::RestartRequested {
                        return WatchdogExit::RestartRequested;
                    }
                }
            }
        }
    }

    /// One watchdog check.
    pub async fn tick(&mut self) -> TickOutcome {
        let last_accepted = self.dispatcher.liveness().last_accepted();
        let silence = Instant::now().saturating_duration_since(last_accepted);

        let outcome = if silence > self.policy.silence_threshold {
            self.on_silence(last_accepted, silence).await
        } else {
            if self.health != FeedHealth::Healthy {
                log::info!("Data flow resumed, feed healthy again");
            }
            self.health = FeedHealth::Healthy;
            self.handled = None;
            TickOutcome::Healthy
        };

        if outcome == TickOutcome::RestartRequested {
            return outcome;
        }

        if self.policy.reconcile_every_tick {
            match self.dispatcher.resolver().reconcile().await {
                Ok(0) => log::debug!("Registry reconciled, no new subscriptions"),
                Ok(n) => log::info!("Registry reconciled, {} new subscription(s)", n),
                Err(e) => log::error!("Registry reconciliation failed: {}", e),
            }
        }

        let stats = self.dispatcher.stats();
        log::info!(
            "Ingestion: decoded={} accepted={} emitted={} duplicates={} undecodable={} unknown={} write_failures={} devices={}",
            stats.decoded,
            stats.accepted,
            stats.emitted,
            stats.duplicates,
            stats.undecodable,
            stats.unknown_device,
            stats.write_failures,
            self.dispatcher.tracked_devices()
        );

        outcome
    }

    async fn on_silence(&mut self, last_accepted: Instant, silence: Duration) -> TickOutcome {
        if self.handled == Some(last_accepted) {
            log::debug!("Still no data after {}s, recovery already issued", silence.as_secs());
            return TickOutcome::StillSilent;
        }

        self.health = FeedHealth::Degraded;
        self.handled = Some(last_accepted);
        log::warn!(
            "No data received for {}s (threshold {}s), starting {} recovery",
            silence.as_secs(),
            self.policy.silence_threshold.as_secs(),
            self.policy.strategy
        );

        match self.policy.strategy {
            RecoveryStrategy::Hard => {
                log::warn!("Requesting process restart");
                TickOutcome::RestartRequested
            }
            RecoveryStrategy::Soft => {
                self.health = FeedHealth::Resubscribing;
                match self.dispatcher.resolver().subscribe_all().await {
                    Ok(resubscribed) => {
                        log::info!("Resubscribed {} topic(s), waiting for data", resubscribed);
                        TickOutcome::Recovered { resubscribed }
                    }
                    Err(e) => {
                        log::error!("Recovery could not read the registry, retrying next tick: {}", e);
                        self.health = FeedHealth::Degraded;
                        self.handled = None;
                        TickOutcome::RecoveryFailed
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{PayloadProfile, TopicScheme, WindowPolicy};
    use crate::core::engine::DeltaEngine;
    use crate::core::liveness::LivenessClock;
    use crate::core::ports::{DeviceRecord, GatewayError, PersistenceGateway, TopicSubscriber, TransportError};
    use crate::core::registry::TopicResolver;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Registry {
        broken: AtomicBool,
    }

    #[async_trait]
    impl PersistenceGateway for Registry {
        async fn lookup_devices_by_protocol(&self) -> Result<Vec<DeviceRecord>, GatewayError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(GatewayError::Pool("connection refused".into()));
            }
            Ok(vec![DeviceRecord::new("a", 1), DeviceRecord::new("b", 1), DeviceRecord::new("c", 2)])
        }

        async fn lookup_device_id(&self, _name: &str) -> Result<Option<i32>, GatewayError> {
            Ok(Some(1))
        }

        async fn write_delta(&self, _n: &str, _t: i64, _d: f64, _id: i32) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSubscriber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopicSubscriber for CountingSubscriber {
        async fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<Registry>,
        subscriber: Arc<CountingSubscriber>,
        dispatcher: Arc<IngestDispatcher>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::default());
        let subscriber = Arc::new(CountingSubscriber::default());
        let resolver = Arc::new(TopicResolver::new(
            registry.clone(),
            subscriber.clone(),
            TopicScheme::default(),
            Duration::from_secs(1),
        ));
        let dispatcher = Arc::new(IngestDispatcher::new(
            DeltaEngine::new(WindowPolicy::default()),
            PayloadProfile::default(),
            registry.clone(),
            resolver,
            Arc::new(LivenessClock::new()),
            Duration::from_secs(1),
        ));
        Fixture {
            registry,
            subscriber,
            dispatcher,
        }
    }

    fn policy(strategy: RecoveryStrategy) -> WatchdogPolicy {
        WatchdogPolicy::new(Duration::from_secs(60), Duration::from_secs(120), strategy, false).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_feed_is_healthy() {
        let f = fixture();
        let mut dog = Watchdog::new(policy(RecoveryStrategy::Soft), f.dispatcher.clone());
        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(dog.tick().await, TickOutcome::Healthy);
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_recovery_fires_once_per_silence() {
        let f = fixture();
        let mut dog = Watchdog::new(policy(RecoveryStrategy::Soft), f.dispatcher.clone());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(dog.tick().await, TickOutcome::Recovered { resubscribed: 2 });
        assert_eq!(dog.health(), FeedHealth::Resubscribing);

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(60)).await;
            assert_eq!(dog.tick().await, TickOutcome::StillSilent);
        }
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 2);

        f.dispatcher.liveness().touch();
        assert_eq!(dog.tick().await, TickOutcome::Healthy);
        assert_eq!(dog.health(), FeedHealth::Healthy);

        // A new silence period triggers again.
        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(dog.tick().await, TickOutcome::Recovered { resubscribed: 2 });
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_is_retried() {
        let f = fixture();
        f.registry.broken.store(true, Ordering::SeqCst);
        let mut dog = Watchdog::new(policy(RecoveryStrategy::Soft), f.dispatcher.clone());

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(dog.tick().await, TickOutcome::RecoveryFailed);
        assert_eq!(dog.health(), FeedHealth::Degraded);

        f.registry.broken.store(false, Ordering::SeqCst);
        assert_eq!(dog.tick().await, TickOutcome::Recovered { resubscribed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_strategy_requests_restart_from_run() {
        let f = fixture();
        let mut dog = Watchdog::new(policy(RecoveryStrategy::Hard), f.dispatcher.clone());
        let exit = dog.run(CancellationToken::new()).await;
        assert_eq!(exit, WatchdogExit::RestartRequested);
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let mut dog = Watchdog::new(policy(RecoveryStrategy::Soft), f.dispatcher.clone());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(dog.run(token).await, WatchdogExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_reconciles_when_enabled() {
        let f = fixture();
        let policy = WatchdogPolicy {
            reconcile_every_tick: true,
            ..policy(RecoveryStrategy::Soft)
        };
        let mut dog = Watchdog::new(policy, f.dispatcher.clone());
        assert_eq!(dog.tick().await, TickOutcome::Healthy);
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 2);

        dog.tick().await;
        assert_eq!(f.subscriber.calls.load(Ordering::SeqCst), 2);
    }
}
