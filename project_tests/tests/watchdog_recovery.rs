use std::time::Duration;

use lib_energy::configs::{RecoveryStrategy, WatchdogPolicy, WindowPolicy};
use lib_energy::core::{FeedHealth, TickOutcome, WatchdogExit};
use project_tests::{reading, topic, Harness, MemoryGateway};
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_700_000_000;

fn policy(strategy: RecoveryStrategy) -> WatchdogPolicy {
    WatchdogPolicy::new(Duration::from_secs(60), Duration::from_secs(660), strategy, true).unwrap()
}

fn harness() -> Harness {
    Harness::new(
        MemoryGateway::with_devices(&[(1, "gw-01", 1), (2, "gw-02", 1), (3, "meter-x", 3)]),
        WindowPolicy::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_soft_recovery_runs_once_per_silence_period() {
    let h = harness();
    let mut watchdog = h.watchdog(policy(RecoveryStrategy::Soft));

    tokio::time::advance(Duration::from_secs(661)).await;
    assert_eq!(watchdog.tick().await, TickOutcome::Recovered { resubscribed: 2 });
    assert_eq!(watchdog.health(), FeedHealth::Resubscribing);
    assert_eq!(h.subscriber.requests(), vec![topic("gw-01"), topic("gw-02")]);

    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(watchdog.tick().await, TickOutcome::StillSilent);
    }
    assert_eq!(h.subscriber.requests().len(), 2);

    h.dispatcher.handle(&topic("gw-01"), &reading(T0, 1.0)).await;
    assert_eq!(watchdog.tick().await, TickOutcome::Healthy);
    assert_eq!(watchdog.health(), FeedHealth::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_steady_traffic_never_triggers_recovery() {
    let h = harness();
    let mut watchdog = h.watchdog(policy(RecoveryStrategy::Hard));

    for i in 0..30 {
        tokio::time::advance(Duration::from_secs(60)).await;
        h.dispatcher.handle(&topic("gw-02"), &reading(T0 + i * 60, i as f64)).await;
        assert_eq!(watchdog.tick().await, TickOutcome::Healthy);
    }
    // Windows of 7 fill at the 7th reading, then every 6th.
    assert_eq!(h.gateway.writes().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_new_gateway_is_picked_up_by_the_tick() {
    let h = harness();
    let mut watchdog = h.watchdog(policy(RecoveryStrategy::Soft));

    watchdog.tick().await;
    let before = h.subscriber.requests().len();

    h.gateway.register(4, "gw-04", 1);
    tokio::time::advance(Duration::from_secs(60)).await;
    watchdog.tick().await;

    let requests = h.subscriber.requests();
    assert_eq!(requests.len(), before + 1);
    assert_eq!(requests.last(), Some(&topic("gw-04")));
}

#[tokio::test(start_paused = true)]
async fn test_hard_recovery_asks_for_restart() {
    let h = harness();
    let mut watchdog = h.watchdog(policy(RecoveryStrategy::Hard));

    let exit = watchdog.run(CancellationToken::new()).await;
    assert_eq!(exit, WatchdogExit::RestartRequested);
    assert_eq!(watchdog.health(), FeedHealth::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_the_timer() {
    let h = harness();
    let mut watchdog = h.watchdog(policy(RecoveryStrategy::Hard));
    let token = CancellationToken::new();

    let task_token = token.clone();
    let task = tokio::spawn(async move { watchdog.run(task_token).await });

    tokio::time::advance(Duration::from_secs(300)).await;
    token.cancel();
    assert_eq!(task.await.unwrap(), WatchdogExit::Shutdown);
}
