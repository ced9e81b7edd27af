//! # Energy Ingestion Server
//!
//! Subscribes to the per-gateway energy counter topics on the MQTT broker,
//! turns the cumulative readings into consumption deltas and writes them to
//! PostgreSQL.
//!
//! Two tasks run until Ctrl-C / SIGTERM:
//! - the MQTT feed, delivering messages to the ingestion dispatcher,
//! - the liveness watchdog, reconciling the registry and recovering a
//!   silent feed.
//!
//! With `--recovery-strategy hard` the watchdog may ask for a restart; the
//! server then shuts both tasks down and re-executes itself with the same
//! arguments.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_energy::connections::PgGateway;
use lib_energy::core::{DeltaEngine, IngestDispatcher, LivenessClock, TopicResolver, Watchdog, WatchdogExit};
use lib_energy::ingestors::MqttFeed;

mod energy_logic;
use energy_logic::config::{self, Settings};
use energy_logic::logger;
use energy_logic::restart::Invocation;

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = Invocation::capture()?;

    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let settings = Settings::try_from(config::load_config()?).context("invalid configuration")?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    log::info!(
        "Starting energy ingestion: broker {}:{}, window {} (threshold {}, {} / {}), {} decoding",
        settings.mqtt.host,
        settings.mqtt.port,
        settings.window.capacity,
        settings.window.emit_threshold,
        settings.window.delta_mode,
        settings.window.negative_delta,
        settings.profile.strictness
    );

    let gateway = Arc::new(PgGateway::new(&settings.database).context("failed to set up database pool")?);
    match gateway.ping().await {
        Ok(()) => log::info!("Database connection pool ready."),
        Err(e) => log::warn!("Database not reachable yet, continuing: {}", e),
    }

    let (feed, subscriber) = MqttFeed::new(&settings.mqtt);
    let resolver = Arc::new(TopicResolver::new(
        gateway.clone(),
        subscriber,
        settings.scheme.clone(),
        settings.store_timeout,
    ));
    let dispatcher = Arc::new(IngestDispatcher::new(
        DeltaEngine::new(settings.window),
        settings.profile.clone(),
        gateway,
        resolver,
        Arc::new(LivenessClock::new()),
        settings.store_timeout,
    ));

    let shutdown = CancellationToken::new();

    let feed_handle = tokio::spawn(feed.run(dispatcher.clone(), shutdown.clone()));

    let mut watchdog = Watchdog::new(settings.watchdog, dispatcher.clone());
    let watchdog_token = shutdown.clone();
    let mut watchdog_handle = tokio::spawn(async move { watchdog.run(watchdog_token).await });

    let exit = tokio::select! {
        _ = shutdown_signal() => {
            shutdown.cancel();
            watchdog_handle.await.context("watchdog task failed")?
        }
        exit = &mut watchdog_handle => exit.context("watchdog task failed")?,
    };

    // Send shutdown signal to all components
    shutdown.cancel();
    feed_handle.await.context("MQTT feed task failed")?;

    let stats = dispatcher.stats();
    log::info!(
        "Decoded {} message(s), windowed {} sample(s), wrote {} delta(s), {} write failure(s).",
        stats.decoded,
        stats.accepted,
        stats.emitted,
        stats.write_failures
    );

    if exit == WatchdogExit::RestartRequested {
        return Err(invocation.reexec());
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
