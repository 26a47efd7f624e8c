use anyhow::Result;
use backflow::prelude::*;
use backflow::{telemetry, ENGINE_NAME, VERSION};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration: an optional TOML file, then BACKFLOW__* variables.
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = FlowConfig::load(path.as_deref())?;

    // 2. Initialize structured logging.
    telemetry::init(&config.logging)?;
    info!("{} v{} scenario runner", ENGINE_NAME, VERSION);

    // 3. Run the scenarios.
    demand_and_errors();
    chunked_prefetch();
    virtual_time(&config);
    shared_upstream(&config);
    real_time(&config).await?;

    Ok(())
}

/// Bounded demand, then a transform failure that cancels its upstream.
fn demand_and_errors() {
    info!("--- scenario: map failure ---");
    Flux::range(1, 5)
        .try_map(|i| {
            if i == 4 {
                Err(format!("refusing to map {i}"))
            } else {
                Ok(i * 100)
            }
        })
        .log_named("scenario.map")
        .subscribe_all(
            |value| info!("[MAP] => {}", value),
            |err| warn!("[MAP] failed: {}", err),
            || info!("[MAP] completed"),
        );
}

/// Unbounded downstream demand served in chunks of three.
fn chunked_prefetch() {
    info!("--- scenario: limit_rate ---");
    Flux::range(0, 7)
        .log_named("scenario.upstream")
        .limit_rate(3)
        .subscribe(|value| info!("[RATE] => {}", value));
}

/// An interval and a delay driven by a virtual clock.
fn virtual_time(config: &FlowConfig) {
    info!("--- scenario: virtual time ---");
    let clock = VirtualClock::new();
    let ticks = Flux::interval_with(
        Duration::from_secs(1),
        Arc::new(clock.clone()),
        config.interval_overflow,
    )
    .take(3)
    .delay_elements_on(Duration::from_millis(500), Arc::new(clock.clone()));

    ticks.subscribe_all(
        move |tick| info!("[VIRTUAL] tick {}", tick),
        |err| warn!("[VIRTUAL] failed: {}", err),
        || info!("[VIRTUAL] completed"),
    );
    let fired = clock.advance(Duration::from_secs(10));
    info!("[VIRTUAL] advanced 10s of virtual time, {} timers fired", fired);
}

/// Two subscribers trigger the hub; a third one joins late.
fn shared_upstream(config: &FlowConfig) {
    info!("--- scenario: hub ---");
    let clock = VirtualClock::new();
    let hub = Flux::range(1, 10)
        .delay_elements_on(Duration::from_millis(100), Arc::new(clock.clone()))
        .publish_with(config.hub_overflow);
    let shared = hub.auto_connect(2);

    shared.subscribe(|v| info!("[HUB] first  <- {}", v));
    shared.subscribe(|v| info!("[HUB] second <- {}", v));
    clock.advance(Duration::from_millis(300));

    shared.subscribe(|v| info!("[HUB] late   <- {}", v));
    clock.advance(Duration::from_secs(1));
    info!("[HUB] final phase: {:?}", hub.phase());
}

/// A real interval on the current tokio runtime.
async fn real_time(config: &FlowConfig) -> Result<()> {
    info!("--- scenario: real time ---");
    let (done_tx, done_rx) = oneshot::channel();
    let done = Arc::new(Mutex::new(Some(done_tx)));
    let failed = done.clone();

    Flux::interval_with(
        Duration::from_millis(200),
        Arc::new(RealClock::current()),
        config.interval_overflow,
    )
    .take(5)
    .subscribe_all(
        |tick| info!("[REAL] tick {}", tick),
        move |err| {
            if let Some(tx) = failed.lock().take() {
                let _ = tx.send(Err(err));
            }
        },
        move || {
            if let Some(tx) = done.lock().take() {
                let _ = tx.send(Ok(()));
            }
        },
    );

    done_rx.await??;
    info!("[REAL] completed");
    Ok(())
}
