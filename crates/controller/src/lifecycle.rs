//! Startup and shutdown safety: every actuator is forced OFF no matter what
//! the in-memory state claims.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, Registry};
use crate::state::SharedState;

/// Cancel `stop` on the first SIGINT or SIGTERM.
///
/// Both listeners are registered before this returns, and a cancelled token
/// stays cancelled, so a signal is never lost while the caller is busy.
pub fn listen_for_signals(stop: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = stop.cancelled() => return,
        }
        stop.cancel();
    }))
}

/// Sleep for `delay` unless a stop is requested first. Returns `false` when
/// stopping.
pub async fn pause_unless_stopped(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Command every zone's actuator OFF directly. Returns how many commands
/// failed; a failure on one zone doesn't stop the others.
pub fn force_all_off(registry: &Registry) -> usize {
    let mut failures = 0;
    for zone in registry.zones.values() {
        if let Err(e) = zone.actuator().set(false) {
            error!(zone = %zone.id(), "forced OFF failed: {e:#}");
            failures += 1;
        }
    }
    failures
}

/// Runs once before any command is accepted.
pub async fn on_startup(registry: &Registry, events: &SharedState) {
    let failures = force_all_off(registry);
    info!(zones = registry.zones.len(), failures, "startup: all actuators forced OFF");
    events
        .write()
        .await
        .record_system(format!("startup: {} actuator(s) forced OFF", registry.zones.len()));
}

/// Stop every run cooperatively, then force OFF anything a failed stop may
/// have left energised.
pub async fn shutdown(dispatcher: &Dispatcher, events: &SharedState) {
    info!("shutdown: stopping all programs and zones");
    dispatcher.stop_all().await;
    let failures = force_all_off(dispatcher.registry());
    info!(failures, "shutdown: all actuators forced OFF");
    events.write().await.record_system("shutdown".to_string());
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::Actuator;
    use crate::state;
    use crate::testing::{self, journal, params};
    use crate::zone::Overrides;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn startup_turns_off_actuators_left_on() {
        let j = journal();
        let (lawn, lawn_act) = testing::zone("lawn", params(1, 0, 1), &j);
        let (beds, beds_act) = testing::zone("beds", params(1, 0, 1), &j);
        lawn_act.set(true).unwrap();

        let mut registry = Registry::default();
        registry.zones.insert("lawn".into(), lawn);
        registry.zones.insert("beds".into(), beds);

        let events = state::shared();
        on_startup(&registry, &events).await;

        assert!(!lawn_act.is_on());
        assert_eq!(lawn_act.last_command(), Some(false));
        assert_eq!(beds_act.commands(), vec![false]);
        assert_eq!(events.read().await.events.len(), 1);
    }

    #[tokio::test]
    async fn failing_actuator_does_not_block_others() {
        let j = journal();
        let (lawn, _lawn_act) = testing::zone("lawn", params(1, 0, 1), &j);
        let (beds, beds_act) = testing::zone("beds", params(1, 0, 1), &j);
        let (alpha, alpha_act) = testing::zone("alpha", params(1, 0, 1), &j);
        alpha_act.fail_off_commands();

        let mut registry = Registry::default();
        registry.zones.insert("alpha".into(), alpha);
        registry.zones.insert("lawn".into(), lawn);
        registry.zones.insert("beds".into(), beds);
        assert_eq!(force_all_off(&registry), 1);
        assert_eq!(beds_act.commands(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_runs_to_completion_without_stop() {
        let stop = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(pause_unless_stopped(&stop, Duration::from_secs(2)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_requested_before_pause_is_not_lost() {
        let stop = CancellationToken::new();
        stop.cancel();
        let started = tokio::time::Instant::now();
        assert!(!pause_unless_stopped(&stop, Duration::from_secs(2)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_pause_cuts_it_short() {
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();
        assert!(!pause_unless_stopped(&stop, Duration::from_secs(2)).await);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn sigterm_requests_stop() {
        let stop = CancellationToken::new();
        let listener = listen_for_signals(stop.clone()).unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), stop.cancelled())
            .await
            .expect("SIGTERM did not cancel the token");
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn listener_exits_when_stopped_elsewhere() {
        let stop = CancellationToken::new();
        let listener = listen_for_signals(stop.clone()).unwrap();
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_runs_and_forces_off() {
        let j = journal();
        let events = state::shared();
        let (lawn, lawn_act) = testing::zone_with("lawn", params(10, 0, 1), &j, None, events.clone());

        let mut registry = Registry::default();
        registry.zones.insert("lawn".into(), Arc::clone(&lawn));
        let dispatcher = Dispatcher::new(Arc::new(registry), events.clone());

        let handle = dispatcher
            .run_zone("lawn", Overrides::default(), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(lawn_act.is_on());

        shutdown(&dispatcher, &events).await;
        assert!(handle.is_finished());
        assert!(!lawn_act.is_on());
        assert_eq!(lawn_act.last_command(), Some(false));
    }
}
