//! Zone cycle engine: drives one zone through timed water/wait/repeat cycles.
//!
//! ## Per-run state machine
//!
//! ```text
//! Off ──[start, predicate ok]──▶ Watering ──[water elapsed, more repeats, wait > 0]──▶ Waiting
//!  ▲                               │  ▲                                                  │
//!  │                               │  └────────────────[wait elapsed]────────────────────┘
//!  └──[last repeat done | stop]────┘
//! ```
//!
//! Each run is a spawned task that only suspends at tick boundaries and
//! selects between "tick elapsed" and "cancelled". Whatever ends the run,
//! the actuator is commanded OFF before the run reports finished.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::actuator::Actuator;
use crate::db::Db;
use crate::error::ControllerError;
use crate::predicate::{self, Predicate};
use crate::state::SharedState;

/// Granularity of the countdown and of the remaining-time updates.
pub const TICK_SECS: u64 = 1;

/// Accepted ranges for cycle parameters, from config or from a command.
pub const WATER_RANGE: RangeInclusive<u32> = 1..=30;
pub const WAIT_RANGE: RangeInclusive<u32> = 0..=30;
pub const REPEAT_RANGE: RangeInclusive<u32> = 1..=30;

pub const DEFAULT_ICON_ON: &str = "mdi:water";
pub const DEFAULT_ICON_WAIT: &str = "mdi:timer-sand";
pub const DEFAULT_ICON_OFF: &str = "mdi:water-off";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Off,
    Watering,
    Waiting,
}

/// Water and wait are minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleParams {
    pub water: u32,
    pub wait: u32,
    pub repeat: u32,
}

impl CycleParams {
    /// Estimated run time. The wait after the final watering never
    /// happens, so it is not counted.
    pub fn total_secs(&self) -> u64 {
        let water = u64::from(self.water);
        let wait = u64::from(self.wait);
        let repeat = u64::from(self.repeat);
        water
            .saturating_add(wait)
            .saturating_mul(repeat)
            .saturating_sub(wait)
            .saturating_mul(60)
    }

    /// Check every value against its accepted range.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value, range) in [
            ("water", self.water, WATER_RANGE),
            ("wait", self.wait, WAIT_RANGE),
            ("repeat", self.repeat, REPEAT_RANGE),
        ] {
            if !range.contains(&value) {
                return Err(format!(
                    "{field} must be {}..={}, got {value}",
                    range.start(),
                    range.end()
                ));
            }
        }
        Ok(())
    }
}

/// Optional per-run overrides, from a program's zone entry or a `run_zone`
/// command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Overrides {
    pub water: Option<u32>,
    pub wait: Option<u32>,
    pub repeat: Option<u32>,
}

impl Overrides {
    /// A missing or zero `water` means "no override" for all three values.
    pub fn resolve(&self, defaults: CycleParams) -> CycleParams {
        match self.water {
            Some(water) if water > 0 => CycleParams {
                water,
                wait: self.wait.unwrap_or(defaults.wait),
                repeat: self.repeat.filter(|r| *r > 0).unwrap_or(defaults.repeat),
            },
            _ => defaults,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Icons {
    pub on: String,
    pub wait: String,
    pub off: String,
}

impl Icons {
    pub fn for_phase(&self, phase: Phase) -> &str {
        match phase {
            Phase::Off => &self.off,
            Phase::Waiting => &self.wait,
            Phase::Watering => &self.on,
        }
    }
}

impl Default for Icons {
    fn default() -> Self {
        Self {
            on: DEFAULT_ICON_ON.to_string(),
            wait: DEFAULT_ICON_WAIT.to_string(),
            off: DEFAULT_ICON_OFF.to_string(),
        }
    }
}

/// Immutable view of a zone, swapped atomically on every change.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSnapshot {
    pub phase: Phase,
    pub remaining_secs: u64,
    /// 1-based index of the current repeat, 0 when idle.
    pub cycle: u32,
    pub repeat: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ZoneSnapshot {
    fn idle() -> Self {
        Self {
            phase: Phase::Off,
            remaining_secs: 0,
            cycle: 0,
            repeat: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Completed,
    Stopped,
    /// Predicate evaluated false.
    Skipped,
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Completed => "completed",
            CycleOutcome::Stopped => "stopped",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Failed => "failed",
        }
    }
}

/// Configuration-derived identity and defaults of a zone.
#[derive(Debug, Clone)]
pub struct ZoneSpec {
    pub id: String,
    pub name: String,
    pub defaults: CycleParams,
    pub icons: Icons,
}

/// What the status API shows for a zone.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStatus {
    pub id: String,
    pub name: String,
    pub switch: String,
    pub switch_on: bool,
    /// A run is in flight, whatever its phase.
    pub running: bool,
    pub icon: String,
    pub defaults: CycleParams,
    #[serde(flatten)]
    pub snapshot: ZoneSnapshot,
}

// ---------------------------------------------------------------------------
// Cycle handle
// ---------------------------------------------------------------------------

/// Handle to one run (a zone cycle or a whole program): request a stop, or
/// await completion.
#[derive(Clone)]
pub struct CycleHandle {
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<CycleOutcome>>,
}

impl CycleHandle {
    pub(crate) fn new(cancel: CancellationToken, outcome: watch::Receiver<Option<CycleOutcome>>) -> Self {
        Self { cancel, outcome }
    }

    /// Request cancellation. Idempotent, never blocks.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Resolves once the run is over and the actuator has been commanded OFF.
    pub async fn finished(&self) -> CycleOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(o) => (*o).unwrap_or(CycleOutcome::Failed),
            // Sender dropped without a result: the task panicked.
            Err(_) => CycleOutcome::Failed,
        };
        outcome
    }
}

/// Commands the actuator OFF if a run task unwinds before finishing.
struct OffOnDrop {
    actuator: Arc<dyn Actuator>,
    armed: bool,
}

impl Drop for OffOnDrop {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.actuator.set(false) {
                error!(actuator = %self.actuator.name(), "OFF after aborted run failed: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

pub struct Zone {
    spec: ZoneSpec,
    actuator: Arc<dyn Actuator>,
    predicate: Option<Arc<dyn Predicate>>,
    snapshot: watch::Sender<ZoneSnapshot>,
    /// Serialises start and stop_and_wait so a stop barrier can't interleave
    /// with a half-started run.
    gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<CycleHandle>>,
    events: SharedState,
    history: Option<Db>,
}

impl Zone {
    pub fn new(
        spec: ZoneSpec,
        actuator: Arc<dyn Actuator>,
        predicate: Option<Arc<dyn Predicate>>,
        events: SharedState,
        history: Option<Db>,
    ) -> Arc<Self> {
        let (snapshot, _rx) = watch::channel(ZoneSnapshot::idle());
        Arc::new(Self {
            spec,
            actuator,
            predicate,
            snapshot,
            gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            events,
            history,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn defaults(&self) -> CycleParams {
        self.spec.defaults
    }

    pub fn actuator(&self) -> &Arc<dyn Actuator> {
        &self.actuator
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> ZoneStatus {
        let snapshot = self.snapshot();
        ZoneStatus {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            switch: self.actuator.name().to_string(),
            switch_on: self.actuator.is_on(),
            running: self.is_running(),
            icon: self.spec.icons.for_phase(snapshot.phase).to_string(),
            defaults: self.spec.defaults,
            snapshot,
        }
    }

    /// Start a cycle run. A run already in flight is stopped, and its forced
    /// OFF awaited, before the new one begins.
    pub async fn start(self: &Arc<Self>, params: CycleParams, skip_predicate: bool) -> CycleHandle {
        self.start_within(params, skip_predicate, &CancellationToken::new())
            .await
    }

    /// Like [`Zone::start`], but the run is also cancelled when `parent` is.
    pub async fn start_within(
        self: &Arc<Self>,
        params: CycleParams,
        skip_predicate: bool,
        parent: &CancellationToken,
    ) -> CycleHandle {
        let _gate = self.gate.lock().await;

        if let Some(prev) = self.current() {
            if !prev.is_finished() {
                debug!(zone = %self.spec.id, "stopping in-flight run before restart");
                prev.stop();
                prev.finished().await;
            }
        }

        let cancel = parent.child_token();
        let (done_tx, done_rx) = watch::channel(None);
        let handle = CycleHandle::new(cancel.clone(), done_rx);
        self.set_current(handle.clone());

        let zone = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = OffOnDrop {
                actuator: Arc::clone(&zone.actuator),
                armed: true,
            };
            let outcome = zone.run_cycle(params, skip_predicate, &cancel).await;
            guard.armed = false;
            done_tx.send_replace(Some(outcome));
        });

        handle
    }

    /// Request cancellation of the current run, if any. Never blocks.
    pub fn stop(&self) {
        if let Some(handle) = self.current() {
            handle.stop();
        }
    }

    /// Stop barrier: cancel the current run and wait until it has forced
    /// the actuator OFF. With nothing running, issue the safety OFF directly.
    pub async fn stop_and_wait(&self) {
        let _gate = self.gate.lock().await;

        match self.current() {
            Some(handle) if !handle.is_finished() => {
                handle.stop();
                handle.finished().await;
            }
            _ => {
                if let Err(e) = self.actuator.set(false) {
                    error!(zone = %self.spec.id, "safety OFF failed: {e:#}");
                }
            }
        }
    }

    fn current(&self) -> Option<CycleHandle> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current(&self, handle: CycleHandle) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    // -- Run task ---------------------------------------------------------

    async fn run_cycle(
        &self,
        params: CycleParams,
        skip_predicate: bool,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let id = &self.spec.id;

        if !skip_predicate {
            match predicate::should_run(self.predicate.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(zone = %id, "predicate false, not watering");
                    self.events.write().await.record_zone(id, "skipped (predicate false)");
                    return CycleOutcome::Skipped;
                }
                Err(e) => {
                    e.log(id);
                    let msg = e.to_string();
                    self.snapshot.send_modify(|s| s.last_error = Some(msg.clone()));
                    self.events
                        .write()
                        .await
                        .record_error(format!("{id}: {msg}"));
                    return CycleOutcome::Failed;
                }
            }
        }

        info!(
            zone = %id,
            water_min = params.water,
            wait_min = params.wait,
            repeat = params.repeat,
            total_sec = params.total_secs(),
            "zone cycle started"
        );
        self.events.write().await.record_zone(
            id,
            format!(
                "started (water {}m, wait {}m, repeat {})",
                params.water, params.wait, params.repeat
            ),
        );

        let started_at = Utc::now();
        let outcome = match self.drive(params, cancel).await {
            Ok(true) => CycleOutcome::Completed,
            Ok(false) => {
                self.force_off(None);
                CycleOutcome::Stopped
            }
            Err(e) => {
                error!(zone = %id, "zone cycle aborted: {e:#}");
                let msg = e.to_string();
                self.force_off(Some(msg.clone()));
                self.events
                    .write()
                    .await
                    .record_error(format!("{id}: {msg}"));
                CycleOutcome::Failed
            }
        };

        info!(zone = %id, outcome = outcome.as_str(), "zone cycle finished");
        self.events
            .write()
            .await
            .record_zone(id, outcome.as_str());

        if let Some(db) = &self.history {
            if let Err(e) = db
                .insert_watering_event(started_at, Utc::now(), id, outcome.as_str())
                .await
            {
                error!(zone = %id, "db: insert_watering_event failed: {e:#}");
            }
        }

        outcome
    }

    /// Returns `Ok(true)` when every repeat ran to the end, `Ok(false)` when
    /// cancelled. Cancelled and failed runs leave the forced OFF to the caller.
    async fn drive(&self, params: CycleParams, cancel: &CancellationToken) -> Result<bool, ControllerError> {
        let mut remaining = params.total_secs();
        let repeat = params.repeat;
        self.snapshot.send_modify(|s| s.last_error = None);

        for i in (1..=repeat).rev() {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let cycle = repeat - i + 1;

            self.command(true)?;
            self.publish(Phase::Watering, remaining, cycle, repeat);
            debug!(zone = %self.spec.id, cycle, repeat, "watering");
            if !self
                .count_down(params.water, &mut remaining, Phase::Watering, cycle, repeat, cancel)
                .await
            {
                return Ok(false);
            }

            if params.wait > 0 && i > 1 {
                self.command(false)?;
                self.publish(Phase::Waiting, remaining, cycle, repeat);
                debug!(zone = %self.spec.id, cycle, repeat, "waiting");
                if !self
                    .count_down(params.wait, &mut remaining, Phase::Waiting, cycle, repeat, cancel)
                    .await
                {
                    return Ok(false);
                }
            }

            if i == 1 {
                self.command(false)?;
                self.publish(Phase::Off, 0, 0, 0);
            }
        }

        Ok(true)
    }

    /// Count `minutes` down in ticks. Returns `false` if cancelled.
    async fn count_down(
        &self,
        minutes: u32,
        remaining: &mut u64,
        phase: Phase,
        cycle: u32,
        repeat: u32,
        cancel: &CancellationToken,
    ) -> bool {
        let mut left = u64::from(minutes) * 60;
        while left > 0 {
            let step = left.min(TICK_SECS);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_secs(step)) => {}
            }
            left -= step;
            *remaining = remaining.saturating_sub(step);
            self.publish(phase, *remaining, cycle, repeat);
        }
        true
    }

    fn command(&self, on: bool) -> Result<(), ControllerError> {
        self.actuator
            .set(on)
            .map_err(|source| ControllerError::Actuator {
                actuator: self.actuator.name().to_string(),
                source,
            })
    }

    fn publish(&self, phase: Phase, remaining_secs: u64, cycle: u32, repeat: u32) {
        self.snapshot.send_modify(|s| {
            s.phase = phase;
            s.remaining_secs = remaining_secs;
            s.cycle = cycle;
            s.repeat = repeat;
            s.updated_at = Utc::now();
        });
    }

    /// Unconditional OFF plus the final idle snapshot.
    fn force_off(&self, last_error: Option<String>) {
        if let Err(e) = self.actuator.set(false) {
            error!(zone = %self.spec.id, "forced OFF failed: {e:#}");
        }
        self.publish(Phase::Off, 0, 0, 0);
        if last_error.is_some() {
            self.snapshot.send_modify(|s| s.last_error = last_error);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
