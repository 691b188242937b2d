//! Program sequencer: runs an ordered list of zones one after another, each
//! with its own optional parameter overrides.
//!
//! A program run is a spawned task holding one cancellation token. Every zone
//! it starts is a child of that token, so stopping the program also stops the
//! zone that is currently watering, and nothing later in the list starts.

use chrono::{Local, NaiveDate, NaiveTime};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::predicate::{self, Predicate};
use crate::state::SharedState;
use crate::zone::{CycleHandle, CycleOutcome, Overrides, Zone};

/// One entry of a program's zone list.
#[derive(Clone)]
pub struct ProgramZone {
    pub zone: Arc<Zone>,
    pub overrides: Overrides,
}

#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub id: String,
    pub name: String,
    /// Daily start time; `None` means manual only.
    pub start: Option<NaiveTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramSnapshot {
    pub running: bool,
    /// Display name of the zone currently being run.
    pub running_zone: Option<String>,
    pub last_run: NaiveDate,
    pub days_since: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramStatus {
    pub id: String,
    pub name: String,
    pub start: Option<String>,
    pub zones: Vec<String>,
    pub summary: String,
    #[serde(flatten)]
    pub snapshot: ProgramSnapshot,
}

/// Interpret a persisted last-run date. Missing or malformed values fall
/// back to `today`.
pub fn restore_last_run(stored: Option<&str>, today: NaiveDate) -> NaiveDate {
    match stored {
        None => today,
        Some(raw) => match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(day) => day,
            Err(e) => {
                warn!(value = raw, "ignoring malformed last_run date: {e}");
                today
            }
        },
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub struct Program {
    spec: ProgramSpec,
    predicate: Option<Arc<dyn Predicate>>,
    zones: Vec<ProgramZone>,
    snapshot: watch::Sender<ProgramSnapshot>,
    gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<CycleHandle>>,
    events: SharedState,
    store: Option<Db>,
}

impl Program {
    pub fn new(
        spec: ProgramSpec,
        predicate: Option<Arc<dyn Predicate>>,
        zones: Vec<ProgramZone>,
        last_run: NaiveDate,
        events: SharedState,
        store: Option<Db>,
    ) -> Arc<Self> {
        let (snapshot, _rx) = watch::channel(ProgramSnapshot {
            running: false,
            running_zone: None,
            last_run,
            days_since: (today() - last_run).num_days(),
            last_error: None,
        });
        Arc::new(Self {
            spec,
            predicate,
            zones,
            snapshot,
            gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
            events,
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn start_time(&self) -> Option<NaiveTime> {
        self.spec.start
    }

    pub fn snapshot(&self) -> ProgramSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> ProgramStatus {
        let snapshot = self.snapshot();
        let start = self.spec.start.map(|t| t.format("%H:%M").to_string());
        let name = self.name();
        let summary = match (&snapshot.running_zone, &start) {
            (Some(zone), _) if snapshot.running => format!("{name}, running {zone}"),
            (_, Some(at)) => format!(
                "{name}, runs at {at}, last ran {} day(s) ago",
                snapshot.days_since
            ),
            (_, None) => format!("{name}, last ran {} day(s) ago", snapshot.days_since),
        };
        ProgramStatus {
            id: self.spec.id.clone(),
            name: name.to_string(),
            start,
            zones: self.zones.iter().map(|z| z.zone.id().to_string()).collect(),
            summary,
            snapshot,
        }
    }

    /// Start a program run. A run already in flight is stopped and awaited
    /// first.
    pub async fn run(self: &Arc<Self>, skip_predicate: bool) -> CycleHandle {
        let _gate = self.gate.lock().await;

        if let Some(prev) = self.current() {
            if !prev.is_finished() {
                debug!(program = %self.spec.id, "stopping in-flight run before restart");
                prev.stop();
                prev.finished().await;
            }
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let handle = CycleHandle::new(cancel.clone(), done_rx);
        self.set_current(handle.clone());
        self.snapshot.send_modify(|s| {
            s.running = true;
            s.running_zone = None;
        });

        let program = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = program.sequence(skip_predicate, &cancel).await;
            program.snapshot.send_modify(|s| {
                s.running = false;
                s.running_zone = None;
            });
            done_tx.send_replace(Some(outcome));
        });

        handle
    }

    /// Request cancellation of the current run. Never blocks.
    pub fn stop(&self) {
        if let Some(handle) = self.current() {
            handle.stop();
        }
    }

    /// Cancel the current run and wait until its active zone is OFF and no
    /// further zone can start.
    pub async fn stop_and_wait(&self) {
        let _gate = self.gate.lock().await;
        if let Some(handle) = self.current() {
            if !handle.is_finished() {
                handle.stop();
                handle.finished().await;
            }
        }
    }

    /// Recompute `days_since` against the current local date.
    pub fn refresh(&self) {
        let days = (today() - self.snapshot.borrow().last_run).num_days();
        self.snapshot.send_modify(|s| s.days_since = days);
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

    async fn sequence(&self, skip_predicate: bool, cancel: &CancellationToken) -> CycleOutcome {
        let id = &self.spec.id;

        if !skip_predicate {
            match predicate::should_run(self.predicate.as_ref()) {
                Ok(true) => {}
                Ok(false) => {
                    info!(program = %id, "predicate false, program not run");
                    self.events
                        .write()
                        .await
                        .record_program(id, "skipped (predicate false)");
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

        self.mark_ran(today()).await;
        info!(program = %id, zones = self.zones.len(), skip_predicate, "program started");
        self.events.write().await.record_program(id, "started");

        let mut outcome = CycleOutcome::Completed;
        for entry in &self.zones {
            if cancel.is_cancelled() {
                outcome = CycleOutcome::Stopped;
                break;
            }

            let zone = &entry.zone;
            let params = entry.overrides.resolve(zone.defaults());
            self.snapshot
                .send_modify(|s| s.running_zone = Some(zone.name().to_string()));
            self.events
                .write()
                .await
                .record_program(id, format!("running {}", zone.id()));

            let handle = zone.start_within(params, skip_predicate, cancel).await;
            let zone_outcome = handle.finished().await;
            debug!(program = %id, zone = %zone.id(), outcome = zone_outcome.as_str(), "zone done");

            if cancel.is_cancelled() {
                outcome = CycleOutcome::Stopped;
                break;
            }
        }

        info!(program = %id, outcome = outcome.as_str(), "program finished");
        self.events
            .write()
            .await
            .record_program(id, outcome.as_str());
        outcome
    }

    /// Update and persist the last-run date. Runs before any zone starts.
    async fn mark_ran(&self, day: NaiveDate) {
        self.snapshot.send_modify(|s| {
            s.last_run = day;
            s.days_since = 0;
            s.last_error = None;
        });
        if let Some(db) = &self.store {
            if let Err(e) = db.save_last_run(&self.spec.id, day).await {
                error!(program = %self.spec.id, "db: save_last_run failed: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
