//! Test doubles shared by the unit tests of several modules.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::actuator::Actuator;
use crate::error::PredicateError;
use crate::predicate::Predicate;
use crate::state::{self, SharedState};
use crate::zone::{CycleParams, Icons, Zone, ZoneSpec};

/// Every command issued to any actuator sharing the journal, in order.
pub type Journal = Arc<Mutex<Vec<(String, bool)>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Actuator that records every command instead of driving hardware.
pub struct RecordingActuator {
    name: String,
    journal: Journal,
    on: AtomicBool,
    fail_on: AtomicBool,
    fail_off: AtomicBool,
}

impl RecordingActuator {
    pub fn shared(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            on: AtomicBool::new(false),
            fail_on: AtomicBool::new(false),
            fail_off: AtomicBool::new(false),
        })
    }

    /// Make every ON command fail; OFF keeps working.
    pub fn fail_on_commands(&self) {
        self.fail_on.store(true, Ordering::SeqCst);
    }

    pub fn fail_off_commands(&self) {
        self.fail_off.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<bool> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == &self.name)
            .map(|(_, on)| *on)
            .collect()
    }

    pub fn last_command(&self) -> Option<bool> {
        self.commands().last().copied()
    }
}

impl Actuator for RecordingActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, on: bool) -> Result<()> {
        let failing = if on { &self.fail_on } else { &self.fail_off };
        if failing.load(Ordering::SeqCst) {
            bail!("{}: relay did not respond", self.name);
        }
        self.journal.lock().unwrap().push((self.name.clone(), on));
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

/// Predicate whose result the test controls.
pub struct ScriptedPredicate {
    result: Mutex<Result<Option<bool>, PredicateError>>,
}

impl ScriptedPredicate {
    pub fn new(result: Result<Option<bool>, PredicateError>) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(result),
        })
    }
}

impl Predicate for ScriptedPredicate {
    fn expression(&self) -> &str {
        "<scripted>"
    }

    fn evaluate(&self) -> Result<Option<bool>, PredicateError> {
        self.result.lock().unwrap().clone()
    }
}

pub fn params(water: u32, wait: u32, repeat: u32) -> CycleParams {
    CycleParams {
        water,
        wait,
        repeat,
    }
}

pub fn zone_spec(id: &str, defaults: CycleParams) -> ZoneSpec {
    ZoneSpec {
        id: id.to_string(),
        name: id.to_uppercase(),
        defaults,
        icons: Icons::default(),
    }
}

/// Zone with a recording actuator, no predicate, no history.
pub fn zone(id: &str, defaults: CycleParams, journal: &Journal) -> (Arc<Zone>, Arc<RecordingActuator>) {
    zone_with(id, defaults, journal, None, state::shared())
}

pub fn zone_with(
    id: &str,
    defaults: CycleParams,
    journal: &Journal,
    predicate: Option<Arc<dyn Predicate>>,
    events: SharedState,
) -> (Arc<Zone>, Arc<RecordingActuator>) {
    let actuator = RecordingActuator::shared(id, journal);
    let zone = Zone::new(
        zone_spec(id, defaults),
        actuator.clone(),
        predicate,
        events,
        None,
    );
    (zone, actuator)
}
