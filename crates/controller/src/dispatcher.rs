//! Command routing. Owns the registry of zones and programs built at
//! startup and turns named commands into calls on the right entity.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ControllerError;
use crate::program::{Program, ProgramStatus};
use crate::state::SharedState;
use crate::zone::{CycleHandle, Overrides, Zone, ZoneStatus};

/// Every configured zone and program, keyed by id.
#[derive(Default)]
pub struct Registry {
    pub zones: BTreeMap<String, Arc<Zone>>,
    pub programs: BTreeMap<String, Arc<Program>>,
}

impl Registry {
    pub fn zone(&self, id: &str) -> Result<&Arc<Zone>, ControllerError> {
        self.zones
            .get(id)
            .ok_or_else(|| ControllerError::UnknownZone(id.to_string()))
    }

    pub fn program(&self, id: &str) -> Result<&Arc<Program>, ControllerError> {
        self.programs
            .get(id)
            .ok_or_else(|| ControllerError::UnknownProgram(id.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub zones: Vec<ZoneStatus>,
    pub programs: Vec<ProgramStatus>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    events: SharedState,
    /// Held across "stop everything, then start" so two run_program calls
    /// can't interleave their stop and start halves.
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, events: SharedState) -> Self {
        Self {
            registry,
            events,
            lane: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop everything, wait until every actuator is confirmed OFF, then
    /// start the program.
    pub async fn run_program(&self, id: &str, skip_predicate: bool) -> Result<CycleHandle, ControllerError> {
        let program = self.resolve(self.registry.program(id)).await?;
        let _lane = self.lane.lock().await;

        info!(program = %id, skip_predicate, "run_program");
        self.events
            .write()
            .await
            .record_command(format!("run_program {id} (skip_predicate={skip_predicate})"));

        self.stop_everything().await;
        Ok(program.run(skip_predicate).await)
    }

    /// Run one zone directly. Other zones and programs are left alone.
    pub async fn run_zone(
        &self,
        id: &str,
        overrides: Overrides,
        skip_predicate: bool,
    ) -> Result<CycleHandle, ControllerError> {
        let zone = self.resolve(self.registry.zone(id)).await?;
        let params = overrides.resolve(zone.defaults());
        if let Err(reason) = params.validate() {
            let e = ControllerError::InvalidOverride {
                zone: id.to_string(),
                reason,
            };
            return Err(self.reject(e).await);
        }

        info!(zone = %id, ?overrides, skip_predicate, "run_zone");
        self.events.write().await.record_command(format!(
            "run_zone {id} (water {}m, wait {}m, repeat {})",
            params.water, params.wait, params.repeat
        ));

        Ok(zone.start(params, skip_predicate).await)
    }

    /// Stop every program, then every zone, and return once all of them
    /// have reached OFF.
    pub async fn stop_all(&self) {
        let _lane = self.lane.lock().await;
        info!("stop_all");
        self.events.write().await.record_command("stop_all".to_string());
        self.stop_everything().await;
    }

    pub async fn refresh_program(&self, id: &str) -> Result<(), ControllerError> {
        let program = self.resolve(self.registry.program(id)).await?;
        program.refresh();
        Ok(())
    }

    pub fn refresh_all(&self) {
        for program in self.registry.programs.values() {
            program.refresh();
        }
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            zones: self.registry.zones.values().map(|z| z.status()).collect(),
            programs: self.registry.programs.values().map(|p| p.status()).collect(),
        }
    }

    // Every run is signalled up front so they wind down together. The
    // barriers then go programs first, so none of them can start its next
    // zone after the zones have been stopped.
    async fn stop_everything(&self) {
        for program in self.registry.programs.values() {
            program.stop();
        }
        for zone in self.registry.zones.values() {
            zone.stop();
        }
        for program in self.registry.programs.values() {
            program.stop_and_wait().await;
        }
        for zone in self.registry.zones.values() {
            zone.stop_and_wait().await;
        }
    }

    async fn resolve<T: Clone>(&self, found: Result<&T, ControllerError>) -> Result<T, ControllerError> {
        match found {
            Ok(entity) => Ok(entity.clone()),
            Err(e) => Err(self.reject(e).await),
        }
    }

    /// Log and record a refused command.
    async fn reject(&self, e: ControllerError) -> ControllerError {
        warn!("{e}");
        self.events.write().await.record_error(e.to_string());
        e
    }
}

// ===========================================================================
// Tests
// ===========================================================================
