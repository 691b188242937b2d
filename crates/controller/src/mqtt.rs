//! MQTT command surface: topic/payload parsing and dispatch of inbound
//! messages.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::predicate::Facts;
use crate::zone::Overrides;

/// Everything the controller listens to.
pub const SUBSCRIPTION: &str = "irrigation/#";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProgramRunMsg {
    #[serde(default)]
    skip_predicate: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ZoneRunMsg {
    #[serde(default)]
    water: Option<u32>,
    #[serde(default)]
    wait: Option<u32>,
    #[serde(default)]
    repeat: Option<u32>,
    #[serde(default)]
    skip_predicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    RunProgram { id: String, skip_predicate: bool },
    RefreshProgram { id: String },
    RunZone { id: String, overrides: Overrides, skip_predicate: bool },
    StopAll,
    Fact { name: String, value: Value },
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Empty payload means "all defaults".
fn parse_json<T: Default + for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, String> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(payload).map_err(|e| format!("bad payload: {e}"))
}

/// Facts are JSON when they parse as JSON, plain strings otherwise.
fn parse_fact(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).trim().to_string()))
}

/// Map a message to a command. `Ok(None)` for topics outside the command
/// namespace.
pub(crate) fn parse_inbound(topic: &str, payload: &[u8]) -> Result<Option<Inbound>, String> {
    let parts: Vec<&str> = topic.split('/').collect();
    let cmd = match parts.as_slice() {
        ["irrigation", "stop"] => Inbound::StopAll,
        ["irrigation", "program", id, "run"] if !id.is_empty() => {
            let msg: ProgramRunMsg = parse_json(payload)?;
            Inbound::RunProgram {
                id: id.to_string(),
                skip_predicate: msg.skip_predicate,
            }
        }
        ["irrigation", "program", id, "refresh"] if !id.is_empty() => {
            Inbound::RefreshProgram { id: id.to_string() }
        }
        ["irrigation", "zone", id, "run"] if !id.is_empty() => {
            let msg: ZoneRunMsg = parse_json(payload)?;
            Inbound::RunZone {
                id: id.to_string(),
                overrides: Overrides {
                    water: msg.water,
                    wait: msg.wait,
                    repeat: msg.repeat,
                },
                skip_predicate: msg.skip_predicate,
            }
        }
        ["irrigation", "fact", name] if !name.is_empty() => Inbound::Fact {
            name: name.to_string(),
            value: parse_fact(payload),
        },
        _ => return Ok(None),
    };
    Ok(Some(cmd))
}

/// Execute one inbound command. Failures are logged by the dispatcher.
pub async fn handle(cmd: Inbound, dispatcher: &Dispatcher, facts: &Facts) {
    debug!(?cmd, "mqtt command");
    let _ = match cmd {
        Inbound::RunProgram { id, skip_predicate } => {
            dispatcher.run_program(&id, skip_predicate).await.map(drop)
        }
        Inbound::RefreshProgram { id } => dispatcher.refresh_program(&id).await,
        Inbound::RunZone {
            id,
            overrides,
            skip_predicate,
        } => dispatcher.run_zone(&id, overrides, skip_predicate).await.map(drop),
        Inbound::StopAll => {
            dispatcher.stop_all().await;
            Ok(())
        }
        Inbound::Fact { name, value } => {
            facts.set(&name, value);
            Ok(())
        }
    };
}

/// Parse and log; bad payloads never reach the dispatcher.
pub(crate) fn decode(topic: &str, payload: &[u8]) -> Option<Inbound> {
    match parse_inbound(topic, payload) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(topic, "ignoring mqtt message: {e}");
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
