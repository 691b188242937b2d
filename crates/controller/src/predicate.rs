//! Predicate evaluation: the condition that gates a zone or program run
//! ("skip if raining"). Templates are rendered with minijinja against a fact
//! map fed from MQTT (`irrigation/fact/<name>`).

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::PredicateError;

/// A boolean condition over live external state.
///
/// `Ok(None)` means the result was not recognisable as true or false.
pub trait Predicate: Send + Sync {
    fn expression(&self) -> &str;

    fn evaluate(&self) -> Result<Option<bool>, PredicateError>;
}

/// Decide whether a gated action runs. No predicate, or an indeterminate
/// result, means "run".
pub fn should_run(predicate: Option<&Arc<dyn Predicate>>) -> Result<bool, PredicateError> {
    match predicate {
        None => Ok(true),
        Some(p) => {
            let result = p.evaluate()?;
            debug!(expression = p.expression(), ?result, "predicate evaluated");
            Ok(result.unwrap_or(true))
        }
    }
}

// ---------------------------------------------------------------------------
// Fact store
// ---------------------------------------------------------------------------

pub type FactMap = BTreeMap<String, Value>;

/// Latest value of every named fact. Cheap to clone; all clones share the
/// same map.
#[derive(Clone)]
pub struct Facts {
    tx: Arc<watch::Sender<FactMap>>,
}

impl Facts {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(FactMap::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, name: &str, value: Value) {
        self.tx.send_modify(|facts| {
            facts.insert(name.to_string(), value);
        });
    }

    pub fn snapshot(&self) -> FactMap {
        self.tx.borrow().clone()
    }
}

impl Default for Facts {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Template predicate
// ---------------------------------------------------------------------------

/// Shared rendering environment. Strict undefined handling turns a missing
/// fact into an error instead of silently rendering an empty string.
pub fn environment() -> Arc<Environment<'static>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    Arc::new(env)
}

/// Compile-only check used by config validation.
pub fn check_syntax(source: &str) -> Result<(), String> {
    let env = Environment::new();
    let result = env
        .template_from_str(source)
        .map(|_| ())
        .map_err(|e| e.to_string());
    result
}

pub struct TemplatePredicate {
    source: String,
    env: Arc<Environment<'static>>,
    facts: Facts,
}

impl TemplatePredicate {
    pub fn new(source: &str, env: Arc<Environment<'static>>, facts: Facts) -> Self {
        Self {
            source: source.to_string(),
            env,
            facts,
        }
    }
}

impl Predicate for TemplatePredicate {
    fn expression(&self) -> &str {
        &self.source
    }

    fn evaluate(&self) -> Result<Option<bool>, PredicateError> {
        let facts = self.facts.snapshot();
        match self.env.render_str(&self.source, &facts) {
            Ok(rendered) => Ok(interpret(&rendered)),
            Err(e) if matches!(e.kind(), ErrorKind::UndefinedError) => {
                Err(PredicateError::Unavailable(e.to_string()))
            }
            Err(e) => Err(PredicateError::Failed(e.to_string())),
        }
    }
}

fn interpret(rendered: &str) -> Option<bool> {
    match rendered.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
