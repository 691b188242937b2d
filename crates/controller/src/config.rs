//! TOML config file loading, validation, and construction of the zone and
//! program registry.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveTime};
use minijinja::Environment;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::actuator::{ActuatorFactory, ActuatorRef};
use crate::db::Db;
use crate::dispatcher::Registry;
use crate::predicate::{self, Facts, Predicate, TemplatePredicate};
use crate::program::{self, Program, ProgramSpec, ProgramZone};
use crate::state::SharedState;
use crate::zone::{
    CycleParams, Icons, Overrides, Zone, ZoneSpec, REPEAT_RANGE, WAIT_RANGE, WATER_RANGE,
};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    pub water: u32,
    #[serde(default)]
    pub wait: u32,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
    #[serde(default)]
    pub template: Option<String>,
    pub switch: String,
    #[serde(default)]
    pub icon_on: Option<String>,
    #[serde(default)]
    pub icon_wait: Option<String>,
    #[serde(default)]
    pub icon_off: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramEntry {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    /// "hh:mm"
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub zones: Vec<ProgramZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgramZoneEntry {
    /// Zone id.
    pub zone: String,
    /// 0 or absent: run with the zone's own defaults.
    #[serde(default)]
    pub water: Option<u32>,
    #[serde(default)]
    pub wait: Option<u32>,
    #[serde(default)]
    pub repeat: Option<u32>,
}

fn default_repeat() -> u32 {
    1
}

impl ZoneEntry {
    pub fn id(&self) -> String {
        entity_id(self.id.as_deref(), &self.name)
    }
}

impl ProgramEntry {
    pub fn id(&self) -> String {
        entity_id(self.id.as_deref(), &self.name)
    }
}

impl ProgramZoneEntry {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            water: self.water,
            wait: self.wait,
            repeat: self.repeat,
        }
    }
}

fn entity_id(explicit: Option<&str>, name: &str) -> String {
    match explicit {
        Some(id) => id.trim().to_string(),
        None => slugify(name),
    }
}

/// "Front Lawn #2" -> "front_lawn_2"
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}

/// Parse a daily start time in "hh:mm" form.
pub fn parse_start(raw: &str) -> Result<NaiveTime, String> {
    let (h, m) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("start '{raw}' must look like hh:mm"))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| format!("start '{raw}': hour '{h}' is not a number"))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| format!("start '{raw}': minute '{m}' is not a number"))?;
    if hour > 23 || minute > 59 {
        return Err(format!("start '{raw}' out of range 00:00-23:59"));
    }
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| format!("start '{raw}' is not a valid time"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(&mut errors);
        self.validate_programs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut seen_switches: HashSet<ActuatorRef> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let id = z.id();
            let ctx = || {
                if id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{id}'")
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if id.is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(id.clone()) {
                errors.push(format!("{}: duplicate zone id", ctx()));
            }

            // ── Cycle defaults ──────────────────────────────────
            check_range(errors, &ctx(), "water", z.water, &WATER_RANGE);
            check_range(errors, &ctx(), "wait", z.wait, &WAIT_RANGE);
            check_range(errors, &ctx(), "repeat", z.repeat, &REPEAT_RANGE);

            // ── Switch ──────────────────────────────────────────
            match z.switch.parse::<ActuatorRef>() {
                Ok(r) => {
                    if !seen_switches.insert(r.clone()) {
                        errors.push(format!("{}: switch {r} is already used by another zone", ctx()));
                    }
                }
                Err(e) => errors.push(format!("{}: {e}", ctx())),
            }

            check_template(errors, &ctx(), z.template.as_deref());
        }
    }

    fn validate_programs(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<String> = self.zones.iter().map(ZoneEntry::id).collect();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for (i, p) in self.programs.iter().enumerate() {
            let id = p.id();
            let ctx = || {
                if id.is_empty() {
                    format!("programs[{i}]")
                } else {
                    format!("program '{id}'")
                }
            };

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if id.is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(id.clone()) {
                errors.push(format!("{}: duplicate program id", ctx()));
            }

            if let Some(start) = &p.start {
                if let Err(e) = parse_start(start) {
                    errors.push(format!("{}: {e}", ctx()));
                }
            }

            check_template(errors, &ctx(), p.template.as_deref());

            // ── Zone references ─────────────────────────────────
            for (j, pz) in p.zones.iter().enumerate() {
                let zctx = format!("{}: zones[{j}]", ctx());
                if !zone_ids.contains(pz.zone.as_str()) {
                    errors.push(format!("{zctx}: zone '{}' does not match any defined zone", pz.zone));
                }
                if let Some(water) = pz.water {
                    if water != 0 {
                        check_range(errors, &zctx, "water", water, &WATER_RANGE);
                    }
                }
                if let Some(wait) = pz.wait {
                    check_range(errors, &zctx, "wait", wait, &WAIT_RANGE);
                }
                if let Some(repeat) = pz.repeat {
                    check_range(errors, &zctx, "repeat", repeat, &REPEAT_RANGE);
                }
            }
        }
    }
}

fn check_range(
    errors: &mut Vec<String>,
    ctx: &str,
    field: &str,
    value: u32,
    range: &std::ops::RangeInclusive<u32>,
) {
    if !range.contains(&value) {
        errors.push(format!(
            "{ctx}: {field} {value} out of range [{}, {}]",
            range.start(),
            range.end()
        ));
    }
}

fn check_template(errors: &mut Vec<String>, ctx: &str, template: Option<&str>) {
    if let Some(source) = template {
        if source.trim().is_empty() {
            errors.push(format!("{ctx}: template is empty"));
        } else if let Err(e) = predicate::check_syntax(source) {
            errors.push(format!("{ctx}: template does not compile: {e}"));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + build
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Shared handles every entity is wired to.
pub struct Wiring<'a> {
    pub actuators: &'a ActuatorFactory,
    pub facts: Facts,
    pub templates: Arc<Environment<'static>>,
    pub events: SharedState,
    pub db: Option<Db>,
}

impl Wiring<'_> {
    fn predicate(&self, template: Option<&str>) -> Option<Arc<dyn Predicate>> {
        template.map(|source| {
            let p: Arc<dyn Predicate> = Arc::new(TemplatePredicate::new(
                source,
                Arc::clone(&self.templates),
                self.facts.clone(),
            ));
            p
        })
    }
}

/// Construct every zone and program of a validated config.
pub async fn build(config: &Config, wiring: &Wiring<'_>) -> Result<Registry> {
    let mut registry = Registry::default();

    for z in &config.zones {
        let id = z.id();
        let switch: ActuatorRef = z
            .switch
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("zone '{id}'"))?;
        let actuator = wiring
            .actuators
            .build(&switch)
            .with_context(|| format!("zone '{id}': failed to create actuator {switch}"))?;

        let defaults = Icons::default();
        let spec = ZoneSpec {
            id: id.clone(),
            name: z.name.trim().to_string(),
            defaults: CycleParams {
                water: z.water,
                wait: z.wait,
                repeat: z.repeat,
            },
            icons: Icons {
                on: z.icon_on.clone().unwrap_or(defaults.on),
                wait: z.icon_wait.clone().unwrap_or(defaults.wait),
                off: z.icon_off.clone().unwrap_or(defaults.off),
            },
        };
        let zone = Zone::new(
            spec,
            actuator,
            wiring.predicate(z.template.as_deref()),
            wiring.events.clone(),
            wiring.db.clone(),
        );
        registry.zones.insert(id, zone);
    }

    let today = Local::now().date_naive();
    for p in &config.programs {
        let id = p.id();
        let zones = p
            .zones
            .iter()
            .map(|pz| -> Result<ProgramZone> {
                let zone = registry.zone(&pz.zone)?;
                Ok(ProgramZone {
                    zone: Arc::clone(zone),
                    overrides: pz.overrides(),
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("program '{id}'"))?;

        let start = p
            .start
            .as_deref()
            .map(parse_start)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("program '{id}'"))?;

        let stored = match &wiring.db {
            Some(db) => db
                .load_last_run(&id)
                .await
                .with_context(|| format!("program '{id}': failed to load last run"))?,
            None => None,
        };
        let last_run = program::restore_last_run(stored.as_deref(), today);

        let program = Program::new(
            ProgramSpec {
                id: id.clone(),
                name: p.name.trim().to_string(),
                start,
            },
            wiring.predicate(p.template.as_deref()),
            zones,
            last_run,
            wiring.events.clone(),
            wiring.db.clone(),
        );
        registry.programs.insert(id, program);
    }

    tracing::info!(
        zones = registry.zones.len(),
        programs = registry.programs.len(),
        "config applied"
    );

    Ok(registry)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            name: "Front Lawn".into(),
            id: None,
            water: 5,
            wait: 2,
            repeat: 3,
            template: None,
            switch: "gpio:17".into(),
            icon_on: None,
            icon_wait: None,
            icon_off: None,
        }
    }

    fn valid_program() -> ProgramEntry {
        ProgramEntry {
            name: "Morning".into(),
            id: None,
            template: Some("{{ not raining }}".into()),
            start: Some("06:30".into()),
            zones: vec![ProgramZoneEntry {
                zone: "front_lawn".into(),
                water: Some(4),
                wait: None,
                repeat: None,
            }],
        }
    }

    fn valid_config() -> Config {
        Config {
            zones: vec![valid_zone()],
            programs: vec![valid_program()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[[zones]]
name = "Front Lawn"
water = 5
wait = 2
repeat = 3
template = "{{ not raining }}"
switch = "gpio:17"
icon_on = "mdi:sprinkler"

[[zones]]
name = "Beds"
id = "flower_beds"
water = 3
switch = "mqtt:garden/beds/set"

[[programs]]
name = "Morning"
template = "{{ temperature > 10 }}"
start = "06:30"

[[programs.zones]]
zone = "front_lawn"
water = 4
wait = 1
repeat = 2

[[programs.zones]]
zone = "flower_beds"
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.zones[0].id(), "front_lawn");
        assert_eq!(config.zones[1].id(), "flower_beds");
        assert_eq!(config.zones[1].wait, 0);
        assert_eq!(config.zones[1].repeat, 1);
        assert_eq!(config.programs[0].zones.len(), 2);
        assert_eq!(config.programs[0].zones[1].overrides(), Overrides::default());
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.zones.len(), 3);
        assert_eq!(config.programs.len(), 2);
        assert_eq!(config.programs[1].id(), "beds_only");
    }

    #[test]
    fn parse_empty_config() {
        let config = parse("").unwrap();
        assert!(config.zones.is_empty());
        assert!(config.programs.is_empty());
    }

    #[test]
    fn missing_required_field_is_parse_error() {
        let err = parse("[[zones]]\nname = \"x\"\nwater = 1\n").unwrap_err();
        assert!(format!("{err:#}").contains("switch"));
    }

    // -- Ids and times -----------------------------------------------------

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Front Lawn"), "front_lawn");
        assert_eq!(slugify("  Beds #2 (east) "), "beds_2_east");
        assert_eq!(slugify("Über"), "ber");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn parse_start_times() {
        assert_eq!(parse_start("06:30"), Ok(NaiveTime::from_hms_opt(6, 30, 0).unwrap()));
        assert_eq!(parse_start("0:0"), Ok(NaiveTime::MIN));
        assert!(parse_start("24:00").is_err());
        assert!(parse_start("12:60").is_err());
        assert!(parse_start("noon").is_err());
        assert!(parse_start("-1:30").is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn water_zero_override_is_allowed() {
        let mut cfg = valid_config();
        cfg.programs[0].zones[0].water = Some(0);
        cfg.programs[0].zones[0].wait = Some(9);
        cfg.validate().unwrap();
    }

    // -- Zones -------------------------------------------------------------

    #[test]
    fn zone_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            switch: "gpio:27".into(), // different switch, same name
            ..valid_zone()
        });
        assert_validation_err(&cfg, "duplicate zone id");
    }

    #[test]
    fn zone_water_out_of_range() {
        let mut cfg = valid_config();
        cfg.zones[0].water = 0;
        assert_validation_err(&cfg, "water 0 out of range [1, 30]");
        cfg.zones[0].water = 31;
        assert_validation_err(&cfg, "water 31 out of range");
    }

    #[test]
    fn zone_wait_out_of_range() {
        let mut cfg = valid_config();
        cfg.zones[0].wait = 31;
        assert_validation_err(&cfg, "wait 31 out of range [0, 30]");
    }

    #[test]
    fn zone_repeat_out_of_range() {
        let mut cfg = valid_config();
        cfg.zones[0].repeat = 0;
        assert_validation_err(&cfg, "repeat 0 out of range [1, 30]");
    }

    #[test]
    fn zone_bad_switch_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].switch = "gpio:1".into();
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_duplicate_switch_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            name: "Back Lawn".into(),
            ..valid_zone()
        });
        assert_validation_err(&cfg, "switch gpio:17 is already used by another zone");
    }

    #[test]
    fn zone_broken_template_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].template = Some("{{ raining ".into());
        assert_validation_err(&cfg, "template does not compile");
    }

    // -- Programs ------------------------------------------------------------

    #[test]
    fn program_unknown_zone_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].zones[0].zone = "nonexistent".into();
        assert_validation_err(&cfg, "does not match any defined zone");
    }

    #[test]
    fn program_bad_start_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].start = Some("25:00".into());
        assert_validation_err(&cfg, "out of range 00:00-23:59");
    }

    #[test]
    fn program_override_out_of_range() {
        let mut cfg = valid_config();
        cfg.programs[0].zones[0].repeat = Some(0);
        assert_validation_err(&cfg, "zones[0]: repeat 0 out of range");
    }

    #[test]
    fn program_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.programs.push(ProgramEntry {
            name: "Evening".into(),
            id: Some("morning".into()),
            ..valid_program()
        });
        assert_validation_err(&cfg, "duplicate program id");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            zones: vec![ZoneEntry {
                name: "".into(),
                water: 0,
                repeat: 0,
                switch: "relay".into(),
                ..valid_zone()
            }],
            programs: vec![ProgramEntry {
                start: Some("7pm".into()),
                ..valid_program()
            }],
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        // Should report many errors, not bail after the first
        assert!(msg.contains("name is empty"), "missing name error in: {msg}");
        assert!(msg.contains("water 0"), "missing water error in: {msg}");
        assert!(msg.contains("must look like gpio"), "missing switch error in: {msg}");
        assert!(msg.contains("must look like hh:mm"), "missing start error in: {msg}");
        assert!(
            msg.contains("does not match any defined zone"),
            "missing zone reference error in: {msg}"
        );
    }

    // -- Registry construction -----------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn build_wires_zones_and_programs() {
        let (client, _el) = rumqttc::AsyncClient::new(
            rumqttc::MqttOptions::new("test-config", "127.0.0.1", 1883),
            10,
        );
        let factory = ActuatorFactory::new(client, true).unwrap();
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let stored = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        db.save_last_run("morning", stored).await.unwrap();

        let mut cfg = valid_config();
        cfg.zones[0].icon_on = Some("mdi:sprinkler".into());
        let wiring = Wiring {
            actuators: &factory,
            facts: Facts::new(),
            templates: predicate::environment(),
            events: state::shared(),
            db: Some(db),
        };
        let registry = build(&cfg, &wiring).await.unwrap();

        let zone = registry.zone("front_lawn").unwrap();
        assert_eq!(zone.name(), "Front Lawn");
        assert_eq!(zone.defaults(), CycleParams { water: 5, wait: 2, repeat: 3 });
        assert_eq!(zone.status().switch, "gpio:17");

        let program = registry.program("morning").unwrap();
        assert_eq!(program.start_time(), NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(program.snapshot().last_run, stored);
        assert_eq!(program.status().zones, vec!["front_lawn".to_string()]);
    }
}
