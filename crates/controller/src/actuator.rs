//! Actuator gateway: on/off control of the physical switch behind a zone.
//!
//! Two adapters exist. `gpio:<pin>` drives a relay through rppal when the
//! `gpio` feature is enabled; without it, a mock implementation logs state
//! changes. `mqtt:<topic>` publishes `ON`/`OFF` to a topic so any smart
//! switch listening on the broker can be used.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, QoS};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(feature = "gpio")]
use anyhow::anyhow;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "gpio")]
use std::sync::Mutex;

/// On/off control plus a state query. `set(false)` must always be legal,
/// whatever the current state.
pub trait Actuator: Send + Sync {
    /// The configured reference, e.g. `gpio:17`.
    fn name(&self) -> &str;

    fn set(&self, on: bool) -> Result<()>;

    /// Last state successfully commanded.
    fn is_on(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Actuator references (the `switch` config value)
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActuatorRef {
    Gpio(u8),
    Mqtt(String),
}

impl FromStr for ActuatorRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, target) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("switch '{s}' must look like gpio:<pin> or mqtt:<topic>"))?;

        match kind {
            "gpio" => {
                let pin: u8 = target
                    .parse()
                    .map_err(|_| format!("switch '{s}': '{target}' is not a pin number"))?;
                if !VALID_GPIO_PINS.contains(&pin) {
                    return Err(format!(
                        "switch '{s}': {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                    ));
                }
                Ok(ActuatorRef::Gpio(pin))
            }
            "mqtt" => {
                if target.is_empty() || target.contains(['+', '#']) {
                    return Err(format!("switch '{s}': invalid mqtt topic '{target}'"));
                }
                Ok(ActuatorRef::Mqtt(target.to_string()))
            }
            other => Err(format!("switch '{s}': unknown switch kind '{other}'")),
        }
    }
}

impl fmt::Display for ActuatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorRef::Gpio(pin) => write!(f, "gpio:{pin}"),
            ActuatorRef::Mqtt(topic) => write!(f, "mqtt:{topic}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds actuators from their references. Holds the shared hardware and
/// broker handles so every zone reuses them.
pub struct ActuatorFactory {
    #[cfg(feature = "gpio")]
    gpio: Gpio,
    active_low: bool,
    mqtt: AsyncClient,
}

impl ActuatorFactory {
    pub fn new(mqtt: AsyncClient, active_low: bool) -> Result<Self> {
        Ok(Self {
            #[cfg(feature = "gpio")]
            gpio: Gpio::new().context("failed to open gpio")?,
            active_low,
            mqtt,
        })
    }

    pub fn build(&self, r: &ActuatorRef) -> Result<Arc<dyn Actuator>> {
        let actuator: Arc<dyn Actuator> = match r {
            ActuatorRef::Gpio(pin) => Arc::new(self.gpio_valve(*pin)?),
            ActuatorRef::Mqtt(topic) => Arc::new(MqttSwitch::new(self.mqtt.clone(), topic)),
        };
        Ok(actuator)
    }

    #[cfg(feature = "gpio")]
    fn gpio_valve(&self, pin: u8) -> Result<GpioValve> {
        let out = self
            .gpio
            .get(pin)
            .with_context(|| format!("gpio pin {pin} unavailable"))?
            .into_output();
        GpioValve::new(pin, out, self.active_low)
    }

    #[cfg(not(feature = "gpio"))]
    fn gpio_valve(&self, pin: u8) -> Result<GpioValve> {
        GpioValve::new(pin, self.active_low)
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (requires rppal and Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioValve {
    name: String,
    pin: Mutex<OutputPin>,
    active_low: bool, // many relay boards are active-low
    on: AtomicBool,
}

#[cfg(feature = "gpio")]
impl GpioValve {
    fn new(pin_num: u8, pin: OutputPin, active_low: bool) -> Result<Self> {
        let valve = Self {
            name: ActuatorRef::Gpio(pin_num).to_string(),
            pin: Mutex::new(pin),
            active_low,
            on: AtomicBool::new(false),
        };
        // Fail-safe: ensure "OFF" at startup
        valve.set(false)?;
        Ok(valve)
    }
}

#[cfg(feature = "gpio")]
impl Actuator for GpioValve {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, on: bool) -> Result<()> {
        let mut pin = self
            .pin
            .lock()
            .map_err(|_| anyhow!("{}: pin lock poisoned", self.name))?;
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        self.on.store(on, Ordering::SeqCst);
        tracing::debug!(switch = %self.name, on, "relay set");
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO relay (development builds, logs instead of switching)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct GpioValve {
    name: String,
    on: AtomicBool,
}

#[cfg(not(feature = "gpio"))]
impl GpioValve {
    fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        tracing::info!(
            pin = pin_num,
            active_low,
            "[mock-gpio] registered relay (not wired)"
        );
        Ok(Self {
            name: ActuatorRef::Gpio(pin_num).to_string(),
            on: AtomicBool::new(false),
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for GpioValve {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, on: bool) -> Result<()> {
        self.on.store(on, Ordering::SeqCst);
        tracing::info!(
            switch = %self.name,
            "[mock-gpio] relay set {}",
            if on { "ON" } else { "OFF" }
        );
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// MQTT switch
// ---------------------------------------------------------------------------

pub struct MqttSwitch {
    name: String,
    topic: String,
    client: AsyncClient,
    on: AtomicBool,
}

impl MqttSwitch {
    pub fn new(client: AsyncClient, topic: &str) -> Self {
        Self {
            name: ActuatorRef::Mqtt(topic.to_string()).to_string(),
            topic: topic.to_string(),
            client,
            on: AtomicBool::new(false),
        }
    }
}

impl Actuator for MqttSwitch {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&self, on: bool) -> Result<()> {
        let payload: &[u8] = if on { b"ON" } else { b"OFF" };
        // Queued for the event loop; never blocks the cycle task.
        self.client
            .try_publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.to_vec())
            .with_context(|| format!("{}: failed to queue publish", self.name))?;
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
