//! Board configuration of a Type-C port.
use uom::si::electric_current::milliampere;
use uom::si::electric_potential::volt;
use uom::si::power::watt;

use crate::PowerRole;
use crate::protocol_layer::message::pdo::Capabilities;
use crate::protocol_layer::message::units::{ElectricCurrent, ElectricPotential, Power};

/// Dual-role policy of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DualRoleMode {
    /// Toggle between source and sink while disconnected.
    ToggleOn,
    /// Stay in the present role while disconnected, sink after a detach.
    #[default]
    ToggleOff,
    /// Always be a sink.
    ForceSink,
    /// Always be a source.
    ForceSource,
}

/// How a sink selects from the source capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkPolicy {
    /// Highest voltage to request.
    pub max_voltage: ElectricPotential,
    /// Highest current to request.
    pub max_current: ElectricCurrent,
    /// Power that the sink needs to operate. Requests below it carry the capability mismatch flag.
    pub operating_power: Power,
    /// Set the USB communications capable flag in requests.
    pub usb_communications_capable: bool,
    /// Set the no USB suspend flag in requests.
    pub no_usb_suspend: bool,
}

impl Default for SinkPolicy {
    fn default() -> Self {
        Self {
            max_voltage: ElectricPotential::new::<volt>(20),
            max_current: ElectricCurrent::new::<milliampere>(3000),
            operating_power: Power::new::<watt>(15),
            usb_communications_capable: false,
            no_usb_suspend: false,
        }
    }
}

impl SinkPolicy {
    /// Lower the voltage limit, never raise it.
    pub fn limit_voltage(&mut self, max_voltage: ElectricPotential) {
        if max_voltage < self.max_voltage {
            self.max_voltage = max_voltage;
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SinkPolicy {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "SinkPolicy {{ {} mV, {} mA, {} mW }}",
            self.max_voltage.get::<uom::si::electric_potential::millivolt>(),
            self.max_current.get::<milliampere>(),
            self.operating_power.get::<uom::si::power::milliwatt>()
        );
    }
}

/// Configuration of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortConfig {
    /// The port index, as used by the host and console.
    pub port: usize,
    /// The role that the port starts in.
    pub default_power_role: PowerRole,
    /// Dual-role policy at startup.
    pub dual_role: DualRoleMode,
    /// Capabilities offered as a source.
    pub source_capabilities: Capabilities,
    /// Capabilities announced as a sink.
    pub sink_capabilities: Capabilities,
    /// Selection policy as a sink.
    pub sink_policy: SinkPolicy,
    /// Time for the power supply to reach a new voltage, in ms.
    pub power_supply_turn_on_delay_ms: u64,
    /// Time for the power supply to discharge, in ms.
    pub power_supply_turn_off_delay_ms: u64,
}

impl PortConfig {
    /// A sink-only port with the given sink capabilities.
    pub fn new_sink(port: usize, sink_capabilities: Capabilities, sink_policy: SinkPolicy) -> Self {
        Self {
            port,
            default_power_role: PowerRole::Sink,
            dual_role: DualRoleMode::ForceSink,
            source_capabilities: Capabilities::default(),
            sink_capabilities,
            sink_policy,
            ..Default::default()
        }
    }

    /// A dual-role port that starts as a source.
    pub fn new_dual_role(port: usize, source_capabilities: Capabilities, sink_capabilities: Capabilities) -> Self {
        Self {
            port,
            default_power_role: PowerRole::Source,
            dual_role: DualRoleMode::ToggleOn,
            source_capabilities,
            sink_capabilities,
            ..Default::default()
        }
    }

    /// Whether the port can take the given power role at all.
    pub fn supports(&self, power_role: PowerRole) -> bool {
        match power_role {
            PowerRole::Source => !self.source_capabilities.is_empty(),
            PowerRole::Sink => !self.sink_capabilities.is_empty(),
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            port: 0,
            default_power_role: PowerRole::Sink,
            dual_role: DualRoleMode::default(),
            source_capabilities: Capabilities::default(),
            sink_capabilities: Capabilities::default(),
            sink_policy: SinkPolicy::default(),
            power_supply_turn_on_delay_ms: 30,
            power_supply_turn_off_delay_ms: 250,
        }
    }
}
