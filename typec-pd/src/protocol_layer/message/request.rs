//! Definitions of request message content, and the selection of a request from source capabilities.
use proc_bitfield::bitfield;
use uom::si::electric_current::{centiampere, milliampere};
use uom::si::electric_potential::millivolt;

use super::_250milliwatts_mod::_250milliwatts;
use super::pdo::{Capabilities, PowerDataObject};
use super::units::{ElectricCurrent, ElectricPotential, Power};
use crate::config::SinkPolicy;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct RawDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=7
        pub object_position: u8 @ 28..=31,
        pub capability_mismatch: bool @ 26,
        /// Operating current or power, in the unit of the referenced object
        pub raw_operating: u16 @ 10..=19,
        /// Maximum current or power, in the unit of the referenced object
        pub raw_max: u16 @ 0..=9,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FixedVariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=7
        pub object_position: u8 @ 28..=31,
        pub giveback_flag: bool @ 27,
        pub capability_mismatch: bool @ 26,
        pub usb_communications_capable: bool @ 25,
        pub no_usb_suspend: bool @ 24,
        /// Operating current in 10 mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableSupply {
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Object position (0000b is reserved)
        pub object_position: u8 @ 28..=31,
        /// GiveBackFlag = 0
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB Suspend
        pub no_usb_suspend: bool @ 24,
        /// Operating power in 250mW units
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250mW units
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl Battery {
    pub fn operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_operating_power().into())
    }

    pub fn max_operating_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_operating_power().into())
    }
}

/// Power requests towards the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum PowerSource {
    FixedVariableSupply(FixedVariableSupply),
    Battery(Battery),
}

/// Reasons for a source to reject a request.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum InvalidRequest {
    /// The object position does not name an advertised object.
    #[error("object position {0} is not advertised")]
    ObjectPosition(u8),
    /// The operating current or power exceeds the advertised limit.
    #[error("operating value exceeds the advertised limit")]
    OperatingExceedsLimit,
    /// The maximum current or power exceeds the advertised limit, without a capability mismatch.
    #[error("maximum value exceeds the advertised limit")]
    MaximumExceedsLimit,
}

impl PowerSource {
    /// Decode a request. The kind of object that it references decides its layout.
    pub fn from_raw(raw: u32, source_capabilities: &Capabilities) -> Self {
        match source_capabilities.get(RawDataObject(raw).object_position()) {
            Some(PowerDataObject::Battery(_)) => Self::Battery(Battery(raw)),
            _ => Self::FixedVariableSupply(FixedVariableSupply(raw)),
        }
    }

    /// Encode the request.
    pub fn to_raw(&self) -> u32 {
        match self {
            Self::FixedVariableSupply(rdo) => rdo.0,
            Self::Battery(rdo) => rdo.0,
        }
    }

    /// The 1-based position of the requested object.
    pub fn object_position(&self) -> u8 {
        RawDataObject(self.to_raw()).object_position()
    }

    /// Whether the sink reported that the source does not satisfy its needs.
    pub fn capability_mismatch(&self) -> bool {
        RawDataObject(self.to_raw()).capability_mismatch()
    }

    /// Select the object that offers the most power within the sink's policy.
    ///
    /// Objects above `max_voltage` of the policy, or refused by `accept_voltage`, are skipped.
    /// On equal power, the first object wins. When no object qualifies, the vSafe5V object is
    /// requested. Reports `None` for an empty capability list.
    pub fn new_from_policy(
        source_capabilities: &Capabilities,
        policy: &SinkPolicy,
        accept_voltage: impl Fn(ElectricPotential) -> bool,
    ) -> Option<Self> {
        let mut selected: Option<(u8, Power)> = None;

        for (index, pdo) in source_capabilities.iter().enumerate() {
            let voltage = pdo.min_voltage();

            if matches!(pdo, PowerDataObject::Unknown(_)) {
                trace!("Skip unsupported PDO {}", index + 1);
                continue;
            }

            if voltage > policy.max_voltage || !accept_voltage(voltage) {
                trace!(
                    "Skip PDO {}, {} mV is out of range",
                    index + 1,
                    voltage.get::<millivolt>()
                );
                continue;
            }

            let power = pdo.max_power();
            if selected.is_none_or(|(_, best)| power > best) {
                selected = Some((index as u8 + 1, power));
            }
        }

        let position = match selected {
            Some((position, _)) => position,
            None if source_capabilities.is_empty() => return None,
            None => 1,
        };

        Self::new_for_position(source_capabilities, position, policy)
    }

    /// Build a request for the object at a 1-based position.
    pub fn new_for_position(source_capabilities: &Capabilities, position: u8, policy: &SinkPolicy) -> Option<Self> {
        let pdo = source_capabilities.get(position)?;

        let request = match pdo {
            PowerDataObject::Battery(battery) => {
                let raw_power = battery.raw_max_power();

                Self::Battery(
                    Battery(0)
                        .with_object_position(position)
                        .with_raw_operating_power(raw_power)
                        .with_raw_max_operating_power(raw_power)
                        .with_capability_mismatch(battery.max_power() < policy.operating_power)
                        .with_usb_communications_capable(policy.usb_communications_capable)
                        .with_no_usb_suspend(policy.no_usb_suspend),
                )
            }
            _ => {
                let offered = ElectricCurrent::new::<centiampere>(pdo.raw_limit().into());
                let current = if offered < policy.max_current {
                    offered
                } else {
                    policy.max_current
                };
                let raw_current = current.get::<centiampere>().min(0x3ff) as u16;

                Self::FixedVariableSupply(
                    FixedVariableSupply(0)
                        .with_object_position(position)
                        .with_raw_operating_current(raw_current)
                        .with_raw_max_operating_current(raw_current)
                        .with_capability_mismatch(current * pdo.min_voltage() < policy.operating_power)
                        .with_usb_communications_capable(policy.usb_communications_capable)
                        .with_no_usb_suspend(policy.no_usb_suspend),
                )
            }
        };

        Some(request)
    }

    /// Check a received request against the advertised capabilities.
    pub fn validate(raw: u32, source_capabilities: &Capabilities) -> Result<Contract, InvalidRequest> {
        let rdo = RawDataObject(raw);
        let position = rdo.object_position();

        let pdo = source_capabilities
            .get(position)
            .filter(|pdo| !matches!(pdo, PowerDataObject::Unknown(_)))
            .ok_or(InvalidRequest::ObjectPosition(position))?;

        let limit = pdo.raw_limit();
        if rdo.raw_operating() > limit {
            return Err(InvalidRequest::OperatingExceedsLimit);
        }

        if rdo.raw_max() > limit && !rdo.capability_mismatch() {
            return Err(InvalidRequest::MaximumExceedsLimit);
        }

        Contract::new(source_capabilities, &Self::from_raw(raw, source_capabilities))
            .ok_or(InvalidRequest::ObjectPosition(position))
    }
}

/// A power contract, as agreed between source and sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Contract {
    /// The 1-based position of the object in the source capabilities.
    pub object_position: u8,
    /// The negotiated voltage.
    pub voltage: ElectricPotential,
    /// The negotiated operating current.
    pub current: ElectricCurrent,
    /// The request data object that led to the contract.
    pub rdo: u32,
}

impl Contract {
    /// Derive the contract that a request establishes.
    pub fn new(source_capabilities: &Capabilities, request: &PowerSource) -> Option<Self> {
        let object_position = request.object_position();
        let voltage = source_capabilities.get(object_position)?.min_voltage();

        let current = match request {
            PowerSource::FixedVariableSupply(rdo) => rdo.operating_current(),
            PowerSource::Battery(rdo) if voltage.get::<millivolt>() > 0 => rdo.operating_power() / voltage,
            PowerSource::Battery(_) => ElectricCurrent::new::<centiampere>(0),
        };

        Some(Self {
            object_position,
            voltage,
            current,
            rdo: request.to_raw(),
        })
    }

    /// The negotiated power.
    pub fn power(&self) -> Power {
        self.voltage * self.current
    }

    /// Voltage and current in mV and mA, as the host and the event log report them.
    pub fn millivolts_milliamperes(&self) -> (u32, u32) {
        (
            self.voltage.get::<millivolt>(),
            self.current.get::<milliampere>(),
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Contract {
    fn format(&self, fmt: defmt::Formatter) {
        let (voltage_mv, current_ma) = self.millivolts_milliamperes();
        defmt::write!(
            fmt,
            "Contract {{ object_position: {}, {} mV, {} mA, {} mW, rdo: {:#x} }}",
            self.object_position,
            voltage_mv,
            current_ma,
            self.power().get::<uom::si::power::milliwatt>(),
            self.rdo
        );
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_potential::volt;
    use uom::si::power::watt;

    use super::*;
    use crate::protocol_layer::message::pdo::{Battery as BatterySupply, FixedSupply};

    fn source_capabilities() -> Capabilities {
        Capabilities::from_words(&[0x2201_9064, 0x2203_c12c, 0x2206_41f4]).unwrap()
    }

    fn policy(max_voltage_mv: u32, max_current_ma: u32) -> SinkPolicy {
        SinkPolicy {
            max_voltage: ElectricPotential::new::<millivolt>(max_voltage_mv),
            max_current: ElectricCurrent::new::<milliampere>(max_current_ma),
            operating_power: Power::new::<watt>(15),
            usb_communications_capable: false,
            no_usb_suspend: false,
        }
    }

    fn fixed(voltage_v: u32, current_ma: u32) -> PowerDataObject {
        PowerDataObject::FixedSupply(FixedSupply::new(
            ElectricPotential::new::<volt>(voltage_v),
            ElectricCurrent::new::<milliampere>(current_ma),
        ))
    }

    #[test]
    fn five_volt_sink_requests_first_object() {
        let request = PowerSource::new_from_policy(&source_capabilities(), &policy(5000, 900), |_| true).unwrap();

        // Position 1, 900 mA operating and maximum, capability mismatch.
        assert_eq!(request.to_raw(), (1 << 28) | (1 << 26) | (90 << 10) | 90);
        assert!(request.capability_mismatch());
    }

    #[test]
    fn most_power_within_limits_wins() {
        let caps = source_capabilities();

        let request = PowerSource::new_from_policy(&caps, &policy(20000, 3000), |_| true).unwrap();
        assert_eq!(request.object_position(), 3);

        let request = PowerSource::new_from_policy(&caps, &policy(12000, 3000), |_| true).unwrap();
        assert_eq!(request.object_position(), 2);
        assert!(!request.capability_mismatch());

        let request = PowerSource::new_from_policy(&caps, &policy(20000, 3000), |voltage| {
            voltage.get::<volt>() != 20
        })
        .unwrap();
        assert_eq!(request.object_position(), 2);
    }

    #[test]
    fn selection_is_deterministic() {
        let caps = Capabilities::from_objects(&[fixed(5, 3000), fixed(15, 1000)]).unwrap();

        // Both offer 15 W, the first one wins every time.
        for _ in 0..4 {
            let request = PowerSource::new_from_policy(&caps, &policy(20000, 3000), |_| true).unwrap();
            assert_eq!(request.object_position(), 1);
        }
    }

    #[test]
    fn falls_back_to_vsafe_5v() {
        let request = PowerSource::new_from_policy(&source_capabilities(), &policy(3300, 3000), |_| true).unwrap();
        assert_eq!(request.object_position(), 1);
        assert!(PowerSource::new_from_policy(&Capabilities::default(), &policy(5000, 3000), |_| true).is_none());
    }

    #[test]
    fn battery_request_uses_power() {
        let caps = Capabilities::from_objects(&[
            fixed(5, 500),
            PowerDataObject::Battery(BatterySupply::new(
                ElectricPotential::new::<volt>(5),
                ElectricPotential::new::<volt>(12),
                Power::new::<watt>(20),
            )),
        ])
        .unwrap();

        let request = PowerSource::new_from_policy(&caps, &policy(12000, 3000), |_| true).unwrap();
        let PowerSource::Battery(battery) = request else {
            panic!("expected a battery request");
        };
        assert_eq!(battery.object_position(), 2);
        assert_eq!(battery.operating_power().get::<watt>(), 20);

        let contract = Contract::new(&caps, &PowerSource::from_raw(request.to_raw(), &caps)).unwrap();
        assert_eq!(contract.millivolts_milliamperes(), (5000, 4000));
        assert_eq!(contract.power().get::<watt>(), 20);
    }

    #[test]
    fn source_validates_requests() {
        let caps = source_capabilities();
        let rdo = |position: u32, operating: u32, max: u32, mismatch: bool| {
            (position << 28) | (u32::from(mismatch) << 26) | (operating / 10) << 10 | (max / 10)
        };

        let contract = PowerSource::validate(rdo(2, 3000, 3000, false), &caps).unwrap();
        assert_eq!(contract.object_position, 2);
        assert_eq!(contract.voltage.get::<volt>(), 12);
        assert_eq!(contract.current.get::<milliampere>(), 3000);

        assert_eq!(
            PowerSource::validate(rdo(0, 100, 100, false), &caps),
            Err(InvalidRequest::ObjectPosition(0))
        );
        assert_eq!(
            PowerSource::validate(rdo(4, 100, 100, false), &caps),
            Err(InvalidRequest::ObjectPosition(4))
        );
        assert_eq!(
            PowerSource::validate(rdo(1, 1500, 1500, true), &caps),
            Err(InvalidRequest::OperatingExceedsLimit)
        );
        assert_eq!(
            PowerSource::validate(rdo(1, 900, 1500, false), &caps),
            Err(InvalidRequest::MaximumExceedsLimit)
        );
        assert!(PowerSource::validate(rdo(1, 900, 1500, true), &caps).is_ok());
    }
}
