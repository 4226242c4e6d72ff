//! Power data objects, as advertised in capability messages.
use heapless::Vec;
use proc_bitfield::bitfield;
use typec_tcpm::MAX_DATA_OBJECTS;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::millivolt;

use super::_50millivolts_mod::_50millivolts;
use super::_250milliwatts_mod::_250milliwatts;
use super::ParseError;
use super::units::{ElectricCurrent, ElectricPotential, Power};

/// A power data object of any kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// A fixed voltage supply.
    FixedSupply(FixedSupply),
    /// A battery.
    Battery(Battery),
    /// A variable voltage supply.
    VariableSupply(VariableSupply),
    /// Augmented objects (PPS), which are not supported.
    Unknown(u32),
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        pub kind: u8 @ 30..=31,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A fixed supply. The first object of every source capability list is the 5 V one.
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// USB suspend supported
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl FixedSupply {
    /// A fixed supply with the given voltage and maximum current.
    pub fn new(voltage: ElectricPotential, max_current: ElectricCurrent) -> Self {
        Self(0)
            .with_raw_voltage(voltage.get::<_50millivolts>() as u16)
            .with_raw_max_current(max_current.get::<centiampere>() as u16)
    }

    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A battery supply.
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum Allowable Power in 250 mW units
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// A battery supply with the given voltage range and power.
    pub fn new(min_voltage: ElectricPotential, max_voltage: ElectricPotential, max_power: Power) -> Self {
        Self(0)
            .with_kind(0b01)
            .with_raw_min_voltage(min_voltage.get::<_50millivolts>() as u16)
            .with_raw_max_voltage(max_voltage.get::<_50millivolts>() as u16)
            .with_raw_max_power(max_power.get::<_250milliwatts>() as u16)
    }

    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn max_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_power().into())
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// A variable supply (non-battery).
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply (non-battery)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// A variable supply with the given voltage range and current.
    pub fn new(min_voltage: ElectricPotential, max_voltage: ElectricPotential, max_current: ElectricCurrent) -> Self {
        Self(0)
            .with_kind(0b10)
            .with_raw_min_voltage(min_voltage.get::<_50millivolts>() as u16)
            .with_raw_max_voltage(max_voltage.get::<_50millivolts>() as u16)
            .with_raw_max_current(max_current.get::<centiampere>() as u16)
    }

    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

impl PowerDataObject {
    /// Decode a raw object.
    pub fn from_raw(raw: u32) -> Self {
        match RawPowerDataObject(raw).kind() {
            0b00 => Self::FixedSupply(FixedSupply(raw)),
            0b01 => Self::Battery(Battery(raw)),
            0b10 => Self::VariableSupply(VariableSupply(raw)),
            _ => Self::Unknown(raw),
        }
    }

    /// Encode the object.
    pub fn to_raw(&self) -> u32 {
        match self {
            Self::FixedSupply(pdo) => pdo.0,
            Self::Battery(pdo) => pdo.0,
            Self::VariableSupply(pdo) => pdo.0,
            Self::Unknown(raw) => *raw,
        }
    }

    /// The lowest voltage of the supply.
    pub fn min_voltage(&self) -> ElectricPotential {
        match self {
            Self::FixedSupply(pdo) => pdo.voltage(),
            Self::Battery(pdo) => pdo.min_voltage(),
            Self::VariableSupply(pdo) => pdo.min_voltage(),
            Self::Unknown(_) => ElectricPotential::new::<millivolt>(0),
        }
    }

    /// The power that the supply offers at its lowest voltage.
    pub fn max_power(&self) -> Power {
        match self {
            Self::FixedSupply(pdo) => pdo.max_current() * pdo.voltage(),
            Self::Battery(pdo) => pdo.max_power(),
            Self::VariableSupply(pdo) => pdo.max_current() * pdo.min_voltage(),
            Self::Unknown(_) => Power::new::<_250milliwatts>(0),
        }
    }

    /// The raw 10 bit current or power field, that requests are checked against.
    pub fn raw_limit(&self) -> u16 {
        match self {
            Self::FixedSupply(pdo) => pdo.raw_max_current(),
            Self::Battery(pdo) => pdo.raw_max_power(),
            Self::VariableSupply(pdo) => pdo.raw_max_current(),
            Self::Unknown(_) => 0,
        }
    }
}

/// An ordered list of power data objects, indexed from 1 on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(pub Vec<PowerDataObject, MAX_DATA_OBJECTS>);

impl Capabilities {
    /// Build a list from objects.
    pub fn from_objects(objects: &[PowerDataObject]) -> Result<Self, ParseError> {
        Vec::from_slice(objects)
            .map(Self)
            .map_err(|_| ParseError::InvalidLength {
                expected: MAX_DATA_OBJECTS,
                found: objects.len(),
            })
    }

    /// Decode a list from raw words.
    pub fn from_words(words: &[u32]) -> Result<Self, ParseError> {
        let mut objects = Vec::new();
        for word in words {
            objects
                .push(PowerDataObject::from_raw(*word))
                .map_err(|_| ParseError::InvalidLength {
                    expected: MAX_DATA_OBJECTS,
                    found: words.len(),
                })?;
        }
        Ok(Self(objects))
    }

    /// Encode the list into raw words.
    pub fn to_words(&self) -> Vec<u32, MAX_DATA_OBJECTS> {
        self.0.iter().map(PowerDataObject::to_raw).collect()
    }

    /// The object at a 1-based position.
    pub fn get(&self, position: u8) -> Option<&PowerDataObject> {
        usize::from(position).checked_sub(1).and_then(|index| self.0.get(index))
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the objects, in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &PowerDataObject> {
        self.0.iter()
    }

    /// The vSafe5V object, which carries the port-wide flags.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        match self.0.first() {
            Some(PowerDataObject::FixedSupply(supply)) => Some(supply),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::volt;
    use uom::si::power::{milliwatt, watt};

    use super::*;

    #[test]
    fn fixed_supply_layout() {
        let pdo = FixedSupply::new(
            ElectricPotential::new::<volt>(5),
            ElectricCurrent::new::<milliampere>(1000),
        )
        .with_dual_role_power(true)
        .with_dual_role_data(true);
        assert_eq!(pdo.0, 0x2201_9064);
        assert_eq!(pdo.voltage().get::<millivolt>(), 5000);
        assert_eq!(pdo.max_current().get::<milliampere>(), 1000);
        assert_eq!(PowerDataObject::FixedSupply(pdo).max_power().get::<watt>(), 5);
    }

    #[test]
    fn kinds_are_decoded() {
        let battery = Battery::new(
            ElectricPotential::new::<volt>(5),
            ElectricPotential::new::<volt>(20),
            Power::new::<watt>(15),
        );
        let variable = VariableSupply::new(
            ElectricPotential::new::<volt>(5),
            ElectricPotential::new::<volt>(12),
            ElectricCurrent::new::<milliampere>(2000),
        );

        let caps = Capabilities::from_words(&[0x2201_9064, battery.0, variable.0, 0xc000_0000]).unwrap();
        assert_eq!(caps.len(), 4);
        assert!(matches!(caps.get(1), Some(PowerDataObject::FixedSupply(_))));
        assert_eq!(caps.get(2), Some(&PowerDataObject::Battery(battery)));
        assert_eq!(caps.get(3).map(|pdo| pdo.min_voltage().get::<millivolt>()), Some(5000));
        assert!(matches!(caps.get(4), Some(PowerDataObject::Unknown(_))));
        assert_eq!(caps.get(0), None);
        assert_eq!(caps.get(5), None);

        assert!(caps.vsafe_5v().unwrap().dual_role_power());
        assert_eq!(battery.max_power().get::<milliwatt>(), 15000);
        assert_eq!(battery.max_voltage().get::<volt>(), 20);
        assert_eq!(caps.to_words()[1], battery.0);
    }
}
