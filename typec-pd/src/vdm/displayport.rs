//! The DisplayPort alternate mode, entered as DFP_D.
use proc_bitfield::bitfield;
use typec_tcpm::MuxState;

use super::AltMode;
use crate::protocol_layer::message::vdm::{Command, Vdm, VdmHeader};

/// The standard ID of DisplayPort.
pub const DP_SID: u16 = 0xff01;

/// Pin assignment E, in the configuration VDO.
pub const PIN_ASSIGNMENT_E: u8 = 1 << 4;

/// DisplayPort 1.3 signaling, in the configuration VDO.
pub const SIGNALING_DP_1_3: u8 = 1;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Mode capabilities from a Discover Modes answer.
    pub struct ModeCaps(pub u32): Debug, FromStorage, IntoStorage {
        /// Pin assignments supported as UFP_D
        pub ufp_d_pin_assignments: u8 @ 16..=23,
        /// Pin assignments supported as DFP_D
        pub dfp_d_pin_assignments: u8 @ 8..=15,
        /// Signaling for transport of DisplayPort protocol
        pub signaling: u8 @ 2..=5,
        /// Port capability (bit 0: UFP_D capable, bit 1: DFP_D capable)
        pub port_capability: u8 @ 0..=1,
    }
}

impl ModeCaps {
    /// The partner can act as UFP_D, i.e. display sink.
    pub fn ufp_d_capable(&self) -> bool {
        self.port_capability() & 0b01 != 0
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Status update, sent in DisplayPort Status requests, answers and attention.
    pub struct StatusVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// HPD interrupt
        pub irq_hpd: bool @ 8,
        /// HPD state
        pub hpd_level: bool @ 7,
        /// Exit DisplayPort mode request
        pub exit_request: bool @ 6,
        /// USB configuration request
        pub usb_config_request: bool @ 5,
        /// Multi-function preferred
        pub multi_function: bool @ 4,
        /// DisplayPort functionality is enabled
        pub enabled: bool @ 3,
        /// Power low
        pub power_low: bool @ 2,
        /// Connected as DFP_D (bit 0) and/or UFP_D (bit 1)
        pub connected: u8 @ 0..=1,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Configuration, sent in DisplayPort Configure requests.
    pub struct ConfigVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// Pin assignment
        pub pin_assignment: u8 @ 8..=15,
        /// Signaling
        pub signaling: u8 @ 2..=5,
        /// 0: USB, 1: DFP_D, 2: UFP_D
        pub config: u8 @ 0..=1,
    }
}

/// DisplayPort mode driver.
///
/// Configures the partner as UFP_D with pin assignment E. The display path is only reported as on,
/// once the configuration was acknowledged.
#[derive(Debug, Default)]
pub struct DisplayPortMode {
    enabled: bool,
    partner_status: StatusVdo,
}

impl DisplayPortMode {
    /// Whether the display path is on.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The last status that the partner reported.
    pub fn partner_status(&self) -> StatusVdo {
        self.partner_status
    }

    fn make_safe(&mut self) {
        self.enabled = false;
        self.partner_status = StatusVdo::default();
    }
}

impl AltMode for DisplayPortMode {
    fn svid(&self) -> u16 {
        DP_SID
    }

    fn enter(&mut self, mode_caps: u32) -> bool {
        self.make_safe();
        ModeCaps(mode_caps).ufp_d_capable()
    }

    fn status(&mut self, object_position: u8) -> Option<Vdm> {
        let status = StatusVdo::default()
            .with_enabled(self.enabled)
            .with_connected(if self.enabled { 1 } else { 0 });

        Some(Vdm::new_with_vdos(
            VdmHeader::new_structured(DP_SID, Command::DisplayPortStatus, object_position),
            &[status.0],
        ))
    }

    fn config(&mut self, object_position: u8, status: &[u32]) -> Option<Vdm> {
        if let Some(vdo) = status.first() {
            self.partner_status = StatusVdo(*vdo);
        }

        let config = ConfigVdo::default()
            .with_pin_assignment(PIN_ASSIGNMENT_E)
            .with_signaling(SIGNALING_DP_1_3)
            .with_config(2);

        Some(Vdm::new_with_vdos(
            VdmHeader::new_structured(DP_SID, Command::DisplayPortConfig, object_position),
            &[config.0],
        ))
    }

    fn post_config(&mut self) {
        self.enabled = true;
    }

    fn attention(&mut self, vdos: &[u32]) -> bool {
        if let Some(vdo) = vdos.first() {
            self.partner_status = StatusVdo(*vdo);
            trace!("DisplayPort HPD {}", self.partner_status.hpd_level());
        }
        true
    }

    fn exit(&mut self) {
        self.make_safe();
    }

    fn mux_state(&self) -> MuxState {
        if self.enabled { MuxState::DP } else { MuxState::USB }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_layer::message::vdm::CommandType;

    #[test]
    fn enter_needs_ufp_d() {
        let mut mode = DisplayPortMode::default();
        assert!(mode.enter(0x0000_0405));
        assert!(!mode.enter(0x0000_0402));
    }

    #[test]
    fn status_and_config_requests() {
        let mut mode = DisplayPortMode::default();
        assert!(mode.enter(0x0000_0405));

        let status = mode.status(1).unwrap();
        assert_eq!(status.header.0, 0xff01_8110);
        assert_eq!(status.header.command_type(), CommandType::Request);
        assert_eq!(status.vdos.as_slice(), &[0]);

        let config = mode.config(1, &[StatusVdo::default().with_connected(2).0]).unwrap();
        assert_eq!(config.header.command(), Command::DisplayPortConfig);
        assert_eq!(config.vdos.as_slice(), &[(0x10 << 8) | (1 << 2) | 2]);
        assert_eq!(mode.partner_status().connected(), 2);

        assert_eq!(mode.mux_state(), MuxState::USB);
        mode.post_config();
        assert_eq!(mode.mux_state(), MuxState::DP);

        // Once on, the status reports the enabled and connected display path.
        assert_eq!(mode.status(1).unwrap().vdos.as_slice(), &[(1 << 3) | 1]);

        mode.exit();
        assert!(!mode.enabled());
    }

    #[test]
    fn attention_records_hpd() {
        let mut mode = DisplayPortMode::default();
        assert!(mode.attention(&[StatusVdo::default().with_hpd_level(true).0]));
        assert!(mode.partner_status().hpd_level());
    }
}
