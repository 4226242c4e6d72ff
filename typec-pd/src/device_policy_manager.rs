//! The device policy manager (DPM) allows a board to control the policy engine, and be informed about status changes.
//!
//! The policy engine calls into the DPM whenever a decision depends on the board: which voltages are
//! acceptable, how the power supply is switched, whether a role swap is allowed, and how vendor
//! defined messages are answered. Every method has a default, so that a minimal board only
//! overrides what it needs.
use core::future::Future;

use heapless::Vec;

use crate::DataRole;
use crate::config::DualRoleMode;
use crate::event_log::LogEntry;
use crate::policy_engine::PortStatus;
use crate::protocol_layer::message::pdo::Capabilities;
use crate::protocol_layer::message::units::{ElectricCurrent, ElectricPotential};
use crate::protocol_layer::message::vdm::{MAX_VDOS, Vdm};
use crate::vdm::AltMode;
use crate::vdm::google::{self, DeviceInfo};

/// Events that the device policy manager can send to the policy engine.
///
/// They are evaluated while the port is in a ready state, except for dual-role, suspend and
/// resume changes, which apply in any state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Initiate a power role swap.
    RequestPowerSwap,
    /// Initiate a data role swap.
    RequestDataSwap,
    /// Initiate a VCONN swap.
    RequestVconnSwap,
    /// Send a vendor defined message.
    ///
    /// Standard commands to the PD SID are sent structured, anything else unstructured.
    SendVdm {
        /// The standard or vendor ID.
        svid: u16,
        /// The command.
        command: u8,
        /// Objects that follow the VDM header.
        vdos: Vec<u32, MAX_VDOS>,
    },
    /// Send hard reset signaling.
    HardReset,
    /// Send a soft reset.
    SoftReset,
    /// Negotiate the contract again.
    ///
    /// As a sink, the request is evaluated again with the new voltage limit, if any.
    /// As a source, the capabilities are sent again.
    Renegotiate {
        /// A new upper voltage limit for requests.
        max_voltage_mv: Option<u32>,
    },
    /// Change the dual-role policy.
    SetDualRole(DualRoleMode),
    /// Stop all PD activity on the port.
    Suspend,
    /// Start PD activity on a suspended port.
    Resume,
}

/// What the vSafe5V object of a port partner tells about it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartnerFlags {
    /// The partner can be source or sink.
    pub dual_role_power: bool,
    /// The partner can be DFP or UFP.
    pub dual_role_data: bool,
    /// The partner has a power supply apart from VBUS.
    pub externally_powered: bool,
    /// The partner can communicate over USB.
    pub usb_communications: bool,
}

impl PartnerFlags {
    /// Extract the flags from a capability list. Lists without a vSafe5V object carry no flags.
    pub fn from_capabilities(capabilities: &Capabilities) -> Self {
        capabilities
            .vsafe_5v()
            .map(|supply| Self {
                dual_role_power: supply.dual_role_power(),
                dual_role_data: supply.dual_role_data(),
                externally_powered: supply.unconstrained_power(),
                usb_communications: supply.usb_communications_capable(),
            })
            .unwrap_or_default()
    }
}

/// The power supply could not be switched.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("power supply fault")]
pub struct PowerSupplyError;

/// Trait for the device policy manager.
///
/// This entity commands the policy engine and enforces board policy.
pub trait DevicePolicyManager {
    /// Whether a sink may request the given voltage.
    fn is_valid_input_voltage(&self, _voltage: ElectricPotential) -> bool {
        true
    }

    /// Switch the source supply to the voltage of the object at the 1-based position.
    fn transition_voltage(&mut self, _object_position: u8) -> impl Future<Output = ()> {
        async {}
    }

    /// Turn on VBUS as a source.
    fn set_power_supply_ready(&mut self) -> impl Future<Output = Result<(), PowerSupplyError>> {
        async { Ok(()) }
    }

    /// Turn off VBUS as a source, and discharge it.
    fn power_supply_reset(&mut self) -> impl Future<Output = ()> {
        async {}
    }

    /// Limit the current that a sink draws from VBUS at the given voltage.
    ///
    /// Called with zero current when power goes away.
    fn set_input_current_limit(
        &mut self,
        _current: ElectricCurrent,
        _voltage: ElectricPotential,
    ) -> impl Future<Output = ()> {
        async {}
    }

    /// Limit the current that a sink draws, as advertised by the source's Rp, before any contract.
    fn set_typec_current_limit(&mut self, _current: ElectricCurrent) -> impl Future<Output = ()> {
        async {}
    }

    /// Switch the USB stack to a new data role, after a completed data role swap.
    fn execute_data_swap(&mut self, _data_role: DataRole) -> impl Future<Output = ()> {
        async {}
    }

    /// Whether a power role swap is allowed.
    ///
    /// Swaps are only ever accepted on ports with [`DualRoleMode::ToggleOn`].
    fn check_power_swap(&self) -> bool {
        true
    }

    /// Whether a data role swap away from the present data role is allowed.
    fn check_data_swap(&self, _data_role: DataRole) -> bool {
        true
    }

    /// Whether a VCONN swap is allowed.
    fn check_vconn_swap(&self) -> bool {
        true
    }

    /// Decide on a power role swap, when a contract is first established.
    ///
    /// Reports whether a swap shall be requested.
    fn check_pr_role(&self, _partner: PartnerFlags) -> bool {
        false
    }

    /// Decide on a data role swap, when a contract is first established.
    ///
    /// Reports whether a swap shall be requested. By default, a UFP asks a dual-role partner to swap,
    /// so that it can act as host.
    fn check_dr_role(&self, data_role: DataRole, partner: PartnerFlags) -> bool {
        data_role == DataRole::Ufp && partner.dual_role_data
    }

    /// Board conditions that prevent PD operation, evaluated before every negotiation.
    fn board_checks(&mut self) -> bool {
        true
    }

    /// Whether VBUS is provided by the port partner, given what the port controller reports.
    fn snk_is_vbus_provided(&self, tcpc_vbus: bool) -> bool {
        tcpc_vbus
    }

    /// Handle an unstructured VDM.
    ///
    /// Reports the answer to transmit, if any. By default, Google vendor commands are handled.
    fn custom_vdm(&mut self, vdm: &Vdm) -> Option<Vdm> {
        google::handle_vendor_command(self, vdm)
    }

    /// Objects of a Discover Identity answer. `None` answers with NAK.
    fn identity(&self) -> Option<Vec<u32, MAX_VDOS>> {
        None
    }

    /// Objects of a Discover SVIDs answer. `None` answers with NAK.
    fn svids(&self) -> Option<Vec<u32, MAX_VDOS>> {
        None
    }

    /// Objects of a Discover Modes answer for an SVID. `None` answers with NAK.
    fn modes(&self, _svid: u16) -> Option<Vec<u32, MAX_VDOS>> {
        None
    }

    /// Enter a mode that this port offers as UFP. Reports whether the mode was entered.
    fn enter_mode(&mut self, _svid: u16, _object_position: u8) -> bool {
        false
    }

    /// Exit a mode that this port offers as UFP. Reports whether the mode was exited.
    fn exit_mode(&mut self, _svid: u16, _object_position: u8) -> bool {
        false
    }

    /// The alternate mode driver that enters modes of the given SVID as DFP.
    fn alt_mode(&mut self, _svid: u16) -> Option<&mut dyn AltMode> {
        None
    }

    /// A firmware version string that is handed out to port partners.
    fn firmware_version(&self) -> Option<&str> {
        None
    }

    /// Store what a port partner reported about its firmware.
    fn store_device_info(&mut self, _info: DeviceInfo) {}

    /// Record an event in the PD event log.
    fn log_event(&mut self, _entry: LogEntry) {}

    /// Merge a log entry that an accessory reported in a GET_LOG answer.
    fn log_remote_entry(&mut self, _vdos: &[u32]) {}

    /// Take the oldest entry of the PD event log, to answer a GET_LOG request.
    fn next_log_entry(&mut self) -> LogEntry {
        LogEntry::no_entry()
    }

    /// Informed about every change of the port status.
    fn status_changed(&mut self, _status: &PortStatus) {}

    /// The policy engine gets and evaluates device policy events.
    ///
    /// By default, this is a future that never resolves.
    fn get_event(&mut self) -> impl Future<Output = Event> {
        async { core::future::pending().await }
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::ampere;
    use uom::si::electric_potential::volt;

    use super::*;
    use crate::protocol_layer::message::pdo::{FixedSupply, PowerDataObject};

    #[test]
    fn partner_flags_from_vsafe_5v() {
        let supply = FixedSupply::new(ElectricPotential::new::<volt>(5), ElectricCurrent::new::<ampere>(3))
            .with_dual_role_power(true)
            .with_dual_role_data(true)
            .with_unconstrained_power(true);
        let caps = Capabilities::from_objects(&[PowerDataObject::FixedSupply(supply)]).unwrap();

        let flags = PartnerFlags::from_capabilities(&caps);
        assert!(flags.dual_role_power);
        assert!(flags.dual_role_data);
        assert!(flags.externally_powered);
        assert!(!flags.usb_communications);

        assert_eq!(PartnerFlags::from_capabilities(&Capabilities::default()), PartnerFlags::default());
    }
}
