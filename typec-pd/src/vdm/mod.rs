//! Vendor defined message dispatching.
//!
//! As responder, structured requests are answered from the device policy manager, and unstructured
//! messages are handed to its custom handler. As DFP, the policy engine discovers the partner's
//! identity, SVIDs and modes, and enters one mode through an [`AltMode`] driver.
pub mod displayport;
pub mod google;

use heapless::Vec;
use typec_tcpm::MuxState;

use crate::device_policy_manager::DevicePolicyManager;
use crate::protocol_layer::message::vdm::{
    Command, CommandType, IdHeader, MAX_VDOS, PD_SID, ProductVdo, Vdm, svids_from_vdos,
};

/// Maximum number of SVIDs that are kept from discovery.
pub const MAX_SVIDS: usize = 16;

/// Maximum number of SVIDs whose modes are kept from discovery.
pub const MAX_MODE_SVIDS: usize = 4;

/// A driver for one alternate mode, entered as DFP.
pub trait AltMode {
    /// The SVID that the mode belongs to.
    fn svid(&self) -> u16;

    /// Decide whether to enter the mode with the given capabilities.
    fn enter(&mut self, mode_caps: u32) -> bool;

    /// The status request to send after the mode was entered.
    ///
    /// A structured request is followed by [`AltMode::config`], once answered.
    /// An unstructured message is sent on its own, and ends the sequence.
    fn status(&mut self, object_position: u8) -> Option<Vdm>;

    /// The configuration request to send, given the objects of the status answer.
    fn config(&mut self, object_position: u8, status: &[u32]) -> Option<Vdm>;

    /// The configuration was acknowledged.
    fn post_config(&mut self) {}

    /// The partner sent an attention request. Reports whether it was handled.
    fn attention(&mut self, vdos: &[u32]) -> bool;

    /// The mode was left, or the partner went away.
    fn exit(&mut self);

    /// The signal mux configuration that the mode needs.
    fn mux_state(&self) -> MuxState;
}

/// The partner's answer to Discover Identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    /// The ID header.
    pub header: IdHeader,
    /// The product VDO, if it was sent.
    pub product: Option<ProductVdo>,
}

/// The mode that was entered as DFP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActiveMode {
    /// The SVID of the mode.
    pub svid: u16,
    /// The 1-based position of the mode in the Discover Modes answer.
    pub object_position: u8,
}

/// Discovered modes of one SVID.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Modes {
    /// The SVID.
    pub svid: u16,
    /// Mode capabilities, one per object position.
    pub capabilities: Vec<u32, MAX_VDOS>,
}

/// What a DFP learned about the port partner through discovery, and the mode that it entered.
///
/// Everything is dropped on detach, hard reset and data role swap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VdmState {
    /// The partner's identity.
    pub identity: Option<Identity>,
    /// The partner's SVIDs, in the order of its answers.
    pub svids: Vec<u16, MAX_SVIDS>,
    /// The partner's modes, per SVID.
    pub modes: Vec<Modes, MAX_MODE_SVIDS>,
    /// The entered mode.
    pub active: Option<ActiveMode>,
}

impl VdmState {
    /// Forget everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record a Discover Identity answer. Reports whether the partner supports modes.
    pub fn record_identity(&mut self, vdos: &[u32]) -> bool {
        let Some(header) = vdos.first().map(|vdo| IdHeader(*vdo)) else {
            warn!("Discover Identity answer without ID header");
            return false;
        };

        debug!("Partner VID {:#x}, modal {}", header.vid(), header.modal());
        self.identity = Some(Identity {
            header,
            product: vdos.get(2).map(|vdo| ProductVdo(*vdo)),
        });
        header.modal()
    }

    /// Record a Discover SVIDs answer. Reports whether more SVIDs shall be requested.
    pub fn record_svids(&mut self, vdos: &[u32]) -> bool {
        let (svids, more) = svids_from_vdos(vdos);

        for svid in svids {
            if self.svids.push(svid).is_err() {
                warn!("Too many SVIDs, ignoring {:#x}", svid);
                return false;
            }
        }

        more
    }

    /// Record a Discover Modes answer for an SVID.
    pub fn record_modes(&mut self, svid: u16, vdos: &[u32]) {
        let modes = Modes {
            svid,
            capabilities: vdos.iter().copied().take(MAX_VDOS).collect(),
        };

        if self.modes.push(modes).is_err() {
            warn!("Too many mode lists, ignoring SVID {:#x}", svid);
        }
    }

    /// The capabilities of a discovered mode, by SVID and 1-based object position.
    pub fn mode_caps(&self, svid: u16, object_position: u8) -> Option<u32> {
        let index = usize::from(object_position).checked_sub(1)?;
        self.modes
            .iter()
            .find(|modes| modes.svid == svid)
            .and_then(|modes| modes.capabilities.get(index).copied())
    }

    /// The entered mode, if it belongs to the given SVID.
    pub fn active_for(&self, svid: u16) -> Option<ActiveMode> {
        self.active.filter(|active| active.svid == svid)
    }
}

/// Answer a received VDM as responder.
///
/// Reports the message to transmit in return, if any. Unknown commands and SVIDs are answered with NAK.
/// Answers to our own requests are not handled here, they are ignored when they arrive unsolicited.
pub fn respond<DPM: DevicePolicyManager + ?Sized>(dpm: &mut DPM, state: &VdmState, request: &Vdm) -> Option<Vdm> {
    let header = request.header;

    if !header.structured() {
        return dpm.custom_vdm(request);
    }

    if header.command_type() != CommandType::Request {
        trace!("Ignoring unsolicited VDM answer {:?}", header.command_type());
        return None;
    }

    let svid = header.svid();
    let object_position = header.object_position();

    let answer = match header.command() {
        Command::DiscoverIdentity if svid == PD_SID => dpm.identity(),
        Command::DiscoverSvids if svid == PD_SID => dpm.svids(),
        Command::DiscoverModes if svid != PD_SID => dpm.modes(svid),
        Command::EnterMode => dpm.enter_mode(svid, object_position).then(Vec::new),
        Command::ExitMode => dpm.exit_mode(svid, object_position).then(Vec::new),
        Command::Attention => {
            if state.active_for(svid).is_some() {
                if let Some(mode) = dpm.alt_mode(svid) {
                    mode.attention(&request.vdos);
                }
            }
            return None;
        }
        _command => {
            debug!("Unsupported VDM command {:?} for SVID {:#x}", _command, svid);
            None
        }
    };

    Some(match answer {
        Some(vdos) => Vdm::new_with_vdos(header.answer(CommandType::Ack), &vdos),
        None => Vdm::new(header.answer(CommandType::Nak)),
    })
}
