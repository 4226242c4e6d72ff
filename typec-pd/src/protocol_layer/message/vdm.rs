//! Vendor defined message content.
//!
//! Only SOP messages between port partners are modeled. Cable plugs (SOP', SOP'') are not addressed.
use heapless::Vec;
use proc_bitfield::bitfield;
use typec_tcpm::MAX_DATA_OBJECTS;

use super::ParseError;

/// The standard ID for PD commands.
pub const PD_SID: u16 = 0xff00;

/// Maximum number of objects that follow the VDM header.
pub const MAX_VDOS: usize = MAX_DATA_OBJECTS - 1;

/// The command type of a structured VDM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandType {
    /// Initiator request.
    Request,
    /// Responder acknowledge.
    Ack,
    /// Responder not-acknowledge.
    Nak,
    /// Responder busy.
    Busy,
}

impl From<CommandType> for u8 {
    fn from(value: CommandType) -> Self {
        match value {
            CommandType::Request => 0,
            CommandType::Ack => 1,
            CommandType::Nak => 2,
            CommandType::Busy => 3,
        }
    }
}

impl From<u8> for CommandType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => CommandType::Request,
            1 => CommandType::Ack,
            2 => CommandType::Nak,
            _ => CommandType::Busy,
        }
    }
}

/// Structured VDM commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Command {
    DiscoverIdentity,
    DiscoverSvids,
    DiscoverModes,
    EnterMode,
    ExitMode,
    Attention,
    DisplayPortStatus,
    DisplayPortConfig,
    /// Reserved or SVID specific.
    Other(u8),
}

impl From<Command> for u8 {
    fn from(value: Command) -> Self {
        match value {
            Command::DiscoverIdentity => 0x1,
            Command::DiscoverSvids => 0x2,
            Command::DiscoverModes => 0x3,
            Command::EnterMode => 0x4,
            Command::ExitMode => 0x5,
            Command::Attention => 0x6,
            Command::DisplayPortStatus => 0x10,
            Command::DisplayPortConfig => 0x11,
            Command::Other(raw) => raw,
        }
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::DiscoverIdentity,
            0x02 => Command::DiscoverSvids,
            0x03 => Command::DiscoverModes,
            0x04 => Command::EnterMode,
            0x05 => Command::ExitMode,
            0x06 => Command::Attention,
            0x10 => Command::DisplayPortStatus,
            0x11 => Command::DisplayPortConfig,
            other => Command::Other(other),
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    /// The first object of every vendor defined message.
    pub struct VdmHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// Standard or vendor ID
        pub svid: u16 @ 16..=31,
        /// Structured or unstructured
        pub structured: bool @ 15,
        /// Structured VDM version
        pub version: u8 @ 13..=14,
        /// Object position, 1-based (structured)
        pub object_position: u8 @ 8..=10,
        /// Command type (structured)
        pub command_type: u8 [CommandType] @ 6..=7,
        /// Command (structured)
        pub command: u8 [Command] @ 0..=4,
        /// Vendor use (unstructured)
        pub vendor_use: u16 @ 0..=14,
    }
}

impl VdmHeader {
    /// A structured request.
    pub fn new_structured(svid: u16, command: Command, object_position: u8) -> Self {
        Self(0)
            .with_svid(svid)
            .with_structured(true)
            .with_object_position(object_position)
            .with_command_type(CommandType::Request)
            .with_command(command)
    }

    /// An unstructured message with a vendor command.
    pub fn new_unstructured(svid: u16, vendor_use: u16) -> Self {
        Self(0).with_svid(svid).with_structured(false).with_vendor_use(vendor_use)
    }

    /// A structured answer to this request.
    pub fn answer(self, command_type: CommandType) -> Self {
        self.with_command_type(command_type)
    }
}

/// A vendor defined message: a header and up to six objects.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Vdm {
    /// The VDM header.
    pub header: VdmHeader,
    /// The objects that follow the header.
    pub vdos: Vec<u32, MAX_VDOS>,
}

impl Vdm {
    /// A message without objects.
    pub fn new(header: VdmHeader) -> Self {
        Self {
            header,
            vdos: Vec::new(),
        }
    }

    /// A message with objects. Objects beyond the sixth are dropped.
    pub fn new_with_vdos(header: VdmHeader, vdos: &[u32]) -> Self {
        let count = vdos.len().min(MAX_VDOS);
        if count < vdos.len() {
            warn!("Dropping {} VDOs", vdos.len() - count);
        }

        Self {
            header,
            vdos: vdos[..count].iter().copied().collect(),
        }
    }

    /// Parse a message from the data objects of a Vendor_Defined message.
    pub fn from_words(words: &[u32]) -> Result<Self, ParseError> {
        let Some((header, vdos)) = words.split_first() else {
            return Err(ParseError::InvalidLength { expected: 1, found: 0 });
        };

        let vdos = Vec::from_slice(vdos).map_err(|_| ParseError::InvalidLength {
            expected: MAX_DATA_OBJECTS,
            found: words.len(),
        })?;

        Ok(Self {
            header: VdmHeader(*header),
            vdos,
        })
    }

    /// Serialize the message into data objects.
    pub fn to_words(&self) -> Vec<u32, MAX_DATA_OBJECTS> {
        let mut words = Vec::new();
        words.push(self.header.0).ok();
        words.extend(self.vdos.iter().copied());
        words
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The ID header VDO of a Discover Identity answer.
    pub struct IdHeader(pub u32): Debug, FromStorage, IntoStorage {
        /// USB communications capable as a USB host
        pub usb_host: bool @ 31,
        /// USB communications capable as a USB device
        pub usb_device: bool @ 30,
        /// Product type
        pub product_type: u8 @ 27..=29,
        /// Modal operation supported
        pub modal: bool @ 26,
        /// USB vendor ID
        pub vid: u16 @ 0..=15,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The product VDO of a Discover Identity answer.
    pub struct ProductVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// USB product ID
        pub pid: u16 @ 16..=31,
        /// Device release number
        pub bcd_device: u16 @ 0..=15,
    }
}

/// Maximum number of SVIDs in one Discover SVIDs answer.
pub const MAX_SVIDS_PER_MESSAGE: usize = 2 * MAX_VDOS;

/// Unpack SVIDs, two per object, up to the first zero SVID.
///
/// Also reports whether the partner filled the message, which means that more SVIDs follow on another request.
pub fn svids_from_vdos(vdos: &[u32]) -> (Vec<u16, MAX_SVIDS_PER_MESSAGE>, bool) {
    let mut svids = Vec::new();

    for vdo in vdos {
        for svid in [(vdo >> 16) as u16, *vdo as u16] {
            if svid == 0 {
                return (svids, false);
            }
            svids.push(svid).ok();
        }
    }

    let full = svids.len() == MAX_SVIDS_PER_MESSAGE;
    (svids, full)
}

/// Pack SVIDs, two per object. A list that fits is terminated by a zero SVID.
pub fn svids_to_vdos(svids: &[u16]) -> Vec<u32, MAX_VDOS> {
    let mut vdos = Vec::new();

    for pair in svids.chunks(2).take(MAX_VDOS) {
        let high = u32::from(pair[0]) << 16;
        let low = pair.get(1).copied().map(u32::from).unwrap_or(0);
        vdos.push(high | low).ok();
    }

    if svids.len() % 2 == 0 && vdos.len() < MAX_VDOS {
        vdos.push(0).ok();
    }

    vdos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_header_layout() {
        // Discover Identity request to the PD SID.
        assert_eq!(
            VdmHeader::new_structured(PD_SID, Command::DiscoverIdentity, 0).0,
            0xff00_8001
        );

        let status = VdmHeader::new_structured(0xff01, Command::DisplayPortStatus, 1);
        assert_eq!(status.0, 0xff01_8110);
        assert_eq!(status.command(), Command::DisplayPortStatus);

        let nak = status.answer(CommandType::Nak);
        assert_eq!(nak.command_type(), CommandType::Nak);
        assert_eq!(nak.object_position(), 1);
    }

    #[test]
    fn unknown_commands_are_kept() {
        let header = VdmHeader(0xff00_801f);
        assert_eq!(header.command(), Command::Other(0x1f));
        assert_eq!(header.command_type(), CommandType::Request);
    }

    #[test]
    fn svid_lists() {
        let (svids, more) = svids_from_vdos(&[0xff01_18d1, 0x0000_0000]);
        assert_eq!(svids.as_slice(), &[0xff01, 0x18d1]);
        assert!(!more);

        assert_eq!(svids_to_vdos(&[0xff01, 0x18d1]).as_slice(), &[0xff01_18d1, 0]);
        assert_eq!(svids_to_vdos(&[0xff01]).as_slice(), &[0xff01_0000]);

        let full = [0x1111_2222u32; MAX_VDOS];
        let (svids, more) = svids_from_vdos(&full);
        assert_eq!(svids.len(), MAX_SVIDS_PER_MESSAGE);
        assert!(more);
    }

    #[test]
    fn vdm_words() {
        let vdm = Vdm::new_with_vdos(VdmHeader::new_unstructured(0x18d1, 10), &[1, 2]);
        let words = vdm.to_words();
        assert_eq!(words.as_slice(), &[0x18d1_000a, 1, 2]);
        assert_eq!(Vdm::from_words(&words).unwrap(), vdm);
        assert!(Vdm::from_words(&[]).is_err());
    }
}
