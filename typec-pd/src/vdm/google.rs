//! Google vendor commands and the Google firmware update (GFU) mode.
//!
//! Vendor commands travel as unstructured VDMs with the Google VID. The command sits in the low bits
//! of the header, next to a flag that marks answers.
use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use typec_tcpm::MuxState;

use super::AltMode;
use crate::device_policy_manager::DevicePolicyManager;
use crate::protocol_layer::message::vdm::{MAX_VDOS, Vdm, VdmHeader};

/// The Google USB vendor ID, also the SVID of the firmware update mode.
pub const GOOGLE_VID: u16 = 0x18d1;

/// Marks an unstructured VDM as answer.
pub const VDO_SRC_RESPONDER: u16 = 1 << 6;

const COMMAND_MASK: u16 = 0x1f;

/// Words of a firmware hash.
pub const HASH_WORDS: usize = 5;

/// Vendor commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VendorCommand {
    /// Read the firmware hash and device ID.
    ReadInfo,
    /// Read the firmware version string.
    Version,
    /// Read the current drawn by the accessory.
    Current,
    /// Read one entry of the accessory's event log.
    GetLog,
    /// Unsolicited firmware hash and device ID.
    SendInfo,
    /// Flashing, reboot and other commands that are not handled.
    Other(u8),
}

impl From<VendorCommand> for u8 {
    fn from(value: VendorCommand) -> Self {
        match value {
            VendorCommand::ReadInfo => 10,
            VendorCommand::Version => 11,
            VendorCommand::Current => 21,
            VendorCommand::GetLog => 23,
            VendorCommand::SendInfo => 26,
            VendorCommand::Other(raw) => raw,
        }
    }
}

impl From<u8> for VendorCommand {
    fn from(value: u8) -> Self {
        match value {
            10 => VendorCommand::ReadInfo,
            11 => VendorCommand::Version,
            21 => VendorCommand::Current,
            23 => VendorCommand::GetLog,
            26 => VendorCommand::SendInfo,
            other => VendorCommand::Other(other),
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The last object of READ_INFO and SEND_INFO answers.
    pub struct InfoVdo(pub u32): Debug, FromStorage, IntoStorage {
        /// Hardware device ID
        pub hw_dev_id: u16 @ 16..=31,
        /// Software debug version
        pub sw_debug_version: u16 @ 1..=15,
        /// Running the RW image
        pub is_rw: bool @ 0,
    }
}

/// The firmware image that an accessory runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FirmwareImage {
    /// Not reported.
    Unknown,
    /// The read-only image.
    Ro,
    /// The read-write image.
    Rw,
}

/// What an accessory reported about its firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Hardware device ID, zero when not reported.
    pub dev_id: u16,
    /// Hash of the RW image.
    pub hash: [u32; HASH_WORDS],
    /// The running image.
    pub image: FirmwareImage,
}

impl DeviceInfo {
    /// Decode the objects of a READ_INFO or SEND_INFO answer.
    ///
    /// Old accessories send the hash only, without the info object.
    pub fn from_vdos(vdos: &[u32]) -> Option<Self> {
        let hash: [u32; HASH_WORDS] = vdos.get(..HASH_WORDS)?.try_into().ok()?;

        Some(match vdos.get(HASH_WORDS) {
            Some(vdo) => {
                let info = InfoVdo(*vdo);
                Self {
                    dev_id: info.hw_dev_id(),
                    hash,
                    image: if info.is_rw() {
                        FirmwareImage::Rw
                    } else {
                        FirmwareImage::Ro
                    },
                }
            }
            None => Self {
                dev_id: 0,
                hash,
                image: FirmwareImage::Unknown,
            },
        })
    }
}

/// A vendor command request.
pub fn request(command: VendorCommand, vdos: &[u32]) -> Vdm {
    Vdm::new_with_vdos(VdmHeader::new_unstructured(GOOGLE_VID, u8::from(command).into()), vdos)
}

fn answer(command: VendorCommand, vdos: &[u32]) -> Vdm {
    let vendor_use = u16::from(u8::from(command)) | VDO_SRC_RESPONDER;
    Vdm::new_with_vdos(VdmHeader::new_unstructured(GOOGLE_VID, vendor_use), vdos)
}

/// Pack a version string into objects. The string is cut, so that a terminating NUL always fits.
pub fn encode_version(version: &str) -> heapless::Vec<u32, MAX_VDOS> {
    let mut bytes = [0u8; 4 * MAX_VDOS];
    let length = version.len().min(bytes.len() - 1);
    bytes[..length].copy_from_slice(&version.as_bytes()[..length]);

    let mut words = [0u32; MAX_VDOS];
    let word_count = (length + 1).div_ceil(4);
    LittleEndian::read_u32_into(&bytes[..4 * word_count], &mut words[..word_count]);
    words[..word_count].iter().copied().collect()
}

/// Unpack a version string, up to its terminating NUL.
pub fn decode_version<'a>(vdos: &[u32], buffer: &'a mut [u8; 4 * MAX_VDOS]) -> Option<&'a str> {
    let word_count = vdos.len().min(MAX_VDOS);
    LittleEndian::write_u32_into(&vdos[..word_count], &mut buffer[..4 * word_count]);

    let bytes = &buffer[..4 * word_count];
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).ok()
}

/// Handle a Google vendor command.
///
/// Answers from accessories are recorded through the device policy manager. Requests for the version
/// string and the event log are answered.
pub fn handle_vendor_command<DPM: DevicePolicyManager + ?Sized>(dpm: &mut DPM, vdm: &Vdm) -> Option<Vdm> {
    if vdm.header.svid() != GOOGLE_VID {
        debug!("Ignoring unstructured VDM for SVID {:#x}", vdm.header.svid());
        return None;
    }

    let vendor_use = vdm.header.vendor_use();
    let command = VendorCommand::from((vendor_use & COMMAND_MASK) as u8);

    if vendor_use & VDO_SRC_RESPONDER == 0 {
        return match command {
            VendorCommand::Version => dpm
                .firmware_version()
                .map(|version| answer(command, &encode_version(version))),
            VendorCommand::GetLog => Some(answer(command, &dpm.next_log_entry().to_vdos())),
            _ => {
                trace!("Ignoring vendor request {:?}", command);
                None
            }
        };
    }

    match command {
        VendorCommand::ReadInfo | VendorCommand::SendInfo => match DeviceInfo::from_vdos(&vdm.vdos) {
            Some(info) => {
                info!("Accessory device ID {:#x}, image {:?}", info.dev_id, info.image);
                dpm.store_device_info(info);
            }
            None => warn!("Truncated device info"),
        },
        VendorCommand::Version => {
            let mut buffer = [0u8; 4 * MAX_VDOS];
            if let Some(_version) = decode_version(&vdm.vdos, &mut buffer) {
                info!("Accessory version: {}", _version);
            }
        }
        VendorCommand::Current => {
            if let Some(_current_ma) = vdm.vdos.first() {
                info!("Accessory current: {} mA", _current_ma);
            }
        }
        VendorCommand::GetLog => dpm.log_remote_entry(&vdm.vdos),
        VendorCommand::Other(_) => trace!("Ignoring vendor answer {:?}", command),
    }

    None
}

/// The Google firmware update mode.
///
/// Always entered. Instead of a structured status request, the accessory's firmware info is read.
#[derive(Debug, Default)]
pub struct GoogleFirmwareUpdateMode {
    entered: bool,
}

impl GoogleFirmwareUpdateMode {
    /// Whether the mode is entered.
    pub fn entered(&self) -> bool {
        self.entered
    }
}

impl AltMode for GoogleFirmwareUpdateMode {
    fn svid(&self) -> u16 {
        GOOGLE_VID
    }

    fn enter(&mut self, _mode_caps: u32) -> bool {
        self.entered = true;
        true
    }

    fn status(&mut self, _object_position: u8) -> Option<Vdm> {
        Some(request(VendorCommand::ReadInfo, &[]))
    }

    fn config(&mut self, _object_position: u8, _status: &[u32]) -> Option<Vdm> {
        None
    }

    fn attention(&mut self, _vdos: &[u32]) -> bool {
        false
    }

    fn exit(&mut self) {
        self.entered = false;
    }

    fn mux_state(&self) -> MuxState {
        MuxState::USB
    }
}
