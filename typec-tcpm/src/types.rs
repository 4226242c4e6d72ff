//! Type-C and PD wire-level types shared by the port manager and its drivers.
use heapless::Vec;

/// Maximum number of 32 bit data objects in a standard PD message.
pub const MAX_DATA_OBJECTS: usize = 7;

/// Maximum number of words in a frame: data objects, plus the CRC word of soft PHYs.
pub const FRAME_WORDS: usize = MAX_DATA_OBJECTS + 1;

/// Number of retransmissions after the first attempt, before a transmission is declared failed.
pub const PD_RETRY_COUNT: u8 = 3;

/// Time to wait for the TCPC to report the completion of a transmission.
pub const PD_T_TCPC_TX_TIMEOUT_MS: u64 = 100;

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerRole {
    /// Consumes power from VBUS.
    Sink,
    /// Provides power on VBUS.
    Source,
}

impl PowerRole {
    /// The role of the port partner.
    pub fn swapped(self) -> Self {
        match self {
            Self::Sink => Self::Source,
            Self::Source => Self::Sink,
        }
    }
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataRole {
    /// Upstream facing port (device).
    Ufp,
    /// Downstream facing port (host).
    Dfp,
}

impl DataRole {
    /// The role of the port partner.
    pub fn swapped(self) -> Self {
        match self {
            Self::Ufp => Self::Dfp,
            Self::Dfp => Self::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}

/// The CC line that carries PD communication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    /// Communication on CC1.
    Cc1,
    /// Communication on CC2 (flipped plug).
    Cc2,
}

/// Local termination applied to both CC lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// Ra pull-down (powered cable emulation).
    Ra = 0,
    /// Rp pull-up, presented by a source.
    Rp = 1,
    /// Rd pull-down, presented by a sink.
    Rd = 2,
    /// No termination.
    Open = 3,
}

/// Classification of the voltage seen on one CC line.
///
/// When pulling up (source), the line is `Open`, `Ra` or `Rd`.
/// When pulling down (sink), the line is `Open`, or one of the Rp current advertisements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcVoltageStatus {
    /// Nothing attached.
    Open = 0,
    /// Ra termination (cable or accessory).
    Ra = 1,
    /// Rd termination (sink).
    Rd = 2,
    /// Rp advertising default USB power.
    SnkDefault = 5,
    /// Rp advertising 1.5 A.
    Snk1A5 = 6,
    /// Rp advertising 3.0 A.
    Snk3A0 = 7,
}

impl CcVoltageStatus {
    /// Decode a raw status code; unknown codes read as `Open`.
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => Self::Ra,
            2 => Self::Rd,
            5 => Self::SnkDefault,
            6 => Self::Snk1A5,
            7 => Self::Snk3A0,
            _ => Self::Open,
        }
    }

    /// A source's Rp is visible on the line.
    pub fn is_rp(self) -> bool {
        matches!(self, Self::SnkDefault | Self::Snk1A5 | Self::Snk3A0)
    }

    /// A sink's Rd is visible on the line.
    pub fn is_rd(self) -> bool {
        self == Self::Rd
    }

    /// Ra is visible on the line.
    pub fn is_ra(self) -> bool {
        self == Self::Ra
    }

    /// The current that the Rp advertisement allows, in mA.
    pub fn rp_current_ma(self) -> u32 {
        match self {
            Self::Snk3A0 => 3000,
            Self::Snk1A5 => 1500,
            Self::SnkDefault => 500,
            _ => 0,
        }
    }
}

/// The kind of frame to transmit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransmitType {
    /// Message to the port partner.
    Sop = 0,
    /// Message to the near cable plug.
    SopPrime = 1,
    /// Message to the far cable plug.
    SopPrimePrime = 2,
    /// Debug message to the near cable plug.
    DebugPrime = 3,
    /// Debug message to the far cable plug.
    DebugPrimePrime = 4,
    /// Hard reset signaling.
    HardReset = 5,
    /// Cable reset signaling.
    CableReset = 6,
    /// BIST carrier mode 2.
    BistMode2 = 7,
}

/// Result of a transmission, as reported by the TCPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Sent, and acknowledged if the TCPC handles GoodCRC.
    Success = 0,
    /// Discarded, because a message was received meanwhile.
    Discarded = 1,
    /// No GoodCRC, or the line was busy.
    Failed = 2,
}

/// Events decoded from one TCPC alert.
///
/// Consumers handle them in field order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AlertEvents {
    /// CC line status changed.
    pub cc_changed: bool,
    /// VBUS presence changed to the given level.
    pub vbus: Option<bool>,
    /// The TCPC went through a reset and needs to be initialized again.
    pub tcpc_reset: bool,
    /// A message is waiting in the receive buffer.
    pub rx_available: bool,
    /// Hard reset signaling was received.
    pub hard_reset_received: bool,
    /// A transmission completed.
    pub tx_complete: Option<TxStatus>,
}

impl AlertEvents {
    /// No event is pending.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Accumulate the events of a later alert.
    pub fn merge(&mut self, later: AlertEvents) {
        self.cc_changed |= later.cc_changed;
        self.vbus = later.vbus.or(self.vbus);
        self.tcpc_reset |= later.tcpc_reset;
        self.rx_available |= later.rx_available;
        self.hard_reset_received |= later.hard_reset_received;
        self.tx_complete = later.tx_complete.or(self.tx_complete);
    }
}

/// Configuration of a USB/DisplayPort signal mux behind the port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MuxState {
    /// USB 3 lanes connected.
    pub usb: bool,
    /// DisplayPort lanes connected.
    pub dp: bool,
    /// Plug is flipped.
    pub flipped: bool,
}

impl MuxState {
    /// Everything disconnected.
    pub const NONE: Self = Self {
        usb: false,
        dp: false,
        flipped: false,
    };

    /// USB only.
    pub const USB: Self = Self {
        usb: true,
        dp: false,
        flipped: false,
    };

    /// DisplayPort on all lanes.
    pub const DP: Self = Self {
        usb: false,
        dp: true,
        flipped: false,
    };

    /// Apply the orientation of the plug.
    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.flipped = polarity == Polarity::Cc2;
        self
    }
}

/// A received or transmitted frame: header plus data words.
///
/// With soft PHYs, the CRC travels as the last word.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    /// Raw message header.
    pub header: u16,
    /// Data words, in transmission order.
    pub data: Vec<u32, FRAME_WORDS>,
}

impl Frame {
    /// Build a frame from a header and words.
    pub fn new(header: u16, words: &[u32]) -> Result<Self, crate::Error> {
        let data = Vec::from_slice(words).map_err(|_| crate::Error::FrameTooLong)?;
        Ok(Self { header, data })
    }

    /// Number of bytes on the wire, without SOP and EOP.
    pub fn byte_count(&self) -> usize {
        2 + 4 * self.data.len()
    }
}
