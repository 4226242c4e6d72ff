//! The PD event log.
//!
//! A FIFO of power events that the host reads one entry at a time. Accessories that speak the
//! Google vendor protocol hand out their own entries in GET_LOG answers, which are merged into
//! the local log.
use heapless::{Deque, Vec};

/// Maximum number of payload words in an entry.
pub const MAX_PAYLOAD_WORDS: usize = 4;

/// Flag in the data of a charge event: the port is dual-role.
pub const CHARGE_FLAGS_DUAL_ROLE: u16 = 1 << 15;
/// Mask for the power role in the data of a charge event.
pub const CHARGE_FLAGS_ROLE_MASK: u16 = 0x7;

/// The power role in the data of a charge event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum ChargeRole {
    /// Nothing attached.
    Disconnected = 0,
    /// Providing power.
    Source = 1,
    /// Consuming power.
    Sink = 2,
}

/// Kinds of logged events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum EventKind {
    /// A power contract changed.
    McuCharge,
    /// A port partner attached or detached.
    McuConnect,
    McuBoardCustom,
    /// An accessory failed to verify its RW image.
    AccRwFail,
    /// The power supply could not be enabled.
    PsFault,
    /// DisplayPort mode state of an accessory.
    VideoDpMode,
    VideoCodec,
    /// The log is empty.
    NoEntry,
    Other(u8),
}

impl From<EventKind> for u8 {
    fn from(value: EventKind) -> Self {
        match value {
            EventKind::McuCharge => 0x01,
            EventKind::McuConnect => 0x02,
            EventKind::McuBoardCustom => 0x03,
            EventKind::AccRwFail => 0x20,
            EventKind::PsFault => 0x40,
            EventKind::VideoDpMode => 0x60,
            EventKind::VideoCodec => 0x61,
            EventKind::NoEntry => 0xff,
            EventKind::Other(raw) => raw,
        }
    }
}

impl From<u8> for EventKind {
    fn from(value: u8) -> Self {
        match value {
            0x01 => EventKind::McuCharge,
            0x02 => EventKind::McuConnect,
            0x03 => EventKind::McuBoardCustom,
            0x20 => EventKind::AccRwFail,
            0x40 => EventKind::PsFault,
            0x60 => EventKind::VideoDpMode,
            0x61 => EventKind::VideoCodec,
            0xff => EventKind::NoEntry,
            other => EventKind::Other(other),
        }
    }
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LogEntry {
    /// When logged, milliseconds since boot. When dequeued, milliseconds in the past.
    pub timestamp_ms: u32,
    /// The kind of event.
    pub kind: EventKind,
    /// The port that the event relates to.
    pub port: u8,
    /// Event specific data.
    pub data: u16,
    /// Event specific payload.
    pub payload: Vec<u32, MAX_PAYLOAD_WORDS>,
}

impl LogEntry {
    /// An entry without payload.
    pub fn new(kind: EventKind, port: u8, data: u16) -> Self {
        Self {
            timestamp_ms: 0,
            kind,
            port,
            data,
            payload: Vec::new(),
        }
    }

    /// The entry that signals an empty log.
    pub fn no_entry() -> Self {
        Self::new(EventKind::NoEntry, 0, 0)
    }

    /// A charge event for a new contract, or for the end of one.
    pub fn charge(port: u8, role: ChargeRole, dual_role: bool, voltage_mv: u32, current_ma: u32) -> Self {
        let mut data = role as u16;
        if dual_role {
            data |= CHARGE_FLAGS_DUAL_ROLE;
        }

        let mut entry = Self::new(EventKind::McuCharge, port, data);
        entry.payload.push((current_ma & 0xffff) | (voltage_mv << 16)).ok();
        entry.payload.push(voltage_mv * current_ma / 1000).ok();
        entry
    }

    /// Pack the entry into objects, as carried by GET_LOG answers.
    pub fn to_vdos(&self) -> Vec<u32, { MAX_PAYLOAD_WORDS + 2 }> {
        let size_port = (self.port << 5) | ((4 * self.payload.len()) as u8 & 0x1f);

        let mut vdos = Vec::new();
        vdos.push(self.timestamp_ms).ok();
        vdos.push(u32::from(u8::from(self.kind)) | (u32::from(size_port) << 8) | (u32::from(self.data) << 16))
            .ok();
        vdos.extend(self.payload.iter().copied());
        vdos
    }

    /// Unpack an entry from objects. Reports `None` if the payload is truncated.
    pub fn from_vdos(vdos: &[u32]) -> Option<Self> {
        let [timestamp_ms, info, rest @ ..] = vdos else {
            return None;
        };

        let size_port = (info >> 8) as u8;
        let payload_words = usize::from(size_port & 0x1f).div_ceil(4);
        if rest.len() < payload_words || payload_words > MAX_PAYLOAD_WORDS {
            return None;
        }

        Some(Self {
            timestamp_ms: *timestamp_ms,
            kind: EventKind::from(*info as u8),
            port: size_port >> 5,
            data: (info >> 16) as u16,
            payload: Vec::from_slice(&rest[..payload_words]).ok()?,
        })
    }
}

/// The event FIFO. When full, the oldest entries make room for new ones.
#[derive(Debug, Default)]
pub struct EventLog<const N: usize> {
    entries: Deque<LogEntry, N>,
}

impl<const N: usize> EventLog<N> {
    /// An empty log.
    pub const fn new() -> Self {
        Self { entries: Deque::new() }
    }

    /// Add an entry, stamped with the present time.
    pub fn push(&mut self, mut entry: LogEntry, now_ms: u64) {
        entry.timestamp_ms = now_ms as u32;

        if let Err(entry) = self.entries.push_back(entry) {
            trace!("Event log full, dropping the oldest entry");
            self.entries.pop_front();
            self.entries.push_back(entry).ok();
        }
    }

    /// Take the oldest entry, with its timestamp turned into milliseconds in the past.
    ///
    /// Reports a [`EventKind::NoEntry`] entry when the log is empty.
    pub fn dequeue(&mut self, now_ms: u64) -> LogEntry {
        match self.entries.pop_front() {
            Some(mut entry) => {
                entry.timestamp_ms = (now_ms as u32).wrapping_sub(entry.timestamp_ms);
                entry
            }
            None => LogEntry::no_entry(),
        }
    }

    /// Merge an entry from a GET_LOG answer of an accessory on `port`.
    ///
    /// The accessory reports its timestamp as milliseconds in the past.
    /// Reports whether an entry was added.
    pub fn push_remote(&mut self, port: u8, vdos: &[u32], now_ms: u64) -> bool {
        let Some(mut entry) = LogEntry::from_vdos(vdos) else {
            warn!("Malformed log entry from port {}", port);
            return false;
        };

        if entry.kind == EventKind::NoEntry {
            return false;
        }

        entry.port = port;
        let age_ms = u64::from(entry.timestamp_ms);
        self.push(entry, now_ms.saturating_sub(age_ms));
        true
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
