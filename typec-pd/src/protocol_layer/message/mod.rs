//! Definitions of message content.
pub mod crc;
pub mod header;
pub mod pdo;
pub mod request;
pub mod vdm;

use header::{DataMessageType, Header, MessageType};
use heapless::Vec;
use pdo::Capabilities;
use typec_tcpm::MAX_DATA_OBJECTS;
use vdm::Vdm;

/// Quantities with mV, mA and µW as base units, stored as `u32`.
pub mod units {
    ISQ!(
        uom::si,
        u32,
        (millimeter, kilogram, second, milliampere, kelvin, mole, candela)
    );
}

mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "_50mV", "_50millivolts", "_50millivolts";
    }
}

mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "_250mW", "_250milliwatts", "_250milliwatts";
    }
}

/// Errors that can occur during message/header parsing.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// The input buffer has an invalid length.
    /// * `expected` - The expected length.
    /// * `found` - The actual length found.
    #[error("invalid input buffer length (expected {expected:?}, found {found:?})")]
    InvalidLength {
        /// The expected length.
        expected: usize,
        /// The actual length found.
        found: usize,
    },
    /// The specification revision field is not supported.
    #[error("unsupported specification revision `{0}`")]
    UnsupportedSpecificationRevision(u8),
    /// An unknown or reserved message type was encountered.
    #[error("unknown or reserved message type `{0}`")]
    InvalidMessageType(u8),
}

/// Payload of a data message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Data {
    /// Capabilities of a source.
    SourceCapabilities(Capabilities),
    /// Capabilities of a sink.
    SinkCapabilities(Capabilities),
    /// A raw request data object.
    ///
    /// Its layout depends on the referenced object, see [`request::PowerSource::from_raw`].
    Request(u32),
    /// A vendor defined message.
    VendorDefined(Vdm),
    /// Any other data message, kept as raw objects.
    Unknown(Vec<u32, MAX_DATA_OBJECTS>),
}

impl Data {
    /// Parse the data objects of a message with the given type.
    pub fn parse(message_type: DataMessageType, words: &[u32]) -> Result<Self, ParseError> {
        Ok(match message_type {
            DataMessageType::SourceCapabilities => Self::SourceCapabilities(Capabilities::from_words(words)?),
            DataMessageType::SinkCapabilities => Self::SinkCapabilities(Capabilities::from_words(words)?),
            DataMessageType::Request => match words {
                [rdo] => Self::Request(*rdo),
                _ => {
                    return Err(ParseError::InvalidLength {
                        expected: 1,
                        found: words.len(),
                    });
                }
            },
            DataMessageType::VendorDefined => Self::VendorDefined(Vdm::from_words(words)?),
            _ => Self::Unknown(Vec::from_slice(words).map_err(|_| ParseError::InvalidLength {
                expected: MAX_DATA_OBJECTS,
                found: words.len(),
            })?),
        })
    }

    /// Serialize the payload into data objects.
    pub fn to_words(&self) -> Vec<u32, MAX_DATA_OBJECTS> {
        match self {
            Self::SourceCapabilities(caps) | Self::SinkCapabilities(caps) => caps.to_words(),
            Self::Request(rdo) => Vec::from_iter([*rdo]),
            Self::VendorDefined(vdm) => vdm.to_words(),
            Self::Unknown(words) => words.clone(),
        }
    }

    /// The data message type that carries this payload.
    pub fn message_type(&self) -> DataMessageType {
        match self {
            Self::SourceCapabilities(_) => DataMessageType::SourceCapabilities,
            Self::SinkCapabilities(_) => DataMessageType::SinkCapabilities,
            Self::Request(_) => DataMessageType::Request,
            Self::VendorDefined(_) => DataMessageType::VendorDefined,
            Self::Unknown(_) => DataMessageType::Reserved(0),
        }
    }
}

/// A USB PD message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// The message header.
    pub header: Header,
    /// Optional payload for data messages.
    pub data: Option<Data>,
}

impl Message {
    /// Create a new message from a message header.
    pub fn new(header: Header) -> Self {
        Self { header, data: None }
    }

    /// Create a new message from a message header and payload data.
    pub fn new_with_data(header: Header, data: Data) -> Self {
        Self {
            header,
            data: Some(data),
        }
    }

    /// Parse a message from a raw header and its data objects, without CRC.
    pub fn from_frame(raw_header: u16, words: &[u32]) -> Result<Self, ParseError> {
        let header = Header::from_raw(raw_header)?;

        if header.num_objects() != words.len() {
            return Err(ParseError::InvalidLength {
                expected: header.num_objects(),
                found: words.len(),
            });
        }

        match header.message_type() {
            MessageType::Control(_) => Ok(Self::new(header)),
            MessageType::Data(message_type) => Ok(Self::new_with_data(header, Data::parse(message_type, words)?)),
        }
    }

    /// Serialize the data objects of the message.
    pub fn to_words(&self) -> Vec<u32, MAX_DATA_OBJECTS> {
        self.data.as_ref().map(Data::to_words).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::header::{ControlMessageType, SpecificationRevision};
    use super::*;
    use crate::counters::{Counter, CounterType};
    use crate::{DataRole, PowerRole};

    #[test]
    fn source_capabilities_from_frame() {
        let pdos = [0x2201_9064, 0x2203_c12c, 0x2206_41f4];
        let message = Message::from_frame(0x3161, &pdos).unwrap();

        assert_eq!(
            message.header.message_type(),
            MessageType::Data(DataMessageType::SourceCapabilities)
        );
        let Some(Data::SourceCapabilities(caps)) = &message.data else {
            panic!("expected source capabilities");
        };
        assert_eq!(caps.len(), 3);
        assert_eq!(message.to_words().as_slice(), &pdos);
    }

    #[test]
    fn object_count_must_match() {
        assert_eq!(
            Message::from_frame(0x3161, &[0x2201_9064]),
            Err(ParseError::InvalidLength { expected: 3, found: 1 })
        );
        assert!(Message::from_frame(0x1042, &[]).is_err());
    }

    #[test]
    fn control_message_has_no_data() {
        let template = Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R2_0);
        let header = Header::new_control(template, Counter::new(CounterType::MessageId), ControlMessageType::Accept);
        let message = Message::from_frame(header.0, &[]).unwrap();

        assert_eq!(message.data, None);
        assert!(message.to_words().is_empty());
    }
}
