//! The CRC that protects every PD frame.
//!
//! CRC-32 with polynomial 0x04C11DB7, reflected, initial value and final XOR 0xFFFFFFFF,
//! computed over the little-endian header and data object bytes.
use byteorder::{ByteOrder, LittleEndian};
use crc::{CRC_32_ISO_HDLC, Crc};
use typec_tcpm::MAX_DATA_OBJECTS;

const PD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute the CRC of a frame.
pub fn frame_crc(header: u16, data: &[u32]) -> u32 {
    let mut buffer = [0u8; 2 + 4 * MAX_DATA_OBJECTS];
    LittleEndian::write_u16(&mut buffer, header);

    let count = data.len().min(MAX_DATA_OBJECTS);
    LittleEndian::write_u32_into(&data[..count], &mut buffer[2..2 + 4 * count]);

    PD_CRC.checksum(&buffer[..2 + 4 * count])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(PD_CRC.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn good_crc_frame() {
        assert_eq!(frame_crc(0x0441, &[]), 0xAFD6_A8A2);
    }

    #[test]
    fn source_capabilities_frame() {
        let pdos = [0x2201_9064, 0x2203_c12c, 0x2206_41f4];
        assert_eq!(frame_crc(0x3161, &pdos), 0xA940_2983);
    }
}
