//! CRC-16 integrity check over frame bytes. This is the last line of defense against
//!  corruption the Hamming layer could not correct, so it runs over everything in the
//!  frame that precedes the checksum field itself.

/// CRC-16/UMTS generator polynomial, as exposed in the protocol configuration.
pub const CRC_POLYNOMIAL: u16 = 0x8005;

const CRC_INITIAL: u16 = 0x0000;

/// Computes the checksum bit-by-bit, MSB first, without reflection or final XOR.
pub fn compute(data: &[u8]) -> u16 {
    let mut crc = CRC_INITIAL;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC_POLYNOMIAL;
            }
            else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Verifies a buffer whose last two bytes are the big-endian checksum of everything
///  before them. Buffers shorter than the checksum itself never verify.
pub fn verify(data_with_checksum: &[u8]) -> bool {
    if data_with_checksum.len() < 2 {
        return false;
    }
    let (covered, checksum_bytes) = data_with_checksum.split_at(data_with_checksum.len() - 2);
    let expected = u16::from_be_bytes([checksum_bytes[0], checksum_bytes[1]]);
    compute(covered) == expected
}
