//! The wire frame codec: serialization and deserialization of the unit placed on the
//!  wire, composing the Hamming layer and the CRC (see the crate docs for the exact
//!  layout).
//!
//! Decode order matters: the payload is Hamming-decoded and corrected *before* the
//!  CRC is verified - over the corrected canonical encoding - so that a single
//!  flipped payload bit is healed instead of burning a retransmission round trip. A
//!  block the code cannot correct fails fast as [`FrameError::UncorrectableBlock`];
//!  everything else that does not add up fails the checksum.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use crate::crc;
use crate::hamming;

/// kind + seq_num + fragment_id + total_fragments
pub const HEADER_LEN: usize = 6;
/// original_len + crc16
pub const TRAILER_LEN: usize = 4;
/// Wire bytes added around a fragment's encoded payload.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Ack,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("payload length {payload_len} inconsistent with declared original length {original_len}")]
    LengthMismatch { original_len: u16, payload_len: usize },
    #[error("{0} uncorrectable code block(s) in payload")]
    UncorrectableBlock(usize),
    #[error("checksum mismatch: computed {computed:#06x}, frame carries {declared:#06x}")]
    Checksum { computed: u16, declared: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub seq_num: u8,
    pub fragment_id: u16,
    pub total_fragments: u16,
    /// raw fragment data - Hamming encoding happens during serialization
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(seq_num: u8, fragment_id: u16, total_fragments: u16, payload: Vec<u8>) -> Frame {
        Frame { kind: FrameKind::Data, seq_num, fragment_id, total_fragments, payload }
    }

    pub fn ack(seq_num: u8, fragment_id: u16) -> Frame {
        Frame { kind: FrameKind::Ack, seq_num, fragment_id, total_fragments: 0, payload: Vec::new() }
    }

    /// Serialized size on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + hamming::encoded_len(self.payload.len())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        let start = buf.len();
        buf.put_u8(match self.kind {
            FrameKind::Data => KIND_DATA,
            FrameKind::Ack => KIND_ACK,
        });
        buf.put_u8(self.seq_num);
        buf.put_u16(self.fragment_id);
        buf.put_u16(self.total_fragments);
        hamming::encode_buffer(&self.payload, buf);
        buf.put_u16(self.payload.len() as u16);

        let checksum = crc::compute(&buf[start..]);
        buf.put_u16(checksum);
    }

    pub fn deser(wire: &[u8]) -> Result<Frame, FrameError> {
        if wire.len() < FRAME_OVERHEAD {
            return Err(FrameError::Malformed("frame too short"));
        }

        let kind = match wire[0] {
            KIND_DATA => FrameKind::Data,
            KIND_ACK => FrameKind::Ack,
            _ => return Err(FrameError::Malformed("unknown frame kind")),
        };
        let seq_num = wire[1];
        let fragment_id = u16::from_be_bytes([wire[2], wire[3]]);
        let total_fragments = u16::from_be_bytes([wire[4], wire[5]]);

        let trailer = &wire[wire.len() - TRAILER_LEN..];
        let original_len = u16::from_be_bytes([trailer[0], trailer[1]]);
        let declared_crc = u16::from_be_bytes([trailer[2], trailer[3]]);

        let encoded_payload = &wire[HEADER_LEN..wire.len() - TRAILER_LEN];
        if encoded_payload.len() != hamming::encoded_len(original_len as usize) {
            return Err(FrameError::LengthMismatch {
                original_len,
                payload_len: encoded_payload.len(),
            });
        }

        let decoded = hamming::decode_buffer(encoded_payload);
        if decoded.uncorrectable_blocks > 0 {
            return Err(FrameError::UncorrectableBlock(decoded.uncorrectable_blocks));
        }

        // verify the checksum over the *corrected* canonical encoding, so bit flips
        //  already healed by the code do not register as corruption
        let mut covered = Vec::with_capacity(wire.len() - 2);
        covered.extend_from_slice(&wire[..HEADER_LEN]);
        covered.extend_from_slice(&decoded.canonical);
        covered.extend_from_slice(&trailer[..2]);
        let computed = crc::compute(&covered);
        if computed != declared_crc {
            return Err(FrameError::Checksum { computed, declared: declared_crc });
        }

        match kind {
            FrameKind::Data => {
                if total_fragments == 0 {
                    return Err(FrameError::Malformed("data frame with zero total_fragments"));
                }
                if fragment_id >= total_fragments {
                    return Err(FrameError::Malformed("fragment_id out of range"));
                }
            }
            FrameKind::Ack => {
                if original_len != 0 {
                    return Err(FrameError::Malformed("ack frame with payload"));
                }
                if total_fragments != 0 {
                    return Err(FrameError::Malformed("ack frame with nonzero total_fragments"));
                }
            }
        }

        Ok(Frame { kind, seq_num, fragment_id, total_fragments, payload: decoded.data })
    }
}
