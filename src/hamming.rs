//! Hamming(7,4) forward error correction with an extension parity bit (SEC-DED).
//!
//! Each nibble of raw data becomes one codeword byte: the standard (7,4) codeword in
//!  the low 7 bits (parity bits at positions 1, 2 and 4, data bits at positions 3, 5,
//!  6 and 7, position 1 being the MSB of the 7-bit word) plus an overall even-parity
//!  bit in the MSB. A single flipped bit is located by the syndrome and corrected; a
//!  double flip inside the 7-bit word leaves overall parity intact while producing a
//!  nonzero syndrome, which is reported as [`DecodeOutcome::Uncorrectable`].
//!
//! Coverage note: three or more flips within one block are outside the code's design
//!  distance and may decode as `Clean` or as a wrong `Corrected` value. The frame
//!  codec's CRC-16 is the authority for those cases, which is why block decoding
//!  never aborts - it reports suspect blocks and lets the checksum make the final
//!  call.

use bytes::{BufMut, BytesMut};

/// The result of decoding a single codeword block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// parity checks all passed, the block arrived unmodified
    Clean,
    /// exactly one bit was flipped and has been corrected; carries the 1-based
    ///  codeword position of the flipped bit, with 0 denoting the extension
    ///  parity bit itself
    Corrected(u8),
    /// the syndrome is inconsistent with any single-bit error - a likely double
    ///  flip; the returned data bits must not be trusted beyond the frame CRC
    Uncorrectable,
}

/// Number of encoded bytes for a raw buffer: one codeword byte per nibble.
pub fn encoded_len(raw_len: usize) -> usize {
    raw_len * 2
}

/// Encodes the low 4 bits of `nibble` into a codeword byte.
pub fn encode_nibble(nibble: u8) -> u8 {
    debug_assert!(nibble < 16);

    let d1 = (nibble >> 3) & 1;
    let d2 = (nibble >> 2) & 1;
    let d3 = (nibble >> 1) & 1;
    let d4 = nibble & 1;

    let p1 = d1 ^ d2 ^ d4;
    let p2 = d1 ^ d3 ^ d4;
    let p3 = d2 ^ d3 ^ d4;

    // codeword positions 1..=7 stored as bits 6..=0
    let word = (p1 << 6) | (p2 << 5) | (d1 << 4) | (p3 << 3) | (d2 << 2) | (d3 << 1) | d4;
    let overall = (word.count_ones() as u8) & 1;
    (overall << 7) | word
}

/// Decodes one codeword block, correcting a single-bit error if present. The data
///  nibble is returned even for uncorrectable blocks (best effort, see module docs).
pub fn decode_block(block: u8) -> (u8, DecodeOutcome) {
    let word = block & 0x7f;

    // 1-based codeword position -> bit value
    let bit = |w: u8, pos: u8| (w >> (7 - pos)) & 1;

    let s1 = bit(word, 1) ^ bit(word, 3) ^ bit(word, 5) ^ bit(word, 7);
    let s2 = bit(word, 2) ^ bit(word, 3) ^ bit(word, 6) ^ bit(word, 7);
    let s3 = bit(word, 4) ^ bit(word, 5) ^ bit(word, 6) ^ bit(word, 7);
    let syndrome = (s3 << 2) | (s2 << 1) | s1;

    let overall_parity_ok = block.count_ones() & 1 == 0;

    let extract = |w: u8| (bit(w, 3) << 3) | (bit(w, 5) << 2) | (bit(w, 6) << 1) | bit(w, 7);

    match (syndrome, overall_parity_ok) {
        (0, true) => (extract(word), DecodeOutcome::Clean),
        // the extension parity bit itself was flipped, the data bits are intact
        (0, false) => (extract(word), DecodeOutcome::Corrected(0)),
        (pos, false) => {
            let fixed = word ^ (1 << (7 - pos));
            (extract(fixed), DecodeOutcome::Corrected(pos))
        }
        (_, true) => (extract(word), DecodeOutcome::Uncorrectable),
    }
}

/// Encodes a raw byte buffer, high nibble before low nibble, appending the codeword
///  bytes to `out`.
pub fn encode_buffer(raw: &[u8], out: &mut BytesMut) {
    for &byte in raw {
        out.put_u8(encode_nibble(byte >> 4));
        out.put_u8(encode_nibble(byte & 0x0f));
    }
}

/// Aggregate result of decoding an encoded buffer.
pub struct BufferDecode {
    /// the recovered raw bytes
    pub data: Vec<u8>,
    /// the corrected canonical encoding - equal to the received bytes for clean
    ///  blocks, re-encoded for corrected ones, and left as received for
    ///  uncorrectable ones. The frame codec verifies its CRC over this.
    pub canonical: Vec<u8>,
    pub corrected_blocks: usize,
    pub uncorrectable_blocks: usize,
}

/// Decodes a buffer of codeword blocks back into raw bytes. The buffer length must
///  be even (two blocks per raw byte) - the frame codec establishes that before
///  calling in here.
pub fn decode_buffer(encoded: &[u8]) -> BufferDecode {
    debug_assert!(encoded.len() % 2 == 0);

    let mut data = Vec::with_capacity(encoded.len() / 2);
    let mut canonical = Vec::with_capacity(encoded.len());
    let mut corrected_blocks = 0;
    let mut uncorrectable_blocks = 0;

    for pair in encoded.chunks_exact(2) {
        let mut byte = 0u8;
        for &block in pair {
            let (nibble, outcome) = decode_block(block);
            byte = (byte << 4) | nibble;
            match outcome {
                DecodeOutcome::Clean => canonical.push(block),
                DecodeOutcome::Corrected(_) => {
                    corrected_blocks += 1;
                    canonical.push(encode_nibble(nibble));
                }
                DecodeOutcome::Uncorrectable => {
                    uncorrectable_blocks += 1;
                    canonical.push(block);
                }
            }
        }
        data.push(byte);
    }

    BufferDecode { data, canonical, corrected_blocks, uncorrectable_blocks }
}
