//! A reliable message transport layered over unreliable, unordered, loss- and
//!  corruption-prone UDP. The protocol detects bit-level corruption with a per-frame
//!  CRC-16, transparently heals single-bit errors with a Hamming(7,4) forward error
//!  correction code, splits oversized messages into bounded-size fragments, and
//!  guarantees eventual delivery of every fragment through per-fragment
//!  acknowledgement and timeout-driven retransmission (ARQ).
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data
//!   as opposed to streams of bytes)
//! * Every fragment is individually acknowledged; a fragment that is not acknowledged
//!   within a fixed timeout is retransmitted up to a configured retry limit, after
//!   which the whole message is reported as undeliverable
//! * Single-bit corruption inside a fragment's payload is corrected on the receiver
//!   without a retransmission round trip; anything beyond that is dropped and healed
//!   by the sender's timeout
//! * Fragments may arrive out of order and duplicated - reassembly buffers them per
//!   message and delivers each completed message exactly once
//! * Send and receive duties run as independent concurrent tasks per endpoint,
//!   symmetric on both peers; the retransmission table is the only structure they
//!   share
//! * Explicitly *not* provided: congestion / flow control, cross-message ordering,
//!   multi-connection multiplexing, encryption --> different trade-offs
//!
//! ## Wire format
//!
//! One frame per UDP datagram - all numbers in network byte order (BE):
//! ```ascii
//! 0:  frame kind (u8):
//!      * 0 DATA - carries one fragment of an application message
//!      * 1 ACK  - acknowledges one (seq_num, fragment_id) pair
//! 1:  seq_num (u8): message sequence number, assigned per message and shared by all
//!      of its fragments; wraps around modulo 256
//! 2:  fragment_id (u16): position of this fragment within its message
//! 4:  total_fragments (u16): number of fragments composing the message
//!      (0 for ACK frames)
//! 6:  payload: Hamming(7,4)-encoded fragment data, one codeword byte per nibble,
//!      i.e. exactly 2 * original_len bytes
//! *:  original_len (u16): length of the raw fragment data before encoding; required
//!      because the encoding is block-padded and not self-delimiting
//! *:  crc16 (u16): CRC-16 (polynomial 0x8005, initial register 0) over all
//!      preceding bytes of the frame
//! ```
//!
//! ACK frames travel through the same codec and are therefore protected by the same
//!  CRC. ACKs are not themselves acknowledged - a lost ACK is absorbed by the
//!  sender's retransmission and the receiver's duplicate suppression.
//!
//! ## Receive pipeline
//!
//! On receipt, the payload is Hamming-decoded *first*, correcting single-bit errors
//!  per 7-bit block, and the CRC is then verified over the corrected canonical
//!  encoding. This order makes single-bit errors invisible to the checksum, which in
//!  turn only has to catch what the code could not correct. A frame failing any
//!  check is dropped without an ACK, leaving recovery to the sender's timeout.
//!
//! ## Sequence number wrap-around
//!
//! `seq_num` is 8 bits and wraps, so it is not globally unique over a long session.
//!  ACKs are matched on the full `(peer, seq_num, fragment_id)` triple, and the
//!  receiver's duplicate-suppression markers record the delivered message's fragment
//!  count and expire a fixed period after delivery, so a reused sequence number with
//!  a different fragment count starts a new message. What remains: a sender that
//!  keeps 256 messages in flight to one peer concurrently aliases its own
//!  retransmission entries, and a new message that reuses a live marker's key with
//!  the *same* fragment count within the reassembly timeout is absorbed as a
//!  duplicate. Both are documented limitations of the 1-byte sequence number, not
//!  something this implementation papers over.

pub mod arq;
pub mod config;
pub mod crc;
pub mod end_point;
pub mod fragment;
pub mod frame;
pub mod hamming;
pub mod message_dispatcher;
pub mod send_pipeline;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
