//! Splitting messages into bounded-size fragments and putting them back together.
//!
//! Fragmentation is a pure function; reassembly is stateful, keyed by the sending
//!  peer and the message's sequence number, and tolerates arbitrary arrival order
//!  and duplication. A message buffer that sees no traffic for the configured
//!  inactivity timeout is abandoned, and completed messages are remembered for the
//!  same period so a straggling duplicate is re-acknowledged without being
//!  re-dispatched. Completion markers expire a fixed period after delivery (the TTL
//!  is *not* refreshed by duplicate hits) and record the delivered message's
//!  fragment count, so a wrapped-around sequence number reusing the key with a
//!  different fragment count starts a fresh message instead of being swallowed as a
//!  duplicate.

use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::frame::Frame;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("message of {message_len} bytes at fragment size {fragment_size} needs {required} fragments, more than the frame format can number")]
    MessageTooLarge { message_len: usize, fragment_size: usize, required: usize },
}

#[derive(Debug, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub fragment_id: u16,
    pub total_fragments: u16,
    pub chunk: &'a [u8],
}

/// Splits a message into in-order chunks of at most `fragment_size` bytes. The empty
///  message yields exactly one empty fragment, so that "empty message" remains
///  distinguishable from "no message" on the wire.
pub fn fragment(message: &[u8], fragment_size: usize) -> Result<Vec<Fragment<'_>>, FragmentError> {
    assert!(fragment_size > 0);

    if message.is_empty() {
        return Ok(vec![Fragment { fragment_id: 0, total_fragments: 1, chunk: &[] }]);
    }

    let required = message.len().div_ceil(fragment_size);
    if required > u16::MAX as usize {
        return Err(FragmentError::MessageTooLarge {
            message_len: message.len(),
            fragment_size,
            required,
        });
    }

    let total_fragments = required as u16;
    Ok(message
        .chunks(fragment_size)
        .enumerate()
        .map(|(id, chunk)| Fragment {
            fragment_id: id as u16,
            total_fragments,
            chunk,
        })
        .collect())
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentDisposition {
    /// this fragment completed its message - dispatch it
    Completed(Vec<u8>),
    /// recorded, the message is still missing fragments
    Buffered,
    /// already seen (or the message was already delivered) - acknowledge again,
    ///  do not dispatch again
    Duplicate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment declares {declared} total fragments where {known} were previously seen for this message")]
    FragmentCountMismatch { known: u16, declared: u16 },
}

struct MessageBuffer {
    total_fragments: u16,
    // slot per fragment_id; None = not yet received
    chunks: Vec<Option<Vec<u8>>>,
    num_received: u16,
    last_activity: Instant,
}

impl MessageBuffer {
    fn new(total_fragments: u16) -> MessageBuffer {
        MessageBuffer {
            total_fragments,
            chunks: (0..total_fragments).map(|_| None).collect(),
            num_received: 0,
            last_activity: Instant::now(),
        }
    }
}

struct CompletedMarker {
    total_fragments: u16,
    completed_at: Instant,
}

/// All partially reassembled messages of an endpoint, plus the recently-completed
///  markers used for duplicate suppression. Owned exclusively by the receive path -
///  per-message isolation falls out of the per-key buffers.
pub struct ReassemblyBuffers {
    inactivity_timeout: Duration,
    in_progress: FxHashMap<(SocketAddr, u8), MessageBuffer>,
    completed: FxHashMap<(SocketAddr, u8), CompletedMarker>,
}

impl ReassemblyBuffers {
    pub fn new(inactivity_timeout: Duration) -> ReassemblyBuffers {
        ReassemblyBuffers {
            inactivity_timeout,
            in_progress: FxHashMap::default(),
            completed: FxHashMap::default(),
        }
    }

    /// Feeds one decoded DATA frame into reassembly. An `Err` means the frame must
    ///  be dropped *without* an acknowledgement; existing state is left untouched.
    pub fn on_fragment(&mut self, peer: SocketAddr, frame: Frame) -> Result<FragmentDisposition, ReassemblyError> {
        let key = (peer, frame.seq_num);

        if let Some(marker) = self.completed.get(&key) {
            if marker.total_fragments == frame.total_fragments {
                return Ok(FragmentDisposition::Duplicate);
            }
            // the sequence number wrapped around onto a delivered message with a
            //  different fragment count - this is a new message, not a straggler
            debug!("seq={} from {:?} reused with {} fragments where a {}-fragment message was delivered - starting fresh",
                   frame.seq_num, peer, frame.total_fragments, marker.total_fragments);
            self.completed.remove(&key);
        }

        let buffer = self
            .in_progress
            .entry(key)
            .or_insert_with(|| {
                trace!("new reassembly buffer for seq={} from {:?} ({} fragments)",
                       frame.seq_num, peer, frame.total_fragments);
                MessageBuffer::new(frame.total_fragments)
            });

        if buffer.total_fragments != frame.total_fragments {
            return Err(ReassemblyError::FragmentCountMismatch {
                known: buffer.total_fragments,
                declared: frame.total_fragments,
            });
        }

        buffer.last_activity = Instant::now();

        // fragment_id < total_fragments was established by the frame codec
        let slot = &mut buffer.chunks[frame.fragment_id as usize];
        if slot.is_some() {
            return Ok(FragmentDisposition::Duplicate);
        }
        *slot = Some(frame.payload);
        buffer.num_received += 1;

        if buffer.num_received < buffer.total_fragments {
            return Ok(FragmentDisposition::Buffered);
        }

        let buffer = self.in_progress.remove(&key).expect("buffer was just updated");
        self.completed.insert(key, CompletedMarker {
            total_fragments: buffer.total_fragments,
            completed_at: Instant::now(),
        });

        let mut message = Vec::new();
        for chunk in buffer.chunks {
            message.extend_from_slice(&chunk.expect("all fragments were counted as received"));
        }
        Ok(FragmentDisposition::Completed(message))
    }

    /// Abandons buffers that saw no traffic for the inactivity timeout, and
    ///  completion markers delivered longer than that ago.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.in_progress.retain(|(peer, seq_num), buffer| {
            let keep = now.duration_since(buffer.last_activity) < self.inactivity_timeout;
            if !keep {
                debug!("abandoning incomplete message seq={} from {:?} ({}/{} fragments received)",
                       seq_num, peer, buffer.num_received, buffer.total_fragments);
            }
            keep
        });
        let inactivity_timeout = self.inactivity_timeout;
        self.completed.retain(|_, marker| now.duration_since(marker.completed_at) < inactivity_timeout);
    }

    #[cfg(test)]
    fn num_in_progress(&self) -> usize {
        self.in_progress.len()
    }
}
