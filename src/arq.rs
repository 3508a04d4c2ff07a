//! The sender-side retransmission table: one entry per in-flight fragment, shared
//!  between the send path (register / retry / failure) and the receive path (ACK
//!  arrival).
//!
//! The per-fragment lifecycle is `PENDING_SEND -> SENT -> {ACKED | RETRY -> SENT |
//!  FAILED}`: registering an entry and transmitting the frame moves it to SENT, a
//!  matching ACK removes it (terminal success), an ACK timeout bumps the retry count
//!  and re-transmits until the retry limit is exceeded (terminal failure). The table
//!  itself only holds SENT entries - the driving loop lives in the endpoint.
//!
//! All mutation goes through one mutex that is never held across an await point, so
//!  an ACK arriving concurrently with a timeout can never tear an entry: whichever
//!  path takes the lock first wins, and the other observes a missing entry. The ACK
//!  is handed to the waiting sender task through a oneshot channel, which also makes
//!  removal-exactly-once observable.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{trace, warn};

struct RetransmissionEntry {
    frame_bytes: Arc<Vec<u8>>,
    send_time: Instant,
    retry_count: u32,
    ack_tx: oneshot::Sender<()>,
}

/// Entries are keyed by the destination peer as well as `(seq_num, fragment_id)`:
///  an ACK only matches if it arrives *from* the peer the fragment was sent *to*,
///  so a misbehaving or misrouted peer cannot clear someone else's entry.
#[derive(Default)]
pub struct RetransmissionTable {
    entries: Mutex<FxHashMap<(SocketAddr, u8, u16), RetransmissionEntry>>,
}

impl RetransmissionTable {
    pub fn new() -> RetransmissionTable {
        RetransmissionTable::default()
    }

    /// Registers a fragment as in-flight to `peer`, returning the channel on which
    ///  its acknowledgement will be delivered. A stale entry under the same
    ///  `(peer, seq_num, fragment_id)` - possible only through sequence number
    ///  wrap-around with 256 messages in flight to one peer - is displaced.
    pub fn register(&self, peer: SocketAddr, seq_num: u8, fragment_id: u16, frame_bytes: Arc<Vec<u8>>) -> oneshot::Receiver<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let entry = RetransmissionEntry {
            frame_bytes,
            send_time: Instant::now(),
            retry_count: 0,
            ack_tx,
        };

        let mut entries = self.entries.lock().unwrap();
        if entries.insert((peer, seq_num, fragment_id), entry).is_some() {
            warn!("displacing stale in-flight entry for seq={} fragment={} to {:?} - sequence number wrap-around with too many messages in flight", seq_num, fragment_id, peer);
        }
        ack_rx
    }

    /// Called by the receive path for every incoming ACK frame, with the address the
    ///  ACK arrived from. Returns whether the ACK matched an in-flight entry to that
    ///  peer; the entry is removed and the waiting sender task is woken exactly once.
    pub fn on_ack(&self, peer: SocketAddr, seq_num: u8, fragment_id: u16) -> bool {
        let entry = self.entries.lock().unwrap().remove(&(peer, seq_num, fragment_id));
        match entry {
            Some(entry) => {
                trace!("ack from {:?} matched in-flight fragment {} of seq={} after {:?} and {} retries",
                       peer, fragment_id, seq_num, entry.send_time.elapsed(), entry.retry_count);
                // the receiver is only dropped if the sender task was cancelled
                entry.ack_tx.send(()).ok();
                true
            }
            None => false,
        }
    }

    /// Transitions an entry through RETRY: bumps its retry count, resets its send
    ///  time and hands back the frame bytes for retransmission. `None` means the
    ///  entry is gone - acknowledged or displaced in the meantime.
    pub fn record_retry(&self, peer: SocketAddr, seq_num: u8, fragment_id: u16) -> Option<(Arc<Vec<u8>>, u32)> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&(peer, seq_num, fragment_id))?;
        entry.retry_count += 1;
        entry.send_time = Instant::now();
        Some((entry.frame_bytes.clone(), entry.retry_count))
    }

    /// Removes an entry without acknowledging it - terminal failure or sender task
    ///  teardown. Idempotent.
    pub fn remove(&self, peer: SocketAddr, seq_num: u8, fragment_id: u16) {
        self.entries.lock().unwrap().remove(&(peer, seq_num, fragment_id));
    }

    pub fn num_in_flight(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
