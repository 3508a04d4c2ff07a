use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::frame::FRAME_OVERHEAD;
use crate::hamming;

/// Protocol configuration for one endpoint. The defaults mirror the protocol
///  constants: 128-byte fragments, a flat 1-second ACK timeout (no backoff) and a
///  limit of 10 retries per fragment.
pub struct ArqConfig {
    /// the address the endpoint's UDP socket binds to
    pub self_addr: SocketAddr,

    /// Maximum raw bytes per fragment. The wire footprint of a fragment is
    ///  `FRAME_OVERHEAD + 2 * fragment_size` because of the Hamming expansion, and
    ///  must fit into a single datagram - `validate` enforces that against
    ///  `max_datagram_size`.
    pub fragment_size: usize,

    /// how long an unacknowledged fragment waits before it is retransmitted
    pub ack_timeout: Duration,

    /// how often a fragment is retransmitted before its message is reported as
    ///  undeliverable
    pub max_retries: u32,

    /// upper bound on a single application message
    pub max_message_size: u32,

    /// A reassembly buffer (and the duplicate-suppression marker of a delivered
    ///  message) is abandoned after this long without traffic. This is the
    ///  message-level inactivity cap, distinct from the per-fragment ack timeout.
    pub reassembly_timeout: Duration,

    /// size of the receive buffer, i.e. the largest datagram the endpoint accepts
    pub max_datagram_size: usize,
}

impl ArqConfig {
    pub fn new(self_addr: SocketAddr) -> ArqConfig {
        ArqConfig {
            self_addr,
            fragment_size: 128,
            ack_timeout: Duration::from_secs(1),
            max_retries: 10,
            max_message_size: 1024 * 1024,
            reassembly_timeout: Duration::from_secs(30),
            max_datagram_size: 1472,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_size == 0 {
            bail!("fragment size must be positive");
        }
        if self.fragment_size > u16::MAX as usize {
            bail!("fragment size {} exceeds the frame format's length field", self.fragment_size);
        }
        let max_frame_len = FRAME_OVERHEAD + hamming::encoded_len(self.fragment_size);
        if max_frame_len > self.max_datagram_size {
            bail!("a full fragment needs {} wire bytes but the datagram size is {}", max_frame_len, self.max_datagram_size);
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> ArqConfig {
        ArqConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::zero_fragment_size(|c: &mut ArqConfig| c.fragment_size = 0)]
    #[case::fragment_size_overflow(|c: &mut ArqConfig| c.fragment_size = u16::MAX as usize + 1)]
    #[case::frame_exceeds_datagram(|c: &mut ArqConfig| c.max_datagram_size = 64)]
    #[case::zero_timeout(|c: &mut ArqConfig| c.ack_timeout = Duration::ZERO)]
    fn test_invalid(#[case] break_it: fn(&mut ArqConfig)) {
        let mut config = config();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
