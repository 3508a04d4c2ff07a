//! EndPoint is where all other parts of the protocol come together: it listens on a
//!  UdpSocket, feeding incoming DATA frames into reassembly (with an ACK for every
//!  accepted frame) and incoming ACK frames into the retransmission table, and it has
//!  an API for application code to send messages with per-fragment delivery
//!  guarantees.
//!
//! The send and receive paths are independent concurrent tasks. They share exactly
//!  one structure - the retransmission table; the reassembly buffers are owned by the
//!  receive loop alone. Dropping the endpoint (and aborting the task running
//!  `recv_loop`) abandons in-flight retransmission entries and partial reassembly
//!  state - everything is in-memory and session-scoped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::arq::RetransmissionTable;
use crate::config::ArqConfig;
use crate::fragment::{fragment, FragmentDisposition, FragmentError, ReassemblyBuffers};
use crate::frame::{Frame, FrameKind, FRAME_OVERHEAD};
use crate::message_dispatcher::MessageDispatcher;
use crate::send_pipeline::SendPipeline;

/// What the sending application observes: total success, or the first terminal
///  failure with its fragment-level diagnostics. Fragment-level detail short of a
///  terminal failure stays internal.
#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    MessageTooLarge(#[from] FragmentError),
    #[error("message of {message_len} bytes exceeds the configured maximum of {max_message_size}")]
    ExceedsMessageSizeLimit { message_len: usize, max_message_size: u32 },
    #[error("fragment {fragment_id} of seq={seq_num} still unacknowledged after {retries} retries - giving up")]
    RetryExhausted { seq_num: u8, fragment_id: u16, retries: u32 },
    #[error("transport error")]
    Transport(#[from] anyhow::Error),
}

pub struct EndPoint {
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    retransmission_table: Arc<RetransmissionTable>,
    message_dispatcher: Arc<dyn MessageDispatcher>,
    config: Arc<ArqConfig>,
    next_seq_num: AtomicU8,
}

impl EndPoint {
    pub async fn new(
        message_dispatcher: Arc<dyn MessageDispatcher>,
        config: Arc<ArqConfig>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);

        Ok(EndPoint {
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()))),
            receive_socket,
            retransmission_table: Arc::new(RetransmissionTable::new()),
            message_dispatcher,
            config,
            next_seq_num: AtomicU8::new(0),
        })
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.send_pipeline.local_addr()
    }

    fn next_seq_num(&self) -> u8 {
        // wraps modulo 256 by construction
        self.next_seq_num.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one message reliably: fragments it, transmits all fragments
    ///  concurrently and returns once every fragment is acknowledged. The first
    ///  fragment to exhaust its retries fails the whole message; the remaining
    ///  fragment senders are aborted and their table entries cleaned up.
    pub async fn send_message(&self, to: SocketAddr, message: &[u8]) -> Result<(), SendError> {
        if message.len() > self.config.max_message_size as usize {
            return Err(SendError::ExceedsMessageSizeLimit {
                message_len: message.len(),
                max_message_size: self.config.max_message_size,
            });
        }

        let fragments = fragment(message, self.config.fragment_size)?;
        let seq_num = self.next_seq_num();
        debug!("sending message of {} bytes to {:?} as {} fragment(s) with seq={}",
               message.len(), to, fragments.len(), seq_num);

        let mut senders = JoinSet::new();
        for frag in &fragments {
            let frame = Frame::data(seq_num, frag.fragment_id, frag.total_fragments, frag.chunk.to_vec());
            let mut buf = BytesMut::with_capacity(frame.wire_len());
            frame.ser(&mut buf);

            senders.spawn(deliver_fragment(
                self.retransmission_table.clone(),
                self.send_pipeline.clone(),
                self.config.clone(),
                to,
                seq_num,
                frag.fragment_id,
                Arc::new(buf.to_vec()),
            ));
        }

        let mut first_error = None;
        while let Some(joined) = senders.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        senders.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!("fragment sender task failed: {}", e);
                    first_error.get_or_insert(SendError::Transport(anyhow::Error::new(e)));
                }
            }
        }

        match first_error {
            None => {
                debug!("message seq={} fully acknowledged", seq_num);
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// The receive path. Run this in its own task; abort that task to tear the
    ///  endpoint down.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        let mut reassembly = ReassemblyBuffers::new(self.config.reassembly_timeout);
        let mut buf = vec![0u8; self.config.max_datagram_size];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            trace!("received {} bytes from {:?}", num_read, from);

            reassembly.prune();

            let frame = match Frame::deser(&buf[..num_read]) {
                Ok(frame) => frame,
                Err(e) => {
                    // no ACK for anything that fails decoding - the sender's
                    //  timeout takes it from here
                    debug!("dropping frame from {:?}: {}", from, e);
                    continue;
                }
            };

            match frame.kind {
                FrameKind::Ack => {
                    // matched against the ack's source so a third party cannot clear
                    //  an entry destined to someone else
                    if !self.retransmission_table.on_ack(from, frame.seq_num, frame.fragment_id) {
                        debug!("ack from {:?} for seq={} fragment={} matches no in-flight entry",
                               from, frame.seq_num, frame.fragment_id);
                    }
                }
                FrameKind::Data => {
                    handle_data_frame(
                        &self.send_pipeline,
                        self.message_dispatcher.as_ref(),
                        &mut reassembly,
                        from,
                        frame,
                    ).await
                }
            }
        }
    }
}

/// Feeds one DATA frame into reassembly, acknowledges it if accepted (duplicates
///  included) and dispatches a completed message to the application.
async fn handle_data_frame(
    send_pipeline: &SendPipeline,
    message_dispatcher: &dyn MessageDispatcher,
    reassembly: &mut ReassemblyBuffers,
    from: SocketAddr,
    frame: Frame,
) {
    let seq_num = frame.seq_num;
    let fragment_id = frame.fragment_id;

    let disposition = match reassembly.on_fragment(from, frame) {
        Ok(disposition) => disposition,
        Err(e) => {
            debug!("dropping fragment from {:?} without ack: {}", from, e);
            return;
        }
    };

    let mut ack_buf = BytesMut::with_capacity(FRAME_OVERHEAD);
    Frame::ack(seq_num, fragment_id).ser(&mut ack_buf);
    if let Err(e) = send_pipeline.do_send_packet(from, &ack_buf).await {
        // not fatal - the peer's timeout covers a lost ack
        error!("error sending ack to {:?}: {}", from, e);
    }

    match disposition {
        FragmentDisposition::Completed(message) => {
            debug!("reassembled message of {} bytes (seq={}) from {:?}", message.len(), seq_num, from);
            message_dispatcher.on_message(from, message).await;
        }
        FragmentDisposition::Buffered => {}
        FragmentDisposition::Duplicate => {
            debug!("duplicate fragment {} of seq={} from {:?} - re-acked, not re-dispatched",
                   fragment_id, seq_num, from);
        }
    }
}

/// Removes the in-flight entry when the sender task ends for *any* reason,
///  including cancellation, so an aborted send cannot leak table state.
struct InFlightGuard {
    table: Arc<RetransmissionTable>,
    peer: SocketAddr,
    seq_num: u8,
    fragment_id: u16,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove(self.peer, self.seq_num, self.fragment_id);
    }
}

/// Drives one fragment through the ARQ lifecycle: transmit, wait for the ack or the
///  timeout, retransmit up to the retry limit, and report the terminal outcome.
async fn deliver_fragment(
    table: Arc<RetransmissionTable>,
    send_pipeline: Arc<SendPipeline>,
    config: Arc<ArqConfig>,
    to: SocketAddr,
    seq_num: u8,
    fragment_id: u16,
    frame_bytes: Arc<Vec<u8>>,
) -> Result<(), SendError> {
    let mut ack_rx = table.register(to, seq_num, fragment_id, frame_bytes.clone());
    let _guard = InFlightGuard { table: table.clone(), peer: to, seq_num, fragment_id };

    send_pipeline.do_send_packet(to, &frame_bytes).await?;
    trace!("sent fragment {} of seq={} to {:?}", fragment_id, seq_num, to);

    loop {
        match time::timeout(config.ack_timeout, &mut ack_rx).await {
            Ok(Ok(())) => {
                trace!("fragment {} of seq={} acknowledged", fragment_id, seq_num);
                return Ok(());
            }
            Ok(Err(_)) => {
                // only reachable if the entry was displaced by seq wrap-around
                warn!("in-flight entry for seq={} fragment={} was displaced", seq_num, fragment_id);
                return Ok(());
            }
            Err(_elapsed) => {
                match table.record_retry(to, seq_num, fragment_id) {
                    None => {
                        warn!("in-flight entry for seq={} fragment={} vanished without an ack", seq_num, fragment_id);
                        return Ok(());
                    }
                    Some((bytes, retry_count)) => {
                        if retry_count > config.max_retries {
                            debug!("fragment {} of seq={} undeliverable after {} retries", fragment_id, seq_num, config.max_retries);
                            return Err(SendError::RetryExhausted {
                                seq_num,
                                fragment_id,
                                retries: config.max_retries,
                            });
                        }
                        debug!("ack timeout for seq={} fragment={} - retransmitting ({}/{})",
                               seq_num, fragment_id, retry_count, config.max_retries);
                        send_pipeline.do_send_packet(to, &bytes).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_pipeline::MockSendSocket;
    use mockall::predicate::eq;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc;

    fn test_config() -> Arc<ArqConfig> {
        let mut config = ArqConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        config.ack_timeout = Duration::from_secs(1);
        config.max_retries = 10;
        Arc::new(config)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4242))
    }

    fn pipeline(send_socket: MockSendSocket) -> Arc<SendPipeline> {
        Arc::new(SendPipeline::new(Arc::new(send_socket)))
    }

    #[test]
    fn test_deliver_fragment_retry_exhaustion() {
        let frame_bytes = Arc::new(vec![1, 2, 3]);

        let mut send_socket = MockSendSocket::new();
        // initial transmission plus exactly max_retries retransmissions
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![1, 2, 3]))
            .times(11)
            .returning(|_, _| Ok(()));

        let table = Arc::new(RetransmissionTable::new());

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let result = deliver_fragment(
                table.clone(), pipeline(send_socket), test_config(),
                peer(), 7, 2, frame_bytes,
            ).await;

            match result {
                Err(SendError::RetryExhausted { seq_num: 7, fragment_id: 2, retries: 10 }) => {}
                other => panic!("expected RetryExhausted, got {:?}", other),
            }
            assert_eq!(table.num_in_flight(), 0);
        });
    }

    #[test]
    fn test_deliver_fragment_acked_after_retries() {
        let frame_bytes = Arc::new(vec![9, 9]);

        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .with(eq(peer()), eq(vec![9, 9]))
            .times(3)
            .returning(|_, _| Ok(()));

        let table = Arc::new(RetransmissionTable::new());

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let task = tokio::spawn(deliver_fragment(
                table.clone(), pipeline(send_socket), test_config(),
                peer(), 1, 0, frame_bytes,
            ));

            // let two timeouts elapse, then deliver the ack
            time::sleep(Duration::from_millis(2500)).await;
            assert!(table.on_ack(peer(), 1, 0));

            assert!(task.await.unwrap().is_ok());
            assert_eq!(table.num_in_flight(), 0);
        });
    }

    #[test]
    fn test_deliver_fragment_immediate_ack() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .times(1)
            .returning(|_, _| Ok(()));

        let table = Arc::new(RetransmissionTable::new());

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let task = tokio::spawn(deliver_fragment(
                table.clone(), pipeline(send_socket), test_config(),
                peer(), 3, 1, Arc::new(vec![5]),
            ));

            tokio::task::yield_now().await;
            assert!(table.on_ack(peer(), 3, 1));

            assert!(task.await.unwrap().is_ok());
            assert_eq!(table.num_in_flight(), 0);
        });
    }

    /// an ack arriving from a different address than the fragment's destination is
    ///  ignored - the fragment keeps retransmitting until the real peer acks
    #[test]
    fn test_deliver_fragment_ignores_ack_from_wrong_peer() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .times(2)
            .returning(|_, _| Ok(()));

        let table = Arc::new(RetransmissionTable::new());

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let task = tokio::spawn(deliver_fragment(
                table.clone(), pipeline(send_socket), test_config(),
                peer(), 6, 0, Arc::new(vec![7]),
            ));

            tokio::task::yield_now().await;
            let impostor = SocketAddr::from(([127, 0, 0, 1], 4243));
            assert!(!table.on_ack(impostor, 6, 0));
            assert_eq!(table.num_in_flight(), 1);

            // one timeout elapses and the fragment is retransmitted
            time::sleep(Duration::from_millis(1500)).await;
            assert!(table.on_ack(peer(), 6, 0));

            assert!(task.await.unwrap().is_ok());
            assert_eq!(table.num_in_flight(), 0);
        });
    }

    #[test]
    fn test_deliver_fragment_transport_error_propagates() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("network unreachable")));

        let table = Arc::new(RetransmissionTable::new());

        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let result = deliver_fragment(
                table.clone(), pipeline(send_socket), test_config(),
                peer(), 0, 0, Arc::new(vec![1]),
            ).await;

            assert!(matches!(result, Err(SendError::Transport(_))));
            // the guard cleaned up the abandoned entry
            assert_eq!(table.num_in_flight(), 0);
        });
    }

    fn expect_ack(send_socket: &mut MockSendSocket, seq_num: u8, fragment_id: u16, times: usize) {
        send_socket.expect_do_send_packet()
            .withf(move |_, buf| {
                match Frame::deser(buf) {
                    Ok(frame) => frame.kind == FrameKind::Ack
                        && frame.seq_num == seq_num
                        && frame.fragment_id == fragment_id,
                    Err(_) => false,
                }
            })
            .times(times)
            .returning(|_, _| Ok(()));
    }

    /// the lost-ACK scenario from the receiver's perspective: the retransmitted
    ///  fragment is acked a second time but dispatched only once
    #[test]
    fn test_handle_data_frame_duplicate_reacked_not_redispatched() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, 5, 0, 2);
            let pipeline = pipeline(send_socket);

            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message()
                .with(eq(peer()), eq(b"hello".to_vec()))
                .times(1)
                .return_const(());

            let mut reassembly = ReassemblyBuffers::new(Duration::from_secs(30));

            let frame = Frame::data(5, 0, 1, b"hello".to_vec());
            handle_data_frame(&pipeline, &dispatcher, &mut reassembly, peer(), frame.clone()).await;
            handle_data_frame(&pipeline, &dispatcher, &mut reassembly, peer(), frame).await;
        });
    }

    /// a fragment-count mismatch is dropped without an ack and without touching
    ///  existing reassembly state
    #[test]
    fn test_handle_data_frame_count_mismatch_not_acked() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut send_socket = MockSendSocket::new();
            expect_ack(&mut send_socket, 8, 0, 1);
            let pipeline = pipeline(send_socket);

            let dispatcher = MockMessageDispatcher::new();
            let mut reassembly = ReassemblyBuffers::new(Duration::from_secs(30));

            handle_data_frame(&pipeline, &dispatcher, &mut reassembly, peer(),
                              Frame::data(8, 0, 2, b"a".to_vec())).await;
            // disagreeing total_fragments: no ack expectation registered for this one
            handle_data_frame(&pipeline, &dispatcher, &mut reassembly, peer(),
                              Frame::data(8, 1, 3, b"b".to_vec())).await;
        });
    }

    struct ChannelDispatcher {
        messages: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    }

    #[async_trait::async_trait]
    impl MessageDispatcher for ChannelDispatcher {
        async fn on_message(&self, sender: SocketAddr, message: Vec<u8>) {
            self.messages.send((sender, message)).ok();
        }
    }

    async fn spawn_endpoint(config: Arc<ArqConfig>) -> (Arc<EndPoint>, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let end_point = Arc::new(
            EndPoint::new(Arc::new(ChannelDispatcher { messages: tx }), config).await.unwrap()
        );
        let recv_task = {
            let end_point = end_point.clone();
            tokio::spawn(async move { end_point.recv_loop().await })
        };
        (end_point, rx, recv_task)
    }

    /// end-to-end over real loopback sockets: 300 bytes at fragment size 128 arrive as three
    ///  fragments and reassemble byte-identically on the peer
    #[tokio::test]
    async fn test_end_to_end_multi_fragment_message() {
        let (client, _client_rx, client_task) = spawn_endpoint(test_config()).await;
        let (server, mut server_rx, server_task) = spawn_endpoint(test_config()).await;

        let message: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        assert_eq!(fragment(&message, 128).unwrap().len(), 3);

        client.send_message(server.self_addr(), &message).await.unwrap();
        assert_eq!(client.num_in_flight(), 0);

        let (sender, received) = server_rx.recv().await.unwrap();
        assert_eq!(sender, client.self_addr());
        assert_eq!(received, message);

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn test_end_to_end_empty_message() {
        let (client, _client_rx, client_task) = spawn_endpoint(test_config()).await;
        let (server, mut server_rx, server_task) = spawn_endpoint(test_config()).await;

        client.send_message(server.self_addr(), &[]).await.unwrap();

        let (_, received) = server_rx.recv().await.unwrap();
        assert!(received.is_empty());

        client_task.abort();
        server_task.abort();
    }

    #[tokio::test]
    async fn test_send_message_too_large() {
        let (client, _rx, client_task) = spawn_endpoint(test_config()).await;

        let oversized = vec![0u8; 1024 * 1024 + 1];
        let result = client.send_message(peer(), &oversized).await;
        assert!(matches!(result, Err(SendError::ExceedsMessageSizeLimit { .. })));

        client_task.abort();
    }

    impl EndPoint {
        fn num_in_flight(&self) -> usize {
            self.retransmission_table.num_in_flight()
        }
    }
}
