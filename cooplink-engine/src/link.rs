//! Frame I/O for one established connection.
//!
//! A [`Link`] owns two tasks: a reader that decodes frames into
//! [`Message`]s, and a writer that drains two outbound queues. Control
//! frames (handshake, heartbeats, decisions, cancels) go through a lane the
//! writer always serves first and that never blocks the caller; file data
//! goes through a small bounded lane that gives senders backpressure.
//!
//! The reader answers `Ping` itself and records when the peer was last
//! heard, so liveness does not depend on how busy the session is.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use cooplink_core::protocol::{ErrorPayload, Message, try_decode_frame};
use cooplink_core::transport::{ReadHalf, WriteHalf};

const READ_BUF_LEN: usize = 64 * 1024;
const INBOUND_QUEUE: usize = 32;
const CONTROL_QUEUE: usize = 256;
const DATA_QUEUE: usize = 32;
/// A single frame write that makes no progress for this long ends the link.
const WRITE_STALL: Duration = Duration::from_secs(60);

/// Cloneable sender for outgoing frames.
#[derive(Clone)]
pub(crate) struct Outbound {
    control: mpsc::Sender<BytesMut>,
    data: mpsc::Sender<BytesMut>,
}

impl Outbound {
    /// Encodes and queues `msg` on the control lane without waiting.
    ///
    /// Fails when the link is gone or the peer has stopped draining control
    /// frames altogether.
    pub(crate) fn send(&self, msg: &Message) -> anyhow::Result<()> {
        self.control.try_send(msg.encode()?).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("control queue full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("connection closed"),
        })
    }

    /// Queues an already encoded file data frame, waiting for room.
    pub(crate) async fn send_data(&self, frame: BytesMut) -> anyhow::Result<()> {
        self.data
            .send(frame)
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

pub(crate) struct Link {
    pub(crate) peer: SocketAddr,
    /// Closed when the remote end goes away or sends garbage. Heartbeat
    /// frames are handled by the reader and never show up here.
    pub(crate) inbound: mpsc::Receiver<Message>,
    pub(crate) outbound: Outbound,
    /// When the last `Ping` or `Pong` arrived.
    pub(crate) heard: watch::Receiver<Instant>,
}

/// Spawns the reader and writer tasks for a split connection.
///
/// `pending` holds bytes already read past the first frame (handshake).
pub(crate) fn spawn_link<R: ReadHalf, W: WriteHalf>(
    reader: R,
    writer: W,
    pending: BytesMut,
    peer: SocketAddr,
) -> Link {
    let (in_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE);
    let (heard_tx, heard) = watch::channel(Instant::now());

    let reader_side = ReaderSide {
        inbound: in_tx,
        control: control_tx.clone(),
        heard: heard_tx,
        peer,
    };
    tokio::spawn(read_loop(reader, pending, reader_side));
    tokio::spawn(write_loop(writer, control_rx, data_rx, peer));

    Link {
        peer,
        inbound,
        outbound: Outbound {
            control: control_tx,
            data: data_tx,
        },
        heard,
    }
}

struct ReaderSide {
    inbound: mpsc::Sender<Message>,
    control: mpsc::Sender<BytesMut>,
    heard: watch::Sender<Instant>,
    peer: SocketAddr,
}

impl ReaderSide {
    /// Handles one decoded message. Returns `false` once the session side
    /// has gone away.
    async fn deliver(&self, msg: Message) -> bool {
        match msg {
            Message::Ping => {
                self.heard.send_replace(Instant::now());
                if let Ok(pong) = Message::Pong.encode() {
                    let _ = self.control.try_send(pong);
                }
                true
            }
            Message::Pong => {
                self.heard.send_replace(Instant::now());
                true
            }
            msg => self.inbound.send(msg).await.is_ok(),
        }
    }

    /// Tells the peer why the connection is about to drop.
    fn report_violation(&self, error: &anyhow::Error) {
        let msg = Message::Error(ErrorPayload {
            code: PROTOCOL_VIOLATION.into(),
            message: format!("{error:#}"),
        });
        if let Ok(frame) = msg.encode() {
            let _ = self.control.try_send(frame);
        }
    }
}

/// Error code sent to a peer whose bytes could not be decoded.
pub(crate) const PROTOCOL_VIOLATION: &str = "protocol_violation";

async fn read_loop<R: ReadHalf>(mut reader: R, mut buf: BytesMut, side: ReaderSide) {
    let mut chunk = vec![0u8; READ_BUF_LEN];
    loop {
        loop {
            match try_decode_frame(&mut buf).and_then(|f| f.map(Message::decode).transpose()) {
                Ok(Some(msg)) => {
                    if !side.deliver(msg).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %side.peer, error = %e, "Protocol violation, dropping connection");
                    side.report_violation(&e);
                    return;
                }
            }
        }

        tokio::select! {
            () = side.inbound.closed() => return,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(peer = %side.peer, "Connection closed by peer");
                    return;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(peer = %side.peer, error = %e, "Read failed");
                    return;
                }
            }
        }
    }
}

/// Writes control frames ahead of data frames. Stops once the control lane
/// closes, which happens when the session and the reader have both let go
/// of the link.
async fn write_loop<W: WriteHalf>(
    mut writer: W,
    mut control: mpsc::Receiver<BytesMut>,
    mut data: mpsc::Receiver<BytesMut>,
    peer: SocketAddr,
) {
    let mut data_open = true;
    loop {
        let frame = tokio::select! {
            biased;
            frame = control.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            frame = data.recv(), if data_open => match frame {
                Some(frame) => frame,
                None => {
                    data_open = false;
                    continue;
                }
            },
        };
        match tokio::time::timeout(WRITE_STALL, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Write failed");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, "Peer stopped reading, dropping connection");
                return;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer, error = %e, "Shutdown failed");
    }
}

/// Reads exactly one message from a fresh connection within `limit`.
///
/// Returns the message and any bytes read beyond it.
pub(crate) async fn read_first_message<R: ReadHalf>(
    reader: &mut R,
    limit: Duration,
) -> anyhow::Result<(Message, BytesMut)> {
    let mut buf = BytesMut::new();
    let mut chunk = vec![0u8; READ_BUF_LEN];

    tokio::time::timeout(limit, async move {
        loop {
            if let Some(frame) = try_decode_frame(&mut buf)? {
                return Ok((Message::decode(frame)?, buf));
            }
            let n = reader.read(&mut chunk).await.context("handshake read failed")?;
            if n == 0 {
                bail!("connection closed during handshake");
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .map_err(|_| anyhow!("handshake timed out after {limit:?}"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{TcpConnector, TcpListenerFactory};
    use cooplink_core::protocol::{ConnectCancelPayload, FileChunk};
    use cooplink_core::error::ErrorCode;
    use cooplink_core::transport::{Connection, Connector, Listener, ListenerFactory};

    async fn connected_pair() -> (Link, Link) {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        let (client, server) = (client.unwrap(), server.unwrap());
        let (cp, sp) = (client.peer(), server.peer());
        let (cr, cw) = client.into_split().await.unwrap();
        let (sr, sw) = server.into_split().await.unwrap();
        (
            spawn_link(cr, cw, BytesMut::new(), cp),
            spawn_link(sr, sw, BytesMut::new(), sp),
        )
    }

    /// A link on one end, raw split halves on the other.
    async fn link_and_raw() -> (Link, impl ReadHalf, impl WriteHalf) {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        let (cr, cw) = client.unwrap().into_split().await.unwrap();
        let server = server.unwrap();
        let peer = server.peer();
        let (sr, sw) = server.into_split().await.unwrap();
        (spawn_link(sr, sw, BytesMut::new(), peer), cr, cw)
    }

    async fn read_message<R: ReadHalf>(reader: &mut R, buf: &mut BytesMut) -> Message {
        let mut chunk = vec![0u8; READ_BUF_LEN];
        loop {
            if let Some(frame) = try_decode_frame(buf).unwrap() {
                return Message::decode(frame).unwrap();
            }
            let n = reader.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn cancel_frame() -> Message {
        Message::ConnectCancel(ConnectCancelPayload {
            reason: ErrorCode::Canceled,
        })
    }

    #[tokio::test]
    async fn given_linked_pair_when_messages_sent_then_received_in_order() {
        let (a, mut b) = connected_pair().await;
        a.outbound.send(&cancel_frame()).unwrap();
        a.outbound.send(&Message::Disconnect).unwrap();
        assert_eq!(b.inbound.recv().await, Some(cancel_frame()));
        assert_eq!(b.inbound.recv().await, Some(Message::Disconnect));
    }

    #[tokio::test]
    async fn given_link_dropped_when_peer_reads_then_inbound_closes() {
        let (a, mut b) = connected_pair().await;
        a.outbound.send(&Message::Disconnect).unwrap();
        drop(a);
        assert_eq!(b.inbound.recv().await, Some(Message::Disconnect));
        assert_eq!(b.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn given_burst_larger_than_queue_when_session_idle_then_reader_waits_and_nothing_lost() {
        let (mut link, _cr, mut cw) = link_and_raw().await;
        let burst = INBOUND_QUEUE * 4;
        let mut bytes = BytesMut::new();
        for _ in 0..burst {
            bytes.extend_from_slice(&cancel_frame().encode().unwrap());
        }
        cw.write_all(&bytes).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(link.inbound.len() <= INBOUND_QUEUE);

        for _ in 0..burst {
            assert_eq!(link.inbound.recv().await, Some(cancel_frame()));
        }
    }

    #[tokio::test]
    async fn given_ping_when_received_then_answered_by_link_and_not_delivered() {
        let (mut link, mut cr, mut cw) = link_and_raw().await;
        let before = *link.heard.borrow();

        let mut bytes = Message::Ping.encode().unwrap();
        bytes.extend_from_slice(&Message::Disconnect.encode().unwrap());
        cw.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(read_message(&mut cr, &mut buf).await, Message::Pong);
        assert_eq!(link.inbound.recv().await, Some(Message::Disconnect));
        assert!(link.heard.has_changed().unwrap());
        assert!(*link.heard.borrow() >= before);
    }

    #[tokio::test]
    async fn given_pong_when_received_then_heard_updates_and_nothing_delivered() {
        let (mut link, _cr, mut cw) = link_and_raw().await;
        cw.write_all(&Message::Pong.encode().unwrap()).await.unwrap();
        link.heard.changed().await.unwrap();
        cw.write_all(&Message::Disconnect.encode().unwrap()).await.unwrap();
        assert_eq!(link.inbound.recv().await, Some(Message::Disconnect));
    }

    #[tokio::test]
    async fn given_data_queued_when_control_sent_then_control_written_first() {
        let (link, mut cr, _cw) = link_and_raw().await;
        let chunk = |i: u32| {
            Message::FileChunk(FileChunk {
                transfer_id: 1,
                file_index: i,
                data: bytes::Bytes::from(vec![7u8; 16]),
            })
            .encode()
            .unwrap()
        };
        // Fill the data lane before the writer gets a chance to run.
        for i in 0..4 {
            link.outbound.data.try_send(chunk(i)).unwrap();
        }
        link.outbound.send(&Message::Disconnect).unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(read_message(&mut cr, &mut buf).await, Message::Disconnect);
        assert!(matches!(read_message(&mut cr, &mut buf).await, Message::FileChunk(_)));
    }

    #[tokio::test]
    async fn given_garbage_bytes_when_read_then_error_sent_and_inbound_closes() {
        let (mut link, mut cr, mut cw) = link_and_raw().await;

        cw.write_all(b"NOT-A-COOPLINK-FRAME").await.unwrap();
        assert_eq!(link.inbound.recv().await, None);
        drop(link);

        let mut buf = BytesMut::new();
        match read_message(&mut cr, &mut buf).await {
            Message::Error(err) => assert_eq!(err.code, PROTOCOL_VIOLATION),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn given_full_control_lane_when_sending_then_fails_without_waiting() {
        let (link, _cr, _cw) = link_and_raw().await;
        // The writer cannot run between these sends on a current-thread runtime.
        for _ in 0..CONTROL_QUEUE {
            link.outbound.send(&Message::Disconnect).unwrap();
        }
        let err = link.outbound.send(&Message::Disconnect).unwrap_err();
        assert!(err.to_string().contains("full"));
    }

    #[tokio::test(start_paused = true)]
    async fn given_silent_connection_when_reading_first_message_then_times_out() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        let _client = client.unwrap();
        let (mut sr, _sw) = server.unwrap().into_split().await.unwrap();

        let err = read_first_message(&mut sr, Duration::from_secs(10)).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn given_two_frames_in_one_write_when_reading_first_then_rest_is_pending() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (client, server) = tokio::join!(TcpConnector.connect(addr), listener.accept());
        let (_cr, mut cw) = client.unwrap().into_split().await.unwrap();
        let (mut sr, _sw) = server.unwrap().into_split().await.unwrap();

        let mut bytes = Message::Ping.encode().unwrap();
        bytes.extend_from_slice(&Message::Pong.encode().unwrap());
        cw.write_all(&bytes).await.unwrap();

        let (first, mut rest) = read_first_message(&mut sr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first, Message::Ping);
        let second = try_decode_frame(&mut rest).unwrap().unwrap();
        assert_eq!(Message::decode(second).unwrap(), Message::Pong);
    }
}
