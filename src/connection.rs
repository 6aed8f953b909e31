//! Per-connection state machine: owns one handshake-completed transport,
//! drives the frame codec, and exposes the `read`/`write`/`close` surface
//! a handler calls directly rather than being driven by a callback.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{FrameCodec, Outgoing};
use crate::errors::WsError;
use crate::frame::{CloseCode, Frame, OpCode, Role};

/// lifecycle state of a [`Connection`]; observable through a shared atomic
/// so a [`ConnectionHandle`] can check liveness without touching the I/O
/// halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::AwaitingHandshake => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::AwaitingHandshake,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new(initial: ConnectionState) -> Self {
        Self(AtomicU8::new(initial.to_u8()))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// numeric identity of a connection within a server's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// the registry-facing half of a [`Connection`]: an id, a clone of the
/// shared writer mutex, and a clone of the shared state atomic. Lets a
/// server broadcast to (and check the liveness of) a connection without
/// owning its read half or its handler.
///
/// Tied to `TcpStream` because the server registry (`ServerContext`) only
/// ever holds connections accepted from a `TcpListener`; a handler embedding
/// a different transport does not get entries in the broadcast registry.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    writer: Arc<Mutex<FramedWrite<WriteHalf<TcpStream>, FrameCodec>>>,
    state: Arc<SharedState>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// write a single unmasked-or-masked (per role) Binary frame; used by
    /// server-side broadcast. Returns `Err` if the handle is not Open or
    /// the write fails, either of which the registry treats as "evict this
    /// client".
    pub async fn write_binary(&self, payload: &[u8]) -> Result<(), WsError> {
        if self.state.get() != ConnectionState::Open {
            return Err(WsError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Outgoing {
                opcode: OpCode::Binary,
                fin: true,
                payload: BytesMut::from(payload),
            })
            .await
    }

    /// send a Close frame through the shared writer and mark the handle
    /// Closed. Used by `serve`/`connect` to fulfil the outstanding close
    /// handshake when a handler returns a `WsError` without having called
    /// `Connection::close` itself — the handler's `Connection` has already
    /// been consumed by that point, so this is the only remaining path to
    /// the wire. A no-op (returns `Ok`) if the handle is already Closed.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        if self.state.get() == ConnectionState::Closed {
            return Ok(());
        }
        let payload = build_close_payload(code, reason)?;
        self.state.set(ConnectionState::Closing);
        let mut writer = self.writer.lock().await;
        let result = writer
            .send(Outgoing {
                opcode: OpCode::Close,
                fin: true,
                payload,
            })
            .await;
        self.state.set(ConnectionState::Closed);
        result
    }
}

/// build a Close frame payload: 2-byte big-endian code followed by the
/// UTF-8 bytes of `reason`. Shared by `Connection::close` and
/// `ConnectionHandle::close` so both reject an over-long reason the same
/// way rather than duplicating the 125-byte control-frame bound.
fn build_close_payload(code: CloseCode, reason: &str) -> Result<BytesMut, WsError> {
    if reason.len() + 2 > 125 {
        return Err(WsError::ReasonTooLong(reason.len()));
    }
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.as_u16().to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    Ok(payload)
}

/// truncate `reason` to at most `max_bytes` bytes on a UTF-8 char
/// boundary; used to fit an arbitrary error message (which may be far
/// longer than 125 bytes) into a Close frame's reason field.
pub fn fit_close_reason(reason: &str, max_bytes: usize) -> &str {
    if reason.len() <= max_bytes {
        return reason;
    }
    let mut end = max_bytes;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// a complete inbound message delivered to the caller of [`Connection::read`]
pub struct ReadOutcome {
    pub payload: Bytes,
    pub opcode: OpCode,
    pub was_close: bool,
}

struct ContinuationState {
    opcode: OpCode,
    buffer: BytesMut,
}

/// one live WebSocket endpoint: reads and writes frames, reassembles
/// fragmented messages, and answers Ping/Close automatically.
pub struct Connection<S> {
    id: ConnectionId,
    role: Role,
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: Arc<Mutex<FramedWrite<WriteHalf<S>, FrameCodec>>>,
    state: Arc<SharedState>,
    pending_ping: bool,
    continuation: Option<ContinuationState>,
    max_message_size: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(id: ConnectionId, stream: S, role: Role, max_message_size: usize) -> Self {
        let (read_half, write_half) = split(stream);
        let reader = FramedRead::new(read_half, FrameCodec::new(role));
        let writer = FramedWrite::new(write_half, FrameCodec::new(role));
        Self {
            id,
            role,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            state: Arc::new(SharedState::new(ConnectionState::Open)),
            pending_ping: false,
            continuation: None,
            max_message_size,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    async fn send_frame(&self, opcode: OpCode, fin: bool, payload: BytesMut) -> Result<(), WsError> {
        let mut writer = self.writer.lock().await;
        writer.send(Outgoing { opcode, fin, payload }).await
    }

    /// write a single complete message as one frame (fin=true), Binary
    /// opcode, as the handler's default send path.
    pub async fn write(&self, payload: &[u8]) -> Result<(), WsError> {
        self.write_with_flags(payload, OpCode::Binary.as_u8() | 0b1000_0000)
            .await
    }

    /// write a single frame with explicit opcode/fin control, as encoded in
    /// `first_byte` (bit 7 = FIN, bits 3..0 = opcode); used when the caller
    /// wants to send Text or manage fragmentation itself.
    pub async fn write_with_flags(&self, payload: &[u8], first_byte: u8) -> Result<(), WsError> {
        if self.state() != ConnectionState::Open {
            return Err(WsError::ConnectionClosed);
        }
        let fin = first_byte & 0b1000_0000 != 0;
        let opcode = match first_byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => {
                return Err(WsError::Protocol(crate::errors::ProtocolErrorKind::ReservedOpcode(
                    other,
                )))
            }
        };
        self.send_frame(opcode, fin, BytesMut::from(payload)).await
    }

    /// send a Ping; the matching Pong (if the peer replies) is consumed
    /// silently by a subsequent `read()` rather than returned to the caller.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        self.pending_ping = true;
        self.send_frame(OpCode::Ping, true, BytesMut::from(payload)).await
    }

    pub async fn pong(&self, payload: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Pong, true, BytesMut::from(payload)).await
    }

    /// send a Close frame (2-byte big-endian code followed by UTF-8 reason
    /// bytes) and mark the connection Closing. Does not wait for the peer's
    /// matching Close; the read loop handles that transition.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        let payload = build_close_payload(code, reason)?;
        self.state.set(ConnectionState::Closing);
        self.send_frame(OpCode::Close, true, payload).await
    }

    fn mark_closed(&mut self) {
        self.state.set(ConnectionState::Closed);
    }

    /// read the next deliverable message, transparently consuming and
    /// replying to Ping/Pong/Close frames and reassembling fragments.
    /// Returns `Ok(ReadOutcome)` with `was_close = true` exactly once, on
    /// the frame that finalizes the close handshake; every call after that
    /// returns `Err(WsError::ConnectionClosed)`.
    pub async fn read(&mut self) -> Result<ReadOutcome, WsError> {
        loop {
            if self.state() == ConnectionState::Closed {
                return Err(WsError::ConnectionClosed);
            }

            let frame = match self.reader.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    if let Some(close_code) = err.close_code() {
                        let _ = self.close(close_code, &err.to_string()).await;
                    }
                    self.mark_closed();
                    return Err(err);
                }
                None => {
                    self.mark_closed();
                    return Err(WsError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "transport closed before a Close frame was received",
                    )));
                }
            };

            if let Some(outcome) = self.dispatch(frame).await? {
                return Ok(outcome);
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Option<ReadOutcome>, WsError> {
        use crate::errors::ProtocolErrorKind;

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.continuation.is_some() {
                    let err = WsError::Protocol(ProtocolErrorKind::DataFrameDuringFragment);
                    self.fail_and_close(&err).await;
                    return Err(err);
                }
                if frame.fin {
                    self.check_size(frame.payload.len())?;
                    Ok(Some(ReadOutcome {
                        payload: frame.payload,
                        opcode: frame.opcode,
                        was_close: false,
                    }))
                } else {
                    self.check_size(frame.payload.len())?;
                    self.continuation = Some(ContinuationState {
                        opcode: frame.opcode,
                        buffer: BytesMut::from(frame.payload.as_ref()),
                    });
                    Ok(None)
                }
            }
            OpCode::Continuation => {
                let Some(state) = self.continuation.as_mut() else {
                    let err = WsError::Protocol(ProtocolErrorKind::UnexpectedContinuation);
                    self.fail_and_close(&err).await;
                    return Err(err);
                };
                let new_len = state.buffer.len() + frame.payload.len();
                if new_len > self.max_message_size {
                    let err = WsError::MessageTooLarge(new_len);
                    self.fail_and_close(&err).await;
                    return Err(err);
                }
                state.buffer.extend_from_slice(&frame.payload);
                if frame.fin {
                    let finished = self.continuation.take().expect("checked above");
                    Ok(Some(ReadOutcome {
                        payload: finished.buffer.freeze(),
                        opcode: finished.opcode,
                        was_close: false,
                    }))
                } else {
                    Ok(None)
                }
            }
            OpCode::Ping => {
                self.pong(&frame.payload).await?;
                Ok(None)
            }
            OpCode::Pong => {
                if self.pending_ping {
                    self.pending_ping = false;
                } else {
                    tracing::debug!("received unsolicited pong");
                }
                Ok(None)
            }
            OpCode::Close => {
                let already_closing = self.state() == ConnectionState::Closing;
                if !already_closing {
                    let (code, reason) = parse_close_payload(&frame.payload);
                    let _ = self.close(code, &reason).await;
                }
                self.mark_closed();
                Ok(Some(ReadOutcome {
                    payload: frame.payload,
                    opcode: OpCode::Close,
                    was_close: true,
                }))
            }
        }
    }

    fn check_size(&self, len: usize) -> Result<(), WsError> {
        if len > self.max_message_size {
            Err(WsError::MessageTooLarge(len))
        } else {
            Ok(())
        }
    }

    async fn fail_and_close(&mut self, err: &WsError) {
        if let Some(code) = err.close_code() {
            let _ = self.close(code, &err.to_string()).await;
        }
        self.mark_closed();
    }
}

impl Connection<TcpStream> {
    /// a clonable, registry-facing handle sharing this connection's writer
    /// mutex and state atomic. Only available for `TcpStream` connections,
    /// since that's the only transport the server registry ever tracks.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.id,
            writer: Arc::clone(&self.writer),
            state: Arc::clone(&self.state),
        }
    }
}

fn parse_close_payload(payload: &[u8]) -> (CloseCode, String) {
    if payload.len() < 2 {
        return (CloseCode::Normal, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (CloseCode::from(code), reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn server_conn(stream: tokio::io::DuplexStream) -> Connection<tokio::io::DuplexStream> {
        Connection::new(ConnectionId(1), stream, Role::Server, 16 * 1024 * 1024)
    }

    #[tokio::test]
    async fn echoes_single_frame_text() {
        let (client, server) = duplex(4096);
        let mut client_conn = Connection::new(ConnectionId(0), client, Role::Client, 1 << 20);
        let mut server_conn = server_conn(server);

        client_conn
            .write_with_flags(b"hello", 0b1000_0001)
            .await
            .unwrap();
        let outcome = server_conn.read().await.unwrap();
        assert_eq!(outcome.payload.as_ref(), b"hello");
        assert_eq!(outcome.opcode, OpCode::Text);
        assert!(!outcome.was_close);
    }

    #[tokio::test]
    async fn reassembles_fragmented_message() {
        let (client, server) = duplex(4096);
        let mut client_conn = Connection::new(ConnectionId(0), client, Role::Client, 1 << 20);
        let mut server_conn = server_conn(server);

        client_conn.write_with_flags(b"he", 0b0000_0001).await.unwrap();
        client_conn.write_with_flags(b"ll", 0b0000_0000).await.unwrap();
        client_conn.write_with_flags(b"o", 0b1000_0000).await.unwrap();

        let outcome = server_conn.read().await.unwrap();
        assert_eq!(outcome.payload.as_ref(), b"hello");
        assert_eq!(outcome.opcode, OpCode::Text);
    }

    #[tokio::test]
    async fn replies_to_ping_with_pong_transparently() {
        let (client, server) = duplex(4096);
        let mut client_conn = Connection::new(ConnectionId(0), client, Role::Client, 1 << 20);
        let mut server_conn = server_conn(server);

        client_conn.ping(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        client_conn.write_with_flags(b"after", 0b1000_0010).await.unwrap();

        // the server's read() silently answers the Ping with a Pong and
        // only surfaces the following Binary message
        let server_outcome = server_conn.read().await.unwrap();
        assert_eq!(server_outcome.opcode, OpCode::Binary);
        assert_eq!(server_outcome.payload.as_ref(), b"after");
        server_conn.write(b"ack").await.unwrap();

        // the client's read() silently consumes the Pong it receives and
        // surfaces only the server's subsequent reply
        let client_outcome = client_conn.read().await.unwrap();
        assert_eq!(client_outcome.payload.as_ref(), b"ack");
        assert!(!client_conn.pending_ping);
    }

    #[tokio::test]
    async fn continuation_without_opening_frame_is_protocol_error() {
        let (client, server) = duplex(4096);
        let mut client_conn = Connection::new(ConnectionId(0), client, Role::Client, 1 << 20);
        let mut server_conn = server_conn(server);

        client_conn.write_with_flags(b"oops", 0b1000_0000).await.unwrap();
        let err = server_conn.read().await.unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(crate::errors::ProtocolErrorKind::UnexpectedContinuation)
        ));
        assert_eq!(server_conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_frame_is_delivered_and_state_becomes_closed() {
        let (client, server) = duplex(4096);
        let mut client_conn = Connection::new(ConnectionId(0), client, Role::Client, 1 << 20);
        let mut server_conn = server_conn(server);

        client_conn.close(CloseCode::Normal, "bye").await.unwrap();
        let outcome = server_conn.read().await.unwrap();
        assert!(outcome.was_close);
        assert_eq!(server_conn.state(), ConnectionState::Closed);
    }
}
