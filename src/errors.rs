use thiserror::Error;

use crate::frame::CloseCode;

/// errors raised during handshake, frame decode, or connection I/O
#[derive(Debug, Error)]
pub enum WsError {
    /// transport I/O failed; the connection is considered closed without
    /// an outbound Close frame
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a decoded frame (or frame sequence) violated RFC 6455
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolErrorKind),

    /// the opening HTTP Upgrade request/response was rejected before any
    /// WebSocket frame could be exchanged
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// a close reason would not fit in a 125 byte control frame payload
    #[error("close reason too long (2 + {0} bytes > 125)")]
    ReasonTooLong(usize),

    /// an assembled message (single-frame or reassembled) exceeded the
    /// configured cap
    #[error("message of {0} bytes exceeds configured limit")]
    MessageTooLarge(usize),

    /// an operation was attempted on a connection already in the Closed state
    #[error("connection is closed")]
    ConnectionClosed,

    /// a `ws://`/`wss://` URI was malformed or used an unsupported scheme
    #[error("invalid uri: {0}")]
    InvalidUri(String),
}

impl WsError {
    /// close code this error should be reported with, when one applies
    ///
    /// handshake failures and bare I/O errors have no corresponding Close
    /// frame (per §7, they either never reached Open or skip the Close
    /// emission entirely), so this returns `None` for those variants.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            WsError::Protocol(kind) => Some(kind.close_code()),
            WsError::MessageTooLarge(_) => Some(CloseCode::MessageTooBig),
            WsError::Io(_)
            | WsError::Handshake(_)
            | WsError::ReasonTooLong(_)
            | WsError::ConnectionClosed
            | WsError::InvalidUri(_) => None,
        }
    }
}

/// framing violations surfaced by the frame decoder or the connection loop's
/// fragmentation bookkeeping
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// RSV1/RSV2/RSV3 was set without a negotiated extension to define it
    #[error("reserved bit set")]
    ReservedBitSet,
    /// opcode fell in the 0x3-0x7 or 0xB-0xF reserved ranges
    #[error("opcode {0:#x} is reserved")]
    ReservedOpcode(u8),
    /// a control frame (Close/Ping/Pong) had FIN unset
    #[error("control frame fragmented (fin=0)")]
    FragmentedControlFrame,
    /// a control frame's payload exceeded the 125-byte limit
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),
    /// server role decoded a frame without the mask bit set
    #[error("server received unmasked data frame")]
    UnmaskedFromClient,
    /// client role decoded a frame with the mask bit set
    #[error("client received masked frame")]
    MaskedFromServer,
    /// a Continuation frame arrived with no fragmented message in progress
    #[error("continuation frame with no open fragmented message")]
    UnexpectedContinuation,
    /// a new Text/Binary frame arrived while a fragmented message was still open
    #[error("new data frame while a fragmented message is still open")]
    DataFrameDuringFragment,
    /// the 8-byte extended payload length had its high bit set, which RFC 6455 forbids
    #[error("8-byte extended length had the high bit set")]
    ExtendedLengthHighBitSet,
}

impl ProtocolErrorKind {
    /// every validation rule in §4.A maps to 1002; kept as a method rather
    /// than a constant so new variants are forced to pick a code
    pub fn close_code(&self) -> CloseCode {
        CloseCode::ProtocolError
    }
}
