//! `tokio_util::codec` glue around the pure functions in [`crate::frame`].
//!
//! This codec is deliberately stateless across frames: it decodes exactly
//! one wire frame at a time and leaves message-level concerns (UTF-8
//! validation of reassembled text, fragmentation ordering, continuation
//! bookkeeping) to the connection loop, which is the only place that knows
//! whether a fragmented message is currently open.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{ProtocolErrorKind, WsError};
use crate::frame::{self, Decoded, Frame, OpCode, Role};

/// one outbound frame: opcode, FIN bit, and payload
pub struct Outgoing {
    pub opcode: OpCode,
    pub fin: bool,
    pub payload: BytesMut,
}

/// decodes/encodes individual WebSocket frames for one connection.
///
/// `role` fixes which direction of masking is required on decode and which
/// is applied on encode, per RFC 6455 §5.1.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match frame::decode(src, self.role)? {
            Decoded::Frame(frame, consumed) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<Outgoing> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = frame::encode(item.opcode, item.fin, &item.payload, self.role)?;
        dst.put(encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn decode_yields_none_on_empty_buffer() {
        let mut codec = FrameCodec::new(Role::Server);
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn round_trips_through_encoder_and_decoder() {
        let mut server = FrameCodec::new(Role::Server);
        let mut client = FrameCodec::new(Role::Client);

        let mut wire = BytesMut::new();
        client
            .encode(
                Outgoing {
                    opcode: OpCode::Text,
                    fin: true,
                    payload: BytesMut::from(&b"hello"[..]),
                },
                &mut wire,
            )
            .unwrap();

        let frame = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(frame.masked);
    }

    #[test]
    fn decode_surfaces_protocol_errors() {
        let mut server = FrameCodec::new(Role::Server);
        let mut client = FrameCodec::new(Role::Client);

        let mut wire = BytesMut::new();
        // server-role encode is unmasked; feeding it to a server-role
        // decoder (which demands client frames be masked) must fail
        server
            .encode(
                Outgoing {
                    opcode: OpCode::Text,
                    fin: true,
                    payload: BytesMut::from(&b"hi"[..]),
                },
                &mut wire,
            )
            .unwrap();
        let err = server.decode(&mut wire).unwrap_err();
        assert!(matches!(
            err,
            WsError::Protocol(ProtocolErrorKind::UnmaskedFromClient)
        ));
        let _ = client; // silence unused warning if decode path above short-circuits
    }
}
