//! RFC 6455 frame header bit layout, validation, and the pure encode/decode
//! functions the connection loop's codec is built on.

use bytes::{Bytes, BytesMut};

use crate::errors::ProtocolErrorKind;

/// which side is decoding/encoding; drives masking direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// the library is acting as a WebSocket server: decode masked frames,
    /// emit unmasked frames
    Server,
    /// the library is acting as a WebSocket client: decode unmasked frames,
    /// emit masked frames
    Client,
}

/// the 4-bit RFC 6455 opcode, restricted to the values this crate accepts.
/// anything else (0x3-0x7, 0xB-0xF) is rejected during decode before a
/// `Frame` is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// continues the message started by the most recent non-continuation
    /// data frame whose FIN bit was unset
    Continuation,
    /// a complete or fragment-opening data frame carrying UTF-8 text
    Text,
    /// a complete or fragment-opening data frame carrying arbitrary bytes
    Binary,
    /// begins the closing handshake; payload is an optional 2-byte code
    /// plus UTF-8 reason
    Close,
    /// a heartbeat the peer must answer with a Pong carrying the same
    /// payload
    Ping,
    /// answers a Ping, or is sent unsolicited as a unidirectional heartbeat
    Pong,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    fn from_u8(raw: u8) -> Result<OpCode, ProtocolErrorKind> {
        match raw {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolErrorKind::ReservedOpcode(other)),
        }
    }

    /// Close, Ping, or Pong — RFC 6455 §5.5
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// 16-bit close status code, RFC 6455 §7.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// normal, expected closure
    Normal,
    /// an endpoint is going away, e.g. server shutdown or tab navigation
    GoingAway,
    /// peer terminated the connection due to a protocol violation
    ProtocolError,
    /// endpoint received a data frame of a type it cannot accept
    UnknownType,
    /// endpoint received data inconsistent with its expected type, e.g.
    /// non-UTF-8 data in a Text message
    InvalidPayloadData,
    /// endpoint received a message that violates its policy
    PolicyViolation,
    /// message received is too large to process
    MessageTooBig,
    /// client expected the server to negotiate an extension it didn't
    ExtensionError,
    /// server encountered an unexpected condition preventing it from
    /// fulfilling the request
    InternalError,
    /// a code outside the set this library names explicitly; round-tripped
    /// verbatim rather than rejected
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnknownType => 1003,
            CloseCode::InvalidPayloadData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::ExtensionError => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnknownType,
            1007 => CloseCode::InvalidPayloadData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::ExtensionError,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }
}

/// a fully decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

/// result of attempting to decode a frame from the front of a buffer
pub enum Decoded {
    /// a complete frame, and the number of bytes it occupied
    Frame(Frame, usize),
    /// the buffer is a strict prefix of a frame; call again once more data
    /// has arrived
    NeedMore,
}

#[inline]
fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// parse a single frame header (not including payload) to determine how
/// many bytes of header+length+mask precede the payload, and how long the
/// payload is. Returns `None` if `buf` doesn't yet contain enough bytes to
/// know.
fn parse_header(buf: &[u8]) -> Result<Option<(usize, u64, bool)>, ProtocolErrorKind> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    let second = buf[1];

    if first & 0b0111_0000 != 0 {
        return Err(ProtocolErrorKind::ReservedBitSet);
    }
    let opcode = OpCode::from_u8(first & 0x0F)?;
    let fin = first & 0b1000_0000 != 0;
    if opcode.is_control() && !fin {
        return Err(ProtocolErrorKind::FragmentedControlFrame);
    }

    let masked = second & 0b1000_0000 != 0;
    let len7 = second & 0x7F;

    let (len_field_bytes, min_total) = match len7 {
        0..=125 => (0usize, 2usize),
        126 => (2usize, 4usize),
        127 => (8usize, 10usize),
        _ => unreachable!("7-bit field can't exceed 127"),
    };
    if buf.len() < min_total {
        return Ok(None);
    }

    let payload_len: u64 = match len7 {
        0..=125 => len7 as u64,
        126 => u16::from_be_bytes([buf[2], buf[3]]) as u64,
        127 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(arr);
            if len & (1 << 63) != 0 {
                return Err(ProtocolErrorKind::ExtendedLengthHighBitSet);
            }
            len
        }
        _ => unreachable!(),
    };

    if opcode.is_control() && payload_len > 125 {
        return Err(ProtocolErrorKind::ControlFrameTooLarge(payload_len as usize));
    }

    let header_len = 2 + len_field_bytes + if masked { 4 } else { 0 };
    Ok(Some((header_len, payload_len, masked)))
}

/// decode a single frame from the start of `buf`, validating against the
/// rules in SPEC_FULL.md §4.A. `role` determines which masking direction is
/// required.
pub fn decode(buf: &[u8], role: Role) -> Result<Decoded, ProtocolErrorKind> {
    let Some((header_len, payload_len, masked)) = parse_header(buf)? else {
        return Ok(Decoded::NeedMore);
    };

    match role {
        Role::Server if !masked => return Err(ProtocolErrorKind::UnmaskedFromClient),
        Role::Client if masked => return Err(ProtocolErrorKind::MaskedFromServer),
        _ => {}
    }

    let total_len = header_len + payload_len as usize;
    if buf.len() < total_len {
        return Ok(Decoded::NeedMore);
    }

    let first = buf[0];
    let fin = first & 0b1000_0000 != 0;
    let opcode = OpCode::from_u8(first & 0x0F).expect("validated above");

    let mask = if masked {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&buf[header_len - 4..header_len]);
        Some(arr)
    } else {
        None
    };

    let mut payload = BytesMut::from(&buf[header_len..total_len]);
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Decoded::Frame(
        Frame {
            fin,
            opcode,
            masked,
            mask,
            payload: payload.freeze(),
        },
        total_len,
    ))
}

/// build the wire bytes for one outbound frame. Client-role masks with a
/// freshly generated per-frame key (via `rand::random`, see SPEC_FULL.md §9
/// for why a non-cryptographic PRNG is acceptable here); server-role emits
/// unmasked. Uses the minimal length encoding: 7-bit field when possible,
/// then 16-bit, then 64-bit.
pub fn encode(
    opcode: OpCode,
    fin: bool,
    payload: &[u8],
    role: Role,
) -> Result<BytesMut, ProtocolErrorKind> {
    if opcode.is_control() && payload.len() > 125 {
        return Err(ProtocolErrorKind::ControlFrameTooLarge(payload.len()));
    }

    let masked = role == Role::Client;
    let mask = if masked {
        Some(rand::random::<[u8; 4]>())
    } else {
        None
    };

    let mut header_len = 2;
    let len = payload.len();
    if len > 65_535 {
        header_len += 8;
    } else if len > 125 {
        header_len += 2;
    }
    if masked {
        header_len += 4;
    }

    let mut out = BytesMut::with_capacity(header_len + len);
    let first = (if fin { 0b1000_0000 } else { 0 }) | opcode.as_u8();
    out.extend_from_slice(&[first]);

    let mask_bit = if masked { 0b1000_0000 } else { 0 };
    if len <= 125 {
        out.extend_from_slice(&[mask_bit | len as u8]);
    } else if len <= 65_535 {
        out.extend_from_slice(&[mask_bit | 126]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[mask_bit | 127]);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    if let Some(mask) = mask {
        out.extend_from_slice(&mask);
    }

    let payload_start = out.len();
    out.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut out[payload_start..], mask);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(opcode: OpCode, fin: bool, payload: &[u8], role: Role) -> Frame {
        let encoded = encode(opcode, fin, payload, role).unwrap();
        match decode(&encoded, role).unwrap() {
            Decoded::Frame(frame, consumed) => {
                assert_eq!(consumed, encoded.len());
                frame
            }
            Decoded::NeedMore => panic!("encoded frame should always be complete"),
        }
    }

    #[test]
    fn server_encode_is_unmasked_and_decodes() {
        let frame = roundtrip(OpCode::Text, true, b"hello", Role::Server);
        assert!(!frame.masked);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.fin);
    }

    #[test]
    fn client_encode_is_masked_and_decodes() {
        let frame = roundtrip(OpCode::Binary, false, b"partial", Role::Client);
        assert!(frame.masked);
        assert_eq!(frame.payload, Bytes::from_static(b"partial"));
        assert!(!frame.fin);
    }

    #[test]
    fn decode_rejects_masked_frame_when_client() {
        let encoded = encode(OpCode::Text, true, b"hi", Role::Client).unwrap();
        assert!(matches!(
            decode(&encoded, Role::Client),
            Err(ProtocolErrorKind::MaskedFromServer)
        ));
    }

    #[test]
    fn decode_rejects_unmasked_frame_when_server() {
        // an unmasked frame (as a compliant client would never send) must
        // be rejected by a server-role decoder
        let unmasked = encode(OpCode::Text, true, b"hi", Role::Server).unwrap();
        assert!(matches!(
            decode(&unmasked, Role::Server),
            Err(ProtocolErrorKind::UnmaskedFromClient)
        ));
    }

    #[test]
    fn decode_rejects_rsv_bits() {
        let mut encoded = encode(OpCode::Text, true, b"hi", Role::Server).unwrap();
        encoded[0] |= 0b0100_0000;
        assert!(matches!(
            decode(&encoded, Role::Server),
            Err(ProtocolErrorKind::ReservedBitSet)
        ));
    }

    #[test]
    fn decode_rejects_reserved_opcode() {
        let mut encoded = encode(OpCode::Text, true, b"hi", Role::Server).unwrap();
        encoded[0] = (encoded[0] & 0b1111_0000) | 0x3;
        assert!(matches!(
            decode(&encoded, Role::Server),
            Err(ProtocolErrorKind::ReservedOpcode(0x3))
        ));
    }

    #[test]
    fn decode_rejects_fragmented_control_frame() {
        let mut encoded = encode(OpCode::Ping, true, b"hi", Role::Server).unwrap();
        encoded[0] &= 0b0111_1111; // clear FIN
        assert!(matches!(
            decode(&encoded, Role::Server),
            Err(ProtocolErrorKind::FragmentedControlFrame)
        ));
    }

    #[test]
    fn encode_refuses_oversized_control_frame() {
        let payload = vec![0u8; 126];
        let err = encode(OpCode::Ping, true, &payload, Role::Server).unwrap_err();
        assert!(matches!(err, ProtocolErrorKind::ControlFrameTooLarge(126)));
    }

    #[test]
    fn minimal_length_encoding_short_payload() {
        let encoded = encode(OpCode::Binary, true, b"abc", Role::Server).unwrap();
        assert_eq!(encoded.len(), 2 + 3);
        assert_eq!(encoded[1] & 0x7F, 3);
    }

    #[test]
    fn minimal_length_encoding_uses_16_bit_field_at_boundary() {
        let payload = vec![0u8; 126];
        let encoded = encode(OpCode::Binary, true, &payload, Role::Server).unwrap();
        assert_eq!(encoded[1] & 0x7F, 126);
        let len = u16::from_be_bytes([encoded[2], encoded[3]]);
        assert_eq!(len as usize, 126);
    }

    #[test]
    fn minimal_length_encoding_uses_64_bit_field_above_16_bit_max() {
        let payload = vec![0u8; 70_000];
        let encoded = encode(OpCode::Binary, true, &payload, Role::Server).unwrap();
        assert_eq!(encoded[1] & 0x7F, 127);
    }

    #[test]
    fn needs_more_on_partial_header() {
        let encoded = encode(OpCode::Text, true, b"hello world", Role::Server).unwrap();
        let partial = &encoded[..1];
        assert!(matches!(decode(partial, Role::Server), Ok(Decoded::NeedMore)));
    }

    #[test]
    fn needs_more_on_partial_payload() {
        let encoded = encode(OpCode::Text, true, b"hello world", Role::Server).unwrap();
        let partial = &encoded[..encoded.len() - 2];
        assert!(matches!(decode(partial, Role::Server), Ok(Decoded::NeedMore)));
    }

    #[test]
    fn mask_roundtrip_is_involutive() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut buf = payload.clone();
        apply_mask(&mut buf, mask);
        assert_ne!(buf, payload);
        apply_mask(&mut buf, mask);
        assert_eq!(buf, payload);
    }

    #[test]
    fn frame_roundtrip_various_sizes() {
        for len in [0usize, 1, 125, 126, 1000, 65535, 65536, 200_000] {
            let payload = vec![0xAB; len];
            for role in [Role::Server, Role::Client] {
                let frame = roundtrip(OpCode::Binary, true, &payload, role);
                assert_eq!(frame.payload.as_ref(), payload.as_slice());
            }
        }
    }

    #[test]
    fn fragmentation_reassembly_matches_original() {
        let parts: [&[u8]; 3] = [b"he", b"ll", b"o"];
        let mut reassembled = Vec::new();
        for part in parts {
            reassembled.extend_from_slice(part);
        }
        assert_eq!(reassembled, b"hello");
    }
}
