//! RFC 6455 WebSocket framing, the opening HTTP-Upgrade handshake, and a
//! per-connection protocol loop, for both server and client roles.
//!
//! The crate is split leaf-first:
//!
//! - [`frame`] — the pure, stateless encode/decode functions for a single
//!   wire frame, plus the opcode/close-code/role types.
//! - [`codec`] — a `tokio_util::codec::Decoder`/`Encoder` pair built on
//!   [`frame`], used to drive a `Framed` stream one frame at a time.
//! - [`handshake`] — the HTTP/1.1 Upgrade exchange, in both directions.
//! - [`connection`] — [`connection::Connection`], the per-socket state
//!   machine a handler drives directly via `read`/`write`/`close`.
//! - [`server`] — [`server::serve`], the accept loop and broadcast
//!   registry.
//! - [`client`] — [`client::connect`], the client-side dial.
//! - [`errors`] — [`errors::WsError`], the error currency of the whole
//!   crate.
//!
//! Extensions (permessage-deflate), subprotocol negotiation, and TLS are
//! out of scope: the crate is generic over `AsyncRead + AsyncWrite`, so a
//! TLS-wrapped stream works without the crate naming a TLS type.

#![warn(missing_docs)]

/// websocket error definitions
pub mod errors;
/// websocket transport unit: frame header layout, validation, encode/decode
pub mod frame;
/// `tokio_util::codec` glue around [`frame`]
pub mod codec;
/// HTTP/1.1 Upgrade handshake, server and client sides
pub mod handshake;
/// per-connection state machine
pub mod connection;
/// accept loop, live-connection registry, broadcast fan-out
pub mod server;
/// client-side dial and handshake
pub mod client;

pub use client::{connect, ClientConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState, ReadOutcome};
pub use errors::WsError;
pub use frame::{CloseCode, OpCode, Role};
pub use server::{serve, ServerConfig, ServerContext};
