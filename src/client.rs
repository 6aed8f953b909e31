//! Dials a transport, runs the client-side handshake, and hands the
//! established [`Connection`] to a user handler.

use std::future::Future;

use tokio::net::TcpStream;

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::errors::WsError;
use crate::frame::{CloseCode, Role};
use crate::handshake;

/// settings carried by [`connect`]; not part of the wire protocol.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub upgrade_path: String,
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            upgrade_path: "/ws".to_string(),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// dial `remote_addr`, perform the client-side handshake against
/// `config.upgrade_path`, and run `handler` to completion with the
/// resulting `Connection`. The transport is always closed before this
/// returns, whether the handler finished cleanly, the handler reported an
/// error, or the handshake itself failed.
pub async fn connect<F, Fut>(
    remote_addr: &str,
    config: ClientConfig,
    handler: F,
) -> Result<(), WsError>
where
    F: FnOnce(Connection<TcpStream>) -> Fut,
    Fut: Future<Output = (CloseCode, Option<WsError>)>,
{
    let mut stream = TcpStream::connect(remote_addr).await?;
    handshake::connect(&mut stream, remote_addr, &config.upgrade_path).await?;

    let connection = Connection::new(ConnectionId(0), stream, Role::Client, config.max_message_size);
    let handle = connection.handle();
    let (close_code, error) = handler(connection).await;

    if let Some(error) = error {
        if handle.state() != ConnectionState::Closed {
            let reason = error.to_string();
            let reason = crate::connection::fit_close_reason(&reason, 123);
            let _ = handle.close(close_code, reason).await;
        }
        return Err(error);
    }
    Ok(())
}
