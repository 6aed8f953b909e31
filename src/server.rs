//! the accept loop, live-connection registry, and broadcast fan-out.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionState};
use crate::errors::WsError;
use crate::frame::{CloseCode, Role};
use crate::handshake;

/// settings carried by [`serve`]; not part of the wire protocol.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub upgrade_path: String,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            upgrade_path: "/ws".to_string(),
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// the live set of Open connections, keyed by [`ConnectionId`].
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    clients: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn insert(&self, handle: ConnectionHandle) {
        self.clients.write().await.insert(handle.id(), handle);
    }

    /// idempotent: removing an id that is no longer present is a no-op.
    async fn remove(&self, id: ConnectionId) {
        self.clients.write().await.remove(&id);
    }
}

/// handed to the connection handler alongside its `Connection`; lets the
/// handler broadcast to every other live client.
#[derive(Clone)]
pub struct ServerContext {
    registry: Arc<Registry>,
}

impl ServerContext {
    /// write `payload` as a Binary frame to every client currently believed
    /// Open. A write failure, or a handle observed not-Open, evicts that
    /// client from the registry; it never aborts the rest of the broadcast.
    /// Returns the number of clients the payload was successfully written
    /// to.
    pub async fn broadcast(&self, payload: &[u8]) -> usize {
        let snapshot: Vec<ConnectionHandle> = {
            let clients = self.registry.clients.read().await;
            clients.values().cloned().collect()
        };

        let mut delivered = 0;
        for handle in snapshot {
            if handle.state() != ConnectionState::Open {
                self.registry.remove(handle.id()).await;
                continue;
            }
            match handle.write_binary(payload).await {
                Ok(()) => delivered += 1,
                Err(_) => self.registry.remove(handle.id()).await,
            }
        }
        delivered
    }

    /// snapshot of ids of clients currently registered as Open.
    pub async fn clients(&self) -> Vec<ConnectionId> {
        self.registry.clients.read().await.keys().copied().collect()
    }
}

/// bind `config.bind_addr`, accept connections forever, and for each one:
/// perform the server-side handshake, register it, and spawn a task that
/// hands the established `Connection` and a `ServerContext` to `handler`.
///
/// `handler`'s returned `CloseCode` is only consulted when it also returns
/// `Some(WsError)`; a clean (`None`) return always closes with
/// `CloseCode::Normal`, regardless of the code value returned alongside it.
pub async fn serve<F, Fut>(config: ServerConfig, handler: F) -> std::io::Result<()>
where
    F: Fn(Connection<TcpStream>, ServerContext) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = (CloseCode, Option<WsError>)> + Send,
{
    let listener = TcpListener::bind(&config.bind_addr).await?;
    let registry = Arc::new(Registry::default());

    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        let config = config.clone();
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(err) = serve_one(stream, &config, &registry, handler).await {
                tracing::debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn serve_one<F, Fut>(
    mut stream: TcpStream,
    config: &ServerConfig,
    registry: &Arc<Registry>,
    handler: F,
) -> Result<(), WsError>
where
    F: Fn(Connection<TcpStream>, ServerContext) -> Fut,
    Fut: Future<Output = (CloseCode, Option<WsError>)>,
{
    if let Err(err) = handshake::accept(&mut stream, &config.upgrade_path).await {
        return Err(err);
    }

    let id = registry.next_id();
    let connection = Connection::new(id, stream, Role::Server, config.max_message_size);
    let handle = connection.handle();
    registry.insert(handle.clone()).await;

    let context = ServerContext {
        registry: Arc::clone(registry),
    };
    let (close_code, error) = handler(connection, context).await;

    if let Some(error) = error {
        if handle.state() != ConnectionState::Closed {
            let reason = error.to_string();
            let reason = crate::connection::fit_close_reason(&reason, 123);
            let _ = handle.close(close_code, reason).await;
        }
        registry.remove(id).await;
        return Err(error);
    }

    registry.remove(id).await;
    Ok(())
}
