use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;

use ws_endpoint::{serve, CloseCode, Connection, ServerConfig, ServerContext, WsError};

/// echoes every Text/Binary message back to the sender that sent it
#[derive(Parser)]
struct Args {
    /// server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
    /// HTTP upgrade path clients must request
    #[arg(long, default_value = "/ws")]
    path: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        upgrade_path: args.path,
        ..Default::default()
    };
    tracing::info!(bind_addr = %config.bind_addr, "starting echo server");
    serve(config, handle_connection).await
}

async fn handle_connection(
    mut conn: Connection<tokio::net::TcpStream>,
    _ctx: ServerContext,
) -> (CloseCode, Option<WsError>) {
    tracing::info!(id = ?conn.id(), "connection open");
    loop {
        match conn.read().await {
            Ok(outcome) if outcome.was_close => {
                tracing::info!(id = ?conn.id(), "connection closed by peer");
                return (CloseCode::Normal, None);
            }
            Ok(outcome) => {
                if let Err(err) = conn.write(&outcome.payload).await {
                    tracing::debug!(id = ?conn.id(), error = %err, "echo write failed");
                    return (CloseCode::InternalError, Some(err));
                }
            }
            Err(err) => {
                tracing::debug!(id = ?conn.id(), error = %err, "connection ended with error");
                return (CloseCode::ProtocolError, Some(err));
            }
        }
    }
}
