use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;

use ws_endpoint::{serve, CloseCode, Connection, ServerConfig, ServerContext, WsError};

/// relays every inbound message to every other connected client
#[derive(Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value_t = 9000)]
    port: u16,
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
    tracing::info!(bind_addr = %config.bind_addr, "starting broadcast server");
    serve(config, handle_connection).await
}

async fn handle_connection(
    mut conn: Connection<tokio::net::TcpStream>,
    ctx: ServerContext,
) -> (CloseCode, Option<WsError>) {
    loop {
        match conn.read().await {
            Ok(outcome) if outcome.was_close => return (CloseCode::Normal, None),
            Ok(outcome) => {
                let delivered = ctx.broadcast(&outcome.payload).await;
                tracing::debug!(delivered, "broadcast fan-out");
            }
            Err(err) => return (CloseCode::ProtocolError, Some(err)),
        }
    }
}
