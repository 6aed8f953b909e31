use std::io::Write;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;

use ws_endpoint::{connect, CloseCode, ClientConfig};

/// reads lines from stdin, sends each as a Binary message, and prints
/// whatever the server echoes back
#[derive(Parser)]
struct Args {
    /// server address, e.g. 127.0.0.1:9000
    addr: String,
    /// HTTP upgrade path to request
    #[arg(long, default_value = "/ws")]
    path: String,
}

#[tokio::main]
async fn main() -> Result<(), ()> {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");

    let args = Args::parse();
    let config = ClientConfig {
        upgrade_path: args.path,
        ..Default::default()
    };

    connect(&args.addr, config, |mut conn| async move {
        let mut line = String::new();
        loop {
            print!("[SEND] > ");
            std::io::stdout().flush().unwrap();
            line.clear();
            if std::io::stdin().read_line(&mut line).unwrap_or(0) == 0 || line.trim() == "quit" {
                let _ = conn.close(CloseCode::Normal, "bye").await;
                return (CloseCode::Normal, None);
            }
            if conn.write(line.trim_end().as_bytes()).await.is_err() {
                return (CloseCode::InternalError, None);
            }
            match conn.read().await {
                Ok(outcome) if outcome.was_close => return (CloseCode::Normal, None),
                Ok(outcome) => println!("[RECV] > {}", String::from_utf8_lossy(&outcome.payload)),
                Err(err) => {
                    tracing::debug!(error = %err, "read failed");
                    return (CloseCode::InternalError, Some(err));
                }
            }
        }
    })
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "client session failed");
    })
}
