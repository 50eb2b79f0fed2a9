mod backend;
mod client;
mod error;
mod protocol;
mod server;
mod ui;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chatproxy", about = "Streaming chat proxy and terminal chat client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve POST /api/chat, forwarding turns to the chat backend.
    Serve {
        #[arg(long, env = "BACKEND_API_URL")]
        backend_url: String,
        #[arg(long, env = "CHATPROXY_LISTEN", default_value = "127.0.0.1:3000")]
        listen: String,
    },
    /// Chat through a running proxy in the terminal.
    Chat {
        #[arg(long, env = "CHATPROXY_URL", default_value = "http://127.0.0.1:3000")]
        proxy_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            backend_url,
            listen,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            server::run(server::ProxyConfig {
                listen,
                backend_url,
            })
            .await
        }
        // No subscriber here: log output would tear the raw-mode screen.
        Command::Chat { proxy_url } => ui::run_tui(client::ProxyClient::new(&proxy_url)),
    }
}
