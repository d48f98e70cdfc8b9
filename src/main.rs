use std::error::Error;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use paicord_core::config::Config;
use paicord_core::gateway::GatewayManager;
use paicord_core::remote_auth::messages::UserPreview;
use paicord_core::remote_auth::{HttpExchanger, PairingObserver, PairingOutcome, RemoteAuthClient};
use paicord_core::transport::WsConnector;

#[derive(Parser)]
#[command(name = "paicord", version, about = "Gateway and pairing client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the gateway and log events until interrupted
    Gateway {
        /// Account token (falls back to PAICORD_TOKEN)
        #[arg(long, env = "PAICORD_TOKEN", hide_env_values = true)]
        token: String,

        /// Presence status to set once ready
        #[arg(long)]
        status: Option<String>,
    },
    /// Sign in by scanning a code with an already signed-in device
    Pair,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paicord=info,paicord_core=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    print_banner(&config, &cli.command);

    match cli.command {
        Command::Gateway { token, status } => run_gateway(config, &token, status.as_deref()).await?,
        Command::Pair => run_pair(config).await?,
    }
    Ok(())
}

fn print_banner(config: &Config, command: &Command) {
    let version = env!("CARGO_PKG_VERSION");

    eprintln!();
    eprintln!("  \x1b[1;36mpaicord\x1b[0m \x1b[2mv{version}\x1b[0m");
    eprintln!();
    match command {
        Command::Gateway { .. } => {
            eprintln!("  \x1b[2mgateway\x1b[0m      {}", config.gateway.url);
            eprintln!("  \x1b[2mapi version\x1b[0m  {}", config.gateway.api_version);
        }
        Command::Pair => {
            let unset = "(unset)";
            eprintln!("  \x1b[2mpairing\x1b[0m      {}", config.remote_auth.url.as_deref().unwrap_or(unset));
            eprintln!("  \x1b[2mapi\x1b[0m          {}", config.remote_auth.api_base.as_deref().unwrap_or(unset));
        }
    }
    eprintln!();
}

async fn run_gateway(config: Config, token: &str, status: Option<&str>) -> Result<(), Box<dyn Error>> {
    let mut manager = GatewayManager::new(config.gateway, WsConnector::default());
    let mut events = manager.connect(token).await?;

    if let Some(status) = status {
        manager.update_presence(status, false, serde_json::json!([]))?;
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break Ok(());
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    tracing::info!(event = event.kind.name(), seq = ?event.sequence, "gateway event");
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
        }
    };

    manager.disconnect().await;
    outcome.map_err(Into::into)
}

struct TerminalObserver;

impl PairingObserver for TerminalObserver {
    fn show_fingerprint(&mut self, _fingerprint: &str, qr_url: &str) {
        eprintln!("  \x1b[1mscan this with a signed-in device:\x1b[0m");
        eprintln!("  \x1b[32m{qr_url}\x1b[0m");
        eprintln!();
    }

    fn show_preview(&mut self, preview: &UserPreview) {
        eprintln!(
            "  \x1b[2msigning in as\x1b[0m {} \x1b[2m({})\x1b[0m, confirm on your device",
            preview.username, preview.id
        );
    }
}

async fn run_pair(config: Config) -> Result<(), Box<dyn Error>> {
    let api_base = config
        .remote_auth
        .api_base
        .clone()
        .ok_or("PAICORD_API_BASE must point at a pairing service")?;
    if config.remote_auth.url.is_none() {
        return Err("PAICORD_REMOTE_AUTH_URL must point at a pairing service".into());
    }
    let exchanger = HttpExchanger::new(api_base);
    let client = RemoteAuthClient::new(config.remote_auth, WsConnector::default(), exchanger);
    let mut observer = TerminalObserver;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("  \x1b[33m! pairing cancelled\x1b[0m");
            return Ok(());
        }
        outcome = client.pair(&mut observer) => outcome?,
    };

    match outcome {
        PairingOutcome::Succeeded(credential) => {
            eprintln!("  \x1b[32m→ signed in\x1b[0m");
            println!("{}", credential.expose());
        }
        PairingOutcome::Cancelled => {
            eprintln!("  \x1b[33m! pairing cancelled on the other device\x1b[0m");
        }
    }
    Ok(())
}
