use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use parley::adapters::{HttpRegistryClient, NoopPaymentProcessor};
use parley::client::{AgentClient, ClientConfig};
use parley::config::AppConfig;
use parley::error::{ParleyError, Result};
use parley::protocol::messages::{notifications, AgentCapabilities};
use parley::server::WebSocketServer;
use parley::signing::Wallet;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parley", about = "Agent-to-agent coordination server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the A2A server
    Serve {
        /// Configuration directory
        #[arg(long, default_value = "config")]
        config_dir: String,
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect a demo agent to a running server
    Connect {
        /// Server endpoint
        #[arg(long, default_value = "ws://127.0.0.1:9040")]
        url: String,
        /// Market to subscribe to after handshake
        #[arg(long, default_value = "market-123")]
        market: String,
        /// Registry token id to claim
        #[arg(long, default_value = "1")]
        token_id: String,
    },
    /// Generate a throwaway agent wallet
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config_dir, port } => {
            let mut config = AppConfig::load_from(&config_dir)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            init_logging(&config);
            if let Err(errors) = config.validate() {
                for e in &errors {
                    error!("Config error: {}", e);
                }
                return Err(ParleyError::Validation(errors.join("; ")));
            }
            run_server(config).await
        }
        Commands::Connect {
            url,
            market,
            token_id,
        } => {
            init_logging_simple();
            run_demo_agent(&url, &market, &token_id).await
        }
        Commands::Keygen => {
            init_logging_simple();
            keygen();
            Ok(())
        }
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    let registry_client: Option<Arc<dyn parley::adapters::RegistryClient>> =
        match &config.registry.url {
            Some(url) => {
                info!("Using registry gateway at {}", url);
                Some(Arc::new(HttpRegistryClient::new(
                    url,
                    Duration::from_millis(config.registry.timeout_ms),
                )?))
            }
            None => None,
        };

    let mut server = WebSocketServer::with_collaborators(
        config,
        registry_client,
        None,
        Some(Arc::new(NoopPaymentProcessor::new())),
    );
    server.bind().await?;

    tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

/// Minimal interactive agent: handshake, subscribe one market, print pushes.
async fn run_demo_agent(url: &str, market: &str, token_id: &str) -> Result<()> {
    let wallet = match Wallet::from_env() {
        Ok(wallet) => wallet,
        Err(_) => {
            warn!("No private key in environment, using a throwaway wallet");
            Wallet::random()
        }
    };

    let config = ClientConfig::new(url, token_id)
        .with_capabilities(AgentCapabilities {
            strategies: vec!["momentum".to_string()],
            markets: vec![market.to_string()],
            actions: vec!["analyze".to_string()],
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
        .with_auto_reconnect(true);
    let client = AgentClient::new(config, wallet);

    for event in [
        notifications::MARKET_UPDATE,
        notifications::ANALYSIS_SHARED,
        notifications::ANALYSIS_REQUESTED,
        notifications::COALITION_UPDATED,
        notifications::PAYMENT_REQUESTED,
        notifications::PAYMENT_CONFIRMED,
    ] {
        let name = event.to_string();
        client.on(event, move |params| {
            println!("[{}] {}", name, params);
        });
    }

    let identity = client.connect().await?;
    println!("Connected as {}", identity.agent_id);

    client.subscribe_market(market).await?;
    println!("Subscribed to {}", market);

    let discovered = client.discover_agents(None, None).await?;
    println!(
        "{} agent(s) known to the server",
        discovered.total
    );

    signal::ctrl_c().await?;
    client.disconnect().await;
    Ok(())
}

fn keygen() {
    use ethers::signers::{LocalWallet, Signer};

    let wallet = LocalWallet::new(&mut rand::thread_rng());
    println!("address:     {:?}", wallet.address());
    println!(
        "private key: 0x{}",
        hex::encode(wallet.signer().to_bytes())
    );
}

fn init_logging(config: &AppConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let default_filter = format!("info,parley={}", config.logging.level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // File logging only when a log directory is configured.
    //
    // Important: `tracing_appender::rolling::daily` will panic if it can't
    // create the initial log file, so writability is preflighted.
    let file_layer = std::env::var("PARLEY_LOG_DIR").ok().and_then(|log_dir| {
        if std::fs::create_dir_all(&log_dir).is_err() {
            eprintln!(
                "Warning: Could not create log directory {}, file logging disabled",
                log_dir
            );
            return None;
        }
        let test_path = std::path::Path::new(&log_dir).join(".parley_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(&log_dir, "parley.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the guard alive for the process lifetime.
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    });

    let console_layer = if config.logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
