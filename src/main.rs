use agora_relay::{config, server};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "agora-relay",
    version,
    about = "Nostr relay with relay-moderated groups"
)]
struct Args {
    /// Path to the configuration directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Override the listen address
    #[arg(short, long)]
    listen_addr: Option<String>,

    /// Override the database path
    #[arg(short, long)]
    db_path: Option<String>,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let args = Args::parse();
    let config = config::Config::new(&args.config_dir).context("failed to load configuration")?;
    let mut settings = config.get_settings().context("failed to read settings")?;

    if let Some(listen_addr) = args.listen_addr {
        settings.local_addr = listen_addr;
    }
    if let Some(db_path) = args.db_path {
        settings.db_path = db_path;
    }

    let addr = settings
        .local_addr
        .parse::<SocketAddr>()
        .context("invalid listen address")?;

    let app = server::build(settings).await?;
    info!("relay pubkey: {}", app.relay_pubkey);

    let token = app.cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            token.cancel();
        }
    });

    app.serve(addr).await
}
