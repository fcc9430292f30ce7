use wallet::api::server;
use wallet::config::WalletConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading any configuration
    dotenv::dotenv().ok();

    // Initialize logger (set RUST_LOG=debug for verbose output, RUST_LOG=info for normal)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WalletConfig::from_env();
    log::info!("Starting on-chain wallet server on {}", config.bind_address);
    server::start_server(config).await?;
    Ok(())
}
