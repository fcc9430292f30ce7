use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::handlers;
use crate::config::WalletConfig;
use crate::indexer::{HeaderWatcher, HeaderWatcherHandle};
use crate::wallet::{RefreshOptions, WalletManager};

pub fn router(manager: Arc<WalletManager>) -> Router {
    Router::new()
        // Wallet lifecycle
        .route("/api/wallet/create", post(handlers::create_wallet_handler))
        .route("/api/wallet/restore", post(handlers::restore_wallet_handler))
        .route("/api/wallet/list", get(handlers::list_wallets_handler))
        .route("/api/wallet/:name", delete(handlers::delete_wallet_handler))
        .route("/api/wallet/:name/select", post(handlers::select_wallet_handler))
        .route("/api/wallet/:name/network", post(handlers::switch_network_handler))
        .route(
            "/api/wallet/:name/address-type",
            post(handlers::set_address_type_handler),
        )
        .route("/api/wallet/:name/indexer", post(handlers::set_indexer_handler))
        // Sync & queries
        .route("/api/wallet/:name/refresh", post(handlers::refresh_handler))
        .route("/api/wallet/:name/balance", get(handlers::get_balance_handler))
        .route("/api/wallet/:name/address", get(handlers::get_address_handler))
        .route(
            "/api/wallet/:name/transactions",
            get(handlers::get_transactions_handler),
        )
        .route("/api/wallet/:name/utxos", get(handlers::get_utxos_handler))
        .route(
            "/api/wallet/:name/utxos/blacklist",
            post(handlers::blacklist_utxo_handler),
        )
        .route(
            "/api/wallet/:name/utxos/whitelist",
            post(handlers::whitelist_utxo_handler),
        )
        // Spending
        .route("/api/wallet/:name/fees", get(handlers::estimate_fees_handler))
        .route("/api/wallet/:name/send", post(handlers::send_handler))
        .route("/api/wallet/:name/psbt", post(handlers::create_psbt_handler))
        .route("/api/wallet/:name/bump-fee", post(handlers::bump_fee_handler))
        .route("/api/wallet/:name/boost", post(handlers::boost_cpfp_handler))
        .route(
            "/api/wallet/:name/boost/:txid",
            get(handlers::can_boost_handler),
        )
        // Maintenance
        .route(
            "/api/wallet/:name/storage-check",
            post(handlers::storage_check_handler),
        )
        .route("/api/wallet/:name/warnings", get(handlers::warnings_handler))
        .route(
            "/api/wallet/:name/payment-uri",
            post(handlers::payment_uri_handler),
        )
        .with_state(manager)
}

fn cors_layer() -> CorsLayer {
    // Set ALLOWED_ORIGINS="https://app.example,https://preview.example" for production
    // If not set, allows any origin (development mode)
    match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.is_empty() => {
            log::info!("CORS configured for origins: {}", origins);
            let origin_list: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| match s.trim().parse() {
                    Ok(origin) => Some(origin),
                    Err(_) => {
                        log::warn!("⚠️  Ignoring invalid CORS origin '{}'", s.trim());
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origin_list)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        _ => {
            log::warn!("CORS: Allowing all origins (development mode). Set ALLOWED_ORIGINS env var for production.");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// Refresh the selected wallet whenever the tip of the configured network moves
fn spawn_tip_refresh(manager: Arc<WalletManager>) -> Option<HeaderWatcherHandle> {
    let network = manager.config().network;
    let indexer = match manager.default_indexer(network) {
        Ok(indexer) => indexer,
        Err(e) => {
            log::warn!("⚠️  Header watcher disabled: {}", e);
            return None;
        }
    };

    let (mut tips, handle) = HeaderWatcher::spawn(indexer, manager.config().header_poll_interval);
    tokio::spawn(async move {
        while tips.changed().await.is_ok() {
            let Some(height) = *tips.borrow_and_update() else {
                continue;
            };
            refresh_selected(&manager, height).await;
        }
    });

    Some(handle)
}

async fn refresh_selected(manager: &WalletManager, height: u32) {
    let Ok(name) = manager.selected_wallet() else {
        return;
    };
    let on_network = manager
        .storage
        .load_metadata(&name)
        .map(|metadata| metadata.network == manager.config().network)
        .unwrap_or(false);
    if !on_network {
        return;
    }

    log::info!("🔗 New tip {}, refreshing '{}'", height, name);
    let options = RefreshOptions {
        storage_check: false,
        ..RefreshOptions::default()
    };
    if let Err(e) = manager.refresh(&name, options).await {
        log::warn!("⚠️  Tip refresh of '{}' failed: {}", name, e);
    }
}

pub async fn start_server(config: WalletConfig) -> anyhow::Result<()> {
    let addr = config.bind_address.clone();
    let wallet_manager = Arc::new(WalletManager::new(config));

    let watcher = spawn_tip_refresh(wallet_manager.clone());
    let app = router(wallet_manager).layer(cors_layer());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://{}", addr);

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            log::info!("Received SIGTERM signal");
        },
    }

    log::info!("Shutdown signal received, exiting gracefully...");
}
