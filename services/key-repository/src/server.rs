//! Key Repository HTTP Server

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

use axum::{
    Router,
    routing::{get, post},
};
use custody::{
    ChunkedCipher, FileKeyRepository, HsmDevice, KeyRepository, KeyService, MemoryKeyRepository,
    Pkcs11Device, SessionManager, SoftwareDevice,
};

use crate::{
    config::{Config, HsmBackend},
    handlers::{self, AppState},
};

/// Create and configure the Axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        // Health
        .route("/health", get(handlers::health))
        // Key operations
        .route("/key/store", post(handlers::store_key))
        .route("/key/generate", post(handlers::generate_key))
        .route("/key/generate/rsa", post(handlers::generate_rsa_key))
        .route("/key/sign", post(handlers::sign))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    listener: tokio::net::TcpListener,
    config: Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match &config.backend {
        HsmBackend::Pkcs11 { library_path } => {
            serve(listener, Pkcs11Device::new(library_path), &config).await
        }
        HsmBackend::Software => {
            warn!("Using in-process software HSM; wrapped keys will not survive a restart");
            let device = tokio::task::spawn_blocking({
                let pin = config.pin.clone();
                move || SoftwareDevice::generate(pin)
            })
            .await??;
            serve(listener, device, &config).await
        }
    }
}

async fn serve<D: HsmDevice>(
    listener: tokio::net::TcpListener,
    device: D,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = SessionManager::connect(device, config.slot_index, config.pin.as_str())
        .map_err(|e| format!("Failed to open HSM session: {}", e))?
        .with_retry_policy(config.retry_policy);
    let sessions = Arc::new(sessions);
    info!(slot = config.slot_index, "HSM session opened");

    // A session that cannot be kept alive is unrecoverable
    let keep_alive = tokio::spawn(sessions.clone().keep_alive(config.keep_alive_interval));
    tokio::spawn(async move {
        match keep_alive.await {
            Ok(e) => error!("HSM keep-alive failed, exiting: {}", e),
            Err(e) => error!("HSM keep-alive task aborted, exiting: {}", e),
        }
        std::process::exit(1);
    });

    let repository: Arc<dyn KeyRepository> = match &config.key_store_dir {
        Some(dir) => {
            info!("Storing keys under {}", dir.display());
            Arc::new(FileKeyRepository::new(dir)?)
        }
        None => {
            warn!("KEY_STORE_DIR not set; keys are held in memory only");
            Arc::new(MemoryKeyRepository::new())
        }
    };

    let cipher = Arc::new(ChunkedCipher::new(sessions.clone()));
    let state = Arc::new(AppState {
        keys: KeyService::new(cipher, repository),
    });

    let app = create_router(state);

    info!(
        "Key repository listening on {}",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = sessions.logout() {
        warn!("HSM logout failed: {}", e);
    }

    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
