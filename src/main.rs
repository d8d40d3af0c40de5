use imu_recorder::ble::BleAdapter;
use imu_recorder::http::{self, AppState};
use imu_recorder::{Config, ConnectionManager, ExportPipeline, LifecycleController, SessionStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("{}; using default settings", e);
            Config::default()
        }
    };
    log::info!("Writing test data under {}", config.data_dir.display());

    let store = Arc::new(SessionStore::new());
    let exporter = ExportPipeline::new(config.data_dir.clone());
    let lifecycle = Arc::new(LifecycleController::new(store.clone(), exporter));

    let adapter = Arc::new(BleAdapter::new(&config));
    let connections = Arc::new(ConnectionManager::new(adapter, store, config.retry_backoff()));

    let state = AppState {
        lifecycle,
        connections: connections.clone(),
        scan_timeout: config.scan_timeout(),
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Shutting down");
    };

    let served = http::serve(state, &config.bind_address, shutdown).await;

    connections.shutdown().await;
    served
}
