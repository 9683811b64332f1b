// src/main.rs
// Process bootstrap: env config, logging, stores, node assembly, bounded
// shutdown. Exit code 0 on clean shutdown, 1 on unrecoverable start-up
// failure.

use std::process::ExitCode;
use std::sync::Arc;

use basalt::config::Config;
use basalt::coordinator::SHUTDOWN_GRACE;
use basalt::storage::{BlockStore, EvidenceStore, ReceiptStore, RocksStore};

fn init_logging() {
    // log-facade modules and tracing-facade modules both end up on stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let _ = tracing_subscriber::fmt().try_init();
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: configuration: {}", e);
            return ExitCode::from(1);
        }
    };
    log::info!(
        "basalt node starting: chain {} ({}), consensus {}",
        config.chain_id,
        config.network_name,
        if config.consensus_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );
    if config.use_sandbox {
        log::info!("contract runtime sandbox hint is set");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: tokio runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let store = match RocksStore::open(&config.data_dir.join("chain")) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("fatal: storage: {}", e);
                return ExitCode::from(1);
            }
        };
        let block_store: Arc<dyn BlockStore> = store.clone();
        let receipt_store: Arc<dyn ReceiptStore> = store.clone();
        let evidence_store: Arc<dyn EvidenceStore> = store;

        let node = match basalt::spawn_node(&config, block_store, receipt_store, evidence_store) {
            Ok(node) => node,
            Err(e) => {
                eprintln!("fatal: start-up: {}", e);
                return ExitCode::from(1);
            }
        };

        tokio::signal::ctrl_c().await.ok();
        log::info!("interrupt received, shutting down");
        node.shutdown.cancel();

        // bounded drain, forced abort past the grace period
        match tokio::time::timeout(SHUTDOWN_GRACE, node.coordinator).await {
            Ok(Ok(Ok(()))) => ExitCode::from(0),
            Ok(Ok(Err(e))) => {
                log::error!("coordinator exited with error: {}", e);
                ExitCode::from(0)
            }
            Ok(Err(join_err)) => {
                log::error!("coordinator task panicked: {}", join_err);
                ExitCode::from(0)
            }
            Err(_) => {
                log::warn!("coordinator did not drain within grace period, aborting");
                ExitCode::from(0)
            }
        }
    })
}
