// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use confidential_erc20_server::{
    api::router,
    blockchain::AlloyLedger,
    config::{self, ServerConfig},
    listener::{Dispatcher, EventListener, RetryWorker},
    orchestrator::Orchestrator,
    state::AppState,
    storage::RedbStore,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    config::init_logging(config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "Server failed");
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(RedbStore::open(&config.database_path())?);

    let ledger = Arc::new(
        AlloyLedger::new(
            config.rpc_url.as_str(),
            config.contract_address,
            config.identity.signer()?,
            config.network.clone(),
        )?
        .with_confirmation_timeout(config.confirmation_timeout),
    );

    info!(
        server = %config.identity.address(),
        contract = %config.contract_address,
        network = %config.network.name,
        "Server identity loaded"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        config.identity.clone(),
        ledger.clone(),
        store.clone(),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher::new(
        orchestrator.clone(),
        config.worker_queue_capacity,
        shutdown.clone(),
    ));

    let listener = EventListener::new(ledger, store, dispatcher.clone())
        .with_poll_interval(config.poll_interval)
        .with_start_block(config.start_block);
    let listener_task = tokio::spawn(listener.run(shutdown.clone()));

    let retry = RetryWorker::new(orchestrator.tracker().clone(), dispatcher.clone())
        .with_interval(config.retry_interval);
    let retry_task = tokio::spawn(retry.run(shutdown.clone()));

    let app = router(AppState::new(orchestrator).with_data_dir(config.data_dir.clone()));
    let tcp = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Listening (docs at /docs)");

    let server_shutdown = shutdown.clone();
    axum::serve(tcp, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = tokio::join!(listener_task, retry_task);
    dispatcher.drain().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received");
}
