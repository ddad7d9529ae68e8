/**
 * FLEETWATCH KERNEL - Point d'entrée du serveur d'ingestion
 *
 * RÔLE : Orchestration des modules : config, store, présence, ingestion MQTT, HTTP.
 *
 * ARCHITECTURE : subscriber MQTT → file d'ingestion → routeur → store / tracker
 * de présence (seul écrivain des status) → broadcaster → SSE.
 * Un CancellationToken partagé arrête toutes les tâches sur SIGINT/SIGTERM.
 */

use anyhow::{Context, Result};
use fleetwatch_kernel::broadcaster::Broadcaster;
use fleetwatch_kernel::config::{load_config, StoreBackend};
use fleetwatch_kernel::health::HealthTracker;
use fleetwatch_kernel::http::{build_router, AppState};
use fleetwatch_kernel::ingest::{ingest_queue, run_ingest};
use fleetwatch_kernel::logging::init_logging;
use fleetwatch_kernel::mqtt::run_mqtt_subscriber;
use fleetwatch_kernel::presence::{spawn_presence_tracker, PresenceTracker};
use fleetwatch_kernel::router::MessageRouter;
use fleetwatch_kernel::store::{FileStore, MemoryStore, RecordStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    init_logging();

    let cfg = load_config().await;

    let store: Arc<dyn RecordStore> = match cfg.store.backend {
        StoreBackend::File => {
            let store = FileStore::open(&cfg.store.data_dir)
                .with_context(|| format!("failed to open store at {}", cfg.store.data_dir.display()))?;
            info!(data_dir = %cfg.store.data_dir.display(), "file store ready");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("memory store: records are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let health = HealthTracker::new();
    let broadcaster = Broadcaster::new(cfg.ingest.broadcast_capacity);
    let token = CancellationToken::new();

    // tracker de présence : seul écrivain des records status
    let tracker = PresenceTracker::new(
        store.clone(),
        broadcaster.clone(),
        health.clone(),
        cfg.mqtt.namespace.clone(),
        cfg.presence.offline_timeout(),
    );
    let (presence, presence_task) = spawn_presence_tracker(
        tracker,
        cfg.presence.sweep_interval(),
        cfg.ingest.queue_capacity,
        token.clone(),
    );

    // ingestion
    let router = MessageRouter::new(
        store.clone(),
        presence,
        broadcaster.clone(),
        health.clone(),
        cfg.mqtt.namespace.clone(),
    );
    let (tx, rx) = ingest_queue(cfg.ingest.queue_capacity);
    let ingest_task = tokio::spawn(run_ingest(router, rx, token.clone()));
    let mqtt_task = tokio::spawn(run_mqtt_subscriber(cfg.mqtt.clone(), tx, health.clone(), token.clone()));

    // HTTP
    let app = build_router(AppState {
        store,
        broadcaster,
        health,
    });
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");

    tokio::spawn(wait_for_shutdown(token.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    token.cancel();
    for (name, task) in [("mqtt", mqtt_task), ("ingest", ingest_task), ("presence", presence_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }
    info!("fleetwatch kernel stopped");
    Ok(())
}

async fn wait_for_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
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
    info!("shutdown requested");
    token.cancel();
}
