use std::{net::SocketAddr, sync::Arc};

use tokio::signal;
use tracing::{error, info};

use fulfillment_engine as engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = engine::config::load_config()?;
    engine::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db_pool = engine::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        engine::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Audit sink
    let (event_sender, event_rx) = engine::events::channel(cfg.event_channel_capacity);
    tokio::spawn(engine::events::process_events(event_rx));

    let app_state = engine::AppState::new(db_arc, cfg.clone(), Some(Arc::new(event_sender)));

    let reconcile_task = if cfg.reconcile_enabled {
        Some(engine::services::reconciliation::spawn_periodic(
            app_state.services.reconciliation.as_ref().clone(),
            cfg.reconcile_interval(),
            cfg.reconcile_batch_size,
        ))
    } else {
        None
    };

    let app = engine::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("fulfillment-engine listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = reconcile_task {
        task.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
}
