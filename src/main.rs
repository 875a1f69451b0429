use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::{cors::CorsLayer, trace::TraceLayer};

use danci_session::collaborator::{Collaborator, OpenAiCollaborator, ScriptedCollaborator};
use danci_session::config::Config;
use danci_session::events::EventBus;
use danci_session::logging::init_tracing;
use danci_session::routes;
use danci_session::session::SessionOrchestrator;
use danci_session::state::AppState;
use danci_session::storage::{KvStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log);

    let catalog = match config.load_catalog() {
        Ok(catalog) => Arc::new(catalog),
        Err(err) => {
            tracing::error!(error = %err, "failed to load item catalog");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn KvStore> = match &config.database_path {
        Some(path) => match SqliteStore::open(path).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "sqlite store unavailable, state will not persist");
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let collaborator: Arc<dyn Collaborator> = if config.use_scripted_collaborator() {
        tracing::info!("LLM not configured or mocked, using scripted collaborator");
        Arc::new(ScriptedCollaborator::new())
    } else {
        tracing::info!(model = %config.llm.model, endpoint = %config.llm.api_endpoint, "using OpenAI-compatible collaborator");
        Arc::new(OpenAiCollaborator::new(config.llm.clone()))
    };

    let orchestrator = match SessionOrchestrator::load(
        catalog,
        store,
        collaborator,
        EventBus::new(),
        config.session,
    )
    .await
    {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            tracing::error!(error = %err, "failed to restore session state");
            std::process::exit(1);
        }
    };

    let app = routes::router(AppState::new(orchestrator))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.bind_addr();
    tracing::info!(%addr, "danci-session listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind listener failed");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
    }

    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
