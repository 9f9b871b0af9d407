//! Tutor Desk - role-gated tutoring assistant backend
//!
//! Resolves who is talking, walks each identity through its workflow and
//! queues payment receipts for administrator review.

mod api;
mod approval;
mod attachments;
mod config;
mod conversation;
mod db;
mod identity;
mod role;
mod runtime;
mod state_machine;

use api::{create_router, AppState};
use approval::ApprovalQueue;
use attachments::FsAttachmentStore;
use config::AppConfig;
use conversation::ConversationStore;
use db::Database;
use runtime::{
    BroadcastNotifier, Collaborators, DatabaseBackend, Dispatcher, EntityStores, PaymentStore,
    WorkflowEngine,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutor_desk=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    let backend = Arc::new(DatabaseBackend::new(db.clone()));

    // Payments left undecided by a previous run go back on the queue
    let unresolved = backend.load_unresolved().await?;
    tracing::info!(count = unresolved.len(), "Restored unresolved payments");
    let queue = Arc::new(ApprovalQueue::restore(unresolved));

    let notifier = BroadcastNotifier::new(256);
    let collaborators = Collaborators {
        entities: EntityStores::from_database(&db),
        staging: backend.clone(),
        students: backend.clone(),
        payments: backend,
        attachments: Arc::new(FsAttachmentStore::new(&config.uploads_dir)),
        notifier: Arc::new(notifier.clone()),
    };

    let conversations = Arc::new(ConversationStore::new(config.idle_timeout));
    let engine = Arc::new(WorkflowEngine::new(
        collaborators,
        Arc::clone(&conversations),
        queue,
    ));
    let dispatcher = Arc::new(Dispatcher::new(engine, config.idle_timeout));

    // Abandoned conversations expire on read; the sweep reclaims their memory
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let removed = conversations.sweep().await;
            if removed > 0 {
                tracing::info!(removed, "Swept idle conversations");
            }
        }
    });

    let state = AppState::new(dispatcher, notifier);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Tutor desk listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
