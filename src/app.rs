use std::{error::Error, sync::Arc};

use axum::{
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    broadcast, config::Config, evolution::EvolutionClient, handlers, maintenance, queue,
    realtime, types::AppState, webhook,
};

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/api/channels",
            get(handlers::list_channels).post(handlers::create_channel),
        )
        .route(
            "/api/channels/{channel_id}",
            patch(handlers::update_channel).delete(handlers::delete_channel),
        )
        .route(
            "/api/channels/{channel_id}/connection",
            get(handlers::channel_connection),
        )
        .route(
            "/api/channels/{channel_id}/sync/contacts",
            post(handlers::sync_channel_contacts),
        )
        .route(
            "/api/channels/{channel_id}/sync/avatars",
            post(handlers::sync_channel_avatars),
        )
        .route(
            "/api/channels/{channel_id}/sync/chats",
            post(handlers::sync_channel_chats),
        )
        .route("/api/contacts", get(handlers::list_contacts))
        .route(
            "/api/contacts/{contact_id}",
            get(handlers::get_contact).delete(handlers::delete_contact),
        )
        .route("/api/conversations", get(handlers::list_conversations))
        .route(
            "/api/conversations/{conversation_id}",
            get(handlers::get_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/status",
            patch(handlers::update_conversation_status),
        )
        .route(
            "/api/conversations/{conversation_id}/read",
            post(handlers::mark_conversation_read),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(handlers::list_messages).post(handlers::send_message),
        )
        .route(
            "/api/conversations/{conversation_id}/sync",
            post(handlers::sync_conversation),
        )
        .route("/api/queue", get(queue::queue_status))
        .route("/api/queue/{job_id}/retry", post(queue::retry_job))
        .route(
            "/api/broadcasts",
            get(broadcast::list_broadcasts).post(broadcast::create_broadcast),
        )
        .route(
            "/api/scheduled-messages",
            get(broadcast::list_scheduled_messages).post(broadcast::create_scheduled_message),
        )
        .route(
            "/api/scheduled-messages/{scheduled_id}",
            delete(broadcast::cancel_scheduled_message),
        )
        .route(
            "/api/maintenance/dedupe-messages",
            post(maintenance::dedupe_messages),
        )
        .route(
            "/api/maintenance/merge-conversations",
            post(maintenance::merge_conversations),
        )
        .route(
            "/api/maintenance/merge-contacts",
            post(maintenance::merge_contacts),
        )
        .route(
            "/api/maintenance/enrich-contact-names",
            post(maintenance::enrich_contact_names),
        )
        .route("/api/maintenance/diagnose", get(maintenance::diagnose))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::require_token,
        ));

    // the webhook verifies its own secret and sockets authenticate in-band
    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .route(
            "/api/webhooks/evolution/{channel_id}",
            post(webhook::evolution_webhook),
        )
        .route("/ws", get(realtime::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let gateway = EvolutionClient::new(
        &config.evolution_api_url,
        &config.evolution_api_key,
        config.evolution_timeout,
    )?;
    let port = config.port;
    if let Some(project) = &config.supabase_url {
        info!(supabase_url = %project, "using supabase project database");
    }
    let state = Arc::new(AppState::new(db, config, Arc::new(gateway)));

    tokio::spawn(queue::queue_worker(state.clone()));
    tokio::spawn(broadcast::scheduler_worker(state.clone()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("inbox server listening on http://localhost:{port}");
    axum::serve(listener, app).await?;
    Ok(())
}
