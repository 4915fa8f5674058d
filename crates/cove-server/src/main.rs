use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use cove_api::auth::{self, AppState, AppStateInner};
use cove_api::middleware::require_auth;
use cove_api::{conversations, messages};
use cove_gateway::connection;
use cove_gateway::dispatcher::Dispatcher;
use cove_gateway::presence::{PresenceTracker, spawn_typing_sweeper};
use cove_gateway::registry::ConnectionRegistry;
use cove_store::{ConversationStore, Database};
use cove_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cove=debug,tower_http=debug".into()),
        )
        .init();

    // Config. Retention, TTLs, and queue bounds are deployment
    // parameters, not constants.
    let jwt_secret =
        std::env::var("COVE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("COVE_DB_PATH").unwrap_or_else(|_| "cove.db".into());
    let host = std::env::var("COVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COVE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let retention: u64 = env_or("COVE_RETENTION_MESSAGES", 500);
    let typing_ttl_secs: u64 = env_or("COVE_TYPING_TTL_SECS", 5);
    let queue_capacity: usize = env_or("COVE_QUEUE_CAPACITY", 256);
    let max_payload_bytes: usize = env_or("COVE_MAX_PAYLOAD_BYTES", 64 * 1024);
    let snapshot_messages: u32 = env_or("COVE_SNAPSHOT_MESSAGES", 50);

    // Init database
    let db = Database::open(&PathBuf::from(&db_path))?;
    let store = ConversationStore::new(db, retention);

    // Shared state
    let registry = ConnectionRegistry::new(queue_capacity);
    let presence = PresenceTracker::new(Duration::from_secs(typing_ttl_secs));
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        presence.clone(),
        max_payload_bytes,
    );

    // Typing indicators decay by sweep, never by explicit cancel.
    spawn_typing_sweeper(presence);

    let app_state: AppState = Arc::new(AppStateInner {
        store,
        jwt_secret: jwt_secret.clone(),
        snapshot_messages,
    });

    let state = ServerState {
        dispatcher,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/conversations", post(conversations::create_conversation))
        .route(
            "/conversations/{conversation_id}/members",
            post(conversations::add_member),
        )
        .route(
            "/conversations/{conversation_id}/members/{user_id}",
            delete(conversations::remove_member),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/snapshot",
            get(conversations::snapshot),
        )
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ))
        .with_state(app_state);

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Cove server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct GatewayParams {
    token: String,
}

/// Validate the JWT at the upgrade layer, so the socket loop starts
/// pre-authenticated and goes straight to Ready.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let token_data = decode::<Claims>(
        &params.token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let Claims { sub, username, .. } = token_data.claims;
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, sub, username)
    }))
}
