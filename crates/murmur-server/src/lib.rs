//! Murmur server: wires accounts, the gateway and retention into one
//! axum application.

pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use murmur_api::Accounts;
use murmur_api::auth::{self, AppState, AppStateInner};
use murmur_crypto::KeyRing;
use murmur_db::{Database, MessageStore};
use murmur_gateway::{Dispatcher, RetentionPolicy, RetentionScheduler, connection};

pub use config::{ConfigError, ServerConfig};

/// Everything a running server needs, built from an open database.
pub struct Services {
    pub state: AppState,
    pub scheduler: Arc<RetentionScheduler>,
}

impl Services {
    pub fn new(db: Arc<Database>, master_key: murmur_crypto::SecretKey, retention: RetentionPolicy) -> Self {
        let keys = KeyRing::new(master_key);
        let dispatcher = Dispatcher::new(MessageStore::new(db.clone()), keys.clone());
        let scheduler = Arc::new(RetentionScheduler::new(retention, dispatcher.clone()));

        let state: AppState = Arc::new(AppStateInner {
            auth: Arc::new(Accounts::new(db)),
            keys,
            dispatcher,
        });

        Self { state, scheduler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/health", get(health))
        .route("/gateway", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    let auth = state.auth.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, auth))
}
