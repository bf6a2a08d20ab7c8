use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        FromRequestParts, Path, Query, State,
    },
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use murmur_shared::constants::SESSION_COOKIE;
use murmur_shared::protocol::OutboundMessage;
use murmur_shared::types::{ConversationSummary, UserSummary};
use murmur_shared::Username;

use crate::client::{self, PumpSettings};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub sessions: SessionStore,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/me", get(me))
        .route("/api/users", get(search_users))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{peer}", get(get_conversation))
        .route("/ws", get(ws_connect))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The caller's identity, resolved from the session cookie.
pub struct AuthUser {
    pub username: Username,
    pub session_id: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session_id = session_cookie(&parts.headers).ok_or(ServerError::NotAuthenticated)?;
        let session = state
            .sessions
            .get(&session_id)
            .await
            .ok_or(ServerError::InvalidSession)?;

        Ok(AuthUser {
            username: session.username,
            session_id,
        })
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn session_set_cookie(id: &str, config: &ServerConfig) -> String {
    let secure = if config.cookie_secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}{secure}",
        config.session_ttl.as_secs()
    )
}

fn session_clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0")
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    instance: String,
    online: usize,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    search: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.config.instance_name.clone(),
        online: state.hub.online_count().await,
    })
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let username = Username::parse(&req.username)?;

    if state.hub.is_connected(&username).await {
        return Err(ServerError::AdmissionConflict(username));
    }

    // One session per user; a fresh login replaces older ones.
    state.sessions.delete_for(&username).await;
    let session_id = state.sessions.create(username.clone()).await;

    info!(user = %username, "User logged in");

    Ok((
        [(header::SET_COOKIE, session_set_cookie(&session_id, &state.config))],
        Json(UserSummary {
            username,
            online: false,
        }),
    ))
}

async fn logout(State(state): State<AppState>, auth: AuthUser) -> impl IntoResponse {
    state.hub.disconnect(auth.username.clone()).await;
    state.sessions.delete(&auth.session_id).await;

    info!(user = %auth.username, "User logged out");

    (
        StatusCode::OK,
        [(header::SET_COOKIE, session_clear_cookie())],
    )
}

async fn me(State(state): State<AppState>, auth: AuthUser) -> Json<UserSummary> {
    let online = state
        .hub
        .presence(&auth.username)
        .await
        .map(|p| p.online)
        .unwrap_or(false);

    Json(UserSummary {
        username: auth.username,
        online,
    })
}

async fn search_users(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<SearchParams>,
) -> Json<Vec<UserSummary>> {
    Json(
        state
            .hub
            .search_identities(&params.search, &auth.username)
            .await,
    )
}

async fn list_conversations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Json<Vec<ConversationSummary>> {
    Json(state.hub.list_conversations(&auth.username).await)
}

async fn get_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(peer): Path<String>,
) -> Result<Json<Vec<OutboundMessage>>, ServerError> {
    let peer = Username::parse(&peer)?;
    let messages = state
        .hub
        .conversation(&auth.username, &peer)
        .await
        .iter()
        .map(|m| m.to_wire())
        .collect();
    Ok(Json(messages))
}

/// Admission for the chat socket: a user with a live connection is refused
/// before the upgrade. The hub still evicts on register for the race
/// between this check and registration.
async fn ws_connect(
    State(state): State<AppState>,
    auth: AuthUser,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, Response> {
    let username = auth.username;

    if state.hub.is_connected(&username).await {
        return Err(ServerError::AdmissionConflict(username).into_response());
    }

    let ws = ws.map_err(IntoResponse::into_response)?;
    let settings = PumpSettings::from(state.config.as_ref());
    let hub = state.hub.clone();

    info!(user = %username, "Upgrading chat connection");

    Ok(ws
        .max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| client::serve(socket, hub, username, settings)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
