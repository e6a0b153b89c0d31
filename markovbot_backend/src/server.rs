use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::commands::{CommandContext, CommandRouter};
use crate::database::BotDatabase;
use crate::runtime::BackendRuntime;
use crate::simulator::{SimulatorEvent, SimulatorHandle, SimulatorStatus};

/// Operator id used for commands issued through the API.
pub const API_OPERATOR_ID: &str = "operator";

#[derive(Clone)]
pub struct ServerState {
    pub simulator: SimulatorHandle,
    pub db: Arc<BotDatabase>,
    pub router: Arc<CommandRouter>,
    pub auth: BackendAuthConfig,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnabledResponse {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelBody {
    pub channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    line: String,
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub replies: Vec<String>,
}

/// Serve the control API until `shutdown` fires. Simulator events from
/// `event_rx` are fanned out to every WebSocket subscriber.
pub async fn serve_backend(
    runtime: &BackendRuntime,
    event_rx: flume::Receiver<SimulatorEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = std::env::var("MARKOVBOT_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid MARKOVBOT_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        simulator: runtime.simulator.clone(),
        db: runtime.db.clone(),
        router: runtime.router.clone(),
        auth,
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    crate::telegram::spawn_telegram_bot(state.clone());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("MarkovBot backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/simulator/status", get(get_status))
        .route("/simulator/enabled", put(set_enabled))
        .route("/simulator/toggle", post(toggle_enabled))
        .route("/simulator/channel", get(get_channel).put(set_channel))
        .route("/commands", post(run_command))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<SimulatorEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let _ = ws_events.send(map_simulator_event(&event));
        }
    });
}

fn map_simulator_event(event: &SimulatorEvent) -> ApiEventEnvelope {
    let mut payload = serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(fields) = payload.as_object_mut() {
        fields.remove("type");
    }
    ApiEventEnvelope {
        event_type: event.event_type().to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("MARKOVBOT_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("MARKOVBOT_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "MARKOVBOT_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid MARKOVBOT_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(State(state): State<Arc<ServerState>>) -> Json<SimulatorStatus> {
    Json(state.simulator.status())
}

async fn set_enabled(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<EnabledResponse>, (StatusCode, String)> {
    if body.enabled {
        require_channel(&state)?;
    }
    let previous = state.simulator.switch.set(body.enabled);
    if previous != body.enabled {
        tracing::info!("Simulator {} via API", if body.enabled { "enabled" } else { "paused" });
    }
    Ok(Json(EnabledResponse {
        enabled: body.enabled,
    }))
}

async fn toggle_enabled(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<EnabledResponse>, (StatusCode, String)> {
    if !state.simulator.switch.is_on() {
        require_channel(&state)?;
    }
    let enabled = state.simulator.switch.toggle();
    tracing::info!("Simulator toggled via API (enabled: {})", enabled);
    Ok(Json(EnabledResponse { enabled }))
}

async fn get_channel(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ChannelBody>, (StatusCode, String)> {
    let channel_id = state
        .db
        .get_simulation_channel(&state.simulator.community_id())
        .map_err(internal_error)?;
    Ok(Json(ChannelBody { channel_id }))
}

async fn set_channel(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChannelBody>,
) -> Result<Json<ChannelBody>, (StatusCode, String)> {
    let Some(channel_id) = body
        .channel_id
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            "channel_id cannot be empty".to_string(),
        ));
    };
    state
        .db
        .set_simulation_channel(&state.simulator.community_id(), &channel_id)
        .map_err(internal_error)?;
    tracing::info!("Simulation channel set to {} via API", channel_id);
    Ok(Json(ChannelBody {
        channel_id: Some(channel_id),
    }))
}

async fn run_command(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, (StatusCode, String)> {
    let line = body.line.trim().to_string();
    if line.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "line cannot be empty".to_string()));
    }

    let community_id = state.simulator.community_id();
    let ctx = CommandContext {
        channel_id: body.channel_id.unwrap_or_else(|| API_OPERATOR_ID.to_string()),
        community_id,
        author_id: API_OPERATOR_ID.to_string(),
        author_name: API_OPERATOR_ID.to_string(),
        is_admin: true,
        members: None,
    };
    let router = state.router.clone();
    let replies = tokio::task::spawn_blocking(move || router.dispatch(&ctx, &line))
        .await
        .map_err(|e| internal_error(anyhow!("Command task failed: {}", e)))?;
    Ok(Json(CommandResponse { replies }))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn require_channel(state: &ServerState) -> Result<(), (StatusCode, String)> {
    let community_id = state.simulator.community_id();
    match state
        .db
        .get_simulation_channel(&community_id)
        .map_err(internal_error)?
    {
        Some(_) => Ok(()),
        None => Err((
            StatusCode::CONFLICT,
            format!("No simulation channel set for community {}", community_id),
        )),
    }
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use crate::simulator::{SimPhase, SimulationSwitch};

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        assert!(authorize(
            &HeaderMap::new(),
            &BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            }
        )
        .is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some(" Disabled ".to_string())).unwrap(),
            AuthMode::Disabled
        );
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn simulator_events_map_to_envelopes() {
        let envelope = map_simulator_event(&SimulatorEvent::StateChanged {
            phase: SimPhase::Pacing,
            enabled: true,
        });
        assert_eq!(envelope.event_type, "state_changed");
        assert_eq!(envelope.payload["phase"], "pacing");
        assert!(envelope.payload.get("type").is_none());
        assert!(envelope.emitted_at <= Utc::now());
    }

    fn state_with_channel(channel: Option<&str>) -> ServerState {
        let db = Arc::new(BotDatabase::in_memory().unwrap());
        if let Some(channel) = channel {
            db.set_simulation_channel("guild", channel).unwrap();
        }
        let names = Arc::new(crate::corpus::NameDirectory::default());
        let router = CommandRouter::new(
            crate::commands::CommandSettings::default(),
            db.clone(),
            Arc::new(crate::corpus::CorpusStore::new("models", "messages")),
            names.clone(),
            Arc::new(crate::corpus::ServerDirectory::default()),
            Arc::new(crate::roster::DirectoryRoster::new(&names, &[])),
        );
        let (ws_events, _) = broadcast::channel(8);
        ServerState {
            simulator: SimulatorHandle::detached("guild", SimulationSwitch::new(false)),
            db,
            router: Arc::new(router),
            auth: BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
            ws_events,
        }
    }

    #[tokio::test]
    async fn enabling_without_channel_conflicts() {
        let state = Arc::new(state_with_channel(None));
        let result = set_enabled(State(state.clone()), Json(SetEnabledRequest { enabled: true })).await;
        assert_eq!(result.unwrap_err().0, StatusCode::CONFLICT);
        assert!(!state.simulator.switch.is_on());
    }

    #[tokio::test]
    async fn toggle_flips_switch_when_channel_is_set() {
        let state = Arc::new(state_with_channel(Some("chan")));
        let Json(response) = toggle_enabled(State(state.clone())).await.unwrap();
        assert!(response.enabled);
        let Json(response) = toggle_enabled(State(state.clone())).await.unwrap();
        assert!(!response.enabled);
    }

    #[tokio::test]
    async fn commands_run_as_admin_operator() {
        let state = Arc::new(state_with_channel(Some("chan")));
        let Json(response) = run_command(
            State(state.clone()),
            Json(CommandRequest {
                line: "$listchannels".to_string(),
                channel_id: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            response.replies,
            vec!["Whitelist: (none)\nBlacklist: (none)\nSimulation: <#chan>".to_string()]
        );
    }
}
