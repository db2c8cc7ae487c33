use anyhow::Result;
use axum::{
    body::Bytes,
    Json, Router,
    extract::{
        Query, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use lib_telemetry::core::ConnectionId;
use lib_telemetry::models::{ServerMessage, SubscriberId, Topic};
use lib_telemetry::utils::seconds_until;
use lib_telemetry::{FanoutError, Reading};

use crate::telemetry_logic::config::Config;
use crate::telemetry_logic::model::{ClientMessage, ErrorBody};
use crate::telemetry_logic::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/telemetry", post(ingest_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub async fn run(
    config: Config,
    app_state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    if let (Some(cert_path), Some(key_path)) = (config.tls_cert_path, config.tls_key_path) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            tracing::info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        tracing::info!("Downstream server listening on {} (TLS)", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Downstream server listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.recv().await.ok();
                tracing::info!("Downstream server shutting down.");
            })
            .await?;
    }
    Ok(())
}

/// Maps core errors to HTTP responses.
pub struct ApiError(pub FanoutError);

impl From<FanoutError> for ApiError {
    fn from(err: FanoutError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, retry_after) = match &self.0 {
            FanoutError::AdmissionDenied { retry_after, .. } => {
                (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after))
            }
            FanoutError::InvalidReading(_) => (StatusCode::BAD_REQUEST, None),
            FanoutError::BackingStoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let body = ErrorBody {
            error: self.0.to_string(),
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(at) = retry_after {
            let seconds = seconds_until(Utc::now(), at);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

async fn ingest_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Reading>, JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let Json(reading) = payload
        .map_err(|rejection| FanoutError::InvalidReading(rejection.body_text()))?;

    let receipt = state.core.ingestor.ingest(reading.clone()).await?;
    state.provider.observe(&reading);
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats())
}

#[derive(Debug, Deserialize)]
struct WsParams {
    subscriber_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let subscriber = SubscriberId::new(params.subscriber_id);
    if subscriber.is_blank() {
        return (StatusCode::BAD_REQUEST, "subscriber_id is required").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, subscriber))
}

fn parse_topics(raw: &[String]) -> (Vec<Topic>, Vec<String>) {
    let mut topics = Vec::new();
    let mut invalid = Vec::new();
    for item in raw {
        match item.parse::<Topic>() {
            Ok(topic) => topics.push(topic),
            Err(_) => invalid.push(item.clone()),
        }
    }
    (topics, invalid)
}

/// Applies one control frame and returns the replies for the client.
fn handle_client_message(state: &AppState, id: ConnectionId, text: &str) -> Vec<ServerMessage> {
    let request: ClientMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            return vec![ServerMessage::Error {
                message: format!("invalid request: {}", e),
            }];
        }
    };

    let registry = &state.core.registry;
    let mut replies = Vec::new();

    if let Some(raw) = request.subscribe {
        let (topics, invalid) = parse_topics(&raw);
        if !invalid.is_empty() {
            replies.push(ServerMessage::Error {
                message: format!("unknown topics: {}", invalid.join(", ")),
            });
        }
        match registry.subscribe(id, &topics) {
            Ok(accepted) => replies.push(ServerMessage::Subscribed { topics: accepted }),
            Err(e) => replies.push(ServerMessage::Error {
                message: e.to_string(),
            }),
        }
    }

    if let Some(raw) = request.unsubscribe {
        let (topics, _) = parse_topics(&raw);
        match registry.unsubscribe(id, &topics) {
            Ok(removed) => replies.push(ServerMessage::Unsubscribed { topics: removed }),
            Err(e) => replies.push(ServerMessage::Error {
                message: e.to_string(),
            }),
        }
    }

    replies
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to serialize reply: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, subscriber: SubscriberId) {
    let registry = state.core.registry.clone();
    let mut connection = registry.connect(&subscriber);
    let id = connection.id;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    'session: loop {
        tokio::select! {
            // Pongs to these pings keep passive clients from going stale
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            // Control frames from the client
            incoming = socket.next() => {
                let Some(Ok(msg)) = incoming else {
                    break; // client disconnected
                };
                registry.touch(id);
                match msg {
                    Message::Text(text) => {
                        for reply in handle_client_message(&state, id, text.as_str()) {
                            if !send_json(&mut socket, &reply).await {
                                break 'session;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            // Frames published to this connection's topics
            frame = connection.receiver.recv() => {
                let Some(frame) = frame else {
                    break; // evicted from the registry
                };
                if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break; // client disconnected
                }
            }
        }
    }

    registry.disconnect(id);
    tracing::info!("Client {} of {} disconnected", id, subscriber);
}
