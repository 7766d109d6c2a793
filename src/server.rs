use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::aircraft::AircraftState;
use crate::broadcast::Hub;
use crate::cache::FlightCache;
use crate::config::Config;
use crate::errors::{AeroEchoError, Result};
use crate::poller::{PollFailure, Poller};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: FlightCache,
    pub hub: Arc<Hub>,
    pub poller: Arc<Poller>,
}

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(index))
        .route("/api/v1/flights", get(get_all_flights))
        .route("/api/v1/flights/stats", get(get_stats))
        .route("/api/v1/flights/:id", get(get_flight))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring invalid allowed origin '{}'", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("accept-version"),
            header::AUTHORIZATION,
            HeaderName::from_static("credentials"),
            header::CONTENT_TYPE,
            HeaderName::from_static("baggage"),
        ])
        .allow_credentials(true)
}

async fn index() -> Html<&'static str> {
    Html("<h1>AeroEcho</h1><ul><li><a href='/api/v1/flights'>/api/v1/flights</a></li><li><a href='/api/v1/flights/stats'>/api/v1/flights/stats</a></li><li>/ws (live viewport feed)</li></ul>")
}

async fn get_all_flights(State(state): State<AppState>) -> Json<Vec<AircraftState>> {
    Json(state.cache.get_all())
}

async fn get_flight(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<AircraftState>> {
    state
        .cache
        .snapshot()
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| AeroEchoError::NotFound(format!("flight {id}")))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_flights: usize,
    pub stale_flights: usize,
    pub fresh_flights: usize,
    pub is_auto_updating: bool,
    pub is_updating: bool,
    pub subscribers: usize,
    pub poll_successes: u64,
    pub poll_failures: u64,
    pub skipped_ticks: u64,
    pub poll_interval_ms: u128,
    pub min_api_interval_ms: u128,
    pub last_updated: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<PollFailure>,
}

async fn get_stats(State(state): State<AppState>) -> Json<Stats> {
    let snapshot = state.cache.snapshot();
    let stale = snapshot.stale_keys(state.config.stale_after, Utc::now()).len();
    let stats = state.poller.stats();

    Json(Stats {
        total_flights: snapshot.len(),
        stale_flights: stale,
        fresh_flights: snapshot.len() - stale,
        is_auto_updating: state.poller.is_running(),
        is_updating: state.poller.is_fetching(),
        subscribers: state.hub.len(),
        poll_successes: stats.successes(),
        poll_failures: stats.failures(),
        skipped_ticks: stats.skipped(),
        poll_interval_ms: state.poller.interval().as_millis(),
        min_api_interval_ms: state.poller.min_api_interval().as_millis(),
        last_updated: snapshot.updated_at,
        last_error: stats.last_error(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    // browsers always send an Origin, other clients may not
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin.to_str().map(|o| state.config.is_origin_allowed(o)).unwrap_or(false);
        if !allowed {
            warn!("rejecting websocket from {} with origin {:?}", addr, origin);
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, addr, state.hub)).into_response()
}

async fn handle_socket(ws: WebSocket, remote_addr: SocketAddr, hub: Arc<Hub>) {
    let (id, mut outbound) = hub.subscribe(remote_addr);
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("connection {}: {}", id, e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("connection {}: websocket send failed: {}", id, e);
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                if let Err(e) = hub.handle_client_message(id, &text) {
                    warn!("connection {}: {}", id, e);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.unsubscribe(id);
    writer.abort();
}
