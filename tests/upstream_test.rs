use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aeroecho::config::{OpenSkyCredentials, QueryArea};
use aeroecho::upstream::{AdsbOneClient, AircraftSource, OpenSkyClient, TokenProvider, http_client};
use aeroecho::{AeroEchoError, BaroAltitude};
use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

const QUERY: QueryArea = QueryArea { lat: 43.6532, lon: -79.3832, radius_nm: 250.0 };

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn credentials() -> OpenSkyCredentials {
    OpenSkyCredentials { client_id: "client".into(), client_secret: "secret".into() }
}

#[derive(Clone, Default)]
struct MockState {
    token_calls: Arc<AtomicUsize>,
    states_calls: Arc<AtomicUsize>,
}

async fn token(State(state): State<MockState>, Form(form): Form<Vec<(String, String)>>) -> impl IntoResponse {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    let grant = form.iter().any(|(k, v)| k == "grant_type" && v == "client_credentials");
    let secret = form.iter().any(|(k, v)| k == "client_secret" && v == "secret");
    if grant && secret {
        (StatusCode::OK, Json(json!({ "access_token": "tok-1", "expires_in": 1800 }))).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" }))).into_response()
    }
}

async fn states(State(state): State<MockState>, headers: HeaderMap) -> impl IntoResponse {
    state.states_calls.fetch_add(1, Ordering::SeqCst);
    let auth = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if auth != Some("Bearer tok-1") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({
        "time": 1700000000,
        "states": [
            ["c0ffee","ACA123 ","Canada",1699999999,1699999999,-79.4,43.7,10668.0,false,231.5,270.0,0.0,null,10700.0,"2000",false,0]
        ]
    }))
    .into_response()
}

#[tokio::test]
async fn test_adsbone_point_query() {
    let app = Router::new().route(
        "/v2/point/:lat/:lon/:radius",
        get(|| async {
            Json(json!({
                "ac": [
                    {"hex":"c0ffee","flight":"ACA123 ","alt_baro":35000,"gs":450.0,"track":270.0,"lat":43.7,"lon":-79.4,"seen":1.0},
                    {"hex":"b2b2b2","alt_baro":"ground","lat":43.68,"lon":-79.62}
                ],
                "now": 1700000000000u64
            }))
        }),
    );
    let addr = serve(app).await;

    let http = http_client(Duration::from_secs(5)).unwrap();
    let client = AdsbOneClient::new(http, &format!("http://{addr}/v2"), QUERY);
    let aircraft = client.fetch_aircraft().await.unwrap();

    assert_eq!(aircraft.len(), 2);
    assert_eq!(aircraft[0].callsign.as_deref(), Some("ACA123"));
    assert_eq!(aircraft[1].altitude, Some(BaroAltitude::OnGround));
}

#[tokio::test]
async fn test_adsbone_server_error() {
    let app = Router::new().route(
        "/v2/point/:lat/:lon/:radius",
        get(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
    );
    let addr = serve(app).await;

    let http = http_client(Duration::from_secs(5)).unwrap();
    let client = AdsbOneClient::new(http, &format!("http://{addr}/v2"), QUERY);
    match client.fetch_aircraft().await {
        Err(AeroEchoError::UpstreamUnavailable(msg)) => assert!(msg.contains("429")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_adsbone_unreachable() {
    // nothing listens on this port once the listener is dropped
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let http = http_client(Duration::from_secs(2)).unwrap();
    let client = AdsbOneClient::new(http, &format!("http://{addr}/v2"), QUERY);
    assert!(matches!(client.fetch_aircraft().await, Err(AeroEchoError::UpstreamUnavailable(_))));
}

#[tokio::test]
async fn test_opensky_reuses_token() {
    let state = MockState::default();
    let app = Router::new()
        .route("/token", post(token))
        .route("/api/states/all", get(states))
        .with_state(state.clone());
    let addr = serve(app).await;

    let http = http_client(Duration::from_secs(5)).unwrap();
    let tokens = TokenProvider::new(http.clone(), &format!("http://{addr}/token"), credentials());
    let client = OpenSkyClient::new(http, &format!("http://{addr}/api"), QUERY, tokens);

    let first = client.fetch_aircraft().await.unwrap();
    let second = client.fetch_aircraft().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].altitude, Some(BaroAltitude::Feet(35000.0)));
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.states_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_opensky_auth_failure() {
    let state = MockState::default();
    let app = Router::new()
        .route("/token", post(token))
        .route("/api/states/all", get(states))
        .with_state(state.clone());
    let addr = serve(app).await;

    let http = http_client(Duration::from_secs(5)).unwrap();
    let bad = OpenSkyCredentials { client_id: "client".into(), client_secret: "wrong".into() };
    let tokens = TokenProvider::new(http.clone(), &format!("http://{addr}/token"), bad);
    let client = OpenSkyClient::new(http, &format!("http://{addr}/api"), QUERY, tokens);

    assert!(matches!(client.fetch_aircraft().await, Err(AeroEchoError::AuthFailure(_))));
    // no states request without a token
    assert_eq!(state.states_calls.load(Ordering::SeqCst), 0);

    // failure is not cached, the next cycle asks again
    assert!(client.fetch_aircraft().await.is_err());
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_token_provider_caches() {
    let state = MockState::default();
    let app = Router::new().route("/token", post(token)).with_state(state.clone());
    let addr = serve(app).await;

    let http = http_client(Duration::from_secs(5)).unwrap();
    let tokens = TokenProvider::new(http, &format!("http://{addr}/token"), credentials());

    assert_eq!(tokens.bearer_token().await.unwrap(), "tok-1");
    assert_eq!(tokens.bearer_token().await.unwrap(), "tok-1");
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 1);

    tokens.invalidate().await;
    tokens.bearer_token().await.unwrap();
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 2);
}
