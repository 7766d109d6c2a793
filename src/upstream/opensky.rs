use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aircraft::{AircraftState, BaroAltitude, METERS_TO_FEET, MPS_TO_KNOTS, is_valid_position, non_blank};
use crate::config::QueryArea;
use crate::errors::{Result, upstream_unavailable};

use super::{AircraftSource, TokenProvider, check_status};

#[derive(Debug, Deserialize)]
pub(crate) struct OpenSkyResponse {
    time: Option<i64>,
    states: Option<Vec<Vec<Value>>>,
}

/// Client for the OpenSky `states/all` bounding box query, authenticated with a bearer token.
pub struct OpenSkyClient {
    http: Client,
    url: String,
    tokens: TokenProvider,
}

impl OpenSkyClient {
    pub fn new(http: Client, base_url: &str, query: QueryArea, tokens: TokenProvider) -> Self {
        let (lamin, lamax, lomin, lomax) = query.bounding_box();
        let url = format!(
            "{}/states/all?lamin={}&lamax={}&lomin={}&lomax={}",
            base_url.trim_end_matches('/'),
            lamin,
            lamax,
            lomin,
            lomax
        );
        OpenSkyClient { http, url, tokens }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AircraftSource for OpenSkyClient {
    fn name(&self) -> &'static str {
        "opensky"
    }

    async fn fetch_aircraft(&self) -> Result<Vec<AircraftState>> {
        let token = self.tokens.bearer_token().await?;

        debug!("Fetching flights from OpenSky: {}", self.url);
        let resp = self
            .http
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| upstream_unavailable(format!("OpenSky request failed: {e}")))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            // next cycle starts with a fresh token
            warn!("OpenSky rejected bearer token, dropping it");
            self.tokens.invalidate().await;
        }

        let resp: OpenSkyResponse = check_status(resp, "OpenSky")
            .await?
            .json()
            .await
            .map_err(|e| upstream_unavailable(format!("OpenSky response not understood: {e}")))?;

        let aircraft = normalize(resp, Utc::now());
        info!("OpenSky returned {} positioned aircraft", aircraft.len());
        Ok(aircraft)
    }
}

pub(crate) fn normalize(resp: OpenSkyResponse, fetched_at: DateTime<Utc>) -> Vec<AircraftState> {
    let reference = resp.time.and_then(|t| DateTime::from_timestamp(t, 0)).unwrap_or(fetched_at);
    let states = match resp.states {
        Some(s) => s,
        None => return Vec::new(),
    };

    states.iter().filter_map(|state| from_state_vector(state, reference)).collect()
}

fn from_state_vector(state: &[Value], reference: DateTime<Utc>) -> Option<AircraftState> {
    let str_at = |i: usize| state.get(i).and_then(Value::as_str);
    let f64_at = |i: usize| state.get(i).and_then(Value::as_f64);

    let lon = f64_at(5)?;
    let lat = f64_at(6)?;
    if !is_valid_position(lat, lon) {
        return None;
    }

    let on_ground = state.get(8).and_then(Value::as_bool).unwrap_or(false);
    let altitude = if on_ground {
        Some(BaroAltitude::OnGround)
    } else {
        f64_at(7).map(|m| BaroAltitude::Feet((m * METERS_TO_FEET).round()))
    };

    let last_seen = state
        .get(4)
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(reference);

    Some(AircraftState {
        hex: non_blank(str_at(0)).map(str::to_string),
        callsign: non_blank(str_at(1)).map(str::to_string),
        registration: None,
        type_code: None,
        desc: None,
        lat,
        lon,
        track: f64_at(10),
        ground_speed: f64_at(9).map(|v| v * MPS_TO_KNOTS),
        altitude,
        last_seen,
    })
}
