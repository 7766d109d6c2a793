use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::aircraft::{AircraftState, BaroAltitude, RawAltitude, is_valid_position, non_blank_owned};
use crate::config::QueryArea;
use crate::errors::{Result, upstream_unavailable};

use super::{AircraftSource, check_status};

/// Larger `seen` ages are bogus and treated as just seen.
const MAX_SEEN_SECS: f64 = 86_400.0;

#[derive(Debug, Deserialize)]
pub(crate) struct AdsbOneResponse {
    #[serde(default)]
    ac: Vec<AdsbOneAircraft>,
    /// server time in epoch millis
    now: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AdsbOneAircraft {
    hex: Option<String>,
    flight: Option<String>,
    r: Option<String>,
    t: Option<String>,
    desc: Option<String>,
    alt_baro: Option<RawAltitude>,
    gs: Option<f64>,
    track: Option<f64>,
    true_heading: Option<f64>,
    nav_heading: Option<f64>,
    lat: Option<f64>,
    lon: Option<f64>,
    seen: Option<f64>,
}

/// Client for the adsb.one v2 `point` query: all aircraft within a radius around a point.
pub struct AdsbOneClient {
    http: Client,
    url: String,
}

impl AdsbOneClient {
    pub fn new(http: Client, base_url: &str, query: QueryArea) -> Self {
        let url = format!(
            "{}/point/{}/{}/{}",
            base_url.trim_end_matches('/'),
            query.lat,
            query.lon,
            query.radius_nm
        );
        AdsbOneClient { http, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AircraftSource for AdsbOneClient {
    fn name(&self) -> &'static str {
        "adsb.one"
    }

    async fn fetch_aircraft(&self) -> Result<Vec<AircraftState>> {
        debug!("Fetching flights from adsb.one: {}", self.url);
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| upstream_unavailable(format!("adsb.one request failed: {e}")))?;

        let resp: AdsbOneResponse = check_status(resp, "adsb.one")
            .await?
            .json()
            .await
            .map_err(|e| upstream_unavailable(format!("adsb.one response not understood: {e}")))?;

        let total = resp.ac.len();
        let aircraft = normalize(resp, Utc::now());
        info!("adsb.one returned {} aircraft ({} positioned)", total, aircraft.len());
        Ok(aircraft)
    }
}

pub(crate) fn normalize(resp: AdsbOneResponse, fetched_at: DateTime<Utc>) -> Vec<AircraftState> {
    let reference = resp
        .now
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
        .unwrap_or(fetched_at);

    resp.ac
        .into_iter()
        .filter_map(|ac| {
            let (lat, lon) = match (ac.lat, ac.lon) {
                (Some(lat), Some(lon)) if is_valid_position(lat, lon) => (lat, lon),
                _ => return None,
            };

            let seen_ms = ac
                .seen
                .filter(|s| s.is_finite() && (0.0..=MAX_SEEN_SECS).contains(s))
                .map(|s| (s * 1000.0) as i64)
                .unwrap_or(0);
            let last_seen = reference
                .checked_sub_signed(chrono::Duration::milliseconds(seen_ms))
                .unwrap_or(reference);

            Some(AircraftState {
                hex: non_blank_owned(ac.hex),
                callsign: non_blank_owned(ac.flight),
                registration: non_blank_owned(ac.r),
                type_code: non_blank_owned(ac.t),
                desc: non_blank_owned(ac.desc),
                lat,
                lon,
                track: ac.track.or(ac.true_heading).or(ac.nav_heading),
                ground_speed: ac.gs,
                altitude: ac.alt_baro.and_then(|raw| BaroAltitude::try_from(raw).ok()),
                last_seen,
            })
        })
        .collect()
}
