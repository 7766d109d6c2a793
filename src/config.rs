use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::errors::{Result, config_error};

const DEFAULT_ADSB_BASE_URL: &str = "https://api.adsb.one/v2";
const DEFAULT_OPENSKY_BASE_URL: &str = "https://opensky-network.org/api";
const DEFAULT_OPENSKY_TOKEN_URL: &str =
    "https://auth.opensky-network.org/auth/realms/opensky-network/protocol/openid-connect/token";
const DEFAULT_ALLOWED_ORIGINS: &str = "https://aeroecho.onrender.com,http://localhost:3000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    AdsbOne,
    OpenSky,
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adsbone" | "adsb.one" | "adsb" => Ok(Provider::AdsbOne),
            "opensky" => Ok(Provider::OpenSky),
            other => Err(format!("unknown upstream provider '{other}'")),
        }
    }
}

/// Fixed geographic query every poll cycle asks the upstream for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryArea {
    pub lat: f64,
    pub lon: f64,
    pub radius_nm: f64,
}

impl QueryArea {
    /// Bounding box `(lamin, lamax, lomin, lomax)` enclosing the query circle.
    /// One nautical mile is one arc minute of latitude.
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        let dlat = self.radius_nm / 60.0;
        let cos_lat = self.lat.to_radians().cos().abs().max(0.01);
        let dlon = (dlat / cos_lat).min(180.0);

        (
            (self.lat - dlat).max(-90.0),
            (self.lat + dlat).min(90.0),
            (self.lon - dlon).max(-180.0),
            (self.lon + dlon).min(180.0),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenSkyCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub provider: Provider,
    pub adsb_base_url: String,
    pub opensky_base_url: String,
    pub opensky_token_url: String,
    pub opensky_credentials: Option<OpenSkyCredentials>,
    pub query: QueryArea,
    pub poll_interval: Duration,
    pub min_api_interval: Duration,
    pub request_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub stale_after: Duration,
    pub subscriber_queue: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider: Provider = try_load(&lookup, "UPSTREAM_PROVIDER", "adsbone")?;

        let opensky_credentials = match (lookup("OPENSKY_CLIENT_ID"), lookup("OPENSKY_CLIENT_SECRET")) {
            (Some(client_id), Some(client_secret)) if !client_id.is_empty() && !client_secret.is_empty() => {
                Some(OpenSkyCredentials { client_id, client_secret })
            }
            _ => None,
        };
        if provider == Provider::OpenSky && opensky_credentials.is_none() {
            return Err(config_error(
                "OPENSKY_CLIENT_ID and OPENSKY_CLIENT_SECRET are required for the opensky provider",
            ));
        }

        let query = QueryArea {
            lat: try_load(&lookup, "QUERY_LAT", "43.6532")?,
            lon: try_load(&lookup, "QUERY_LON", "-79.3832")?,
            radius_nm: try_load(&lookup, "QUERY_RADIUS_NM", "250")?,
        };
        if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lon) {
            return Err(config_error(format!("query point {},{} out of range", query.lat, query.lon)));
        }
        if !(query.radius_nm > 0.0) {
            return Err(config_error("QUERY_RADIUS_NM must be positive"));
        }

        let allowed_origins = load_or(&lookup, "ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let subscriber_queue: usize = try_load(&lookup, "SUBSCRIBER_QUEUE", "16")?;

        let poll_interval = Duration::from_millis(try_load(&lookup, "POLL_INTERVAL_MS", "2000")?);
        let min_api_interval = Duration::from_millis(try_load(&lookup, "MIN_API_INTERVAL_MS", "1000")?);
        let request_timeout = Duration::from_secs(try_load(&lookup, "REQUEST_TIMEOUT_SECS", "20")?);
        for (key, value) in [
            ("POLL_INTERVAL_MS", poll_interval),
            ("MIN_API_INTERVAL_MS", min_api_interval),
            ("REQUEST_TIMEOUT_SECS", request_timeout),
        ] {
            if value.is_zero() {
                return Err(config_error(format!("{key} must be greater than zero")));
            }
        }

        Ok(Config {
            bind_addr: load_or(&lookup, "BIND_ADDR", "0.0.0.0"),
            port: try_load(&lookup, "PORT", "3001")?,
            provider,
            adsb_base_url: load_or(&lookup, "ADSB_BASE_URL", DEFAULT_ADSB_BASE_URL),
            opensky_base_url: load_or(&lookup, "OPENSKY_BASE_URL", DEFAULT_OPENSKY_BASE_URL),
            opensky_token_url: load_or(&lookup, "OPENSKY_TOKEN_URL", DEFAULT_OPENSKY_TOKEN_URL),
            opensky_credentials,
            query,
            poll_interval,
            min_api_interval,
            request_timeout,
            allowed_origins,
            stale_after: Duration::from_secs(try_load(&lookup, "STALE_AFTER_SECS", "60")?),
            subscriber_queue: subscriber_queue.max(1),
        })
    }

    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins.iter().any(|o| o == origin)
    }
}

fn load_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    })
}

fn try_load<F, T>(lookup: &F, key: &str, default: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    load_or(lookup, key, default).trim().parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        config_error(format!("invalid {key}: {e}"))
    })
}
