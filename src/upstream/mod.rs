use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};

use crate::aircraft::AircraftState;
use crate::config::{Config, Provider};
use crate::errors::{Result, config_error, upstream_unavailable};

pub mod adsbone;
pub mod opensky;
pub mod token;

pub use adsbone::AdsbOneClient;
pub use opensky::OpenSkyClient;
pub use token::TokenProvider;

pub const USER_AGENT: &str = concat!("AeroEcho/", env!("CARGO_PKG_VERSION"));

/// A provider of aircraft state snapshots for one fixed query.
///
/// Implementations issue exactly one upstream request per call and neither retry nor rate
/// limit, both are up to the caller (see [`crate::poller::Poller`]).
#[async_trait]
pub trait AircraftSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_aircraft(&self) -> Result<Vec<AircraftState>>;
}

pub fn source_from_config(config: &Config) -> Result<Arc<dyn AircraftSource>> {
    let http = http_client(config.request_timeout)?;

    match config.provider {
        Provider::AdsbOne => Ok(Arc::new(AdsbOneClient::new(http, &config.adsb_base_url, config.query))),
        Provider::OpenSky => {
            let credentials = config
                .opensky_credentials
                .clone()
                .ok_or_else(|| config_error("missing OpenSky client credentials"))?;
            let tokens = TokenProvider::new(http.clone(), &config.opensky_token_url, credentials);
            Ok(Arc::new(OpenSkyClient::new(http, &config.opensky_base_url, config.query, tokens)))
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| config_error(format!("cannot build HTTP client: {e}")))
}

/// Map non-2xx responses to `UpstreamUnavailable`, keeping a bit of the body for the log.
pub(crate) async fn check_status(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(200).collect();
    Err(upstream_unavailable(format!("{what} returned {status}: {excerpt}")))
}
