//! Live aircraft relay: polls an ADS-B provider at a bounded rate, keeps the latest snapshot
//! in memory and pushes each connected map client the aircraft inside its viewport.

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;

pub mod aircraft;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod errors;
pub mod poller;
pub mod server;
pub mod upstream;
pub mod viewport;

pub use aircraft::{AircraftState, BaroAltitude};
pub use broadcast::{Hub, ServerMessage};
pub use cache::{FlightCache, FlightSnapshot};
pub use config::Config;
pub use errors::{AeroEchoError, Result};
pub use poller::{PollEvent, Poller, PollerHandle};
pub use server::AppState;
pub use upstream::AircraftSource;
pub use viewport::{LatLng, Viewport, filter};

const POLL_EVENT_CAPACITY: usize = 16;

/// The running pieces of the service, wired together.
pub struct Services {
    pub state: AppState,
    pub poller: PollerHandle,
    pub relay: JoinHandle<()>,
}

impl Services {
    /// Build cache, hub and poller around `source` and start polling. Needs a tokio runtime.
    pub fn start(config: Config, source: Arc<dyn AircraftSource>) -> Self {
        let config = Arc::new(config);
        let cache = FlightCache::new();
        let hub = Arc::new(Hub::new(cache.clone(), config.subscriber_queue));

        let (events, relay_rx) = tokio::sync::broadcast::channel(POLL_EVENT_CAPACITY);
        let relay = broadcast::spawn_relay(hub.clone(), relay_rx);

        let poller = Arc::new(Poller::new(
            source,
            cache.clone(),
            events,
            config.poll_interval,
            config.min_api_interval,
        ));
        let handle = poller.clone().start();

        Services { state: AppState { config, cache, hub, poller }, poller: handle, relay }
    }

    pub fn router(&self) -> Router {
        server::router(self.state.clone())
    }

    pub fn stop(self) {
        self.poller.stop();
        self.relay.abort();
    }
}
