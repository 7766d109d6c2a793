use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::aircraft::AircraftState;

/// One complete poll result. Snapshots are immutable once published.
#[derive(Debug, Clone, Default)]
pub struct FlightSnapshot {
    pub aircraft: Vec<AircraftState>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlightSnapshot {
    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AircraftState> {
        let key_lc = key.to_ascii_lowercase();
        self.aircraft.iter().find(|ac| {
            let k = ac.key();
            k == key || k == key_lc
        })
    }

    pub fn is_stale(&self, key: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.get(key) {
            Some(ac) => is_older_than(ac, max_age, now),
            None => true,
        }
    }

    pub fn stale_keys(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        self.aircraft.iter().filter(|ac| is_older_than(ac, max_age, now)).map(AircraftState::key).collect()
    }
}

fn is_older_than(ac: &AircraftState, max_age: Duration, now: DateTime<Utc>) -> bool {
    match (now - ac.last_seen).to_std() {
        Ok(age) => age > max_age,
        Err(_) => false, // last_seen in the future
    }
}

/// Process-wide store of the latest snapshot. Cloning gives another handle to the same store.
///
/// Replacement swaps the whole snapshot so readers never observe a partial write.
#[derive(Clone)]
pub struct FlightCache {
    tx: Arc<watch::Sender<Arc<FlightSnapshot>>>,
}

impl FlightCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(FlightSnapshot::default()));
        FlightCache { tx: Arc::new(tx) }
    }

    pub fn replace_all(&self, aircraft: Vec<AircraftState>) -> Arc<FlightSnapshot> {
        let snapshot = Arc::new(FlightSnapshot { aircraft, updated_at: Some(Utc::now()) });
        self.tx.send_replace(snapshot.clone());
        snapshot
    }

    pub fn snapshot(&self) -> Arc<FlightSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn get_all(&self) -> Vec<AircraftState> {
        self.snapshot().aircraft.clone()
    }
}

impl Default for FlightCache {
    fn default() -> Self {
        Self::new()
    }
}
