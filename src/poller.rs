use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::cache::{FlightCache, FlightSnapshot};
use crate::errors::Result;
use crate::upstream::AircraftSource;

/// Lowest upstream call spacing the provider tolerates, whatever the configuration says.
pub const MIN_API_FLOOR: Duration = Duration::from_millis(1000);

/// Enforces a minimum spacing between the starts of consecutive upstream calls.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        RateLimiter { min_interval, last_call: tokio::sync::Mutex::new(None) }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleeps off whatever is left of the minimum interval, then records the call start.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollFailure {
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// What the poller tells the rest of the system after each cycle.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Refreshed(Arc<FlightSnapshot>),
    Failed(PollFailure),
}

#[derive(Default)]
pub struct PollerStats {
    successes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    last_success: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<PollFailure>>,
}

impl PollerStats {
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success.lock().ok().and_then(|guard| *guard)
    }

    pub fn last_error(&self) -> Option<PollFailure> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_success(&self, at: DateTime<Utc>) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_success.lock() {
            *guard = Some(at);
        }
    }

    fn record_failure(&self, failure: &PollFailure) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(failure.clone());
        }
    }
}

/// Periodically refreshes the [`FlightCache`] from an [`AircraftSource`].
///
/// The poller is either idle or fetching. A tick that arrives while a fetch is still in flight
/// is dropped, so there is never more than one upstream call at a time and no backlog builds up.
/// A failed fetch leaves the cache untouched.
pub struct Poller {
    source: Arc<dyn AircraftSource>,
    cache: FlightCache,
    events: broadcast::Sender<PollEvent>,
    limiter: RateLimiter,
    interval: Duration,
    fetching: AtomicBool,
    running: AtomicBool,
    stats: PollerStats,
}

impl Poller {
    pub fn new(
        source: Arc<dyn AircraftSource>,
        cache: FlightCache,
        events: broadcast::Sender<PollEvent>,
        poll_interval: Duration,
        min_api_interval: Duration,
    ) -> Self {
        let min_api_interval = if min_api_interval < MIN_API_FLOOR {
            warn!(
                "minimum API interval {:?} is below the provider floor, using {:?}",
                min_api_interval, MIN_API_FLOOR
            );
            MIN_API_FLOOR
        } else {
            min_api_interval
        };

        let interval = if poll_interval < min_api_interval {
            warn!(
                "poll interval {:?} is below the upstream rate limit, using {:?}",
                poll_interval, min_api_interval
            );
            min_api_interval
        } else {
            poll_interval
        };

        Poller {
            source,
            cache,
            events,
            limiter: RateLimiter::new(min_api_interval),
            interval,
            fetching: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: PollerStats::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn min_api_interval(&self) -> Duration {
        self.limiter.min_interval()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Start ticking. The first tick fires right away.
    pub fn start(self: Arc<Self>) -> PollerHandle {
        info!("Starting flight updates from {} every {:?}", self.source.name(), self.interval);
        self.running.store(true, Ordering::Release);

        let poller = self.clone();
        let ticker = tokio::spawn(async move {
            let mut ticks = interval(poller.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticks.tick().await;
                poller.clone().on_tick();
            }
        });

        PollerHandle { poller: self, ticker }
    }

    /// Spawn a poll cycle unless one is still in flight. Returns whether a cycle was started.
    pub fn on_tick(self: Arc<Self>) -> bool {
        if self.fetching.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Update already in progress, skipping tick");
            return false;
        }

        tokio::spawn(async move {
            let _idle = IdleOnDrop(&self.fetching);
            let _ = self.poll_once().await;
        });
        true
    }

    /// One poll cycle: wait for the rate limiter, fetch, then either replace the cache or report.
    /// This does not check the idle/fetching state, callers other than [`Poller::on_tick`] must
    /// not run it concurrently with the ticker.
    pub async fn poll_once(&self) -> Result<Arc<FlightSnapshot>> {
        self.limiter.wait().await;

        let start = Instant::now();
        match self.source.fetch_aircraft().await {
            Ok(aircraft) => {
                let snapshot = self.cache.replace_all(aircraft);
                self.stats.record_success(snapshot.updated_at.unwrap_or_else(Utc::now));
                info!("Flight cache refreshed: {} aircraft (fetch={:?})", snapshot.len(), start.elapsed());

                let _ = self.events.send(PollEvent::Refreshed(snapshot.clone())); // no receivers is fine
                Ok(snapshot)
            }
            Err(e) => {
                error!("Error updating flights from {}: {} (took {:?})", self.source.name(), e, start.elapsed());
                let failure = PollFailure { error: e.to_string(), timestamp: Utc::now() };
                self.stats.record_failure(&failure);

                let _ = self.events.send(PollEvent::Failed(failure));
                Err(e)
            }
        }
    }
}

struct IdleOnDrop<'a>(&'a AtomicBool);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PollerHandle {
    poller: Arc<Poller>,
    ticker: JoinHandle<()>,
}

impl PollerHandle {
    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Cancel the ticker. A cycle already in flight runs to completion (or to its transport deadline).
    pub fn stop(self) {
        self.ticker.abort();
        self.poller.running.store(false, Ordering::Release);
        info!("Stopped flight updates");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::AircraftState;
    use crate::errors::upstream_unavailable;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeSource {
        delay: Duration,
        fail: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl FakeSource {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(FakeSource {
                delay,
                fail: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
            })
        }

        fn starts(&self) -> Vec<Instant> {
            self.starts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AircraftSource for FakeSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_aircraft(&self) -> Result<Vec<AircraftState>> {
            self.starts.lock().unwrap().push(Instant::now());
            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);

            sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                Err(upstream_unavailable("503 from fake"))
            } else {
                Ok(vec![AircraftState::at("A1", 43.7, -79.4)])
            }
        }
    }

    fn poller_for(source: Arc<FakeSource>, poll: u64, min: u64) -> (Arc<Poller>, FlightCache, broadcast::Receiver<PollEvent>) {
        let cache = FlightCache::new();
        let (tx, rx) = broadcast::channel(64);
        let poller = Poller::new(source, cache.clone(), tx, Duration::from_millis(poll), Duration::from_millis(min));
        (Arc::new(poller), cache, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spacing() {
        let limiter = RateLimiter::new(Duration::from_millis(1000));
        let t0 = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(t0.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_no_wait_when_idle_long_enough() {
        let limiter = RateLimiter::new(Duration::from_millis(1000));
        limiter.wait().await;
        sleep(Duration::from_millis(1500)).await;

        let t0 = Instant::now();
        limiter.wait().await;
        assert_eq!(t0.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_interval_is_clamped() {
        let (poller, _, _) = poller_for(FakeSource::new(Duration::ZERO), 200, 1000);
        assert_eq!(poller.interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_min_api_interval_has_a_floor() {
        let (poller, _, _) = poller_for(FakeSource::new(Duration::ZERO), 0, 0);
        assert_eq!(poller.min_api_interval(), MIN_API_FLOOR);
        assert_eq!(poller.interval(), MIN_API_FLOOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_configured_spacing_still_respects_floor() {
        let source = FakeSource::new(Duration::from_millis(10));
        let (poller, _, _) = poller_for(source.clone(), 100, 100);

        let handle = poller.clone().start();
        sleep(Duration::from_millis(1050)).await;
        handle.stop();

        let starts = source.starts();
        assert_eq!(starts.len(), 2);
        assert!(starts[1] - starts[0] >= MIN_API_FLOOR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_fetches_in_flight() {
        // each fetch outlives several ticks
        let source = FakeSource::new(Duration::from_millis(2500));
        let (poller, _, _) = poller_for(source.clone(), 1000, 1000);

        let handle = poller.clone().start();
        sleep(Duration::from_secs(12)).await;
        handle.stop();

        assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(poller.stats().skipped() > 0);
        assert!(poller.stats().successes() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_starts_respect_min_spacing() {
        let source = FakeSource::new(Duration::from_millis(10));
        let (poller, _, _) = poller_for(source.clone(), 1000, 1000);

        // back to back cycles, as a manual trigger next to the ticker would produce
        for _ in 0..4 {
            let _ = poller.poll_once().await;
        }

        let starts = source.starts();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_cache() {
        let source = FakeSource::new(Duration::from_millis(10));
        let (poller, cache, mut events) = poller_for(source.clone(), 1000, 1000);

        poller.poll_once().await.unwrap();
        let before = cache.snapshot();
        assert!(matches!(events.recv().await.unwrap(), PollEvent::Refreshed(_)));

        source.fail.store(true, Ordering::SeqCst);
        assert!(poller.poll_once().await.is_err());

        let after = cache.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.len(), 1);
        assert_eq!(poller.stats().failures(), 1);
        assert!(poller.stats().last_error().unwrap().error.contains("503"));

        match events.recv().await.unwrap() {
            PollEvent::Failed(failure) => assert!(failure.error.contains("upstream unavailable")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_ticking() {
        let source = FakeSource::new(Duration::from_millis(10));
        source.fail.store(true, Ordering::SeqCst);
        let (poller, cache, _) = poller_for(source.clone(), 1000, 1000);

        let handle = poller.clone().start();
        sleep(Duration::from_millis(3500)).await;
        assert!(poller.stats().failures() >= 3);
        assert!(cache.snapshot().is_empty());

        source.fail.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(1500)).await;
        handle.stop();

        assert_eq!(cache.snapshot().len(), 1);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_while_fetching() {
        let source = FakeSource::new(Duration::from_millis(5000));
        let (poller, _, _) = poller_for(source.clone(), 1000, 1000);

        assert!(poller.clone().on_tick());
        tokio::task::yield_now().await;
        assert!(poller.is_fetching());
        assert!(!poller.clone().on_tick());
        assert_eq!(poller.stats().skipped(), 1);

        sleep(Duration::from_millis(5100)).await;
        assert!(!poller.is_fetching());
        assert!(poller.clone().on_tick());
    }
}
