//! Periodic URL monitoring.
//!
//! Each tick discovers the current tunnels, probes both public URLs, and
//! publishes them to DuckDNS. Only a fully successful tick replaces the
//! stored endpoints; failures are logged, emitted as events, and the loop
//! carries on at the next interval.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use tunnelsync_core::{Config, RetryPolicy};

use crate::discovery::{DiscoveryError, TunnelDiscoverer, TunnelEndpoints, TunnelSource};
use crate::dns::{DnsError, DnsPublisher, RecordPublisher};
use crate::events::{Event, EventBus};
use crate::probe::{EndpointProbe, HealthProber, HealthTarget};
use crate::retry::retry;

/// Why a monitoring tick failed.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Tunnel discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error(
        "Endpoint validation failed (frontend healthy: {frontend_healthy}, backend healthy: {backend_healthy})"
    )]
    Validation {
        frontend_healthy: bool,
        backend_healthy: bool,
    },

    #[error(transparent)]
    Dns(#[from] DnsError),
}

struct MonitorInner<S, P, R> {
    source: S,
    prober: P,
    publisher: R,
    events: EventBus,
    retry_policy: RetryPolicy,
    /// Last validated and published endpoints.
    urls: RwLock<TunnelEndpoints>,
    /// Held for the whole duration of a tick so ticks never overlap.
    tick_lock: tokio::sync::Mutex<()>,
}

impl<S, P, R> MonitorInner<S, P, R>
where
    S: TunnelSource,
    P: EndpointProbe,
    R: RecordPublisher,
{
    async fn tick(&self) -> Result<TunnelEndpoints, Arc<MonitorError>> {
        let _guard = self.tick_lock.lock().await;

        match self.run_steps().await {
            Ok(endpoints) => {
                *self.urls.write().unwrap_or_else(PoisonError::into_inner) = endpoints.clone();
                info!(
                    frontend = endpoints.frontend.as_deref().unwrap_or_default(),
                    backend = endpoints.backend.as_deref().unwrap_or_default(),
                    "Public URLs updated"
                );
                self.events.emit(&Event::UrlsUpdated(endpoints.clone()));
                Ok(endpoints)
            }
            Err(e) => {
                error!(error = %e, "URL monitoring tick failed");
                let e = Arc::new(e);
                self.events.emit(&Event::MonitoringError(Arc::clone(&e)));
                Err(e)
            }
        }
    }

    async fn run_steps(&self) -> Result<TunnelEndpoints, MonitorError> {
        let endpoints = retry(self.retry_policy, || self.source.discover()).await?;

        let (frontend_healthy, backend_healthy) = match (&endpoints.frontend, &endpoints.backend) {
            (Some(frontend), Some(backend)) => {
                self.prober
                    .probe_pair(frontend, backend, HealthTarget::Health)
                    .await
            }
            (frontend, backend) => (frontend.is_some(), backend.is_some()),
        };
        if !(frontend_healthy && backend_healthy) {
            return Err(MonitorError::Validation {
                frontend_healthy,
                backend_healthy,
            });
        }

        self.publisher.publish(&endpoints).await?;
        Ok(endpoints)
    }
}

struct PeriodicTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps the published URLs in sync with the live tunnels.
///
/// Stopped → Running → Stopped. One instance per process is expected; it is
/// constructed explicitly and shared by reference.
pub struct UrlMonitor<S = TunnelDiscoverer, P = HealthProber, R = DnsPublisher> {
    inner: Arc<MonitorInner<S, P, R>>,
    interval: Duration,
    task: Mutex<Option<PeriodicTask>>,
}

impl UrlMonitor {
    /// Build a monitor backed by the real broker, prober and DuckDNS.
    pub fn from_config(http: &reqwest::Client, config: &Config, events: EventBus) -> Self {
        Self::new(
            TunnelDiscoverer::from_config(http.clone(), config),
            HealthProber::new(http.clone(), config.timeouts.health_check()),
            DnsPublisher::new(http.clone(), config.duckdns.clone(), events.clone()),
            events,
            config.monitor_retry,
            config.timeouts.monitor_interval(),
        )
    }
}

impl<S, P, R> UrlMonitor<S, P, R>
where
    S: TunnelSource + 'static,
    P: EndpointProbe + 'static,
    R: RecordPublisher + 'static,
{
    pub fn new(
        source: S,
        prober: P,
        publisher: R,
        events: EventBus,
        retry_policy: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                source,
                prober,
                publisher,
                events,
                retry_policy,
                urls: RwLock::new(TunnelEndpoints::default()),
                tick_lock: tokio::sync::Mutex::new(()),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Run one tick immediately, then every `interval`.
    ///
    /// Calling `start` on a running monitor replaces its periodic task; there
    /// is never more than one.
    pub async fn start(&self) {
        self.stop();
        info!(interval_secs = self.interval.as_secs(), "Starting URL monitoring");

        // The outcome is already logged and emitted by the tick itself.
        let _ = self.inner.tick().await;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        let _ = inner.tick().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("URL monitoring task finished");
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(PeriodicTask { shutdown, handle });
        if let Some(previous) = previous {
            // A concurrent start() installed a task while our tick ran.
            let _ = previous.shutdown.send(true);
        }
    }

    /// Stop future ticks. An in-flight tick runs to completion. No-op when
    /// already stopped.
    pub fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            drop(task.handle);
            info!("URL monitoring stopped");
        }
    }

    /// Run a single tick now, outside the periodic schedule.
    pub async fn tick_now(&self) -> Result<TunnelEndpoints, Arc<MonitorError>> {
        self.inner.tick().await
    }

    /// Whether a periodic task is installed.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Snapshot of the last validated and published endpoints. Still
    /// readable after `stop`, but no longer refreshed.
    pub fn current_urls(&self) -> TunnelEndpoints {
        self.inner
            .urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }
}

impl<S, P, R> Drop for UrlMonitor<S, P, R> {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = task.shutdown.send(true);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;
    use crate::dns::DnsRecord;

    /// Returns the configured endpoints, or fails `failures_left` times first.
    struct FakeSource {
        endpoints: Mutex<TunnelEndpoints>,
        failures_left: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl FakeSource {
        fn new(endpoints: TunnelEndpoints) -> Self {
            Self {
                endpoints: Mutex::new(endpoints),
                failures_left: AtomicU32::new(0),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl TunnelSource for FakeSource {
        async fn discover(&self) -> Result<TunnelEndpoints, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DiscoveryError::Unreachable {
                    url: "http://localhost:4040/api/tunnels".into(),
                    reason: "connection refused".into(),
                });
            }
            Ok(self.endpoints.lock().unwrap().clone())
        }
    }

    /// Healthy unless the URL is listed as down.
    struct FakeHealth {
        down: Mutex<Vec<String>>,
    }

    impl FakeHealth {
        fn healthy() -> Self {
            Self {
                down: Mutex::new(Vec::new()),
            }
        }
    }

    impl EndpointProbe for FakeHealth {
        async fn probe(&self, url: &str, _target: HealthTarget) -> bool {
            !self.down.lock().unwrap().iter().any(|u| u == url)
        }
    }

    struct FakePublisher {
        calls: Arc<AtomicU32>,
        reject: AtomicBool,
    }

    impl FakePublisher {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicU32::new(0)),
                reject: AtomicBool::new(false),
            }
        }
    }

    impl RecordPublisher for FakePublisher {
        async fn publish(&self, endpoints: &TunnelEndpoints) -> Result<DnsRecord, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(DnsError::Publish("KO".into()));
            }
            Ok(DnsRecord::from_endpoints(endpoints))
        }
    }

    fn endpoints(frontend: &str, backend: &str) -> TunnelEndpoints {
        TunnelEndpoints::new(frontend, backend)
    }

    fn monitor(
        source: FakeSource,
        health: FakeHealth,
        publisher: FakePublisher,
        events: EventBus,
    ) -> UrlMonitor<FakeSource, FakeHealth, FakePublisher> {
        UrlMonitor::new(
            source,
            health,
            publisher,
            events,
            RetryPolicy::new(3, 10),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn successful_tick_stores_and_emits_endpoints() {
        let events = EventBus::new();
        let mut rx = events.subscribe_channel();
        let expected = endpoints("https://a.ngrok.io", "https://b.ngrok.io");
        let monitor = monitor(
            FakeSource::new(expected.clone()),
            FakeHealth::healthy(),
            FakePublisher::new(),
            events,
        );

        let urls = monitor.tick_now().await.unwrap();

        assert_eq!(urls, expected);
        assert_eq!(monitor.current_urls(), expected);
        match rx.recv().await {
            Some(Event::UrlsUpdated(urls)) => assert_eq!(urls, expected),
            other => panic!("expected UrlsUpdated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_health_check_skips_publish_and_keeps_previous_urls() {
        let events = EventBus::new();
        let first = endpoints("https://a.ngrok.io", "https://b.ngrok.io");
        let source = FakeSource::new(first.clone());
        let publisher = FakePublisher::new();
        let publish_calls = Arc::clone(&publisher.calls);
        let monitor = monitor(source, FakeHealth::healthy(), publisher, events.clone());

        monitor.tick_now().await.unwrap();
        assert_eq!(publish_calls.load(Ordering::SeqCst), 1);

        // Tunnels rotate, but the new backend is not healthy.
        let rotated = endpoints("https://c.ngrok.io", "https://d.ngrok.io");
        *monitor.inner.source.endpoints.lock().unwrap() = rotated;
        monitor
            .inner
            .prober
            .down
            .lock()
            .unwrap()
            .push("https://d.ngrok.io".into());

        let mut rx = events.subscribe_channel();
        let err = monitor.tick_now().await.unwrap_err();

        assert!(matches!(
            *err,
            MonitorError::Validation {
                frontend_healthy: true,
                backend_healthy: false
            }
        ));
        assert_eq!(publish_calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.current_urls(), first);
        assert!(matches!(rx.recv().await, Some(Event::MonitoringError(_))));
    }

    #[tokio::test]
    async fn publish_failure_keeps_previous_urls() {
        let publisher = FakePublisher::new();
        publisher.reject.store(true, Ordering::SeqCst);
        let monitor = monitor(
            FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io")),
            FakeHealth::healthy(),
            publisher,
            EventBus::new(),
        );

        let err = monitor.tick_now().await.unwrap_err();

        assert!(matches!(*err, MonitorError::Dns(DnsError::Publish(_))));
        assert_eq!(monitor.current_urls(), TunnelEndpoints::default());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_is_retried_within_a_tick() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        source.failures_left.store(2, Ordering::SeqCst);
        let discover_calls = Arc::clone(&source.calls);
        let monitor = monitor(source, FakeHealth::healthy(), FakePublisher::new(), EventBus::new());

        assert!(monitor.tick_now().await.is_ok());
        assert_eq!(discover_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_exhaustion_fails_the_tick() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        source.failures_left.store(10, Ordering::SeqCst);
        let publisher = FakePublisher::new();
        let publish_calls = Arc::clone(&publisher.calls);
        let monitor = monitor(source, FakeHealth::healthy(), publisher, EventBus::new());

        let err = monitor.tick_now().await.unwrap_err();

        assert!(matches!(*err, MonitorError::Discovery(_)));
        assert_eq!(publish_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_ticks_immediately_then_periodically() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        let discover_calls = Arc::clone(&source.calls);
        let monitor = monitor(source, FakeHealth::healthy(), FakePublisher::new(), EventBus::new());

        monitor.start().await;
        assert!(monitor.is_running());
        assert_eq!(discover_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(discover_calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(discover_calls.load(Ordering::SeqCst), 3);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_duplicate_timers() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        let discover_calls = Arc::clone(&source.calls);
        let monitor = monitor(source, FakeHealth::healthy(), FakePublisher::new(), EventBus::new());

        monitor.start().await;
        monitor.start().await;
        assert_eq!(discover_calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Only the second task is alive.
        assert_eq!(discover_calls.load(Ordering::SeqCst), 3);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_twice_is_harmless_and_halts_ticks() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        let discover_calls = Arc::clone(&source.calls);
        let monitor = monitor(source, FakeHealth::healthy(), FakePublisher::new(), EventBus::new());

        monitor.start().await;
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(discover_calls.load(Ordering::SeqCst), 1);
        // Last known URLs stay readable after stop.
        assert!(monitor.current_urls().is_complete());
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let monitor = monitor(
            FakeSource::new(TunnelEndpoints::default()),
            FakeHealth::healthy(),
            FakePublisher::new(),
            EventBus::new(),
        );
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_does_not_stop_the_loop() {
        let source = FakeSource::new(endpoints("https://a.ngrok.io", "https://b.ngrok.io"));
        // Exhaust the whole first tick's retry budget.
        source.failures_left.store(3, Ordering::SeqCst);
        let discover_calls = Arc::clone(&source.calls);
        let monitor = monitor(source, FakeHealth::healthy(), FakePublisher::new(), EventBus::new());

        monitor.start().await;
        assert_eq!(monitor.current_urls(), TunnelEndpoints::default());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(discover_calls.load(Ordering::SeqCst), 4);
        assert!(monitor.current_urls().is_complete());

        monitor.stop();
    }

    /// Takes one second per discovery and tracks how many run at once.
    /// Call `n` yields `https://f{n}.ngrok.io` and `https://b{n}.ngrok.io`.
    struct SlowSource {
        calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl SlowSource {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            }
        }
    }

    impl TunnelSource for SlowSource {
        async fn discover(&self) -> Result<TunnelEndpoints, DiscoveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(endpoints(
                &format!("https://f{n}.ngrok.io"),
                &format!("https://b{n}.ngrok.io"),
            ))
        }
    }

    fn slow_monitor(interval: Duration) -> UrlMonitor<SlowSource, FakeHealth, FakePublisher> {
        UrlMonitor::new(
            SlowSource::new(),
            FakeHealth::healthy(),
            FakePublisher::new(),
            EventBus::new(),
            RetryPolicy::new(1, 10),
            interval,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ticks_run_one_at_a_time() {
        let monitor = slow_monitor(Duration::from_secs(60));
        let start = Instant::now();

        let (first, second) = tokio::join!(monitor.tick_now(), monitor.tick_now());

        let (first, second) = (first.unwrap(), second.unwrap());
        assert_ne!(first, second);
        assert_eq!(monitor.inner.source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.inner.source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        // The stored pair comes from a single tick, never a mix of two.
        let stored = monitor.current_urls();
        assert!(stored == first || stored == second);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_tick_waits_for_periodic_tick() {
        let monitor = slow_monitor(Duration::from_secs(10));
        monitor.start().await;

        // Land in the middle of the first periodic tick.
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(monitor.inner.source.in_flight.load(Ordering::SeqCst), 1);

        let urls = monitor.tick_now().await.unwrap();

        assert_eq!(monitor.inner.source.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(urls, endpoints("https://f3.ngrok.io", "https://b3.ngrok.io"));
        assert_eq!(monitor.current_urls(), urls);

        monitor.stop();
    }
}
