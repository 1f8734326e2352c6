//! Process-wide notifications.
//!
//! Components publish [`Event`]s on a shared [`EventBus`]; observers are
//! invoked synchronously in registration order.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::discovery::TunnelEndpoints;
use crate::dns::DnsRecord;
use crate::monitor::MonitorError;
use crate::startup::StartupError;

/// Something observable happened.
#[derive(Debug, Clone)]
pub enum Event {
    /// A monitoring tick validated and published a fresh pair of URLs.
    UrlsUpdated(TunnelEndpoints),
    /// A monitoring tick failed. The loop keeps running.
    MonitoringError(Arc<MonitorError>),
    /// DuckDNS acknowledged a TXT record update.
    DuckDnsUpdated(DnsRecord),
    /// Startup completed and every service is up.
    ServicesStarted,
    /// All supervised services were stopped.
    ServicesStopped,
    /// Startup failed; cleanup has been performed.
    StartupError(Arc<StartupError>),
}

impl Event {
    /// Stable kebab-case name, used in log lines.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UrlsUpdated(_) => "urls-updated",
            Self::MonitoringError(_) => "monitoring-error",
            Self::DuckDnsUpdated(_) => "duckdns-updated",
            Self::ServicesStarted => "services-started",
            Self::ServicesStopped => "services-stopped",
            Self::StartupError(_) => "startup-error",
        }
    }
}

/// Receives events from an [`EventBus`].
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Forwards events into an unbounded channel.
struct ChannelObserver {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &Event) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Shared observer registry. Cloning yields a handle to the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Arc<dyn EventObserver>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It sees every event emitted after this call.
    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Register a channel-backed observer and return its receiving end.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    /// Deliver `event` to every observer, in registration order.
    pub fn emit(&self, event: &Event) {
        debug!(event = event.name(), "Emitting event");
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.on_event(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}
