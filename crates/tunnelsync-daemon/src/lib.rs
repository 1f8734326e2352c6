//! tunnelsync daemon library
//!
//! Keeps the public URLs of a local development stack reachable:
//! - Discovery of ngrok tunnels through the broker's introspection API
//! - Health probing of the discovered endpoints
//! - Publishing of the current URLs to DuckDNS as a TXT record
//! - Periodic monitoring with fixed-delay retries
//! - Supervision of the backend, frontend and ngrok processes

pub mod discovery;
pub mod dns;
pub mod events;
pub mod http;
pub mod monitor;
pub mod ports;
pub mod probe;
pub mod retry;
pub mod startup;
pub mod supervisor;

pub use discovery::{DiscoveryError, TunnelDiscoverer, TunnelEndpoints};
pub use dns::{DnsError, DnsPublisher, DnsRecord};
pub use events::{Event, EventBus, EventObserver};
pub use monitor::{MonitorError, UrlMonitor};
pub use probe::{HealthProber, HealthTarget};
pub use startup::{StartupCoordinator, StartupError, StartupStage};
pub use supervisor::{ProcessSpec, ProcessSupervisor, ServiceName, SupervisorError};
