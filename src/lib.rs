//! lattice-agent - the per-workload sidecar core for the Lattice mesh.
//!
//! The agent multiplexes the data-plane proxy's discovery stream onto a
//! single upstream stream to the control plane (`latticed`), and intercepts
//! the name-table resource type to serve it locally as a DNS resolver.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        lattice-agent                           │
//! │                                                                │
//! │   data plane ──uds──▶ ┌────────────┐ ──grpc──▶ latticed        │
//! │   (discovery)         │ XdsProxy   │ ◀─────── (control plane)  │
//! │                       └─────┬──────┘                           │
//! │                             │ NameTable intercept              │
//! │                             ▼                                  │
//! │   apps ──udp/tcp:53──▶ ┌────────────┐    ┌──────────────┐      │
//! │   (DNS queries)        │ LocalDns   │───▶│ LookupTable  │      │
//! │                        │ Server     │    │ (atomic swap)│      │
//! │                        └─────┬──────┘    └──────────────┘      │
//! │                              │ miss                            │
//! │                              ▼                                 │
//! │                 system resolvers (/etc/resolv.conf)            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Known names are answered authoritatively from an immutable lookup-table
//! snapshot that is replaced wholesale on every name-table push; unknown
//! names fall through to the system resolvers.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use lattice_agent::{Agent, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = load_config();
//!     let stop = CancellationToken::new();
//!
//!     let agent = Agent::new(config).await.unwrap();
//!     agent.run(stop).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod agent;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod health;
pub mod metrics;
pub mod table;
pub mod telemetry;
pub mod watcher;
pub mod xds;

/// Generated discovery protocol types and service stubs.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("lattice.discovery.v1");
}

// Re-export main types
pub use agent::Agent;
pub use config::{AgentConfig, AuthPolicy, Config, DnsConfig, TelemetryConfig};
pub use dns::LocalDnsServer;
pub use error::AgentError;
pub use health::HealthEvent;
pub use xds::XdsProxy;
