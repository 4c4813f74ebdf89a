//! Configuration types for lattice-agent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Agent / multiplexer configuration.
    pub agent: AgentConfig,

    /// Local DNS server configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// How the agent authenticates to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// Plain TCP, no credentials. Developer setups only.
    None,
    /// TLS with workload certificates, falling back to a bearer token
    /// while provisioned certs are absent.
    MutualTls,
}

/// Configuration for the XDS multiplexer and its upstream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control-plane discovery address (`host:port`).
    pub upstream_address: String,

    /// Cluster this workload belongs to; sent as stream metadata.
    #[serde(default)]
    pub cluster_id: String,

    /// Control-plane authentication policy.
    #[serde(default = "default_auth_policy")]
    pub auth_policy: AuthPolicy,

    /// Root CA bundle used to verify the control plane.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Provisioned client certificate chain.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,

    /// Provisioned client private key.
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    /// Bearer token file, re-read on every RPC.
    #[serde(default)]
    pub token_path: Option<PathBuf>,

    /// Extra metadata headers attached to the upstream stream.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Unix socket the data-plane proxy dials for discovery.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

/// Local DNS server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Whether the local DNS resolver is enabled. When disabled the agent
    /// is a pure relay and name-table pushes are acknowledged but ignored.
    #[serde(default = "default_dns_enabled")]
    pub enabled: bool,

    /// Loopback address for the UDP and TCP listeners. Port 0 binds an
    /// ephemeral port (used by tests).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// The namespace this workload runs in; determines which short names
    /// resolve without qualification.
    #[serde(default)]
    pub proxy_namespace: String,

    /// The cluster DNS domain (e.g. `svc.cluster.local`), used to derive
    /// alternate hosts for registry entries.
    #[serde(default)]
    pub proxy_domain: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_dns_enabled(),
            listen_addr: default_listen_addr(),
            proxy_namespace: String::new(),
            proxy_domain: String::new(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g. "info", "lattice_agent=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_auth_policy() -> AuthPolicy {
    AuthPolicy::MutualTls
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("./etc/lattice/proxy/XDS")
}

fn default_dns_enabled() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:53".parse().expect("valid literal address")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_policy_deserializes_snake_case() {
        let policy: AuthPolicy = serde_json::from_str("\"mutual_tls\"").unwrap();
        assert_eq!(policy, AuthPolicy::MutualTls);
        let policy: AuthPolicy = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(policy, AuthPolicy::None);
    }

    #[test]
    fn dns_config_defaults() {
        let cfg = DnsConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.listen_addr.port(), 53);
        assert!(cfg.listen_addr.ip().is_loopback());
    }
}
