//! Upstream dial configuration: transport security, keepalive, flow-control
//! windows, and the per-RPC auth metadata.
//!
//! The dialer is built once at agent start; every downstream session calls
//! [`UpstreamDialer::connect`] for a fresh channel. Credential material is
//! read from disk at each dial, so certificate rotations take effect as
//! soon as the next session comes up, without restarting the process.

use std::path::PathBuf;
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Request, Status};
use tracing::{debug, warn};

use crate::config::{AgentConfig, AuthPolicy};
use crate::error::AgentError;
use crate::proto::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_STREAM_WINDOW_SIZE: u32 = 1024 * 1024;
const INITIAL_CONN_WINDOW_SIZE: u32 = 1024 * 1024;
const MAX_RECEIVE_MESSAGE_SIZE: usize = i32::MAX as usize;

/// SNI override for developer port-forwards: a `localhost` upstream still
/// has to match the control plane's in-cluster certificate.
const LOCALHOST_SERVER_NAME: &str = "latticed.lattice-system.svc";

/// The discovery client type produced by the dialer.
pub type DiscoveryClient =
    AggregatedDiscoveryServiceClient<InterceptedService<Channel, AuthInterceptor>>;

/// Builds upstream channels and clients from the agent configuration.
#[derive(Clone)]
pub struct UpstreamDialer {
    address: String,
    server_name: String,
    auth_policy: AuthPolicy,
    ca_cert_path: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
    token_path: Option<PathBuf>,
    cluster_id: String,
    headers: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
}

impl UpstreamDialer {
    /// Validate the credential configuration and precompute what every dial
    /// needs.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let host = config
            .upstream_address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&config.upstream_address);
        let server_name = if host.contains("localhost") {
            LOCALHOST_SERVER_NAME.to_string()
        } else {
            host.to_string()
        };

        if config.auth_policy != AuthPolicy::None {
            if config.ca_cert_path.is_none() {
                return Err(AgentError::Config(
                    "control-plane TLS requires ca_cert_path".to_string(),
                ));
            }
            let has_certs =
                config.client_cert_path.is_some() && config.client_key_path.is_some();
            if !has_certs && config.token_path.is_none() {
                return Err(AgentError::Config(
                    "control-plane TLS requires provisioned certificates or a token file"
                        .to_string(),
                ));
            }
        }

        let mut headers = Vec::new();
        for (key, value) in &config.headers {
            let parsed_key = key.to_ascii_lowercase().parse::<MetadataKey<Ascii>>();
            let parsed_value = value.parse::<MetadataValue<Ascii>>();
            match (parsed_key, parsed_value) {
                (Ok(k), Ok(v)) => headers.push((k, v)),
                _ => warn!(header = %key, "skipping invalid upstream header"),
            }
        }

        Ok(Self {
            address: config.upstream_address.clone(),
            server_name,
            auth_policy: config.auth_policy,
            ca_cert_path: config.ca_cert_path.clone(),
            client_cert_path: config.client_cert_path.clone(),
            client_key_path: config.client_key_path.clone(),
            token_path: config.token_path.clone(),
            cluster_id: config.cluster_id.clone(),
            headers,
        })
    }

    /// The configured upstream address (for logging).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial the control plane. Completes (or fails) before the caller's
    /// relay loop starts; nothing else should proceed on a dead channel.
    pub async fn connect(&self) -> Result<Channel, AgentError> {
        let scheme = if self.auth_policy == AuthPolicy::None {
            "http"
        } else {
            "https"
        };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.address))?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true)
            .initial_stream_window_size(INITIAL_STREAM_WINDOW_SIZE)
            .initial_connection_window_size(INITIAL_CONN_WINDOW_SIZE);

        if self.auth_policy != AuthPolicy::None {
            endpoint = endpoint.tls_config(self.tls_config()?)?;
        }

        Ok(endpoint.connect().await?)
    }

    /// Wrap a dialed channel in the discovery client with auth metadata and
    /// the relay's oversized receive limit.
    pub fn client(&self, channel: Channel) -> DiscoveryClient {
        // Bearer-token auth only applies while no provisioned certificate
        // is on disk; once the cert shows up, mutual TLS carries identity.
        let token_path = if self.auth_policy != AuthPolicy::None && !self.provisioned_certs_present()
        {
            self.token_path.clone()
        } else {
            None
        };

        let interceptor = AuthInterceptor {
            cluster_id: self.cluster_id.clone(),
            headers: self.headers.clone(),
            token_path,
        };
        AggregatedDiscoveryServiceClient::with_interceptor(channel, interceptor)
            .max_decoding_message_size(MAX_RECEIVE_MESSAGE_SIZE)
    }

    fn provisioned_certs_present(&self) -> bool {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => cert.exists() && key.exists(),
            _ => false,
        }
    }

    /// TLS material is read fresh on every dial. rustls only negotiates
    /// TLS 1.2 and newer.
    fn tls_config(&self) -> Result<ClientTlsConfig, AgentError> {
        let ca_path = self
            .ca_cert_path
            .as_ref()
            .ok_or_else(|| AgentError::Config("ca_cert_path is required".to_string()))?;
        let ca_pem = std::fs::read(ca_path)?;

        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca_pem))
            .domain_name(self.server_name.clone());

        if let (Some(cert_path), Some(key_path)) =
            (&self.client_cert_path, &self.client_key_path)
        {
            // The cert may not be issued yet; until then the bearer token
            // carries identity.
            if cert_path.exists() && key_path.exists() {
                let cert_pem = std::fs::read(cert_path)?;
                let key_pem = std::fs::read(key_path)?;
                tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
            } else {
                debug!("provisioned certificates not present yet, using token auth");
            }
        }

        Ok(tls)
    }
}

/// Attaches cluster identity, configured headers, and (when applicable) a
/// file-backed bearer token to every upstream RPC. The token file is
/// re-read on each call so rotations are picked up immediately.
#[derive(Clone)]
pub struct AuthInterceptor {
    cluster_id: String,
    headers: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
    token_path: Option<PathBuf>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if !self.cluster_id.is_empty() {
            let value = MetadataValue::try_from(self.cluster_id.as_str())
                .map_err(|_| Status::invalid_argument("cluster id is not valid metadata"))?;
            request.metadata_mut().insert("clusterid", value);
        }

        for (key, value) in &self.headers {
            request.metadata_mut().insert(key.clone(), value.clone());
        }

        if let Some(path) = &self.token_path {
            let token = std::fs::read_to_string(path).map_err(|e| {
                Status::unauthenticated(format!(
                    "failed to read token file {}: {e}",
                    path.display()
                ))
            })?;
            let token = token.trim();
            if token.is_empty() {
                return Err(Status::unauthenticated(format!(
                    "read empty token from {}",
                    path.display()
                )));
            }
            let value = MetadataValue::try_from(format!("Bearer {token}"))
                .map_err(|_| Status::unauthenticated("token is not valid metadata"))?;
            request.metadata_mut().insert("authorization", value);
        }

        Ok(request)
    }
}
