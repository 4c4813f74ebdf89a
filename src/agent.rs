//! Agent assembly and lifecycle.
//!
//! Wires the local DNS server, the upstream dialer, the multiplexer, the
//! credential supervisor, and the health injector together, then serves the
//! discovery socket until shutdown.

use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::dialer::UpstreamDialer;
use crate::dns::{LocalDnsServer, SystemResolver};
use crate::error::AgentError;
use crate::health::{self, HealthEvent};
use crate::proto::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use crate::watcher::{self, CredentialWatcher};
use crate::xds::XdsProxy;

/// Capacity of the probe event channel.
const HEALTH_CHANNEL_CAPACITY: usize = 10;

/// The assembled sidecar agent.
pub struct Agent {
    config: Config,
    dns: Option<Arc<LocalDnsServer>>,
    proxy: XdsProxy,
    health_tx: mpsc::Sender<HealthEvent>,
    health_rx: mpsc::Receiver<HealthEvent>,
    stop: CancellationToken,
    // Dropping either of these would disable credential resets.
    _reset_tx: watch::Sender<()>,
    _credential_watcher: Option<CredentialWatcher>,
}

impl Agent {
    /// Build the agent: bind the DNS listeners, validate the upstream
    /// credential configuration, and start the credential supervisor.
    pub async fn new(config: Config) -> Result<Self, AgentError> {
        let stop = CancellationToken::new();

        let dns = if config.dns.enabled {
            let resolver = SystemResolver::from_system()?;
            let server = Arc::new(LocalDnsServer::new(&config.dns, resolver).await?);
            server.start();
            Some(server)
        } else {
            None
        };

        let dialer = UpstreamDialer::new(&config.agent)?;
        info!(
            upstream = %dialer.address(),
            cluster_id = %config.agent.cluster_id,
            "initializing discovery multiplexer"
        );

        let (reset_tx, reset_rx) = watch::channel(());
        let credential_watcher = {
            let paths: Vec<_> = [
                config.agent.ca_cert_path.clone(),
                config.agent.client_cert_path.clone(),
                config.agent.client_key_path.clone(),
            ]
            .into_iter()
            .flatten()
            .collect();
            watcher::watch_credentials(paths, reset_tx.clone())?
        };

        let proxy = XdsProxy::new(dialer, dns.clone(), reset_rx, stop.clone());
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            dns,
            proxy,
            health_tx,
            health_rx,
            stop,
            _reset_tx: reset_tx,
            _credential_watcher: credential_watcher,
        })
    }

    /// Where the application probe publishes its health observations.
    pub fn health_events(&self) -> mpsc::Sender<HealthEvent> {
        self.health_tx.clone()
    }

    /// The local DNS server, when enabled.
    pub fn dns(&self) -> Option<&Arc<LocalDnsServer>> {
        self.dns.as_ref()
    }

    /// Serve the discovery socket until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let socket_path = self.config.agent.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // a previous run may have left the socket behind
        match std::fs::remove_file(&socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(path = %socket_path.display(), "serving discovery on unix socket");

        tokio::spawn(health::run_injector(
            self.proxy.clone(),
            self.health_rx,
            self.stop.clone(),
        ));

        let result = tonic::transport::Server::builder()
            .add_service(AggregatedDiscoveryServiceServer::new(self.proxy.clone()))
            .serve_with_incoming_shutdown(
                UnixListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await;

        self.stop.cancel();
        if let Some(dns) = &self.dns {
            dns.close();
        }
        let _ = std::fs::remove_file(&socket_path);
        info!("agent stopped");

        result.map_err(Into::into)
    }
}
