//! XDS multiplexer: relays the data-plane proxy's discovery stream onto a
//! single upstream stream to the control plane.
//!
//! Every fresh downstream connection re-establishes the upstream connection;
//! a new downstream stream must never consume messages that belong to the
//! previous one, and vice versa. The relay is a blind pipe except for one
//! resource type: name-table pushes are decoded, applied to the local DNS
//! server, and acknowledged by the agent itself.

use prost::Message as _;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::dialer::UpstreamDialer;
use crate::dns::LocalDnsServer;
use crate::metrics::{self, Direction, NameTableUpdate, Termination};
use crate::proto::aggregated_discovery_service_server::AggregatedDiscoveryService;
use crate::proto::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, NameTable,
};

/// Resource type URL for data-plane listeners; the first downstream request
/// of this type kicks off the name-table subscription.
pub const LISTENER_TYPE: &str = "type.googleapis.com/lattice.listener.v1.Listener";

/// Resource type URL for name-table pushes; intercepted by the agent.
pub const NAME_TABLE_TYPE: &str = "type.googleapis.com/lattice.dns.v1.NameTable";

/// Resource type URL for workload health reports; injected by the agent and
/// passed through to the control plane.
pub const HEALTH_INFO_TYPE: &str = "type.googleapis.com/lattice.health.v1.HealthInfo";

/// Per-request upstream send timeout.
const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Channel capacity for the request/response relay channels.
const RELAY_CHANNEL_CAPACITY: usize = 10;

/// The registered half of one downstream session: where injected requests
/// go, and the signal that supersedes the session. The relay loop holds the
/// receiving ends of the session's channels.
struct ProxyConnection {
    requests: mpsc::Sender<DiscoveryRequest>,
    stop: CancellationToken,
}

struct Inner {
    dialer: UpstreamDialer,
    dns: Option<Arc<LocalDnsServer>>,
    /// The active downstream session. At most one at a time: registering a
    /// new one cancels the predecessor before installing the successor.
    connected: parking_lot::RwLock<Option<Arc<ProxyConnection>>>,
    /// Fires when the credential supervisor wants the upstream torn down.
    reset_rx: watch::Receiver<()>,
    /// Agent-wide stop signal; per-session stop tokens are children.
    stop: CancellationToken,
}

/// The discovery multiplexer. Serves `StreamAggregatedResources` to the
/// data-plane proxy and maintains one upstream stream per session.
#[derive(Clone)]
pub struct XdsProxy {
    inner: Arc<Inner>,
}

impl XdsProxy {
    /// Create a multiplexer. `dns` is `None` when the local resolver is
    /// disabled; name-table pushes are then acknowledged but not applied.
    pub fn new(
        dialer: UpstreamDialer,
        dns: Option<Arc<LocalDnsServer>>,
        reset_rx: watch::Receiver<()>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                dns,
                connected: parking_lot::RwLock::new(None),
                reset_rx,
                stop,
            }),
        }
    }

    /// Best-effort unicast to the currently registered session. Dropped
    /// (with a counter) when no session is registered or its request
    /// channel is saturated; callers must not rely on delivery.
    pub fn send_request(&self, request: DiscoveryRequest) {
        let guard = self.inner.connected.read();
        match guard.as_ref() {
            Some(con) => {
                if let Err(e) = con.requests.try_send(request) {
                    debug!("dropping injected request: {e}");
                    metrics::record_dropped_request();
                }
            }
            None => {
                debug!("dropping injected request: no active stream");
                metrics::record_dropped_request();
            }
        }
    }

    /// Install a new session, cancelling the predecessor's stop signal
    /// first so there is no window with two sessions active for routing.
    fn register_stream(&self, con: Arc<ProxyConnection>) {
        let mut guard = self.inner.connected.write();
        if let Some(prev) = guard.take() {
            prev.stop.cancel();
        }
        *guard = Some(con);
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for XdsProxy {
    type StreamAggregatedResourcesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;
    type DeltaAggregatedResourcesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!("data-plane discovery stream established");
        let mut downstream = request.into_inner();

        let (downstream_tx, downstream_rx) =
            mpsc::channel::<Result<DiscoveryResponse, Status>>(RELAY_CHANNEL_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel::<DiscoveryRequest>(RELAY_CHANNEL_CAPACITY);
        let (responses_tx, responses_rx) =
            mpsc::channel::<DiscoveryResponse>(RELAY_CHANNEL_CAPACITY);
        let (downstream_err_tx, downstream_err_rx) = mpsc::channel::<Status>(1);
        let (upstream_err_tx, upstream_err_rx) = mpsc::channel::<Status>(1);
        let stop = self.inner.stop.child_token();

        let con = Arc::new(ProxyConnection {
            requests: requests_tx.clone(),
            stop: stop.clone(),
        });
        self.register_stream(con);

        // Downstream reader: everything the data plane sends goes upstream.
        // The first listener subscription also triggers a synthetic
        // name-table request so the DNS table is pulled at session start
        // instead of waiting for a push.
        let dns_enabled = self.inner.dns.is_some();
        let reader_requests_tx = requests_tx.clone();
        tokio::spawn(async move {
            let mut first_nds_sent = false;
            loop {
                match downstream.message().await {
                    Ok(Some(request)) => {
                        let type_url = request.type_url.clone();
                        if reader_requests_tx.send(request).await.is_err() {
                            return;
                        }
                        if dns_enabled && !first_nds_sent && type_url == LISTENER_TYPE {
                            let synthetic = DiscoveryRequest {
                                type_url: NAME_TABLE_TYPE.to_string(),
                                ..Default::default()
                            };
                            if reader_requests_tx.send(synthetic).await.is_err() {
                                return;
                            }
                            first_nds_sent = true;
                        }
                    }
                    Ok(None) => {
                        let _ = downstream_err_tx
                            .send(Status::cancelled("client disconnected"))
                            .await;
                        return;
                    }
                    Err(status) => {
                        let _ = downstream_err_tx.send(status).await;
                        return;
                    }
                }
            }
        });

        let session = RelaySession {
            proxy: self.clone(),
            downstream_tx,
            requests_tx,
            requests_rx,
            responses_tx,
            responses_rx,
            downstream_err_rx,
            upstream_err_tx,
            upstream_err_rx,
            stop,
        };
        tokio::spawn(session.run());

        Ok(Response::new(ReceiverStream::new(downstream_rx)))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("delta discovery is not supported"))
    }
}

/// Everything one downstream session's relay needs: the response stream back
/// to the data plane, the four session channels, and the stop signal.
struct RelaySession {
    proxy: XdsProxy,
    downstream_tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    requests_tx: mpsc::Sender<DiscoveryRequest>,
    requests_rx: mpsc::Receiver<DiscoveryRequest>,
    responses_tx: mpsc::Sender<DiscoveryResponse>,
    responses_rx: mpsc::Receiver<DiscoveryResponse>,
    downstream_err_rx: mpsc::Receiver<Status>,
    upstream_err_tx: mpsc::Sender<Status>,
    upstream_err_rx: mpsc::Receiver<Status>,
    stop: CancellationToken,
}

impl RelaySession {
    async fn run(mut self) {
        let inner = self.proxy.inner.clone();

        let channel = match inner.dialer.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(
                    address = %inner.dialer.address(),
                    "failed to connect to upstream discovery server: {e}"
                );
                metrics::record_upstream_connect_failure();
                // Surface the failure; the data plane's reconnect is the
                // retry loop.
                let _ = self
                    .downstream_tx
                    .send(Err(Status::unavailable(format!("upstream dial failed: {e}"))))
                    .await;
                return;
            }
        };

        info!(address = %inner.dialer.address(), "connected to upstream discovery server");

        let mut client = inner.dialer.client(channel);
        let (up_tx, up_rx) = mpsc::channel::<DiscoveryRequest>(RELAY_CHANNEL_CAPACITY);
        let mut upstream = match client
            .stream_aggregated_resources(ReceiverStream::new(up_rx))
            .await
        {
            Ok(response) => response.into_inner(),
            Err(status) => {
                error!("failed to open upstream stream: {status}");
                metrics::record_upstream_connect_failure();
                let _ = self.downstream_tx.send(Err(status)).await;
                return;
            }
        };

        // Upstream reader, symmetric to the downstream one.
        let responses_tx = self.responses_tx.clone();
        let upstream_err_tx = self.upstream_err_tx.clone();
        tokio::spawn(async move {
            loop {
                match upstream.message().await {
                    Ok(Some(response)) => {
                        if responses_tx.send(response).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = upstream_err_tx
                            .send(Status::cancelled("upstream closed the stream"))
                            .await;
                        return;
                    }
                    Err(status) => {
                        let _ = upstream_err_tx.send(status).await;
                        return;
                    }
                }
            }
        });

        let mut reset_rx = inner.reset_rx.clone();
        // Only rotations from here on matter; this session already dialed
        // with the current credentials.
        reset_rx.borrow_and_update();

        loop {
            tokio::select! {
                Some(status) = self.upstream_err_rx.recv() => {
                    classify_termination(Direction::Upstream, &status);
                    // Absorbed: dropping our sender half closes the
                    // upstream send, and returning ends the downstream
                    // stream cleanly so it can bring up a fresh session.
                    return;
                }
                Some(status) = self.downstream_err_rx.recv() => {
                    classify_termination(Direction::Downstream, &status);
                    // Surfaced: the downstream transport is gone; its
                    // reconnect restarts the discovery sequence.
                    return;
                }
                Some(request) = self.requests_rx.recv() => {
                    metrics::record_relay_request(&request.type_url);
                    debug!(type_url = %request.type_url, "relaying request upstream");
                    match tokio::time::timeout(SEND_TIMEOUT, up_tx.send(request)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            warn!("upstream send failed: stream closed");
                            let _ = self.downstream_tx
                                .send(Err(Status::unavailable("upstream send failed")))
                                .await;
                            return;
                        }
                        Err(_) => {
                            warn!("upstream send timed out");
                            let _ = self.downstream_tx
                                .send(Err(Status::deadline_exceeded("upstream send timed out")))
                                .await;
                            return;
                        }
                    }
                }
                Some(response) = self.responses_rx.recv() => {
                    metrics::record_relay_response(&response.type_url);
                    if response.type_url == NAME_TABLE_TYPE {
                        intercept_name_table(inner.dns.as_deref(), &self.requests_tx, response);
                    } else if self.downstream_tx.send(Ok(response)).await.is_err() {
                        // We are blindly proxying; there is no way to keep
                        // one direction alive on its own, so tear down the
                        // whole session and start afresh.
                        warn!("downstream send failed, tearing down the relay");
                        metrics::record_stream_termination(Direction::Downstream, Termination::Error);
                        return;
                    }
                }
                Ok(()) = reset_rx.changed() => {
                    info!("upstream credentials rotated, resetting the connection");
                    let _ = self.downstream_tx
                        .send(Err(Status::unavailable("upstream credentials rotated")))
                        .await;
                    return;
                }
                _ = self.stop.cancelled() => {
                    debug!("session superseded or agent stopping");
                    return;
                }
                else => return,
            }
        }
    }

}

/// Apply a name-table push to the local DNS server and acknowledge it. The
/// ACK goes out even when decoding fails: stalling the whole session on one
/// bad push would take down every other resource type.
fn intercept_name_table(
    dns: Option<&LocalDnsServer>,
    requests_tx: &mpsc::Sender<DiscoveryRequest>,
    response: DiscoveryResponse,
) {
    match dns {
        Some(dns) if !response.resources.is_empty() => {
            match NameTable::decode(response.resources[0].value.as_slice()) {
                Ok(nt) => {
                    dns.update_lookup_table(&nt);
                    metrics::record_nametable_update(NameTableUpdate::Applied);
                }
                Err(e) => {
                    error!("failed to decode name table: {e}");
                    metrics::record_nametable_update(NameTableUpdate::DecodeError);
                }
            }
        }
        _ => metrics::record_nametable_update(NameTableUpdate::Skipped),
    }

    let ack = DiscoveryRequest {
        version_info: response.version_info,
        type_url: NAME_TABLE_TYPE.to_string(),
        response_nonce: response.nonce,
        ..Default::default()
    };
    // Non-blocking: the relay loop is the only reader of this channel, so a
    // blocking send from inside it could deadlock when saturated.
    if requests_tx.try_send(ack).is_err() {
        warn!("request channel saturated, dropping name-table ack");
        metrics::record_dropped_request();
    }
}

/// Expected closures are the ordinary churn of proxies restarting and
/// deadlines passing; anything else gets a warning and the error counter.
fn is_expected_termination(status: &Status) -> bool {
    matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded)
        || (status.code() == Code::Unavailable
            && matches!(
                status.message(),
                "client disconnected" | "transport is closing"
            ))
}

fn classify_termination(direction: Direction, status: &Status) {
    if is_expected_termination(status) {
        debug!(?direction, "stream terminated: {status}");
        metrics::record_stream_termination(direction, Termination::Cancellation);
    } else {
        warn!(?direction, "stream terminated with unexpected error: {status}");
        metrics::record_stream_termination(direction, Termination::Error);
    }
}
