//! Workload health report injection.
//!
//! The application probe (external to this crate) publishes
//! [`HealthEvent`]s on a channel; the injector turns state transitions into
//! HealthInfo discovery requests and submits them through the multiplexer.
//! Submission is best-effort: a report produced while no downstream session
//! is registered is dropped.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;
use crate::proto::{DiscoveryRequest, RpcStatus};
use crate::xds::{XdsProxy, HEALTH_INFO_TYPE};

/// Code attached to unhealthy reports.
const UNHEALTHY_STATUS_CODE: i32 = 500;

/// One observation from the application probe.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    /// Whether the workload currently passes its probe.
    pub healthy: bool,
    /// Probe failure detail; ignored for healthy events.
    pub message: String,
}

/// Consume probe events until the channel closes or the agent stops.
pub async fn run_injector(
    proxy: XdsProxy,
    mut events: mpsc::Receiver<HealthEvent>,
    stop: CancellationToken,
) {
    let mut last_healthy: Option<bool> = None;
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("health injector shutting down");
                return;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("health event channel closed");
                    return;
                };
                // only transitions are reported upstream
                if last_healthy == Some(event.healthy) {
                    continue;
                }
                last_healthy = Some(event.healthy);
                metrics::record_health_report(event.healthy);
                proxy.send_request(health_request(event));
            }
        }
    }
}

fn health_request(event: HealthEvent) -> DiscoveryRequest {
    if event.healthy {
        DiscoveryRequest {
            type_url: HEALTH_INFO_TYPE.to_string(),
            ..Default::default()
        }
    } else {
        DiscoveryRequest {
            type_url: HEALTH_INFO_TYPE.to_string(),
            error_detail: Some(RpcStatus {
                code: UNHEALTHY_STATUS_CODE,
                message: event.message,
            }),
            ..Default::default()
        }
    }
}
