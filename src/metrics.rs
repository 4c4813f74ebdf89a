//! Metrics instrumentation for lattice-agent.
//!
//! All metrics are prefixed with `lattice_agent.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Which half of the relay a stream event belongs to.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// The data-plane proxy's stream into the agent.
    Downstream,
    /// The agent's stream to the control plane.
    Upstream,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Downstream => "downstream",
            Direction::Upstream => "upstream",
        }
    }
}

/// How a relay stream ended.
#[derive(Debug, Clone, Copy)]
pub enum Termination {
    /// Expected closure (EOF, cancellation, deadline).
    Cancellation,
    /// Anything else.
    Error,
}

/// Record one relayed discovery request (downstream -> upstream).
pub fn record_relay_request(type_url: &str) {
    counter!("lattice_agent.xds.requests.count", "type_url" => type_url.to_string()).increment(1);
}

/// Record one relayed or intercepted discovery response.
pub fn record_relay_response(type_url: &str) {
    counter!("lattice_agent.xds.responses.count", "type_url" => type_url.to_string()).increment(1);
}

/// Record a stream termination for one direction of the relay.
pub fn record_stream_termination(direction: Direction, termination: Termination) {
    let class = match termination {
        Termination::Cancellation => "cancellation",
        Termination::Error => "error",
    };
    counter!(
        "lattice_agent.xds.terminations.count",
        "direction" => direction.as_str(),
        "class" => class
    )
    .increment(1);
}

/// Record a failed dial to the control plane.
pub fn record_upstream_connect_failure() {
    counter!("lattice_agent.xds.upstream.connect_failures.count").increment(1);
}

/// Outcome of applying a name-table push.
#[derive(Debug, Clone, Copy)]
pub enum NameTableUpdate {
    /// Decoded and swapped in.
    Applied,
    /// Decode failed; the previous snapshot stays published.
    DecodeError,
    /// Push carried no resources or local DNS is disabled.
    Skipped,
}

/// Record the outcome of a name-table push.
pub fn record_nametable_update(outcome: NameTableUpdate) {
    let result = match outcome {
        NameTableUpdate::Applied => "applied",
        NameTableUpdate::DecodeError => "decode_error",
        NameTableUpdate::Skipped => "skipped",
    };
    counter!("lattice_agent.nametable.updates.count", "result" => result).increment(1);
}

/// Record the size of the published lookup table.
pub fn record_table_size(hosts: usize) {
    gauge!("lattice_agent.dns.table.hosts.count").set(hosts as f64);
}

/// How a DNS query was answered.
#[derive(Debug, Clone, Copy)]
pub enum DnsQueryResult {
    /// Answered from the lookup table.
    Local,
    /// Ours, but no record of the requested type (or empty question).
    NxDomain,
    /// Forwarded to a system resolver.
    Forwarded,
    /// All system resolvers failed.
    ForwardFailed,
}

/// Record a DNS query served by one of the listeners.
pub fn record_dns_query(protocol: &'static str, result: DnsQueryResult, elapsed: std::time::Duration) {
    let result_str = match result {
        DnsQueryResult::Local => "local",
        DnsQueryResult::NxDomain => "nxdomain",
        DnsQueryResult::Forwarded => "forwarded",
        DnsQueryResult::ForwardFailed => "forward_failed",
    };
    counter!(
        "lattice_agent.dns.query.count",
        "protocol" => protocol,
        "result" => result_str
    )
    .increment(1);
    histogram!("lattice_agent.dns.query.duration.seconds", "protocol" => protocol)
        .record(elapsed.as_secs_f64());
}

/// Record a credential-rotation reset signal.
pub fn record_credential_reset() {
    counter!("lattice_agent.creds.resets.count").increment(1);
}

/// Record an injected health report.
pub fn record_health_report(healthy: bool) {
    let state = if healthy { "healthy" } else { "unhealthy" };
    counter!("lattice_agent.health.reports.count", "state" => state).increment(1);
}

/// Record a request dropped by best-effort submission.
pub fn record_dropped_request() {
    counter!("lattice_agent.xds.dropped_requests.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
