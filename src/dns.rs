//! Local DNS server: loopback UDP/TCP listeners backed by the lookup table,
//! with fallthrough to the system resolvers for names we do not own.
//!
//! The agent sits in front of the application's resolver, so there is no
//! search-list walking here: the application already sends one query per
//! search suffix and we answer each against the precomputed table. Unknown
//! names are forwarded to the nameservers from `/etc/resolv.conf`, raw
//! bytes in, raw bytes out.

use arc_swap::ArcSwapOption;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DnsConfig;
use crate::error::AgentError;
use crate::metrics::{self, DnsQueryResult, Timer};
use crate::proto::NameTable;
use crate::table::{LookupTable, NamingContext};

const MAX_UDP_MESSAGE_SIZE: usize = 4096;
const UPSTREAM_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Which listener a query arrived on. Forwarded queries use the same
/// transport toward the system resolvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsProtocol {
    /// Datagram listener.
    Udp,
    /// Stream listener, 2-byte length-prefixed frames.
    Tcp,
}

impl DnsProtocol {
    fn as_str(self) -> &'static str {
        match self {
            DnsProtocol::Udp => "udp",
            DnsProtocol::Tcp => "tcp",
        }
    }
}

/// The pieces of the system resolver configuration the agent needs:
/// upstream nameservers in listed order and the search suffixes.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver {
    /// Upstream nameservers, port included, tried in order.
    pub nameservers: Vec<SocketAddr>,
    /// Search suffixes, in resolv.conf order.
    pub search: Vec<String>,
}

impl SystemResolver {
    /// Read `/etc/resolv.conf`. Startup fails when it is unreadable; an
    /// agent that cannot forward unknown names would silently black-hole
    /// every external lookup.
    pub fn from_system() -> Result<Self, AgentError> {
        let (cfg, _opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| AgentError::Config(format!("failed to read /etc/resolv.conf: {e}")))?;

        let mut nameservers = Vec::new();
        for ns in cfg.name_servers() {
            // Each server appears once per transport; keep the UDP entries
            // to preserve the configured order without duplicates.
            if ns.protocol == hickory_resolver::config::Protocol::Udp {
                nameservers.push(ns.socket_addr);
            }
        }
        let search = cfg.search().iter().map(|n| n.to_string()).collect();

        Ok(Self {
            nameservers,
            search,
        })
    }
}

/// Owns the published lookup-table pointer and the two loopback listeners.
///
/// Queries load the current snapshot without taking a lock; updates build a
/// whole new snapshot and swap the pointer, so readers observe either the
/// previous table or the new one, never a partial build.
pub struct LocalDnsServer {
    table: ArcSwapOption<LookupTable>,
    naming: NamingContext,
    nameservers: Vec<SocketAddr>,
    udp_socket: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    stop: CancellationToken,
}

impl LocalDnsServer {
    /// Bind the UDP and TCP listeners and capture the naming environment.
    /// Listeners do not serve until [`start`](Self::start) is called.
    pub async fn new(config: &DnsConfig, resolver: SystemResolver) -> Result<Self, AgentError> {
        let naming = NamingContext::new(
            &config.proxy_namespace,
            &config.proxy_domain,
            resolver.search,
        );

        let udp_socket = UdpSocket::bind(config.listen_addr).await?;
        let udp_addr = udp_socket.local_addr()?;
        let tcp_listener = TcpListener::bind(config.listen_addr).await?;
        let tcp_addr = tcp_listener.local_addr()?;

        info!(
            udp = %udp_addr,
            tcp = %tcp_addr,
            domain = %naming.proxy_domain,
            nameservers = resolver.nameservers.len(),
            "local DNS server bound"
        );

        Ok(Self {
            table: ArcSwapOption::empty(),
            naming,
            nameservers: resolver.nameservers,
            udp_socket: Arc::new(udp_socket),
            tcp_listener: Arc::new(tcp_listener),
            udp_addr,
            tcp_addr,
            stop: CancellationToken::new(),
        })
    }

    /// Address the UDP listener is bound to.
    pub fn udp_address(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Address the TCP listener is bound to.
    pub fn tcp_address(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Spawn the listener loops.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(udp_loop(self.clone(), self.udp_socket.clone()));
        tokio::spawn(tcp_loop(self.clone(), self.tcp_listener.clone()));
    }

    /// Stop both listeners.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Build a fresh snapshot from a name-table push and publish it with a
    /// single atomic store. In-flight queries keep whatever snapshot they
    /// already loaded.
    pub fn update_lookup_table(&self, nt: &NameTable) {
        let table = LookupTable::build(nt, &self.naming);
        metrics::record_table_size(table.num_hosts());
        debug!(hosts = table.num_hosts(), "publishing new lookup table");
        self.table.store(Some(Arc::new(table)));
    }

    /// Handle one raw query and produce the raw reply, or `None` when the
    /// input is not even a parseable DNS message.
    pub async fn handle_query(&self, protocol: DnsProtocol, raw: &[u8]) -> Option<Vec<u8>> {
        let timer = Timer::start();

        let request = match Message::from_vec(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping unparseable DNS query: {e}");
                return None;
            }
        };

        if request.queries().is_empty() {
            metrics::record_dns_query(protocol.as_str(), DnsQueryResult::NxDomain, timer.elapsed());
            return serialize(reply_to(&request, ResponseCode::NXDomain, Vec::new(), false));
        }

        // One question per query in practice, even though the wire format
        // allows several.
        let query = &request.queries()[0];
        let qtype = query.query_type();
        let mut host = query.name().to_string().to_ascii_lowercase();
        if !host.ends_with('.') {
            host.push('.');
        }

        let Some(snapshot) = self.table.load_full() else {
            metrics::record_dns_query(protocol.as_str(), DnsQueryResult::NxDomain, timer.elapsed());
            return serialize(reply_to(&request, ResponseCode::NXDomain, Vec::new(), false));
        };

        let (answers, ours) = snapshot.lookup(qtype, &host);
        if ours {
            let (rcode, result) = if answers.is_empty() {
                // we know the host but hold no record of this type
                (ResponseCode::NXDomain, DnsQueryResult::NxDomain)
            } else {
                (ResponseCode::NoError, DnsQueryResult::Local)
            };
            metrics::record_dns_query(protocol.as_str(), result, timer.elapsed());
            return serialize(reply_to(&request, rcode, answers, true));
        }

        // Not from our registry: query upstream and return the first usable
        // response as-is.
        match self.forward_upstream(protocol, raw).await {
            Some(reply) => {
                metrics::record_dns_query(protocol.as_str(), DnsQueryResult::Forwarded, timer.elapsed());
                Some(reply)
            }
            None => {
                metrics::record_dns_query(
                    protocol.as_str(),
                    DnsQueryResult::ForwardFailed,
                    timer.elapsed(),
                );
                serialize(reply_to(&request, ResponseCode::NXDomain, Vec::new(), false))
            }
        }
    }

    async fn forward_upstream(&self, protocol: DnsProtocol, raw: &[u8]) -> Option<Vec<u8>> {
        for ns in &self.nameservers {
            let exchanged = match protocol {
                DnsProtocol::Udp => exchange_udp(*ns, raw).await,
                DnsProtocol::Tcp => exchange_tcp(*ns, raw).await,
            };
            match exchanged {
                Ok(bytes) => match Message::from_vec(&bytes) {
                    Ok(response) if !response.answers().is_empty() => return Some(bytes),
                    Ok(_) => debug!(nameserver = %ns, "upstream answered without records, trying next"),
                    Err(e) => debug!(nameserver = %ns, "unparseable upstream response: {e}"),
                },
                Err(e) => debug!(nameserver = %ns, "upstream exchange failed: {e}"),
            }
        }
        None
    }
}

fn reply_to(
    request: &Message,
    rcode: ResponseCode,
    answers: Vec<Record>,
    authoritative: bool,
) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_authoritative(authoritative);
    response.add_queries(request.queries().to_vec());
    response.set_response_code(rcode);
    if !answers.is_empty() {
        response.add_answers(answers);
    }
    response
}

fn serialize(message: Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("failed to serialize DNS response: {e}");
            None
        }
    }
}

async fn exchange_udp(nameserver: SocketAddr, query: &[u8]) -> Result<Vec<u8>, AgentError> {
    let bind_addr: SocketAddr = if nameserver.is_ipv6() {
        "[::]:0".parse().expect("valid literal address")
    } else {
        "0.0.0.0:0".parse().expect("valid literal address")
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.send_to(query, nameserver).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    let (len, _) = tokio::time::timeout(UPSTREAM_QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| timeout_error())??;
    buf.truncate(len);
    Ok(buf)
}

async fn exchange_tcp(nameserver: SocketAddr, query: &[u8]) -> Result<Vec<u8>, AgentError> {
    let mut stream = tokio::time::timeout(UPSTREAM_QUERY_TIMEOUT, TcpStream::connect(nameserver))
        .await
        .map_err(|_| timeout_error())??;

    let len = u16::try_from(query.len())
        .map_err(|_| AgentError::Config("DNS query exceeds TCP frame size".to_string()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(query).await?;

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(UPSTREAM_QUERY_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| timeout_error())??;
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    tokio::time::timeout(UPSTREAM_QUERY_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| timeout_error())??;
    Ok(buf)
}

fn timeout_error() -> AgentError {
    AgentError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "upstream DNS query timed out",
    ))
}

async fn udp_loop(server: Arc<LocalDnsServer>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    loop {
        tokio::select! {
            _ = server.stop.cancelled() => {
                debug!("UDP DNS listener shutting down");
                return;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    let query = buf[..len].to_vec();
                    let server = server.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = server.handle_query(DnsProtocol::Udp, &query).await {
                            if let Err(e) = socket.send_to(&reply, src).await {
                                debug!(%src, "failed to send DNS response: {e}");
                            }
                        }
                    });
                }
                Err(e) => error!("UDP DNS recv error: {e}"),
            }
        }
    }
}

async fn tcp_loop(server: Arc<LocalDnsServer>, listener: Arc<TcpListener>) {
    loop {
        tokio::select! {
            _ = server.stop.cancelled() => {
                debug!("TCP DNS listener shutting down");
                return;
            }
            result = listener.accept() => match result {
                Ok((stream, src)) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        serve_tcp_conn(server, stream, src).await;
                    });
                }
                Err(e) => error!("TCP DNS accept error: {e}"),
            }
        }
    }
}

async fn serve_tcp_conn(server: Arc<LocalDnsServer>, mut stream: TcpStream, src: SocketAddr) {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            // clean EOF between queries included
            return;
        }
        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }

        let Some(reply) = server.handle_query(DnsProtocol::Tcp, &query).await else {
            return;
        };
        let Ok(len) = u16::try_from(reply.len()) else {
            debug!(%src, "oversized TCP DNS reply dropped");
            return;
        };
        if stream.write_all(&len.to_be_bytes()).await.is_err()
            || stream.write_all(&reply).await.is_err()
        {
            debug!(%src, "failed to write TCP DNS response");
            return;
        }
    }
}
