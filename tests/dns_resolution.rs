//! End-to-end name resolution through real loopback listeners: alternate
//! host expansion, search-path CNAME chains, and upstream fallthrough.

mod common;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use common::*;
use lattice_agent::config::DnsConfig;
use lattice_agent::dns::{LocalDnsServer, SystemResolver};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(nameservers: Vec<SocketAddr>, search: Vec<&str>) -> Arc<LocalDnsServer> {
    let config = DnsConfig {
        enabled: true,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        proxy_namespace: "ns1".to_string(),
        proxy_domain: "svc.cluster.local".to_string(),
    };
    let resolver = SystemResolver {
        nameservers,
        search: search.into_iter().map(str::to_string).collect(),
    };
    let server = Arc::new(LocalDnsServer::new(&config, resolver).await.unwrap());
    server.start();
    server
}

async fn udp_exchange(server: &LocalDnsServer, query: &[u8]) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(query, server.udp_address()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .expect("query timed out")
        .expect("failed to recv response");
    Message::from_vec(&buf[..len]).expect("failed to parse DNS response")
}

async fn udp_query(server: &LocalDnsServer, name: &str, rtype: RecordType, id: u16) -> Message {
    udp_exchange(server, &build_query_bytes(name, rtype, id)).await
}

async fn tcp_query(server: &LocalDnsServer, name: &str, rtype: RecordType, id: u16) -> Message {
    let mut stream = TcpStream::connect(server.tcp_address()).await.unwrap();
    let query = build_query_bytes(name, rtype, id);
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&query).await.unwrap();

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(QUERY_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .expect("query timed out")
        .unwrap();
    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await.unwrap();
    Message::from_vec(&buf).expect("failed to parse DNS response")
}

/// A canned upstream nameserver answering A queries from a fixed map.
async fn start_fake_nameserver(answers: HashMap<String, Ipv4Addr>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            let mut response = Message::new();
            response.set_id(query.id());
            response.set_message_type(MessageType::Response);
            response.set_op_code(query.op_code());
            response.add_queries(query.queries().to_vec());

            match query
                .queries()
                .first()
                .and_then(|q| answers.get(&q.name().to_string().to_ascii_lowercase()))
            {
                Some(ip) => {
                    let name = query.queries()[0].name().clone();
                    let mut record = Record::from_rdata(name, 300, RData::A(A(*ip)));
                    record.set_dns_class(DNSClass::IN);
                    response.add_answer(record);
                    response.set_response_code(ResponseCode::NoError);
                }
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }

            let _ = socket
                .send_to(&response.to_vec().expect("serialize"), src)
                .await;
        }
    });

    addr
}

/// A nameserver that accepts queries and never answers.
async fn start_silent_nameserver() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            if socket.recv_from(&mut buf).await.is_err() {
                return;
            }
        }
    });
    addr
}

#[tokio::test]
async fn alt_host_expansion_answers_short_forms() {
    let server = start_server(vec![], vec![]).await;
    server.update_lookup_table(&name_table(vec![(
        "reviews.ns2.svc.cluster.local",
        kube_entry("reviews", "ns2", &["10.0.0.1"]),
    )]));

    let msg = udp_query(&server, "reviews.ns2.", RecordType::A, 1).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(answer_strings(&msg), vec!["A 10.0.0.1"]);

    let msg = udp_query(&server, "reviews.ns2.svc.", RecordType::A, 2).await;
    assert_response_code(&msg, ResponseCode::NoError);

    // known host, no AAAA records
    let msg = udp_query(&server, "reviews.ns2.", RecordType::AAAA, 3).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
    assert!(msg.answers().is_empty());

    // not ours (other namespace, no bare short form) and no upstreams
    let msg = udp_query(&server, "reviews.", RecordType::A, 4).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn same_namespace_short_name_resolves() {
    let server = start_server(vec![], vec![]).await;
    server.update_lookup_table(&name_table(vec![(
        "reviews.ns1.svc.cluster.local",
        kube_entry("reviews", "ns1", &["10.0.0.2"]),
    )]));

    let msg = udp_query(&server, "reviews.", RecordType::A, 5).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(answer_strings(&msg), vec!["A 10.0.0.2"]);
}

#[tokio::test]
async fn search_expanded_miss_returns_cname_chain() {
    let server = start_server(vec![], vec!["ns1.svc.cluster.local"]).await;
    server.update_lookup_table(&name_table(vec![(
        "external.example.com",
        external_entry(&["93.184.216.34"]),
    )]));

    let msg = udp_query(
        &server,
        "external.example.com.ns1.svc.cluster.local.",
        RecordType::A,
        6,
    )
    .await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(
        answer_strings(&msg),
        vec![
            "CNAME external.example.com.".to_string(),
            "A 93.184.216.34".to_string()
        ]
    );
}

#[tokio::test]
async fn unknown_host_falls_through_to_second_upstream() {
    // first upstream never answers; second one knows the name
    let silent = start_silent_nameserver().await;
    let mut answers = HashMap::new();
    answers.insert("google.com.".to_string(), "142.250.1.1".parse().unwrap());
    let responsive = start_fake_nameserver(answers).await;

    let server = start_server(vec![silent, responsive], vec![]).await;
    server.update_lookup_table(&name_table(vec![]));

    let msg = udp_query(&server, "google.com.", RecordType::A, 7).await;
    assert_eq!(msg.id(), 7);
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(answer_strings(&msg), vec!["A 142.250.1.1"]);
}

#[tokio::test]
async fn upstream_nxdomain_is_not_good_enough() {
    // an upstream that answers with an empty answer section is skipped in
    // favor of the next one
    let empty = start_fake_nameserver(HashMap::new()).await;
    let mut answers = HashMap::new();
    answers.insert("example.org.".to_string(), "93.184.216.34".parse().unwrap());
    let responsive = start_fake_nameserver(answers).await;

    let server = start_server(vec![empty, responsive], vec![]).await;
    server.update_lookup_table(&name_table(vec![]));

    let msg = udp_query(&server, "example.org.", RecordType::A, 8).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(answer_strings(&msg), vec!["A 93.184.216.34"]);
}

#[tokio::test]
async fn tcp_listener_serves_the_same_table() {
    let server = start_server(vec![], vec![]).await;
    server.update_lookup_table(&name_table(vec![(
        "reviews.ns1.svc.cluster.local",
        kube_entry("reviews", "ns1", &["10.0.0.2"]),
    )]));

    let msg = tcp_query(&server, "reviews.ns1.svc.cluster.local.", RecordType::A, 9).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert_eq!(answer_strings(&msg), vec!["A 10.0.0.2"]);
}

#[tokio::test]
async fn questionless_query_gets_nxdomain() {
    let server = start_server(vec![], vec![]).await;
    server.update_lookup_table(&name_table(vec![]));

    let msg = udp_exchange(&server, &build_questionless_query_bytes(10)).await;
    assert_eq!(msg.id(), 10);
    assert_response_code(&msg, ResponseCode::NXDomain);
    assert!(msg.answers().is_empty());
}

#[tokio::test]
async fn queries_before_first_push_get_nxdomain() {
    let server = start_server(vec![], vec![]).await;

    let msg = udp_query(&server, "anything.example.com.", RecordType::A, 11).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn new_snapshot_applies_to_subsequent_queries() {
    let server = start_server(vec![], vec![]).await;
    server.update_lookup_table(&name_table(vec![(
        "reviews.ns1.svc.cluster.local",
        kube_entry("reviews", "ns1", &["10.0.0.2"]),
    )]));

    let msg = udp_query(&server, "reviews.", RecordType::A, 12).await;
    assert_eq!(answer_strings(&msg), vec!["A 10.0.0.2"]);

    server.update_lookup_table(&name_table(vec![(
        "reviews.ns1.svc.cluster.local",
        kube_entry("reviews", "ns1", &["10.0.0.9"]),
    )]));

    let msg = udp_query(&server, "reviews.", RecordType::A, 13).await;
    assert_eq!(answer_strings(&msg), vec!["A 10.0.0.9"]);
}
