//! Shared test infrastructure for the integration suites.

#![allow(dead_code)]

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use prost::Message as _;
use std::collections::HashMap;
use std::str::FromStr;

use lattice_agent::proto::{NameInfo, NameTable};
use lattice_agent::xds::NAME_TABLE_TYPE;

// --- Name table construction ---

pub fn kube_entry(shortname: &str, namespace: &str, ips: &[&str]) -> NameInfo {
    NameInfo {
        ips: ips.iter().map(|s| s.to_string()).collect(),
        registry: "kubernetes".to_string(),
        shortname: shortname.to_string(),
        namespace: namespace.to_string(),
    }
}

pub fn external_entry(ips: &[&str]) -> NameInfo {
    NameInfo {
        ips: ips.iter().map(|s| s.to_string()).collect(),
        registry: "external".to_string(),
        shortname: String::new(),
        namespace: String::new(),
    }
}

pub fn name_table(entries: Vec<(&str, NameInfo)>) -> NameTable {
    let mut table = HashMap::new();
    for (host, info) in entries {
        table.insert(host.to_string(), info);
    }
    NameTable { table }
}

/// Pack a name table the way the control plane pushes it: one `Any`
/// resource inside a discovery response.
pub fn name_table_resource(nt: &NameTable) -> prost_types::Any {
    prost_types::Any {
        type_url: NAME_TABLE_TYPE.to_string(),
        value: nt.encode_to_vec(),
    }
}

// --- DNS message construction and inspection ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_str(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Wire bytes for a query with an empty question section.
pub fn build_questionless_query_bytes(id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.to_vec().unwrap()
}

/// Render the answer section as `"A 10.0.0.1"`-style strings, in order.
pub fn answer_strings(msg: &Message) -> Vec<String> {
    msg.answers()
        .iter()
        .map(|r| match r.data() {
            Some(RData::A(a)) => format!("A {}", a.0),
            Some(RData::AAAA(aaaa)) => format!("AAAA {}", aaaa.0),
            Some(RData::CNAME(cname)) => format!("CNAME {}", cname.0),
            other => format!("{other:?}"),
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
