//! Immutable DNS lookup-table snapshots built from name-table pushes.
//!
//! A snapshot precomputes every record the agent can answer authoritatively:
//! - the canonical FQDN of every entry,
//! - kubernetes alternate forms (`short.ns.`, `short.ns.svc.`, and the bare
//!   short name for same-namespace entries),
//! - a synthetic CNAME for the first resolv.conf search expansion of each
//!   host, so a sequential resolver's very first query short-circuits the
//!   whole search list down to two exchanges.
//!
//! Snapshots are never mutated after publication; updates build a fresh
//! table and swap the published pointer.

use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

use crate::proto::{NameInfo, NameTable};

/// Keep the TTL low so clients that honor it always come back for the
/// latest IPs.
pub const DEFAULT_TTL_SECONDS: u32 = 30;

const KUBERNETES_REGISTRY: &str = "kubernetes";

/// The naming environment a snapshot is built in: the workload's namespace,
/// the (namespace-deduped) cluster domain, and the resolver search list.
#[derive(Debug, Clone, Default)]
pub struct NamingContext {
    /// Namespace the workload runs in.
    pub proxy_namespace: String,
    /// Cluster domain with a leading duplicate namespace label removed.
    pub proxy_domain: String,
    /// `proxy_domain` split into labels.
    pub domain_parts: Vec<String>,
    /// Search suffixes, lowercase and dot-terminated. Only the first entry
    /// is materialized as a CNAME.
    pub search: Vec<String>,
}

impl NamingContext {
    /// Build a context from raw configuration values and the system search
    /// list. Some setups configure the proxy domain with the namespace
    /// repeated in front (`ns1.svc.cluster.local`); the duplicate label is
    /// dropped.
    pub fn new(proxy_namespace: &str, proxy_domain: &str, search: Vec<String>) -> Self {
        let mut parts: Vec<String> = proxy_domain
            .split('.')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if parts.first().map(String::as_str) == Some(proxy_namespace) {
            parts.remove(0);
        }

        let search = search
            .into_iter()
            .filter_map(|s| {
                let mut s = s.trim_end_matches('.').to_ascii_lowercase();
                if s.is_empty() {
                    return None;
                }
                s.push('.');
                Some(s)
            })
            .collect();

        Self {
            proxy_namespace: proxy_namespace.to_string(),
            proxy_domain: parts.join("."),
            domain_parts: parts,
            search,
        }
    }
}

struct CnameEntry {
    record: Record,
    target: String,
}

/// One immutable snapshot of everything the agent answers for.
///
/// `all_hosts` is consulted first: a name absent from it is not ours and the
/// caller forwards the query upstream. A name present in it with no record
/// of the requested type gets a confident NXDOMAIN, which is what makes the
/// search-expanded misses cheap.
pub struct LookupTable {
    all_hosts: HashSet<String>,
    name4: HashMap<String, Vec<Record>>,
    name6: HashMap<String, Vec<Record>>,
    cname: HashMap<String, CnameEntry>,
}

impl LookupTable {
    fn empty() -> Self {
        Self {
            all_hosts: HashSet::new(),
            name4: HashMap::new(),
            name6: HashMap::new(),
            cname: HashMap::new(),
        }
    }

    /// Build a snapshot from a name-table push.
    pub fn build(nt: &NameTable, ctx: &NamingContext) -> Self {
        let mut table = Self::empty();

        for (host, info) in &nt.table {
            let host = host.to_ascii_lowercase();
            let (ipv4, ipv6) = separate_ip_types(&info.ips);
            if ipv4.is_empty() && ipv6.is_empty() {
                // malformed ips
                continue;
            }
            let alt_hosts = alternate_hosts(&host, info, ctx);
            table.insert_entry(&alt_hosts, &ipv4, &ipv6, &ctx.search);
        }

        debug!(hosts = table.all_hosts.len(), "built lookup table");
        table
    }

    /// Number of names this snapshot owns.
    pub fn num_hosts(&self) -> usize {
        self.all_hosts.len()
    }

    /// Whether the snapshot owns the given name.
    pub fn contains(&self, host: &str) -> bool {
        self.all_hosts.contains(host)
    }

    /// Answer a query for a lowercase, dot-terminated name.
    ///
    /// Returns `(answers, false)` when the name is not ours (the caller
    /// forwards upstream) and `(answers, true)` when it is. An owned name
    /// with an empty answer set means NXDOMAIN: we know the host but have
    /// no record of this type.
    pub fn lookup(&self, qtype: RecordType, host: &str) -> (Vec<Record>, bool) {
        if !self.all_hosts.contains(host) {
            // not from our registry
            return (Vec::new(), false);
        }

        // Odds are the first query is a search-expanded miss, so resolve
        // the CNAME indirection before picking address records.
        let cn = self.cname.get(host);
        let effective = cn.map(|c| c.target.as_str()).unwrap_or(host);

        let ip_answers = match qtype {
            RecordType::A => self.name4.get(effective),
            RecordType::AAAA => self.name6.get(effective),
            _ => return (Vec::new(), false),
        };

        match ip_answers {
            Some(answers) if !answers.is_empty() => {
                // Chained response: the CNAME comes first so clients that
                // do not chase redirects still get the address records in
                // the same reply.
                let mut out = Vec::with_capacity(answers.len() + 1);
                if let Some(cn) = cn {
                    out.push(cn.record.clone());
                }
                out.extend(answers.iter().cloned());
                (out, true)
            }
            _ => (Vec::new(), true),
        }
    }

    fn insert_entry(
        &mut self,
        alt_hosts: &HashSet<String>,
        ipv4: &[Ipv4Addr],
        ipv6: &[Ipv6Addr],
        search: &[String],
    ) {
        for host in alt_hosts {
            let owner = match Name::from_ascii(host) {
                Ok(name) => name,
                Err(e) => {
                    warn!(host = %host, "skipping unparseable host: {e}");
                    continue;
                }
            };

            self.all_hosts.insert(host.clone());
            if !ipv4.is_empty() {
                self.name4.insert(host.clone(), a_records(&owner, ipv4));
            }
            if !ipv6.is_empty() {
                self.name6.insert(host.clone(), aaaa_records(&owner, ipv6));
            }

            // Materialize only the first search suffix: sequential
            // resolvers hit it first, and the CNAME collapses the rest of
            // the search walk.
            if let Some(suffix) = search.first() {
                // host already ends in a dot, the suffix carries its own.
                let expanded = format!("{host}{suffix}");
                // The expansion of a short form can itself be a proper
                // host (reviews. + ns1.svc.cluster.local.); don't shadow it.
                if !alt_hosts.contains(&expanded) {
                    let expanded_name = match Name::from_ascii(&expanded) {
                        Ok(name) => name,
                        Err(e) => {
                            warn!(host = %expanded, "skipping unparseable search expansion: {e}");
                            continue;
                        }
                    };
                    self.cname.insert(
                        expanded.clone(),
                        CnameEntry {
                            record: make_record(
                                expanded_name,
                                RData::CNAME(CNAME(owner.clone())),
                            ),
                            target: host.clone(),
                        },
                    );
                    self.all_hosts.insert(expanded);
                }
            }
        }
    }
}

/// Split raw IP strings into v4 and v6 lists, dropping anything that does
/// not parse.
fn separate_ip_types(ips: &[String]) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();
    for ip in ips {
        if let Ok(v4) = ip.parse::<Ipv4Addr>() {
            ipv4.push(v4);
        } else if let Ok(v6) = ip.parse::<Ipv6Addr>() {
            ipv6.push(v6);
        }
    }
    (ipv4, ipv6)
}

/// The set of names clients may use for one entry.
///
/// Registry entries outside the cluster domain only get their FQDN: there
/// is no way to resolve `name.namespace` conflicts across clusters of
/// different domains, so no short forms are generated for them.
fn alternate_hosts(host: &str, info: &NameInfo, ctx: &NamingContext) -> HashSet<String> {
    let mut out = HashSet::new();
    out.insert(format!("{host}."));

    if !info.registry.eq_ignore_ascii_case(KUBERNETES_REGISTRY) {
        return out;
    }
    if ctx.proxy_domain.is_empty() || !host.ends_with(&ctx.proxy_domain) {
        return out;
    }

    let shortname = info.shortname.to_ascii_lowercase();
    let namespace = info.namespace.to_ascii_lowercase();

    out.insert(format!("{shortname}.{namespace}."));
    if ctx.proxy_namespace == namespace {
        out.insert(format!("{shortname}."));
    }
    // One extra variant (usually the `.svc` form); generating the full
    // ladder of domain suffixes costs memory for names nobody queries.
    if let Some(first) = ctx.domain_parts.first() {
        out.insert(format!("{shortname}.{namespace}.{first}."));
    }

    out
}

fn make_record(name: Name, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, DEFAULT_TTL_SECONDS, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

fn a_records(name: &Name, ips: &[Ipv4Addr]) -> Vec<Record> {
    ips.iter()
        .map(|ip| make_record(name.clone(), RData::A(A(*ip))))
        .collect()
}

fn aaaa_records(name: &Name, ips: &[Ipv6Addr]) -> Vec<Record> {
    ips.iter()
        .map(|ip| make_record(name.clone(), RData::AAAA(AAAA(*ip))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn kube_entry(shortname: &str, namespace: &str, ips: &[&str]) -> NameInfo {
        NameInfo {
            ips: ips.iter().map(|s| s.to_string()).collect(),
            registry: "kubernetes".to_string(),
            shortname: shortname.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn external_entry(ips: &[&str]) -> NameInfo {
        NameInfo {
            ips: ips.iter().map(|s| s.to_string()).collect(),
            registry: "external".to_string(),
            shortname: String::new(),
            namespace: String::new(),
        }
    }

    fn name_table(entries: Vec<(&str, NameInfo)>) -> NameTable {
        let mut table = HashMap::new();
        for (host, info) in entries {
            table.insert(host.to_string(), info);
        }
        NameTable { table }
    }

    fn test_ctx(search: Vec<&str>) -> NamingContext {
        NamingContext::new(
            "ns1",
            "svc.cluster.local",
            search.into_iter().map(str::to_string).collect(),
        )
    }

    fn rdata_strings(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| match r.data() {
                Some(RData::A(a)) => format!("A {}", a.0),
                Some(RData::AAAA(aaaa)) => format!("AAAA {}", aaaa.0),
                Some(RData::CNAME(cname)) => format!("CNAME {}", cname.0),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn naming_context_drops_duplicate_namespace_label() {
        let ctx = NamingContext::new("ns1", "ns1.svc.cluster.local", vec![]);
        assert_eq!(ctx.proxy_domain, "svc.cluster.local");
        assert_eq!(ctx.domain_parts[0], "svc");
    }

    #[test]
    fn naming_context_normalizes_search_suffixes() {
        let ctx = NamingContext::new(
            "ns1",
            "svc.cluster.local",
            vec!["NS1.svc.cluster.local".to_string(), String::new()],
        );
        assert_eq!(ctx.search, vec!["ns1.svc.cluster.local.".to_string()]);
    }

    #[test]
    fn kubernetes_entry_expands_alternate_hosts() {
        let nt = name_table(vec![(
            "reviews.ns2.svc.cluster.local",
            kube_entry("reviews", "ns2", &["10.0.0.1"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        assert!(table.contains("reviews.ns2.svc.cluster.local."));
        assert!(table.contains("reviews.ns2."));
        assert!(table.contains("reviews.ns2.svc."));
        // different namespace: no bare short name
        assert!(!table.contains("reviews."));
        assert_eq!(table.num_hosts(), 3);
    }

    #[test]
    fn same_namespace_entry_gets_bare_short_name() {
        let nt = name_table(vec![(
            "reviews.ns1.svc.cluster.local",
            kube_entry("reviews", "ns1", &["10.0.0.2"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        let (answers, ours) = table.lookup(RecordType::A, "reviews.");
        assert!(ours);
        assert_eq!(rdata_strings(&answers), vec!["A 10.0.0.2"]);
    }

    #[test]
    fn lookup_answers_a_and_nxdomains_aaaa() {
        let nt = name_table(vec![(
            "reviews.ns2.svc.cluster.local",
            kube_entry("reviews", "ns2", &["10.0.0.1"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        let (answers, ours) = table.lookup(RecordType::A, "reviews.ns2.");
        assert!(ours);
        assert_eq!(rdata_strings(&answers), vec!["A 10.0.0.1"]);

        // known host, no AAAA records: ours with an empty answer set
        let (answers, ours) = table.lookup(RecordType::AAAA, "reviews.ns2.");
        assert!(ours);
        assert!(answers.is_empty());

        // not ours at all
        let (answers, ours) = table.lookup(RecordType::A, "reviews.");
        assert!(!ours);
        assert!(answers.is_empty());
    }

    #[test]
    fn unsupported_query_types_are_forwarded() {
        let nt = name_table(vec![(
            "reviews.ns1.svc.cluster.local",
            kube_entry("reviews", "ns1", &["10.0.0.2"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        let (answers, ours) = table.lookup(RecordType::PTR, "reviews.ns1.svc.cluster.local.");
        assert!(!ours);
        assert!(answers.is_empty());
    }

    #[test]
    fn search_expansion_materializes_cname_chain() {
        let nt = name_table(vec![(
            "external.example.com",
            external_entry(&["93.184.216.34"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec!["ns1.svc.cluster.local"]));

        let expanded = "external.example.com.ns1.svc.cluster.local.";
        assert!(table.contains(expanded));

        let (answers, ours) = table.lookup(RecordType::A, expanded);
        assert!(ours);
        assert_eq!(
            rdata_strings(&answers),
            vec![
                "CNAME external.example.com.".to_string(),
                "A 93.184.216.34".to_string()
            ]
        );
    }

    #[test]
    fn search_expansion_does_not_shadow_proper_hosts() {
        // The expansion of `reviews.` with the first search suffix is the
        // canonical FQDN itself; it must stay an address record, not a
        // CNAME onto itself.
        let nt = name_table(vec![(
            "reviews.ns1.svc.cluster.local",
            kube_entry("reviews", "ns1", &["10.0.0.2"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec!["ns1.svc.cluster.local"]));

        let (answers, ours) = table.lookup(RecordType::A, "reviews.ns1.svc.cluster.local.");
        assert!(ours);
        assert_eq!(rdata_strings(&answers), vec!["A 10.0.0.2"]);
    }

    #[test]
    fn entries_with_no_valid_ips_are_skipped() {
        let nt = name_table(vec![
            ("broken.ns1.svc.cluster.local", kube_entry("broken", "ns1", &["not-an-ip"])),
            ("mixed.ns1.svc.cluster.local", kube_entry("mixed", "ns1", &["bogus", "10.1.1.1"])),
        ]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        assert!(!table.contains("broken.ns1.svc.cluster.local."));

        let (answers, ours) = table.lookup(RecordType::A, "mixed.");
        assert!(ours);
        assert_eq!(rdata_strings(&answers), vec!["A 10.1.1.1"]);
    }

    #[test]
    fn dual_stack_entry_serves_both_families() {
        let nt = name_table(vec![(
            "dual.ns1.svc.cluster.local",
            kube_entry("dual", "ns1", &["10.0.0.3", "fd00::3"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        let (a, _) = table.lookup(RecordType::A, "dual.");
        assert_eq!(rdata_strings(&a), vec!["A 10.0.0.3"]);
        let (aaaa, _) = table.lookup(RecordType::AAAA, "dual.");
        assert_eq!(rdata_strings(&aaaa), vec!["AAAA fd00::3"]);
    }

    #[test]
    fn entry_outside_proxy_domain_gets_fqdn_only() {
        let nt = name_table(vec![(
            "db.prod.internal",
            kube_entry("db", "prod", &["10.2.0.1"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));

        // kubernetes registry but outside the proxy domain: FQDN only
        assert!(table.contains("db.prod.internal."));
        assert!(!table.contains("db.prod."));
    }

    #[test]
    fn record_ttl_is_pinned() {
        let nt = name_table(vec![(
            "reviews.ns1.svc.cluster.local",
            kube_entry("reviews", "ns1", &["10.0.0.2"]),
        )]);
        let table = LookupTable::build(&nt, &test_ctx(vec![]));
        let (answers, _) = table.lookup(RecordType::A, "reviews.");
        assert_eq!(answers[0].ttl(), DEFAULT_TTL_SECONDS);
    }
}
