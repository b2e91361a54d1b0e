use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use smol_str::SmolStr;
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use sip_wire::Proto;

/// One SRV answer row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: SmolStr,
    pub port: u16,
}

/// DNS lookups the hop resolver needs: SRV and address records only.
///
/// NAPTR and the rest of the RFC 3263 machinery are deliberately absent;
/// the resolver above this trait decides which names to query.
#[async_trait]
pub trait DnsClient: Send + Sync + 'static {
    /// Looks up SRV records for a service name like `_sip._udp.example.com`.
    /// An empty vector means the name exists but has no usable records.
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    /// Looks up addresses for a bare host name.
    async fn host(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Builds the SRV query name for a protocol and domain.
pub fn srv_name(proto: Proto, domain: &str) -> String {
    format!("_sip._{}.{}", proto.as_str(), domain)
}

/// `DnsClient` backed by the system resolver via trust-dns.
#[derive(Clone)]
pub struct SystemDns {
    resolver: TokioAsyncResolver,
}

impl SystemDns {
    /// Creates a client using default resolver configuration.
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Creates a client with custom resolver configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for SystemDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsClient for SystemDns {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let lookup = self.resolver.srv_lookup(name).await?;
        let mut records: Vec<SrvRecord> = lookup
            .iter()
            .map(|rec| SrvRecord {
                priority: rec.priority(),
                weight: rec.weight(),
                target: SmolStr::new(rec.target().to_utf8().trim_end_matches('.')),
                port: rec.port(),
            })
            .collect();
        // Stable order: priority first, DNS answer order within a priority.
        records.sort_by_key(|r| r.priority);
        Ok(records)
    }

    async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.resolver.lookup_ip(name).await?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            Err(anyhow!("no address records for {}", name))
        } else {
            Ok(addrs)
        }
    }
}

/// Scripted `DnsClient` for tests: fixed answers plus a query log, so suites
/// can assert both what resolution produced and that DNS was (not) consulted.
#[derive(Default)]
pub struct StaticDns {
    srv: HashMap<String, Vec<SrvRecord>>,
    hosts: HashMap<String, Vec<IpAddr>>,
    queries: Mutex<Vec<String>>,
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts an SRV answer for a full service name.
    pub fn with_srv(mut self, name: &str, records: Vec<SrvRecord>) -> Self {
        self.srv.insert(name.to_owned(), records);
        self
    }

    /// Scripts address records for a host.
    pub fn with_host(mut self, name: &str, addrs: Vec<IpAddr>) -> Self {
        self.hosts.insert(name.to_owned(), addrs);
        self
    }

    /// Returns every query issued so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    fn log(&self, kind: &str, name: &str) {
        self.queries.lock().unwrap().push(format!("{} {}", kind, name));
    }
}

#[async_trait]
impl DnsClient for StaticDns {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        self.log("SRV", name);
        Ok(self.srv.get(name).cloned().unwrap_or_default())
    }

    async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
        self.log("A", name);
        self.hosts
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no address records for {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srv_name_formats_service() {
        assert_eq!(srv_name(Proto::Udp, "example.com"), "_sip._udp.example.com");
        assert_eq!(srv_name(Proto::Tcp, "example.com"), "_sip._tcp.example.com");
    }

    #[tokio::test]
    async fn static_dns_returns_scripted_records() {
        let dns = StaticDns::new().with_srv(
            "_sip._udp.example.com",
            vec![SrvRecord {
                priority: 10,
                weight: 0,
                target: SmolStr::new("sip.example.com"),
                port: 5060,
            }],
        );
        let records = dns.srv("_sip._udp.example.com").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target.as_str(), "sip.example.com");
        // Unscripted names answer empty, not error.
        assert!(dns.srv("_sip._tcp.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_dns_logs_queries() {
        let dns = StaticDns::new().with_host("h.example.com", vec!["192.0.2.7".parse().unwrap()]);
        dns.host("h.example.com").await.unwrap();
        let _ = dns.srv("_sip._udp.example.com").await;
        assert_eq!(
            dns.queries(),
            vec!["A h.example.com", "SRV _sip._udp.example.com"]
        );
    }

    #[tokio::test]
    async fn static_dns_unknown_host_errors() {
        let dns = StaticDns::new();
        assert!(dns.host("missing.example.com").await.is_err());
    }
}
