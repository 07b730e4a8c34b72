//! Finding the KDCs that serve a realm.
//!
//! Hosts come from every `krb.conf` on the search path, in order. When fewer than the
//! configured minimum are found the list is supplemented from DNS: SRV and TXT records under
//! the realm, then the conventional `kerberos`, `kerberos-1`, ... names.

use crate::config::ClientConfig;
use crate::constants::*;
use crate::error::KrbError;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdcProtocol {
    Udp,
    Tcp,
    Http,
}

impl KdcProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            KdcProtocol::Udp | KdcProtocol::Tcp => KRB_PORT,
            KdcProtocol::Http => KRB_HTTP_PORT,
        }
    }
}

impl fmt::Display for KdcProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdcProtocol::Udp => f.write_str("udp"),
            KdcProtocol::Tcp => f.write_str("tcp"),
            KdcProtocol::Http => f.write_str("http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdcHost {
    pub realm: String,
    pub protocol: KdcProtocol,
    pub host: String,
    pub port: u16,
    pub is_admin: bool,
}

impl KdcHost {
    /// Parse `[udp/|tcp/|http/|http://]host[:port]`.
    pub fn parse(realm: &str, spec: &str, is_admin: bool) -> Option<KdcHost> {
        let (protocol, rest) = if let Some(r) = spec.strip_prefix("http://") {
            (KdcProtocol::Http, r)
        } else if let Some(r) = spec.strip_prefix("http/") {
            (KdcProtocol::Http, r)
        } else if let Some(r) = spec.strip_prefix("tcp/") {
            (KdcProtocol::Tcp, r)
        } else if let Some(r) = spec.strip_prefix("udp/") {
            (KdcProtocol::Udp, r)
        } else {
            (KdcProtocol::Udp, spec)
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h, port),
                Err(_) => {
                    warn!(%spec, "Ignoring KDC with an invalid port");
                    return None;
                }
            },
            None => (rest, protocol.default_port()),
        };

        if host.is_empty() {
            return None;
        }

        Some(KdcHost {
            realm: realm.to_string(),
            protocol,
            host: host.to_string(),
            port,
            is_admin,
        })
    }

    fn key(&self) -> (String, u16, KdcProtocol) {
        (self.host.to_ascii_lowercase(), self.port, self.protocol)
    }
}

impl fmt::Display for KdcHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.protocol, self.host, self.port)
    }
}

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// Order SRV answers for use: lowest priority first, heavier weight first within a
/// priority. A target of `.` means the service is not offered and is dropped.
pub fn order_srv(mut records: Vec<SrvRecord>) -> Vec<(String, u16)> {
    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    records
        .into_iter()
        .map(|r| (r.target.trim_end_matches('.').to_string(), r.port))
        .filter(|(target, _)| !target.is_empty())
        .collect()
}

/// Name service lookups used while locating KDCs. Failures are reported as empty answers.
pub trait Resolver {
    fn resolve_host(&self, host: &str) -> Vec<IpAddr>;

    fn lookup_srv(&self, name: &str) -> Vec<SrvRecord>;

    fn lookup_txt(&self, name: &str) -> Vec<String>;
}

/// The system resolver: `getaddrinfo` for addresses, the system DNS configuration for SRV
/// and TXT records.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

/// Run a blocking DNS query on its own thread. The blocking resolver drives a private
/// runtime, which may not be started from inside the caller's.
fn blocking_lookup<T, F>(name: &str, lookup: F) -> Vec<T>
where
    T: Send,
    F: FnOnce(&hickory_resolver::Resolver, &str) -> Vec<T> + Send,
{
    std::thread::scope(|s| {
        s.spawn(|| match hickory_resolver::Resolver::from_system_conf() {
            Ok(resolver) => lookup(&resolver, name),
            Err(err) => {
                warn!(?err, "Unable to load the system resolver configuration");
                Vec::new()
            }
        })
        .join()
        .unwrap_or_default()
    })
}

impl Resolver for SystemResolver {
    fn resolve_host(&self, host: &str) -> Vec<IpAddr> {
        match dns_lookup::lookup_host(host) {
            Ok(addrs) => addrs,
            Err(err) => {
                trace!(?err, %host, "Host does not resolve");
                Vec::new()
            }
        }
    }

    fn lookup_srv(&self, name: &str) -> Vec<SrvRecord> {
        blocking_lookup(name, |resolver, name| match resolver.srv_lookup(name) {
            Ok(answer) => answer
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    target: srv.target().to_utf8(),
                    port: srv.port(),
                })
                .collect(),
            Err(err) => {
                trace!(?err, %name, "No SRV records");
                Vec::new()
            }
        })
    }

    fn lookup_txt(&self, name: &str) -> Vec<String> {
        blocking_lookup(name, |resolver, name| match resolver.txt_lookup(name) {
            Ok(answer) => answer
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>()
                })
                .collect(),
            Err(err) => {
                trace!(?err, %name, "No TXT records");
                Vec::new()
            }
        })
    }
}

/// The hosts listed for `realm` in one `krb.conf`. The first line names the local realm
/// and is skipped.
pub fn parse_krb_conf(contents: &str, realm: &str) -> Vec<KdcHost> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let r = fields.next()?;
            if r != realm {
                return None;
            }
            let spec = fields.next()?;
            let is_admin = fields.next().map(|f| f == "admin").unwrap_or(false);
            KdcHost::parse(realm, spec, is_admin)
        })
        .collect()
}

fn read_config(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(c) => Some(c),
        Err(io_err) => {
            warn!(?io_err, "Unable to read {}", path.display());
            None
        }
    }
}

pub struct KdcLocator<R: Resolver = SystemResolver> {
    config: ClientConfig,
    resolver: R,
    // Rebuilt wholesale when asked about a different realm.
    cached: Option<(String, Vec<KdcHost>)>,
}

impl KdcLocator<SystemResolver> {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_resolver(config, SystemResolver)
    }
}

impl<R: Resolver> KdcLocator<R> {
    pub fn with_resolver(config: &ClientConfig, resolver: R) -> Self {
        KdcLocator {
            config: config.clone(),
            resolver,
            cached: None,
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// The ordered KDCs for `realm`. With `want_admin` only administration servers are
    /// returned.
    pub fn locate(&mut self, realm: &str, want_admin: bool) -> Result<Vec<KdcHost>, KrbError> {
        let hosts = match &self.cached {
            Some((r, hosts)) if r == realm => hosts.clone(),
            _ => {
                let hosts = self.build(realm);
                self.cached = Some((realm.to_string(), hosts.clone()));
                hosts
            }
        };

        let hosts: Vec<_> = hosts
            .into_iter()
            .filter(|h| !want_admin || h.is_admin)
            .collect();

        if hosts.is_empty() {
            error!(%realm, want_admin, "No KDC found for realm");
            return Err(KrbError::NoKdcFound);
        }
        Ok(hosts)
    }

    fn valid(&self, host: &KdcHost) -> bool {
        if self.config.no_host_validation {
            return true;
        }
        let ok = !self.resolver.resolve_host(&host.host).is_empty();
        if !ok {
            debug!(%host, "Skipping KDC that does not resolve");
        }
        ok
    }

    fn build(&self, realm: &str) -> Vec<KdcHost> {
        let mut hosts = Vec::new();

        for path in self.config.config_files(KRB_CONF) {
            if let Some(contents) = read_config(&path) {
                let found = parse_krb_conf(&contents, realm);
                trace!(path = %path.display(), count = found.len(), "Read krb.conf");
                hosts.extend(found.into_iter().filter(|h| self.valid(h)));
            }
        }

        if hosts.len() < self.config.min_kdc_hosts {
            debug!(%realm, found = hosts.len(), "Supplementing KDCs from DNS");
            hosts.extend(self.from_dns(realm));
        }

        let mut seen = HashSet::new();
        let mut deduped: Vec<KdcHost> = Vec::with_capacity(hosts.len());
        for h in hosts {
            if seen.insert(h.key()) {
                deduped.push(h);
            } else if h.is_admin {
                if let Some(first) = deduped.iter_mut().find(|d| d.key() == h.key()) {
                    first.is_admin = true;
                }
            }
        }

        debug!(%realm, hosts = ?deduped, "Located KDCs");
        deduped
    }

    fn from_dns(&self, realm: &str) -> Vec<KdcHost> {
        let mut hosts = Vec::new();

        for protocol in [KdcProtocol::Udp, KdcProtocol::Tcp, KdcProtocol::Http] {
            let name = format!("_kerberos._{protocol}.{realm}.");
            for (target, port) in order_srv(self.resolver.lookup_srv(&name)) {
                let h = KdcHost {
                    realm: realm.to_string(),
                    protocol,
                    host: target,
                    port,
                    is_admin: false,
                };
                if self.valid(&h) {
                    hosts.push(h);
                }
            }
        }

        for txt in self.resolver.lookup_txt(&format!("_kerberos.{realm}.")) {
            for spec in txt.split_whitespace() {
                if let Some(h) = KdcHost::parse(realm, spec, false) {
                    if self.valid(&h) {
                        hosts.push(h);
                    }
                }
            }
        }

        for i in 0..self.config.dns_probe_limit {
            let name = match i {
                0 => format!("kerberos.{realm}."),
                n => format!("kerberos-{n}.{realm}."),
            };
            if self.resolver.resolve_host(&name).is_empty() {
                // kerberos-1 may exist without a bare kerberos name.
                if i == 0 {
                    continue;
                }
                break;
            }
            hosts.push(KdcHost {
                realm: realm.to_string(),
                protocol: KdcProtocol::Udp,
                host: name.trim_end_matches('.').to_string(),
                port: KRB_PORT,
                is_admin: false,
            });
        }

        hosts
    }

    /// The local realm: configured, or the first line of the first `krb.conf`.
    pub fn local_realm(&self) -> Result<String, KrbError> {
        if let Some(realm) = &self.config.realm {
            return Ok(realm.clone());
        }
        self.config
            .config_files(KRB_CONF)
            .iter()
            .filter_map(|p| read_config(p))
            .find_map(|c| {
                c.lines()
                    .next()
                    .and_then(|l| l.split_whitespace().next())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                error!("No local realm is configured");
                KrbError::ConfigError
            })
    }

    /// The realm `host` belongs to, per `krb.realms`. An exact host entry wins over a
    /// `.domain` entry. Without either, the upper cased domain of the host is used.
    pub fn realm_of_host(&self, host: &str) -> Result<String, KrbError> {
        let host = host.to_ascii_lowercase();
        let mut domain_match: Option<String> = None;

        for path in self.config.config_files(KRB_RLM_TRANS) {
            let Some(contents) = read_config(&path) else {
                continue;
            };
            for line in contents.lines() {
                let mut fields = line.split_whitespace();
                let (Some(pattern), Some(realm)) = (fields.next(), fields.next()) else {
                    continue;
                };
                let pattern = pattern.to_ascii_lowercase();
                if pattern.starts_with('.') {
                    if domain_match.is_none() && host.ends_with(&pattern) {
                        domain_match = Some(realm.to_string());
                    }
                } else if pattern == host {
                    return Ok(realm.to_string());
                }
            }
        }

        if let Some(realm) = domain_match {
            return Ok(realm);
        }
        match host.split_once('.') {
            Some((_, domain)) if !domain.is_empty() => Ok(domain.to_ascii_uppercase()),
            _ => self.local_realm(),
        }
    }
}
