use crate::constants::*;
use crate::error::KrbError;
use crate::proto::LifetimeCodec;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const ENV_CONFIG_DIR: &str = "KRBCONFDIR";
pub const ENV_TICKET_FILE: &str = "KRBTKFILE";

fn default_clock_skew() -> u32 {
    CLOCK_SKEW
}

fn default_kdc_timeout() -> u64 {
    DEFAULT_KDC_TIMEOUT.as_secs()
}

fn default_kdc_retries() -> usize {
    DEFAULT_KDC_RETRIES
}

fn default_config_dirs() -> Vec<PathBuf> {
    DEFAULT_CONFIG_DIRS.iter().map(PathBuf::from).collect()
}

fn default_min_kdc_hosts() -> usize {
    1
}

fn default_dns_probe_limit() -> usize {
    DEFAULT_DNS_PROBE_LIMIT
}

fn default_lock_retry_count() -> usize {
    TF_LCK_RETRY_COUNT
}

fn default_lock_retry_interval_ms() -> u64 {
    TF_LCK_RETRY.as_millis() as u64
}

fn default_true() -> bool {
    true
}

/// Client tunables, read from `krb.extra` as toml. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Overrides the local realm named by `krb.conf`.
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default = "default_clock_skew")]
    pub clock_skew: u32,
    /// Record the KDC's clock offset instead of failing on skew.
    #[serde(default)]
    pub kdc_timesync: bool,
    #[serde(default = "default_kdc_timeout")]
    pub kdc_timeout: u64,
    #[serde(default = "default_kdc_retries")]
    pub kdc_retries: usize,
    #[serde(default)]
    pub ticket_file: Option<String>,
    #[serde(default = "default_config_dirs")]
    pub config_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub no_host_validation: bool,
    #[serde(default = "default_min_kdc_hosts")]
    pub min_kdc_hosts: usize,
    #[serde(default = "default_dns_probe_limit")]
    pub dns_probe_limit: usize,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub reverse_lsb_test: bool,
    #[serde(default)]
    pub short_lifetimes: bool,
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: usize,
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
    #[serde(default = "default_true")]
    pub check_address: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            realm: None,
            clock_skew: default_clock_skew(),
            kdc_timesync: false,
            kdc_timeout: default_kdc_timeout(),
            kdc_retries: default_kdc_retries(),
            ticket_file: None,
            config_dirs: default_config_dirs(),
            no_host_validation: false,
            min_kdc_hosts: default_min_kdc_hosts(),
            dns_probe_limit: default_dns_probe_limit(),
            http_proxy: None,
            reverse_lsb_test: false,
            short_lifetimes: false,
            lock_retry_count: default_lock_retry_count(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            check_address: true,
        }
    }
}

impl ClientConfig {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<ClientConfig, KrbError> {
        let mut contents = String::new();
        let mut f = fs::File::open(&path).map_err(|err| {
            error!(?err, path = %path.as_ref().display(), "Unable to open config");
            KrbError::ConfigError
        })?;
        f.read_to_string(&mut contents)?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<ClientConfig, KrbError> {
        toml::from_str(contents).map_err(|err| {
            error!(?err, "toml parse failure");
            KrbError::ConfigError
        })
    }

    /// Load `krb.extra` from the first configuration directory holding one, or the defaults.
    pub fn from_env() -> Result<ClientConfig, KrbError> {
        let defaults = ClientConfig::default();
        match defaults.config_files(KRB_EXTRA).into_iter().next() {
            Some(path) => {
                debug!(path = %path.display(), "loading client configuration");
                Self::parse(path)
            }
            None => Ok(defaults),
        }
    }

    /// The directories searched for configuration files, `$KRBCONFDIR` first.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(self.config_dirs.len() + 1);
        if let Some(dir) = env::var_os(ENV_CONFIG_DIR) {
            dirs.push(PathBuf::from(dir));
        }
        dirs.extend(self.config_dirs.iter().cloned());
        dirs
    }

    /// Every existing file called `name` in the search directories, in search order.
    pub fn config_files(&self, name: &str) -> Vec<PathBuf> {
        self.search_dirs()
            .into_iter()
            .map(|d| d.join(name))
            .filter(|p| p.is_file())
            .collect()
    }

    /// The ticket cache path template: `$KRBTKFILE`, then the configured value, then the default.
    pub fn ticket_file_template(&self) -> String {
        env::var(ENV_TICKET_FILE)
            .ok()
            .or_else(|| self.ticket_file.clone())
            .unwrap_or_else(|| DEFAULT_TICKET_FILE.to_string())
    }

    pub fn kdc_timeout(&self) -> Duration {
        Duration::from_secs(self.kdc_timeout)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn lifetime_codec(&self) -> LifetimeCodec {
        LifetimeCodec::from_short_lifetimes(self.short_lifetimes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Network {
    addr: u32,
    mask: u32,
}

impl Network {
    fn parse(s: &str) -> Option<Network> {
        let (addr, bits) = match s.split_once('/') {
            Some((a, b)) => (a, b.parse::<u32>().ok().filter(|b| *b <= 32)?),
            None => (s, 32),
        };
        let addr: Ipv4Addr = addr.parse().ok()?;
        let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
        Some(Network {
            addr: u32::from(addr) & mask,
            mask,
        })
    }

    fn contains(&self, a: Ipv4Addr) -> bool {
        u32::from(a) & self.mask == self.addr
    }
}

/// Groups of addresses that are treated as the same sender, one group per line of `krb.equiv`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressEquivalence {
    groups: Vec<Vec<Network>>,
}

impl AddressEquivalence {
    pub fn parse(contents: &str) -> Self {
        let groups = contents
            .lines()
            .map(|l| l.split('#').next().unwrap_or_default())
            .filter_map(|l| {
                let nets: Vec<Network> = l
                    .split_whitespace()
                    .filter_map(|tok| {
                        let n = Network::parse(tok);
                        if n.is_none() {
                            warn!(%tok, "ignoring invalid address in equivalence file");
                        }
                        n
                    })
                    .collect();
                if nets.is_empty() {
                    None
                } else {
                    Some(nets)
                }
            })
            .collect();
        AddressEquivalence { groups }
    }

    /// Read the first `krb.equiv` found. A missing file means no equivalences.
    pub fn load(config: &ClientConfig) -> Result<Self, KrbError> {
        match config.config_files(KRB_EQUIV).into_iter().next() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err: io::Error| {
                    error!(?err, path = %path.display(), "Unable to read equivalence file");
                    KrbError::ConfigError
                })?;
                Ok(Self::parse(&contents))
            }
            None => Ok(AddressEquivalence::default()),
        }
    }

    pub fn equivalent(&self, a: Ipv4Addr, b: Ipv4Addr) -> bool {
        a == b
            || self
                .groups
                .iter()
                .any(|g| g.iter().any(|n| n.contains(a)) && g.iter().any(|n| n.contains(b)))
    }
}
