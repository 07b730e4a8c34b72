use std::time::Duration;

pub const KRB_PROT_VERSION: u8 = 4;

/// Field buffer sizes, including the terminating NUL.
pub const ANAME_SZ: usize = 40;
pub const INST_SZ: usize = 40;
pub const REALM_SZ: usize = 40;

/// Longest string (excluding NUL) accepted for a name, instance or realm.
pub const MAX_NAME_LEN: usize = ANAME_SZ - 1;
pub const MAX_INST_LEN: usize = INST_SZ - 1;
pub const MAX_REALM_LEN: usize = REALM_SZ - 1;

/// Upper bound on any message buffer (KTEXT).
pub const MAX_KTXT_LEN: usize = 1250;

pub const DES_KEY_LEN: usize = 8;
pub const DES_BLOCK_SIZE: usize = 8;
pub const CHECKSUM_LEN: usize = 16;

/// Default tolerated difference between our clock and a peer's, in seconds.
pub const CLOCK_SKEW: u32 = 5 * 60;

pub const KRB_TICKET_GRANTING_TICKET: &str = "krbtgt";

/// Ten hours, in five minute units.
pub const DEFAULT_TKT_LIFE: u8 = 120;

pub const KRB_PORT: u16 = 750;
pub const KRB_HTTP_PORT: u16 = 80;

pub const DEFAULT_KDC_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_KDC_RETRIES: usize = 5;

pub const TF_LCK_RETRY: Duration = Duration::from_secs(2);
pub const TF_LCK_RETRY_COUNT: usize = 50;

pub const DEFAULT_TICKET_FILE: &str = "/tmp/tkt%{uid}";

pub const KRB_CONF: &str = "krb.conf";
pub const KRB_RLM_TRANS: &str = "krb.realms";
pub const KRB_EQUIV: &str = "krb.equiv";
pub const KRB_EXTRA: &str = "krb.extra";

pub const DEFAULT_CONFIG_DIRS: &[&str] = &["/etc", "/etc/kerberosIV", "/usr/kerberos/lib"];

/// Inter-realm chaining depth for the ticket granting exchange.
pub const MAX_REALM_HOPS: usize = 1;

pub const DEFAULT_DNS_PROBE_LIMIT: usize = 10;

pub const KEYFILE: &str = "/etc/srvtab";
