use crate::ccache::{self, parse_ccache_name, LockPolicy, TicketCache};
use crate::config::{AddressEquivalence, ClientConfig};
use crate::constants::*;
use crate::error::KrbError;
use crate::locator::{KdcLocator, Resolver, SystemResolver};
use crate::proto::ap_req::{build_request, ApReq, ApReqVerifier, ServerKeyLookup};
use crate::proto::reply::{KdcReply, KerberosReply};
use crate::proto::request::KerberosRequest;
use crate::proto::safe::MessageContext;
use crate::proto::ticket::{decompose_ciph, CiphContents};
use crate::proto::time::{unix_now, within_skew, KrbTime, LifetimeCodec};
use crate::proto::{Credential, DerivedKey, KeyProc, Principal};
use crate::transport::KdcTransport;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// A ticket returned by the KDC.
#[derive(Debug)]
pub struct TicketOutcome {
    pub credential: Credential,
    /// When the client's password expires, as reported by the KDC.
    pub exp_date: u32,
    /// The ticket was obtained either way. This reports whether it also reached the cache.
    pub cache_status: Result<(), KrbError>,
}

/// Per-process client state: configuration, the KDC locator and the clock offset learned
/// from the KDC.
pub struct KrbContext<R: Resolver = SystemResolver> {
    config: ClientConfig,
    locator: KdcLocator<R>,
    transport: KdcTransport,
    lock_policy: LockPolicy,
    ticket_file: PathBuf,
    time_offset: i64,
}

impl KrbContext<SystemResolver> {
    pub fn new(config: ClientConfig) -> Self {
        let locator = KdcLocator::new(&config);
        Self::with_locator(config, locator)
    }

    pub fn from_env() -> Result<Self, KrbError> {
        ClientConfig::from_env().map(Self::new)
    }
}

impl<R: Resolver> KrbContext<R> {
    pub fn with_locator(config: ClientConfig, locator: KdcLocator<R>) -> Self {
        let ticket_file = parse_ccache_name(Some(&config.ticket_file_template()));
        KrbContext {
            transport: KdcTransport::from_config(&config),
            lock_policy: LockPolicy::from_config(&config),
            ticket_file,
            time_offset: 0,
            locator,
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn ticket_file(&self) -> &Path {
        &self.ticket_file
    }

    pub fn set_ticket_file(&mut self, path: &Path) {
        self.ticket_file = path.to_path_buf();
    }

    /// Seconds added to the local clock, learned from KDC replies when `kdc_timesync` is set.
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn local_realm(&self) -> Result<String, KrbError> {
        self.locator.local_realm()
    }

    pub fn realm_of_host(&self, host: &str) -> Result<String, KrbError> {
        self.locator.realm_of_host(host)
    }

    fn codec(&self) -> LifetimeCodec {
        self.config.lifetime_codec()
    }

    /// Context for safe and private messages, carrying this client's skew and clock offset.
    pub fn message_context(&self) -> Result<MessageContext, KrbError> {
        let equivalence = AddressEquivalence::load(&self.config)?;
        let mut ctx = MessageContext::from_config(&self.config, equivalence);
        ctx.time_offset = self.time_offset;
        Ok(ctx)
    }

    /// A verifier for requests addressed to `service`, configured like this client.
    pub fn verifier<L: ServerKeyLookup>(&self, service: &Principal, keys: L) -> ApReqVerifier<L> {
        let mut verifier = ApReqVerifier::new(service, keys);
        verifier.clock_skew = self.config.clock_skew;
        verifier.check_address = self.config.check_address;
        verifier.codec = self.codec();
        verifier.time_offset = self.time_offset;
        verifier
    }

    async fn exchange(&mut self, realm: &str, request: &KerberosRequest) -> Result<KdcReply, KrbError> {
        let bytes = request.to_bytes()?;
        let hosts = self.locator.locate(realm, false)?;
        let reply = self.transport.send_to_kdc(&bytes, &hosts).await?;

        match KerberosReply::from_bytes(&reply)? {
            KerberosReply::Success(reply) => Ok(reply),
            KerberosReply::Error(err) => {
                error!(code = err.code, text = %err.text, %realm, "KDC rejected request");
                Err(err.to_krb_error())
            }
        }
    }

    fn check_service(requested: &Principal, ciph: &CiphContents) -> Result<(), KrbError> {
        if &ciph.service != requested {
            error!(%requested, returned = %ciph.service, "KDC reply is for a different service");
            return Err(KrbError::IdentityMismatch);
        }
        Ok(())
    }

    fn check_freshness(&mut self, kdc_time: u32) -> Result<(), KrbError> {
        if self.config.kdc_timesync {
            let local = unix_now(0)?;
            self.time_offset = i64::from(kdc_time) - i64::from(local);
            debug!(offset = self.time_offset, "Recorded KDC clock offset");
            return Ok(());
        }

        let local = unix_now(self.time_offset)?;
        if !within_skew(local, kdc_time, self.config.clock_skew) {
            error!(local, kdc_time, "KDC reply is outside the allowed clock skew");
            return Err(KrbError::ClockSkewExceeded);
        }
        Ok(())
    }

    /// Request an initial ticket for `service` from the client's realm and start a new cache
    /// holding it.
    #[instrument(level = "debug", skip_all)]
    pub async fn get_in_tkt(
        &mut self,
        client: &Principal,
        service: &Principal,
        lifetime: u8,
        key_proc: &KeyProc,
    ) -> Result<TicketOutcome, KrbError> {
        let now = unix_now(self.time_offset)?;
        let request = KerberosRequest::build_as(client, service, now)
            .lifetime(lifetime)
            .build();

        let reply = self.exchange(client.realm(), &request).await?;

        if reply.client.name() != client.name() || reply.client.instance() != client.instance() {
            error!(requested = %client, returned = %reply.client, "KDC reply is for a different client");
            return Err(KrbError::IdentityMismatch);
        }

        let key = key_proc.key_for(client, reply.kvno)?;
        let ciph = decompose_ciph(&reply.cipher, &key, reply.order)?;
        drop(key);

        Self::check_service(service, &ciph)?;
        self.check_freshness(ciph.kdc_time)?;

        let credential = Credential::from(ciph);
        let cache_status = self.store_initial(client, &credential);
        info!(%client, %service, "Obtained initial ticket");

        Ok(TicketOutcome {
            credential,
            exp_date: reply.exp_date,
            cache_status,
        })
    }

    fn store_initial(&self, client: &Principal, cred: &Credential) -> Result<(), KrbError> {
        let res = TicketCache::create(&self.ticket_file, &self.lock_policy).and_then(|mut cache| {
            cache.write_header(client)?;
            cache.append_credential(cred)
        });
        if let Err(err) = &res {
            warn!(?err, "Ticket obtained but not cached");
        }
        res
    }

    fn store_additional(&self, cred: &Credential) -> Result<(), KrbError> {
        let res = TicketCache::open_for_append(&self.ticket_file, &self.lock_policy)
            .and_then(|mut cache| cache.append_credential(cred));
        if let Err(err) = &res {
            warn!(?err, "Ticket obtained but not cached");
        }
        res
    }

    /// The cache's client and credentials. The client takes the realm of the first
    /// credential, which is the initial ticket granting ticket.
    pub fn read_cache(&self) -> Result<(Principal, Vec<Credential>), KrbError> {
        let (client, creds) = ccache::read_all(&self.ticket_file, "", &self.lock_policy)?;
        let realm = match creds.first() {
            Some(c) => c.service.realm().to_string(),
            None => self.local_realm()?,
        };
        Ok((client.with_realm(&realm)?, creds))
    }

    fn find_current(&self, creds: &[Credential], service: &Principal) -> Result<Option<Credential>, KrbError> {
        let now = unix_now(self.time_offset)?;
        let codec = self.codec();
        Ok(creds
            .iter()
            .rev()
            .find(|c| &c.service == service && !c.is_expired(now, codec))
            .cloned())
    }

    /// The cached credential for `service`.
    pub fn get_cred(&self, service: &Principal) -> Result<Credential, KrbError> {
        ccache::get_cred(&self.ticket_file, service, &self.lock_policy)
    }

    async fn tgs_exchange(
        &mut self,
        client: &Principal,
        tgt: &Credential,
        service: &Principal,
        lifetime: u8,
    ) -> Result<TicketOutcome, KrbError> {
        let now = KrbTime::now(self.time_offset)?;
        let request = KerberosRequest::build_tgs(service, now)
            .lifetime(lifetime)
            .preauth_ap_req(client, tgt)?
            .build()?;

        // The ticket granting service lives in the realm named by the ticket's instance.
        let reply = self.exchange(tgt.service.instance(), &request).await?;

        let key = DerivedKey::from(&tgt.session_key);
        let ciph = decompose_ciph(&reply.cipher, &key, reply.order)?;
        drop(key);

        Self::check_service(service, &ciph)?;
        self.check_freshness(ciph.kdc_time)?;

        let credential = Credential::from(ciph);
        let cache_status = self.store_additional(&credential);
        debug!(%service, "Obtained service ticket");

        Ok(TicketOutcome {
            credential,
            exp_date: reply.exp_date,
            cache_status,
        })
    }

    /// Request a ticket for `service` from the ticket granting service, crossing into the
    /// service's realm first when the cache holds no ticket granting ticket for it.
    #[instrument(level = "debug", skip_all)]
    pub async fn get_ad_tkt(&mut self, service: &Principal, lifetime: u8) -> Result<TicketOutcome, KrbError> {
        let (client, mut creds) = self.read_cache()?;
        let target = Principal::krbtgt(service.realm(), client.realm())?;

        let mut hops = 0;
        let tgt = loop {
            if let Some(tgt) = self.find_current(&creds, &target)? {
                break tgt;
            }
            if hops >= MAX_REALM_HOPS || service.realm() == client.realm() {
                error!(%target, "No ticket granting ticket");
                return Err(KrbError::NoTicketGrantingTicket);
            }
            hops += 1;

            let home = Principal::krbtgt(client.realm(), client.realm())?;
            let Some(home_tgt) = self.find_current(&creds, &home)? else {
                error!(%home, "No ticket granting ticket for the home realm");
                return Err(KrbError::NoTicketGrantingTicket);
            };
            debug!(%target, "Requesting cross realm ticket granting ticket");
            let outcome = self.tgs_exchange(&client, &home_tgt, &target, lifetime).await?;
            creds.push(outcome.credential);
        };

        self.tgs_exchange(&client, &tgt, service, lifetime).await
    }

    /// Build an application request for `service`, fetching a service ticket first when the
    /// cache holds no current one.
    #[instrument(level = "debug", skip_all)]
    pub async fn mk_req(
        &mut self,
        service: &Principal,
        checksum: u32,
        mutual: bool,
    ) -> Result<(ApReq, Credential), KrbError> {
        let (client, creds) = self.read_cache()?;
        let cred = match self.find_current(&creds, service)? {
            Some(cred) => cred,
            None => self.get_ad_tkt(service, DEFAULT_TKT_LIFE).await?.credential,
        };

        let ap_req = build_request(&client, &cred, checksum, mutual, KrbTime::now(self.time_offset)?)?;
        Ok((ap_req, cred))
    }

    /// Erase and remove the ticket cache.
    pub fn dest_tkt(&self) -> Result<(), KrbError> {
        ccache::destroy(&self.ticket_file, &self.lock_policy)
    }
}

impl From<CiphContents> for Credential {
    fn from(ciph: CiphContents) -> Self {
        Credential {
            service: ciph.service,
            session_key: ciph.session_key,
            lifetime: ciph.lifetime,
            kvno: ciph.kvno,
            ticket: ciph.ticket,
            issue_date: ciph.kdc_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ap_req::verify_mutual_reply;
    use crate::proto::reply::KdcErrorCode;
    use crate::proto::ticket::{create_ciph, create_ticket, TicketContents};
    use crate::proto::wire::ByteOrder;
    use crate::proto::SessionKey;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    const CLIENT_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

    /// Answers AS and TGS requests for one realm.
    struct FakeKdc {
        realm: String,
        principals: Vec<(Principal, DerivedKey)>,
        clock_offset: i64,
        // Issue tickets naming this service instead of the requested one.
        wrong_service: Option<Principal>,
    }

    impl FakeKdc {
        fn new(realm: &str) -> Self {
            FakeKdc {
                realm: realm.to_string(),
                principals: Vec::new(),
                clock_offset: 0,
                wrong_service: None,
            }
        }

        fn add(mut self, principal: Principal, key: DerivedKey) -> Self {
            self.principals.push((principal, key));
            self
        }

        fn key(&self, principal: &Principal) -> Option<DerivedKey> {
            self.principals
                .iter()
                .find(|(p, _)| p == principal)
                .map(|(_, k)| k.clone())
        }

        fn issue(
            &self,
            client: &Principal,
            service: &Principal,
            lifetime: u8,
            reply_key: &DerivedKey,
        ) -> KerberosReply {
            let now = unix_now(self.clock_offset).unwrap();
            let Some(service_key) = self.key(service) else {
                return KerberosReply::error_principal_unknown(client, now);
            };
            let session_key = SessionKey::generate();
            let ticket = create_ticket(
                &TicketContents {
                    flags: 0,
                    client: client.clone(),
                    address: CLIENT_ADDR,
                    session_key: session_key.clone(),
                    lifetime,
                    issue_time: now,
                    service_name: service.name().to_string(),
                    service_instance: service.instance().to_string(),
                },
                &service_key,
            )
            .unwrap();

            let cipher = create_ciph(
                &CiphContents {
                    session_key,
                    service: self.wrong_service.clone().unwrap_or_else(|| service.clone()),
                    lifetime,
                    kvno: service_key.kvno(),
                    ticket,
                    kdc_time: now,
                },
                reply_key,
            )
            .unwrap();

            KerberosReply::Success(KdcReply {
                client: client.clone(),
                time: now,
                n_tickets: 1,
                exp_date: now + 86400 * 30,
                kvno: reply_key.kvno(),
                cipher,
                order: ByteOrder::Big,
            })
        }

        fn handle(&self, request: &[u8]) -> Vec<u8> {
            let reply = match KerberosRequest::from_bytes(request).unwrap() {
                KerberosRequest::AS(req) => {
                    let service =
                        Principal::new(&req.service_name, &req.service_instance, &self.realm).unwrap();
                    match self.key(&req.client) {
                        Some(client_key) => self.issue(&req.client, &service, req.lifetime, &client_key),
                        None => KerberosReply::error(
                            &req.client,
                            req.time,
                            KdcErrorCode::PrincipalUnknown,
                            "Principal unknown",
                        ),
                    }
                }
                KerberosRequest::TGS(req) => {
                    let tgs = Principal::krbtgt(&self.realm, &req.ap_req.realm).unwrap();
                    let tgs_key = self.key(&tgs).unwrap();
                    let mut verifier = ApReqVerifier::new(&tgs.with_realm(&self.realm).unwrap(), tgs_key);
                    let auth = verifier.verify(&req.ap_req, req.order, None).unwrap();
                    let service =
                        Principal::new(&req.service_name, &req.service_instance, &self.realm).unwrap();
                    self.issue(&auth.client, &service, req.lifetime, &DerivedKey::from(&auth.session_key))
                }
            };
            reply.to_bytes().unwrap()
        }

        /// Serve requests until the test finishes, returning the bound port.
        async fn spawn(self) -> u16 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = socket.local_addr().unwrap().port();
            let kdc = Arc::new(self);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let (len, from) = socket.recv_from(&mut buf).await.unwrap();
                    let reply = kdc.handle(&buf[..len]);
                    socket.send_to(&reply, from).await.unwrap();
                }
            });
            port
        }
    }

    fn alice() -> Principal {
        Principal::new("alice", "", "EXAMPLE.COM").unwrap()
    }

    fn krbtgt() -> Principal {
        Principal::krbtgt("EXAMPLE.COM", "EXAMPLE.COM").unwrap()
    }

    fn rcmd() -> Principal {
        Principal::new("rcmd", "host", "EXAMPLE.COM").unwrap()
    }

    fn alice_key() -> DerivedKey {
        DerivedKey::from_passphrase("alice-password", 1).unwrap()
    }

    fn tgs_key() -> DerivedKey {
        DerivedKey::from_passphrase("krbtgt-example", 3).unwrap()
    }

    fn rcmd_key() -> DerivedKey {
        DerivedKey::from_passphrase("rcmd-host", 2).unwrap()
    }

    fn example_kdc() -> FakeKdc {
        FakeKdc::new("EXAMPLE.COM")
            .add(alice(), alice_key())
            .add(krbtgt(), tgs_key())
            .add(rcmd(), rcmd_key())
    }

    fn context(dir: &tempfile::TempDir, krb_conf: &str) -> KrbContext {
        std::fs::write(dir.path().join(KRB_CONF), krb_conf).unwrap();
        let config = ClientConfig {
            config_dirs: vec![dir.path().to_path_buf()],
            no_host_validation: true,
            kdc_timeout: 2,
            kdc_retries: 1,
            ..Default::default()
        };
        let mut ctx = KrbContext::new(config);
        ctx.set_ticket_file(&dir.path().join("tkt"));
        ctx
    }

    async fn logged_in(kdc: FakeKdc) -> (tempfile::TempDir, KrbContext) {
        let port = kdc.spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));
        ctx.get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await
            .unwrap()
            .cache_status
            .unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_initial_ticket_is_cached() {
        let _ = tracing_subscriber::fmt::try_init();
        let port = example_kdc().spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));

        let outcome = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await
            .unwrap();
        assert_eq!(outcome.cache_status, Ok(()));
        assert_eq!(outcome.credential.service, krbtgt());
        assert_eq!(outcome.credential.lifetime, 0x60);
        assert_eq!(outcome.credential.kvno, 3);
        assert!(outcome.exp_date > outcome.credential.issue_date);

        let mut cache = TicketCache::open_for_read(ctx.ticket_file(), &LockPolicy::default()).unwrap();
        assert_eq!(cache.read_header("EXAMPLE.COM").unwrap(), alice());
        assert_eq!(cache.read_next_credential().unwrap(), Some(outcome.credential.clone()));
        assert_eq!(cache.read_next_credential().unwrap(), None);
        drop(cache);

        let (client, creds) = ctx.read_cache().unwrap();
        assert_eq!(client, alice());
        assert_eq!(creds, vec![outcome.credential]);
    }

    #[tokio::test]
    async fn test_initial_ticket_wrong_password_or_client() {
        let port = example_kdc().spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));

        let res = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("not-her-password"))
            .await;
        assert!(res.is_err());
        assert!(!ctx.ticket_file().exists());

        let bob = Principal::new("bob", "", "EXAMPLE.COM").unwrap();
        let res = ctx
            .get_in_tkt(&bob, &krbtgt(), 0x60, &KeyProc::password("bob"))
            .await;
        assert_eq!(
            res.err(),
            Some(KrbError::KdcRejected(
                KdcErrorCode::PrincipalUnknown.into(),
                "Principal unknown".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_initial_ticket_identity_mismatch() {
        let mut kdc = example_kdc();
        kdc.wrong_service = Some(Principal::new("other-service", "", "EXAMPLE.COM").unwrap());
        let port = kdc.spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));

        let res = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await;
        assert_eq!(res.err(), Some(KrbError::IdentityMismatch));
        assert!(!ctx.ticket_file().exists());
    }

    #[tokio::test]
    async fn test_initial_ticket_clock_skew() {
        let mut kdc = example_kdc();
        kdc.clock_offset = -3600;
        let port = kdc.spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));

        let res = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await;
        assert_eq!(res.err(), Some(KrbError::ClockSkewExceeded));
        assert!(!ctx.ticket_file().exists());

        // With time sync the offset is learned instead.
        ctx.config.kdc_timesync = true;
        let outcome = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await
            .unwrap();
        assert_eq!(outcome.cache_status, Ok(()));
        assert!((ctx.time_offset() + 3600).abs() <= 2);
    }

    #[tokio::test]
    async fn test_cache_failure_is_reported_separately() {
        let port = example_kdc().spawn().await;
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir, &format!("EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{port}\n"));
        ctx.set_ticket_file(&dir.path().join("missing-dir").join("tkt"));

        let outcome = ctx
            .get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await
            .unwrap();
        assert_eq!(outcome.credential.service, krbtgt());
        assert!(outcome.cache_status.is_err());
    }

    #[tokio::test]
    async fn test_mk_req_fetches_service_ticket() {
        let _ = tracing_subscriber::fmt::try_init();
        let (_dir, mut ctx) = logged_in(example_kdc()).await;

        assert!(ctx.get_cred(&rcmd()).is_err());
        let (ap_req, cred) = ctx.mk_req(&rcmd(), 0x1234, true).await.unwrap();
        assert_eq!(ctx.get_cred(&rcmd()).unwrap(), cred);

        let mut verifier = ctx.verifier(&rcmd(), rcmd_key());
        let auth = verifier
            .read_request(&ap_req.to_bytes().unwrap(), Some(CLIENT_ADDR))
            .unwrap();
        assert_eq!(auth.client, alice());
        assert_eq!(auth.checksum, 0x1234);
        assert!(auth.mutual);

        let client_addr = SocketAddrV4::new(CLIENT_ADDR, 1023);
        let server_addr = SocketAddrV4::new(CLIENT_ADDR, 544);
        let msg_ctx = ctx.message_context().unwrap();
        let reply = auth.mutual_reply(&server_addr, &client_addr, &msg_ctx).unwrap();
        verify_mutual_reply(&reply, &cred.session_key, 0x1234, &server_addr, &client_addr, &msg_ctx)
            .unwrap();

        // A second request reuses the cached ticket.
        let (_, again) = ctx.mk_req(&rcmd(), 1, false).await.unwrap();
        assert_eq!(again, cred);
        let (_, creds) = ctx.read_cache().unwrap();
        assert_eq!(creds.len(), 2);

        ctx.dest_tkt().unwrap();
        assert!(!ctx.ticket_file().exists());
        assert_eq!(ctx.read_cache().err(), Some(KrbError::CacheMissing));
    }

    #[tokio::test]
    async fn test_expired_ticket_is_refused() {
        let (_dir, mut ctx) = logged_in(example_kdc()).await;
        let (_, cred) = ctx.mk_req(&rcmd(), 7, false).await.unwrap();

        // A ticket issued two days ago with a five hour lifetime.
        let now = unix_now(0).unwrap();
        let session_key = SessionKey::generate();
        let ticket = create_ticket(
            &TicketContents {
                flags: 0,
                client: alice(),
                address: CLIENT_ADDR,
                session_key: session_key.clone(),
                lifetime: 0x3c,
                issue_time: now - 2 * 86400,
                service_name: "rcmd".to_string(),
                service_instance: "host".to_string(),
            },
            &rcmd_key(),
        )
        .unwrap();
        let stale = Credential {
            session_key,
            ticket,
            issue_date: now - 2 * 86400,
            lifetime: 0x3c,
            ..cred
        };

        let ap_req = build_request(&alice(), &stale, 7, false, KrbTime::now(0).unwrap()).unwrap();
        let mut verifier = ctx.verifier(&rcmd(), rcmd_key());
        assert_eq!(
            verifier.read_request(&ap_req.to_bytes().unwrap(), None).err(),
            Some(KrbError::TicketExpired)
        );
    }

    #[tokio::test]
    async fn test_cross_realm_ticket() {
        let _ = tracing_subscriber::fmt::try_init();
        let cross = Principal::krbtgt("OTHER.ORG", "EXAMPLE.COM").unwrap();
        let cross_key = DerivedKey::from_passphrase("example-to-other", 5).unwrap();
        let remote = Principal::new("rcmd", "host", "OTHER.ORG").unwrap();

        let home_port = example_kdc().add(cross.clone(), cross_key.clone()).spawn().await;
        let other_port = FakeKdc::new("OTHER.ORG")
            .add(cross.clone(), cross_key)
            .add(remote.clone(), rcmd_key())
            .spawn()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(
            &dir,
            &format!(
                "EXAMPLE.COM\nEXAMPLE.COM udp/127.0.0.1:{home_port}\nOTHER.ORG udp/127.0.0.1:{other_port}\n"
            ),
        );
        ctx.get_in_tkt(&alice(), &krbtgt(), 0x60, &KeyProc::password("alice-password"))
            .await
            .unwrap();

        let outcome = ctx.get_ad_tkt(&remote, DEFAULT_TKT_LIFE).await.unwrap();
        assert_eq!(outcome.credential.service, remote);

        let (_, creds) = ctx.read_cache().unwrap();
        let services: Vec<_> = creds.iter().map(|c| c.service.clone()).collect();
        assert_eq!(services, vec![krbtgt(), cross, remote]);
    }

    #[tokio::test]
    async fn test_no_ticket_granting_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "EXAMPLE.COM\n");
        let mut cache = TicketCache::create(ctx.ticket_file(), &LockPolicy::default()).unwrap();
        cache.write_header(&alice()).unwrap();
        drop(cache);

        let mut ctx = ctx;
        let res = ctx.get_ad_tkt(&rcmd(), DEFAULT_TKT_LIFE).await;
        assert_eq!(res.err(), Some(KrbError::NoTicketGrantingTicket));
    }
}
