use super::ap_req::{build_request, ApReq};
use super::time::KrbTime;
use super::wire::{ByteOrder, KReader, KText};
use super::{put_header, read_header, Credential, MessageType, Principal};
use crate::constants::*;
use crate::error::KrbError;
use tracing::{error, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KerberosRequest {
    AS(AuthenticationRequest),
    TGS(TicketGrantRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub client: Principal,
    pub time: u32,
    pub lifetime: u8,
    pub service_name: String,
    pub service_instance: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketGrantRequest {
    pub ap_req: ApReq,
    /// The byte order the request was written in, needed to read its authenticator.
    pub order: ByteOrder,
    pub time_ws: u32,
    pub lifetime: u8,
    pub service_name: String,
    pub service_instance: String,
}

#[derive(Debug)]
pub struct AuthenticationRequestBuilder {
    client: Principal,
    service: Principal,
    time: u32,
    lifetime: u8,
}

#[derive(Debug)]
pub struct TicketGrantRequestBuilder {
    service: Principal,
    now: KrbTime,
    lifetime: u8,
    ap_req: Option<ApReq>,
}

impl KerberosRequest {
    pub fn build_as(client: &Principal, service: &Principal, time: u32) -> AuthenticationRequestBuilder {
        AuthenticationRequestBuilder {
            client: client.clone(),
            service: service.clone(),
            time,
            lifetime: DEFAULT_TKT_LIFE,
        }
    }

    pub fn build_tgs(service: &Principal, now: KrbTime) -> TicketGrantRequestBuilder {
        TicketGrantRequestBuilder {
            service: service.clone(),
            now,
            lifetime: DEFAULT_TKT_LIFE,
            ap_req: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KrbError> {
        let mut buf = KText::new();
        match self {
            KerberosRequest::AS(req) => {
                put_header(&mut buf, MessageType::KdcRequest)?;
                let c = &req.client;
                buf.put_nir(c.name(), c.instance(), Some(c.realm()))?;
                buf.put_u32(req.time)?;
                buf.put_u8(req.lifetime)?;
                buf.put_nir(&req.service_name, &req.service_instance, None)?;
            }
            KerberosRequest::TGS(req) => {
                req.ap_req.encode(&mut buf)?;
                buf.put_u32(req.time_ws)?;
                buf.put_u8(req.lifetime)?;
                buf.put_nir(&req.service_name, &req.service_instance, None)?;
            }
        }
        Ok(buf.as_slice().to_vec())
    }

    /// Parse a request as a KDC receives it. Initial requests carry their own message type,
    /// ticket granting requests begin with an application request.
    pub fn from_bytes(bytes: &[u8]) -> Result<KerberosRequest, KrbError> {
        let mut r = KReader::new(bytes, ByteOrder::Big);
        let msg_type = read_header(
            &mut r,
            &[
                MessageType::KdcRequest,
                MessageType::ApplRequest,
                MessageType::ApplRequestMutual,
            ],
        )?;

        let req = match msg_type {
            MessageType::KdcRequest => {
                let name = r.get_string(MAX_NAME_LEN)?;
                let instance = r.get_string(MAX_INST_LEN)?;
                let realm = r.get_string(MAX_REALM_LEN)?;
                let time = r.get_u32()?;
                let lifetime = r.get_u8()?;
                let service_name = r.get_string(MAX_NAME_LEN)?;
                let service_instance = r.get_string(MAX_INST_LEN)?;
                KerberosRequest::AS(AuthenticationRequest {
                    client: Principal::new(&name, &instance, &realm)?,
                    time,
                    lifetime,
                    service_name,
                    service_instance,
                })
            }
            _ => {
                let mut r = KReader::new(bytes, ByteOrder::Big);
                let ap_req = ApReq::decode(&mut r)?;
                let order = r.order();
                let time_ws = r.get_u32()?;
                let lifetime = r.get_u8()?;
                let service_name = r.get_string(MAX_NAME_LEN)?;
                let service_instance = r.get_string(MAX_INST_LEN)?;
                KerberosRequest::TGS(TicketGrantRequest {
                    ap_req,
                    order,
                    time_ws,
                    lifetime,
                    service_name,
                    service_instance,
                })
            }
        };

        trace!(?req);
        Ok(req)
    }
}

impl AuthenticationRequestBuilder {
    pub fn lifetime(mut self, lifetime: u8) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn build(self) -> KerberosRequest {
        let AuthenticationRequestBuilder {
            client,
            service,
            time,
            lifetime,
        } = self;

        KerberosRequest::AS(AuthenticationRequest {
            client,
            time,
            lifetime,
            service_name: service.name().to_string(),
            service_instance: service.instance().to_string(),
        })
    }
}

impl TicketGrantRequestBuilder {
    pub fn lifetime(mut self, lifetime: u8) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Authenticate the request with a ticket granting ticket.
    pub fn preauth_ap_req(mut self, client: &Principal, tgt: &Credential) -> Result<Self, KrbError> {
        self.ap_req = Some(build_request(client, tgt, 0, false, self.now)?);
        Ok(self)
    }

    pub fn build(self) -> Result<KerberosRequest, KrbError> {
        let TicketGrantRequestBuilder {
            service,
            now,
            lifetime,
            ap_req,
        } = self;

        let ap_req = ap_req.ok_or_else(|| {
            error!("Ticket granting request needs a ticket granting ticket");
            KrbError::NoTicketGrantingTicket
        })?;

        Ok(KerberosRequest::TGS(TicketGrantRequest {
            ap_req,
            order: ByteOrder::Big,
            time_ws: now.sec,
            lifetime,
            service_name: service.name().to_string(),
            service_instance: service.instance().to_string(),
        }))
    }
}
