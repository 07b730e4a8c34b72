use crate::config::ClientConfig;
use crate::error::KrbError;
use crate::locator::{KdcHost, KdcProtocol};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, instrument, trace, warn};

/// Largest reply we will accept from a KDC over any transport.
pub const KDC_IO_MAX_SIZE: usize = 4096;

/// Requests go out with a four byte big endian length prefix. The reply is whatever
/// the KDC writes before closing the connection.
pub struct KdcTcpCodec {
    max_size: usize,
}

impl Default for KdcTcpCodec {
    fn default() -> Self {
        KdcTcpCodec {
            max_size: KDC_IO_MAX_SIZE,
        }
    }
}

impl Decoder for KdcTcpCodec {
    type Item = Vec<u8>;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() > self.max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "KDC reply exceeds the maximum size",
            ));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(buf)?;
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(buf.split().to_vec()))
    }
}

impl Encoder<Vec<u8>> for KdcTcpCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Vec<u8>, buf: &mut BytesMut) -> io::Result<()> {
        let d_len = u32::try_from(msg.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        buf.reserve(msg.len() + 4);
        buf.extend_from_slice(&d_len.to_be_bytes());
        buf.extend_from_slice(&msg);
        Ok(())
    }
}

fn kdc_unreachable(host: &KdcHost, err: io::Error) -> KrbError {
    debug!(?err, %host, "KDC unreachable");
    KrbError::KdcUnreachable
}

/// Parse `[http://]host[:port][/]`.
fn parse_proxy(proxy: &str) -> Option<(String, u16)> {
    let proxy = proxy.strip_prefix("http://").unwrap_or(proxy);
    let proxy = proxy.trim_end_matches('/');
    match proxy.rsplit_once(':') {
        Some((h, p)) => p.parse().ok().map(|p| (h.to_string(), p)),
        None if !proxy.is_empty() => Some((proxy.to_string(), 80)),
        None => None,
    }
}

/// Split an HTTP response into its body, requiring a 2xx status.
fn http_body(response: &[u8]) -> Result<Vec<u8>, KrbError> {
    let Some(end) = response.windows(4).position(|w| w == b"\r\n\r\n") else {
        error!("HTTP reply has no end of headers");
        return Err(KrbError::MalformedMessage);
    };

    let head = String::from_utf8_lossy(&response[..end]);
    let status = head.lines().next().unwrap_or_default();
    let code = status.split_whitespace().nth(1).unwrap_or_default();
    if !status.starts_with("HTTP/") || !code.starts_with('2') || code.len() != 3 {
        error!(%status, "HTTP proxy or KDC refused the request");
        return Err(KrbError::KdcUnreachable);
    }

    Ok(response[end + 4..].to_vec())
}

#[derive(Debug, Clone)]
pub struct KdcTransport {
    pub timeout: Duration,
    pub retries: usize,
    pub http_proxy: Option<String>,
}

impl Default for KdcTransport {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl KdcTransport {
    pub fn from_config(config: &ClientConfig) -> Self {
        KdcTransport {
            timeout: config.kdc_timeout(),
            retries: config.kdc_retries,
            http_proxy: config.http_proxy.clone(),
        }
    }

    /// One attempt against one KDC, bounded by the configured timeout.
    pub async fn send_and_receive(&self, request: &[u8], host: &KdcHost) -> Result<Vec<u8>, KrbError> {
        match host.protocol {
            KdcProtocol::Udp => self.bounded(host, self.udp(request, host)).await,
            // TCP keeps whatever arrived before the deadline, so it bounds itself.
            KdcProtocol::Tcp => self.tcp(request, host).await,
            KdcProtocol::Http => self.bounded(host, self.http(request, host)).await,
        }
    }

    async fn bounded<F>(&self, host: &KdcHost, attempt: F) -> Result<Vec<u8>, KrbError>
    where
        F: Future<Output = Result<Vec<u8>, KrbError>>,
    {
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(res) => res,
            Err(_) => {
                debug!(%host, timeout = ?self.timeout, "KDC did not answer in time");
                Err(KrbError::TimedOut)
            }
        }
    }

    /// Try every host in order, repeating the whole list until a KDC answers or the
    /// retry rounds run out.
    #[instrument(level = "debug", skip_all)]
    pub async fn send_to_kdc(&self, request: &[u8], hosts: &[KdcHost]) -> Result<Vec<u8>, KrbError> {
        if hosts.is_empty() {
            error!("No KDC to send to");
            return Err(KrbError::NoKdcFound);
        }

        for round in 0..self.retries.max(1) {
            for host in hosts {
                match self.send_and_receive(request, host).await {
                    Ok(reply) => {
                        trace!(%host, round, len = reply.len(), "KDC answered");
                        return Ok(reply);
                    }
                    Err(err) => {
                        debug!(?err, %host, round, "KDC attempt failed");
                    }
                }
            }
        }

        error!(hosts = hosts.len(), rounds = self.retries, "No KDC answered");
        Err(KrbError::RetriesExhausted)
    }

    async fn udp(&self, request: &[u8], host: &KdcHost) -> Result<Vec<u8>, KrbError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| kdc_unreachable(host, e))?;
        socket
            .connect((host.host.as_str(), host.port))
            .await
            .map_err(|e| kdc_unreachable(host, e))?;
        socket.send(request).await.map_err(|e| kdc_unreachable(host, e))?;

        let mut buf = vec![0u8; KDC_IO_MAX_SIZE];
        let len = socket.recv(&mut buf).await.map_err(|e| kdc_unreachable(host, e))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// The reply is everything read before the KDC closes the connection or the deadline
    /// passes.
    async fn tcp(&self, request: &[u8], host: &KdcHost) -> Result<Vec<u8>, KrbError> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = |_| {
            debug!(%host, timeout = ?self.timeout, "KDC did not answer in time");
            KrbError::TimedOut
        };

        let stream = timeout_at(deadline, TcpStream::connect((host.host.as_str(), host.port)))
            .await
            .map_err(timed_out)?
            .map_err(|e| kdc_unreachable(host, e))?;
        let mut krb_stream = Framed::new(stream, KdcTcpCodec::default());

        timeout_at(deadline, krb_stream.send(request.to_vec()))
            .await
            .map_err(timed_out)?
            .map_err(|e| kdc_unreachable(host, e))?;

        let next = timeout_at(deadline, krb_stream.next()).await;
        match next {
            Ok(Some(Ok(reply))) => Ok(reply),
            Ok(Some(Err(err))) => {
                error!(?err, %host, "Failed to read KDC reply");
                Err(KrbError::MalformedMessage)
            }
            Ok(None) => {
                debug!(%host, "KDC closed the connection without a reply");
                Err(KrbError::KdcUnreachable)
            }
            Err(elapsed) => {
                let partial = krb_stream.read_buffer();
                if partial.is_empty() {
                    return Err(timed_out(elapsed));
                }
                trace!(%host, len = partial.len(), "KDC left the connection open, using what arrived");
                Ok(partial.to_vec())
            }
        }
    }

    async fn http(&self, request: &[u8], host: &KdcHost) -> Result<Vec<u8>, KrbError> {
        let encoded = STANDARD.encode(request);

        let (connect_to, line) = match self.http_proxy.as_deref().and_then(parse_proxy) {
            Some(proxy) => (
                proxy,
                format!("GET http://{}:{}/{} HTTP/1.0\r\n\r\n", host.host, host.port, encoded),
            ),
            None => {
                if let Some(p) = &self.http_proxy {
                    warn!(proxy = %p, "Ignoring unparseable HTTP proxy");
                }
                (
                    (host.host.clone(), host.port),
                    format!("GET /{} HTTP/1.0\r\n\r\n", encoded),
                )
            }
        };

        let mut stream = TcpStream::connect((connect_to.0.as_str(), connect_to.1))
            .await
            .map_err(|e| kdc_unreachable(host, e))?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| kdc_unreachable(host, e))?;

        let mut response = Vec::new();
        (&mut stream)
            .take(KDC_IO_MAX_SIZE as u64 + 1)
            .read_to_end(&mut response)
            .await
            .map_err(|e| kdc_unreachable(host, e))?;
        if response.len() > KDC_IO_MAX_SIZE {
            error!(%host, "HTTP reply exceeds the maximum size");
            return Err(KrbError::MalformedMessage);
        }

        http_body(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn host(protocol: KdcProtocol, port: u16) -> KdcHost {
        KdcHost {
            realm: "EXAMPLE.COM".to_string(),
            protocol,
            host: "127.0.0.1".to_string(),
            port,
            is_admin: false,
        }
    }

    fn transport(timeout: Duration, retries: usize) -> KdcTransport {
        KdcTransport {
            timeout,
            retries,
            http_proxy: None,
        }
    }

    #[test]
    fn test_http_body() {
        assert_eq!(
            http_body(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nbody").unwrap(),
            b"body".to_vec()
        );
        assert_eq!(
            http_body(b"HTTP/1.0 404 Not Found\r\n\r\n"),
            Err(KrbError::KdcUnreachable)
        );
        assert_eq!(http_body(b"HTTP/1.0 200 OK\r\n"), Err(KrbError::MalformedMessage));
        assert_eq!(parse_proxy("http://proxy:3128/"), Some(("proxy".to_string(), 3128)));
        assert_eq!(parse_proxy("proxy"), Some(("proxy".to_string(), 80)));
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        let _ = tracing_subscriber::fmt::try_init();
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let t = transport(Duration::from_secs(1), 1);
        let start = Instant::now();
        let res = t.send_and_receive(b"hello", &host(KdcProtocol::Udp, port)).await;
        assert_eq!(res, Err(KrbError::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_udp_retry_rounds() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_port = silent.local_addr().unwrap().port();
        let kdc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let kdc_port = kdc.local_addr().unwrap().port();

        let t = transport(Duration::from_millis(200), 2);
        let hosts = vec![
            host(KdcProtocol::Udp, silent_port),
            host(KdcProtocol::Udp, kdc_port),
        ];

        let (res, _) = tokio::join!(t.send_to_kdc(b"ping", &hosts), async {
            let mut buf = [0u8; 64];
            let (len, from) = kdc.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"ping");
            kdc.send_to(b"pong", from).await.unwrap();
        });
        assert_eq!(res.unwrap(), b"pong".to_vec());

        let start = Instant::now();
        let res = t.send_to_kdc(b"ping", &hosts[..1]).await;
        assert_eq!(res, Err(KrbError::RetriesExhausted));
        // Two rounds of one host.
        assert!(start.elapsed() >= Duration::from_millis(400));

        assert_eq!(t.send_to_kdc(b"ping", &[]).await, Err(KrbError::NoKdcFound));
    }

    #[tokio::test]
    async fn test_tcp_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let t = transport(Duration::from_secs(2), 1);
        let kdc = host(KdcProtocol::Tcp, port);
        let (res, _) = tokio::join!(
            t.send_and_receive(b"request", &kdc),
            async {
                let (mut s, _) = listener.accept().await.unwrap();
                let len = s.read_u32().await.unwrap();
                assert_eq!(len, 7);
                let mut buf = vec![0u8; len as usize];
                s.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, b"request");
                s.write_all(b"the reply").await.unwrap();
                s.shutdown().await.unwrap();
            }
        );
        assert_eq!(res.unwrap(), b"the reply".to_vec());
    }

    #[tokio::test]
    async fn test_tcp_reply_on_open_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let t = transport(Duration::from_secs(1), 1);
        let start = Instant::now();
        let kdc = host(KdcProtocol::Tcp, port);
        let (res, _) = tokio::join!(
            t.send_and_receive(b"request", &kdc),
            async {
                let (mut s, _) = listener.accept().await.unwrap();
                let len = s.read_u32().await.unwrap();
                let mut buf = vec![0u8; len as usize];
                s.read_exact(&mut buf).await.unwrap();
                s.write_all(b"the reply").await.unwrap();
                // Hold the connection open past the deadline.
                tokio::time::sleep(Duration::from_millis(1500)).await;
                drop(s);
            }
        );
        assert_eq!(res.unwrap(), b"the reply".to_vec());
        assert!(start.elapsed() < Duration::from_secs(3));

        // Nothing arrives at all.
        let kdc = host(KdcProtocol::Tcp, port);
        let (res, _) = tokio::join!(
            t.send_and_receive(b"request", &kdc),
            async {
                let (s, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1500)).await;
                drop(s);
            }
        );
        assert_eq!(res, Err(KrbError::TimedOut));
    }

    #[tokio::test]
    async fn test_http_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let t = transport(Duration::from_secs(2), 1);
        let kdc = host(KdcProtocol::Http, port);
        let (res, _) = tokio::join!(
            t.send_and_receive(&[0xff, 0x00, 0x10], &kdc),
            async {
                let (mut s, _) = listener.accept().await.unwrap();
                let mut req = Vec::new();
                let mut buf = [0u8; 256];
                while !req.ends_with(b"\r\n\r\n") {
                    let n = s.read(&mut buf).await.unwrap();
                    assert!(n > 0);
                    req.extend_from_slice(&buf[..n]);
                }
                assert_eq!(req, b"GET //wAQ HTTP/1.0\r\n\r\n".to_vec());
                s.write_all(b"HTTP/1.0 200 OK\r\n\r\n\x04\x05").await.unwrap();
                s.shutdown().await.unwrap();
            }
        );
        assert_eq!(res.unwrap(), vec![4, 5]);
    }
}
