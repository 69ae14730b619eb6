//! Forward proxy enforcing the egress allowlist.
//!
//! Agents reach the outside world through `CONNECT host:port`. The calling
//! agent is identified by its source IP on the agents network; the target
//! host must match that agent's allowlist or the request is refused with
//! `403` before anything is dialed. Allowed tunnels relay bytes both ways
//! until either side closes.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::allowlist::{normalize_host, AllowlistTable};
use crate::config::ProxyConfig;
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::Registry;

/// Maps a peer address to the agent that owns it.
pub trait SourceResolver: Send + Sync {
    fn agent_for(&self, ip: IpAddr) -> Option<String>;
}

impl SourceResolver for Registry {
    fn agent_for(&self, ip: IpAddr) -> Option<String> {
        self.agent_for_address(ip)
    }
}

/// Opens upstream connections for allowed requests.
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Dials with the system resolver.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
}

#[async_trait]
impl UpstreamDialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(stream) => stream,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out")),
        }
    }
}

#[derive(Debug)]
enum HeadError {
    Closed,
    TooLarge,
    Malformed(&'static str),
    Io(io::Error),
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one `\n`-terminated line, refusing to buffer more than `max_bytes`.
async fn bounded_read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<usize, HeadError> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await.map_err(HeadError::Io)?;
        if available.is_empty() {
            return Ok(total);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let take = pos + 1;
                if total + take > max_bytes {
                    return Err(HeadError::TooLarge);
                }
                buf.extend_from_slice(&available[..take]);
                reader.consume(take);
                return Ok(total + take);
            }
            None => {
                let len = available.len();
                if total + len > max_bytes {
                    return Err(HeadError::TooLarge);
                }
                buf.extend_from_slice(available);
                total += len;
                reader.consume(len);
            }
        }
    }
}

async fn read_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<RequestHead, HeadError> {
    let mut lines: Vec<String> = Vec::new();
    let mut used = 0usize;
    loop {
        let mut raw = Vec::new();
        let n = bounded_read_line(reader, &mut raw, max_bytes - used).await?;
        if n == 0 {
            return Err(HeadError::Closed);
        }
        used += n;
        let line = String::from_utf8(raw).map_err(|_| HeadError::Malformed("non-utf8 header"))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            break;
        }
        lines.push(line.to_string());
    }

    let mut parts = lines[0].split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::Malformed("bad request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(HeadError::Malformed("bad http version"));
    }

    let mut headers = Vec::with_capacity(lines.len() - 1);
    for line in &lines[1..] {
        let Some((k, v)) = line.split_once(':') else {
            return Err(HeadError::Malformed("bad header line"));
        };
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Split `host[:port]`, accepting `[v6]:port`.
fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => default_port,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        (host, port)
    } else {
        match authority.split_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, default_port),
        }
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Split `http://authority/path` into host, port and origin-form path.
fn parse_absolute_http(target: &str) -> Option<(String, u16, String)> {
    let scheme = "http://";
    if target.len() < scheme.len() || !target[..scheme.len()].eq_ignore_ascii_case(scheme) {
        return None;
    }
    let rest = &target[scheme.len()..];
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = parse_authority(authority, 80)?;
    Some((host, port, path.to_string()))
}

async fn respond(stream: &mut TcpStream, status: u16, reason: &str) {
    let msg = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    if let Err(e) = stream.write_all(msg.as_bytes()).await {
        debug!(error = %e, "failed to write proxy response");
    }
    let _ = stream.shutdown().await;
}

/// The egress proxy service.
pub struct EgressProxy {
    config: ProxyConfig,
    table: Arc<AllowlistTable>,
    resolver: Arc<dyn SourceResolver>,
    dialer: Arc<dyn UpstreamDialer>,
}

impl EgressProxy {
    pub fn new(
        config: ProxyConfig,
        table: Arc<AllowlistTable>,
        resolver: Arc<dyn SourceResolver>,
        dialer: Arc<dyn UpstreamDialer>,
    ) -> Self {
        Self {
            config,
            table,
            resolver,
            dialer,
        }
    }

    /// Proxy with the system dialer.
    pub fn with_tcp_dialer(
        config: ProxyConfig,
        table: Arc<AllowlistTable>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        let dialer = Arc::new(TcpDialer {
            connect_timeout: config.connect_timeout,
        });
        Self::new(config, table, resolver, dialer)
    }

    pub fn table(&self) -> &Arc<AllowlistTable> {
        &self.table
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "egress proxy listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let proxy = self.clone();
                        tokio::spawn(async move { proxy.handle(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "egress accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("egress proxy stopped");
        Ok(())
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let mut reader = BufReader::new(stream);
        let head = match read_head(&mut reader, self.config.max_header_bytes).await {
            Ok(head) => head,
            Err(HeadError::Closed) => return,
            Err(HeadError::Io(e)) => {
                debug!(peer = %peer, error = %e, "egress client read failed");
                return;
            }
            Err(HeadError::TooLarge) => {
                return respond(reader.get_mut(), 431, "Request Header Fields Too Large").await
            }
            Err(HeadError::Malformed(why)) => {
                debug!(peer = %peer, reason = why, "malformed proxy request");
                return respond(reader.get_mut(), 400, "Bad Request").await;
            }
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.tunnel(reader, peer, head).await;
        } else if self.config.allow_plain_http {
            self.forward_plain(reader, peer, head).await;
        } else {
            respond(reader.get_mut(), 405, "Method Not Allowed").await;
        }
    }

    fn identify(&self, peer: SocketAddr, head: &RequestHead) -> Option<String> {
        self.resolver.agent_for(peer.ip()).or_else(|| {
            self.config
                .trust_agent_header
                .then(|| head.header("x-agent-name").map(str::to_string))
                .flatten()
        })
    }

    /// Allowlist decision; writes the 403 itself on denial.
    async fn admit(
        &self,
        client: &mut TcpStream,
        peer: SocketAddr,
        head: &RequestHead,
        host: &str,
    ) -> Option<String> {
        let Some(agent) = self.identify(peer, head) else {
            METRICS.inc_egress_denied();
            obs::emit_egress_denied(None, peer, host, "unknown source");
            respond(client, 403, "Forbidden").await;
            return None;
        };
        if let Err(e) = self.table.check(&agent, host) {
            METRICS.inc_egress_denied();
            obs::emit_egress_denied(Some(agent.as_str()), peer, host, &e.to_string());
            respond(client, 403, "Forbidden").await;
            return None;
        }
        Some(agent)
    }

    async fn tunnel(&self, mut reader: BufReader<TcpStream>, peer: SocketAddr, head: RequestHead) {
        let Some((host, port)) = parse_authority(&head.target, 443) else {
            return respond(reader.get_mut(), 400, "Bad Request").await;
        };
        let host = normalize_host(&host);
        let Some(agent) = self.admit(reader.get_mut(), peer, &head, &host).await else {
            return;
        };

        let mut upstream = match self.dialer.dial(&host, port).await {
            Ok(s) => s,
            Err(e) => {
                warn!(agent = %agent, host = %host, port, error = %e, "egress dial failed");
                return respond(reader.get_mut(), 502, "Bad Gateway").await;
            }
        };

        // Bytes the client sent right behind the CONNECT head.
        let early = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        if client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
        if !early.is_empty() && upstream.write_all(&early).await.is_err() {
            return;
        }

        METRICS.inc_egress_tunnels();
        obs::emit_egress_tunnel(&agent, &host, port);
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((up, down)) => debug!(
                agent = %agent,
                host = %host,
                bytes_up = up,
                bytes_down = down,
                "tunnel closed"
            ),
            Err(e) => debug!(agent = %agent, host = %host, error = %e, "tunnel aborted"),
        }
    }

    async fn forward_plain(
        &self,
        mut reader: BufReader<TcpStream>,
        peer: SocketAddr,
        head: RequestHead,
    ) {
        let Some((host, port, path)) = parse_absolute_http(&head.target) else {
            return respond(reader.get_mut(), 400, "Bad Request").await;
        };
        let host = normalize_host(&host);
        let Some(agent) = self.admit(reader.get_mut(), peer, &head, &host).await else {
            return;
        };

        let mut upstream = match self.dialer.dial(&host, port).await {
            Ok(s) => s,
            Err(e) => {
                warn!(agent = %agent, host = %host, port, error = %e, "egress dial failed");
                return respond(reader.get_mut(), 502, "Bad Gateway").await;
            }
        };

        let mut rewritten = format!("{} {} {}\r\n", head.method, path, head.version);
        for (k, v) in &head.headers {
            if k.len() >= 6 && k[..6].eq_ignore_ascii_case("proxy-") {
                continue;
            }
            if k.eq_ignore_ascii_case("x-agent-name") {
                continue;
            }
            rewritten.push_str(&format!("{k}: {v}\r\n"));
        }
        rewritten.push_str("\r\n");

        let early = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        if upstream.write_all(rewritten.as_bytes()).await.is_err()
            || (!early.is_empty() && upstream.write_all(&early).await.is_err())
        {
            return respond(&mut client, 502, "Bad Gateway").await;
        }

        METRICS.inc_egress_tunnels();
        obs::emit_egress_tunnel(&agent, &host, port);
        if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            debug!(agent = %agent, host = %host, error = %e, "plain forward aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_forms() {
        let host = |port: u16| Some(("api.example.com".to_string(), port));
        assert_eq!(parse_authority("api.example.com:8443", 443), host(8443));
        assert_eq!(parse_authority("api.example.com", 443), host(443));
        assert_eq!(parse_authority("[::1]:9000", 443), Some(("::1".into(), 9000)));
        assert_eq!(parse_authority("[::1]", 443), Some(("::1".into(), 443)));
        assert_eq!(parse_authority("host:notaport", 443), None);
        assert_eq!(parse_authority(":443", 443), None);
        assert_eq!(parse_authority("[::1", 443), None);
    }

    #[test]
    fn absolute_http_targets() {
        assert_eq!(
            parse_absolute_http("http://api.example.com/v1?q=1"),
            Some(("api.example.com".into(), 80, "/v1?q=1".into()))
        );
        assert_eq!(
            parse_absolute_http("HTTP://api.example.com:8080"),
            Some(("api.example.com".into(), 8080, "/".into()))
        );
        assert_eq!(parse_absolute_http("https://api.example.com/"), None);
        assert_eq!(parse_absolute_http("/relative"), None);
    }

    #[tokio::test]
    async fn reads_head_and_leaves_body_buffered() {
        let raw: &[u8] =
            b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com\r\n\r\nEARLY";
        let mut reader = BufReader::new(raw);
        let head = read_head(&mut reader, 1024).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "api.example.com:443");
        assert_eq!(head.header("host"), Some("api.example.com"));
        assert_eq!(reader.buffer(), b"EARLY");
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(200));
        let mut reader = BufReader::new(raw.as_bytes());
        assert!(matches!(read_head(&mut reader, 64).await, Err(HeadError::TooLarge)));
    }

    #[tokio::test]
    async fn garbage_request_line_is_malformed() {
        let mut reader = BufReader::new(&b"HELLO\r\n\r\n"[..]);
        assert!(matches!(read_head(&mut reader, 1024).await, Err(HeadError::Malformed(_))));
    }
}
