//! The virtual network device.
//!
//! Sandboxed modules cannot open sockets, but they can open files. This
//! module exposes network endpoints as openable paths under a fixed virtual
//! root (`/dev`): a path of the shape `tcp|udp/<host>/<port>[/tls]`
//! identifies a network family, host, port, and whether to wrap the
//! connection in TLS.
//!
//! Every open is evaluated against the device's [`NetPolicy`]. A rejected
//! address and a malformed path both fail as "does not exist" — the sandbox
//! cannot distinguish bad syntax from a missing file, and learns nothing
//! about the policy's shape.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::matcher::HostAddr;
use crate::rule::NetPolicy;

/// Virtual root the device is conventionally mounted at.
pub const DEV_ROOT: &str = "/dev";

/// Bound on connection establishment, TLS handshake included.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Network family of a device path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetFamily {
    /// Stream socket.
    Tcp,
    /// Datagram socket.
    Udp,
}

/// A device path decoded into a network address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddr {
    /// Network family.
    pub family: NetFamily,
    /// Target host (IP literal or hostname).
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Wrap the connection in TLS after dialing.
    pub tls: bool,
}

impl DeviceAddr {
    /// Decode a device path, absolute (`/dev/tcp/host/port`) or relative
    /// to the virtual root (`tcp/host/port`).
    ///
    /// Returns `None` for anything that does not match the expected shape;
    /// callers surface that as "does not exist".
    pub fn parse(path: &str) -> Option<Self> {
        let path = path
            .strip_prefix(DEV_ROOT)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(path);

        let mut segments = path.split('/');
        let family = match segments.next()? {
            "tcp" => NetFamily::Tcp,
            "udp" => NetFamily::Udp,
            _ => return None,
        };
        let host = segments.next()?;
        if host.is_empty() {
            return None;
        }
        let port_str = segments.next()?;
        if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let port = port_str.parse::<u16>().ok()?;
        let tls = match segments.next() {
            None => false,
            Some("tls") => true,
            Some(_) => return None,
        };
        if segments.next().is_some() {
            return None;
        }

        Some(Self {
            family,
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// A dialed connection, exposed to the sandbox as a plain
/// read/write/close handle.
#[derive(Debug)]
pub enum NetStream {
    /// A plain TCP connection.
    Tcp(TcpStream),
    /// A TLS-wrapped TCP connection.
    Tls(Box<TlsStream<TcpStream>>),
    /// A connected UDP socket; reads and writes map to datagrams.
    Udp(UdpSocket),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetStream::Udp(socket) => socket.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetStream::Udp(socket) => socket.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            NetStream::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}

/// The policy-gated virtual network device.
pub struct NetDevice {
    rule: String,
    policy: NetPolicy,
    tls: TlsConnector,
}

impl NetDevice {
    /// Build a device from a rule specification.
    pub fn new(rule: impl Into<String>) -> Self {
        let rule = rule.into();
        let policy = NetPolicy::parse(&rule);

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            rule,
            policy,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// The rule specification this device was built from.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// The parsed policy.
    pub fn policy(&self) -> &NetPolicy {
        &self.policy
    }

    /// Open a device path, dialing the address it names.
    ///
    /// # Errors
    ///
    /// Malformed paths and policy rejections fail with
    /// [`io::ErrorKind::NotFound`]; dial and handshake failures surface
    /// their own error, bounded by a 10-second timeout.
    pub async fn open(&self, path: &str) -> io::Result<NetStream> {
        let addr = DeviceAddr::parse(path).ok_or_else(not_found)?;

        let host = HostAddr::parse(&addr.host);
        if !self.policy.allows(&host, addr.port) {
            debug!(path = %path, "device open rejected by policy");
            return Err(not_found());
        }

        match addr.family {
            NetFamily::Tcp => {
                let stream = timeout(
                    DIAL_TIMEOUT,
                    TcpStream::connect((addr.host.as_str(), addr.port)),
                )
                .await
                .map_err(|_| timed_out())??;

                if addr.tls {
                    let name = ServerName::try_from(addr.host.clone())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                    let stream = timeout(DIAL_TIMEOUT, self.tls.connect(name, stream))
                        .await
                        .map_err(|_| timed_out())??;
                    Ok(NetStream::Tls(Box::new(stream)))
                } else {
                    Ok(NetStream::Tcp(stream))
                }
            }
            NetFamily::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                timeout(
                    DIAL_TIMEOUT,
                    socket.connect((addr.host.as_str(), addr.port)),
                )
                .await
                .map_err(|_| timed_out())??;
                Ok(NetStream::Udp(socket))
            }
        }
    }
}

impl std::fmt::Debug for NetDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetDevice")
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such device")
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
}
