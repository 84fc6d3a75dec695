use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::debug;

use crate::{PortRange, StreamOpts};

/// Typed failure of a connection attempt. The session FSM maps these
/// onto its retry / redispatch / termination decisions.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection refused")]
    Refused,
    #[error("network unreachable")]
    Unreachable,
    #[error("connection timed out")]
    TimedOut,
    /// No free local port (EADDRINUSE/EADDRNOTAVAIL/EAGAIN) or the
    /// configured port range ran dry. Retryable with a new port.
    #[error("no free source port")]
    NoFreePorts,
    #[error("cannot bind source address: {0}")]
    SourceBind(io::Error),
    #[error("resource exhausted: {0}")]
    Resource(io::Error),
    #[error("internal connect error: {0}")]
    Internal(io::Error),
}

/// How to source-bind the upstream socket.
#[derive(Clone, Debug)]
pub struct ConnectTarget {
    pub addr: SocketAddr,
    /// Fixed local source address (port 0 unless a range is used).
    pub source: Option<SocketAddr>,
    /// Spoof the client address (transparent proxying); overrides
    /// `source`'s address part and requires IP_TRANSPARENT.
    pub from_client: Option<SocketAddr>,
    /// SO_BINDTODEVICE interface.
    pub interface: Option<String>,
    pub opts: StreamOpts,
}

impl ConnectTarget {
    pub fn to(addr: SocketAddr) -> Self {
        Self { addr, source: None, from_client: None, interface: None, opts: StreamOpts::default() }
    }
}

/// Port-range probing never walks more than this many candidates; the
/// range is shuffled so a busy port does not poison the walk.
const PORT_ATTEMPTS: u32 = 10;

/// Starts a non-blocking connect to `target.addr`.
///
/// On `Ok` the returned stream is registered by the caller for
/// WRITABLE; completion is decided later by [`connect_outcome`]. The
/// second element is the allocated source port, which the caller must
/// release into its range when the connection ends or fails.
pub fn connect_server(
    target: &ConnectTarget,
    range: Option<&mut PortRange>,
) -> Result<(mio::net::TcpStream, Option<u16>), ConnectError> {
    match range {
        Some(range) => {
            let mut attempts = PORT_ATTEMPTS;
            loop {
                if attempts == 0 {
                    return Err(ConnectError::NoFreePorts);
                }
                attempts -= 1;
                let Some(port) = range.alloc() else {
                    return Err(ConnectError::NoFreePorts);
                };
                match connect_once(target, Some(port)) {
                    Ok(stream) => return Ok((stream, Some(port))),
                    // A used port is the one local failure worth
                    // retrying with the next candidate.
                    Err(ConnectError::NoFreePorts) | Err(ConnectError::SourceBind(_)) => {
                        range.release(port);
                    }
                    Err(e) => {
                        range.release(port);
                        return Err(e);
                    }
                }
            }
        }
        None => connect_once(target, None).map(|s| (s, None)),
    }
}

fn connect_once(target: &ConnectTarget, port: Option<u16>) -> Result<mio::net::TcpStream, ConnectError> {
    let domain = if target.addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(map_socket_err)?;

    sock.set_nonblocking(true).map_err(ConnectError::Internal)?;
    sock.set_nodelay(true).map_err(ConnectError::Internal)?;
    if target.opts.keepalive {
        let _ = sock.set_keepalive(true);
    }
    if let Some(sz) = target.opts.sndbuf {
        let _ = sock.set_send_buffer_size(sz);
    }
    if let Some(sz) = target.opts.rcvbuf {
        let _ = sock.set_recv_buffer_size(sz);
    }
    #[cfg(target_os = "linux")]
    if let Some(ref iface) = target.interface {
        let _ = sock.bind_device(Some(iface.as_bytes()));
    }

    if let Some(bind_addr) = bind_address(target, port) {
        sock.set_reuse_address(true).map_err(ConnectError::Internal)?;
        #[cfg(target_os = "linux")]
        if target.from_client.is_some() {
            sock.set_ip_transparent(true).map_err(ConnectError::SourceBind)?;
        }
        if let Err(err) = sock.bind(&bind_addr.into()) {
            return Err(match err.raw_os_error() {
                Some(libc::EADDRINUSE) | Some(libc::EADDRNOTAVAIL) => ConnectError::NoFreePorts,
                _ => ConnectError::SourceBind(err),
            });
        }
    }

    match sock.connect(&target.addr.into()) {
        Ok(()) => {}
        Err(err) if in_progress(&err) => {}
        Err(err) => return Err(map_connect_err(err)),
    }

    debug!(addr = %target.addr, "connect issued");
    Ok(mio::net::TcpStream::from_std(sock.into()))
}

/// The local endpoint to bind before connecting, if any.
fn bind_address(target: &ConnectTarget, port: Option<u16>) -> Option<SocketAddr> {
    match (target.from_client, target.source, port) {
        (Some(cli), _, p) => Some(SocketAddr::new(cli.ip(), p.unwrap_or(0))),
        (None, Some(src), p) => Some(SocketAddr::new(src.ip(), p.unwrap_or(src.port()))),
        (None, None, Some(p)) => Some(SocketAddr::new(any_addr(target.addr.is_ipv6()), p)),
        (None, None, None) => None,
    }
}

fn any_addr(v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

fn in_progress(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EISCONN)
    ) || err.kind() == io::ErrorKind::WouldBlock
}

fn map_socket_err(err: io::Error) -> ConnectError {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            ConnectError::Resource(err)
        }
        _ => ConnectError::Internal(err),
    }
}

fn map_connect_err(err: io::Error) -> ConnectError {
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EADDRINUSE) | Some(libc::EADDRNOTAVAIL) => {
            ConnectError::NoFreePorts
        }
        Some(libc::ETIMEDOUT) => ConnectError::TimedOut,
        Some(libc::ECONNREFUSED) => ConnectError::Refused,
        Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) => ConnectError::Unreachable,
        _ => ConnectError::Internal(err),
    }
}

/// Resolves an in-progress connect once the socket reports writable.
/// `Ok(())` means established; the error is the mapped SO_ERROR.
pub fn connect_outcome(stream: &mio::net::TcpStream) -> Result<(), ConnectError> {
    match stream.take_error() {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(map_connect_err(err)),
        Err(err) => Err(ConnectError::Internal(err)),
    }
}
