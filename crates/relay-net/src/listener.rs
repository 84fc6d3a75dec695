use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot create listening socket: {0}")]
    Socket(io::Error),
    #[error("cannot bind {addr}: {err}")]
    Bind { addr: SocketAddr, err: io::Error },
    #[error("cannot listen on {addr}: {err}")]
    Listen { addr: SocketAddr, err: io::Error },
}

/// Listening-socket options. Mirrors the per-`bind` knobs the config
/// surface exposes.
#[derive(Clone, Debug)]
pub struct ListenerOpts {
    pub backlog: i32,
    pub nolinger: bool,
    pub reuseport: bool,
    /// IP_TRANSPARENT, for accepting traffic to foreign addresses.
    pub transparent: bool,
    /// TCP_DEFER_ACCEPT: wake accept only once data arrives.
    pub defer_accept: bool,
    /// SO_BINDTODEVICE interface name.
    pub interface: Option<String>,
}

impl Default for ListenerOpts {
    fn default() -> Self {
        Self {
            backlog: 1024,
            nolinger: false,
            reuseport: false,
            transparent: false,
            defer_accept: false,
            interface: None,
        }
    }
}

/// Binds a non-blocking listening socket with the full option set and
/// hands it to mio. Option failures that only degrade behaviour are
/// logged and ignored, exactly like a refused SO_REUSEPORT on an old
/// kernel; bind/listen failures are fatal for this listener.
pub fn bind_listener(addr: SocketAddr, opts: &ListenerOpts) -> Result<mio::net::TcpListener, BindError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(BindError::Socket)?;

    sock.set_nonblocking(true).map_err(BindError::Socket)?;
    sock.set_reuse_address(true).map_err(BindError::Socket)?;

    if opts.reuseport {
        #[cfg(unix)]
        if let Err(err) = sock.set_reuse_port(true) {
            warn!(%addr, %err, "listener: cannot set SO_REUSEPORT");
        }
    }
    if opts.nolinger {
        let _ = sock.set_linger(Some(std::time::Duration::ZERO));
    }
    #[cfg(target_os = "linux")]
    if opts.transparent {
        if let Err(err) = sock.set_ip_transparent(true) {
            warn!(%addr, %err, "listener: cannot make socket transparent");
        }
    }
    #[cfg(target_os = "linux")]
    if let Some(ref iface) = opts.interface {
        if let Err(err) = sock.bind_device(Some(iface.as_bytes())) {
            warn!(%addr, iface, %err, "listener: cannot bind to device");
        }
    }

    sock.bind(&addr.into()).map_err(|err| BindError::Bind { addr, err })?;
    sock.listen(opts.backlog).map_err(|err| BindError::Listen { addr, err })?;

    #[cfg(target_os = "linux")]
    if opts.defer_accept {
        set_defer_accept(&sock, addr);
    }

    Ok(mio::net::TcpListener::from_std(sock.into()))
}

#[cfg(target_os = "linux")]
fn set_defer_accept(sock: &Socket, addr: SocketAddr) {
    use std::os::fd::AsRawFd;
    let secs: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            std::ptr::addr_of!(secs).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(%addr, "listener: cannot enable TCP_DEFER_ACCEPT");
    }
}
