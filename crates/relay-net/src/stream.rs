use std::{
    io::{self, Read, Write},
    net::Shutdown,
    time::Duration,
};

use tracing::debug;

/// Socket options applied to every accepted or connected stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOpts {
    pub keepalive: bool,
    pub nolinger: bool,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
}

/// Result of one non-blocking read pass.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes landed in the caller's window.
    Data(usize),
    /// Orderly shutdown from the peer (read returned zero).
    Closed,
    /// Nothing ready, interest stays armed.
    WouldBlock,
    Error(io::ErrorKind),
}

/// Result of one non-blocking write pass.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Data(usize),
    WouldBlock,
    Error(io::ErrorKind),
}

/// Applies per-stream options right after accept (nodelay is always
/// on, as on every socket this engine touches).
pub fn prepare_accepted(stream: &mio::net::TcpStream, opts: &StreamOpts) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    if opts.keepalive {
        sock.set_keepalive(true)?;
    }
    if opts.nolinger {
        sock.set_linger(Some(Duration::ZERO))?;
    }
    set_socket_buf_size(stream, opts.sndbuf, opts.rcvbuf);
    Ok(())
}

/// Reads once into `window`. The caller passes the contiguous free
/// region of its ring buffer and commits whatever lands there.
#[inline]
pub fn sock_read(stream: &mut mio::net::TcpStream, window: &mut [u8]) -> ReadOutcome {
    if window.is_empty() {
        return ReadOutcome::WouldBlock;
    }
    match stream.read(window) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
        Err(e) => {
            debug!(err = ?e, "tcp: read");
            ReadOutcome::Error(e.kind())
        }
    }
}

/// Writes once from `chunk` (the contiguous committed-output region of
/// the caller's ring buffer).
#[inline]
pub fn sock_write(stream: &mut mio::net::TcpStream, chunk: &[u8]) -> WriteOutcome {
    if chunk.is_empty() {
        return WriteOutcome::WouldBlock;
    }
    match stream.write(chunk) {
        Ok(0) => WriteOutcome::WouldBlock,
        Ok(n) => WriteOutcome::Data(n),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => WriteOutcome::WouldBlock,
        Err(e) => {
            debug!(err = ?e, "tcp: write");
            WriteOutcome::Error(e.kind())
        }
    }
}

/// Half-closes the write side (graceful FIN).
pub fn sock_shutw(stream: &mio::net::TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
}

/// Abortive close: zero linger so the kernel sends RST on drop instead
/// of lingering in TIME_WAIT on our side.
pub fn sock_reset(stream: &mio::net::TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_linger(Some(Duration::ZERO));
    let _ = stream.shutdown(Shutdown::Both);
}

/// Set kernel SO_SNDBUF and/or SO_RCVBUF on a mio TcpStream, each
/// independently of the other.
pub fn set_socket_buf_size(stream: &mio::net::TcpStream, sndbuf: Option<usize>, rcvbuf: Option<usize>) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    if let Some(sz) = sndbuf {
        set_buf_opt(fd, libc::SO_SNDBUF, sz);
    }
    if let Some(sz) = rcvbuf {
        set_buf_opt(fd, libc::SO_RCVBUF, sz);
    }
}

fn set_buf_opt(fd: std::os::fd::RawFd, opt: libc::c_int, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            std::ptr::addr_of!(size).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
