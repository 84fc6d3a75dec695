use std::{io, os::fd::RawFd};

use tracing::debug;

/// One kernel pipe used to move bytes socket→socket without copying
/// them through userspace. `buffered` tracks bytes parked in the pipe.
#[derive(Debug)]
pub struct Pipe {
    rfd: RawFd,
    wfd: RawFd,
    pub buffered: usize,
}

/// Outcome of one splice pass.
#[derive(Debug, PartialEq, Eq)]
pub enum SpliceOutcome {
    Data(usize),
    Closed,
    WouldBlock,
    Error(io::ErrorKind),
}

impl Pipe {
    fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { rfd: fds[0], wfd: fds[1], buffered: 0 })
    }

    /// Moves up to `max` bytes from the socket into the pipe.
    pub fn splice_in(&mut self, sock: RawFd, max: usize) -> SpliceOutcome {
        let ret = unsafe {
            libc::splice(
                sock,
                std::ptr::null_mut(),
                self.wfd,
                std::ptr::null_mut(),
                max,
                (libc::SPLICE_F_NONBLOCK | libc::SPLICE_F_MOVE) as libc::c_uint,
            )
        };
        match ret {
            0 => SpliceOutcome::Closed,
            n if n > 0 => {
                self.buffered += n as usize;
                SpliceOutcome::Data(n as usize)
            }
            _ => map_errno(),
        }
    }

    /// Drains the pipe into the socket.
    pub fn splice_out(&mut self, sock: RawFd) -> SpliceOutcome {
        if self.buffered == 0 {
            return SpliceOutcome::WouldBlock;
        }
        let ret = unsafe {
            libc::splice(
                self.rfd,
                std::ptr::null_mut(),
                sock,
                std::ptr::null_mut(),
                self.buffered,
                (libc::SPLICE_F_NONBLOCK | libc::SPLICE_F_MOVE) as libc::c_uint,
            )
        };
        match ret {
            n if n > 0 => {
                self.buffered -= n as usize;
                SpliceOutcome::Data(n as usize)
            }
            0 => SpliceOutcome::WouldBlock,
            _ => map_errno(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }
}

fn map_errno() -> SpliceOutcome {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => SpliceOutcome::WouldBlock,
        _ => {
            debug!(?err, "splice");
            SpliceOutcome::Error(err.kind())
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rfd);
            libc::close(self.wfd);
        }
    }
}

/// Bounded pool of pipes shared by all spliced sessions. When the pool
/// is dry, sessions fall back to buffer forwarding.
#[derive(Debug)]
pub struct PipePool {
    free: Vec<Pipe>,
    in_use: usize,
    max: usize,
}

impl PipePool {
    pub fn new(max: usize) -> Self {
        Self { free: Vec::new(), in_use: 0, max }
    }

    pub fn take(&mut self) -> Option<Pipe> {
        if let Some(p) = self.free.pop() {
            self.in_use += 1;
            return Some(p);
        }
        if self.in_use >= self.max {
            return None;
        }
        match Pipe::new() {
            Ok(p) => {
                self.in_use += 1;
                Some(p)
            }
            Err(err) => {
                debug!(?err, "pipe pool: cannot allocate");
                None
            }
        }
    }

    /// Pipes holding data must be drained before release; a non-empty
    /// pipe is dropped instead of recycled.
    pub fn put(&mut self, pipe: Pipe) {
        self.in_use = self.in_use.saturating_sub(1);
        if pipe.is_empty() && self.free.len() + self.in_use < self.max {
            self.free.push(pipe);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn exhausted(&self) -> bool {
        self.free.is_empty() && self.in_use >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_respects_bound() {
        let mut pool = PipePool::new(1);
        let p = pool.take().expect("first pipe");
        assert!(pool.exhausted());
        assert!(pool.take().is_none());
        pool.put(p);
        assert!(!pool.exhausted());
    }

    #[test]
    fn pipe_moves_bytes_between_sockets() {
        use std::io::{Read, Write};
        use std::os::fd::AsRawFd;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (upstream, _) = listener.accept().unwrap();

        let sink_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let sink_addr = sink_listener.local_addr().unwrap();
        let out = std::net::TcpStream::connect(sink_addr).unwrap();
        let (mut sink, _) = sink_listener.accept().unwrap();

        client.write_all(b"spliced payload").unwrap();
        // let the kernel land the bytes on the accepted side
        upstream.set_nonblocking(true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut pipe = Pipe::new().unwrap();
        match pipe.splice_in(upstream.as_raw_fd(), 1 << 16) {
            SpliceOutcome::Data(n) => assert_eq!(n, 15),
            other => panic!("unexpected splice_in outcome: {other:?}"),
        }
        match pipe.splice_out(out.as_raw_fd()) {
            SpliceOutcome::Data(n) => assert_eq!(n, 15),
            other => panic!("unexpected splice_out outcome: {other:?}"),
        }

        let mut got = [0u8; 15];
        sink.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"spliced payload");
    }
}
