use bitflags::bitflags;
use mio::{Interest, Registry, Token};
use relay_net::{ReadOutcome, WriteOutcome};
use relay_timing::Ticks;
use strum::Display;
use tracing::debug;

use crate::buffer::{BufFlags, Buffer};

/// Stream-interface states, in lifecycle order. Ordering is load
/// bearing: the FSM compares ranges (`>= Est` means a producer is
/// attached, `Req..Con` means a connection is being arranged).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SiState {
    #[default]
    Ini,
    /// Wants a connection; no server picked yet.
    Req,
    /// Parked in a server/backend queue.
    Que,
    /// Turn-around delay after a failed attempt.
    Tar,
    /// Server assigned, connect not issued yet.
    Ass,
    /// Connect in flight.
    Con,
    /// Connect failed, retry bookkeeping pending.
    Cer,
    Est,
    /// Closed by the transport, cleanup pending.
    Dis,
    Clo,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SiFlags: u8 {
        /// Deadline in `exp` has fired.
        const EXP        = 1 << 0;
        /// Transport-level error observed.
        const ERR        = 1 << 1;
        /// Don't wake the owning task from nested calls.
        const DONT_WAKE  = 1 << 2;
        /// Abortive close on shutdown.
        const NOLINGER   = 1 << 3;
        /// Both this endpoint and its transport can splice.
        const CAP_SPLICE = 1 << 4;
        /// Read and write deadlines are independent.
        const INDEP_STR  = 1 << 5;
    }
}

/// Typed connection-stage errors recorded by the innermost component;
/// the FSM maps them to the session's termination class at the single
/// deciding site.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SiErr {
    #[default]
    None,
    /// Connect attempt timed out.
    ConnTo,
    /// Connect refused or reset.
    ConnErr,
    /// Other connect problem (no server, resources, internal).
    ConnOther,
    /// Client aborted while connecting.
    ConnAbrt,
    QueueTo,
    QueueErr,
    QueueAbrt,
}

/// Socket endpoint: a non-blocking stream plus interest bookkeeping.
#[derive(Debug)]
pub struct SockEp {
    pub stream: mio::net::TcpStream,
    pub token: Token,
    interest: Option<Interest>,
    /// Source port drawn from a configured range, to give back.
    pub local_port: Option<u16>,
    /// Consecutive reads that filled most of the window.
    read_streak: u8,
    #[cfg(target_os = "linux")]
    pub pipe: Option<relay_net::Pipe>,
}

impl SockEp {
    pub fn new(stream: mio::net::TcpStream, token: Token) -> Self {
        Self {
            stream,
            token,
            interest: None,
            local_port: None,
            read_streak: 0,
            #[cfg(target_os = "linux")]
            pipe: None,
        }
    }

    /// Reconciles the registered interest set with `want`.
    pub fn set_interest(&mut self, registry: &Registry, want: Option<Interest>) {
        if self.interest == want {
            return;
        }
        let res = match (self.interest, want) {
            (None, Some(i)) => registry.register(&mut self.stream, self.token, i),
            (Some(_), Some(i)) => registry.reregister(&mut self.stream, self.token, i),
            (Some(_), None) => registry.deregister(&mut self.stream),
            (None, None) => Ok(()),
        };
        if let Err(err) = res {
            debug!(?err, token = self.token.0, "interest update failed");
        }
        self.interest = want;
    }

    fn add_interest(&mut self, registry: &Registry, extra: Interest) {
        let want = match self.interest {
            Some(i) => i | extra,
            None => extra,
        };
        self.set_interest(registry, Some(want));
    }

    fn drop_interest(&mut self, registry: &Registry, gone: Interest) {
        let want = self.interest.and_then(|i| i.remove(gone));
        self.set_interest(registry, want);
    }
}

/// Embedded producers: internal responders that run from the FSM
/// instead of a socket (monitor/health answers).
#[derive(Debug)]
pub enum Embedded {
    /// Writes `data` into its input buffer, then signals EOF.
    Responder { data: Vec<u8>, pos: usize },
}

/// The endpoint variants a stream interface can drive. The operation
/// set (shutr/shutw/chk_rcv/chk_snd/update/connect/iohandler)
/// dispatches on this tag.
#[derive(Debug, Default)]
pub enum Endpoint {
    /// Server side before any connect was issued.
    #[default]
    None,
    Sock(SockEp),
    Embedded(Embedded),
}

impl Endpoint {
    pub fn is_sock(&self) -> bool {
        matches!(self, Endpoint::Sock(_))
    }

    pub fn sock_mut(&mut self) -> Option<&mut SockEp> {
        match self {
            Endpoint::Sock(ep) => Some(ep),
            _ => None,
        }
    }
}

/// One endpoint of the session's buffer pair.
#[derive(Debug, Default)]
pub struct StreamInterface {
    pub state: SiState,
    pub prev_state: SiState,
    pub flags: SiFlags,
    pub err_type: SiErr,
    pub err_loc: Option<crate::proxy::ServerRef>,
    pub exp: Ticks,
    pub endpoint: Endpoint,
    /// Source port freed by the last endpoint close; the FSM returns
    /// it to the server's range.
    pub released_port: Option<u16>,
}

impl StreamInterface {
    pub fn new_est(endpoint: Endpoint) -> Self {
        Self {
            state: SiState::Est,
            prev_state: SiState::Est,
            exp: Ticks::ETERNITY,
            endpoint,
            ..Default::default()
        }
    }

    pub fn new_ini() -> Self {
        Self { exp: Ticks::ETERNITY, ..Default::default() }
    }

    /// Promotes an elapsed `exp` deadline to the EXP flag.
    pub fn check_timeout(&mut self, now: Ticks) {
        if self.state != SiState::Clo && self.exp.expired(now) {
            self.flags.insert(SiFlags::EXP);
        }
    }

    pub fn record_err(&mut self, err: SiErr) {
        if self.err_type == SiErr::None {
            self.err_type = err;
        }
    }
}

/// Outcome of one socket fill pass, for the engine's event loop.
#[derive(Debug, PartialEq, Eq)]
pub enum IoEvent {
    /// Something notable changed (data, shutdown, error); wake task.
    Activity,
    /// Nothing to report.
    Quiet,
}

/// Read loop: socket -> input buffer. Mirrors the producer side of a
/// stream socket: reads until the kernel runs dry, the buffer fills,
/// or the peer closes, updating buffer flags and the read deadline.
pub fn sock_recv(
    si: &mut StreamInterface,
    ib: &mut Buffer,
    ob: &Buffer,
    registry: &Registry,
    now: Ticks,
) -> IoEvent {
    if !si.endpoint.is_sock() || ib.flags.contains(BufFlags::SHUTR) {
        return IoEvent::Quiet;
    }

    let mut activity = IoEvent::Quiet;
    loop {
        let Some(ep) = si.endpoint.sock_mut() else { break };
        if ib.flags.intersects(BufFlags::FULL | BufFlags::DONT_READ | BufFlags::HIJACK) {
            ep.drop_interest(registry, Interest::READABLE);
            break;
        }
        let window = ib.recv_window_mut();
        let cap = window.len();
        if cap == 0 {
            ep.drop_interest(registry, Interest::READABLE);
            break;
        }
        match relay_net::sock_read(&mut ep.stream, window) {
            ReadOutcome::Data(n) => {
                ib.commit_input(n);
                activity = IoEvent::Activity;
                // streamer heuristic: successive reads filling most of
                // the window hint at a bulk transfer
                if n >= cap * 3 / 4 {
                    ep.read_streak = ep.read_streak.saturating_add(1);
                    if ep.read_streak >= 2 {
                        ib.flags.insert(BufFlags::STREAMER);
                    }
                    if ep.read_streak >= 3 {
                        ib.flags.insert(BufFlags::STREAMER_FAST);
                    }
                } else {
                    ep.read_streak = 0;
                    ib.flags.remove(BufFlags::STREAMER_FAST);
                }
                if ib.rto.is_set() && !ib.flags.contains(BufFlags::READ_NOEXP) {
                    ib.rex = now.add_ifset(ib.rto);
                }
                if n < cap || ib.flags.contains(BufFlags::READ_DONTWAIT) {
                    break;
                }
            }
            ReadOutcome::Closed => {
                read0(si, ib, ob, registry);
                return IoEvent::Activity;
            }
            ReadOutcome::WouldBlock => break,
            ReadOutcome::Error(_) => {
                si.flags.insert(SiFlags::ERR);
                ib.flags.insert(BufFlags::READ_ERROR);
                ib.rex = Ticks::ETERNITY;
                return IoEvent::Activity;
            }
        }
    }
    activity
}

/// Orderly shutdown seen while reading: mark the input side closed;
/// when the write direction is already shut the endpoint goes down
/// entirely.
fn read0(si: &mut StreamInterface, ib: &mut Buffer, ob: &Buffer, registry: &Registry) {
    ib.flags.insert(BufFlags::READ_NULL | BufFlags::SHUTR);
    ib.rex = Ticks::ETERNITY;
    if ob.flags.contains(BufFlags::SHUTW) {
        close_endpoint(si, registry);
        si.state = SiState::Dis;
        si.exp = Ticks::ETERNITY;
    } else if let Some(ep) = si.endpoint.sock_mut() {
        ep.drop_interest(registry, Interest::READABLE);
    }
}

/// Write loop: output buffer -> socket, then the post-drain shutdown
/// check. Used both from writable events and from `chk_snd`.
pub fn sock_send(si: &mut StreamInterface, ob: &mut Buffer, registry: &Registry, now: Ticks) -> IoEvent {
    let Some(ep) = si.endpoint.sock_mut() else { return IoEvent::Quiet };
    if ob.flags.contains(BufFlags::SHUTW) {
        return IoEvent::Quiet;
    }

    let mut activity = IoEvent::Quiet;
    loop {
        let (first, _) = ob.send_window();
        if first.is_empty() {
            break;
        }
        let chunk_len = first.len();
        match relay_net::sock_write(&mut ep.stream, first) {
            WriteOutcome::Data(n) => {
                ob.commit_output(n);
                ob.flags.insert(BufFlags::WRITE_PARTIAL);
                activity = IoEvent::Activity;
                if n < chunk_len {
                    break;
                }
            }
            WriteOutcome::WouldBlock => break,
            WriteOutcome::Error(_) => {
                si.flags.insert(SiFlags::ERR);
                ob.flags.insert(BufFlags::WRITE_ERROR);
                ob.wex = Ticks::ETERNITY;
                return IoEvent::Activity;
            }
        }
    }

    if ob.flags.contains(BufFlags::OUT_EMPTY) {
        ep.drop_interest(registry, Interest::WRITABLE);
        ob.wex = Ticks::ETERNITY;
    } else {
        ep.add_interest(registry, Interest::WRITABLE);
        if ob.wto.is_set() {
            ob.wex = now.add_ifset(ob.wto);
        }
    }
    activity
}

/// `chk_snd`: a producer put data in the output buffer; try to move it
/// now instead of waiting for a writable event.
pub fn si_chk_snd(si: &mut StreamInterface, ob: &mut Buffer, registry: &Registry, now: Ticks) {
    if si.state != SiState::Est || ob.flags.intersects(BufFlags::SHUTW | BufFlags::OUT_EMPTY) {
        return;
    }
    let _ = sock_send(si, ob, registry, now);
}

/// `chk_rcv`: buffer conditions changed; re-enable or disable reading.
pub fn si_chk_rcv(si: &mut StreamInterface, ib: &mut Buffer, registry: &Registry) {
    if si.state != SiState::Est && si.state != SiState::Con {
        return;
    }
    let Some(ep) = si.endpoint.sock_mut() else { return };
    if ib.flags.intersects(
        BufFlags::FULL | BufFlags::HIJACK | BufFlags::DONT_READ | BufFlags::SHUTR,
    ) {
        ep.drop_interest(registry, Interest::READABLE);
    } else {
        ep.add_interest(registry, Interest::READABLE);
    }
}

/// `update`: full recomputation of interests and deadlines after the
/// FSM settled the buffer flags.
pub fn si_update(si: &mut StreamInterface, ib: &mut Buffer, ob: &mut Buffer, registry: &Registry, now: Ticks) {
    let indep = si.flags.contains(SiFlags::INDEP_STR);
    let Some(ep) = si.endpoint.sock_mut() else { return };

    if !ib.flags.contains(BufFlags::SHUTR) {
        if ib.flags.intersects(BufFlags::FULL | BufFlags::HIJACK | BufFlags::DONT_READ) {
            ep.drop_interest(registry, Interest::READABLE);
            // keep rex: the producer is paused by us, not silent
        } else {
            ep.add_interest(registry, Interest::READABLE);
            if !ib.flags.contains(BufFlags::READ_NOEXP) && ib.rto.is_set() {
                ib.rex = now.add_ifset(ib.rto);
            }
        }
    }

    if !ob.flags.contains(BufFlags::SHUTW) {
        if ob.flags.contains(BufFlags::OUT_EMPTY) {
            ep.drop_interest(registry, Interest::WRITABLE);
            ob.wex = Ticks::ETERNITY;
        } else {
            ep.add_interest(registry, Interest::WRITABLE);
            if ob.wto.is_set() {
                ob.wex = now.add_ifset(ob.wto);
                // a pending write keeps the paired read alive unless
                // the two directions are explicitly independent
                if ib.rex.is_set() && !indep {
                    ib.rex = ob.wex;
                }
            }
        }
    }
}

/// `shutw`: close the write side towards the transport. With data
/// still unread on the input and an established peer, this is a
/// half-close; otherwise the endpoint goes down entirely.
pub fn si_shutw(si: &mut StreamInterface, ib: &mut Buffer, ob: &mut Buffer, registry: &Registry) {
    ob.flags.remove(BufFlags::SHUTW_NOW);
    if ob.flags.contains(BufFlags::SHUTW) {
        return;
    }
    ob.flags.insert(BufFlags::SHUTW);
    ob.wex = Ticks::ETERNITY;

    match si.state {
        SiState::Est
            if !ib.flags.intersects(BufFlags::SHUTR | BufFlags::DONT_READ) =>
        {
            if let Some(ep) = si.endpoint.sock_mut() {
                if si.flags.contains(SiFlags::NOLINGER) {
                    relay_net::sock_reset(&ep.stream);
                } else {
                    relay_net::sock_shutw(&ep.stream);
                }
                ep.drop_interest(registry, Interest::WRITABLE);
            }
        }
        _ => {
            close_endpoint(si, registry);
            si.flags.remove(SiFlags::NOLINGER);
            ib.flags.insert(BufFlags::SHUTR);
            ib.rex = Ticks::ETERNITY;
            si.state = match si.state {
                SiState::Est | SiState::Con | SiState::Cer | SiState::Dis => SiState::Dis,
                _ => SiState::Clo,
            };
            si.exp = Ticks::ETERNITY;
        }
    }
}

/// `shutr`: stop reading. If the write side is already shut the
/// endpoint closes.
pub fn si_shutr(si: &mut StreamInterface, ib: &mut Buffer, ob: &Buffer, registry: &Registry) {
    ib.flags.remove(BufFlags::SHUTR_NOW);
    if ib.flags.contains(BufFlags::SHUTR) {
        return;
    }
    ib.flags.insert(BufFlags::SHUTR);
    ib.rex = Ticks::ETERNITY;

    if si.state != SiState::Est && si.state != SiState::Con {
        return;
    }
    if ob.flags.contains(BufFlags::SHUTW) {
        close_endpoint(si, registry);
        si.state = SiState::Dis;
        si.exp = Ticks::ETERNITY;
    } else if let Some(ep) = si.endpoint.sock_mut() {
        ep.drop_interest(registry, Interest::READABLE);
    }
}

/// Drops the transport endpoint (deregister + close). A source port
/// drawn from a range is parked in `released_port` for the FSM to
/// hand back.
pub fn close_endpoint(si: &mut StreamInterface, registry: &Registry) {
    if let Endpoint::Sock(mut ep) = std::mem::take(&mut si.endpoint) {
        ep.set_interest(registry, None);
        if si.flags.contains(SiFlags::NOLINGER) {
            relay_net::sock_reset(&ep.stream);
        }
        if let Some(port) = ep.local_port {
            si.released_port = Some(port);
        }
    }
}

/// Runs an embedded producer: move its payload into the input buffer,
/// then signal EOF exactly like a socket read of zero would.
pub fn run_iohandler(si: &mut StreamInterface, ib: &mut Buffer) {
    let Endpoint::Embedded(Embedded::Responder { data, pos }) = &mut si.endpoint else {
        return;
    };
    while *pos < data.len() {
        let want = (data.len() - *pos).min(ib.size());
        match ib.write(&data[*pos..*pos + want]) {
            crate::buffer::Store::Written => *pos += want,
            crate::buffer::Store::NoRoom(room) if room > 0 => {
                let upto = *pos + room.min(data.len() - *pos);
                if ib.write(&data[*pos..upto]) != crate::buffer::Store::Written {
                    return;
                }
                *pos = upto;
            }
            _ => return,
        }
    }
    // payload delivered: producer EOF
    ib.flags.insert(BufFlags::READ_NULL | BufFlags::SHUTR);
    ib.rex = Ticks::ETERNITY;
    si.state = SiState::Dis;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_supports_range_checks() {
        assert!(SiState::Est >= SiState::Est);
        assert!(SiState::Dis >= SiState::Est);
        assert!(SiState::Req < SiState::Con);
        assert!(SiState::Ass < SiState::Con);
        assert!(SiState::Que < SiState::Con);
        assert!(SiState::Tar < SiState::Con);
        assert!(SiState::Cer > SiState::Con);
    }

    #[test]
    fn si_timeout_promotes_to_flag() {
        let mut si = StreamInterface::new_ini();
        si.exp = Ticks(100);
        si.check_timeout(Ticks(99));
        assert!(!si.flags.contains(SiFlags::EXP));
        si.check_timeout(Ticks(100));
        assert!(si.flags.contains(SiFlags::EXP));
    }

    #[test]
    fn record_err_keeps_first_cause() {
        let mut si = StreamInterface::new_ini();
        si.record_err(SiErr::ConnTo);
        si.record_err(SiErr::ConnErr);
        assert_eq!(si.err_type, SiErr::ConnTo);
    }

    #[test]
    fn iohandler_feeds_and_closes() {
        let mut si = StreamInterface::new_est(Endpoint::Embedded(Embedded::Responder {
            data: b"HTTP/1.0 200 OK\r\n\r\n".to_vec(),
            pos: 0,
        }));
        let mut ib = Buffer::new(64);
        run_iohandler(&mut si, &mut ib);
        assert_eq!(ib.send_max(), 19);
        assert!(ib.flags.contains(BufFlags::SHUTR));
        assert_eq!(si.state, SiState::Dis);
    }
}
