use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use mio::{Events, Interest, Poll, Token};
use relay_timing::{Clock, Ticks};
use relay_utils::{Arena, SlotId};
use tracing::{debug, info, warn};

use crate::analyser::HttpHooks;
use crate::buffer::{BufFlags, Buffer};
use crate::interface::{
    close_endpoint, si_chk_rcv, si_chk_snd, sock_recv, sock_send, Embedded, Endpoint, IoEvent,
    SiErr, SiFlags, SiState, SockEp, StreamInterface,
};
use crate::proxy::{ListenerState, ProxyMode, ProxyOptions, ProxySet};
use crate::queue;
use crate::runtime::Runtime;
use crate::sched::{Scheduler, WakeReasons};
use crate::session::{fsm, SessFlags, Session, SessionLogs, Side, TermError};

/// Listener sockets own the low token space; connection tokens encode
/// the session slot and side above this base.
const TOKEN_BASE: usize = 1 << 16;

pub fn client_token(slot: SlotId) -> Token {
    Token(TOKEN_BASE + slot.index() * 2)
}

pub fn server_token(slot: SlotId) -> Token {
    Token(TOKEN_BASE + slot.index() * 2 + 1)
}

enum TokenKind {
    Listener(usize),
    Conn(SlotId, Side),
}

fn decode_token(token: Token) -> TokenKind {
    if token.0 < TOKEN_BASE {
        TokenKind::Listener(token.0)
    } else {
        let v = token.0 - TOKEN_BASE;
        let side = if v % 2 == 0 { Side::Client } else { Side::Server };
        TokenKind::Conn(SlotId((v / 2) as u32), side)
    }
}

/// The single-threaded engine: one poller, one runqueue, one timer
/// wheel, and every session of every configured proxy.
pub struct Engine {
    poll: Poll,
    events: Events,
    clock: Clock,
    pub sched: Scheduler,
    pub sessions: Arena<Session>,
    pub proxies: ProxySet,
    pub rt: Runtime,
    sockets: Vec<mio::net::TcpListener>,
    pub http: Option<Box<dyn HttpHooks>>,
}

impl Engine {
    /// Binds every configured listener and registers it for accepts.
    pub fn new(mut proxies: ProxySet, rt: Runtime) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut sockets = Vec::with_capacity(proxies.listeners.len());
        for (idx, lst) in proxies.listeners.iter_mut().enumerate() {
            let mut sock = relay_net::bind_listener(lst.addr, &lst.opts)
                .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, e.to_string()))?;
            poll.registry().register(&mut sock, Token(idx), Interest::READABLE)?;
            lst.state = ListenerState::Ready;
            info!(addr = %lst.addr, fe = lst.fe.0, "listening");
            sockets.push(sock);
        }
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            clock: Clock::new(),
            sched: Scheduler::default(),
            sessions: Arena::with_capacity(1024),
            proxies,
            rt,
            sockets,
            http: None,
        })
    }

    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// Drives the engine until `stop` flips.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll_once(Some(std::time::Duration::from_millis(500))) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(%err, "poll failed");
                break;
            }
        }
        info!("engine stopping");
    }

    /// One iteration: poll I/O up to the nearest deadline, mark tasks,
    /// expire timers, drain the runqueue.
    pub fn poll_once(&mut self, cap: Option<std::time::Duration>) -> io::Result<()> {
        let now = self.now();
        let mut timeout = self
            .sched
            .next_deadline()
            .until(now)
            .map(std::time::Duration::from_millis);
        if self.sched.has_runnable() {
            timeout = Some(std::time::Duration::ZERO);
        } else if let Some(cap) = cap {
            timeout = Some(timeout.map_or(cap, |t| t.min(cap)));
        }

        self.poll.poll(&mut self.events, timeout)?;

        let mut accepts: Vec<usize> = Vec::new();
        let mut ios: Vec<(SlotId, Side, bool, bool)> = Vec::new();
        for ev in self.events.iter() {
            match decode_token(ev.token()) {
                TokenKind::Listener(idx) => accepts.push(idx),
                TokenKind::Conn(slot, side) => {
                    ios.push((slot, side, ev.is_readable(), ev.is_writable()));
                }
            }
        }

        for idx in accepts {
            self.accept_loop(idx);
        }
        for (slot, side, readable, writable) in ios {
            self.io_event(slot, side, readable, writable);
        }

        let now = self.now();
        self.sched.expire(now);
        while let Some((task, why)) = self.sched.pop() {
            self.dispatch(task, why);
        }
        self.drain_dequeues();
        Ok(())
    }

    /// Accepts as many connections as the per-wake budget, the
    /// listener, the frontend and the global limits allow.
    fn accept_loop(&mut self, lidx: usize) {
        let now = self.now();
        let mut budget = self.rt.tune.maxpollevents;
        let fe_id = self.proxies.listeners[lidx].fe;

        if let Some(lim) = self.proxies.proxy(fe_id).fe_sps_lim {
            let remaining = self.proxies.proxy_mut(fe_id).fe_sess_per_sec.remaining(lim, now);
            budget = budget.min(remaining);
        }

        while budget > 0 {
            budget -= 1;
            {
                let fe = self.proxies.proxy(fe_id);
                if fe.feconn >= fe.maxconn || self.rt.actconn >= self.rt.maxconn {
                    break;
                }
            }
            let (stream, addr) = match self.sockets[lidx].accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            };

            let lst = &mut self.proxies.listeners[lidx];
            if lst.nbconn >= lst.maxconn {
                // shed: the listener is at capacity
                drop(stream);
                continue;
            }

            self.new_session(lidx, stream, addr, now);
        }

        // pause the listener at capacity; resumed at session teardown
        let lst = &mut self.proxies.listeners[lidx];
        if lst.nbconn >= lst.maxconn && lst.state == ListenerState::Ready {
            if let Err(err) = self.poll.registry().deregister(&mut self.sockets[lidx]) {
                debug!(%err, "listener pause");
            }
            lst.state = ListenerState::Full;
            debug!(addr = %lst.addr, "listener full");
        }
    }

    fn new_session(
        &mut self,
        lidx: usize,
        stream: mio::net::TcpStream,
        addr: std::net::SocketAddr,
        now: Ticks,
    ) {
        let fe_id = self.proxies.listeners[lidx].fe;
        let mode = self.proxies.proxy(fe_id).mode;

        // probes from a monitoring network are closed right away in
        // TCP mode; HTTP and health modes get a canned answer below
        let monitored = self.proxies.proxy(fe_id).monitor_matches(addr.ip());
        if monitored && mode == ProxyMode::Tcp {
            drop(stream);
            return;
        }

        let opts = {
            let fe = self.proxies.proxy(fe_id);
            relay_net::StreamOpts {
                keepalive: fe.options.contains(ProxyOptions::TCP_CLI_KA),
                nolinger: fe.options.contains(ProxyOptions::TCP_NOLINGER),
                sndbuf: self.rt.tune.client_sndbuf,
                rcvbuf: self.rt.tune.client_rcvbuf,
            }
        };
        if let Err(err) = relay_net::prepare_accepted(&stream, &opts) {
            debug!(%err, "accept setup failed");
            return;
        }
        let frt_addr = stream.local_addr().unwrap_or(self.proxies.listeners[lidx].addr);

        let bufsize = self.rt.tune.bufsize;
        let mut req = Buffer::new(bufsize);
        let mut rep = Buffer::new(bufsize);
        {
            let fe = self.proxies.proxy(fe_id);
            req.rto = fe.timeouts.client;
            req.wto = fe.timeouts.server;
            req.cto = fe.timeouts.connect;
            rep.rto = fe.timeouts.server;
            rep.wto = fe.timeouts.client;
            req.flags.insert(BufFlags::READ_ATTACHED);
            if fe.mode == ProxyMode::Http {
                req.flags.insert(BufFlags::READ_DONTWAIT);
            }
            if fe.options.contains(ProxyOptions::NODELAY) {
                req.flags.insert(BufFlags::NEVER_WAIT);
                rep.flags.insert(BufFlags::NEVER_WAIT);
            }
        }
        req.analysers = self.proxies.listeners[lidx].analysers;
        if req.analysers.is_empty() {
            req.auto_connect();
            req.auto_close();
        }

        let listener_id = self.proxies.listeners[lidx].id;
        let retries = self.proxies.proxy(fe_id).retries as i32;
        let mut sess = Session {
            slot: SlotId(0),
            uniq_id: self.rt.totalconn,
            listener: listener_id,
            fe: fe_id,
            be: fe_id,
            srv: None,
            prev_srv: None,
            srv_conn: None,
            cli_addr: addr,
            frt_addr,
            flags: if monitored { SessFlags::MONITOR | SessFlags::FRT_ADDR_SET } else { SessFlags::FRT_ADDR_SET },
            term: TermError::None,
            finst: crate::session::FinishStage::None,
            req,
            rep,
            si: [StreamInterface::new_est(Endpoint::None), StreamInterface::new_ini()],
            conn_retries: retries,
            pend_pos: None,
            store: Vec::new(),
            http: None,
            logs: SessionLogs { accept: now, ..Default::default() },
        };
        #[cfg(target_os = "linux")]
        sess.si[0].flags.insert(SiFlags::CAP_SPLICE);
        if self.proxies.proxy(fe_id).options.contains(ProxyOptions::INDEP_STR) {
            sess.si[0].flags.insert(SiFlags::INDEP_STR);
            sess.si[1].flags.insert(SiFlags::INDEP_STR);
        }

        let slot = self.sessions.insert(sess);
        let sess = self.sessions.get_mut(slot).expect("just inserted");
        sess.slot = slot;

        let mut ep = SockEp::new(stream, client_token(slot));
        let canned: Option<&'static [u8]> = if monitored && mode == ProxyMode::Http {
            Some(b"HTTP/1.0 200 OK\r\n\r\n")
        } else if mode == ProxyMode::Health {
            Some(b"OK\n")
        } else {
            None
        };
        match canned {
            Some(msg) => {
                // embedded responder takes the server seat: its
                // iohandler feeds the answer, then the session closes
                sess.req.shutr_now();
                sess.req.analysers = crate::analyser::AnMask::empty();
                sess.si[1] = StreamInterface::new_est(Endpoint::Embedded(Embedded::Responder {
                    data: msg.to_vec(),
                    pos: 0,
                }));
            }
            None => {
                ep.set_interest(self.poll.registry(), Some(Interest::READABLE));
                if sess.req.rto.is_set() {
                    sess.req.rex = now.add_ifset(sess.req.rto);
                }
            }
        }
        sess.si[0].endpoint = Endpoint::Sock(ep);

        // global and per-object accounting
        self.rt.actconn += 1;
        self.rt.totalconn += 1;
        {
            let lst = &mut self.proxies.listeners[lidx];
            lst.nbconn += 1;
            lst.counters.cum_conn += 1;
            lst.counters.conn_max = lst.counters.conn_max.max(u64::from(lst.nbconn));
        }
        {
            let fe = self.proxies.proxy_mut(fe_id);
            fe.feconn += 1;
            fe.counters.cum_conn += 1;
            fe.counters.cum_sess += 1;
            fe.counters.conn_max = fe.counters.conn_max.max(u64::from(fe.feconn));
            fe.fe_sess_per_sec.note(now);
        }

        debug!(sess = %slot, client = %addr, fe = %self.proxies.proxy(fe_id).name, "accepted");
        self.sched.wakeup(slot, WakeReasons::INIT);
    }

    /// Marks buffer/interface flags for one readiness event and wakes
    /// the owning task.
    fn io_event(&mut self, slot: SlotId, side: Side, readable: bool, writable: bool) {
        let registry = self.poll.registry();
        let Some(sess) = self.sessions.get_mut(slot) else { return };
        let now = self.clock.now();
        let mut activity = false;

        // connect completion is reported as write readiness
        if side == Side::Server && sess.si[1].state == SiState::Con && writable {
            let outcome = match &sess.si[1].endpoint {
                Endpoint::Sock(ep) => relay_net::connect_outcome(&ep.stream),
                _ => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    sess.req.flags.insert(BufFlags::WRITE_NULL);
                }
                Err(err) => {
                    debug!(sess = %slot, %err, "connect failed");
                    sess.si[1].flags.insert(SiFlags::ERR);
                    sess.si[1].record_err(match err {
                        relay_net::ConnectError::TimedOut => SiErr::ConnTo,
                        _ => SiErr::ConnErr,
                    });
                }
            }
            self.sched.wakeup(slot, WakeReasons::IO);
            return;
        }

        #[cfg(target_os = "linux")]
        {
            activity |= splice_pass(sess, side, readable, writable, &mut self.rt);
        }

        let other = match side {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        };

        if readable {
            let (si, ib, ob) = sess.si_bufs(side);
            if !ib.flags.contains(BufFlags::KERN_SPLICING)
                && sock_recv(si, ib, ob, registry, now) == IoEvent::Activity
            {
                activity = true;
                // the consumer may be able to push the new bytes out
                // without waiting for its own writable event
                let (osi, _oib, oob) = sess.si_bufs(other);
                si_chk_snd(osi, oob, registry, now);
            }
        }
        if writable {
            let (si, _ib, ob) = sess.si_bufs(side);
            if sock_send(si, ob, registry, now) == IoEvent::Activity {
                activity = true;
                // room was made; the producer may resume reading
                let (osi, oib, _oob) = sess.si_bufs(other);
                si_chk_rcv(osi, oib, registry);
            }
        }

        if activity {
            self.sched.wakeup(slot, WakeReasons::IO);
        }
    }

    /// Runs the FSM for one task and applies its disposition.
    fn dispatch(&mut self, task: SlotId, why: WakeReasons) {
        let now = self.clock.now();
        if !self.sessions.contains(task) {
            return;
        }
        let mut http_hooks = self.http.take();
        let disposition = {
            let Some(sess) = self.sessions.get_mut(task) else { unreachable!() };
            let mut ctx = fsm::FsmCtx {
                proxies: &mut self.proxies,
                rt: &mut self.rt,
                registry: self.poll.registry(),
                http: http_hooks.as_deref_mut(),
                now,
                wake: why,
            };
            fsm::process_session(sess, &mut ctx)
        };
        self.http = http_hooks;
        match disposition {
            fsm::Disposition::Run { expire } => self.sched.schedule(task, expire),
            fsm::Disposition::Close => self.teardown(task),
        }
        self.drain_dequeues();
    }

    /// Promotes queued sessions onto servers that freed a slot.
    fn drain_dequeues(&mut self) {
        let mut pending = std::mem::take(&mut self.rt.pending_dequeues);
        while let Some(sref) = pending.pop() {
            while queue::may_dequeue(&self.proxies, sref) {
                let Some(slot) = queue::next_pending(&mut self.proxies, sref) else { break };
                let Some(sess) = self.sessions.get_mut(slot) else { continue };
                sess.pend_pos = None;
                sess.srv = Some(sref);
                sess.flags.insert(SessFlags::ASSIGNED);
                crate::backend::change_server(sess, &mut self.proxies, Some(sref));
                debug!(sess = %slot, "promoted from queue");
                self.sched.wakeup(slot, WakeReasons::OTHER);
            }
        }
    }

    /// Final teardown: counters, listener resume, access log, arena
    /// free with observer cursor advance.
    fn teardown(&mut self, slot: SlotId) {
        let Some(mut sess) = self.sessions.remove(slot) else { return };
        let now = self.clock.now();
        sess.logs.t_close = Some(now - sess.logs.accept);

        close_endpoint(&mut sess.si[0], self.poll.registry());
        close_endpoint(&mut sess.si[1], self.poll.registry());
        #[cfg(target_os = "linux")]
        for si in &mut sess.si {
            if let Endpoint::Sock(ep) = &mut si.endpoint {
                if let Some(pipe) = ep.pipe.take() {
                    self.rt.pipes.put(pipe);
                }
            }
        }
        if let Some(port) = sess.si[1].released_port.take() {
            if let Some(sref) = sess.srv.or(sess.prev_srv) {
                if let Some(range) = self.proxies.server_mut(sref).port_range.as_mut() {
                    range.release(port);
                }
            }
        }

        if let Some(pos) = sess.pend_pos.take() {
            queue::unlink(&mut self.proxies, slot, pos);
        }
        if let Some(sref) = sess.srv {
            if sess.flags.contains(SessFlags::CURR_SESS) {
                let srv = self.proxies.server_mut(sref);
                srv.cur_sess = srv.cur_sess.saturating_sub(1);
            }
            crate::backend::change_server(&mut sess, &mut self.proxies, None);
            if queue::may_dequeue(&self.proxies, sref) {
                self.rt.pending_dequeues.push(sref);
            }
        }

        let fe = self.proxies.proxy_mut(sess.fe);
        fe.feconn = fe.feconn.saturating_sub(1);
        if sess.flags.contains(SessFlags::BE_ASSIGNED) {
            let be = self.proxies.proxy_mut(sess.be);
            be.beconn = be.beconn.saturating_sub(1);
        }
        self.rt.actconn = self.rt.actconn.saturating_sub(1);

        let lidx = sess.listener.0 as usize;
        {
            let lst = &mut self.proxies.listeners[lidx];
            lst.nbconn = lst.nbconn.saturating_sub(1);
            if lst.state == ListenerState::Full && lst.nbconn < lst.maxconn {
                if self
                    .poll
                    .registry()
                    .register(&mut self.sockets[lidx], Token(lidx), Interest::READABLE)
                    .is_ok()
                {
                    lst.state = ListenerState::Ready;
                    debug!(addr = %lst.addr, "listener resumed");
                }
            }
        }

        sess.process_counters(&mut self.proxies);

        let dontlog = sess.flags.contains(SessFlags::MONITOR)
            || (self
                .proxies
                .proxy(sess.fe)
                .options
                .contains(ProxyOptions::DONTLOGNULL)
                && sess.req.total() == 0);
        if !dontlog {
            let code = sess.term_code();
            info!(
                target: "relay::access",
                client = %sess.cli_addr,
                fe = %self.proxies.proxy(sess.fe).name,
                be = %self.proxies.proxy(sess.be).name,
                srv = sess.srv.map(|s| self.proxies.server(s).name.clone()).as_deref().unwrap_or("-"),
                tq = ?sess.logs.t_queue,
                tc = ?sess.logs.t_connect,
                tt = ?sess.logs.t_close,
                bytes_in = sess.logs.bytes_in,
                bytes_out = sess.logs.bytes_out,
                term = %format!("{}{}", code[0], code[1]),
                "session closed"
            );
        }

        self.sched.cancel(slot);
        let next = self.sessions.next_after(slot);
        self.rt.backrefs.advance(slot, next);
    }
}

/// Kernel-splice data path for one direction. Moves bytes from the
/// producer's socket into its pipe and on into the consumer's socket,
/// bypassing the ring buffer. Falls back to buffered forwarding on
/// any error by clearing the splice flag.
#[cfg(target_os = "linux")]
fn splice_pass(sess: &mut Session, side: Side, readable: bool, writable: bool, rt: &mut Runtime) -> bool {
    use relay_net::SpliceOutcome;
    use std::os::fd::AsRawFd;

    // the buffer spliced here is the one this side produces into
    let (producer, consumer) = match side {
        Side::Client => (Side::Client, Side::Server),
        Side::Server => (Side::Server, Side::Client),
    };
    let buf_flags = match producer {
        Side::Client => sess.req.flags,
        Side::Server => sess.rep.flags,
    };
    if !buf_flags.contains(BufFlags::KERN_SPLICING) {
        // drain-only case: we are the consumer of a spliced buffer
        if writable {
            let other = match side {
                Side::Client => Side::Server,
                Side::Server => Side::Client,
            };
            let other_flags = match other {
                Side::Client => sess.req.flags,
                Side::Server => sess.rep.flags,
            };
            if other_flags.contains(BufFlags::KERN_SPLICING) {
                return splice_drain(sess, other, rt);
            }
        }
        return false;
    }
    if !readable {
        return false;
    }

    let consumer_fd = match &sess.si[consumer as usize].endpoint {
        Endpoint::Sock(ep) => ep.stream.as_raw_fd(),
        _ => return false,
    };

    let mut activity = false;
    let (si, ib, ob) = sess.si_bufs(producer);
    let ob_shutw = ob.flags.contains(BufFlags::SHUTW);
    let Some(ep) = si.endpoint.sock_mut() else { return false };
    if ep.pipe.is_none() {
        ep.pipe = rt.pipes.take();
        if ep.pipe.is_none() {
            // pool dry: fall back to buffered forwarding
            ib.flags.remove(BufFlags::KERN_SPLICING);
            return false;
        }
    }
    let prod_fd = ep.stream.as_raw_fd();
    let pipe = ep.pipe.as_mut().expect("pipe just ensured");

    loop {
        let budget: usize = match ib.to_forward() {
            0 => break,
            crate::buffer::FORWARD_INFINITE => 1 << 20,
            n => n.min(1 << 20) as usize,
        };
        match pipe.splice_in(prod_fd, budget) {
            SpliceOutcome::Data(n) => {
                ib.spliced_in(n);
                activity = true;
            }
            SpliceOutcome::Closed => {
                ib.flags.insert(BufFlags::READ_NULL | BufFlags::SHUTR);
                ib.rex = Ticks::ETERNITY;
                if ob_shutw {
                    si.state = SiState::Dis;
                    si.exp = Ticks::ETERNITY;
                }
                activity = true;
                break;
            }
            SpliceOutcome::WouldBlock => break,
            SpliceOutcome::Error(_) => {
                ib.flags.remove(BufFlags::KERN_SPLICING);
                break;
            }
        }
        match pipe.splice_out(consumer_fd) {
            SpliceOutcome::Data(_) => {
                activity = true;
            }
            SpliceOutcome::WouldBlock => break,
            SpliceOutcome::Closed | SpliceOutcome::Error(_) => {
                ib.flags.remove(BufFlags::KERN_SPLICING);
                break;
            }
        }
    }
    activity
}

/// Drains a spliced buffer's pipe into this (writable) consumer.
#[cfg(target_os = "linux")]
fn splice_drain(sess: &mut Session, producer: Side, _rt: &mut Runtime) -> bool {
    use relay_net::SpliceOutcome;
    use std::os::fd::AsRawFd;

    let consumer = match producer {
        Side::Client => Side::Server,
        Side::Server => Side::Client,
    };
    let consumer_fd = match &sess.si[consumer as usize].endpoint {
        Endpoint::Sock(ep) => ep.stream.as_raw_fd(),
        _ => return false,
    };
    let (si, ib, _ob) = sess.si_bufs(producer);
    let Some(ep) = si.endpoint.sock_mut() else { return false };
    let Some(pipe) = ep.pipe.as_mut() else { return false };
    match pipe.splice_out(consumer_fd) {
        SpliceOutcome::Data(_) => true,
        SpliceOutcome::WouldBlock => false,
        SpliceOutcome::Closed | SpliceOutcome::Error(_) => {
            ib.flags.remove(BufFlags::KERN_SPLICING);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_roundtrip() {
        let slot = SlotId(42);
        match decode_token(client_token(slot)) {
            TokenKind::Conn(s, Side::Client) => assert_eq!(s, slot),
            _ => panic!("bad decode"),
        }
        match decode_token(server_token(slot)) {
            TokenKind::Conn(s, Side::Server) => assert_eq!(s, slot),
            _ => panic!("bad decode"),
        }
        match decode_token(Token(3)) {
            TokenKind::Listener(3) => {}
            _ => panic!("bad decode"),
        }
    }
}
