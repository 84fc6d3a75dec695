//! The per-session state machine. One dispatch sweeps timers, errors,
//! connection progress, both analyser chains, the server-side
//! connection stages, forwarding and shutdown propagation, then either
//! computes the next deadline or declares the session dead.

use mio::{Interest, Registry};
use relay_net::{ConnectError, ConnectTarget, StreamOpts};
use relay_timing::{Duration, Ticks};
use tracing::{debug, trace};

use crate::analyser::{self, AnMask, AnaCtx, HttpHooks};
use crate::backend::{self, Assign};
use crate::buffer::{BufFlags, FORWARD_INFINITE};
use crate::interface::{
    close_endpoint, run_iohandler, si_shutr, si_shutw, si_update, Endpoint, SiErr, SiFlags,
    SiState, SockEp,
};
use crate::proxy::{ProxyOptions, ProxySet};
use crate::queue;
use crate::runtime::Runtime;
use crate::sched::WakeReasons;
use crate::session::{FinishStage, SessFlags, Session, Side, TermError};

/// Everything one FSM dispatch may touch besides the session itself.
pub struct FsmCtx<'a, 'h> {
    pub proxies: &'a mut ProxySet,
    pub rt: &'a mut Runtime,
    pub registry: &'a Registry,
    pub http: Option<&'h mut (dyn HttpHooks + 'static)>,
    pub now: Ticks,
    pub wake: WakeReasons,
}

/// What the engine should do with the session after a dispatch.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Keep it; rearm the task timer at `expire`.
    Run { expire: Ticks },
    /// Both sides are done: tear it down.
    Close,
}

/// Turn-around delay after an asynchronous connect error.
const TURNAROUND: Duration = Duration::from_millis(1_000);

pub fn process_session(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) -> Disposition {
    // reentrancy guard: wake-ups raised from nested calls must only
    // requeue the task, never re-enter it
    sess.si[0].flags.insert(SiFlags::DONT_WAKE);
    sess.si[1].flags.insert(SiFlags::DONT_WAKE);

    // this one must be re-proven on every pass
    sess.req.flags.remove(BufFlags::READ_NOEXP);

    let mut rqf_last = sess.req.flags;
    let mut rpf_last = sess.rep.flags;

    // Phase A: promote expired deadlines, then apply the shutdowns
    // they imply. Classification waits for Phase I.
    if ctx.wake.contains(WakeReasons::TIMER) {
        sess.si[0].check_timeout(ctx.now);
        sess.si[1].check_timeout(ctx.now);
        sess.req.check_timeouts(ctx.now);
        sess.rep.check_timeouts(ctx.now);

        if sess.req.flags & (BufFlags::SHUTW | BufFlags::WRITE_TIMEOUT) == BufFlags::WRITE_TIMEOUT {
            sess.si[1].flags.insert(SiFlags::NOLINGER);
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutw(si, ib, ob, ctx.registry);
        }
        if sess.req.flags & (BufFlags::SHUTR | BufFlags::READ_TIMEOUT) == BufFlags::READ_TIMEOUT {
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutr(si, ib, ob, ctx.registry);
        }
        if sess.rep.flags & (BufFlags::SHUTW | BufFlags::WRITE_TIMEOUT) == BufFlags::WRITE_TIMEOUT {
            sess.si[0].flags.insert(SiFlags::NOLINGER);
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutw(si, ib, ob, ctx.registry);
        }
        if sess.rep.flags & (BufFlags::SHUTR | BufFlags::READ_TIMEOUT) == BufFlags::READ_TIMEOUT {
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutr(si, ib, ob, ctx.registry);
        }
    }

    // Phase B: transport errors reported on the interfaces. Client
    // side has no retryable errors; server-side connect errors are
    // handled by the CON/CER machinery below instead.
    if sess.si[0].flags.contains(SiFlags::ERR)
        && matches!(sess.si[0].state, SiState::Est | SiState::Dis)
    {
        {
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutr(si, ib, ob, ctx.registry);
        }
        {
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutw(si, ib, ob, ctx.registry);
        }
        sess.req.flags.insert(BufFlags::READ_ERROR);
        sess.rep.flags.insert(BufFlags::WRITE_ERROR);
        if sess.req.analysers.is_empty() && sess.rep.analysers.is_empty() {
            bump_abort_counters(sess, ctx, true);
            sess.note_term(TermError::ClientAbort);
            sess.note_finst(FinishStage::Data);
        }
    }

    if sess.si[1].flags.contains(SiFlags::ERR)
        && matches!(sess.si[1].state, SiState::Est | SiState::Dis)
    {
        {
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutr(si, ib, ob, ctx.registry);
        }
        {
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutw(si, ib, ob, ctx.registry);
        }
        sess.rep.flags.insert(BufFlags::READ_ERROR);
        sess.req.flags.insert(BufFlags::WRITE_ERROR);
        ctx.proxies.proxy_mut(sess.be).counters.failed_resp += 1;
        if let Some(sref) = sess.srv {
            ctx.proxies.server_mut(sref).counters.failed_resp += 1;
        }
        if sess.req.analysers.is_empty() && sess.rep.analysers.is_empty() {
            bump_abort_counters(sess, ctx, false);
            sess.note_term(TermError::ServerAbort);
            sess.note_finst(FinishStage::Data);
        }
    }

    // Phase C: a connection attempt may have finished
    if sess.si[1].state == SiState::Con {
        if !update_st_con_tcp(sess, ctx) {
            update_st_cer(sess, ctx);
        } else if sess.si[1].state == SiState::Est {
            establish(sess, ctx);
        }
        release_server_port(sess, ctx);
    }

    // The resync loop: every phase below may change buffer or
    // interface state; we iterate until a fixed point. The bound is a
    // livelock backstop, the loop converges because each resync is
    // triggered only by an observed change.
    let mut guard = ctx.rt.tune.maxpollevents.max(8);
    'resync: loop {
        guard -= 1;
        if guard == 0 {
            relay_utils::safe_panic!("session {} failed to settle", sess.slot);
            break;
        }

        // collapse DIS into CLO, with server-side accounting
        if sess.si[0].state == SiState::Dis {
            sess.si[0].state = SiState::Clo;
        }
        if sess.si[1].state == SiState::Dis {
            sess.si[1].state = SiState::Clo;
            release_server_port(sess, ctx);
            if let Some(sref) = sess.srv {
                if sess.flags.contains(SessFlags::CURR_SESS) {
                    sess.flags.remove(SessFlags::CURR_SESS);
                    let srv = ctx.proxies.server_mut(sref);
                    srv.cur_sess = srv.cur_sess.saturating_sub(1);
                }
                backend::change_server(sess, ctx.proxies, None);
                if queue::may_dequeue(ctx.proxies, sref) {
                    ctx.rt.pending_dequeues.push(sref);
                }
            }
        }

        // Phase D: request analysers
        loop {
            let run = !(sess.req.flags & BufFlags::MASK_ANALYSER).is_empty()
                || !((sess.req.flags ^ rqf_last) & BufFlags::MASK_STATIC).is_empty();
            if !run {
                break;
            }
            let flags_before = sess.req.flags;
            if sess.si[0].state >= SiState::Est {
                sess.req.auto_read();
                sess.req.auto_connect();
                sess.req.auto_close();
                let mut actx = AnaCtx {
                    proxies: &mut *ctx.proxies,
                    http: ctx.http.take(),
                    now: ctx.now,
                    max_loops: ctx.rt.tune.maxpollevents,
                };
                analyser::run_request_chain(sess, &mut actx);
                ctx.http = actx.http;
            }
            if ((sess.req.flags ^ flags_before) & BufFlags::MASK_STATIC).is_empty() {
                break;
            }
            rqf_last = sess.req.flags;
        }
        let req_ana_back = sess.req.analysers;

        // Phase E: response analysers (or the hijacker while active)
        loop {
            if sess.rep.flags.contains(BufFlags::HIJACK) {
                break;
            }
            let run = !(sess.rep.flags & BufFlags::MASK_ANALYSER).is_empty()
                || !((sess.rep.flags ^ rpf_last) & BufFlags::MASK_STATIC).is_empty();
            if !run {
                break;
            }
            let flags_before = sess.rep.flags;
            if sess.si[1].state >= SiState::Est {
                sess.rep.auto_read();
                sess.rep.auto_close();
                let mut actx = AnaCtx {
                    proxies: &mut *ctx.proxies,
                    http: ctx.http.take(),
                    now: ctx.now,
                    max_loops: ctx.rt.tune.maxpollevents,
                };
                analyser::run_response_chain(sess, &mut actx);
                ctx.http = actx.http;
            }
            if ((sess.rep.flags ^ flags_before) & BufFlags::MASK_STATIC).is_empty() {
                break;
            }
            rpf_last = sess.rep.flags;
        }

        // a response analyser may have re-enabled request analysers
        if !(sess.req.analysers & !req_ana_back).is_empty() {
            continue 'resync;
        }

        // unhandled data-phase errors become the session's verdict
        if sess.term == TermError::None {
            classify_data_errors(sess, ctx);
        }

        // Phase G (request): freewheel and maybe splice
        if sess.req.analysers.is_empty()
            && !sess
                .req
                .flags
                .intersects(BufFlags::HIJACK | BufFlags::SHUTW | BufFlags::SHUTW_NOW)
            && sess.si[0].state >= SiState::Est
            && sess.req.to_forward() != FORWARD_INFINITE
        {
            sess.req.auto_read();
            sess.req.auto_connect();
            sess.req.auto_close();
            sess.req.flush();
            if !sess
                .req
                .flags
                .intersects(BufFlags::SHUTR | BufFlags::SHUTW | BufFlags::SHUTW_NOW)
            {
                sess.req.forward(FORWARD_INFINITE);
            }
        }
        maybe_engage_splicing(sess, ctx, Side::Client);

        rqf_last = sess.req.flags;

        // Phase H (request): shutdown propagation, in order
        if sess.req.flags
            & (BufFlags::SHUTW
                | BufFlags::SHUTW_NOW
                | BufFlags::HIJACK
                | BufFlags::AUTO_CLOSE
                | BufFlags::SHUTR)
            == (BufFlags::AUTO_CLOSE | BufFlags::SHUTR)
        {
            sess.req.shutw_now();
        }
        if sess.req.flags & (BufFlags::SHUTW | BufFlags::SHUTW_NOW | BufFlags::OUT_EMPTY)
            == (BufFlags::SHUTW_NOW | BufFlags::OUT_EMPTY)
        {
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutw(si, ib, ob, ctx.registry);
        }
        if sess.req.flags & (BufFlags::SHUTW | BufFlags::SHUTR | BufFlags::SHUTR_NOW)
            == BufFlags::SHUTW
            && sess.req.analysers.is_empty()
        {
            sess.req.shutr_now();
        }
        if sess.req.flags & (BufFlags::SHUTR | BufFlags::SHUTR_NOW) == BufFlags::SHUTR_NOW {
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutr(si, ib, ob, ctx.registry);
        }

        // an upper layer may want a connection, or an abort
        if sess.si[1].state == SiState::Ini {
            if sess.req.flags.contains(BufFlags::SHUTW) {
                sess.si[1].state = SiState::Clo;
                sess.req.shutw_now();
                sess.rep.shutr_now();
            } else if sess.req.flags & (BufFlags::AUTO_CONNECT | BufFlags::OUT_EMPTY)
                != BufFlags::OUT_EMPTY
            {
                // data to push or active connect requested
                sess.si[1].state = SiState::Req;
            }
        }

        // Phase F: drive the server-side connection stages
        if sess.si[1].state >= SiState::Req && sess.si[1].state < SiState::Con {
            loop {
                if sess.si[1].state != SiState::Req {
                    update_stream_int(sess, ctx);
                }
                if sess.si[1].state == SiState::Req {
                    prepare_conn_req(sess, ctx);
                }
                if sess.si[1].state != SiState::Ass {
                    break;
                }
            }
            release_server_port(sess, ctx);
        }

        if sess.si[0].state == SiState::Dis || sess.si[1].state == SiState::Dis {
            continue 'resync;
        }
        if !((sess.req.flags ^ rqf_last) & BufFlags::MASK_STATIC).is_empty() {
            continue 'resync;
        }

        // Phase G (response)
        if sess.rep.analysers.is_empty()
            && !sess
                .rep
                .flags
                .intersects(BufFlags::HIJACK | BufFlags::SHUTW | BufFlags::SHUTW_NOW)
            && sess.si[1].state >= SiState::Est
            && sess.rep.to_forward() != FORWARD_INFINITE
        {
            sess.rep.auto_read();
            sess.rep.auto_close();
            sess.rep.flush();
            if !sess
                .rep
                .flags
                .intersects(BufFlags::SHUTR | BufFlags::SHUTW | BufFlags::SHUTW_NOW)
            {
                sess.rep.forward(FORWARD_INFINITE);
            }
        }
        maybe_engage_splicing(sess, ctx, Side::Server);

        rpf_last = sess.rep.flags;

        // Phase H (response)
        if sess.rep.flags
            & (BufFlags::SHUTW
                | BufFlags::SHUTW_NOW
                | BufFlags::HIJACK
                | BufFlags::AUTO_CLOSE
                | BufFlags::SHUTR)
            == (BufFlags::AUTO_CLOSE | BufFlags::SHUTR)
        {
            sess.rep.shutw_now();
        }
        if sess.rep.flags & (BufFlags::SHUTW | BufFlags::SHUTW_NOW | BufFlags::OUT_EMPTY)
            == (BufFlags::SHUTW_NOW | BufFlags::OUT_EMPTY)
        {
            let (si, ib, ob) = sess.si_bufs(Side::Client);
            si_shutw(si, ib, ob, ctx.registry);
        }
        if sess.rep.flags & (BufFlags::SHUTW | BufFlags::SHUTR | BufFlags::SHUTR_NOW)
            == BufFlags::SHUTW
            && sess.rep.analysers.is_empty()
        {
            sess.rep.shutr_now();
        }
        if sess.rep.flags & (BufFlags::SHUTR | BufFlags::SHUTR_NOW) == BufFlags::SHUTR_NOW {
            let (si, ib, ob) = sess.si_bufs(Side::Server);
            si_shutr(si, ib, ob, ctx.registry);
        }

        if sess.si[0].state == SiState::Dis || sess.si[1].state == SiState::Dis {
            continue 'resync;
        }
        if sess.req.flags != rqf_last {
            continue 'resync;
        }
        if !((sess.rep.flags ^ rpf_last) & BufFlags::MASK_STATIC).is_empty() {
            continue 'resync;
        }
        break;
    }

    // Phase I: keep running, or declare the session finished
    let alive = sess.si[0].state != SiState::Clo
        || (sess.si[1].state > SiState::Ini && sess.si[1].state < SiState::Clo);

    if !alive {
        sess.si[0].flags.remove(SiFlags::DONT_WAKE);
        sess.si[1].flags.remove(SiFlags::DONT_WAKE);
        if sess.si[1].state == SiState::Clo && sess.si[1].prev_state == SiState::Est {
            debug!(sess = %sess.slot, be = %ctx.proxies.proxy(sess.be).name, "srvcls");
        }
        if sess.si[0].state == SiState::Clo && sess.si[0].prev_state == SiState::Est {
            debug!(sess = %sess.slot, fe = %ctx.proxies.proxy(sess.fe).name, "clicls");
        }
        return Disposition::Close;
    }

    if ctx
        .proxies
        .proxy(sess.fe)
        .options
        .contains(ProxyOptions::CONTSTATS)
        && sess.flags.contains(SessFlags::BE_ASSIGNED)
    {
        sess.process_counters(ctx.proxies);
    }

    // run the embedded producer, if any, before recomputing interests
    if matches!(sess.si[1].endpoint, Endpoint::Embedded(_)) && sess.si[1].state == SiState::Est {
        let (si, ib, _ob) = sess.si_bufs(Side::Server);
        run_iohandler(si, ib);
    }

    if sess.si[0].state == SiState::Est {
        let (si, ib, ob) = sess.si_bufs(Side::Client);
        si_update(si, ib, ob, ctx.registry, ctx.now);
    }
    if sess.si[1].state == SiState::Est && sess.si[1].endpoint.is_sock() {
        let (si, ib, ob) = sess.si_bufs(Side::Server);
        si_update(si, ib, ob, ctx.registry, ctx.now);
    }

    sess.req.flags.remove(
        BufFlags::READ_NULL | BufFlags::READ_PARTIAL | BufFlags::WRITE_NULL | BufFlags::WRITE_PARTIAL,
    );
    sess.rep.flags.remove(
        BufFlags::READ_NULL | BufFlags::READ_PARTIAL | BufFlags::WRITE_NULL | BufFlags::WRITE_PARTIAL,
    );
    sess.si[0].prev_state = sess.si[0].state;
    sess.si[1].prev_state = sess.si[1].state;
    sess.si[0].flags.remove(SiFlags::ERR | SiFlags::EXP);
    sess.si[1].flags.remove(SiFlags::ERR | SiFlags::EXP);

    // While a server response is expected, the client must not be the
    // one to time out: its read deadline yields to the server-side
    // write deadline.
    if (sess.rep.flags & (BufFlags::AUTO_CLOSE | BufFlags::SHUTR)).is_empty()
        && (sess.req.wex.is_set() || sess.rep.rex.is_set())
    {
        sess.req.flags.insert(BufFlags::READ_NOEXP);
        sess.req.rex = Ticks::ETERNITY;
    }

    let mut expire = sess
        .req
        .rex
        .first(sess.req.wex)
        .first(sess.rep.rex)
        .first(sess.rep.wex)
        .first(sess.si[0].exp)
        .first(sess.si[1].exp);
    if !sess.req.analysers.is_empty() {
        expire = expire.first(sess.req.analyse_exp);
    }

    sess.si[0].flags.remove(SiFlags::DONT_WAKE);
    sess.si[1].flags.remove(SiFlags::DONT_WAKE);

    trace!(sess = %sess.slot, cs = %sess.si[0].state, ss = %sess.si[1].state, %expire, "requeue");
    Disposition::Run { expire }
}

fn bump_abort_counters(sess: &Session, ctx: &mut FsmCtx<'_, '_>, client: bool) {
    let be = ctx.proxies.proxy_mut(sess.be);
    if client {
        be.counters.cli_aborts += 1;
    } else {
        be.counters.srv_aborts += 1;
    }
    if let Some(sref) = sess.srv {
        let srv = ctx.proxies.server_mut(sref);
        if client {
            srv.counters.cli_aborts += 1;
        } else {
            srv.counters.srv_aborts += 1;
        }
    }
}

/// Data-phase error classification once no analyser can take the
/// blame. Clears the analyser mask of the failed side, which in turn
/// lets the shutdown rules finish the session.
fn classify_data_errors(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    let req_err = sess.req.flags.intersects(
        BufFlags::READ_ERROR | BufFlags::READ_TIMEOUT | BufFlags::WRITE_ERROR | BufFlags::WRITE_TIMEOUT,
    );
    let rep_err = sess.rep.flags.intersects(
        BufFlags::READ_ERROR | BufFlags::READ_TIMEOUT | BufFlags::WRITE_ERROR | BufFlags::WRITE_TIMEOUT,
    );

    if req_err {
        sess.req.analysers = AnMask::empty();
        let (term, client) = if sess.req.flags.contains(BufFlags::READ_ERROR) {
            (TermError::ClientAbort, true)
        } else if sess.req.flags.contains(BufFlags::READ_TIMEOUT) {
            (TermError::ClientTimeout, true)
        } else if sess.req.flags.contains(BufFlags::WRITE_ERROR) {
            (TermError::ServerAbort, false)
        } else {
            (TermError::ServerTimeout, false)
        };
        bump_abort_counters(sess, ctx, client);
        sess.note_term(term);
        sess.set_term_stage(ctx.proxies);
    } else if rep_err {
        sess.rep.analysers = AnMask::empty();
        let (term, client) = if sess.rep.flags.contains(BufFlags::READ_ERROR) {
            (TermError::ServerAbort, false)
        } else if sess.rep.flags.contains(BufFlags::READ_TIMEOUT) {
            (TermError::ServerTimeout, false)
        } else if sess.rep.flags.contains(BufFlags::WRITE_ERROR) {
            (TermError::ClientAbort, true)
        } else {
            (TermError::ClientTimeout, true)
        };
        bump_abort_counters(sess, ctx, client);
        sess.note_term(term);
        sess.set_term_stage(ctx.proxies);
    }
}

/// Phase G splice decision for one direction. The data path itself
/// lives with the socket I/O; this only decides engagement.
fn maybe_engage_splicing(sess: &mut Session, ctx: &FsmCtx<'_, '_>, producer: Side) {
    let buf = match producer {
        Side::Client => &mut sess.req,
        Side::Server => &mut sess.rep,
    };
    if buf.flags.intersects(BufFlags::KERN_SPLICING | BufFlags::SHUTR) || buf.to_forward() == 0 {
        return;
    }
    if !ctx.rt.splice_available() {
        return;
    }
    if !(sess.si[0].flags & sess.si[1].flags).contains(SiFlags::CAP_SPLICE) {
        return;
    }
    let opts = ctx.proxies.proxy(sess.fe).options | ctx.proxies.proxy(sess.be).options;
    let wanted = match producer {
        Side::Client => opts.contains(ProxyOptions::SPLICE_REQ),
        Side::Server => opts.contains(ProxyOptions::SPLICE_RSP),
    };
    let auto = opts.contains(ProxyOptions::SPLICE_AUTO) && buf.flags.contains(BufFlags::STREAMER_FAST);
    if wanted || auto {
        buf.flags.insert(BufFlags::KERN_SPLICING);
    }
}

/// CON: a connection was attempted and the descriptor exists. Checks
/// establishment, error and abort. Returns false on transition to CER.
fn update_st_con_tcp(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) -> bool {
    if sess.si[1].flags.intersects(SiFlags::EXP | SiFlags::ERR) {
        let had_err = sess.si[1].flags.contains(SiFlags::ERR);
        sess.si[1].exp = Ticks::ETERNITY;
        sess.si[1].state = SiState::Cer;
        sess.si[1].flags.remove(SiFlags::CAP_SPLICE);
        close_endpoint(&mut sess.si[1], ctx.registry);

        if sess.si[1].err_type != SiErr::None {
            return false;
        }
        sess.si[1].err_loc = sess.srv;
        sess.si[1].err_type = if had_err { SiErr::ConnErr } else { SiErr::ConnTo };
        return false;
    }

    // the upper layer may want to abort the attempt
    if sess.rep.flags.contains(BufFlags::SHUTW)
        || (sess.req.flags.contains(BufFlags::SHUTW_NOW)
            && (sess.req.flags & (BufFlags::OUT_EMPTY | BufFlags::WRITE_ACTIVITY)
                == BufFlags::OUT_EMPTY
                || ctx
                    .proxies
                    .proxy(sess.be)
                    .options
                    .contains(ProxyOptions::ABRT_CLOSE)))
    {
        let (si, ib, ob) = sess.si_bufs(Side::Server);
        si_shutw(si, ib, ob, ctx.registry);
        sess.si[1].record_err(SiErr::ConnAbrt);
        sess.si[1].err_loc = sess.srv;
        sess.si[1].flags.remove(SiFlags::CAP_SPLICE);
        sess.srv_error();
        return true;
    }

    // connect completion shows up as write-side activity
    if !sess.req.flags.intersects(BufFlags::WRITE_ACTIVITY) {
        return true;
    }

    sess.logs.t_connect = Some(ctx.now - sess.logs.accept);
    sess.si[1].exp = Ticks::ETERNITY;
    sess.si[1].state = SiState::Est;
    sess.si[1].err_type = SiErr::None;
    sess.si[1].err_loc = None;
    true
}

/// CER: the attempt failed and the descriptor is gone. Decides
/// between retry on the same server, redispatch, turn-around, or
/// giving up.
fn update_st_cer(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    release_server_port(sess, ctx);
    if let Some(sref) = sess.srv {
        if sess.flags.contains(SessFlags::CURR_SESS) {
            sess.flags.remove(SessFlags::CURR_SESS);
            let srv = ctx.proxies.server_mut(sref);
            srv.cur_sess = srv.cur_sess.saturating_sub(1);
        }
    }

    sess.conn_retries -= 1;
    if sess.conn_retries < 0 {
        if sess.si[1].err_type == SiErr::None {
            sess.si[1].err_type = SiErr::ConnErr;
            sess.si[1].err_loc = sess.srv;
        }
        if let Some(sref) = sess.srv {
            ctx.proxies.server_mut(sref).counters.failed_conns += 1;
        }
        ctx.proxies.proxy_mut(sess.be).counters.failed_conns += 1;
        backend::change_server(sess, ctx.proxies, None);
        if let Some(sref) = sess.srv {
            if queue::may_dequeue(ctx.proxies, sref) {
                ctx.rt.pending_dequeues.push(sref);
            }
        }

        let (si, ib, ob) = sess.si_bufs(Side::Server);
        si_shutw(si, ib, ob, ctx.registry);
        sess.req.flags.insert(BufFlags::WRITE_ERROR);
        sess.rep.flags.insert(BufFlags::READ_ERROR);
        sess.si[1].state = SiState::Clo;
        sess.srv_error();
        return;
    }

    // last retry may be redispatched to another server
    if sess.srv.is_some()
        && sess.conn_retries == 0
        && ctx
            .proxies
            .proxy(sess.be)
            .options
            .contains(ProxyOptions::REDISPATCH)
        && !sess.flags.contains(SessFlags::FORCE_PRST)
    {
        let sref = sess.srv;
        backend::change_server(sess, ctx.proxies, None);
        if let Some(sref) = sref {
            if queue::may_dequeue(ctx.proxies, sref) {
                ctx.rt.pending_dequeues.push(sref);
            }
        }
        sess.flags
            .remove(SessFlags::DIRECT | SessFlags::ASSIGNED | SessFlags::ADDR_SET);
        sess.prev_srv = sess.srv.take();
        sess.si[1].state = SiState::Req;
    } else {
        if let Some(sref) = sess.srv {
            ctx.proxies.server_mut(sref).counters.retries += 1;
        }
        ctx.proxies.proxy_mut(sess.be).counters.retries += 1;
        sess.si[1].state = SiState::Ass;
    }

    if sess.si[1].flags.contains(SiFlags::ERR) {
        // asynchronous error: connecting again immediately would most
        // likely fail the same way, wait a moment first
        sess.si[1].record_err(SiErr::ConnErr);
        sess.si[1].state = SiState::Tar;
        sess.si[1].exp = ctx.now + TURNAROUND;
    }
}

/// CON→EST transition side effects: response analysers attach, the
/// producer is live, the request write deadline resets.
fn establish(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    let fe_ana = ctx.proxies.proxy(sess.fe).fe_rsp_ana;
    let be_ana = ctx.proxies.proxy(sess.be).be_rsp_ana;
    sess.rep.analysers |= fe_ana | be_ana;
    sess.rep.flags.insert(BufFlags::READ_ATTACHED);
    sess.req.wex = Ticks::ETERNITY;
    debug!(sess = %sess.slot, srv = ?sess.srv.map(|s| s.idx), "server connection established");
}

/// ASS/QUE/TAR stage driver.
fn update_stream_int(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    match sess.si[1].state {
        SiState::Ass => {
            // server picked; issue the connect
            match connect_server(sess, ctx) {
                ConnAttempt::Issued => {
                    if let Some(sref) = sess.srv {
                        let srv = ctx.proxies.server_mut(sref);
                        srv.cur_sess += 1;
                        srv.counters.cum_sess += 1;
                        sess.flags.insert(SessFlags::CURR_SESS);
                    }
                }
                ConnAttempt::Fatal => {
                    sess.si[1].record_err(SiErr::ConnOther);
                    sess.si[1].err_loc = sess.srv;
                    if let Some(sref) = sess.srv {
                        ctx.proxies.server_mut(sref).counters.failed_conns += 1;
                    }
                    ctx.proxies.proxy_mut(sess.be).counters.failed_conns += 1;
                    backend::change_server(sess, ctx.proxies, None);
                    {
                        let (si, ib, ob) = sess.si_bufs(Side::Server);
                        si_shutr(si, ib, ob, ctx.registry);
                    }
                    {
                        let (si, ib, ob) = sess.si_bufs(Side::Server);
                        si_shutw(si, ib, ob, ctx.registry);
                    }
                    sess.req.flags.insert(BufFlags::WRITE_ERROR);
                    sess.logs.t_queue = Some(ctx.now - sess.logs.accept);
                    sess.si[1].state = SiState::Clo;
                    sess.srv_error();
                }
                ConnAttempt::Retryable => {
                    // source port conflicts and synchronous refusals:
                    // no turn-around, retry through the usual path
                    sess.si[1].state = SiState::Cer;
                    sess.si[1].flags.remove(SiFlags::ERR);
                    update_st_cer(sess, ctx);
                }
            }
        }
        SiState::Que => {
            if sess.pend_pos.is_none() {
                // promoted out of the queue (or never really parked)
                sess.si[1].exp = Ticks::ETERNITY;
                if sess.flags.contains(SessFlags::ASSIGNED) {
                    sess.logs.t_queue = Some(ctx.now - sess.logs.accept);
                    sess.si[1].state = SiState::Ass;
                } else {
                    sess.si[1].state = SiState::Req;
                }
                return;
            }

            if sess.si[1].flags.contains(SiFlags::EXP) {
                // queue timeout
                if let Some(pos) = sess.pend_pos.take() {
                    queue::unlink(ctx.proxies, sess.slot, pos);
                }
                sess.si[1].exp = Ticks::ETERNITY;
                sess.logs.t_queue = Some(ctx.now - sess.logs.accept);
                if let Some(sref) = sess.srv {
                    ctx.proxies.server_mut(sref).counters.failed_conns += 1;
                }
                ctx.proxies.proxy_mut(sess.be).counters.failed_conns += 1;
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutr(si, ib, ob, ctx.registry);
                }
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutw(si, ib, ob, ctx.registry);
                }
                sess.req.flags.insert(BufFlags::WRITE_TIMEOUT);
                sess.si[1].record_err(SiErr::QueueTo);
                sess.si[1].state = SiState::Clo;
                sess.srv_error();
                return;
            }

            if queue_abort_wanted(sess, ctx) {
                if let Some(pos) = sess.pend_pos.take() {
                    queue::unlink(ctx.proxies, sess.slot, pos);
                }
                sess.si[1].exp = Ticks::ETERNITY;
                sess.logs.t_queue = Some(ctx.now - sess.logs.accept);
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutr(si, ib, ob, ctx.registry);
                }
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutw(si, ib, ob, ctx.registry);
                }
                sess.si[1].record_err(SiErr::QueueAbrt);
                sess.si[1].state = SiState::Clo;
                sess.srv_error();
            }
        }
        SiState::Tar => {
            if queue_abort_wanted(sess, ctx) {
                sess.si[1].exp = Ticks::ETERNITY;
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutr(si, ib, ob, ctx.registry);
                }
                {
                    let (si, ib, ob) = sess.si_bufs(Side::Server);
                    si_shutw(si, ib, ob, ctx.registry);
                }
                sess.si[1].record_err(SiErr::ConnAbrt);
                sess.si[1].state = SiState::Clo;
                sess.srv_error();
                return;
            }
            if !sess.si[1].flags.contains(SiFlags::EXP) {
                return; // still in turn-around
            }
            sess.si[1].flags.remove(SiFlags::EXP);
            sess.si[1].exp = Ticks::ETERNITY;
            sess.si[1].state = if sess.flags.contains(SessFlags::ASSIGNED) {
                SiState::Ass
            } else {
                SiState::Req
            };
        }
        _ => {}
    }
}

/// The client gave up on a queued/parked connection request.
fn queue_abort_wanted(sess: &Session, ctx: &FsmCtx<'_, '_>) -> bool {
    sess.req.flags.contains(BufFlags::READ_ERROR)
        || (sess.req.flags.contains(BufFlags::SHUTW_NOW)
            && (sess.req.flags.contains(BufFlags::OUT_EMPTY)
                || ctx
                    .proxies
                    .proxy(sess.be)
                    .options
                    .contains(ProxyOptions::ABRT_CLOSE)))
}

/// REQ: ask the backend selector for a server or a queue slot.
fn prepare_conn_req(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    debug_assert_eq!(sess.si[1].state, SiState::Req);

    match backend::assign_server_and_queue(sess, ctx.proxies) {
        Assign::Assigned => {
            // a redispatched session landing on a new server counts
            if let (Some(prev), Some(cur)) = (sess.prev_srv, sess.srv) {
                if prev != cur && sess.conn_retries == 0 {
                    sess.flags.insert(SessFlags::REDISP);
                    ctx.proxies.proxy_mut(sess.be).counters.redispatches += 1;
                    ctx.proxies.server_mut(cur).counters.redispatches += 1;
                }
            }
            sess.logs.t_queue = Some(ctx.now - sess.logs.accept);
            sess.si[1].state = SiState::Ass;
        }
        Assign::Queued => {
            let qto = ctx.proxies.proxy(sess.be).timeouts.queue_or_connect();
            sess.si[1].exp = ctx.now.add_ifset(qto);
            sess.si[1].state = SiState::Que;
        }
        Assign::NoServer | Assign::QueueFull => {
            ctx.proxies.proxy_mut(sess.be).counters.failed_conns += 1;
            {
                let (si, ib, ob) = sess.si_bufs(Side::Server);
                si_shutr(si, ib, ob, ctx.registry);
            }
            {
                let (si, ib, ob) = sess.si_bufs(Side::Server);
                si_shutw(si, ib, ob, ctx.registry);
            }
            sess.req.flags.insert(BufFlags::WRITE_ERROR);
            sess.si[1].record_err(SiErr::ConnOther);
            sess.si[1].state = SiState::Clo;
            sess.srv_error();
        }
    }
}

enum ConnAttempt {
    Issued,
    Retryable,
    Fatal,
}

/// Issues the non-blocking connect for the assigned server, binding
/// the source as configured. On success the interface enters CON and
/// waits for write readiness.
fn connect_server(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) -> ConnAttempt {
    let Some(sref) = sess.srv else { return ConnAttempt::Fatal };

    let (target, opts_nolinger) = {
        let be = ctx.proxies.proxy(sess.be);
        let srv = ctx.proxies.server(sref);
        let opts = StreamOpts {
            keepalive: be.options.contains(ProxyOptions::TCP_SRV_KA),
            nolinger: false,
            sndbuf: ctx.rt.tune.server_sndbuf,
            rcvbuf: ctx.rt.tune.server_rcvbuf,
        };
        let target = ConnectTarget {
            addr: srv.addr,
            source: srv.source,
            from_client: srv.bind_frontend.then_some(sess.frt_addr),
            interface: srv.interface.clone(),
            opts,
        };
        (target, be.options.contains(ProxyOptions::TCP_NOLINGER))
    };

    let range = ctx.proxies.server_mut(sref).port_range.as_mut();
    match relay_net::connect_server(&target, range) {
        Ok((stream, local_port)) => {
            let token = crate::engine::server_token(sess.slot);
            let mut ep = SockEp::new(stream, token);
            ep.local_port = local_port;
            ep.set_interest(ctx.registry, Some(Interest::WRITABLE));
            sess.si[1].endpoint = Endpoint::Sock(ep);
            if opts_nolinger {
                sess.si[1].flags.insert(SiFlags::NOLINGER);
            }
            #[cfg(target_os = "linux")]
            sess.si[1].flags.insert(SiFlags::CAP_SPLICE);
            sess.si[1].state = SiState::Con;
            let cto = ctx.proxies.proxy(sess.be).timeouts.connect;
            sess.si[1].exp = ctx.now.add_ifset(cto);
            trace!(sess = %sess.slot, srv = %ctx.proxies.server(sref).name, "connect issued");
            ConnAttempt::Issued
        }
        Err(ConnectError::Internal(err)) | Err(ConnectError::SourceBind(err)) => {
            debug!(sess = %sess.slot, %err, "connect failed fatally");
            ConnAttempt::Fatal
        }
        Err(err) => {
            debug!(sess = %sess.slot, %err, "connect failed, retryable");
            match err {
                ConnectError::TimedOut => sess.si[1].record_err(SiErr::ConnTo),
                ConnectError::Refused | ConnectError::Unreachable => {
                    sess.si[1].record_err(SiErr::ConnErr);
                }
                _ => {}
            }
            ConnAttempt::Retryable
        }
    }
}

/// Returns a range-allocated source port freed by an endpoint close.
fn release_server_port(sess: &mut Session, ctx: &mut FsmCtx<'_, '_>) {
    if let Some(port) = sess.si[1].released_port.take() {
        if let Some(sref) = sess.srv.or(sess.prev_srv) {
            if let Some(range) = ctx.proxies.server_mut(sref).port_range.as_mut() {
                range.release(port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{
        Listener, ListenerCounters, ListenerId, ListenerState, Proxy, ProxyCaps, ProxyId,
        ProxyMode, Server,
    };
    use crate::runtime::Tune;
    use crate::session::tests::test_session;

    struct Rig {
        proxies: ProxySet,
        rt: Runtime,
        poll: mio::Poll,
    }

    impl Rig {
        fn new(nservers: usize) -> Self {
            let mut proxies = ProxySet::default();
            let mut px =
                Proxy::new(ProxyId(0), "px", ProxyMode::Tcp, ProxyCaps::FE | ProxyCaps::BE);
            px.timeouts.connect = Duration::from_millis(1_000);
            for i in 0..nservers {
                px.servers.push(Server::new(
                    format!("s{i}"),
                    // reserved TEST-NET-1 addresses: never connectable
                    format!("192.0.2.{}:9", i + 1).parse().unwrap(),
                ));
            }
            proxies.listeners.push(Listener {
                id: ListenerId(0),
                fe: ProxyId(0),
                addr: "127.0.0.1:0".parse().unwrap(),
                state: ListenerState::Ready,
                maxconn: 100,
                nbconn: 1,
                opts: relay_net::ListenerOpts::default(),
                analysers: AnMask::empty(),
                counters: ListenerCounters::default(),
            });
            proxies.proxies.push(px);
            Self {
                proxies,
                rt: Runtime::new(100, Tune::default()),
                poll: mio::Poll::new().expect("poll"),
            }
        }

        fn ctx(&mut self, now: Ticks, wake: WakeReasons) -> FsmCtx<'_, '_> {
            FsmCtx {
                proxies: &mut self.proxies,
                rt: &mut self.rt,
                registry: self.poll.registry(),
                http: None,
                now,
                wake,
            }
        }
    }

    /// A pure TCP session with both sides established and no
    /// analysers must freewheel: infinite forward on both buffers.
    #[test]
    fn idle_established_session_forwards_infinitely() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.si[1].state = SiState::Est;
        sess.si[1].prev_state = SiState::Est;

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::INIT);
        let disp = process_session(&mut sess, &mut ctx);
        assert!(matches!(disp, Disposition::Run { .. }));
        assert_eq!(sess.req.to_forward(), FORWARD_INFINITE);
        assert_eq!(sess.rep.to_forward(), FORWARD_INFINITE);
        assert!(sess.req.flags.contains(BufFlags::AUTO_CLOSE));
        assert!(sess.rep.flags.contains(BufFlags::AUTO_CLOSE));
    }

    /// Shutdown propagation is idempotent: running the FSM twice in a
    /// row without new events leaves the same state.
    #[test]
    fn shutdown_propagation_is_idempotent() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.si[1].state = SiState::Est;
        sess.si[1].prev_state = SiState::Est;
        // client half-closed its side
        sess.req.flags.insert(BufFlags::SHUTR);

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::INIT);
        let _ = process_session(&mut sess, &mut ctx);
        let req_flags = sess.req.flags;
        let rep_flags = sess.rep.flags;
        let states = (sess.si[0].state, sess.si[1].state);

        let mut ctx = rig.ctx(Ticks(11), WakeReasons::OTHER);
        let _ = process_session(&mut sess, &mut ctx);
        assert_eq!(sess.req.flags, req_flags);
        assert_eq!(sess.rep.flags, rep_flags);
        assert_eq!((sess.si[0].state, sess.si[1].state), states);
    }

    /// A client read timeout in the data phase classifies as cD.
    #[test]
    fn client_timeout_classifies_cd() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.si[1].state = SiState::Est;
        sess.si[1].prev_state = SiState::Est;
        sess.req.rex = Ticks(50);

        let mut ctx = rig.ctx(Ticks(100), WakeReasons::TIMER);
        let _ = process_session(&mut sess, &mut ctx);
        assert_eq!(sess.term_code(), ['c', 'D']);
    }

    /// With SHUTW already done and no analysers, an abort from the
    /// client takes the whole session down and the engine is told to
    /// close it.
    #[test]
    fn full_close_ends_session() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.si[1].state = SiState::Est;
        sess.si[1].prev_state = SiState::Est;
        sess.req.flags.insert(BufFlags::SHUTR);
        sess.rep.flags.insert(BufFlags::SHUTR);

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::OTHER);
        let disp = process_session(&mut sess, &mut ctx);
        assert_eq!(disp, Disposition::Close);
    }

    /// INI + request shutdown = abort before any connection exists.
    #[test]
    fn shut_request_aborts_ini_server_side() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.req.flags.insert(BufFlags::SHUTW);

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::OTHER);
        let disp = process_session(&mut sess, &mut ctx);
        assert_eq!(disp, Disposition::Close);
        assert_eq!(sess.si[1].state, SiState::Clo);
    }

    /// Retries decrement and eventually close with a connect error;
    /// redispatch clears the server on the last retry.
    #[test]
    fn cer_consumes_retries_then_gives_up() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.srv = Some(crate::proxy::ServerRef { px: ProxyId(0), idx: 0 });
        sess.flags.insert(SessFlags::ASSIGNED | SessFlags::BE_ASSIGNED);
        sess.conn_retries = 0;
        sess.si[1].state = SiState::Cer;

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::OTHER);
        update_st_cer(&mut sess, &mut ctx);
        assert_eq!(sess.si[1].state, SiState::Clo);
        assert_eq!(rig.proxies.proxy(ProxyId(0)).counters.failed_conns, 1);
        assert_eq!(sess.term_code(), ['S', 'C']);
    }

    #[test]
    fn cer_redispatch_clears_assignment() {
        let mut rig = Rig::new(2);
        rig.proxies.proxy_mut(ProxyId(0)).options.insert(ProxyOptions::REDISPATCH);
        let mut sess = test_session();
        let first = crate::proxy::ServerRef { px: ProxyId(0), idx: 0 };
        sess.srv = Some(first);
        sess.flags.insert(SessFlags::ASSIGNED | SessFlags::BE_ASSIGNED | SessFlags::DIRECT);
        sess.conn_retries = 1;
        sess.si[1].state = SiState::Cer;

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::OTHER);
        update_st_cer(&mut sess, &mut ctx);
        assert_eq!(sess.conn_retries, 0);
        assert_eq!(sess.si[1].state, SiState::Req);
        assert_eq!(sess.srv, None);
        assert_eq!(sess.prev_srv, Some(first));
        assert!(!sess.flags.contains(SessFlags::ASSIGNED));
        assert!(!sess.flags.contains(SessFlags::DIRECT));
    }

    #[test]
    fn cer_async_error_takes_turnaround() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.srv = Some(crate::proxy::ServerRef { px: ProxyId(0), idx: 0 });
        sess.flags.insert(SessFlags::ASSIGNED | SessFlags::BE_ASSIGNED);
        sess.conn_retries = 2;
        sess.si[1].state = SiState::Cer;
        sess.si[1].flags.insert(SiFlags::ERR);

        let mut ctx = rig.ctx(Ticks(10), WakeReasons::OTHER);
        update_st_cer(&mut sess, &mut ctx);
        assert_eq!(sess.si[1].state, SiState::Tar);
        assert_eq!(sess.si[1].exp, Ticks(10) + TURNAROUND);
        assert_eq!(rig.proxies.proxy(ProxyId(0)).counters.retries, 1);
    }

    /// Queue expiry closes with sQ and counts a failed connection.
    #[test]
    fn queue_timeout_closes_with_sq() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        let sref = crate::proxy::ServerRef { px: ProxyId(0), idx: 0 };
        sess.srv = Some(sref);
        sess.flags.insert(SessFlags::ASSIGNED | SessFlags::BE_ASSIGNED);
        sess.si[1].state = SiState::Que;
        sess.si[1].flags.insert(SiFlags::EXP);
        sess.pend_pos =
            Some(queue::enqueue(&mut rig.proxies, sess.slot, ProxyId(0), Some(sref)));

        let mut ctx = rig.ctx(Ticks(300), WakeReasons::TIMER);
        update_stream_int(&mut sess, &mut ctx);
        assert_eq!(sess.si[1].state, SiState::Clo);
        assert_eq!(sess.term_code(), ['s', 'Q']);
        assert_eq!(rig.proxies.proxy(ProxyId(0)).counters.failed_conns, 1);
        assert!(rig.proxies.server(sref).queue.is_empty());
    }

    /// A dequeued session (pend_pos cleared by a promotion) resumes
    /// towards ASS when it kept its assignment.
    #[test]
    fn dequeue_resumes_assignment() {
        let mut rig = Rig::new(1);
        let mut sess = test_session();
        sess.srv = Some(crate::proxy::ServerRef { px: ProxyId(0), idx: 0 });
        sess.flags.insert(SessFlags::ASSIGNED | SessFlags::BE_ASSIGNED);
        sess.si[1].state = SiState::Que;
        sess.pend_pos = None;

        let mut ctx = rig.ctx(Ticks(50), WakeReasons::OTHER);
        update_stream_int(&mut sess, &mut ctx);
        assert_eq!(sess.si[1].state, SiState::Ass);
        assert_eq!(sess.logs.t_queue, Some(Duration::from_millis(50)));
    }
}
