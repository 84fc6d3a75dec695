use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bitflags::bitflags;
use relay_timing::Ticks;
use tracing::{debug, trace};

use crate::acl::{self, AclResult, Polarity};
use crate::buffer::BufFlags;
use crate::proxy::{PersistKind, ProxyId, ProxyOptions, ProxySet, ServerRef, TcpAction};
use crate::session::{FinishStage, SessFlags, Session, StoreSlot, TermError};

bitflags! {
    /// Analyser bits. Bit position IS the processing order: the chain
    /// always runs the lowest pending bit, so adding a stage is a
    /// single entry here, in its slot.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AnMask: u32 {
        // request side
        const REQ_DECODE_PROXY   = 1 << 0;
        const REQ_INSPECT        = 1 << 1;
        const REQ_WAIT_HTTP      = 1 << 2;
        const REQ_HTTP_FE        = 1 << 3;
        const REQ_SWITCHING      = 1 << 4;
        const REQ_HTTP_BE        = 1 << 5;
        const REQ_TARPIT         = 1 << 6;
        const REQ_HTTP_INNER     = 1 << 7;
        const REQ_HTTP_BODY      = 1 << 8;
        const REQ_PRST_RDP       = 1 << 9;
        const REQ_STICKING       = 1 << 10;
        const REQ_HTTP_XFER_BODY = 1 << 11;

        // response side
        const RES_WAIT_HTTP      = 1 << 16;
        const RES_STORE_RULES    = 1 << 17;
        const RES_HTTP_BE        = 1 << 18;
        const RES_HTTP_XFER_BODY = 1 << 19;

        const HTTP_BITS = Self::REQ_WAIT_HTTP.bits() | Self::REQ_HTTP_FE.bits()
                        | Self::REQ_HTTP_BE.bits() | Self::REQ_TARPIT.bits()
                        | Self::REQ_HTTP_INNER.bits() | Self::REQ_HTTP_BODY.bits()
                        | Self::REQ_HTTP_XFER_BODY.bits() | Self::RES_WAIT_HTTP.bits()
                        | Self::RES_HTTP_BE.bits() | Self::RES_HTTP_XFER_BODY.bits();
    }
}

impl AnMask {
    /// The lowest pending bit, i.e. the next stage to run.
    #[inline]
    pub fn lowest(self) -> AnMask {
        AnMask::from_bits_retain(self.bits() & self.bits().wrapping_neg())
    }
}

/// Contract for a pluggable HTTP message parser. The engine only
/// grants `HTTP_BITS` to sessions when hooks are installed; each call
/// follows the analyser rules (return false to stop the pass, clear
/// your bit when done).
pub trait HttpHooks: std::fmt::Debug {
    fn run(&mut self, bit: AnMask, sess: &mut Session, now: Ticks) -> bool;
}

/// Generic chain walker. `step` runs the given (single-bit) stage and
/// returns the buffer's new mask, or `None` when the stage asked to
/// stop the pass. A stage that re-enables an earlier stage sends the
/// walk straight back to it; later stages join the pending set. The
/// loop bound guarantees termination against pathological re-enabling.
fn chain_loop(initial: u32, max_loops: u32, mut step: impl FnMut(u32) -> Option<u32>) {
    let mut ana_list = initial;
    let mut ana_back = initial;
    let mut loops = max_loops;
    while ana_list != 0 && loops > 0 {
        loops -= 1;
        let bit = ana_list & ana_list.wrapping_neg();
        let Some(real) = step(bit) else { return };
        ana_list = ((ana_list & !bit) | !ana_back) & real;
        ana_back = real;
    }
}

pub struct AnaCtx<'a, 'h> {
    pub proxies: &'a mut ProxySet,
    pub http: Option<&'h mut (dyn HttpHooks + 'static)>,
    pub now: Ticks,
    pub max_loops: u32,
}

/// Runs the request chain until it stalls or empties.
pub fn run_request_chain(sess: &mut Session, ctx: &mut AnaCtx<'_, '_>) {
    let initial = sess.req.analysers.bits();
    chain_loop(initial, ctx.max_loops, |bit| {
        let bit = AnMask::from_bits_retain(bit);
        trace!(sess = %sess.slot, ?bit, "request analyser");
        let keep_going = run_one_request(bit, sess, ctx);
        if keep_going {
            Some(sess.req.analysers.bits())
        } else {
            None
        }
    });
}

/// Runs the response chain until it stalls or empties.
pub fn run_response_chain(sess: &mut Session, ctx: &mut AnaCtx<'_, '_>) {
    let initial = sess.rep.analysers.bits();
    chain_loop(initial, ctx.max_loops, |bit| {
        let bit = AnMask::from_bits_retain(bit);
        trace!(sess = %sess.slot, ?bit, "response analyser");
        let keep_going = run_one_response(bit, sess, ctx);
        if keep_going {
            Some(sess.rep.analysers.bits())
        } else {
            None
        }
    });
}

fn run_one_request(bit: AnMask, sess: &mut Session, ctx: &mut AnaCtx<'_, '_>) -> bool {
    if bit == AnMask::REQ_DECODE_PROXY {
        decode_proxy_line(sess, ctx.proxies, bit)
    } else if bit == AnMask::REQ_INSPECT {
        tcp_inspect(sess, ctx.proxies, ctx.now, bit)
    } else if bit == AnMask::REQ_SWITCHING {
        switching_rules(sess, ctx.proxies, bit)
    } else if bit == AnMask::REQ_PRST_RDP {
        rdp_cookie_persist(sess, ctx.proxies, bit)
    } else if bit == AnMask::REQ_STICKING {
        sticking_rules(sess, ctx.proxies, ctx.now, bit)
    } else if bit.intersects(AnMask::HTTP_BITS) {
        match ctx.http.as_deref_mut() {
            Some(hooks) => hooks.run(bit, sess, ctx.now),
            None => {
                sess.req.analysers.remove(bit);
                true
            }
        }
    } else {
        // unknown bit: drop it rather than spin
        sess.req.analysers.remove(bit);
        true
    }
}

fn run_one_response(bit: AnMask, sess: &mut Session, ctx: &mut AnaCtx<'_, '_>) -> bool {
    if bit == AnMask::RES_STORE_RULES {
        store_rules(sess, ctx.proxies, ctx.now, bit)
    } else if bit.intersects(AnMask::HTTP_BITS) {
        match ctx.http.as_deref_mut() {
            Some(hooks) => hooks.run(bit, sess, ctx.now),
            None => {
                sess.rep.analysers.remove(bit);
                true
            }
        }
    } else {
        sess.rep.analysers.remove(bit);
        true
    }
}

/// Longest legal PROXY v1 line (TCP6 with maximal addresses).
const PROXY_LINE_MAX: usize = 107;

/// Consumes the mandatory `PROXY TCP4|TCP6 src dst sport dport\r\n`
/// preamble: rewrites the session's addresses, strips the line, and
/// discounts it from the byte totals. Anything malformed aborts the
/// session with a proxy-condition error.
fn decode_proxy_line(sess: &mut Session, proxies: &mut ProxySet, bit: AnMask) -> bool {
    enum Outcome {
        Done { cli: SocketAddr, frt: SocketAddr, strip: usize },
        Missing,
        Fail,
    }

    if sess.req.flags.intersects(BufFlags::READ_ERROR | BufFlags::READ_TIMEOUT) {
        return fail_proxy_line(sess, proxies);
    }

    let outcome = {
        let data = sess.req.data_contig();
        let probe = data.len().min(6);
        if probe == 0 || data[..probe] != b"PROXY "[..probe] {
            if probe < 6 {
                Outcome::Missing
            } else {
                Outcome::Fail
            }
        } else {
            match find_crlf(data) {
                None if data.len() < PROXY_LINE_MAX => Outcome::Missing,
                None => Outcome::Fail,
                Some(eol) => match parse_proxy_line(&data[6..eol]) {
                    Some((cli, frt)) => Outcome::Done { cli, frt, strip: eol + 2 },
                    None => Outcome::Fail,
                },
            }
        }
    };

    match outcome {
        Outcome::Done { cli, frt, strip } => {
            sess.cli_addr = cli;
            sess.frt_addr = frt;
            sess.flags.insert(SessFlags::FRT_ADDR_SET);
            sess.req.replace(0, strip, b"");
            sess.req.discount_total(strip as u64);
            sess.req.analysers.remove(bit);
            debug!(sess = %sess.slot, %cli, %frt, "proxy preamble decoded");
            true
        }
        Outcome::Missing => {
            if !sess.req.flags.intersects(BufFlags::SHUTR | BufFlags::FULL) {
                sess.req.dont_connect();
                return false;
            }
            fail_proxy_line(sess, proxies)
        }
        Outcome::Fail => fail_proxy_line(sess, proxies),
    }
}

fn fail_proxy_line(sess: &mut Session, proxies: &mut ProxySet) -> bool {
    sess.req.abort();
    sess.rep.abort();
    sess.req.analysers = AnMask::empty();
    proxies.proxy_mut(sess.fe).counters.failed_req += 1;
    proxies.listener_mut(sess.listener).counters.failed_req += 1;
    sess.note_term(TermError::ProxyCond);
    sess.note_finst(FinishStage::Request);
    false
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Parses the fields after `"PROXY "`, CRLF excluded. Exactly one
/// space between fields, decimal ports within range.
fn parse_proxy_line(fields: &[u8]) -> Option<(SocketAddr, SocketAddr)> {
    let text = std::str::from_utf8(fields).ok()?;
    let mut it = text.split(' ');
    let proto = it.next()?;
    let src = it.next()?;
    let dst = it.next()?;
    let sport: u16 = it.next()?.parse().ok()?;
    let dport: u16 = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    let (src, dst): (IpAddr, IpAddr) = match proto {
        "TCP4" => (src.parse::<Ipv4Addr>().ok()?.into(), dst.parse::<Ipv4Addr>().ok()?.into()),
        "TCP6" => (src.parse::<Ipv6Addr>().ok()?.into(), dst.parse::<Ipv6Addr>().ok()?.into()),
        _ => return None,
    };
    Some((SocketAddr::new(src, sport), SocketAddr::new(dst, dport)))
}

/// `tcp-request content` evaluation with the inspect-delay window.
fn tcp_inspect(sess: &mut Session, proxies: &mut ProxySet, now: Ticks, bit: AnMask) -> bool {
    enum Verdict {
        Wait,
        Reject,
        Accept,
    }

    let delay = proxies.proxy(sess.fe).inspect_delay;
    let partial = !sess.req.flags.intersects(BufFlags::SHUTR | BufFlags::FULL)
        && delay.is_set()
        && !sess.req.analyse_exp.expired(now);

    let verdict = {
        let fe = proxies.proxy(sess.fe);
        let sctx = sess.sample_ctx(proxies, partial);
        let mut verdict = Verdict::Accept;
        for rule in &fe.tcp_req_rules {
            let matched = match &rule.cond {
                None => true,
                Some(cond) => {
                    let res = acl::eval_cond(cond, &fe.acl, &sctx);
                    if res == AclResult::Miss {
                        verdict = Verdict::Wait;
                        break;
                    }
                    let mut hit = res.to_bool();
                    if cond.pol == Polarity::Unless {
                        hit = !hit;
                    }
                    hit
                }
            };
            if matched {
                verdict = match rule.action {
                    TcpAction::Reject => Verdict::Reject,
                    TcpAction::Accept => Verdict::Accept,
                };
                break;
            }
        }
        verdict
    };

    match verdict {
        Verdict::Wait => {
            sess.req.dont_connect();
            if !sess.req.analyse_exp.is_set() && delay.is_set() {
                sess.req.analyse_exp = now.add_ifset(delay);
            }
            false
        }
        Verdict::Reject => {
            sess.req.abort();
            sess.rep.abort();
            sess.req.analysers = AnMask::empty();
            proxies.proxy_mut(sess.fe).counters.denied_req += 1;
            proxies.listener_mut(sess.listener).counters.denied_req += 1;
            sess.note_term(TermError::ProxyCond);
            sess.note_finst(FinishStage::Request);
            debug!(sess = %sess.slot, src = %sess.cli_addr, "content rule rejected session");
            false
        }
        Verdict::Accept => {
            sess.req.analysers.remove(bit);
            sess.req.analyse_exp = Ticks::ETERNITY;
            true
        }
    }
}

/// Applies switching rules, falls back to the default backend, then
/// evaluates the target's forced/ignored persistence rules.
fn switching_rules(sess: &mut Session, proxies: &mut ProxySet, bit: AnMask) -> bool {
    sess.req.analysers.remove(bit);
    sess.req.analyse_exp = Ticks::ETERNITY;

    if !sess.flags.contains(SessFlags::BE_ASSIGNED) {
        let target = {
            let fe = proxies.proxy(sess.fe);
            let sctx = sess.sample_ctx(proxies, false);
            let mut target = None;
            for rule in &fe.switching_rules {
                let mut hit = acl::eval_cond(&rule.cond, &fe.acl, &sctx).to_bool();
                if rule.cond.pol == Polarity::Unless {
                    hit = !hit;
                }
                if hit {
                    target = Some(rule.target);
                    break;
                }
            }
            target
        };
        let target =
            target.or(proxies.proxy(sess.fe).default_backend).unwrap_or(sess.be);
        set_backend(sess, proxies, target);
    }

    if sess.fe == sess.be {
        sess.req.analysers.remove(AnMask::REQ_HTTP_BE);
    }

    let persist = {
        let be = proxies.proxy(sess.be);
        let sctx = sess.sample_ctx(proxies, false);
        let mut persist = None;
        for rule in &be.persist_rules {
            let hit = match &rule.cond {
                None => true,
                Some(cond) => {
                    let mut h = acl::eval_cond(cond, &be.acl, &sctx).to_bool();
                    if cond.pol == Polarity::Unless {
                        h = !h;
                    }
                    h
                }
            };
            if hit {
                persist = Some(rule.kind);
                break;
            }
        }
        persist
    };
    match persist {
        Some(PersistKind::Force) => sess.flags.insert(SessFlags::FORCE_PRST),
        Some(PersistKind::Ignore) => sess.flags.insert(SessFlags::IGNORE_PRST),
        None => {}
    }
    true
}

/// Binds the session to its backend: counters, timeouts, retry
/// budget, and the backend's own request analysers.
pub fn set_backend(sess: &mut Session, proxies: &mut ProxySet, target: ProxyId) {
    sess.be = target;
    sess.flags.insert(SessFlags::BE_ASSIGNED);
    let be = proxies.proxy_mut(target);
    be.beconn += 1;
    be.counters.cum_sess += 1;
    sess.conn_retries = be.retries as i32;
    sess.req.wto = be.timeouts.server;
    sess.req.cto = be.timeouts.connect;
    sess.rep.rto = be.timeouts.server;
    sess.req.analysers |= be.be_req_ana;
}

/// RDP cookie persistence: extract `A.B.C.D.port` and impose the
/// matching server when it is usable.
fn rdp_cookie_persist(sess: &mut Session, proxies: &mut ProxySet, bit: AnMask) -> bool {
    let done = |sess: &mut Session| {
        sess.req.analysers.remove(bit);
        sess.req.analyse_exp = Ticks::ETERNITY;
        true
    };

    if sess.flags.contains(SessFlags::ASSIGNED) {
        return done(sess);
    }

    let target = {
        let be = proxies.proxy(sess.be);
        let name = be.rdp_cookie_name.as_deref();
        let sctx = sess.sample_ctx(proxies, false);
        let fetched = acl::Keyword::ReqRdpCookie.fetch(name, &sctx);
        let Some(value) = fetched.value else { return done(sess) };
        let Some(bytes) = value.as_bytes() else { return done(sess) };
        let Some(addr) = parse_rdp_target(bytes) else { return done(sess) };

        let persist = be.options.contains(ProxyOptions::PERSIST);
        be.servers
            .iter()
            .position(|s| s.addr == addr && (s.up || persist))
            .map(|idx| ServerRef { px: sess.be, idx: idx as u16 })
    };

    if let Some(sref) = target {
        sess.flags.insert(SessFlags::DIRECT | SessFlags::ASSIGNED);
        sess.srv = Some(sref);
        debug!(sess = %sess.slot, srv = %proxies.server(sref).name, "rdp cookie imposed server");
    }
    done(sess)
}

/// `A.B.C.D.port` in decimal.
fn parse_rdp_target(value: &[u8]) -> Option<SocketAddr> {
    let text = std::str::from_utf8(value).ok()?;
    let mut parts = text.split('.');
    let a: u8 = parts.next()?.parse().ok()?;
    let b: u8 = parts.next()?.parse().ok()?;
    let c: u8 = parts.next()?.parse().ok()?;
    let d: u8 = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
}

/// Request-side sticking rules: `match` consumes a sticky entry to
/// impose a server, `store` opens a slot that the response-side store
/// pass writes out.
fn sticking_rules(sess: &mut Session, proxies: &mut ProxySet, now: Ticks, bit: AnMask) -> bool {
    enum Action {
        Match,
        Store,
    }
    let mut actions: Vec<Action> = Vec::new();
    {
        let be = proxies.proxy(sess.be);
        let sctx = sess.sample_ctx(proxies, false);
        for rule in be.stick_rules.iter().filter(|r| !r.on_response) {
            // one pending slot per table
            if rule.is_store && sess.store.iter().any(|s| s.table_owner == sess.be) {
                continue;
            }
            let hit = match &rule.cond {
                None => true,
                Some(cond) => {
                    let mut h = acl::eval_cond(cond, &be.acl, &sctx).to_bool();
                    if cond.pol == Polarity::Unless {
                        h = !h;
                    }
                    h
                }
            };
            if !hit {
                continue;
            }
            if rule.is_match {
                actions.push(Action::Match);
            }
            if rule.is_store {
                actions.push(Action::Store);
            }
        }
    }

    let key = sess.cli_addr.ip();
    for action in actions {
        match action {
            Action::Match => {
                let hit = proxies
                    .proxy_mut(sess.be)
                    .stick_table
                    .as_mut()
                    .and_then(|t| t.lookup(&key, now));
                if let Some(sid) = hit {
                    if !sess.flags.contains(SessFlags::ASSIGNED) {
                        let be = proxies.proxy(sess.be);
                        let usable = be.servers.get(sid as usize).is_some_and(|s| {
                            s.up
                                || be.options.contains(ProxyOptions::PERSIST)
                                || sess.flags.contains(SessFlags::FORCE_PRST)
                        });
                        if usable {
                            sess.flags.insert(SessFlags::DIRECT | SessFlags::ASSIGNED);
                            sess.srv = Some(ServerRef { px: sess.be, idx: sid });
                        }
                    }
                }
            }
            Action::Store => sess.store.push(StoreSlot {
                table_owner: sess.be,
                key,
                sid: None,
                from_response: false,
            }),
        }
    }

    sess.req.analysers.remove(bit);
    sess.req.analyse_exp = Ticks::ETERNITY;
    true
}

/// Response-side store pass: fill response-rule slots, then flush
/// everything pending into the sticky tables.
fn store_rules(sess: &mut Session, proxies: &mut ProxySet, now: Ticks, bit: AnMask) -> bool {
    let want_store = {
        let be = proxies.proxy(sess.be);
        let sctx = sess.sample_ctx(proxies, false);
        be.stick_rules.iter().filter(|r| r.on_response).any(|rule| match &rule.cond {
            None => true,
            Some(cond) => {
                let mut h = acl::eval_cond(cond, &be.acl, &sctx).to_bool();
                if cond.pol == Polarity::Unless {
                    h = !h;
                }
                h
            }
        })
    };
    if want_store && !sess.store.iter().any(|s| s.table_owner == sess.be) {
        sess.store.push(StoreSlot {
            table_owner: sess.be,
            key: sess.cli_addr.ip(),
            sid: None,
            from_response: true,
        });
    }

    if let Some(sref) = sess.srv {
        for slot in sess.store.drain(..) {
            if let Some(table) = proxies.proxy_mut(slot.table_owner).stick_table.as_mut() {
                table.store(slot.key, slot.sid.unwrap_or(sref.idx), now);
            }
        }
    } else {
        sess.store.clear();
    }

    sess.rep.analysers.remove(bit);
    sess.rep.analyse_exp = Ticks::ETERNITY;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn lowest_bit_is_processing_order() {
        let m = AnMask::REQ_SWITCHING | AnMask::REQ_INSPECT | AnMask::REQ_STICKING;
        assert_eq!(m.lowest(), AnMask::REQ_INSPECT);
    }

    /// An analyser enabling a lower bit must be re-entered at that bit
    /// within the same pass; higher bits simply join the set.
    #[test]
    fn chain_reenters_at_lower_new_bits() {
        const A: u32 = 1 << 0;
        const B: u32 = 1 << 1;
        const C: u32 = 1 << 2;

        let mask = RefCell::new(B | C);
        let trace = RefCell::new(Vec::new());
        chain_loop(B | C, 50, |bit| {
            trace.borrow_mut().push(bit);
            let mut m = *mask.borrow();
            if bit == B {
                // B resurrects A, which had never been set
                m |= A;
            }
            m &= !bit;
            *mask.borrow_mut() = m;
            Some(m)
        });
        assert_eq!(*trace.borrow(), vec![B, A, C]);
    }

    #[test]
    fn chain_stops_when_a_stage_stalls() {
        const A: u32 = 1 << 0;
        const B: u32 = 1 << 1;
        let trace = RefCell::new(Vec::new());
        chain_loop(A | B, 50, |bit| {
            trace.borrow_mut().push(bit);
            if bit == A {
                return None;
            }
            Some(0)
        });
        assert_eq!(*trace.borrow(), vec![A]);
    }

    #[test]
    fn chain_is_bounded() {
        // a stage that keeps re-adding itself cannot loop forever
        let mut calls = 0;
        chain_loop(1, 8, |_bit| {
            calls += 1;
            Some(1)
        });
        assert!(calls <= 8);
    }

    #[test]
    fn proxy_line_parses_tcp4() {
        let (cli, frt) =
            parse_proxy_line(b"TCP4 192.0.2.1 198.51.100.2 35000 443").unwrap();
        assert_eq!(cli, "192.0.2.1:35000".parse().unwrap());
        assert_eq!(frt, "198.51.100.2:443".parse().unwrap());
    }

    #[test]
    fn proxy_line_parses_tcp6() {
        let (cli, frt) = parse_proxy_line(b"TCP6 2001:db8::1 2001:db8::2 35000 443").unwrap();
        assert_eq!(cli, "[2001:db8::1]:35000".parse().unwrap());
        assert_eq!(frt, "[2001:db8::2]:443".parse().unwrap());
    }

    #[test]
    fn proxy_line_rejects_malformed() {
        // double space
        assert!(parse_proxy_line(b"TCP4  192.0.2.1 198.51.100.2 1 2").is_none());
        // port out of range
        assert!(parse_proxy_line(b"TCP4 192.0.2.1 198.51.100.2 65536 443").is_none());
        // unknown protocol
        assert!(parse_proxy_line(b"UNIX 192.0.2.1 198.51.100.2 1 2").is_none());
        // trailing garbage
        assert!(parse_proxy_line(b"TCP4 192.0.2.1 198.51.100.2 1 2 x").is_none());
    }

    #[test]
    fn rdp_target_parses_dotted_quad_and_port() {
        assert_eq!(
            parse_rdp_target(b"10.0.0.1.3389"),
            Some("10.0.0.1:3389".parse().unwrap())
        );
        assert!(parse_rdp_target(b"10.0.0.1").is_none());
        assert!(parse_rdp_target(b"10.0.0.1.3389.9").is_none());
    }
}
