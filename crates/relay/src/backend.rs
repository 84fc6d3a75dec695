use tracing::debug;

use crate::proxy::{ProxySet, ServerRef};
use crate::queue;
use crate::session::{SessFlags, Session};

/// Outcome of one attempt to attach a session to a server.
#[derive(Debug, PartialEq, Eq)]
pub enum Assign {
    /// `sess.srv` is set and a connection slot is reserved.
    Assigned,
    /// Parked in a queue; `sess.pend_pos` is set.
    Queued,
    /// No server is eligible.
    NoServer,
    /// The target queue refused us.
    QueueFull,
}

/// Moves the session's reserved connection slot between servers,
/// maintaining `served`. Passing `None` releases the slot.
pub fn change_server(sess: &mut Session, proxies: &mut ProxySet, newsrv: Option<ServerRef>) {
    if sess.srv_conn == newsrv {
        return;
    }
    if let Some(old) = sess.srv_conn.take() {
        proxies.server_mut(old).served = proxies.server(old).served.saturating_sub(1);
    }
    if let Some(new) = newsrv {
        proxies.server_mut(new).served += 1;
        sess.srv_conn = Some(new);
    }
}

/// Picks a server for a session in the REQ state, honouring
/// persistence, or parks it in a queue. This is the `pick_server` /
/// `enqueue` seam the session FSM is written against; the balancing
/// algorithm behind `Proxy::pick_server` is interchangeable.
pub fn assign_server_and_queue(sess: &mut Session, proxies: &mut ProxySet) -> Assign {
    let be_id = sess.be;

    // persistence: an imposed server is kept only while usable, or
    // when the configuration insists
    if sess.flags.intersects(SessFlags::DIRECT | SessFlags::ASSIGNED) {
        if let Some(sref) = sess.srv {
            let persist = proxies
                .proxy(be_id)
                .options
                .contains(crate::proxy::ProxyOptions::PERSIST)
                || sess.flags.contains(SessFlags::FORCE_PRST);
            let srv = proxies.server(sref);
            if srv.up || persist {
                return reserve_or_queue(sess, proxies, sref);
            }
            // fall through to plain balancing
            debug!(srv = %srv.name, "persistent server is down, rebalancing");
            sess.flags.remove(SessFlags::DIRECT | SessFlags::ASSIGNED | SessFlags::ADDR_SET);
            sess.srv = None;
        }
    }

    let Some(idx) = proxies.proxy_mut(be_id).pick_server() else {
        return Assign::NoServer;
    };
    let sref = ServerRef { px: be_id, idx };
    sess.srv = Some(sref);
    sess.flags.insert(SessFlags::ASSIGNED);
    reserve_or_queue(sess, proxies, sref)
}

fn reserve_or_queue(sess: &mut Session, proxies: &mut ProxySet, sref: ServerRef) -> Assign {
    let srv = proxies.server(sref);
    if srv.has_slot() {
        change_server(sess, proxies, Some(sref));
        return Assign::Assigned;
    }

    // server saturated: queue on it (we insist on this server) unless
    // its queue is capped out
    if let Some(maxq) = srv.maxqueue {
        if srv.queue.len() as u32 >= maxq {
            return Assign::QueueFull;
        }
    }
    sess.logs.prx_queue_size = proxies.proxy(sess.be).queue.len() as u32;
    sess.logs.srv_queue_size = srv.queue.len() as u32;
    let pos = queue::enqueue(&mut *proxies, sess.slot, sess.be, Some(sref));
    sess.pend_pos = Some(pos);
    Assign::Queued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{Proxy, ProxyCaps, ProxyId, ProxyMode, ProxyOptions, Server};
    use crate::session::tests::test_session;

    fn proxies_with_servers(n: usize) -> ProxySet {
        let mut proxies = ProxySet::default();
        let mut fe = Proxy::new(ProxyId(0), "fe", ProxyMode::Tcp, ProxyCaps::FE | ProxyCaps::BE);
        for i in 0..n {
            fe.servers.push(Server::new(
                format!("s{i}"),
                format!("127.0.0.1:{}", 9100 + i).parse().unwrap(),
            ));
        }
        let mut lst = crate::proxy::Listener {
            id: crate::proxy::ListenerId(0),
            fe: ProxyId(0),
            addr: "127.0.0.1:8080".parse().unwrap(),
            state: crate::proxy::ListenerState::Listen,
            maxconn: 100,
            nbconn: 0,
            opts: relay_net::ListenerOpts::default(),
            analysers: crate::analyser::AnMask::empty(),
            counters: crate::proxy::ListenerCounters::default(),
        };
        lst.state = crate::proxy::ListenerState::Ready;
        proxies.listeners.push(lst);
        proxies.proxies.push(fe);
        proxies
    }

    #[test]
    fn assign_reserves_a_slot() {
        let mut proxies = proxies_with_servers(2);
        let mut sess = test_session();
        assert_eq!(assign_server_and_queue(&mut sess, &mut proxies), Assign::Assigned);
        assert!(sess.flags.contains(SessFlags::ASSIGNED));
        let sref = sess.srv.unwrap();
        assert_eq!(proxies.server(sref).served, 1);
    }

    #[test]
    fn saturated_pool_queues() {
        let mut proxies = proxies_with_servers(1);
        proxies.proxies[0].servers[0].maxconn = Some(1);
        proxies.proxies[0].servers[0].served = 1;
        let mut sess = test_session();
        assert_eq!(assign_server_and_queue(&mut sess, &mut proxies), Assign::Queued);
        assert!(sess.pend_pos.is_some());
        assert_eq!(proxies.proxies[0].servers[0].queue.len(), 1);
    }

    #[test]
    fn all_down_is_no_server() {
        let mut proxies = proxies_with_servers(2);
        proxies.proxies[0].servers[0].up = false;
        proxies.proxies[0].servers[1].up = false;
        let mut sess = test_session();
        assert_eq!(assign_server_and_queue(&mut sess, &mut proxies), Assign::NoServer);
    }

    #[test]
    fn persistence_to_down_server_falls_through_without_persist() {
        let mut proxies = proxies_with_servers(2);
        proxies.proxies[0].servers[0].up = false;
        let mut sess = test_session();
        sess.srv = Some(ServerRef { px: ProxyId(0), idx: 0 });
        sess.flags.insert(SessFlags::DIRECT | SessFlags::ASSIGNED);
        assert_eq!(assign_server_and_queue(&mut sess, &mut proxies), Assign::Assigned);
        assert_eq!(sess.srv.unwrap().idx, 1, "fell through to the healthy server");
    }

    #[test]
    fn persistence_to_down_server_honoured_with_persist_option() {
        let mut proxies = proxies_with_servers(2);
        proxies.proxies[0].servers[0].up = false;
        proxies.proxies[0].options.insert(ProxyOptions::PERSIST);
        let mut sess = test_session();
        sess.srv = Some(ServerRef { px: ProxyId(0), idx: 0 });
        sess.flags.insert(SessFlags::DIRECT | SessFlags::ASSIGNED);
        assert_eq!(assign_server_and_queue(&mut sess, &mut proxies), Assign::Assigned);
        assert_eq!(sess.srv.unwrap().idx, 0, "down server kept under persist");
    }

    #[test]
    fn change_server_moves_served_count() {
        let mut proxies = proxies_with_servers(2);
        let a = ServerRef { px: ProxyId(0), idx: 0 };
        let b = ServerRef { px: ProxyId(0), idx: 1 };
        let mut sess = test_session();
        change_server(&mut sess, &mut proxies, Some(a));
        assert_eq!(proxies.server(a).served, 1);
        change_server(&mut sess, &mut proxies, Some(b));
        assert_eq!(proxies.server(a).served, 0);
        assert_eq!(proxies.server(b).served, 1);
        change_server(&mut sess, &mut proxies, None);
        assert_eq!(proxies.server(b).served, 0);
    }
}
