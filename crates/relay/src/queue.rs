use relay_utils::SlotId;
use tracing::debug;

use crate::proxy::{ProxyId, ProxySet, ServerRef};

/// Where a pending connection request is parked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PendPos {
    /// Queue of a specific server (session was assigned or direct).
    Server(ServerRef),
    /// Shared queue of the backend (any server will do).
    Backend(ProxyId),
}

/// Parks `slot` in the server's queue (when it insists on one server)
/// or the backend's. Returns the position to store in the session.
pub fn enqueue(proxies: &mut ProxySet, slot: SlotId, be: ProxyId, srv: Option<ServerRef>) -> PendPos {
    match srv {
        Some(sref) => {
            let s = proxies.server_mut(sref);
            s.queue.push_back(slot);
            debug!(%slot, srv = %s.name, qlen = s.queue.len(), "queued on server");
            PendPos::Server(sref)
        }
        None => {
            let px = proxies.proxy_mut(be);
            px.queue.push_back(slot);
            debug!(%slot, be = %px.name, qlen = px.queue.len(), "queued on backend");
            PendPos::Backend(be)
        }
    }
}

/// Length of the queue a new entry for `srv` would join, including the
/// backend's shared queue.
pub fn pending_ahead(proxies: &ProxySet, be: ProxyId, srv: Option<ServerRef>) -> usize {
    let shared = proxies.proxy(be).queue.len();
    match srv {
        Some(sref) => shared + proxies.server(sref).queue.len(),
        None => shared,
    }
}

/// Drops `slot` from wherever it is queued. Idempotent.
pub fn unlink(proxies: &mut ProxySet, slot: SlotId, pos: PendPos) {
    let queue = match pos {
        PendPos::Server(sref) => &mut proxies.server_mut(sref).queue,
        PendPos::Backend(be) => &mut proxies.proxy_mut(be).queue,
    };
    if let Some(at) = queue.iter().position(|s| *s == slot) {
        queue.remove(at);
    }
}

/// Whether freeing a slot on `sref` could promote a queued session.
pub fn may_dequeue(proxies: &ProxySet, sref: ServerRef) -> bool {
    let srv = proxies.server(sref);
    srv.up
        && srv.has_slot()
        && (!srv.queue.is_empty() || !proxies.proxy(sref.px).queue.is_empty())
}

/// Picks the next queued session for `sref`: its own queue first, then
/// the backend's shared queue. The caller re-assigns and wakes it.
pub fn next_pending(proxies: &mut ProxySet, sref: ServerRef) -> Option<SlotId> {
    if let Some(slot) = proxies.server_mut(sref).queue.pop_front() {
        return Some(slot);
    }
    proxies.proxy_mut(sref.px).queue.pop_front()
}
