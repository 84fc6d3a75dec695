use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
};

use bitflags::bitflags;
use relay_net::{ListenerOpts, PortRange};
use relay_timing::{Duration, Ticks};
use relay_utils::SlotId;
use strum::Display;

use crate::acl::{AclRegistry, Cond};
use crate::analyser::AnMask;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ProxyId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ListenerId(pub u32);

/// A server is addressed by its backend plus position in the pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerRef {
    pub px: ProxyId,
    pub idx: u16,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ProxyMode {
    #[default]
    Tcp,
    Http,
    Health,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ProxyCaps: u8 {
        const FE = 1 << 0;
        const BE = 1 << 1;
    }
}

bitflags! {
    /// Behavioural options; a listen proxy carries both sides' bits.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ProxyOptions: u32 {
        /// SO_KEEPALIVE on accepted client sockets.
        const TCP_CLI_KA     = 1 << 0;
        /// SO_KEEPALIVE on server sockets.
        const TCP_SRV_KA     = 1 << 1;
        /// Abortive close (no TIME_WAIT lingering).
        const TCP_NOLINGER   = 1 << 2;
        /// Abort a queued/connecting request when the client closes.
        const ABRT_CLOSE     = 1 << 3;
        /// Last retry may pick another server.
        const REDISPATCH     = 1 << 4;
        /// Honour persistence even to a down server.
        const PERSIST        = 1 << 5;
        /// Kernel-splice request data.
        const SPLICE_REQ     = 1 << 6;
        /// Kernel-splice response data.
        const SPLICE_RSP     = 1 << 7;
        /// Splice adaptively when a fast streamer is detected.
        const SPLICE_AUTO    = 1 << 8;
        /// Read and write timeouts tick independently per direction.
        const INDEP_STR      = 1 << 9;
        /// Flush byte counters continuously, not only at close.
        const CONTSTATS      = 1 << 10;
        /// Don't log sessions that carried no data.
        const DONTLOGNULL    = 1 << 11;
        /// Never wait for more data before forwarding (low latency).
        const NODELAY        = 1 << 12;
    }
}

/// Configured timeouts; `NONE` means unset.
#[derive(Copy, Clone, Debug, Default)]
pub struct Timeouts {
    pub client: Duration,
    pub server: Duration,
    pub connect: Duration,
    pub queue: Duration,
    pub tarpit: Duration,
}

impl Timeouts {
    /// The queue timeout falls back to the connect timeout.
    pub fn queue_or_connect(&self) -> Duration {
        if self.queue.is_set() {
            self.queue
        } else {
            self.connect
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProxyCounters {
    pub conn_max: u64,
    pub cum_conn: u64,
    pub cum_sess: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub denied_req: u64,
    pub failed_req: u64,
    pub failed_conns: u64,
    pub failed_resp: u64,
    pub retries: u64,
    pub redispatches: u64,
    pub cli_aborts: u64,
    pub srv_aborts: u64,
    pub intercepted: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ListenerCounters {
    pub conn_max: u64,
    pub cum_conn: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub denied_req: u64,
    pub failed_req: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ServerCounters {
    pub cum_sess: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub failed_conns: u64,
    pub failed_resp: u64,
    pub retries: u64,
    pub redispatches: u64,
    pub cli_aborts: u64,
    pub srv_aborts: u64,
}

/// One connection target in a backend pool. Health is a consumed
/// signal; whatever check subsystem feeds it just flips `up`.
#[derive(Debug)]
pub struct Server {
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u32,
    pub up: bool,
    pub maxconn: Option<u32>,
    pub maxqueue: Option<u32>,
    pub cur_sess: u32,
    /// Sessions holding a slot on this server (load the LB sees).
    pub served: u32,
    pub queue: VecDeque<SlotId>,
    pub source: Option<SocketAddr>,
    /// Transparent mode: present the frontend-local address as the
    /// connection source.
    pub bind_frontend: bool,
    pub port_range: Option<PortRange>,
    pub interface: Option<String>,
    pub counters: ServerCounters,
}

impl Server {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            weight: 1,
            up: true,
            maxconn: None,
            maxqueue: None,
            cur_sess: 0,
            served: 0,
            queue: VecDeque::new(),
            source: None,
            bind_frontend: false,
            port_range: None,
            interface: None,
            counters: ServerCounters::default(),
        }
    }

    /// Whether a new session may use this server right now.
    pub fn has_slot(&self) -> bool {
        self.maxconn.is_none_or(|m| self.served < m)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ListenerState {
    #[default]
    New,
    Listen,
    Ready,
    /// At maxconn; accept is paused until a session ends.
    Full,
}

#[derive(Debug)]
pub struct Listener {
    pub id: ListenerId,
    pub fe: ProxyId,
    pub addr: SocketAddr,
    pub state: ListenerState,
    pub maxconn: u32,
    pub nbconn: u32,
    pub opts: ListenerOpts,
    /// Analyser bits granted to sessions accepted here.
    pub analysers: AnMask,
    pub counters: ListenerCounters,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TcpAction {
    Accept,
    Reject,
}

/// `tcp-request content` rule.
#[derive(Debug)]
pub struct TcpRule {
    pub action: TcpAction,
    pub cond: Option<Cond>,
}

/// `use_backend <be> if <cond>`.
#[derive(Debug)]
pub struct SwitchingRule {
    pub target: ProxyId,
    pub cond: Cond,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PersistKind {
    Force,
    Ignore,
}

#[derive(Debug)]
pub struct PersistRule {
    pub kind: PersistKind,
    pub cond: Option<Cond>,
}

/// Sticking rule: `match` consumes an existing entry to pick a server,
/// `store` creates one (request side) as does the response-side store.
#[derive(Debug)]
pub struct StickRule {
    pub is_match: bool,
    pub is_store: bool,
    pub on_response: bool,
    pub cond: Option<Cond>,
}

/// Keys are client sources; the only stick dimension this engine
/// tracks natively.
pub type StickKey = IpAddr;

/// In-memory sticky table with per-entry expiry.
#[derive(Debug)]
pub struct StickTable {
    pub expire: Duration,
    pub size: usize,
    entries: HashMap<StickKey, (u16, Ticks)>,
}

impl StickTable {
    pub fn new(size: usize, expire: Duration) -> Self {
        Self { expire, size, entries: HashMap::new() }
    }

    pub fn lookup(&mut self, key: &StickKey, now: Ticks) -> Option<u16> {
        match self.entries.get_mut(key) {
            Some((sid, exp)) => {
                if exp.expired(now) {
                    self.entries.remove(key);
                    return None;
                }
                // refresh on hit
                *exp = now.add_ifset(self.expire);
                Some(*sid)
            }
            None => None,
        }
    }

    pub fn store(&mut self, key: StickKey, sid: u16, now: Ticks) {
        if self.entries.len() >= self.size && !self.entries.contains_key(&key) {
            // drop one expired entry if any, else refuse
            let dead = self
                .entries
                .iter()
                .find(|(_, (_, exp))| exp.expired(now))
                .map(|(k, _)| *k);
            match dead {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => return,
            }
        }
        self.entries.insert(key, (sid, now.add_ifset(self.expire)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Session-per-second gate over a one-second sliding window.
#[derive(Copy, Clone, Debug, Default)]
pub struct FreqCtr {
    window_start: Ticks,
    curr: u32,
    prev: u32,
}

impl FreqCtr {
    pub fn tick(&mut self, now: Ticks) {
        let elapsed = (now - self.window_start).as_millis();
        if elapsed >= 2_000 {
            self.prev = 0;
            self.curr = 0;
            self.window_start = now;
        } else if elapsed >= 1_000 {
            self.prev = self.curr;
            self.curr = 0;
            self.window_start = Ticks(self.window_start.0 + 1_000);
        }
    }

    pub fn note(&mut self, now: Ticks) {
        self.tick(now);
        self.curr += 1;
    }

    /// Events still admissible this second under `limit`/s.
    pub fn remaining(&mut self, limit: u32, now: Ticks) -> u32 {
        self.tick(now);
        let frac = 1_000 - ((now - self.window_start).as_millis().min(999) as u32);
        let past = (u64::from(self.prev) * u64::from(frac) / 1_000) as u32 + self.curr;
        limit.saturating_sub(past)
    }
}

/// Frontend and/or backend. A `listen` proxy is both at once: it owns
/// listeners and a server pool, and a session's `be` starts out equal
/// to its `fe` until switching rules move it.
#[derive(Debug)]
pub struct Proxy {
    pub id: ProxyId,
    pub name: String,
    pub mode: ProxyMode,
    pub caps: ProxyCaps,
    pub options: ProxyOptions,
    pub timeouts: Timeouts,
    pub maxconn: u32,
    pub feconn: u32,
    pub beconn: u32,
    pub fe_sps_lim: Option<u32>,
    pub fe_sess_per_sec: FreqCtr,
    pub retries: u32,

    pub acl: AclRegistry,
    pub inspect_delay: Duration,
    pub tcp_req_rules: Vec<TcpRule>,
    pub switching_rules: Vec<SwitchingRule>,
    pub default_backend: Option<ProxyId>,
    pub persist_rules: Vec<PersistRule>,
    pub stick_rules: Vec<StickRule>,
    pub stick_table: Option<StickTable>,
    pub rdp_cookie_name: Option<String>,

    /// Request analysers contributed once this proxy becomes the
    /// session's backend (sticking, RDP persistence).
    pub be_req_ana: AnMask,
    /// Response analysers contributed when this proxy is the frontend
    /// resp. the backend of a session.
    pub fe_rsp_ana: AnMask,
    pub be_rsp_ana: AnMask,

    /// Sources matching this network get the canned monitor response.
    pub monitor_net: Option<(IpAddr, u8)>,

    pub servers: Vec<Server>,
    pub queue: VecDeque<SlotId>,
    rr_pos: usize,

    pub counters: ProxyCounters,
}

impl Proxy {
    pub fn new(id: ProxyId, name: impl Into<String>, mode: ProxyMode, caps: ProxyCaps) -> Self {
        Self {
            id,
            name: name.into(),
            mode,
            caps,
            options: ProxyOptions::default(),
            timeouts: Timeouts::default(),
            maxconn: 2_000,
            feconn: 0,
            beconn: 0,
            fe_sps_lim: None,
            fe_sess_per_sec: FreqCtr::default(),
            retries: 3,
            acl: AclRegistry::default(),
            inspect_delay: Duration::NONE,
            tcp_req_rules: Vec::new(),
            switching_rules: Vec::new(),
            default_backend: None,
            persist_rules: Vec::new(),
            stick_rules: Vec::new(),
            stick_table: None,
            rdp_cookie_name: None,
            be_req_ana: AnMask::empty(),
            fe_rsp_ana: AnMask::empty(),
            be_rsp_ana: AnMask::empty(),
            monitor_net: None,
            servers: Vec::new(),
            queue: VecDeque::new(),
            rr_pos: 0,
            counters: ProxyCounters::default(),
        }
    }

    /// Weighted round robin over UP servers with a free slot; the LB
    /// seam contracted by the session engine. Position advances so
    /// consecutive picks rotate.
    pub fn pick_server(&mut self) -> Option<u16> {
        let n = self.servers.len();
        if n == 0 {
            return None;
        }
        // servers with free slots first, then any UP server (it will
        // be queued by the caller)
        for pass in 0..2 {
            for step in 0..n {
                let idx = (self.rr_pos + step) % n;
                let srv = &self.servers[idx];
                if !srv.up || srv.weight == 0 {
                    continue;
                }
                if pass == 0 && !srv.has_slot() {
                    continue;
                }
                self.rr_pos = (idx + 1) % n;
                return Some(idx as u16);
            }
        }
        None
    }

    pub fn monitor_matches(&self, src: IpAddr) -> bool {
        let Some((net, bits)) = self.monitor_net else { return false };
        match (net, src) {
            (IpAddr::V4(net), IpAddr::V4(src)) => {
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - u32::from(bits.min(32))) };
                (u32::from(src) & mask) == (u32::from(net) & mask)
            }
            _ => false,
        }
    }
}

/// All proxies plus listeners, addressed by their ids.
#[derive(Debug, Default)]
pub struct ProxySet {
    pub proxies: Vec<Proxy>,
    pub listeners: Vec<Listener>,
}

impl ProxySet {
    pub fn proxy(&self, id: ProxyId) -> &Proxy {
        &self.proxies[id.0 as usize]
    }

    pub fn proxy_mut(&mut self, id: ProxyId) -> &mut Proxy {
        &mut self.proxies[id.0 as usize]
    }

    pub fn listener(&self, id: ListenerId) -> &Listener {
        &self.listeners[id.0 as usize]
    }

    pub fn listener_mut(&mut self, id: ListenerId) -> &mut Listener {
        &mut self.listeners[id.0 as usize]
    }

    pub fn server(&self, sref: ServerRef) -> &Server {
        &self.proxy(sref.px).servers[sref.idx as usize]
    }

    pub fn server_mut(&mut self, sref: ServerRef) -> &mut Server {
        &mut self.proxy_mut(sref.px).servers[sref.idx as usize]
    }

    pub fn by_name(&self, name: &str) -> Option<ProxyId> {
        self.proxies.iter().find(|p| p.name == name).map(|p| p.id)
    }
}
