//! Declarative proxy configuration. File formats and argument
//! handling stay outside; this module turns the deserialized
//! declaration into a wired [`ProxySet`], compiling ACLs, rules and
//! listener analyser masks along the way.

use std::net::SocketAddr;

use relay_timing::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::acl::{self, AclError, Caps};
use crate::analyser::AnMask;
use crate::proxy::{
    Listener, ListenerCounters, ListenerId, ListenerState, PersistKind, PersistRule, Proxy,
    ProxyCaps, ProxyId, ProxyMode, ProxyOptions, Server, StickRule, StickTable, SwitchingRule,
    TcpAction, TcpRule, Timeouts,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("proxy '{0}': {1}")]
    Proxy(String, String),
    #[error("proxy '{proxy}': unknown backend '{backend}'")]
    UnknownBackend { proxy: String, backend: String },
    #[error("proxy '{0}': {1}")]
    Acl(String, AclError),
    #[error("no proxies declared")]
    Empty,
}

/// Capabilities available to request-side TCP hooks: connection data
/// plus the raw request bytes.
const TCP_REQ_CAPS: Caps = Caps::TCP_ANY.union(Caps::L4REQ);

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub maxconn: Option<u32>,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub bind: Vec<BindConfig>,
    #[serde(default)]
    pub maxconn: Option<u32>,
    /// Frontend sessions-per-second admission limit.
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub retries: Option<u32>,
    /// Flat option names: redispatch, abortonclose, nolinger,
    /// persist, clitcpka, srvtcpka, splice-request, splice-response,
    /// splice-auto, independent-streams, contstats, dontlognull,
    /// tcp-smart-forward.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// `name keyword [flags] patterns...`
    #[serde(default)]
    pub acls: Vec<String>,
    /// `inspect-delay <dur>` / `content accept|reject [if|unless ...]`
    #[serde(default, rename = "tcp_request")]
    pub tcp_request: Vec<String>,
    /// `<backend> if|unless ...`
    #[serde(default)]
    pub use_backend: Vec<String>,
    #[serde(default)]
    pub default_backend: Option<String>,
    /// `force|ignore [if|unless ...]`
    #[serde(default)]
    pub persist: Vec<String>,
    /// `match|store|store-response [if|unless ...]` (source keyed)
    #[serde(default)]
    pub stick: Vec<String>,
    #[serde(default)]
    pub stick_table: Option<StickTableConfig>,
    /// RDP cookie name for persistence (empty = any cookie).
    #[serde(default)]
    pub rdp_cookie: Option<String>,
    /// `a.b.c.d/len` network whose probes get the canned answer.
    #[serde(default)]
    pub monitor_net: Option<String>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub maxconn: Option<u32>,
    /// Expect the PROXY protocol preamble on accepted connections.
    #[serde(default)]
    pub accept_proxy: bool,
    #[serde(default)]
    pub nolinger: bool,
    #[serde(default)]
    pub transparent: bool,
    #[serde(default)]
    pub defer_accept: bool,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub client: Option<Duration>,
    #[serde(default)]
    pub server: Option<Duration>,
    #[serde(default)]
    pub connect: Option<Duration>,
    #[serde(default)]
    pub queue: Option<Duration>,
    #[serde(default)]
    pub tarpit: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StickTableConfig {
    pub size: usize,
    pub expire: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    pub addr: SocketAddr,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub maxconn: Option<u32>,
    #[serde(default)]
    pub maxqueue: Option<u32>,
    #[serde(default)]
    pub source: Option<SocketAddr>,
    #[serde(default)]
    pub source_port_range: Option<(u16, u16)>,
    #[serde(default)]
    pub interface: Option<String>,
    /// Transparent client spoofing towards this server.
    #[serde(default)]
    pub bind_frontend: bool,
    /// Administratively down (the health feed flips this at runtime).
    #[serde(default)]
    pub down: bool,
}

/// Builds the wired proxy set from a declaration.
pub fn build(cfg: &Config) -> Result<crate::proxy::ProxySet, ConfigError> {
    if cfg.proxies.is_empty() {
        return Err(ConfigError::Empty);
    }
    let mut set = crate::proxy::ProxySet::default();

    // first pass: create every proxy so later rules can reference them
    for (i, pc) in cfg.proxies.iter().enumerate() {
        let mode = match pc.mode.as_deref() {
            None | Some("tcp") => ProxyMode::Tcp,
            Some("http") => ProxyMode::Http,
            Some("health") => ProxyMode::Health,
            Some(other) => {
                return Err(ConfigError::Proxy(pc.name.clone(), format!("unknown mode '{other}'")))
            }
        };
        let mut caps = ProxyCaps::empty();
        if !pc.bind.is_empty() {
            caps |= ProxyCaps::FE;
        }
        if !pc.servers.is_empty() {
            caps |= ProxyCaps::BE;
        }
        let mut px = Proxy::new(ProxyId(i as u32), pc.name.clone(), mode, caps);

        if let Some(mc) = pc.maxconn {
            px.maxconn = mc;
        }
        px.fe_sps_lim = pc.rate_limit;
        if let Some(r) = pc.retries {
            px.retries = r;
        }
        px.timeouts = Timeouts {
            client: pc.timeouts.client.unwrap_or(Duration::NONE),
            server: pc.timeouts.server.unwrap_or(Duration::NONE),
            connect: pc.timeouts.connect.unwrap_or(Duration::NONE),
            queue: pc.timeouts.queue.unwrap_or(Duration::NONE),
            tarpit: pc.timeouts.tarpit.unwrap_or(Duration::NONE),
        };
        for opt in &pc.options {
            px.options |= parse_option(opt)
                .ok_or_else(|| ConfigError::Proxy(pc.name.clone(), format!("unknown option '{opt}'")))?;
        }
        if let Some(net) = &pc.monitor_net {
            px.monitor_net = Some(parse_net(net).ok_or_else(|| {
                ConfigError::Proxy(pc.name.clone(), format!("bad monitor_net '{net}'"))
            })?);
        }
        px.rdp_cookie_name = pc.rdp_cookie.clone();
        if let Some(st) = &pc.stick_table {
            px.stick_table = Some(StickTable::new(st.size, st.expire));
        }
        for sc in &pc.servers {
            let mut srv = Server::new(sc.name.clone(), sc.addr);
            srv.weight = sc.weight.unwrap_or(1);
            srv.maxconn = sc.maxconn;
            srv.maxqueue = sc.maxqueue;
            srv.source = sc.source;
            srv.bind_frontend = sc.bind_frontend;
            srv.interface = sc.interface.clone();
            srv.up = !sc.down;
            if let Some((lo, hi)) = sc.source_port_range {
                srv.port_range = Some(relay_net::PortRange::new(lo, hi));
            }
            px.servers.push(srv);
        }

        for decl in &pc.acls {
            let args = tokens(decl);
            px.acl.declare(&args).map_err(|e| ConfigError::Acl(pc.name.clone(), e))?;
        }

        set.proxies.push(px);
    }

    // second pass: rules that reference other proxies, then listeners
    for (i, pc) in cfg.proxies.iter().enumerate() {
        let id = ProxyId(i as u32);

        let default_backend = match &pc.default_backend {
            Some(name) => Some(set.by_name(name).ok_or_else(|| ConfigError::UnknownBackend {
                proxy: pc.name.clone(),
                backend: name.clone(),
            })?),
            None => None,
        };

        let mut tcp_rules = Vec::new();
        let mut inspect_delay = Duration::NONE;
        for line in &pc.tcp_request {
            let args = tokens(line);
            match args.first().map(String::as_str) {
                Some("inspect-delay") => {
                    let Some(d) = args.get(1) else {
                        return Err(ConfigError::Proxy(
                            pc.name.clone(),
                            "inspect-delay needs a duration".into(),
                        ));
                    };
                    inspect_delay = d.parse().map_err(|e| {
                        ConfigError::Proxy(pc.name.clone(), format!("bad inspect-delay: {e}"))
                    })?;
                }
                Some("content") => {
                    let action = match args.get(1).map(String::as_str) {
                        Some("accept") => TcpAction::Accept,
                        Some("reject") => TcpAction::Reject,
                        _ => {
                            return Err(ConfigError::Proxy(
                                pc.name.clone(),
                                "content expects accept or reject".into(),
                            ))
                        }
                    };
                    let cond = if args.len() > 2 {
                        let px = &mut set.proxies[i];
                        Some(
                            acl::build_cond(&args[2..], &mut px.acl, TCP_REQ_CAPS)
                                .map_err(|e| ConfigError::Acl(pc.name.clone(), e))?,
                        )
                    } else {
                        None
                    };
                    tcp_rules.push(TcpRule { action, cond });
                }
                _ => {
                    return Err(ConfigError::Proxy(
                        pc.name.clone(),
                        format!("unknown tcp_request line '{line}'"),
                    ))
                }
            }
        }

        let mut switching = Vec::new();
        for line in &pc.use_backend {
            let args = tokens(line);
            let Some(name) = args.first() else {
                return Err(ConfigError::Proxy(pc.name.clone(), "use_backend needs a name".into()));
            };
            let target = set.by_name(name).ok_or_else(|| ConfigError::UnknownBackend {
                proxy: pc.name.clone(),
                backend: name.clone(),
            })?;
            let px = &mut set.proxies[i];
            let cond = acl::build_cond(&args[1..], &mut px.acl, TCP_REQ_CAPS)
                .map_err(|e| ConfigError::Acl(pc.name.clone(), e))?;
            switching.push(SwitchingRule { target, cond });
        }

        let mut persists = Vec::new();
        for line in &pc.persist {
            let args = tokens(line);
            let kind = match args.first().map(String::as_str) {
                Some("force") => PersistKind::Force,
                Some("ignore") => PersistKind::Ignore,
                _ => {
                    return Err(ConfigError::Proxy(
                        pc.name.clone(),
                        "persist expects force or ignore".into(),
                    ))
                }
            };
            let cond = if args.len() > 1 {
                let px = &mut set.proxies[i];
                Some(
                    acl::build_cond(&args[1..], &mut px.acl, TCP_REQ_CAPS)
                        .map_err(|e| ConfigError::Acl(pc.name.clone(), e))?,
                )
            } else {
                None
            };
            persists.push(PersistRule { kind, cond });
        }

        let mut sticks = Vec::new();
        for line in &pc.stick {
            let args = tokens(line);
            let (is_match, is_store, on_response) = match args.first().map(String::as_str) {
                Some("match") => (true, false, false),
                Some("store") => (false, true, false),
                Some("on") => (true, true, false),
                Some("store-response") => (false, true, true),
                _ => {
                    return Err(ConfigError::Proxy(
                        pc.name.clone(),
                        "stick expects match, store, on or store-response".into(),
                    ))
                }
            };
            let cond = if args.len() > 1 {
                let px = &mut set.proxies[i];
                Some(
                    acl::build_cond(&args[1..], &mut px.acl, TCP_REQ_CAPS)
                        .map_err(|e| ConfigError::Acl(pc.name.clone(), e))?,
                )
            } else {
                None
            };
            sticks.push(StickRule { is_match, is_store, on_response, cond });
        }

        {
            let px = &mut set.proxies[i];
            px.default_backend = default_backend;
            px.inspect_delay = inspect_delay;
            px.tcp_req_rules = tcp_rules;
            px.switching_rules = switching;
            px.persist_rules = persists;
            px.stick_rules = sticks;

            if px.stick_rules.iter().any(|r| r.is_match || r.is_store) {
                px.be_req_ana |= AnMask::REQ_STICKING;
            }
            if px.rdp_cookie_name.is_some() {
                px.be_req_ana |= AnMask::REQ_PRST_RDP;
            }
            if px.stick_rules.iter().any(|r| r.is_store) {
                px.be_rsp_ana |= AnMask::RES_STORE_RULES;
            }
        }

        // listeners: analyser grants depend on the frontend's rules
        for bc in &pc.bind {
            let mut analysers = AnMask::empty();
            if bc.accept_proxy {
                analysers |= AnMask::REQ_DECODE_PROXY;
            }
            {
                let px = &set.proxies[i];
                if px.inspect_delay.is_set() || !px.tcp_req_rules.is_empty() {
                    analysers |= AnMask::REQ_INSPECT;
                }
                if px.mode != ProxyMode::Health {
                    analysers |= AnMask::REQ_SWITCHING;
                }
            }
            let lid = ListenerId(set.listeners.len() as u32);
            set.listeners.push(Listener {
                id: lid,
                fe: id,
                addr: bc.addr,
                state: ListenerState::New,
                maxconn: bc.maxconn.unwrap_or(set.proxies[i].maxconn),
                nbconn: 0,
                opts: relay_net::ListenerOpts {
                    nolinger: bc.nolinger,
                    transparent: bc.transparent,
                    defer_accept: bc.defer_accept,
                    interface: bc.interface.clone(),
                    ..Default::default()
                },
                analysers,
                counters: ListenerCounters::default(),
            });
        }
    }

    Ok(set)
}

fn tokens(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

fn parse_option(name: &str) -> Option<ProxyOptions> {
    Some(match name {
        "redispatch" => ProxyOptions::REDISPATCH,
        "abortonclose" => ProxyOptions::ABRT_CLOSE,
        "nolinger" => ProxyOptions::TCP_NOLINGER,
        "persist" => ProxyOptions::PERSIST,
        "clitcpka" => ProxyOptions::TCP_CLI_KA,
        "srvtcpka" => ProxyOptions::TCP_SRV_KA,
        "splice-request" => ProxyOptions::SPLICE_REQ,
        "splice-response" => ProxyOptions::SPLICE_RSP,
        "splice-auto" => ProxyOptions::SPLICE_AUTO,
        "independent-streams" => ProxyOptions::INDEP_STR,
        "contstats" => ProxyOptions::CONTSTATS,
        "dontlognull" => ProxyOptions::DONTLOGNULL,
        "tcp-smart-forward" => ProxyOptions::NODELAY,
        _ => return None,
    })
}

fn parse_net(s: &str) -> Option<(std::net::IpAddr, u8)> {
    let (addr, len) = match s.split_once('/') {
        Some((a, l)) => (a, l.parse().ok()?),
        None => (s, 32),
    };
    if len > 32 {
        return None;
    }
    Some((addr.parse().ok()?, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(json: &str) -> Config {
        serde_json::from_str(json).expect("valid config json")
    }

    #[test]
    fn minimal_listen_proxy() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "main",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "timeouts": {"client": "30s", "server": "30s", "connect": "5s"},
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        let set = build(&cfg).unwrap();
        assert_eq!(set.proxies.len(), 1);
        assert_eq!(set.listeners.len(), 1);
        let px = &set.proxies[0];
        assert!(px.caps.contains(ProxyCaps::FE | ProxyCaps::BE));
        assert_eq!(px.timeouts.connect, Duration::from_secs(5));
        assert!(set.listeners[0].analysers.contains(AnMask::REQ_SWITCHING));
        assert!(!set.listeners[0].analysers.contains(AnMask::REQ_DECODE_PROXY));
    }

    #[test]
    fn accept_proxy_grants_decoder_bit() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "main",
                "bind": [{"addr": "127.0.0.1:8080", "accept_proxy": true}],
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        let set = build(&cfg).unwrap();
        assert!(set.listeners[0].analysers.contains(AnMask::REQ_DECODE_PROXY));
    }

    #[test]
    fn tcp_request_rules_compile() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "main",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "tcp_request": [
                    "inspect-delay 100ms",
                    "content reject if { src 10.0.0.0/8 }",
                    "content accept if WAIT_END"
                ],
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        let set = build(&cfg).unwrap();
        let px = &set.proxies[0];
        assert_eq!(px.inspect_delay, Duration::from_millis(100));
        assert_eq!(px.tcp_req_rules.len(), 2);
        assert_eq!(px.tcp_req_rules[0].action, TcpAction::Reject);
        assert!(set.listeners[0].analysers.contains(AnMask::REQ_INSPECT));
    }

    #[test]
    fn switching_rules_resolve_backends() {
        let cfg = cfg(r#"{
            "proxies": [
                {
                    "name": "fe",
                    "bind": [{"addr": "127.0.0.1:8080"}],
                    "acls": ["to_pool2 dst_port 81"],
                    "use_backend": ["pool2 if to_pool2"],
                    "default_backend": "pool1"
                },
                {"name": "pool1", "servers": [{"name": "a", "addr": "127.0.0.1:9001"}]},
                {"name": "pool2", "servers": [{"name": "b", "addr": "127.0.0.1:9002"}]}
            ]
        }"#);
        let set = build(&cfg).unwrap();
        let fe = &set.proxies[0];
        assert_eq!(fe.switching_rules.len(), 1);
        assert_eq!(fe.switching_rules[0].target, ProxyId(2));
        assert_eq!(fe.default_backend, Some(ProxyId(1)));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "fe",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "default_backend": "nope"
            }]
        }"#);
        assert!(matches!(build(&cfg), Err(ConfigError::UnknownBackend { .. })));
    }

    #[test]
    fn l7_acl_at_tcp_hook_is_rejected() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "fe",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "tcp_request": ["content reject if HTTP_1.1"],
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        assert!(matches!(build(&cfg), Err(ConfigError::Acl(_, AclError::HookDenied { .. }))));
    }

    #[test]
    fn sticking_config_sets_backend_analysers() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "pool",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "stick": ["on"],
                "stick_table": {"size": 1024, "expire": "5m"},
                "rdp_cookie": "mstshash",
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        let set = build(&cfg).unwrap();
        let px = &set.proxies[0];
        assert!(px.be_req_ana.contains(AnMask::REQ_STICKING | AnMask::REQ_PRST_RDP));
        assert!(px.be_rsp_ana.contains(AnMask::RES_STORE_RULES));
        assert!(px.stick_table.is_some());
    }

    #[test]
    fn durations_accept_all_suffixes() {
        let cfg = cfg(r#"{
            "proxies": [{
                "name": "fe",
                "bind": [{"addr": "127.0.0.1:8080"}],
                "timeouts": {"client": "1m", "server": "90s", "connect": "500ms", "queue": "1h"},
                "servers": [{"name": "s1", "addr": "127.0.0.1:9000"}]
            }]
        }"#);
        let set = build(&cfg).unwrap();
        let t = set.proxies[0].timeouts;
        assert_eq!(t.client, Duration::from_mins(1));
        assert_eq!(t.server, Duration::from_secs(90));
        assert_eq!(t.connect, Duration::from_millis(500));
        assert_eq!(t.queue, Duration::from_mins(60));
    }
}
