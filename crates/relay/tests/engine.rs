//! End-to-end scenarios driving the engine over real sockets.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use relay::{
    buffer::FORWARD_INFINITE,
    config,
    engine::Engine,
    runtime::{Runtime, Tune},
};

fn free_addr() -> std::net::SocketAddr {
    // bind to :0, remember the port, release it for the engine
    let sock = TcpListener::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap()
}

fn engine_from(json: &str) -> Engine {
    let cfg: config::Config = serde_json::from_str(json).unwrap();
    let proxies = config::build(&cfg).unwrap();
    Engine::new(proxies, Runtime::new(1000, Tune::default())).expect("engine boot")
}

/// Polls the engine until `done` or the deadline.
fn drive(engine: &mut Engine, total: Duration, mut done: impl FnMut(&mut Engine) -> bool) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        engine
            .poll_once(Some(Duration::from_millis(10)))
            .expect("poll");
        if done(engine) {
            return true;
        }
    }
    false
}

/// Echo-less sink: accepts connections and reports every payload on a
/// channel.
fn sink_server(listener: TcpListener, tx: mpsc::Sender<Vec<u8>>) {
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            let tx = tx.clone();
            thread::spawn(move || {
                let mut data = Vec::new();
                let mut chunk = [0u8; 4096];
                conn.set_read_timeout(Some(Duration::from_secs(5))).ok();
                while let Ok(n) = conn.read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&chunk[..n]);
                    let _ = tx.send(data.clone());
                }
            });
        }
    });
}

/// Scenario: PROXY protocol preamble. The decoder must rewrite the
/// session addresses and the backend must see only the payload.
#[test]
fn proxy_line_rewrites_addresses_and_strips_line() {
    let front = free_addr();
    let back_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let back = back_listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    sink_server(back_listener, tx);

    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}", "accept_proxy": true}}],
                "timeouts": {{"client": "5s", "server": "5s", "connect": "2s"}},
                "servers": [{{"name": "s1", "addr": "{back}"}}]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    client
        .write_all(b"PROXY TCP4 192.0.2.1 198.51.100.2 35000 443\r\nGET / HTTP/1.0\r\n\r\n")
        .unwrap();

    assert!(drive(&mut engine, Duration::from_secs(5), |e| {
        e.sessions
            .iter()
            .any(|(_, s)| s.cli_addr == "192.0.2.1:35000".parse().unwrap())
    }));
    let sess = engine.sessions.iter().next().map(|(_, s)| s).unwrap();
    assert_eq!(sess.cli_addr, "192.0.2.1:35000".parse().unwrap());
    assert_eq!(sess.frt_addr, "198.51.100.2:443".parse().unwrap());

    // the backend must receive the request starting at 'G'
    let mut got = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline && got != b"GET / HTTP/1.0\r\n\r\n" {
        engine.poll_once(Some(Duration::from_millis(10))).unwrap();
        if let Ok(data) = rx.try_recv() {
            got = data;
        }
    }
    assert_eq!(got, b"GET / HTTP/1.0\r\n\r\n");
}

/// Scenario: a malformed preamble is a hard proxy-condition error.
#[test]
fn proxy_line_garbage_fails_request() {
    let front = free_addr();
    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}", "accept_proxy": true}}],
                "timeouts": {{"client": "5s", "server": "5s", "connect": "2s"}},
                "servers": [{{"name": "s1", "addr": "127.0.0.1:1"}}]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    client.write_all(b"NOT A PREAMBLE\r\n").unwrap();

    assert!(drive(&mut engine, Duration::from_secs(5), |e| {
        e.proxies.proxies[0].counters.failed_req >= 1
    }));
    assert_eq!(engine.proxies.listeners[0].counters.failed_req, 1);

    // the client side gets closed
    client
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 16];
    let mut saw_close = false;
    for _ in 0..100 {
        engine.poll_once(Some(Duration::from_millis(10))).unwrap();
        match client.read(&mut buf) {
            Ok(0) => {
                saw_close = true;
                break;
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => {
                saw_close = true;
                break;
            }
        }
    }
    assert!(saw_close);
}

/// Scenario: `tcp-request content reject` on a matching source aborts
/// the session and bumps the denied counters on frontend and listener.
#[test]
fn content_reject_counts_denied() {
    let front = free_addr();
    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}"}}],
                "timeouts": {{"client": "5s", "server": "5s", "connect": "2s"}},
                "tcp_request": [
                    "inspect-delay 100ms",
                    "content reject if {{ src 127.0.0.0/8 }}"
                ],
                "servers": [{{"name": "s1", "addr": "127.0.0.1:1"}}]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    client.write_all(b"x").unwrap();

    assert!(drive(&mut engine, Duration::from_secs(5), |e| {
        e.proxies.proxies[0].counters.denied_req >= 1
    }));
    assert_eq!(engine.proxies.proxies[0].counters.denied_req, 1);
    assert_eq!(engine.proxies.listeners[0].counters.denied_req, 1);
    // no server connection was ever attempted
    assert_eq!(engine.proxies.proxies[0].counters.failed_conns, 0);
}

/// Scenario: retries against a refusing server, then redispatch to the
/// healthy one on the last retry.
#[test]
fn retries_then_redispatch_reaches_second_server() {
    let front = free_addr();
    let dead = free_addr(); // nothing listens here: connections refused
    let back_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let back = back_listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    sink_server(back_listener, tx);

    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}"}}],
                "retries": 3,
                "options": ["redispatch"],
                "timeouts": {{"client": "15s", "server": "15s", "connect": "2s"}},
                "servers": [
                    {{"name": "dead", "addr": "{dead}"}},
                    {{"name": "live", "addr": "{back}"}}
                ]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    client.write_all(b"payload").unwrap();

    // three failed attempts with one-second turn-arounds, then the
    // redispatch must land on the live server
    let reached = drive(&mut engine, Duration::from_secs(10), |_| {
        matches!(rx.try_recv(), Ok(ref d) if d == b"payload")
    });
    assert!(reached, "payload never reached the second server");

    let px = &engine.proxies.proxies[0];
    assert_eq!(px.counters.redispatches, 1);
    assert!(px.counters.retries >= 1);
    assert_eq!(px.servers[1].counters.redispatches, 1);
    let sess = engine.sessions.iter().next().map(|(_, s)| s).unwrap();
    assert!(sess.logs.t_connect.is_some());
    assert_eq!(sess.srv.map(|s| s.idx), Some(1));
}

/// Scenario: server maxconn=1 with a short queue timeout; the second
/// client expires in the queue with a failed connection counted.
#[test]
fn queue_timeout_expires_second_client() {
    let front = free_addr();
    let back_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let back = back_listener.local_addr().unwrap();
    let (tx, _rx) = mpsc::channel();
    sink_server(back_listener, tx);

    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}"}}],
                "timeouts": {{"client": "10s", "server": "10s", "connect": "2s", "queue": "200ms"}},
                "servers": [{{"name": "s1", "addr": "{back}", "maxconn": 1}}]
            }}]
        }}"#
    ));

    let mut first = TcpStream::connect(front).unwrap();
    first.write_all(b"hold").unwrap();
    assert!(drive(&mut engine, Duration::from_secs(5), |e| {
        e.proxies.proxies[0].servers[0].served == 1
    }));

    let mut second = TcpStream::connect(front).unwrap();
    second.write_all(b"wait").unwrap();

    assert!(drive(&mut engine, Duration::from_secs(5), |e| {
        e.proxies.proxies[0].counters.failed_conns >= 1
    }));
    assert_eq!(engine.proxies.proxies[0].servers[0].counters.failed_conns, 1);

    // the expired client is gone; the first one still holds its slot
    assert_eq!(engine.proxies.proxies[0].servers[0].served, 1);
    second.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    let mut buf = [0u8; 8];
    let closed = drive(&mut engine, Duration::from_secs(3), |_| {
        match second.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
        }
    });
    assert!(closed);
}

/// Scenario: a pure TCP session with no analysers freewheels with an
/// infinite forward budget in both directions and relays both ways.
#[test]
fn established_tcp_session_forwards_infinitely() {
    let front = free_addr();
    let back_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let back = back_listener.local_addr().unwrap();

    // a real echo peer this time, we want both directions
    thread::spawn(move || {
        for conn in back_listener.incoming() {
            let Ok(mut conn) = conn else { break };
            thread::spawn(move || {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = conn.read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    if conn.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}"}}],
                "timeouts": {{"client": "10s", "server": "10s", "connect": "2s"}},
                "servers": [{{"name": "s1", "addr": "{back}"}}]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    client.write_all(b"ping").unwrap();
    client.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

    let mut echoed = Vec::new();
    assert!(drive(&mut engine, Duration::from_secs(5), |_| {
        let mut chunk = [0u8; 64];
        if let Ok(n) = client.read(&mut chunk) {
            echoed.extend_from_slice(&chunk[..n]);
        }
        echoed == b"ping"
    }));

    let sess = engine.sessions.iter().next().map(|(_, s)| s).unwrap();
    assert_eq!(sess.req.to_forward(), FORWARD_INFINITE);
    assert_eq!(sess.rep.to_forward(), FORWARD_INFINITE);
}

/// Scenario: a fetch that cannot decide on a short buffer holds the
/// session (MISS) until the inspect delay expires, after which the
/// rule evaluates as a non-match and traffic flows.
#[test]
fn inspect_miss_gates_until_expiry() {
    let front = free_addr();
    let back_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let back = back_listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();
    sink_server(back_listener, tx);

    let mut engine = engine_from(&format!(
        r#"{{
            "proxies": [{{
                "name": "fe",
                "bind": [{{"addr": "{front}"}}],
                "timeouts": {{"client": "10s", "server": "10s", "connect": "2s"}},
                "tcp_request": [
                    "inspect-delay 300ms",
                    "content reject if {{ req_ssl_ver gt 0 }}"
                ],
                "servers": [{{"name": "s1", "addr": "{back}"}}]
            }}]
        }}"#
    ));

    let mut client = TcpStream::connect(front).unwrap();
    // a plausible TLS record prefix, far too short to classify
    client.write_all(&[0x16, 0x03]).unwrap();

    let started = Instant::now();
    let reached = drive(&mut engine, Duration::from_secs(5), |_| {
        matches!(rx.try_recv(), Ok(ref d) if d == &[0x16, 0x03])
    });
    assert!(reached, "bytes never reached the backend");
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "inspection window ended too early: {:?}",
        started.elapsed()
    );
    assert_eq!(engine.proxies.proxies[0].counters.denied_req, 0);
}
