pub mod fsm;

use std::net::SocketAddr;

use bitflags::bitflags;
use relay_timing::{Duration, Ticks};
use relay_utils::SlotId;

use crate::acl::{HttpTxn, SampleCtx};
use crate::buffer::Buffer;
use crate::interface::{SiErr, SiState, StreamInterface};
use crate::proxy::{ListenerId, ProxyId, ProxySet, ServerRef, StickKey};
use crate::queue::PendPos;

/// The two ends of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Client = 0,
    Server = 1,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SessFlags: u32 {
        /// A server was imposed by persistence (cookie, sticky entry).
        const DIRECT      = 1 << 0;
        /// A server has been assigned.
        const ASSIGNED    = 1 << 1;
        /// The target address is set on the server-side interface.
        const ADDR_SET    = 1 << 2;
        /// A backend was assigned (switching done).
        const BE_ASSIGNED = 1 << 3;
        /// Persistence applies even to a down server.
        const FORCE_PRST  = 1 << 4;
        /// Persistence information is to be ignored.
        const IGNORE_PRST = 1 << 5;
        /// This session counts in `srv.cur_sess`.
        const CURR_SESS   = 1 << 6;
        /// The original destination address has been resolved.
        const FRT_ADDR_SET = 1 << 7;
        /// Monitoring probe: don't log, don't count.
        const MONITOR     = 1 << 8;
        /// The last retry was redispatched to another server.
        const REDISP      = 1 << 9;
    }
}

/// Why the session ended, for the access log. One letter each, in the
/// classic two-character termination code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TermError {
    #[default]
    None,
    /// Client closed or reset first.
    ClientAbort,
    /// Client-side timeout.
    ClientTimeout,
    /// Server closed or reset first.
    ServerAbort,
    /// Server-side timeout.
    ServerTimeout,
    /// The proxy refused or blocked the session.
    ProxyCond,
    /// Out of local resources (ports, descriptors, memory).
    Resource,
    Internal,
}

impl TermError {
    pub fn code(self) -> char {
        match self {
            TermError::None => '-',
            TermError::ClientAbort => 'C',
            TermError::ClientTimeout => 'c',
            TermError::ServerAbort => 'S',
            TermError::ServerTimeout => 's',
            TermError::ProxyCond => 'P',
            TermError::Resource => 'R',
            TermError::Internal => 'I',
        }
    }
}

/// What stage the session had reached when it ended.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FinishStage {
    #[default]
    None,
    Request,
    Queue,
    Connect,
    Headers,
    Data,
    Last,
}

impl FinishStage {
    pub fn code(self) -> char {
        match self {
            FinishStage::None => '-',
            FinishStage::Request => 'R',
            FinishStage::Queue => 'Q',
            FinishStage::Connect => 'C',
            FinishStage::Headers => 'H',
            FinishStage::Data => 'D',
            FinishStage::Last => 'L',
        }
    }
}

/// Timing and volume record kept for the access log.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionLogs {
    pub accept: Ticks,
    pub t_queue: Option<Duration>,
    pub t_connect: Option<Duration>,
    pub t_data: Option<Duration>,
    pub t_close: Option<Duration>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub prx_queue_size: u32,
    pub srv_queue_size: u32,
}

/// A pending sticky-table store, written out once the server is known
/// (request side) or confirmed (response side).
#[derive(Clone, Debug)]
pub struct StoreSlot {
    pub table_owner: ProxyId,
    pub key: StickKey,
    pub sid: Option<u16>,
    pub from_response: bool,
}

/// One unit of user traffic: two buffers, two stream interfaces, and
/// everything the FSM needs to drive them.
#[derive(Debug)]
pub struct Session {
    pub slot: SlotId,
    pub uniq_id: u64,
    pub listener: ListenerId,
    pub fe: ProxyId,
    pub be: ProxyId,
    pub srv: Option<ServerRef>,
    pub prev_srv: Option<ServerRef>,
    /// Server currently holding a connection slot for us.
    pub srv_conn: Option<ServerRef>,

    pub cli_addr: SocketAddr,
    pub frt_addr: SocketAddr,

    pub flags: SessFlags,
    pub term: TermError,
    pub finst: FinishStage,

    pub req: Buffer,
    pub rep: Buffer,
    /// `si[0]` faces the client, `si[1]` the server.
    pub si: [StreamInterface; 2],

    pub conn_retries: i32,
    pub pend_pos: Option<PendPos>,
    pub store: Vec<StoreSlot>,
    pub http: Option<HttpTxn>,

    pub logs: SessionLogs,
}

impl Session {
    /// The interface and its (input, output) buffers for one side.
    /// Client: in=req, out=rep. Server: in=rep, out=req.
    pub fn si_bufs(&mut self, side: Side) -> (&mut StreamInterface, &mut Buffer, &mut Buffer) {
        let (cli, srv) = self.si.split_at_mut(1);
        match side {
            Side::Client => (&mut cli[0], &mut self.req, &mut self.rep),
            Side::Server => (&mut srv[0], &mut self.rep, &mut self.req),
        }
    }

    pub fn note_term(&mut self, err: TermError) {
        if self.term == TermError::None {
            self.term = err;
        }
    }

    pub fn note_finst(&mut self, fin: FinishStage) {
        if self.finst == FinishStage::None {
            self.finst = fin;
        }
    }

    /// The classic two-character termination code.
    pub fn term_code(&self) -> [char; 2] {
        [self.term.code(), self.finst.code()]
    }

    pub fn sample_ctx<'a>(&'a self, proxies: &'a ProxySet, partial: bool) -> SampleCtx<'a> {
        let listener = proxies.listener(self.listener);
        SampleCtx {
            cli: self.cli_addr,
            frt: self.frt_addr,
            req: Some(&self.req),
            http: self.http.as_ref(),
            fe_id: self.fe.0,
            so_id: listener.id.0,
            so_conns: u64::from(listener.nbconn),
            partial,
        }
    }

    /// Sets the default termination stage when no analyser classified
    /// the end, and counts a failed request if the server side never
    /// got as far as a connection request.
    pub fn set_term_stage(&mut self, proxies: &mut ProxySet) {
        if self.finst != FinishStage::None {
            return;
        }
        let srv_state = self.si[1].state;
        self.finst = if srv_state < SiState::Req {
            proxies.proxy_mut(self.fe).counters.failed_req += 1;
            proxies.listener_mut(self.listener).counters.failed_req += 1;
            FinishStage::Request
        } else if srv_state == SiState::Que {
            FinishStage::Queue
        } else if srv_state < SiState::Est {
            FinishStage::Connect
        } else if srv_state == SiState::Est || self.si[1].prev_state == SiState::Est {
            FinishStage::Data
        } else {
            FinishStage::Last
        };
    }

    /// Default mapping from the server interface's typed error to the
    /// session termination code. Installed behaviour for every plain
    /// TCP/HTTP session.
    pub fn srv_error(&mut self) {
        let (err, fin) = match self.si[1].err_type {
            SiErr::QueueAbrt => (TermError::ClientAbort, FinishStage::Queue),
            SiErr::ConnAbrt => (TermError::ClientAbort, FinishStage::Connect),
            SiErr::QueueTo => (TermError::ServerTimeout, FinishStage::Queue),
            SiErr::QueueErr => (TermError::ServerAbort, FinishStage::Queue),
            SiErr::ConnTo => (TermError::ServerTimeout, FinishStage::Connect),
            SiErr::ConnErr => (TermError::ServerAbort, FinishStage::Connect),
            SiErr::ConnOther | SiErr::None => (TermError::Internal, FinishStage::Connect),
        };
        self.note_term(err);
        self.note_finst(fin);
    }

    /// Flushes byte counters accumulated since the previous flush into
    /// the frontend/backend/server/listener counters.
    pub fn process_counters(&mut self, proxies: &mut ProxySet) {
        let bytes_in = self.req.total() - self.logs.bytes_in;
        self.logs.bytes_in = self.req.total();
        if bytes_in > 0 {
            proxies.proxy_mut(self.fe).counters.bytes_in += bytes_in;
            if self.be != self.fe {
                proxies.proxy_mut(self.be).counters.bytes_in += bytes_in;
            }
            if let Some(sref) = self.srv {
                proxies.server_mut(sref).counters.bytes_in += bytes_in;
            }
            proxies.listener_mut(self.listener).counters.bytes_in += bytes_in;
        }

        let bytes_out = self.rep.total() - self.logs.bytes_out;
        self.logs.bytes_out = self.rep.total();
        if bytes_out > 0 {
            proxies.proxy_mut(self.fe).counters.bytes_out += bytes_out;
            if self.be != self.fe {
                proxies.proxy_mut(self.be).counters.bytes_out += bytes_out;
            }
            if let Some(sref) = self.srv {
                proxies.server_mut(sref).counters.bytes_out += bytes_out;
            }
            proxies.listener_mut(self.listener).counters.bytes_out += bytes_out;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn term_codes_render() {
        let mut sess = test_session();
        sess.note_term(TermError::ProxyCond);
        sess.note_finst(FinishStage::Request);
        assert_eq!(sess.term_code(), ['P', 'R']);
        // first cause wins
        sess.note_term(TermError::ServerTimeout);
        assert_eq!(sess.term_code(), ['P', 'R']);
    }

    #[test]
    fn srv_error_maps_queue_timeout() {
        let mut sess = test_session();
        sess.si[1].err_type = SiErr::QueueTo;
        sess.srv_error();
        assert_eq!(sess.term_code(), ['s', 'Q']);
    }

    pub(crate) fn test_session() -> Session {
        Session {
            slot: SlotId(0),
            uniq_id: 0,
            listener: ListenerId(0),
            fe: ProxyId(0),
            be: ProxyId(0),
            srv: None,
            prev_srv: None,
            srv_conn: None,
            cli_addr: "127.0.0.1:40000".parse().unwrap(),
            frt_addr: "127.0.0.1:8080".parse().unwrap(),
            flags: SessFlags::default(),
            term: TermError::None,
            finst: FinishStage::None,
            req: Buffer::new(1024),
            rep: Buffer::new(1024),
            si: [StreamInterface::new_est(crate::interface::Endpoint::None), StreamInterface::new_ini()],
            conn_retries: 3,
            pend_pos: None,
            store: Vec::new(),
            http: None,
            logs: SessionLogs::default(),
        }
    }
}
