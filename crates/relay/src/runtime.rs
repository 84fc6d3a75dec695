use relay_utils::BackRefs;

use crate::proxy::ServerRef;

/// Engine tunables.
#[derive(Clone, Copy, Debug)]
pub struct Tune {
    /// Bound on analyser loop passes and per-wake accept batches.
    pub maxpollevents: u32,
    pub bufsize: usize,
    pub use_splice: bool,
    pub maxpipes: usize,
    pub client_sndbuf: Option<usize>,
    pub client_rcvbuf: Option<usize>,
    pub server_sndbuf: Option<usize>,
    pub server_rcvbuf: Option<usize>,
}

impl Default for Tune {
    fn default() -> Self {
        Self {
            maxpollevents: 200,
            bufsize: 16 * 1024,
            use_splice: cfg!(target_os = "linux"),
            maxpipes: 256,
            client_sndbuf: None,
            client_rcvbuf: None,
            server_sndbuf: None,
            server_rcvbuf: None,
        }
    }
}

/// Process-wide mutable state, threaded explicitly through the
/// components that need it. Only the engine thread ever touches it.
#[derive(Debug)]
pub struct Runtime {
    pub actconn: u32,
    pub totalconn: u64,
    pub maxconn: u32,
    pub tune: Tune,
    /// Observer cursors over the session arena.
    pub backrefs: BackRefs,
    /// Servers that may promote a queued session; drained by the
    /// engine after each dispatch.
    pub pending_dequeues: Vec<ServerRef>,
    #[cfg(target_os = "linux")]
    pub pipes: relay_net::PipePool,
}

impl Runtime {
    pub fn new(maxconn: u32, tune: Tune) -> Self {
        Self {
            actconn: 0,
            totalconn: 0,
            maxconn,
            #[cfg(target_os = "linux")]
            pipes: relay_net::PipePool::new(tune.maxpipes),
            tune,
            backrefs: BackRefs::default(),
            pending_dequeues: Vec::new(),
        }
    }

    /// Whether splicing may be engaged right now.
    pub fn splice_available(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.tune.use_splice && !self.pipes.exhausted()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}
