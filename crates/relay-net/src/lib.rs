mod connect;
mod listener;
mod source;
mod stream;

#[cfg(target_os = "linux")]
mod splice;

pub use connect::{connect_outcome, connect_server, ConnectError, ConnectTarget};
pub use listener::{bind_listener, BindError, ListenerOpts};
pub use source::PortRange;
pub use stream::{
    prepare_accepted, set_socket_buf_size, sock_read, sock_reset, sock_shutw, sock_write,
    ReadOutcome, StreamOpts, WriteOutcome,
};

#[cfg(target_os = "linux")]
pub use splice::{Pipe, PipePool, SpliceOutcome};
