//! Persistent CLI tunnel: wire protocol and server-side connection registry.

mod protocol;
mod server;

pub use protocol::{CliFrame, ServerFrame};
pub use server::{
    TUNNEL_CALL_TIMEOUT, TunnelEvents, TunnelHandle, TunnelRegistry, run_tunnel,
};
