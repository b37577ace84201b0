//! Chrome DevTools Protocol plumbing: target discovery, the RPC channel,
//! cross-context evaluation, and the direct/tunneled transport pair.

mod channel;
mod eval;
mod targets;
mod transport;

pub use channel::{CdpChannel, CdpEvent, ChannelError};
pub use eval::{ContextEvaluator, ContextTracker, EvalOutcome, SuccessShape, eval_across_contexts};
pub use targets::{Target, TargetResolver, TargetRole};
pub use transport::{
    DirectTransport, EvalOptions, EvalTransport, TransportError, TunneledTransport,
};
