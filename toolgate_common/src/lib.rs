//! Shared building blocks for the toolgate gateway.
//!
//! - [`protocol`]: request/reply envelopes spoken with provider subprocesses.
//! - [`codec`]: newline framing that survives malformed and partial output.
//! - [`lifecycle`]: the watch-based provider lifecycle state machine.

pub mod codec;
pub mod lifecycle;
pub mod protocol;

pub use codec::{LineCodec, LineFrame};
pub use lifecycle::{Lifecycle, ProviderState};
pub use protocol::{Reply, ReplyPayload, Request, RpcError};
