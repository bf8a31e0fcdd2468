use thiserror::Error;

use crate::status::Status;

/// Errors surfaced by the chainline core.
///
/// Remote/transport failures (`Connect`, `Call`) carry the raw status and are
/// never retried internally. `DoubleCompletion` and `UseAfterCancel` indicate
/// a violated protocol invariant on the caller's side and are reported, not
/// tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Arena or op pool exhausted.
    #[error("out of memory: block pool exhausted")]
    OutOfMemory,
    /// A defensive cast failed: the node's recorded tag disagrees.
    #[error("type mismatch: have {have}, wanted {wanted}")]
    TypeMismatch {
        have: &'static str,
        wanted: &'static str,
    },
    /// The transport reported a non-success status while connecting.
    #[error("connect failed: {0}")]
    Connect(Status),
    /// The transport reported a non-success status for a call.
    #[error("call failed: {0}")]
    Call(Status),
    /// A call was issued on a connection that is not in the Connected state.
    #[error("not connected")]
    NotConnected,
    /// `complete`/`fail` invoked twice on the same operation.
    #[error("operation completed twice")]
    DoubleCompletion,
    /// An operation handle was used after its slot was released.
    #[error("operation used after cancellation")]
    UseAfterCancel,
    /// Invalid or stale arena node handle.
    #[error("invalid arena node")]
    InvalidNode,
    /// No free connection slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
}
