//! Transport collaborator interface.
//!
//! The core treats "send a request" and "receive typed bytes back" as opaque
//! operations: wire encoding, security negotiation, and interface tables all
//! live behind this trait. A transport hands back a [`RawHandle`] per issued
//! operation and reports completed handles when polled by the driver; the
//! core sequences and owns, nothing more.

use bytes::Bytes;

use crate::status::Status;

/// Opaque per-operation handle issued by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Identifies the remote service interface a connection binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: u32,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        ServiceDescriptor {
            name: name.into(),
            version,
        }
    }
}

/// External component performing the actual network work. All methods are
/// non-blocking: `send_*` initiates, completion is observed later via
/// [`Transport::poll_completions`], and `recv_*` collects the result of a
/// completed handle exactly once.
pub trait Transport {
    /// Initiate a connect to `binding` (`"<transport>:<endpoint>"`).
    fn send_connect(
        &mut self,
        binding: &str,
        credentials: &Bytes,
        service: &ServiceDescriptor,
    ) -> Result<RawHandle, Status>;

    /// Collect a completed connect: status plus the opaque pipe handle blob
    /// on success.
    fn recv_connect(&mut self, handle: RawHandle) -> (Status, Option<Bytes>);

    /// Initiate one request on a live pipe.
    fn send_call(&mut self, pipe: &Bytes, request: &Bytes) -> Result<RawHandle, Status>;

    /// Collect a completed call: status plus the raw response bytes.
    fn recv_call(&mut self, handle: RawHandle) -> (Status, Bytes);

    /// Tell the transport to discard the eventual result of `handle`; its
    /// owner was cancelled and a late completion will be ignored. Must
    /// tolerate handles it no longer knows about.
    fn abandon(&mut self, handle: RawHandle);

    /// Drain handles whose operations have completed since the last poll.
    fn poll_completions(&mut self, out: &mut Vec<RawHandle>);
}
