//! Injected trace observer.
//!
//! Diagnostics are delivered to an observer supplied at build time rather
//! than a process-global logger, so embedders route events into whatever
//! logging stack hosts the client.

use std::borrow::Cow;

use crate::connection::ConnToken;
use crate::op::OpId;
use crate::status::Status;
use crate::transport::RawHandle;

/// A structured trace event emitted by the driver.
#[derive(Debug)]
pub enum Event<'a> {
    /// A connect sequence was initiated.
    ConnectInitiated { binding: &'a str, service: &'a str },
    /// The two-phase connect finished and the connection is live.
    ConnectEstablished { conn: ConnToken },
    /// Connect failed; `name` is the symbolic status for display.
    ConnectFailed {
        status: Status,
        name: Cow<'static, str>,
    },
    /// A call was handed to the transport.
    CallDispatched { conn: ConnToken, bytes: usize },
    /// A call completed successfully.
    CallCompleted { bytes: usize },
    /// A call failed with a transport status.
    CallFailed {
        status: Status,
        name: Cow<'static, str>,
    },
    /// A pending op was cancelled by arena teardown.
    OpCancelled { op: OpId },
    /// A completion arrived for a handle nothing is wired to.
    StaleCompletionDropped { handle: RawHandle },
    /// A connection was closed and its arena hierarchy released.
    ConnectionClosed { conn: ConnToken, blocks_freed: usize },
}

/// Observer interface. Implementations must not call back into the client.
pub trait Observer {
    fn on_event(&self, event: Event<'_>);
}

/// Discards all events (the default).
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: Event<'_>) {}
}
