//! chainline — continuation-chained async RPC client core on a hierarchical
//! reference-counted arena.
//!
//! chainline sequences a multi-step RPC protocol — connect to a remote
//! endpoint, then issue typed calls over the resulting pipe — as flat chains
//! of single-fire asynchronous operations, without blocking the driving
//! thread. Every protocol object (connection, credentials, pipe handle, call
//! result) lives in one hierarchical [`arena`], so cancelling an in-flight
//! operation or closing a connection is a single mechanical rule: free the
//! owning node and everything beneath it cascades.
//!
//! The actual network work is an opaque [`Transport`] collaborator; the
//! embedding event loop drives the client by calling [`Client::pump`] on
//! readiness. The core never blocks, never polls, and never retries.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use bytes::Bytes;
//! use chainline::testing::ScriptedTransport;
//! use chainline::{CallResponse, Client, Config, ConnToken, ServiceDescriptor};
//!
//! fn main() -> Result<(), chainline::Error> {
//!     let script = ScriptedTransport::new();
//!     let mut client = Client::builder(Config::default())
//!         .transport(Box::new(script.clone()))
//!         .build()?;
//!
//!     let conn: Rc<RefCell<Option<ConnToken>>> = Rc::new(RefCell::new(None));
//!     let got = conn.clone();
//!     let op = client.connect(
//!         "tcp",
//!         "db01.example",
//!         Some("svc%secret"),
//!         &ServiceDescriptor::new("registry", 1),
//!     )?;
//!     client.on_complete(op, move |_, outcome| {
//!         if let Ok(payload) = outcome {
//!             if let Ok(token) = payload.downcast::<ConnToken>() {
//!                 *got.borrow_mut() = Some(*token);
//!             }
//!         }
//!     })?;
//!
//!     script.tick(); // the event loop reports transport readiness
//!     client.pump();
//!
//!     let conn = conn.borrow_mut().take().unwrap();
//!     let call = client.call(conn, Bytes::from_static(b"ping"), None)?;
//!     client.on_complete(call, |_, outcome| {
//!         if let Ok(payload) = outcome {
//!             if let Ok(response) = payload.downcast::<CallResponse>() {
//!                 println!("{} response bytes", response.data.len());
//!             }
//!         }
//!     })?;
//!     script.tick();
//!     client.pump();
//!
//!     client.close(conn);
//!     Ok(())
//! }
//! ```
//!
//! # Model
//!
//! - **Arena**: handle-based parent/child ownership with secondary reference
//!   edges; freeing cascades post-order, references defer physical release.
//! - **Ops**: created pending, one transition to done/failed/cancelled, one
//!   deferred callback on done/failed, zero on cancelled.
//! - **Connection**: `Disconnected → Connecting → Connected → Closed`; the
//!   connect result is built in a scratch arena and reparented into the
//!   connection's arena on success.
//! - **Calls**: independent ops over a connected pipe; results anchored to a
//!   caller-chosen arena node.
//!
//! Single-threaded by design: one reactor thread owns the [`Client`] and all
//! arena nodes beneath it. Cross-thread handoff must go through the
//! reactor's own dispatch.

pub mod arena;
pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod op;
pub mod status;
pub mod testing;
pub mod transport;

pub use arena::{Arena, NodeId};
pub use call::CallResponse;
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use connection::{ConnState, ConnToken};
pub use credentials::{CredentialsBuilder, PassthroughCredentials};
pub use error::Error;
pub use observer::{Event, NullObserver, Observer};
pub use op::{OpId, OpOutcome, OpPhase};
pub use status::{Status, StatusMapper, WellKnownStatusNames};
pub use transport::{RawHandle, ServiceDescriptor, Transport};
