//! Call dispatch: one typed request/response exchange over a live pipe.
//!
//! Each call owns its own op and never outlives the connection (the
//! connection node — or a caller-supplied arena node — is the memory-owning
//! ancestor of the call's result). Calls issued concurrently on one
//! connection are independent; ordering, if any, comes from the transport.

use bytes::Bytes;

use crate::arena::NodeId;
use crate::client::{raw_payload, Client};
use crate::connection::{ConnState, ConnToken};
use crate::error::Error;
use crate::metrics;
use crate::observer::Event;
use crate::op::OpId;

/// Resolved payload of a call op: the response bytes plus the arena node the
/// response is anchored to, so its lifetime follows the target arena.
#[derive(Debug)]
pub struct CallResponse {
    pub node: NodeId,
    pub data: Bytes,
}

impl Client {
    /// Issue one request on a connected connection.
    ///
    /// The result is anchored at `target_arena` when supplied (letting the
    /// caller control result lifetime), otherwise at the connection's own
    /// arena. Fails immediately with [`Error::NotConnected`] — without
    /// allocating an op — unless the connection is `Connected`. Transport
    /// failures surface through the op as [`Error::Call`]; the core never
    /// retries, since call idempotence is payload-specific and unknown here.
    pub fn call(
        &mut self,
        conn: ConnToken,
        request: Bytes,
        target_arena: Option<NodeId>,
    ) -> Result<OpId, Error> {
        let (conn_node, pipe_node) = match self.conns.get(conn) {
            Some(slot) if slot.state == ConnState::Connected => (
                slot.node.ok_or(Error::NotConnected)?,
                slot.pipe.ok_or(Error::NotConnected)?,
            ),
            _ => return Err(Error::NotConnected),
        };
        let anchor = match target_arena {
            Some(node) => {
                if !self.arena.is_live(node) {
                    return Err(Error::InvalidNode);
                }
                node
            }
            None => conn_node,
        };
        let pipe = self.arena.payload_of::<Bytes>(pipe_node, "pipe")?.clone();

        let outer = self.ops.create(anchor)?;
        metrics::CALLS_DISPATCHED.increment();
        self.observer.on_event(Event::CallDispatched {
            conn,
            bytes: request.len(),
        });

        let raw = match self.transport.send_call(&pipe, &request) {
            Ok(raw) => raw,
            Err(status) => {
                self.report_call_failure(status);
                let _ = self.ops.fail(outer, Error::Call(status));
                return Ok(outer);
            }
        };
        let inner = match self.ops.create(anchor) {
            Ok(op) => op,
            Err(err) => {
                self.transport.abandon(raw);
                let _ = self.ops.fail(outer, err);
                return Ok(outer);
            }
        };
        self.ops.set_raw(inner, raw);
        self.wiring.insert(raw, inner);

        self.continue_with(outer, inner, move |client, payload| {
            let raw = raw_payload(payload)?;
            let (status, response) = client.transport.recv_call(raw);
            if !status.is_ok() {
                client.report_call_failure(status);
                let _ = client.ops.fail(outer, Error::Call(status));
                return Ok(());
            }
            let node = client.arena.alloc_tagged(
                Some(anchor),
                Some("call_response"),
                response.len(),
                Some(Box::new(response.clone())),
            )?;
            metrics::CALLS_COMPLETED.increment();
            client.observer.on_event(Event::CallCompleted {
                bytes: response.len(),
            });
            client
                .ops
                .complete(outer, Box::new(CallResponse { node, data: response }))?;
            Ok(())
        })?;
        Ok(outer)
    }

    fn report_call_failure(&mut self, status: crate::status::Status) {
        metrics::CALLS_FAILED.increment();
        let name = self.mapper.name(status);
        self.observer.on_event(Event::CallFailed { status, name });
    }
}
