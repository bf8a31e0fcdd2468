//! Connection slots and the two-phase connect state machine.
//!
//! A connection owns exactly one pipe handle at a time, anchored in its own
//! arena node. Connect is sequenced as: build credentials in a scratch child
//! arena → issue the transport connect → await completion → collect the pipe
//! blob → reparent it from the scratch arena into the connection's long-lived
//! arena → resolve the caller's op with a [`ConnToken`]. Close frees the
//! connection node; everything beneath it (pipe, credentials, outstanding
//! call results) cascades.

use crate::arena::NodeId;
use crate::client::{raw_payload, Client};
use crate::error::Error;
use crate::metrics;
use crate::observer::Event;
use crate::op::OpId;
use crate::status::Status;
use crate::transport::{RawHandle, ServiceDescriptor};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Opaque connection handle. Stale tokens (outliving slot reuse) resolve to
/// nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

pub(crate) struct ConnectionSlot {
    pub(crate) generation: u32,
    pub(crate) state: ConnState,
    pub(crate) node: Option<NodeId>,
    pub(crate) pipe: Option<NodeId>,
}

/// Manages connection slots. Retired slots keep their terminal state visible
/// to old tokens until the slot is reused (generation bump on reallocation).
pub(crate) struct ConnectionTable {
    slots: Vec<ConnectionSlot>,
    recycle: Vec<u32>,
    max: u32,
}

impl ConnectionTable {
    pub(crate) fn new(max_connections: u32) -> Self {
        ConnectionTable {
            slots: Vec::new(),
            recycle: Vec::new(),
            max: max_connections,
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<ConnToken, Error> {
        if let Some(index) = self.recycle.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.state = ConnState::Disconnected;
            slot.node = None;
            slot.pipe = None;
            return Ok(ConnToken {
                index,
                generation: slot.generation,
            });
        }
        if self.slots.len() >= self.max as usize {
            return Err(Error::ConnectionLimitReached);
        }
        self.slots.push(ConnectionSlot {
            generation: 0,
            state: ConnState::Disconnected,
            node: None,
            pipe: None,
        });
        Ok(ConnToken {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        })
    }

    pub(crate) fn get(&self, token: ConnToken) -> Option<&ConnectionSlot> {
        self.slots
            .get(token.index as usize)
            .filter(|s| s.generation == token.generation)
    }

    pub(crate) fn get_mut(&mut self, token: ConnToken) -> Option<&mut ConnectionSlot> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|s| s.generation == token.generation)
    }

    /// Park the slot in a terminal state and queue it for reuse. The
    /// generation is bumped at reallocation so old tokens still observe the
    /// terminal state until then.
    pub(crate) fn retire(&mut self, index: u32, state: ConnState) {
        debug_assert!(matches!(state, ConnState::Disconnected | ConnState::Closed));
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.state = state;
            slot.node = None;
            slot.pipe = None;
            self.recycle.push(index);
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, ConnState::Connecting | ConnState::Connected))
            .count()
    }
}

impl Client {
    /// Open a connection to `endpoint` over `proto` and bind it to `service`.
    ///
    /// Returns immediately with the op that will resolve to a [`ConnToken`]
    /// (payload type `ConnToken`) once the two-phase connect finishes. All
    /// failures after this returns — credential building, transport refusal,
    /// the remote rejecting the bind — surface through that op, never as a
    /// later panic.
    pub fn connect(
        &mut self,
        proto: &str,
        endpoint: &str,
        credentials: Option<&str>,
        service: &ServiceDescriptor,
    ) -> Result<OpId, Error> {
        let token = self.conns.allocate()?;
        let conn_node = match self.arena.alloc_tagged(None, Some("connection"), 0, None) {
            Ok(node) => node,
            Err(err) => {
                self.conns.retire(token.index, ConnState::Disconnected);
                return Err(err);
            }
        };
        let outer = match self.ops.create(conn_node) {
            Ok(op) => op,
            Err(err) => {
                self.conns.retire(token.index, ConnState::Disconnected);
                self.arena.free(conn_node);
                return Err(err);
            }
        };
        if let Some(slot) = self.conns.get_mut(token) {
            slot.node = Some(conn_node);
            slot.state = ConnState::Connecting;
        }
        metrics::CONNECTIONS_ACTIVE.increment();
        metrics::CONNECTS_INITIATED.increment();

        let binding = format!("{proto}:{endpoint}");
        self.observer.on_event(Event::ConnectInitiated {
            binding: &binding,
            service: &service.name,
        });

        let blob = match self.creds.build(credentials.unwrap_or("")) {
            Ok(blob) => blob,
            Err(status) => {
                self.abort_connect(outer, token, conn_node, None, Error::Connect(status));
                return Ok(outer);
            }
        };
        let scratch = match self.arena.alloc_tagged(Some(conn_node), Some("scratch"), 0, None) {
            Ok(node) => node,
            Err(err) => {
                self.abort_connect(outer, token, conn_node, None, err);
                return Ok(outer);
            }
        };
        if let Err(err) = self.arena.alloc_tagged(
            Some(scratch),
            Some("credentials"),
            blob.len(),
            Some(Box::new(blob.clone())),
        ) {
            self.abort_connect(outer, token, conn_node, None, err);
            return Ok(outer);
        }

        let raw = match self.transport.send_connect(&binding, &blob, service) {
            Ok(raw) => raw,
            Err(status) => {
                self.abort_connect(outer, token, conn_node, None, Error::Connect(status));
                return Ok(outer);
            }
        };
        let inner = match self.ops.create(scratch) {
            Ok(op) => op,
            Err(err) => {
                self.abort_connect(outer, token, conn_node, Some(raw), err);
                return Ok(outer);
            }
        };
        self.ops.set_raw(inner, raw);
        self.wiring.insert(raw, inner);

        self.continue_with(outer, inner, move |client, payload| {
            let raw = raw_payload(payload)?;
            let (status, pipe) = client.transport.recv_connect(raw);
            if !status.is_ok() {
                client.abort_connect(outer, token, conn_node, Some(raw), Error::Connect(status));
                return Ok(());
            }
            let Some(blob) = pipe else {
                client.abort_connect(
                    outer,
                    token,
                    conn_node,
                    Some(raw),
                    Error::Connect(Status::UNSUCCESSFUL),
                );
                return Ok(());
            };
            let pipe_node = match client.arena.alloc_tagged(
                Some(scratch),
                Some("pipe"),
                blob.len(),
                Some(Box::new(blob)),
            ) {
                Ok(node) => node,
                Err(err) => {
                    client.abort_connect(outer, token, conn_node, Some(raw), err);
                    return Ok(());
                }
            };
            // Hand the result off from the scratch context to the long-lived
            // connection arena before the scratch context is torn down.
            client.arena.reparent(pipe_node, conn_node)?;
            client.teardown(scratch);
            if let Some(slot) = client.conns.get_mut(token) {
                slot.state = ConnState::Connected;
                slot.pipe = Some(pipe_node);
            }
            metrics::CONNECTS_ESTABLISHED.increment();
            client.observer.on_event(Event::ConnectEstablished { conn: token });
            client.ops.complete(outer, Box::new(token))?;
            Ok(())
        })?;
        Ok(outer)
    }

    /// Tear down a failed connect attempt: notify the transport first, then
    /// fail the caller's op, then release the arena hierarchy and the slot.
    fn abort_connect(
        &mut self,
        outer: OpId,
        token: ConnToken,
        conn_node: NodeId,
        raw: Option<RawHandle>,
        err: Error,
    ) {
        if let Some(raw) = raw {
            self.wiring.remove(&raw);
            self.transport.abandon(raw);
        }
        let status = match &err {
            Error::Connect(status) => *status,
            Error::OutOfMemory => Status::NO_MEMORY,
            _ => Status::UNSUCCESSFUL,
        };
        let name = self.mapper.name(status);
        self.observer.on_event(Event::ConnectFailed { status, name });
        metrics::CONNECTS_FAILED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        // Fail before freeing: the op is anchored under the connection node
        // and a pending op would otherwise be cancelled by the teardown.
        let _ = self.ops.fail(outer, err);
        self.conns.retire(token.index, ConnState::Disconnected);
        self.teardown(conn_node);
    }

    /// Close a connection, releasing the arena hierarchy rooted at it —
    /// including the pipe handle, credentials, and any outstanding call ops
    /// anchored beneath it. Closing an already-closed or stale connection is
    /// a no-op. Returns the number of arena blocks freed.
    pub fn close(&mut self, conn: ConnToken) -> usize {
        let node = match self.conns.get(conn) {
            Some(slot) if matches!(slot.state, ConnState::Connecting | ConnState::Connected) => {
                slot.node
            }
            _ => return 0,
        };
        self.conns.retire(conn.index, ConnState::Closed);
        metrics::CONNECTIONS_ACTIVE.decrement();
        let freed = match node {
            Some(node) => self.teardown(node),
            None => 0,
        };
        self.observer.on_event(Event::ConnectionClosed {
            conn,
            blocks_freed: freed,
        });
        freed
    }

    /// Current state of a connection. Stale tokens report `Closed`.
    pub fn connection_state(&self, conn: ConnToken) -> ConnState {
        self.conns
            .get(conn)
            .map(|slot| slot.state)
            .unwrap_or(ConnState::Closed)
    }

    /// Connections currently connecting or connected.
    pub fn active_connections(&self) -> usize {
        self.conns.active_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_retire_slots() {
        let mut table = ConnectionTable::new(2);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_eq!(table.allocate(), Err(Error::ConnectionLimitReached));

        table.get_mut(a).unwrap().state = ConnState::Connected;
        table.get_mut(b).unwrap().state = ConnState::Connecting;
        assert_eq!(table.active_count(), 2);

        table.retire(a.index, ConnState::Closed);
        assert_eq!(table.active_count(), 1);
        // Old token still observes the terminal state.
        assert_eq!(table.get(a).unwrap().state, ConnState::Closed);
    }

    #[test]
    fn reused_slot_invalidates_old_token() {
        let mut table = ConnectionTable::new(1);
        let a = table.allocate().unwrap();
        table.retire(a.index, ConnState::Closed);
        let b = table.allocate().unwrap();
        assert_eq!(a.index, b.index);
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }
}
