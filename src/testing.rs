//! Scripted in-memory transport for tests and examples.
//!
//! [`ScriptedTransport`] completes each issued operation after a configurable
//! number of simulated event-loop ticks, can be told to fail or refuse
//! connects and calls, and records what the client abandoned. Clones share
//! one script, so a test keeps a handle while the client owns another.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;

use crate::status::Status;
use crate::transport::{RawHandle, ServiceDescriptor, Transport};

enum InFlight {
    Connect { binding: String },
    Call { request: Bytes },
}

struct ScriptState {
    next_handle: u64,
    latency: u32,
    connect_status: Status,
    call_status: Status,
    refuse_connect: Option<Status>,
    refuse_call: Option<Status>,
    respond: Option<Box<dyn FnMut(&Bytes) -> Bytes>>,
    /// Issued handles counting down ticks until completion.
    pending: Vec<(RawHandle, u32)>,
    ready: VecDeque<RawHandle>,
    inflight: HashMap<RawHandle, InFlight>,
    abandoned: Vec<RawHandle>,
    connects_sent: usize,
    calls_sent: usize,
}

/// Shared-handle scripted transport. Default behavior: every operation
/// succeeds one tick after it is issued, and calls echo their request.
#[derive(Clone)]
pub struct ScriptedTransport {
    inner: Rc<RefCell<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport {
            inner: Rc::new(RefCell::new(ScriptState {
                next_handle: 1,
                latency: 1,
                connect_status: Status::OK,
                call_status: Status::OK,
                refuse_connect: None,
                refuse_call: None,
                respond: None,
                pending: Vec::new(),
                ready: VecDeque::new(),
                inflight: HashMap::new(),
                abandoned: Vec::new(),
                connects_sent: 0,
                calls_sent: 0,
            })),
        }
    }

    /// Completions take `ticks` simulated ticks instead of one.
    pub fn set_latency(&self, ticks: u32) {
        self.inner.borrow_mut().latency = ticks;
    }

    /// Connects complete with `status` instead of succeeding.
    pub fn fail_connects(&self, status: Status) {
        self.inner.borrow_mut().connect_status = status;
    }

    /// `send_connect` itself returns `status` (synchronous refusal).
    pub fn refuse_connects(&self, status: Status) {
        self.inner.borrow_mut().refuse_connect = Some(status);
    }

    /// Calls complete with `status` instead of succeeding.
    pub fn fail_calls(&self, status: Status) {
        self.inner.borrow_mut().call_status = status;
    }

    /// `send_call` itself returns `status` (synchronous refusal).
    pub fn refuse_calls(&self, status: Status) {
        self.inner.borrow_mut().refuse_call = Some(status);
    }

    /// Replace the default echo with a request→response function.
    pub fn respond_with(&self, f: impl FnMut(&Bytes) -> Bytes + 'static) {
        self.inner.borrow_mut().respond = Some(Box::new(f));
    }

    /// Advance one simulated event-loop tick: operations whose latency has
    /// elapsed become pollable completions.
    pub fn tick(&self) {
        let mut state = self.inner.borrow_mut();
        let mut due = Vec::new();
        state.pending.retain_mut(|(handle, ticks)| {
            if *ticks <= 1 {
                due.push(*handle);
                false
            } else {
                *ticks -= 1;
                true
            }
        });
        state.ready.extend(due);
    }

    /// Make an arbitrary handle pollable, as a misbehaving or late
    /// transport would.
    pub fn inject_completion(&self, handle: RawHandle) {
        self.inner.borrow_mut().ready.push_back(handle);
    }

    /// Handles the client told us to abandon.
    pub fn abandoned(&self) -> Vec<RawHandle> {
        self.inner.borrow().abandoned.clone()
    }

    /// Operations issued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn connects_sent(&self) -> usize {
        self.inner.borrow().connects_sent
    }

    pub fn calls_sent(&self) -> usize {
        self.inner.borrow().calls_sent
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn send_connect(
        &mut self,
        binding: &str,
        _credentials: &Bytes,
        _service: &ServiceDescriptor,
    ) -> Result<RawHandle, Status> {
        let mut state = self.inner.borrow_mut();
        if let Some(status) = state.refuse_connect {
            return Err(status);
        }
        state.connects_sent += 1;
        let handle = RawHandle(state.next_handle);
        state.next_handle += 1;
        state.inflight.insert(
            handle,
            InFlight::Connect {
                binding: binding.to_string(),
            },
        );
        let latency = state.latency;
        state.pending.push((handle, latency));
        Ok(handle)
    }

    fn recv_connect(&mut self, handle: RawHandle) -> (Status, Option<Bytes>) {
        let mut state = self.inner.borrow_mut();
        match state.inflight.remove(&handle) {
            Some(InFlight::Connect { binding }) => {
                if state.connect_status.is_ok() {
                    (Status::OK, Some(Bytes::from(format!("pipe:{binding}"))))
                } else {
                    (state.connect_status, None)
                }
            }
            _ => (Status::UNSUCCESSFUL, None),
        }
    }

    fn send_call(&mut self, _pipe: &Bytes, request: &Bytes) -> Result<RawHandle, Status> {
        let mut state = self.inner.borrow_mut();
        if let Some(status) = state.refuse_call {
            return Err(status);
        }
        state.calls_sent += 1;
        let handle = RawHandle(state.next_handle);
        state.next_handle += 1;
        state.inflight.insert(
            handle,
            InFlight::Call {
                request: request.clone(),
            },
        );
        let latency = state.latency;
        state.pending.push((handle, latency));
        Ok(handle)
    }

    fn recv_call(&mut self, handle: RawHandle) -> (Status, Bytes) {
        let mut state = self.inner.borrow_mut();
        match state.inflight.remove(&handle) {
            Some(InFlight::Call { request }) => {
                if !state.call_status.is_ok() {
                    return (state.call_status, Bytes::new());
                }
                let response = match state.respond.as_mut() {
                    Some(f) => f(&request),
                    None => request,
                };
                (Status::OK, response)
            }
            _ => (Status::UNSUCCESSFUL, Bytes::new()),
        }
    }

    fn abandon(&mut self, handle: RawHandle) {
        let mut state = self.inner.borrow_mut();
        state.pending.retain(|(h, _)| *h != handle);
        state.inflight.remove(&handle);
        state.abandoned.push(handle);
    }

    fn poll_completions(&mut self, out: &mut Vec<RawHandle>) {
        let mut state = self.inner.borrow_mut();
        out.extend(state.ready.drain(..));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_latency_ticks() {
        let script = ScriptedTransport::new();
        script.set_latency(2);
        let mut t = script.clone();
        let handle = t
            .send_connect("tcp:host", &Bytes::new(), &ServiceDescriptor::new("svc", 1))
            .unwrap();

        let mut out = Vec::new();
        script.tick();
        t.poll_completions(&mut out);
        assert!(out.is_empty());

        script.tick();
        t.poll_completions(&mut out);
        assert_eq!(out, vec![handle]);
    }

    #[test]
    fn abandon_retracts_pending_work() {
        let script = ScriptedTransport::new();
        let mut t = script.clone();
        let handle = t
            .send_connect("tcp:host", &Bytes::new(), &ServiceDescriptor::new("svc", 1))
            .unwrap();
        t.abandon(handle);

        script.tick();
        let mut out = Vec::new();
        t.poll_completions(&mut out);
        assert!(out.is_empty());
        assert_eq!(script.abandoned(), vec![handle]);
    }

    #[test]
    fn echo_by_default() {
        let script = ScriptedTransport::new();
        let mut t = script.clone();
        let pipe = Bytes::from_static(b"pipe:tcp:host");
        let handle = t.send_call(&pipe, &Bytes::from_static(b"ping")).unwrap();
        script.tick();
        let (status, response) = t.recv_call(handle);
        assert!(status.is_ok());
        assert_eq!(&response[..], b"ping");
    }
}
