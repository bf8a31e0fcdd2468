//! Asynchronous operation table: status, completion slot, single-fire
//! callbacks, cancellation.
//!
//! An [`OpId`] identifies one in-flight unit of work. Operations are created
//! `Pending` and make exactly one transition to `Done`, `Failed`, or
//! `Cancelled`. Completion never runs the callback reentrantly: `complete`
//! and `fail` only validate the transition and enqueue the op on a ready
//! queue; the driver drains the queue after each event batch, so chained
//! continuations run in strict order without stack growth.
//!
//! Every op is anchored to an arena node. Freeing that node (or an ancestor)
//! cancels the op: the callback is dropped and a later completion against the
//! cancelled slot is a silent no-op — the stale-completion defense. A handle
//! whose slot has been reused entirely reports `UseAfterCancel` instead.

use std::any::Any;
use std::collections::{HashSet, VecDeque};

use crate::arena::NodeId;
use crate::client::Client;
use crate::error::Error;
use crate::transport::RawHandle;

/// Stable handle to an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Observable lifecycle phase of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpPhase {
    Pending,
    Done,
    Failed,
    Cancelled,
}

/// What a completed op delivers to its callback: an opaque result payload on
/// success, the originating error on failure.
pub type OpOutcome = Result<Box<dyn Any>, Error>;

/// Completion callback. Set once, invoked at most once, on the thread
/// driving the event loop.
pub type OpCallback = Box<dyn FnOnce(&mut Client, OpOutcome)>;

struct OpSlot {
    generation: u32,
    live: bool,
    phase: OpPhase,
    owner: NodeId,
    callback: Option<OpCallback>,
    outcome: Option<OpOutcome>,
    raw: Option<RawHandle>,
}

pub(crate) struct OpTable {
    slots: Vec<OpSlot>,
    free_list: Vec<u32>,
    /// Cancelled slots kept alive so late completions no-op instead of
    /// hitting a reused slot. Reclaimed lazily under pool pressure.
    cancelled: Vec<u32>,
    ready: VecDeque<OpId>,
    max_ops: u32,
}

impl OpTable {
    pub(crate) fn new(max_ops: u32) -> Self {
        OpTable {
            slots: Vec::new(),
            free_list: Vec::new(),
            cancelled: Vec::new(),
            ready: VecDeque::new(),
            max_ops,
        }
    }

    fn slot(&self, op: OpId) -> Option<&OpSlot> {
        self.slots
            .get(op.index as usize)
            .filter(|s| s.live && s.generation == op.generation)
    }

    fn slot_mut(&mut self, op: OpId) -> Option<&mut OpSlot> {
        self.slots
            .get_mut(op.index as usize)
            .filter(|s| s.live && s.generation == op.generation)
    }

    /// Create a new pending op anchored at `owner`.
    pub(crate) fn create(&mut self, owner: NodeId) -> Result<OpId, Error> {
        let index = if let Some(idx) = self.free_list.pop() {
            idx
        } else if self.slots.len() < self.max_ops as usize {
            self.slots.push(OpSlot {
                generation: 0,
                live: false,
                phase: OpPhase::Pending,
                owner,
                callback: None,
                outcome: None,
                raw: None,
            });
            (self.slots.len() - 1) as u32
        } else if let Some(idx) = self.cancelled.pop() {
            // Reclaim the oldest cancelled slot; its stale handles now report
            // UseAfterCancel rather than no-op.
            let slot = &mut self.slots[idx as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.live = false;
            idx
        } else {
            return Err(Error::OutOfMemory);
        };

        let slot = &mut self.slots[index as usize];
        slot.live = true;
        slot.phase = OpPhase::Pending;
        slot.owner = owner;
        slot.callback = None;
        slot.outcome = None;
        slot.raw = None;
        Ok(OpId {
            index,
            generation: slot.generation,
        })
    }

    /// Register the completion callback. Allowed while the op is live and not
    /// cancelled (a completion may already be queued but not yet drained).
    pub(crate) fn set_callback(&mut self, op: OpId, callback: OpCallback) -> Result<(), Error> {
        let slot = self.slot_mut(op).ok_or(Error::UseAfterCancel)?;
        if slot.phase == OpPhase::Cancelled {
            return Err(Error::UseAfterCancel);
        }
        debug_assert!(slot.callback.is_none(), "callback set twice on op");
        slot.callback = Some(callback);
        Ok(())
    }

    /// Record the transport handle wired to this op so cancellation can
    /// abandon it.
    pub(crate) fn set_raw(&mut self, op: OpId, raw: RawHandle) {
        if let Some(slot) = self.slot_mut(op) {
            slot.raw = Some(raw);
        }
    }

    pub(crate) fn phase(&self, op: OpId) -> Option<OpPhase> {
        self.slot(op).map(|s| s.phase)
    }

    /// `Pending → Done`. Returns `Ok(false)` (no-op) for a cancelled op,
    /// `DoubleCompletion` for a second transition, `UseAfterCancel` for a
    /// released slot.
    pub(crate) fn complete(&mut self, op: OpId, payload: Box<dyn Any>) -> Result<bool, Error> {
        self.transition(op, OpPhase::Done, Ok(payload))
    }

    /// `Pending → Failed`. Same transition rules as [`OpTable::complete`].
    pub(crate) fn fail(&mut self, op: OpId, error: Error) -> Result<bool, Error> {
        self.transition(op, OpPhase::Failed, Err(error))
    }

    fn transition(&mut self, op: OpId, phase: OpPhase, outcome: OpOutcome) -> Result<bool, Error> {
        let slot = self.slot_mut(op).ok_or(Error::UseAfterCancel)?;
        match slot.phase {
            OpPhase::Pending => {
                slot.phase = phase;
                slot.outcome = Some(outcome);
                self.ready.push_back(op);
                Ok(true)
            }
            OpPhase::Cancelled => Ok(false),
            OpPhase::Done | OpPhase::Failed => Err(Error::DoubleCompletion),
        }
    }

    /// Cancel every pending op anchored on one of `freed`. Callbacks are
    /// dropped (they will never fire); wired transport handles are returned
    /// so the driver can abandon them.
    pub(crate) fn cancel_for_nodes(&mut self, freed: &[NodeId]) -> Vec<(OpId, Option<RawHandle>)> {
        if freed.is_empty() {
            return Vec::new();
        }
        let doomed: HashSet<NodeId> = freed.iter().copied().collect();
        let mut cancelled = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.live && slot.phase == OpPhase::Pending && doomed.contains(&slot.owner) {
                slot.phase = OpPhase::Cancelled;
                slot.callback = None;
                slot.outcome = None;
                let raw = slot.raw.take();
                let id = OpId {
                    index: index as u32,
                    generation: slot.generation,
                };
                self.cancelled.push(index as u32);
                cancelled.push((id, raw));
            }
        }
        cancelled
    }

    /// Next op whose completion is queued for dispatch.
    pub(crate) fn next_ready(&mut self) -> Option<OpId> {
        self.ready.pop_front()
    }

    /// Take the callback and outcome of a ready op, releasing its slot. After
    /// this the handle is stale and any further use reports `UseAfterCancel`.
    pub(crate) fn take_ready(&mut self, op: OpId) -> Option<(Option<OpCallback>, OpOutcome)> {
        let slot = self.slot_mut(op)?;
        debug_assert!(matches!(slot.phase, OpPhase::Done | OpPhase::Failed));
        let callback = slot.callback.take();
        let outcome = slot.outcome.take()?;
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        let index = op.index;
        self.free_list.push(index);
        Some((callback, outcome))
    }

    /// Number of live, pending ops.
    pub(crate) fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.live && s.phase == OpPhase::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn anchor(arena: &mut Arena) -> NodeId {
        arena.alloc(None).unwrap()
    }

    #[test]
    fn single_transition_to_done() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(8);
        let op = ops.create(anchor(&mut arena)).unwrap();
        assert_eq!(ops.phase(op), Some(OpPhase::Pending));

        assert_eq!(ops.complete(op, Box::new(7u32)), Ok(true));
        assert_eq!(ops.phase(op), Some(OpPhase::Done));

        // DoubleCompletion is reported, not swallowed.
        assert_eq!(
            ops.fail(op, Error::NotConnected),
            Err(Error::DoubleCompletion)
        );
        assert_eq!(
            ops.complete(op, Box::new(8u32)),
            Err(Error::DoubleCompletion)
        );
    }

    #[test]
    fn drain_releases_slot() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(8);
        let op = ops.create(anchor(&mut arena)).unwrap();
        ops.complete(op, Box::new(1u32)).unwrap();

        let ready = ops.next_ready().unwrap();
        assert_eq!(ready, op);
        let (_cb, outcome) = ops.take_ready(ready).unwrap();
        assert_eq!(*outcome.unwrap().downcast::<u32>().unwrap(), 1);

        // Slot is gone; the handle is stale.
        assert_eq!(
            ops.complete(op, Box::new(2u32)),
            Err(Error::UseAfterCancel)
        );
        assert!(ops.next_ready().is_none());
    }

    #[test]
    fn completion_after_cancel_is_a_no_op() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(8);
        let node = anchor(&mut arena);
        let op = ops.create(node).unwrap();
        ops.set_callback(op, Box::new(|_, _| panic!("cancelled op fired")))
            .unwrap();

        let cancelled = ops.cancel_for_nodes(&[node]);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(ops.phase(op), Some(OpPhase::Cancelled));

        // Late completion: tolerated, nothing queued, callback already gone.
        assert_eq!(ops.complete(op, Box::new(0u8)), Ok(false));
        assert_eq!(ops.fail(op, Error::NotConnected), Ok(false));
        assert!(ops.next_ready().is_none());
    }

    #[test]
    fn cancel_returns_wired_handle() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(8);
        let node = anchor(&mut arena);
        let op = ops.create(node).unwrap();
        ops.set_raw(op, RawHandle(99));

        let cancelled = ops.cancel_for_nodes(&[node]);
        assert_eq!(cancelled, vec![(op, Some(RawHandle(99)))]);
    }

    #[test]
    fn cancel_skips_terminal_ops() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(8);
        let node = anchor(&mut arena);
        let op = ops.create(node).unwrap();
        ops.fail(op, Error::NotConnected).unwrap();

        // Already failed and queued; freeing the anchor must not retract it.
        assert!(ops.cancel_for_nodes(&[node]).is_empty());
        assert_eq!(ops.next_ready(), Some(op));
    }

    #[test]
    fn pool_exhaustion_reclaims_cancelled_slots() {
        let mut arena = Arena::new(8);
        let mut ops = OpTable::new(2);
        let node = anchor(&mut arena);
        let a = ops.create(node).unwrap();
        let _b = ops.create(node).unwrap();
        assert_eq!(ops.create(node), Err(Error::OutOfMemory));

        ops.cancel_for_nodes(&[node]);
        let c = ops.create(node).unwrap();
        assert_eq!(ops.phase(c), Some(OpPhase::Pending));
        // The old handle either no-ops (slot still parked as cancelled) or
        // reports staleness (slot reclaimed) — it never fires a callback.
        let res = ops.complete(a, Box::new(0u8));
        assert!(matches!(res, Ok(false) | Err(Error::UseAfterCancel)));
    }
}
