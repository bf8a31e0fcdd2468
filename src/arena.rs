//! Hierarchical, reference-counted allocation contexts.
//!
//! Every protocol object in this crate (connection, credentials, pipe blob,
//! call result, async op anchor) lives in one [`Arena`], so teardown has a
//! single mechanical rule: free the owning node and everything beneath it
//! cascades. Nodes are addressed by [`NodeId`] — a slot index plus a
//! generation counter that detects stale handles, so "reference without
//! ownership" edges are representable without aliased pointers.
//!
//! Ownership model:
//! - Each node has at most one *primary* parent. Freeing a parent frees the
//!   subtree post-order.
//! - A node may carry additional *secondary* reference edges from other
//!   nodes. A node is physically released only once its primary ownership is
//!   gone **and** its secondary edge list is empty. A node whose primary
//!   owner released it while references remain is *disclaimed*: detached
//!   from the tree, kept alive by its referents.
//! - [`Arena::reparent`] moves a subtree between parents without copying;
//!   used to hand a result object from a short-lived scratch context to a
//!   long-lived one.

use std::any::Any;

use crate::error::Error;
use crate::metrics;

/// Stable handle to an arena node. Stale handles (outliving their node) are
/// detected via the generation counter and treated as dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

struct Node {
    parent: Option<u32>,
    children: Vec<u32>,
    /// Secondary owner edges pointing at this node.
    refs: Vec<NodeId>,
    /// Outgoing secondary edges held by this node (released on destroy).
    holds: Vec<NodeId>,
    tag: Option<&'static str>,
    size: usize,
    payload: Option<Box<dyn Any>>,
    /// Primary ownership released while secondary references remain.
    disclaimed: bool,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Fixed-capacity hierarchical arena.
pub struct Arena {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    max_blocks: u32,
}

impl Arena {
    /// Create an arena with capacity for `max_blocks` live nodes.
    pub fn new(max_blocks: u32) -> Self {
        Arena {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            max_blocks,
        }
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// Allocate an untagged node under `parent` (or as a root).
    pub fn alloc(&mut self, parent: Option<NodeId>) -> Result<NodeId, Error> {
        self.alloc_tagged(parent, None, 0, None)
    }

    /// Allocate a node with a type tag, a recorded size, and an optional
    /// opaque payload.
    pub fn alloc_tagged(
        &mut self,
        parent: Option<NodeId>,
        tag: Option<&'static str>,
        size: usize,
        payload: Option<Box<dyn Any>>,
    ) -> Result<NodeId, Error> {
        let parent_idx = match parent {
            Some(p) => {
                if self.get(p).is_none() {
                    return Err(Error::InvalidNode);
                }
                Some(p.index)
            }
            None => None,
        };

        let index = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= self.max_blocks as usize {
                    return Err(Error::OutOfMemory);
                }
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.node.is_none(), "allocating into a live slot");
        slot.node = Some(Node {
            parent: parent_idx,
            children: Vec::new(),
            refs: Vec::new(),
            holds: Vec::new(),
            tag,
            size,
            payload,
            disclaimed: false,
        });
        let id = NodeId {
            index,
            generation: slot.generation,
        };
        if let Some(p) = parent_idx {
            // Parent liveness checked above.
            if let Some(pnode) = self.slots[p as usize].node.as_mut() {
                pnode.children.push(index);
            }
        }
        self.live += 1;
        metrics::ARENA_BLOCKS_LIVE.increment();
        Ok(id)
    }

    /// Record an additional owning edge from `new_owner` to `node`. The
    /// primary parent is unchanged; the edge is dropped when `new_owner` is
    /// destroyed or via [`Arena::release_reference`].
    pub fn reference(&mut self, node: NodeId, new_owner: NodeId) -> Result<(), Error> {
        if node.index == new_owner.index {
            return Err(Error::InvalidNode);
        }
        if self.get(node).is_none() || self.get(new_owner).is_none() {
            return Err(Error::InvalidNode);
        }
        if let Some(n) = self.get_mut(node) {
            n.refs.push(new_owner);
        }
        if let Some(o) = self.get_mut(new_owner) {
            o.holds.push(node);
        }
        Ok(())
    }

    /// Drop one secondary edge from `owner` to `node`. If this was the last
    /// edge and the primary owner already released the node, the node (and
    /// subtree) is destroyed; the destroyed nodes are returned post-order.
    pub fn release_reference(&mut self, node: NodeId, owner: NodeId) -> Result<Vec<NodeId>, Error> {
        {
            let n = self.get_mut(node).ok_or(Error::InvalidNode)?;
            let pos = n
                .refs
                .iter()
                .position(|r| *r == owner)
                .ok_or(Error::InvalidNode)?;
            n.refs.swap_remove(pos);
        }
        if let Some(o) = self.get_mut(owner) {
            if let Some(pos) = o.holds.iter().position(|h| *h == node) {
                o.holds.swap_remove(pos);
            }
        }
        let mut freed = Vec::new();
        let n = self.get(node).ok_or(Error::InvalidNode)?;
        if n.disclaimed && n.refs.is_empty() {
            self.destroy_subtree(node.index, &mut freed);
        }
        Ok(freed)
    }

    /// Move `node` (and its subtree) under `new_parent` without copying.
    /// Rejects moves that would make a node its own ancestor.
    pub fn reparent(&mut self, node: NodeId, new_parent: NodeId) -> Result<(), Error> {
        self.get(node).ok_or(Error::InvalidNode)?;
        self.get(new_parent).ok_or(Error::InvalidNode)?;
        // Walk up from the new parent; hitting `node` means a cycle.
        let mut cursor = Some(new_parent.index);
        while let Some(idx) = cursor {
            if idx == node.index {
                return Err(Error::InvalidNode);
            }
            cursor = self.slots[idx as usize]
                .node
                .as_ref()
                .and_then(|n| n.parent);
        }
        self.detach(node.index);
        if let Some(n) = self.get_mut(node) {
            n.parent = Some(new_parent.index);
            n.disclaimed = false;
        }
        if let Some(p) = self.get_mut(new_parent) {
            p.children.push(node.index);
        }
        Ok(())
    }

    /// Release the primary ownership edge of `node`.
    ///
    /// If no secondary references remain, the node and every exclusively
    /// owned descendant are destroyed post-order and returned. Referenced
    /// descendants are disclaimed instead of destroyed. Freeing a stale or
    /// already-released node is a no-op.
    pub fn free(&mut self, node: NodeId) -> Vec<NodeId> {
        let Some(n) = self.get(node) else {
            return Vec::new();
        };
        if !n.refs.is_empty() {
            // Primary release only; referents keep the node alive.
            self.detach(node.index);
            if let Some(n) = self.get_mut(node) {
                n.disclaimed = true;
            }
            return Vec::new();
        }
        self.detach(node.index);
        let mut freed = Vec::new();
        self.destroy_subtree(node.index, &mut freed);
        freed
    }

    /// Remove `idx` from its parent's child list.
    fn detach(&mut self, idx: u32) {
        let parent = self.slots[idx as usize]
            .node
            .as_ref()
            .and_then(|n| n.parent);
        if let Some(p) = parent {
            if let Some(pnode) = self.slots[p as usize].node.as_mut() {
                pnode.children.retain(|c| *c != idx);
            }
        }
        if let Some(n) = self.slots[idx as usize].node.as_mut() {
            n.parent = None;
        }
    }

    /// Post-order destruction: children first, then outgoing reference
    /// edges, then the node itself.
    fn destroy_subtree(&mut self, idx: u32, freed: &mut Vec<NodeId>) {
        let generation = self.slots[idx as usize].generation;
        let (children, holds) = {
            let Some(node) = self.slots[idx as usize].node.as_mut() else {
                return;
            };
            (
                std::mem::take(&mut node.children),
                std::mem::take(&mut node.holds),
            )
        };

        for child in children {
            let keep = match self.slots[child as usize].node.as_ref() {
                Some(n) => !n.refs.is_empty(),
                None => continue,
            };
            if keep {
                // Referenced elsewhere: survives its owner, detached.
                if let Some(n) = self.slots[child as usize].node.as_mut() {
                    n.parent = None;
                    n.disclaimed = true;
                }
            } else {
                self.destroy_subtree(child, freed);
            }
        }

        let owner = NodeId {
            index: idx,
            generation,
        };
        for target in holds {
            let destroy = {
                let Some(t) = self.get_mut(target) else {
                    continue;
                };
                if let Some(pos) = t.refs.iter().position(|r| *r == owner) {
                    t.refs.swap_remove(pos);
                }
                t.disclaimed && t.refs.is_empty()
            };
            if destroy {
                self.destroy_subtree(target.index, freed);
            }
        }

        let slot = &mut self.slots[idx as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx);
        self.live -= 1;
        metrics::ARENA_BLOCKS_LIVE.decrement();
        freed.push(owner);
    }

    /// Runtime type check: fails with `TypeMismatch` if the node's recorded
    /// tag disagrees with `wanted`.
    pub fn check_type(&self, node: NodeId, wanted: &'static str) -> Result<NodeId, Error> {
        let n = self.get(node).ok_or(Error::InvalidNode)?;
        let have = n.tag.unwrap_or("<untagged>");
        if have != wanted {
            return Err(Error::TypeMismatch { have, wanted });
        }
        Ok(node)
    }

    /// Tag-checked access to a node's payload.
    pub fn payload_of<T: Any>(&self, node: NodeId, tag: &'static str) -> Result<&T, Error> {
        self.check_type(node, tag)?;
        let n = self.get(node).ok_or(Error::InvalidNode)?;
        n.payload
            .as_ref()
            .and_then(|p| p.downcast_ref::<T>())
            .ok_or(Error::TypeMismatch {
                have: tag,
                wanted: std::any::type_name::<T>(),
            })
    }

    /// Whether `node` is still live (primary- or reference-owned).
    pub fn is_live(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }

    /// Number of secondary reference edges on `node`.
    pub fn ref_count(&self, node: NodeId) -> usize {
        self.get(node).map(|n| n.refs.len()).unwrap_or(0)
    }

    fn subtree_indices(&self, node: NodeId) -> Vec<u32> {
        let mut out = Vec::new();
        if self.get(node).is_none() {
            return out;
        }
        let mut stack = vec![node.index];
        while let Some(idx) = stack.pop() {
            out.push(idx);
            if let Some(n) = self.slots[idx as usize].node.as_ref() {
                stack.extend_from_slice(&n.children);
            }
        }
        out
    }

    /// Total blocks in the subtree rooted at `node` (zero for a stale handle).
    pub fn total_blocks(&self, node: NodeId) -> usize {
        self.subtree_indices(node).len()
    }

    /// Sum of recorded sizes in the subtree rooted at `node`.
    pub fn total_size(&self, node: NodeId) -> usize {
        self.subtree_indices(node)
            .iter()
            .filter_map(|idx| self.slots[*idx as usize].node.as_ref())
            .map(|n| n.size)
            .sum()
    }

    /// Number of live blocks in the whole arena.
    pub fn live_blocks(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::new(64)
    }

    #[test]
    fn alloc_free_cascade() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let child = a.alloc(Some(root)).unwrap();
        let grandchild = a.alloc(Some(child)).unwrap();
        assert_eq!(a.total_blocks(root), 3);

        let freed = a.free(root);
        assert_eq!(freed.len(), 3);
        // Post-order: descendants before the root.
        assert_eq!(*freed.last().unwrap(), root);
        assert!(!a.is_live(child));
        assert!(!a.is_live(grandchild));
        assert_eq!(a.live_blocks(), 0);
    }

    #[test]
    fn free_is_idempotent() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let child = a.alloc(Some(root)).unwrap();
        assert_eq!(a.free(root).len(), 2);
        assert!(a.free(root).is_empty());
        assert!(a.free(child).is_empty());
        assert_eq!(a.live_blocks(), 0);
    }

    #[test]
    fn stale_handle_detected_after_slot_reuse() {
        let mut a = arena();
        let first = a.alloc(None).unwrap();
        a.free(first);
        let second = a.alloc(None).unwrap();
        // Same slot, new generation.
        assert_eq!(first.index, second.index);
        assert!(!a.is_live(first));
        assert!(a.is_live(second));
    }

    #[test]
    fn out_of_memory_at_capacity() {
        let mut a = Arena::new(2);
        let root = a.alloc(None).unwrap();
        let _child = a.alloc(Some(root)).unwrap();
        assert_eq!(a.alloc(Some(root)), Err(Error::OutOfMemory));
        a.free(root);
        assert!(a.alloc(None).is_ok());
    }

    #[test]
    fn referenced_node_survives_primary_free() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let keeper = a.alloc(None).unwrap();
        let shared = a.alloc(Some(root)).unwrap();
        a.reference(shared, keeper).unwrap();

        let freed = a.free(root);
        // Root destroyed, shared disclaimed but alive.
        assert_eq!(freed, vec![root]);
        assert!(a.is_live(shared));
        assert_eq!(a.ref_count(shared), 1);

        // Destroying the referent drops the last edge and the node with it.
        let freed = a.free(keeper);
        assert!(freed.contains(&shared));
        assert_eq!(a.live_blocks(), 0);
    }

    #[test]
    fn release_reference_destroys_disclaimed_node() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let keeper = a.alloc(None).unwrap();
        let shared = a.alloc(Some(root)).unwrap();
        a.reference(shared, keeper).unwrap();
        a.free(root);
        assert!(a.is_live(shared));

        let freed = a.release_reference(shared, keeper).unwrap();
        assert_eq!(freed, vec![shared]);
        assert!(a.is_live(keeper));
    }

    #[test]
    fn release_reference_without_edge_is_an_error() {
        let mut a = arena();
        let node = a.alloc(None).unwrap();
        let other = a.alloc(None).unwrap();
        assert_eq!(a.release_reference(node, other), Err(Error::InvalidNode));
    }

    #[test]
    fn reparent_moves_subtree_without_changing_identity() {
        let mut a = arena();
        let scratch = a.alloc(None).unwrap();
        let home = a.alloc(None).unwrap();
        let result = a.alloc(Some(scratch)).unwrap();
        let inner = a.alloc(Some(result)).unwrap();

        let before: Vec<u32> = a.subtree_indices(result);
        a.reparent(result, home).unwrap();
        let after: Vec<u32> = a.subtree_indices(result);
        assert_eq!(before, after);

        // Scratch teardown no longer touches the moved subtree.
        a.free(scratch);
        assert!(a.is_live(result));
        assert!(a.is_live(inner));

        a.free(home);
        assert!(!a.is_live(result));
        assert_eq!(a.live_blocks(), 0);
    }

    #[test]
    fn reparent_rejects_cycles() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let child = a.alloc(Some(root)).unwrap();
        assert_eq!(a.reparent(root, child), Err(Error::InvalidNode));
        assert_eq!(a.reparent(root, root), Err(Error::InvalidNode));
    }

    #[test]
    fn check_type_and_payload() {
        let mut a = arena();
        let node = a
            .alloc_tagged(None, Some("credentials"), 8, Some(Box::new(42u64)))
            .unwrap();
        assert!(a.check_type(node, "credentials").is_ok());
        assert_eq!(
            a.check_type(node, "pipe"),
            Err(Error::TypeMismatch {
                have: "credentials",
                wanted: "pipe"
            })
        );
        assert_eq!(*a.payload_of::<u64>(node, "credentials").unwrap(), 42);
        assert!(a.payload_of::<String>(node, "credentials").is_err());
    }

    #[test]
    fn total_size_sums_subtree() {
        let mut a = arena();
        let root = a.alloc_tagged(None, None, 16, None).unwrap();
        let _c1 = a.alloc_tagged(Some(root), None, 32, None).unwrap();
        let _c2 = a.alloc_tagged(Some(root), None, 8, None).unwrap();
        assert_eq!(a.total_size(root), 56);
        assert_eq!(a.total_blocks(root), 3);
    }

    #[test]
    fn mixed_create_reference_reparent_frees_to_zero() {
        let mut a = arena();
        let root = a.alloc(None).unwrap();
        let side = a.alloc(Some(root)).unwrap();
        let scratch = a.alloc(Some(root)).unwrap();
        let result = a.alloc(Some(scratch)).unwrap();
        a.reference(result, side).unwrap();
        a.reparent(result, root).unwrap();
        a.release_reference(result, side).unwrap();
        a.free(scratch);

        assert!(a.is_live(result));
        let freed = a.free(root);
        assert_eq!(freed.len(), 3);
        assert_eq!(a.live_blocks(), 0);
    }
}
