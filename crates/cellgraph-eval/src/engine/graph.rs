//! Arena-backed directed graph over vertex slots.
//!
//! Removal is O(1): the slot is vacated and its generation bumped, while
//! outgoing-edge lists elsewhere may keep stale entries. Every read filters
//! by generation, and cleaning reads compact the list — amortized read-side
//! cleanup in exchange for constant-time removal.
//!
//! An edge `u -> v` means "v depends on u": marking u changed propagates
//! along outgoing edges.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use thiserror::Error;

use super::vertex::{VertexFlags, VertexId, VertexKind};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("no vertex in slot {0:?}")]
    MissingNode(VertexId),
    #[error("no edge from {0:?} to {1:?}")]
    MissingEdge(VertexId, VertexId),
}

#[derive(Debug, Clone, Copy)]
struct EdgeTarget {
    id: VertexId,
    r#gen: u32,
}

#[derive(Debug)]
struct Slot {
    r#gen: u32,
    vertex: Option<VertexKind>,
    flags: VertexFlags,
    out: SmallVec<[EdgeTarget; 4]>,
}

#[derive(Debug, Default)]
pub struct Graph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    dirty_batch: Vec<VertexId>,
    volatile_batch: Vec<VertexId>,
    /// Deduplicated dirty+volatile frontier, memoized until the next mark.
    frontier_memo: Option<Vec<VertexId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, vertex: VertexKind) -> VertexId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.vertex.is_none());
            slot.vertex = Some(vertex);
            slot.flags = VertexFlags::empty();
            slot.out.clear();
            return VertexId::new(index);
        }
        self.slots.push(Slot {
            r#gen: 0,
            vertex: Some(vertex),
            flags: VertexFlags::empty(),
            out: SmallVec::new(),
        });
        VertexId::new(self.slots.len() as u32 - 1)
    }

    /// Vacate a slot. The caller must have detached incoming edges it still
    /// cares about; stale entries left behind are cleaned lazily.
    pub fn remove_node(&mut self, id: VertexId) -> Result<VertexKind, GraphError> {
        let slot = self
            .slots
            .get_mut(id.as_index())
            .ok_or(GraphError::MissingNode(id))?;
        let vertex = slot.vertex.take().ok_or(GraphError::MissingNode(id))?;
        slot.r#gen = slot.r#gen.wrapping_add(1);
        slot.flags = VertexFlags::empty();
        slot.out.clear();
        self.free.push(id.0);
        self.frontier_memo = None;
        Ok(vertex)
    }

    #[inline]
    pub fn contains(&self, id: VertexId) -> bool {
        self.slots
            .get(id.as_index())
            .is_some_and(|s| s.vertex.is_some())
    }

    #[inline]
    pub fn node(&self, id: VertexId) -> Option<&VertexKind> {
        self.slots.get(id.as_index())?.vertex.as_ref()
    }

    #[inline]
    pub fn node_mut(&mut self, id: VertexId) -> Option<&mut VertexKind> {
        self.slots.get_mut(id.as_index())?.vertex.as_mut()
    }

    /// Number of live vertices.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All live vertex ids in slot order.
    pub fn node_ids(&self) -> Vec<VertexId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.vertex.is_some())
            .map(|(i, _)| VertexId::new(i as u32))
            .collect()
    }

    // ---- edges -----------------------------------------------------------

    /// Add `from -> to`. Idempotent; both endpoints must be live.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId) {
        debug_assert!(self.contains(from), "edge source {from:?} not live");
        debug_assert!(self.contains(to), "edge target {to:?} not live");
        let to_gen = self.slots[to.as_index()].r#gen;
        let out = &mut self.slots[from.as_index()].out;
        for entry in out.iter_mut() {
            if entry.id == to {
                // Refresh a stale entry pointing at a reused slot.
                entry.r#gen = to_gen;
                return;
            }
        }
        out.push(EdgeTarget { id: to, r#gen: to_gen });
    }

    pub fn remove_edge(&mut self, from: VertexId, to: VertexId) -> Result<(), GraphError> {
        if !self.contains(from) {
            return Err(GraphError::MissingNode(from));
        }
        let out = &mut self.slots[from.as_index()].out;
        let before = out.len();
        out.retain(|e| e.id != to);
        if out.len() == before {
            return Err(GraphError::MissingEdge(from, to));
        }
        Ok(())
    }

    pub fn remove_edge_if_exists(&mut self, from: VertexId, to: VertexId) {
        if let Some(slot) = self.slots.get_mut(from.as_index()) {
            slot.out.retain(|e| e.id != to);
        }
    }

    #[inline]
    fn edge_live(&self, e: &EdgeTarget) -> bool {
        self.slots
            .get(e.id.as_index())
            .is_some_and(|s| s.vertex.is_some() && s.r#gen == e.r#gen)
    }

    /// Live successors, compacting stale entries out of the edge list.
    pub fn adjacent_nodes(&mut self, id: VertexId) -> SmallVec<[VertexId; 4]> {
        let Some(slot) = self.slots.get(id.as_index()) else {
            return SmallVec::new();
        };
        let entries: SmallVec<[EdgeTarget; 8]> = slot.out.iter().copied().collect();
        let live: SmallVec<[EdgeTarget; 8]> = entries
            .iter()
            .filter(|e| self.edge_live(e))
            .copied()
            .collect();
        let slot = &mut self.slots[id.as_index()];
        if live.len() != slot.out.len() {
            slot.out = live.iter().copied().collect();
        }
        live.iter().map(|e| e.id).collect()
    }

    /// Live successors without cleanup; usable while the graph is shared.
    pub fn successors(&self, id: VertexId) -> impl Iterator<Item = VertexId> + '_ {
        self.slots
            .get(id.as_index())
            .into_iter()
            .flat_map(|s| s.out.iter())
            .filter(|e| self.edge_live(e))
            .map(|e| e.id)
    }

    pub fn has_edge(&self, from: VertexId, to: VertexId) -> bool {
        self.successors(from).any(|s| s == to)
    }

    // ---- dirty / volatile batches ---------------------------------------

    pub fn mark_dirty(&mut self, id: VertexId) {
        let Some(slot) = self.slots.get_mut(id.as_index()) else {
            return;
        };
        if slot.vertex.is_none() || slot.flags.contains(VertexFlags::DIRTY) {
            return;
        }
        slot.flags.insert(VertexFlags::DIRTY);
        self.dirty_batch.push(id);
        self.frontier_memo = None;
    }

    pub fn mark_volatile(&mut self, id: VertexId) {
        let Some(slot) = self.slots.get_mut(id.as_index()) else {
            return;
        };
        if slot.vertex.is_none() || slot.flags.contains(VertexFlags::VOLATILE) {
            return;
        }
        slot.flags.insert(VertexFlags::VOLATILE);
        self.volatile_batch.push(id);
        self.frontier_memo = None;
    }

    pub fn unmark_volatile(&mut self, id: VertexId) {
        if let Some(slot) = self.slots.get_mut(id.as_index()) {
            if slot.flags.contains(VertexFlags::VOLATILE) {
                slot.flags.remove(VertexFlags::VOLATILE);
                self.volatile_batch.retain(|&v| v != id);
                self.frontier_memo = None;
            }
        }
    }

    pub fn is_dirty(&self, id: VertexId) -> bool {
        self.slots
            .get(id.as_index())
            .is_some_and(|s| s.flags.contains(VertexFlags::DIRTY))
    }

    pub fn is_volatile(&self, id: VertexId) -> bool {
        self.slots
            .get(id.as_index())
            .is_some_and(|s| s.flags.contains(VertexFlags::VOLATILE))
    }

    /// The deduplicated dirty+volatile frontier. Memoized until the next
    /// `mark_*` or removal invalidates it.
    pub fn dirty_and_volatile(&mut self) -> &[VertexId] {
        if self.frontier_memo.is_none() {
            let mut seen = FxHashSet::default();
            let mut frontier = Vec::new();
            for &id in self.dirty_batch.iter().chain(self.volatile_batch.iter()) {
                if self.slots[id.as_index()].vertex.is_some() && seen.insert(id) {
                    frontier.push(id);
                }
            }
            self.frontier_memo = Some(frontier);
        }
        self.frontier_memo.as_deref().unwrap()
    }

    /// Drop dirty marks after a completed evaluation pass. Volatile marks
    /// persist; the frontier memo is rebuilt on next read.
    pub fn finish_run(&mut self) {
        for id in std::mem::take(&mut self.dirty_batch) {
            if let Some(slot) = self.slots.get_mut(id.as_index()) {
                slot.flags.remove(VertexFlags::DIRTY);
            }
        }
        self.volatile_batch.retain(|&id| {
            self.slots[id.as_index()]
                .flags
                .contains(VertexFlags::VOLATILE)
        });
        self.frontier_memo = None;
    }
}
