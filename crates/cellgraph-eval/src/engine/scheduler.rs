//! Incremental topological ordering with cycle detection.
//!
//! Tarjan's SCC algorithm, iterative with an explicit DFS frame stack so
//! deep dependency chains cannot overflow the call stack. The traversal is
//! seeded from a supplied frontier: a full rebuild seeds with every vertex,
//! an incremental recompute seeds with just-changed ones. Identical seeds
//! and edges yield identical output.

use rustc_hash::{FxHashMap, FxHashSet};

use super::graph::Graph;
use super::vertex::VertexId;

/// Result of one ordering pass over the subgraph reachable from the seeds.
#[derive(Debug, Default)]
pub struct TopologicalOrder {
    /// Non-cyclic reachable vertices, dependencies before dependents.
    pub sorted: Vec<VertexId>,
    /// Members of any SCC of size > 1, plus self-loops.
    pub cycled: Vec<VertexId>,
}

pub struct Scheduler<'g> {
    graph: &'g Graph,
}

struct DfsFrame {
    id: VertexId,
    neighbours: Vec<VertexId>,
    next: usize,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    pub fn order_from(&self, seeds: &[VertexId]) -> TopologicalOrder {
        let mut index_counter: u32 = 0;
        let mut indices: FxHashMap<VertexId, u32> = FxHashMap::default();
        let mut lowlinks: FxHashMap<VertexId, u32> = FxHashMap::default();
        let mut stack: Vec<VertexId> = Vec::new();
        let mut on_stack: FxHashSet<VertexId> = FxHashSet::default();
        let mut order = TopologicalOrder::default();

        for &root in seeds {
            if !self.graph.contains(root) || indices.contains_key(&root) {
                continue;
            }

            let mut dfs: Vec<DfsFrame> = Vec::new();
            index_counter = Self::open(
                root,
                index_counter,
                &mut indices,
                &mut lowlinks,
                &mut stack,
                &mut on_stack,
            );
            dfs.push(DfsFrame {
                id: root,
                neighbours: self.graph.successors(root).collect(),
                next: 0,
            });

            while let Some(frame) = dfs.last_mut() {
                if frame.next < frame.neighbours.len() {
                    let w = frame.neighbours[frame.next];
                    frame.next += 1;

                    if !indices.contains_key(&w) {
                        index_counter = Self::open(
                            w,
                            index_counter,
                            &mut indices,
                            &mut lowlinks,
                            &mut stack,
                            &mut on_stack,
                        );
                        dfs.push(DfsFrame {
                            id: w,
                            neighbours: self.graph.successors(w).collect(),
                            next: 0,
                        });
                    } else if on_stack.contains(&w) {
                        let w_index = indices[&w];
                        let low = lowlinks.get_mut(&frame.id).unwrap();
                        if w_index < *low {
                            *low = w_index;
                        }
                    }
                    // Not on stack: cross-edge into an already-popped SCC.
                } else {
                    let finished = dfs.pop().unwrap();
                    let v = finished.id;
                    let v_low = lowlinks[&v];

                    if let Some(parent) = dfs.last() {
                        let parent_low = lowlinks.get_mut(&parent.id).unwrap();
                        if v_low < *parent_low {
                            *parent_low = v_low;
                        }
                    }

                    if v_low == indices[&v] {
                        // Pop one complete SCC.
                        let mut scc: Vec<VertexId> = Vec::new();
                        loop {
                            let w = stack.pop().unwrap();
                            on_stack.remove(&w);
                            scc.push(w);
                            if w == v {
                                break;
                            }
                        }
                        if scc.len() > 1 || self.graph.has_edge(v, v) {
                            order.cycled.extend(scc);
                        } else {
                            order.sorted.push(v);
                        }
                    }
                }
            }
        }

        // SCCs pop dependents-first; evaluation wants dependencies first.
        order.sorted.reverse();
        order
    }

    fn open(
        v: VertexId,
        counter: u32,
        indices: &mut FxHashMap<VertexId, u32>,
        lowlinks: &mut FxHashMap<VertexId, u32>,
        stack: &mut Vec<VertexId>,
        on_stack: &mut FxHashSet<VertexId>,
    ) -> u32 {
        indices.insert(v, counter);
        lowlinks.insert(v, counter);
        stack.push(v);
        on_stack.insert(v);
        counter + 1
    }
}
