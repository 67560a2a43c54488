//! The ready queue: a max-heap of targets whose depends are all complete,
//! ordered by priority.
//!
//! A target's priority is 1 plus the priorities of everything waiting on it,
//! so targets that unblock more work run first.  Priorities are computed
//! lazily and are approximate: adding an edge only invalidates the target the
//! edge points at, and invalidated entries are fixed up before the next pop.

use crate::graph::{Graph, TargetId};

#[derive(Default)]
pub struct TargetQueue {
    heap: Vec<TargetId>,
    pending: Vec<TargetId>,
}

/// Priority of a target, computing and caching it when invalid.
pub fn priority(graph: &mut Graph, id: TargetId) -> u64 {
    if let Some(p) = graph.target(id).priority {
        return p;
    }
    // Provisional value so a cycle through `affects` terminates.
    graph.target_mut(id).priority = Some(1);
    let mut sum = 1u64;
    for affect in graph.target(id).affects.to_vec() {
        sum = sum.saturating_add(priority(graph, affect));
    }
    graph.target_mut(id).priority = Some(sum);
    sum
}

impl TargetQueue {
    pub fn new() -> Self {
        TargetQueue::default()
    }

    fn set(&mut self, graph: &mut Graph, i: usize, id: TargetId) {
        self.heap[i] = id;
        graph.target_mut(id).queue_index = Some(i);
    }

    fn sift_up(&mut self, graph: &mut Graph, mut i: usize) {
        let id = self.heap[i];
        let p = priority(graph, id);
        while i > 0 {
            let parent = (i - 1) / 2;
            let parent_id = self.heap[parent];
            if priority(graph, parent_id) >= p {
                break;
            }
            self.set(graph, i, parent_id);
            i = parent;
        }
        self.set(graph, i, id);
    }

    fn sift_down(&mut self, graph: &mut Graph, mut i: usize) {
        let id = self.heap[i];
        let p = priority(graph, id);
        loop {
            let left = 2 * i + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len()
                && priority(graph, self.heap[right]) > priority(graph, self.heap[left])
            {
                child = right;
            }
            let child_id = self.heap[child];
            if priority(graph, child_id) <= p {
                break;
            }
            self.set(graph, i, child_id);
            i = child;
        }
        self.set(graph, i, id);
    }

    pub fn push(&mut self, graph: &mut Graph, id: TargetId) {
        if graph.target(id).queue_index.is_some() {
            return;
        }
        self.heap.push(id);
        let i = self.heap.len() - 1;
        self.sift_up(graph, i);
    }

    /// Mark a target's priority stale.  It is recomputed, and the target
    /// repositioned if it is in the heap, before the next pop.
    pub fn invalidate(&mut self, graph: &mut Graph, id: TargetId) {
        let target = graph.target_mut(id);
        if target.priority_pending {
            return;
        }
        target.priority_pending = true;
        self.pending.push(id);
    }

    fn adjust(&mut self, graph: &mut Graph) {
        let pending = std::mem::take(&mut self.pending);
        for &id in &pending {
            let target = graph.target_mut(id);
            target.priority_pending = false;
            target.priority = None;
        }
        for id in pending {
            if let Some(i) = graph.target(id).queue_index {
                self.sift_up(graph, i);
                if let Some(i) = graph.target(id).queue_index {
                    self.sift_down(graph, i);
                }
            }
        }
    }

    pub fn pop(&mut self, graph: &mut Graph) -> Option<TargetId> {
        self.adjust(graph);
        if self.heap.is_empty() {
            return None;
        }
        let top = self.heap.swap_remove(0);
        graph.target_mut(top).queue_index = None;
        if !self.heap.is_empty() {
            let moved = self.heap[0];
            graph.target_mut(moved).queue_index = Some(0);
            self.sift_down(graph, 0);
        }
        Some(top)
    }

    /// Drop every entry, e.g. when a build is abandoned.
    pub fn clear(&mut self, graph: &mut Graph) {
        for id in self.heap.drain(..) {
            graph.target_mut(id).queue_index = None;
        }
        for id in self.pending.drain(..) {
            graph.target_mut(id).priority_pending = false;
        }
    }
}
