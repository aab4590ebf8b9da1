//! Happens-before DAG model and construction.
//!
//! Converts a normalized trace-event stream into a directed acyclic
//! graph of semaphore operations: one node per wait/signal plus
//! scaffolding task nodes, with an edge `A → B` meaning A must execute
//! before B may begin. The graph is the single source of truth for the
//! schedule simulator and the deadlock search.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use snarl_types::{CompactId, NormalizedEvent};
use tracing::{debug, warn};

pub mod detect;
pub mod simulate;

/// Index of a node in the graph arena.
pub type NodeIdx = usize;

// ── Operations ──────────────────────────────────────────────────

/// The semantic effect of a node.
///
/// `None` is a structural placeholder (task scaffolding, neutralized
/// operations); it never touches a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Take `count` units from `sem`, blocking while unavailable.
    Wait { sem: CompactId, count: u64 },
    /// Return `count` units to `sem`. Never blocks.
    Signal { sem: CompactId, count: u64 },
    /// No effect.
    None,
}

impl Op {
    pub fn is_none(&self) -> bool {
        matches!(self, Op::None)
    }

    pub fn sem(&self) -> Option<CompactId> {
        match self {
            Op::Wait { sem, .. } | Op::Signal { sem, .. } => Some(*sem),
            Op::None => None,
        }
    }

    /// Signed effect on the semaphore count.
    pub fn delta(&self) -> i64 {
        match self {
            Op::Wait { count, .. } => -(*count as i64),
            Op::Signal { count, .. } => *count as i64,
            Op::None => 0,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::None => write!(f, "Empty operation"),
            Op::Signal { sem, count } => {
                write!(f, "Signal with {count} on semaphore with id {sem}")
            }
            Op::Wait { sem, count } => {
                write!(f, "Wait for {count} on semaphore with id {sem}")
            }
        }
    }
}

// ── Nodes and the arena ─────────────────────────────────────────

/// One node of the happens-before DAG.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub op: Op,
    /// Nodes that may only execute after this one.
    pub children: BTreeSet<NodeIdx>,
    /// Number of distinct parents. Kept equal to the in-degree at all
    /// times; simplification recomputes it from the rebuilt edge set.
    pub prev_count: usize,
    /// Anchor id from the trace, for diagnostics only. The synthetic
    /// root has none.
    pub original_id: Option<CompactId>,
}

/// Flat-arena DAG rooted at a synthetic `None` node at index 0.
///
/// Children are index sets with deterministic order; cloning the arena
/// is the deep copy the per-subset search relies on.
#[derive(Debug, Clone)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
}

impl OpGraph {
    pub const ROOT: NodeIdx = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![OpNode {
                op: Op::None,
                children: BTreeSet::new(),
                prev_count: 0,
                original_id: None,
            }],
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: NodeIdx) -> &OpNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[OpNode] {
        &self.nodes
    }

    pub fn add_node(&mut self, op: Op, original_id: Option<CompactId>) -> NodeIdx {
        self.nodes.push(OpNode {
            op,
            children: BTreeSet::new(),
            prev_count: 0,
            original_id,
        });
        self.nodes.len() - 1
    }

    /// Adds `parent → child`. Duplicate edges are idempotent, so
    /// `prev_count` stays equal to the number of distinct parents.
    /// Self-edges are refused; a node cannot precede itself.
    pub fn add_edge(&mut self, parent: NodeIdx, child: NodeIdx) {
        if parent == child {
            return;
        }
        if self.nodes[parent].children.insert(child) {
            self.nodes[child].prev_count += 1;
        }
    }

    /// Replaces every operation on a semaphore outside `sems` with
    /// `None`, neutralizing it for a subset-restricted search.
    pub fn restrict_to(&mut self, sems: &BTreeSet<CompactId>) {
        for node in &mut self.nodes {
            if node.op.sem().is_some_and(|sem| !sems.contains(&sem)) {
                node.op = Op::None;
            }
        }
    }

    /// Erases `None` nodes by splicing: each one's children become
    /// children of its predecessors. Returns a compact arena holding the
    /// root plus every reachable operation node, with `prev_count`
    /// recomputed from the rebuilt edges.
    pub fn simplified(&self) -> OpGraph {
        let reachable = self.reachable_from_root();
        let order = self.topological_order(&reachable);
        let reachable_count = reachable.iter().filter(|&&r| r).count();
        if order.len() != reachable_count {
            // A cycle means the trace's ordering events contradict each
            // other; the nodes trapped in it cannot be scheduled.
            warn!(
                dropped = reachable_count - order.len(),
                "happens-before cycle in trace, dropping unschedulable nodes"
            );
        }

        // Spliced child sets, bottom-up so children resolve first.
        let mut resolved: Vec<BTreeSet<NodeIdx>> = vec![BTreeSet::new(); self.nodes.len()];
        for &idx in order.iter().rev() {
            let mut spliced = BTreeSet::new();
            for &child in &self.nodes[idx].children {
                if self.nodes[child].op.is_none() {
                    spliced.extend(resolved[child].iter().copied());
                } else {
                    spliced.insert(child);
                }
            }
            resolved[idx] = spliced;
        }

        let mut remap: HashMap<NodeIdx, NodeIdx> = HashMap::new();
        let mut simplified = OpGraph::new();
        remap.insert(Self::ROOT, Self::ROOT);
        for &idx in &order {
            if idx != Self::ROOT && !self.nodes[idx].op.is_none() {
                let new_idx =
                    simplified.add_node(self.nodes[idx].op, self.nodes[idx].original_id);
                remap.insert(idx, new_idx);
            }
        }
        for &idx in &order {
            let Some(&new_parent) = remap.get(&idx) else {
                continue;
            };
            for &child in &resolved[idx] {
                if let Some(&new_child) = remap.get(&child) {
                    simplified.add_edge(new_parent, new_child);
                }
            }
        }
        simplified
    }

    fn reachable_from_root(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![Self::ROOT];
        reachable[Self::ROOT] = true;
        while let Some(idx) = stack.pop() {
            for &child in &self.nodes[idx].children {
                if !reachable[child] {
                    reachable[child] = true;
                    stack.push(child);
                }
            }
        }
        reachable
    }

    /// Kahn's algorithm over the reachable subgraph.
    fn topological_order(&self, reachable: &[bool]) -> Vec<NodeIdx> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            if !reachable[idx] {
                continue;
            }
            for &child in &node.children {
                indegree[child] += 1;
            }
        }
        let mut queue: VecDeque<NodeIdx> = (0..self.nodes.len())
            .filter(|&idx| reachable[idx] && indegree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            for &child in &self.nodes[idx].children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }
        order
    }
}

impl Default for OpGraph {
    fn default() -> Self {
        Self::new()
    }
}

// ── Semaphores ──────────────────────────────────────────────────

/// A wait that could not be satisfied, parked in FIFO order.
#[derive(Debug, Clone, Copy)]
pub struct QueuedWait {
    pub node: NodeIdx,
    /// Position of the node in the candidate schedule.
    pub index: usize,
    /// Signed effect the operation will have once admitted.
    pub delta: i64,
}

/// A counting semaphore with a FIFO blocking queue.
///
/// The count never goes below zero: a wait that would take it negative
/// is enqueued instead. Only the head of the queue is eligible to wake.
#[derive(Debug, Clone)]
pub struct Semaphore {
    pub id: CompactId,
    /// Id from the trace, for diagnostics only.
    pub original_id: CompactId,
    pub count: i64,
    pub queue: VecDeque<QueuedWait>,
}

impl Semaphore {
    pub fn new(id: CompactId, count: i64, original_id: CompactId) -> Self {
        Self {
            id,
            original_id,
            count,
            queue: VecDeque::new(),
        }
    }

    /// Applies `delta` to the count. A wait that would go negative is
    /// enqueued and `false` is returned.
    pub fn apply(&mut self, node: NodeIdx, index: usize, delta: i64) -> bool {
        if self.count + delta < 0 {
            self.queue.push_back(QueuedWait { node, index, delta });
            return false;
        }
        self.count += delta;
        true
    }

    /// Dequeues the head wait if the current count can satisfy it.
    /// The caller re-attempts the operation, which applies the delta.
    pub fn admit_head(&mut self) -> Option<QueuedWait> {
        let head = self.queue.front()?;
        if self.count + head.delta >= 0 {
            return self.queue.pop_front();
        }
        None
    }
}

// ── Building the DAG from a normalized stream ───────────────────

/// The built happens-before DAG together with its semaphores.
#[derive(Debug, Clone)]
pub struct TraceGraph {
    pub graph: OpGraph,
    pub semaphores: BTreeMap<CompactId, Semaphore>,
}

impl TraceGraph {
    /// Builds the DAG from a normalized event stream.
    ///
    /// Semaphores are collected first. Edges, waits, and signals are
    /// then replayed in timestamp order: an edge ensures nodes for both
    /// endpoints (a fresh `pre` becomes a child of the root) and wires
    /// `pre → post`; an operation claims its anchor vertex, displacing
    /// whatever node held it to a fresh synthetic address, so that a
    /// later edge naming the anchor orders against the operation rather
    /// than its predecessor. `None` scaffolding is spliced out at the
    /// end.
    pub fn build(events: &[NormalizedEvent]) -> Self {
        let mut ordered: Vec<&NormalizedEvent> = events.iter().collect();
        ordered.sort_by_key(|event| event.timestamp());

        let mut semaphores = BTreeMap::new();
        for event in &ordered {
            if let NormalizedEvent::SemCtor { sem, count, .. } = event {
                semaphores.insert(*sem, Semaphore::new(*sem, *count as i64, *sem));
            }
        }

        let mut builder = Builder {
            graph: OpGraph::new(),
            semaphores,
            addr_to_node: HashMap::new(),
            free_addr: 0,
        };
        for event in &ordered {
            match event {
                NormalizedEvent::Edge { pre, post, .. } => builder.edge(*pre, *post),
                NormalizedEvent::SemWait {
                    sem,
                    pre,
                    post,
                    count,
                    ..
                } => builder.operation(
                    *post,
                    Op::Wait {
                        sem: *sem,
                        count: *count,
                    },
                    Anchor::WaitPost { pre: *pre },
                ),
                NormalizedEvent::SemSignal {
                    sem,
                    vertex,
                    count,
                    ..
                } => builder.operation(
                    *vertex,
                    Op::Signal {
                        sem: *sem,
                        count: *count,
                    },
                    Anchor::SignalVertex,
                ),
                _ => {}
            }
        }

        TraceGraph {
            graph: builder.graph.simplified(),
            semaphores: builder.semaphores,
        }
    }
}

enum Anchor {
    /// A wait is ordered after its `pre` vertex.
    WaitPost { pre: CompactId },
    /// A signal is ordered after the node its vertex displaced.
    SignalVertex,
}

struct Builder {
    graph: OpGraph,
    semaphores: BTreeMap<CompactId, Semaphore>,
    addr_to_node: HashMap<CompactId, NodeIdx>,
    free_addr: CompactId,
}

impl Builder {
    /// Node currently standing for `addr`; a fresh one hangs off the
    /// root (it has no recorded predecessor).
    fn node_at(&mut self, addr: CompactId) -> NodeIdx {
        if let Some(&idx) = self.addr_to_node.get(&addr) {
            return idx;
        }
        let idx = self.graph.add_node(Op::None, Some(addr));
        self.graph.add_edge(OpGraph::ROOT, idx);
        self.addr_to_node.insert(addr, idx);
        idx
    }

    fn edge(&mut self, pre: CompactId, post: CompactId) {
        if pre == post {
            return;
        }
        // Ensure the destination exists without attaching it to the
        // root: its only known predecessor is `pre`.
        if !self.addr_to_node.contains_key(&post) {
            let idx = self.graph.add_node(Op::None, Some(post));
            self.addr_to_node.insert(post, idx);
        }
        let pre_node = self.node_at(pre);
        let post_node = self.addr_to_node[&post];
        self.graph.add_edge(pre_node, post_node);
    }

    fn operation(&mut self, anchor: CompactId, op: Op, kind: Anchor) {
        if let Some(sem) = op.sem()
            && !self.semaphores.contains_key(&sem)
        {
            warn!(sem, "operation on a semaphore with no construction event");
            self.semaphores.insert(sem, Semaphore::new(sem, 0, sem));
        }

        let node = self.graph.add_node(op, Some(anchor));

        // Claim the anchor: the node previously standing for it moves to
        // a fresh synthetic address, keeping its edges. Anything that
        // later names the anchor now orders against this operation.
        let displaced = self.addr_to_node.get(&anchor).copied();
        if let Some(previous) = displaced {
            while self.addr_to_node.contains_key(&self.free_addr) {
                self.free_addr += 1;
            }
            self.addr_to_node.insert(self.free_addr, previous);
        }
        self.addr_to_node.insert(anchor, node);

        let parent = match kind {
            Anchor::WaitPost { pre } => self.node_at(pre),
            Anchor::SignalVertex => match displaced {
                Some(previous) => previous,
                None => {
                    // Vertex never seen: no recorded predecessor.
                    debug!(anchor, "signal vertex with no prior node, attaching to root");
                    OpGraph::ROOT
                }
            },
        };
        self.graph.add_edge(parent, node);
    }
}
