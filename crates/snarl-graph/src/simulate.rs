//! Schedule simulation under semaphore semantics.
//!
//! Given a candidate total order of the DAG (a topological sort) and the
//! initial semaphore counts, replays the operations and reports whether
//! every one of them completed. A stalled replay is the deadlock
//! witness.

use std::collections::BTreeMap;

use snarl_types::CompactId;

use crate::{NodeIdx, Op, OpGraph, Semaphore};

/// One simulation attempt. Created fresh per candidate schedule: the
/// semaphore map is deep-copied, the graph is only read.
pub struct Execution<'g> {
    graph: &'g OpGraph,
    semaphores: BTreeMap<CompactId, Semaphore>,
    schedule: Vec<NodeIdx>,
    executed: Vec<bool>,
    first_possible_index: usize,
    executed_count: usize,
    /// Per node, how many of its parents have executed.
    arrived: Vec<usize>,
    /// Per node, whether it is parked on a semaphore queue.
    waiting: Vec<bool>,
}

/// Final state of an attempt, detached from the graph borrow so the
/// search can hand it back together with an owned graph.
pub(crate) struct Outcome {
    pub(crate) semaphores: BTreeMap<CompactId, Semaphore>,
    pub(crate) schedule: Vec<NodeIdx>,
    pub(crate) executed: Vec<bool>,
    pub(crate) first_possible_index: usize,
}

impl<'g> Execution<'g> {
    pub fn new(
        graph: &'g OpGraph,
        semaphores: &BTreeMap<CompactId, Semaphore>,
        schedule: Vec<NodeIdx>,
    ) -> Self {
        let positions = schedule.len();
        Self {
            graph,
            semaphores: semaphores.clone(),
            schedule,
            executed: vec![false; positions],
            first_possible_index: 0,
            executed_count: 0,
            arrived: vec![0; graph.node_count()],
            waiting: vec![false; graph.node_count()],
        }
    }

    /// Replays the schedule until it completes or stalls. Returns
    /// whether every operation executed.
    pub fn run(&mut self) -> bool {
        while let Some((node, index)) = self.next_operation() {
            self.attempt(node, index);
        }
        self.completed()
    }

    pub fn completed(&self) -> bool {
        self.executed_count == self.schedule.len()
    }

    pub(crate) fn into_outcome(self) -> Outcome {
        Outcome {
            semaphores: self.semaphores,
            schedule: self.schedule,
            executed: self.executed,
            first_possible_index: self.first_possible_index,
        }
    }

    /// A node may be attempted once all its parents have executed and it
    /// is not parked on a semaphore.
    fn is_executable(&self, node: NodeIdx) -> bool {
        self.arrived[node] == self.graph.node(node).prev_count && !self.waiting[node]
    }

    /// Picks the next operation:
    /// 1. the first unexecuted schedule position, if ready;
    /// 2. else the head of any semaphore queue the count can now admit
    ///    (semaphores scanned in id order; only heads are eligible);
    /// 3. else, scanning forward, any ready operation that cannot block.
    ///
    /// Parked waits are deliberately invisible to step 3; only step 2
    /// can revive them. Preferring signals in the forward scan never
    /// hides a feasible schedule: a signal can always be pushed earlier
    /// without creating new blocks.
    fn next_operation(&mut self) -> Option<(NodeIdx, usize)> {
        if self.first_possible_index >= self.schedule.len() {
            return None;
        }
        let head = self.schedule[self.first_possible_index];
        if self.is_executable(head) {
            return Some((head, self.first_possible_index));
        }

        let mut admitted = None;
        for sem in self.semaphores.values_mut() {
            if let Some(wait) = sem.admit_head() {
                admitted = Some(wait);
                break;
            }
        }
        if let Some(wait) = admitted {
            self.waiting[wait.node] = false;
            return Some((wait.node, wait.index));
        }

        for index in self.first_possible_index + 1..self.schedule.len() {
            let node = self.schedule[index];
            if !self.executed[index]
                && self.is_executable(node)
                && self.graph.node(node).op.delta() >= 0
            {
                return Some((node, index));
            }
        }
        None
    }

    /// Attempts the operation at schedule position `index`. Returns
    /// false if it parked on its semaphore.
    fn attempt(&mut self, node: NodeIdx, index: usize) -> bool {
        debug_assert!(!self.executed[index]);
        let (sem_id, delta) = match self.graph.node(node).op {
            Op::None => {
                self.mark_executed(node, index);
                return true;
            }
            Op::Wait { sem, count } => (sem, -(count as i64)),
            Op::Signal { sem, count } => (sem, count as i64),
        };
        let Some(sem) = self.semaphores.get_mut(&sem_id) else {
            // The builder materializes every referenced semaphore; a
            // miss would mean the schedule and graph disagree.
            debug_assert!(false, "operation on unmapped semaphore {sem_id}");
            self.mark_executed(node, index);
            return true;
        };
        if sem.apply(node, index, delta) {
            self.mark_executed(node, index);
            true
        } else {
            self.waiting[node] = true;
            false
        }
    }

    fn mark_executed(&mut self, node: NodeIdx, index: usize) {
        let graph = self.graph;
        for &child in &graph.node(node).children {
            self.arrived[child] += 1;
        }
        self.executed[index] = true;
        self.executed_count += 1;
        if index == self.first_possible_index {
            while self.first_possible_index < self.executed.len()
                && self.executed[self.first_possible_index]
            {
                self.first_possible_index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TraceGraph;
    use snarl_types::NormalizedEvent;

    fn sem_ctor(sem: CompactId, count: u64, timestamp: i64) -> NormalizedEvent {
        NormalizedEvent::SemCtor {
            sem,
            count,
            timestamp,
        }
    }

    fn wait(
        sem: CompactId,
        pre: CompactId,
        post: CompactId,
        count: u64,
        timestamp: i64,
    ) -> NormalizedEvent {
        NormalizedEvent::SemWait {
            sem,
            pre,
            post,
            count,
            timestamp,
        }
    }

    fn signal(sem: CompactId, vertex: CompactId, count: u64, timestamp: i64) -> NormalizedEvent {
        NormalizedEvent::SemSignal {
            sem,
            vertex,
            count,
            timestamp,
        }
    }

    /// A schedule in arena order. Simplified arenas are laid out in
    /// topological order, so this is always a valid candidate.
    fn arena_schedule(graph: &OpGraph) -> Vec<NodeIdx> {
        (0..graph.node_count()).collect()
    }

    fn wait_node(graph: &OpGraph, original: CompactId) -> NodeIdx {
        graph
            .nodes()
            .iter()
            .position(|n| matches!(n.op, Op::Wait { .. }) && n.original_id == Some(original))
            .expect("wait node")
    }

    fn signal_node(graph: &OpGraph, original: CompactId) -> NodeIdx {
        graph
            .nodes()
            .iter()
            .position(|n| matches!(n.op, Op::Signal { .. }) && n.original_id == Some(original))
            .expect("signal node")
    }

    #[test]
    fn feasible_chain_completes() {
        let trace = TraceGraph::build(&[
            sem_ctor(0, 1, 0),
            wait(0, 10, 11, 1, 10),
            signal(0, 11, 1, 20),
        ]);
        let mut execution = Execution::new(
            &trace.graph,
            &trace.semaphores,
            arena_schedule(&trace.graph),
        );
        assert!(execution.run());
        assert_eq!(execution.semaphores[&0].count, 1);
    }

    #[test]
    fn blocked_wait_parks_and_stalls() {
        let trace = TraceGraph::build(&[sem_ctor(0, 0, 0), wait(0, 10, 11, 1, 10)]);
        let mut execution = Execution::new(
            &trace.graph,
            &trace.semaphores,
            arena_schedule(&trace.graph),
        );
        assert!(!execution.run());
        let sem = &execution.semaphores[&0];
        assert_eq!(sem.count, 0);
        assert_eq!(sem.queue.len(), 1);
        assert_eq!(execution.first_possible_index, 1);
    }

    #[test]
    fn out_of_order_signal_unblocks_a_parked_wait() {
        // Consumer wait scheduled before the producer signal, with no
        // ordering between them. The forward scan may only pick the
        // signal; the wait is then admitted from the queue.
        let trace = TraceGraph::build(&[
            sem_ctor(0, 0, 0),
            wait(0, 20, 21, 1, 10),
            signal(0, 10, 1, 20),
        ]);
        // Schedule the wait ahead of the signal.
        let wait_idx = trace
            .graph
            .nodes()
            .iter()
            .position(|n| matches!(n.op, Op::Wait { .. }))
            .expect("wait node");
        let signal_idx = trace
            .graph
            .nodes()
            .iter()
            .position(|n| matches!(n.op, Op::Signal { .. }))
            .expect("signal node");
        let schedule = vec![OpGraph::ROOT, wait_idx, signal_idx];
        let mut execution = Execution::new(&trace.graph, &trace.semaphores, schedule);
        assert!(execution.run());
        assert_eq!(execution.semaphores[&0].count, 0);
        assert!(execution.semaphores[&0].queue.is_empty());
    }

    #[test]
    fn queue_admission_is_fifo() {
        // Two waits park on an empty semaphore; a signal of 1 must wake
        // the first-parked wait only.
        let trace = TraceGraph::build(&[
            sem_ctor(0, 0, 0),
            wait(0, 10, 11, 1, 10),
            wait(0, 20, 21, 1, 11),
            signal(0, 30, 1, 20),
        ]);
        let first_wait = wait_node(&trace.graph, 11);
        let second_wait = wait_node(&trace.graph, 21);
        let producer = signal_node(&trace.graph, 30);
        let schedule = vec![OpGraph::ROOT, first_wait, second_wait, producer];
        let mut execution = Execution::new(&trace.graph, &trace.semaphores, schedule);
        assert!(!execution.run());
        let sem = &execution.semaphores[&0];
        // The signal's unit went to the first-parked wait; the second is
        // still parked.
        assert_eq!(sem.count, 0);
        assert_eq!(sem.queue.len(), 1);
        let parked = sem.queue.front().expect("parked wait");
        assert_eq!(parked.node, second_wait);
    }

    #[test]
    fn counts_never_go_negative_and_units_are_conserved() {
        let trace = TraceGraph::build(&[
            sem_ctor(0, 2, 0),
            wait(0, 10, 11, 2, 10),
            signal(0, 11, 1, 20),
            wait(0, 30, 31, 1, 30),
        ]);
        let mut execution = Execution::new(
            &trace.graph,
            &trace.semaphores,
            arena_schedule(&trace.graph),
        );
        let initial = trace.semaphores[&0].count;
        let mut signalled = 0i64;
        let mut taken = 0i64;
        while let Some((node, index)) = execution.next_operation() {
            let op = execution.graph.node(node).op;
            if execution.attempt(node, index) {
                match op {
                    Op::Signal { count, .. } => signalled += count as i64,
                    Op::Wait { count, .. } => taken += count as i64,
                    Op::None => {}
                }
            }
            let sem = &execution.semaphores[&0];
            assert!(sem.count >= 0);
            assert_eq!(sem.count, initial + signalled - taken);
        }
        assert!(execution.completed());
    }

    #[test]
    fn any_topological_sort_of_a_feasible_dag_completes() {
        // Two independent tasks on a semaphore with enough units: every
        // interleaving must succeed.
        let trace = TraceGraph::build(&[
            sem_ctor(0, 2, 0),
            wait(0, 10, 11, 1, 10),
            signal(0, 11, 1, 20),
            wait(0, 20, 21, 1, 11),
            signal(0, 21, 1, 21),
        ]);
        let wait_a = wait_node(&trace.graph, 11);
        let signal_a = signal_node(&trace.graph, 11);
        let wait_b = wait_node(&trace.graph, 21);
        let signal_b = signal_node(&trace.graph, 21);
        let interleavings = [
            vec![wait_a, signal_a, wait_b, signal_b],
            vec![wait_b, signal_b, wait_a, signal_a],
            vec![wait_a, wait_b, signal_a, signal_b],
            vec![wait_b, wait_a, signal_b, signal_a],
        ];
        for interleaving in interleavings {
            let mut schedule = vec![OpGraph::ROOT];
            schedule.extend(interleaving);
            let mut execution = Execution::new(&trace.graph, &trace.semaphores, schedule);
            assert!(execution.run());
        }
    }
}
