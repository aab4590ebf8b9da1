//! Subset-restricted deadlock search.
//!
//! Drives the schedule simulator over every topological sort of the
//! DAG, restricted to small semaphore subsets at a time. A deadlock in
//! practice requires circular wait among a handful of semaphores;
//! neutralizing operations outside the chosen subset keeps the
//! enumeration tractable while preserving every witness involving at
//! most `subset_size` semaphores.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use facet::Facet;
use snarl_types::CompactId;
use tracing::warn;

use crate::simulate::Execution;
use crate::{NodeIdx, Op, OpGraph, Semaphore, TraceGraph};

/// Bounds for the search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Largest semaphore subset examined. Every distinct subset of size
    /// 1..=`subset_size` is searched; raising this widens the class of
    /// detectable deadlocks at combinatorial cost.
    pub subset_size: usize,
    /// Skip any subset whose simplified graph has more nodes than this.
    /// An escape hatch for pathological traces; skipped subsets are
    /// reported on the diagnostic channel.
    pub max_nodes: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            subset_size: 3,
            max_nodes: None,
        }
    }
}

/// The state of a stalled simulation: evidence that the trace can
/// deadlock. Self-contained; it owns the (subset-simplified) graph the
/// schedule indexes into.
#[derive(Debug, Clone)]
pub struct Witness {
    pub graph: OpGraph,
    pub semaphores: BTreeMap<CompactId, Semaphore>,
    pub schedule: Vec<NodeIdx>,
    pub executed: Vec<bool>,
    pub first_possible_index: usize,
}

/// Per-semaphore debug artifact for a witness.
#[derive(Facet, Debug, Clone)]
pub struct SemaphoreDebug {
    pub sem_id: CompactId,
    pub unit_count: i64,
    pub waiting: u64,
    pub queue: Vec<QueuedOpDebug>,
}

#[derive(Facet, Debug, Clone)]
pub struct QueuedOpDebug {
    pub original_post: CompactId,
    pub r#type: String,
    pub count: u64,
}

impl Witness {
    /// One record per semaphore, queue contents included.
    pub fn debug_info(&self) -> Vec<SemaphoreDebug> {
        self.semaphores
            .values()
            .map(|sem| SemaphoreDebug {
                sem_id: sem.original_id,
                unit_count: sem.count,
                waiting: sem.queue.len() as u64,
                queue: sem
                    .queue
                    .iter()
                    .map(|parked| {
                        let node = self.graph.node(parked.node);
                        let (kind, count) = match node.op {
                            Op::Wait { count, .. } => ("wait", count),
                            Op::Signal { count, .. } => ("signal", count),
                            Op::None => ("none", 0),
                        };
                        QueuedOpDebug {
                            original_post: node.original_id.unwrap_or(0),
                            r#type: kind.to_string(),
                            count,
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

impl fmt::Display for Witness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Semaphores' state:")?;
        for sem in self.semaphores.values() {
            writeln!(f, "Semaphore with id {} has {} units", sem.id, sem.count)?;
            if !sem.queue.is_empty() {
                writeln!(f, "Semaphore's queue:")?;
                for parked in &sem.queue {
                    writeln!(f, "Index in execution chain: {}", parked.index)?;
                    writeln!(f, "{}", self.graph.node(parked.node).op)?;
                }
            }
            writeln!(f)?;
        }
        writeln!(f)?;

        if self.schedule.len() <= 20 {
            for (index, &node) in self.schedule.iter().enumerate() {
                if self.executed[index] {
                    writeln!(f, "\u{1b}[32mExecuted:\u{1b}[0m")?;
                } else {
                    writeln!(f, "\u{1b}[31mNot executed:\u{1b}[0m")?;
                }
                writeln!(f, "{}", self.graph.node(node).op)?;
                writeln!(f)?;
            }
        } else {
            // Long schedules: a window starting at the stall point.
            let end = self.schedule.len().min(self.first_possible_index + 20);
            for index in self.first_possible_index..end {
                if self.executed[index] {
                    writeln!(f, "Operation with index {index} was executed:")?;
                } else {
                    writeln!(f, "Operation with index {index} was not executed:")?;
                }
                writeln!(f, "{}", self.graph.node(self.schedule[index]).op)?;
            }
        }
        Ok(())
    }
}

/// Searches for a feasible schedule that stalls. Returns the first
/// witness found, or `None` when every subset admits every schedule.
pub fn find_deadlock(trace: &TraceGraph, options: &SearchOptions) -> Option<Witness> {
    let ids: Vec<CompactId> = trace.semaphores.keys().copied().collect();
    let mut subset = Vec::new();
    search_subsets(trace, &ids, 0, &mut subset, options)
}

/// Depth-first enumeration of semaphore subsets in ascending id order.
fn search_subsets(
    trace: &TraceGraph,
    ids: &[CompactId],
    start: usize,
    subset: &mut Vec<CompactId>,
    options: &SearchOptions,
) -> Option<Witness> {
    if !subset.is_empty() {
        let witness = search_subset(trace, subset, options);
        if witness.is_some() {
            return witness;
        }
    }
    if subset.len() >= options.subset_size.max(1) {
        return None;
    }
    for index in start..ids.len() {
        subset.push(ids[index]);
        let witness = search_subsets(trace, ids, index + 1, subset, options);
        subset.pop();
        if witness.is_some() {
            return witness;
        }
    }
    None
}

fn search_subset(
    trace: &TraceGraph,
    subset: &[CompactId],
    options: &SearchOptions,
) -> Option<Witness> {
    let sems: BTreeSet<CompactId> = subset.iter().copied().collect();
    let mut restricted = trace.graph.clone();
    restricted.restrict_to(&sems);
    let graph = restricted.simplified();

    if let Some(max_nodes) = options.max_nodes
        && graph.node_count() > max_nodes
    {
        warn!(
            nodes = graph.node_count(),
            max_nodes, "skipping subset over the node cutoff"
        );
        return None;
    }

    let semaphores: BTreeMap<CompactId, Semaphore> = trace
        .semaphores
        .iter()
        .filter(|(id, _)| sems.contains(id))
        .map(|(id, sem)| (*id, sem.clone()))
        .collect();

    let outcome = search_schedules(&graph, &semaphores).map(Execution::into_outcome);
    outcome.map(|outcome| Witness {
        graph,
        semaphores: outcome.semaphores,
        schedule: outcome.schedule,
        executed: outcome.executed,
        first_possible_index: outcome.first_possible_index,
    })
}

/// Enumerates every topological sort of `graph` and simulates each,
/// returning the first stalled execution.
fn search_schedules<'g>(
    graph: &'g OpGraph,
    semaphores: &BTreeMap<CompactId, Semaphore>,
) -> Option<Execution<'g>> {
    let mut indegree: Vec<usize> = graph.nodes().iter().map(|node| node.prev_count).collect();
    let mut frontier: Vec<NodeIdx> = (0..graph.node_count())
        .filter(|&idx| indegree[idx] == 0)
        .collect();
    let mut schedule: Vec<NodeIdx> = Vec::with_capacity(graph.node_count());
    descend(graph, semaphores, &mut indegree, &mut frontier, &mut schedule)
}

fn descend<'g>(
    graph: &'g OpGraph,
    semaphores: &BTreeMap<CompactId, Semaphore>,
    indegree: &mut [usize],
    frontier: &mut Vec<NodeIdx>,
    schedule: &mut Vec<NodeIdx>,
) -> Option<Execution<'g>> {
    if frontier.is_empty() {
        let mut execution = Execution::new(graph, semaphores, schedule.clone());
        if execution.run() {
            return None;
        }
        return Some(execution);
    }
    for position in 0..frontier.len() {
        let node = frontier.remove(position);
        schedule.push(node);
        let mut unlocked = 0;
        for &child in &graph.node(node).children {
            indegree[child] -= 1;
            if indegree[child] == 0 {
                frontier.push(child);
                unlocked += 1;
            }
        }
        let found = descend(graph, semaphores, indegree, frontier, schedule);
        frontier.truncate(frontier.len() - unlocked);
        for &child in &graph.node(node).children {
            indegree[child] += 1;
        }
        schedule.pop();
        frontier.insert(position, node);
        if found.is_some() {
            return found;
        }
    }
    None
}
