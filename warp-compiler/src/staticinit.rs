//! Ordering of top-level (`static`) variable initializers. Each static
//! var/function with a
//! side-effecting initializer is a node in a dependency graph — an edge
//! `a -> b` means "`a`'s initializer reads `b`, so `b` must run first" —
//! and the scheduler linearizes that graph with a DFS post-order walk,
//! the same shape as a topological sort but permissive of cycles.

use crate::symtab::SymId;
use fxhash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Dependency graph over static symbols: `deps[a]` is every symbol `a`'s
/// initializer reads.
#[derive(Debug, Default)]
pub struct StaticInitScheduler {
    deps: FxHashMap<SymId, Vec<SymId>>,
}

/// A dependency edge that closes a cycle. Not fatal — a cycle resolves
/// to running the member that completes it with its
/// not-yet-initialized dependencies reading as `none`, with a warning
/// gated behind [`crate::CFlag::WarnStaticInitCycle`] — so this is
/// reported, not returned as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleEdge {
    pub from: SymId,
    pub to: SymId,
}

impl StaticInitScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of symbols registered as schedulable static-init nodes.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Declare that `sym`'s initializer reads `dep`. Both ends are
    /// implicitly registered as schedulable nodes even if one of them
    /// has no dependencies of its own.
    pub fn add_dependency(&mut self, sym: SymId, dep: SymId) {
        self.deps.entry(sym).or_default().push(dep);
        self.deps.entry(dep).or_default();
    }

    pub fn register(&mut self, sym: SymId) {
        self.deps.entry(sym).or_default();
    }

    /// Run the DFS post-order walk over every registered symbol,
    /// returning the initializer order and the cycle edges encountered
    /// along the way. Root iteration order comes from `deps`' hash map,
    /// not registration order — but `FxHashMap` carries no randomized
    /// seed, so the same set of registered symbols always yields the
    /// same root order, and hence the same schedule, run to run.
    pub fn schedule(&self) -> (Vec<SymId>, Vec<CycleEdge>) {
        let mut marks: FxHashMap<SymId, Mark> = FxHashMap::default();
        let mut cycles = Vec::new();
        let mut order = Vec::new();
        let roots: Vec<SymId> = self.deps.keys().copied().collect();
        for root in roots {
            visit(&self.deps, root, &mut marks, &mut cycles, &mut order);
        }
        (order, cycles)
    }
}

fn visit(
    deps: &FxHashMap<SymId, Vec<SymId>>,
    sym: SymId,
    marks: &mut FxHashMap<SymId, Mark>,
    cycles: &mut Vec<CycleEdge>,
    order: &mut Vec<SymId>,
) {
    match marks.get(&sym) {
        Some(Mark::Done) | Some(Mark::InProgress) => return,
        None => {}
    }
    marks.insert(sym, Mark::InProgress);
    if let Some(d) = deps.get(&sym) {
        for dep in d.clone() {
            match marks.get(&dep) {
                Some(Mark::InProgress) => cycles.push(CycleEdge { from: sym, to: dep }),
                _ => visit(deps, dep, marks, cycles, order),
            }
        }
    }
    marks.insert(sym, Mark::Done);
    order.push(sym);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(n: u32) -> SymId {
        SymId(n)
    }

    #[test]
    fn independent_nodes_each_appear_once() {
        let mut sched = StaticInitScheduler::new();
        sched.register(sym(0));
        sched.register(sym(1));
        let (order, cycles) = sched.schedule();
        assert!(cycles.is_empty());
        assert_eq!(order.len(), 2);
        assert!(order.contains(&sym(0)));
        assert!(order.contains(&sym(1)));
    }

    #[test]
    fn dependency_runs_before_dependent() {
        let mut sched = StaticInitScheduler::new();
        sched.add_dependency(sym(0), sym(1));
        let (order, cycles) = sched.schedule();
        assert!(cycles.is_empty());
        let pos1 = order.iter().position(|s| *s == sym(1)).unwrap();
        let pos0 = order.iter().position(|s| *s == sym(0)).unwrap();
        assert!(pos1 < pos0);
    }

    #[test]
    fn cycle_is_reported_not_fatal() {
        let mut sched = StaticInitScheduler::new();
        sched.add_dependency(sym(0), sym(1));
        sched.add_dependency(sym(1), sym(0));
        let (order, cycles) = sched.schedule();
        assert_eq!(order.len(), 2);
        assert_eq!(cycles.len(), 1);
    }

    #[test]
    fn diamond_dependency_resolves_shared_node_once() {
        let mut sched = StaticInitScheduler::new();
        sched.add_dependency(sym(0), sym(1));
        sched.add_dependency(sym(0), sym(2));
        sched.add_dependency(sym(1), sym(3));
        sched.add_dependency(sym(2), sym(3));
        let (order, cycles) = sched.schedule();
        assert!(cycles.is_empty());
        assert_eq!(order.iter().filter(|s| **s == sym(3)).count(), 1);
        let pos3 = order.iter().position(|s| *s == sym(3)).unwrap();
        let pos0 = order.iter().position(|s| *s == sym(0)).unwrap();
        assert!(pos3 < pos0);
    }
}
