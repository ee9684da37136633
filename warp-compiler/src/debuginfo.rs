//! Maps bytecode positions back to AST nodes for unwinding and host
//! diagnostics. The runtime's
//! unwinders need, given a PC, both "which node produced this
//! instruction" and "where does this node's locals-release sequence
//! begin" — the latter tells a fiber teardown exactly how many trailing
//! `release` ops to run without re-deriving it from the AST.

use crate::opcode::Pc;
use crate::NodeId;

#[derive(Debug, Clone, Copy)]
struct Entry {
    pc: Pc,
    node: NodeId,
    end_locals_pc: Pc,
}

/// A PC-sorted table of (node, end-locals-pc) entries, built by the
/// emitter as it walks the AST and appended to monotonically — emission
/// proceeds in increasing PC order, so entries are always inserted at
/// the end already sorted.
#[derive(Debug, Default)]
pub struct DebugSymbolTable {
    entries: Vec<Entry>,
}

impl DebugSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that instructions starting at `pc` belong to `node`, and
    /// that node's end-of-scope release sequence begins at
    /// `end_locals_pc`.
    pub fn record(&mut self, pc: Pc, node: NodeId, end_locals_pc: Pc) {
        debug_assert!(
            self.entries.last().map_or(true, |e| pc >= e.pc),
            "DebugSymbolTable entries must be recorded in non-decreasing pc order"
        );
        self.entries.push(Entry { pc, node, end_locals_pc });
    }

    /// Retroactively set `end_locals_pc` on every entry recorded at or
    /// after `from_pc`. A function body's real end-locals PC (where its
    /// block-end release sequence begins) is only known once the whole
    /// body has been emitted, but [`Self::record`] is called statement by
    /// statement as the body is walked — so the emitter first records
    /// each statement with a placeholder and patches the whole run once
    /// the epilogue's PC is in hand.
    pub fn patch_end_locals_from(&mut self, from_pc: Pc, end_locals_pc: Pc) {
        let start = self.entries.partition_point(|e| e.pc < from_pc);
        for e in &mut self.entries[start..] {
            e.end_locals_pc = end_locals_pc;
        }
    }

    /// Find the node owning `pc`: the entry with the greatest `pc` not
    /// exceeding the query, found by binary search since entries are
    /// pc-sorted by construction.
    pub fn node_at(&self, pc: Pc) -> Option<NodeId> {
        self.lookup(pc).map(|e| e.node)
    }

    /// Find where the owning node's end-of-scope release sequence
    /// begins, so a fiber teardown unwinder knows how many locals are
    /// still live to release at this PC.
    pub fn end_locals_pc_at(&self, pc: Pc) -> Option<Pc> {
        self.lookup(pc).map(|e| e.end_locals_pc)
    }

    fn lookup(&self, pc: Pc) -> Option<&Entry> {
        match self.entries.binary_search_by_key(&pc, |e| e.pc) {
            Ok(idx) => Some(&self.entries[idx]),
            Err(0) => None,
            Err(idx) => Some(&self.entries[idx - 1]),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_owning_entry_between_marks() {
        let mut t = DebugSymbolTable::new();
        let n0 = NodeId(0);
        let n1 = NodeId(1);
        t.record(0, n0, 3);
        t.record(5, n1, 8);
        assert_eq!(t.node_at(0), Some(n0));
        assert_eq!(t.node_at(4), Some(n0));
        assert_eq!(t.node_at(5), Some(n1));
        assert_eq!(t.node_at(100), Some(n1));
        assert_eq!(t.end_locals_pc_at(4), Some(3));
    }

    #[test]
    fn pc_before_first_entry_is_none() {
        let mut t = DebugSymbolTable::new();
        t.record(10, NodeId(0), 12);
        assert_eq!(t.node_at(0), None);
    }
}
