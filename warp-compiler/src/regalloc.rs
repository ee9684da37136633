//! Per-block temp-slot allocation. Locals get a fixed
//! register number once at block-build time; temps are allocated with
//! stack discipline on top of them, with one twist — some temps hold a
//! value that was produced with a `+1` retain and must survive until the
//! enclosing "arc expression" ends, so they cannot simply be popped when
//! the expression that produced them finishes.

/// A saved `next_temp` watermark, taken at the start of a statement that
/// may retain intermediate results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempMark(pub u32);

#[derive(Debug)]
pub struct RegisterPlanner {
    num_locals: u32,
    next_temp: u32,
    /// temps currently holding a retained value, oldest first; popped in
    /// LIFO chunks by `end_arc_expr`.
    arc_temps: Vec<u32>,
    /// temps a loop (or other construct) has pinned for its whole body,
    /// so ordinary end-of-statement resets must not allocate below them.
    reserved: Vec<u32>,
}

impl RegisterPlanner {
    pub fn new(num_locals: u32) -> Self {
        Self { num_locals, next_temp: num_locals, arc_temps: Vec::new(), reserved: Vec::new() }
    }

    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    pub fn next_free_temp(&self) -> u32 {
        self.next_temp
    }

    /// Start of a statement's arc-expression region.
    pub fn begin_arc_expr(&self) -> TempMark {
        TempMark(self.next_temp)
    }

    /// Allocate a fresh temp slot, bumping the watermark.
    pub fn next_free_temp_local(&mut self) -> u32 {
        let slot = self.next_temp;
        self.next_temp += 1;
        slot
    }

    /// Record that `slot` (already allocated via `next_free_temp_local`)
    /// holds a retained value that must be released at `end_arc_expr`.
    pub fn mark_arc_temp(&mut self, slot: u32) {
        self.arc_temps.push(slot);
    }

    /// Pin `slot` so it survives across statement boundaries inside a
    /// construct (e.g. a `for` loop's counter/iterator) until
    /// `unreserve_temp_local` is called.
    pub fn set_reserved_temp_local(&mut self, slot: u32) {
        self.reserved.push(slot);
    }

    pub fn unreserve_temp_local(&mut self, slot: u32) {
        if let Some(pos) = self.reserved.iter().position(|&s| s == slot) {
            self.reserved.swap_remove(pos);
        }
    }

    /// Before emitting a call/construction op: guarantee every temp from
    /// here on is fresh and contiguous, so operand packing (argument
    /// slots, list/map/object element slots) can assume a run of
    /// consecutive registers. Since every live arc-temp was itself
    /// allocated through `next_free_temp_local`, the watermark is already
    /// past all of them — this simply names that position for the
    /// caller.
    pub fn advance_next_temp_local_past_arc_temps(&mut self) -> u32 {
        self.next_temp
    }

    /// Reset the temp watermark back to `mark`, except never below the
    /// highest pinned reserved slot (a loop in progress still owns its
    /// counter/iterator temps).
    pub fn compute_next_temp_local_from(&mut self, mark: TempMark) {
        let floor = self.reserved.iter().copied().max().map_or(0, |m| m + 1);
        self.next_temp = mark.0.max(floor);
    }

    /// End the arc expression started at `mark`: return every arc-temp
    /// allocated since then (for `release` emission, most-recent first)
    /// and reset the watermark.
    pub fn end_arc_expr(&mut self, mark: TempMark) -> Vec<u32> {
        let mut released = Vec::new();
        self.arc_temps.retain(|&slot| {
            if slot >= mark.0 {
                released.push(slot);
                false
            } else {
                true
            }
        });
        released.sort_unstable_by(|a, b| b.cmp(a));
        self.compute_next_temp_local_from(mark);
        released
    }

    /// Invariant 1: at every statement boundary the
    /// first-free-temp watermark must equal the block's `numLocals`. A
    /// debug assertion, not a runtime check — release builds trust the
    /// emitter.
    pub fn assert_statement_boundary(&self) {
        debug_assert_eq!(
            self.next_temp, self.num_locals,
            "leaked retain: temp watermark {} != numLocals {} at statement boundary",
            self.next_temp, self.num_locals
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_expr_returns_to_watermark() {
        let mut p = RegisterPlanner::new(3);
        let mark = p.begin_arc_expr();
        let t0 = p.next_free_temp_local();
        p.mark_arc_temp(t0);
        let released = p.end_arc_expr(mark);
        assert_eq!(released, vec![t0]);
        p.assert_statement_boundary();
    }

    #[test]
    fn contiguous_operand_packing_for_construction() {
        let mut p = RegisterPlanner::new(2);
        let mark = p.begin_arc_expr();
        // one retained sub-expression produced before the constructor call
        let held = p.next_free_temp_local();
        p.mark_arc_temp(held);
        let first_arg = p.advance_next_temp_local_past_arc_temps();
        assert_eq!(first_arg, held + 1);
        let a0 = p.next_free_temp_local();
        let a1 = p.next_free_temp_local();
        assert_eq!((a0, a1), (first_arg, first_arg + 1));
        p.end_arc_expr(mark);
        p.assert_statement_boundary();
    }

    #[test]
    fn reserved_temps_survive_resets() {
        let mut p = RegisterPlanner::new(1);
        let mark = p.begin_arc_expr();
        let counter = p.next_free_temp_local();
        p.set_reserved_temp_local(counter);
        // body statement inside the loop allocates and releases a temp
        let body_mark = p.begin_arc_expr();
        let t = p.next_free_temp_local();
        p.mark_arc_temp(t);
        p.end_arc_expr(body_mark);
        // the reset must not reclaim the reserved counter slot
        assert!(p.next_free_temp() > counter);
        p.unreserve_temp_local(counter);
        p.compute_next_temp_local_from(mark);
        p.assert_statement_boundary();
    }

    #[test]
    #[should_panic(expected = "leaked retain")]
    fn leaked_temp_trips_the_debug_assertion() {
        let mut p = RegisterPlanner::new(0);
        p.next_free_temp_local();
        p.assert_statement_boundary();
    }

    proptest::proptest! {
        /// Invariant 1, fuzzed over arbitrary statement
        /// shapes: however many arc-temps a statement allocates, ending
        /// its arc expression always returns the watermark to
        /// `numLocals` before the next statement starts.
        #[test]
        fn statement_boundary_holds_for_arbitrary_arc_temp_counts(
            per_statement_temp_counts in proptest::collection::vec(0u32..6, 1..20)
        ) {
            let mut p = RegisterPlanner::new(4);
            for n in per_statement_temp_counts {
                let mark = p.begin_arc_expr();
                for _ in 0..n {
                    let t = p.next_free_temp_local();
                    p.mark_arc_temp(t);
                }
                p.end_arc_expr(mark);
                p.assert_statement_boundary();
            }
        }
    }
}
