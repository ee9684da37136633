//! Stack and frame-pointer bookkeeping for fibers. The instruction dispatch
//! loop — the thing that actually executes `Op` values against a
//! concrete heap — lives outside this crate; what's here is the part of
//! the fiber model that doesn't depend on a value representation: stack
//! allocation and growth, the `coinit`/`coresume`/`coyield`/`coreturn` protocols
//! expressed as data transitions, and the frame-pointer chain the
//! unwinders in [`crate::unwind`] walk.

use crate::FiberId;
use warp_compiler::opcode::{Pc, Reg};

/// `[retVal, retInfo, retPc, retFp, params…]` — the four header slots
/// every call frame reserves before its params. Matches the emitter's
/// own frame header constant.
pub const FRAME_HEADER: u32 = 4;

/// Sentinel `parentDstLocal`/`catchErrDst` value meaning "no
/// destination — drop the value".
pub const NONE_DST: Reg = Reg::MAX;

const MIN_STACK_SLOTS: usize = 16;

/// `coinit`'s own top frame reserves five leading slots rather than the
/// usual four: it copies args into the new stack starting at slot 5.
/// The fifth slot is unused padding; nothing else in this
/// model writes to it.
const CO_HEADER: u32 = 5;

/// One stack slot as seen by this crate. The dispatch loop owns the
/// concrete value representation (a tagged union, an interned handle,
/// whatever) — this crate only moves slots around and occasionally
/// needs to stash a raw PC/FP in one (the frame header), so it asks for
/// just enough of an interface to do that.
pub trait Slot: Clone {
    /// The value written into padding slots and into a destination
    /// register whose call discarded its result (`NONE_DST`).
    fn none() -> Self;
    /// Encode a raw PC or frame-pointer index as a slot, for the frame
    /// header's `retPc`/`retFp` fields.
    fn from_u32(v: u32) -> Self;
    /// Decode a slot previously written by [`Slot::from_u32`]. Returns
    /// `None` if the slot doesn't hold one (a bug in the caller, not a
    /// recoverable condition).
    fn as_u32(&self) -> Option<u32>;
}

/// `{ fpAtEntry, catchPc, catchErrDst }`. Pushed
/// on `try`-region entry, popped on error propagation or normal exit.
#[derive(Debug, Clone, Copy)]
pub struct TryFrame {
    pub fp_at_entry: u32,
    pub catch_pc: Pc,
    pub catch_err_dst: Reg,
}

/// One `(pcOffset, fpOffset)` pair recorded for every frame a throw
/// passes through on its way to a catching try-frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrowTraceEntry {
    pub pc: Pc,
    pub fp: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ThrowTrace(pub Vec<ThrowTraceEntry>);

impl ThrowTrace {
    pub fn push(&mut self, pc: Pc, fp: u32) {
        self.0.push(ThrowTraceEntry { pc, fp });
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Distinguishes "never resumed" from "yielded" so `coresume` knows
/// whether to enter at `pcOffset` (initial entry) or `pcOffset + 3`
/// (past the `coyield` op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Created,
    Running,
    Yielded,
    Done,
}

/// `{ stackPtr, stackLen, stackOffset, pcOffset, initialPcOffset,
/// parentDstLocal, prevFiber, tryStack, throwTrace, panicPayload,
/// panicType }`. Each fiber owns its stack
/// allocation; `prevFiber` forms a singly linked stack of active
/// fibers, exactly one of which is "current" at any moment.
///
/// A `stackPtr`/`stackLen`/`stackOffset` triple describes a C-style VM
/// that multiplexes one contiguous stack buffer across fibers by
/// pointer-swapping; here each fiber owns an independent growable
/// `Vec<S>`, so those three collapse into `Vec`'s own capacity/len
/// bookkeeping plus `fp`. See DESIGN.md.
pub struct Fiber<S: Slot> {
    pub id: FiberId,
    stack: Vec<S>,
    /// Index of the current frame's `retVal` slot.
    pub fp: u32,
    /// Saved (while suspended) or live (while running) program counter.
    pub pc_offset: Pc,
    pub initial_pc_offset: Pc,
    pub parent_dst_local: Reg,
    pub prev_fiber: Option<FiberId>,
    pub try_stack: Vec<TryFrame>,
    pub throw_trace: ThrowTrace,
    pub panic_payload: Option<S>,
    pub panic_type: crate::PanicType,
    pub refcount: u32,
    state: FiberState,
}

impl<S: Slot> Fiber<S> {
    /// `coinit`: allocates a fresh stack of at least
    /// `max(16, numArgs + 5)` slots, copies `args` in starting at slot
    /// 5, and returns a handle with refcount 1.
    pub fn coinit(id: FiberId, args: &[S], entry_pc: Pc, caller_dst: Reg) -> Self {
        let min_len = (args.len() as u32 + CO_HEADER).max(MIN_STACK_SLOTS as u32) as usize;
        let mut stack = Vec::with_capacity(min_len);
        stack.resize(CO_HEADER as usize, S::none());
        stack.extend(args.iter().cloned());
        stack.resize(min_len, S::none());
        Fiber {
            id,
            stack,
            fp: 0,
            pc_offset: entry_pc,
            initial_pc_offset: entry_pc,
            parent_dst_local: caller_dst,
            prev_fiber: None,
            try_stack: Vec::new(),
            throw_trace: ThrowTrace::default(),
            panic_payload: None,
            panic_type: crate::PanicType::None,
            refcount: 1,
            state: FiberState::Created,
        }
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn len(&self) -> u32 {
        self.stack.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn get(&self, slot: u32) -> &S {
        &self.stack[slot as usize]
    }

    pub fn set(&mut self, slot: u32, v: S) {
        self.reserve_through(slot);
        self.stack[slot as usize] = v;
    }

    /// Grow the stack to make `slot` addressable, reallocating to
    /// ≥1.5× current capacity (min 16 slots) if needed. Because frames
    /// address slots through `fp` +
    /// offsets rather than raw pointers, growing the backing `Vec`
    /// never invalidates an in-flight `retFp` — there is no pointer
    /// chain to rewrite, only this capacity check.
    pub fn reserve_through(&mut self, slot: u32) {
        let needed = slot as usize + 1;
        if needed <= self.stack.len() {
            return;
        }
        let mut new_len = self.stack.len().max(MIN_STACK_SLOTS);
        while new_len < needed {
            new_len = (new_len + new_len / 2).max(new_len + 1);
        }
        self.stack.resize(new_len, S::none());
    }

    /// Step 2 of the call protocol: push a new frame at
    /// `call_start`, writing `retInfo`/`retPc`/`retFp` into its header
    /// and making it current. Returns the caller's frame pointer.
    pub fn push_frame(&mut self, call_start: u32, ret_pc: Pc, inst_len: u32) -> u32 {
        self.reserve_through(call_start + FRAME_HEADER - 1);
        self.stack[call_start as usize + 1] = S::from_u32(inst_len);
        self.stack[call_start as usize + 2] = S::from_u32(ret_pc);
        self.stack[call_start as usize + 3] = S::from_u32(self.fp);
        let caller_fp = self.fp;
        self.fp = call_start;
        caller_fp
    }

    /// Step 3 of the call protocol: the `ret0`/`ret1` epilogue restores
    /// `pc`/`fp` from the current frame's header. Returns
    /// `(retPc, retFp, retValSlot)` — `retValSlot` is where the callee
    /// left its result, still addressed relative to the *old* `fp`, so
    /// the dispatch loop must read it before this call's restored `fp`
    /// takes effect for further addressing.
    pub fn pop_frame(&mut self) -> (Pc, u32, u32) {
        self.frame_header_at(self.fp)
    }

    /// Read `(retPc, retFp)` out of the frame header at `fp` without
    /// disturbing `self.fp` — used by the unwinders to walk the frame
    /// chain of a fiber that isn't necessarily the running one.
    pub fn frame_header_at(&self, fp: u32) -> (Pc, u32, u32) {
        let ret_pc = self.stack[fp as usize + 2]
            .as_u32()
            .expect("retPc slot corrupted");
        let ret_fp = self.stack[fp as usize + 3]
            .as_u32()
            .expect("retFp slot corrupted");
        (ret_pc, ret_fp, fp)
    }

    /// Transition `Created`/`Yielded` → `Running`, returning the PC
    /// execution resumes at for `coresume`: if the target was previously
    /// yielded, resume at `pcOffset + 3`, otherwise at `pcOffset`.
    fn begin_resume(&mut self) -> Pc {
        let entry = match self.state {
            FiberState::Created => self.initial_pc_offset,
            FiberState::Yielded => self.pc_offset + 3,
            FiberState::Running | FiberState::Done => {
                panic!("coresume on a fiber that is already {:?}", self.state)
            }
        };
        self.state = FiberState::Running;
        self.pc_offset = entry;
        entry
    }

    fn mark_yielded(&mut self, at_pc: Pc) {
        self.pc_offset = at_pc;
        self.state = FiberState::Yielded;
    }

    fn mark_done(&mut self) {
        self.state = FiberState::Done;
    }

    /// Drop every slot after a teardown has released them. Freeing the
    /// backing allocation is then just `Vec`'s own `Drop`.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }
}

/// `coresume fiberSlot, dstSlot`. `target` must be
/// `Created` or `Yielded`. Links `target.prevFiber` to `current` and
/// returns the PC the dispatch loop should jump to.
pub fn coresume<S: Slot>(current: FiberId, target: &mut Fiber<S>) -> Pc {
    target.prev_fiber = Some(current);
    target.begin_resume()
}

/// `coyield`: saves the current PC, pops back to
/// `prevFiber`, and writes `none` into the parent's `parentDstLocal`
/// via the host-supplied `write_none` (this crate doesn't know how to
/// address another fiber's registers on its own). Returns the fiber
/// that becomes current again, if any.
pub fn coyield<S: Slot>(
    fiber: &mut Fiber<S>,
    at_pc: Pc,
    mut write_none: impl FnMut(FiberId, Reg),
) -> Option<FiberId> {
    fiber.mark_yielded(at_pc);
    let prev = fiber.prev_fiber.take();
    if let Some(parent) = prev {
        if fiber.parent_dst_local != NONE_DST {
            write_none(parent, fiber.parent_dst_local);
        }
    }
    prev
}

/// `coreturn`: pops the fiber, and either writes the
/// computed return value into the parent's `parentDstLocal` or, if
/// that's `NONE_DST`, releases it.
pub fn coreturn<S: Slot>(
    fiber: &mut Fiber<S>,
    ret_val: S,
    mut write_value: impl FnMut(FiberId, Reg, S),
    mut release: impl FnMut(S),
) -> Option<FiberId> {
    fiber.mark_done();
    let parent = fiber.prev_fiber.take();
    match parent {
        Some(p) if fiber.parent_dst_local != NONE_DST => {
            write_value(p, fiber.parent_dst_local, ret_val);
        }
        _ => release(ret_val),
    }
    parent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum TestSlot {
        None,
        Int(u32),
    }

    impl Slot for TestSlot {
        fn none() -> Self {
            TestSlot::None
        }
        fn from_u32(v: u32) -> Self {
            TestSlot::Int(v)
        }
        fn as_u32(&self) -> Option<u32> {
            match self {
                TestSlot::Int(v) => Some(*v),
                TestSlot::None => None,
            }
        }
    }

    fn fid(n: u32) -> FiberId {
        FiberId(n)
    }

    #[test]
    fn coinit_reserves_min_16_slots_and_places_args_at_slot_5() {
        let args = vec![TestSlot::Int(11), TestSlot::Int(22)];
        let f = Fiber::coinit(fid(0), &args, 100, 3);
        assert_eq!(f.len(), 16);
        assert_eq!(f.get(5), &TestSlot::Int(11));
        assert_eq!(f.get(6), &TestSlot::Int(22));
        assert_eq!(f.state(), FiberState::Created);
        assert_eq!(f.refcount, 1);
    }

    #[test]
    fn coinit_grows_for_large_arg_counts() {
        let args: Vec<_> = (0..20).map(TestSlot::Int).collect();
        let f = Fiber::coinit(fid(0), &args, 0, NONE_DST);
        assert!(f.len() as usize >= 20 + CO_HEADER as usize);
    }

    #[test]
    fn push_then_pop_frame_restores_caller() {
        let mut f = Fiber::coinit(fid(0), &[], 0, NONE_DST);
        f.fp = 0;
        let caller_fp = f.push_frame(8, 42, 10);
        assert_eq!(caller_fp, 0);
        assert_eq!(f.fp, 8);
        let (ret_pc, ret_fp, ret_val_slot) = f.pop_frame();
        assert_eq!(ret_pc, 42);
        assert_eq!(ret_fp, 0);
        assert_eq!(ret_val_slot, 8);
    }

    #[test]
    fn reserve_through_grows_by_at_least_one_and_a_half() {
        let mut f = Fiber::coinit(fid(0), &[], 0, NONE_DST);
        let before = f.len();
        f.reserve_through(before + 5);
        assert!(f.len() as f64 >= before as f64 * 1.5 || f.len() > before + 5);
    }

    #[test]
    fn coresume_enters_at_initial_pc_then_past_coyield_on_second_resume() {
        let mut target = Fiber::coinit(fid(1), &[], 200, NONE_DST);
        let entry = coresume(fid(0), &mut target);
        assert_eq!(entry, 200);
        assert_eq!(target.state(), FiberState::Running);

        let mut none_writes = Vec::new();
        target.parent_dst_local = 9;
        let back_to = coyield(&mut target, 250, |fid, reg| none_writes.push((fid, reg)));
        assert_eq!(back_to, Some(fid(0)));
        assert_eq!(none_writes, vec![(fid(0), 9)]);
        assert_eq!(target.state(), FiberState::Yielded);

        let resume_pc = coresume(fid(0), &mut target);
        assert_eq!(resume_pc, 253);
    }

    #[test]
    fn coreturn_drops_value_when_parent_dst_is_none_dst() {
        let mut f = Fiber::coinit(fid(1), &[], 0, NONE_DST);
        f.prev_fiber = Some(fid(0));
        let mut released = Vec::new();
        let parent = coreturn(
            &mut f,
            TestSlot::Int(7),
            |_, _, _| panic!("should not write"),
            |v| released.push(v),
        );
        assert_eq!(parent, Some(fid(0)));
        assert_eq!(released, vec![TestSlot::Int(7)]);
        assert_eq!(f.state(), FiberState::Done);
    }

    #[test]
    fn coreturn_writes_value_to_parent_dst_when_set() {
        let mut f = Fiber::coinit(fid(1), &[], 0, 4);
        f.prev_fiber = Some(fid(0));
        let mut writes = Vec::new();
        coreturn(
            &mut f,
            TestSlot::Int(9),
            |fid, reg, v| writes.push((fid, reg, v)),
            |_| panic!("should not release"),
        );
        assert_eq!(writes, vec![(fid(0), 4, TestSlot::Int(9))]);
    }
}
