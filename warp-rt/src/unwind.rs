//! The three unwind routines, all sharing one per-frame release unit:
//!
//! 1. **Normal return** — the emitter's own `ret0`/`ret1` epilogue runs
//!    the end-locals releases inline (see `BytecodeEmitter::emit_function_body`
//!    in warp-compiler); there is nothing left for this crate to do.
//! 2. **Throw** — [`unwind_throw`].
//! 3. **Fiber teardown** — [`unwind_fiber_teardown`].

use crate::fiber::{Fiber, FiberState, Slot, FRAME_HEADER, NONE_DST};
use warp_compiler::debuginfo::DebugSymbolTable;
use warp_compiler::opcode::{CodeBuffer, Op, Pc, Reg};

/// Registers an `EndLocalsRelease` op at `pc` names, or an empty slice
/// for a sentinel frame with no rc-candidate locals.
fn end_locals_regs(code: &CodeBuffer, pc: Pc) -> &[Reg] {
    match code.ops.get(pc as usize) {
        Some(Op::EndLocalsRelease { regs }) => regs,
        _ => &[],
    }
}

/// "Per-frame release": release every register the
/// frame's `EndLocalsRelease` op names, via the host-supplied
/// `release` callback — this crate has no value representation of its
/// own to release anything with. Temp releases at the throw point
/// itself are not replayed here: the emitter releases arc-temps inline
/// immediately after the statement that produced them (§4.4), so the
/// only temps ever live when control leaves a frame mid-expression are
/// ones the dispatch loop is already tracking as it evaluates that
/// expression, and it must release those before invoking this
/// unwinder.
fn release_frame_locals<S: Slot>(
    code: &CodeBuffer,
    fiber: &Fiber<S>,
    fp: u32,
    end_locals_pc: Pc,
    release: &mut impl FnMut(&S),
) {
    for &reg in end_locals_regs(code, end_locals_pc) {
        release(fiber.get(fp + reg as u32));
    }
}

/// Throw unwinding: starting from the throwing
/// frame, pop frames until the frame pointer matches the topmost
/// try-frame's `fpAtEntry`, releasing each intermediate frame's locals
/// and appending `(pc, fp)` to the fiber's throw trace. At the target
/// frame, copies `error` into the catch-dst slot (or releases it if the
/// try-frame has none) and returns its `catchPc`. Returns `None` if the
/// try-stack was empty — the fiber is now in a panic state
/// (`panic_payload`/`panic_type` are set) and control returns to the
/// fiber's host.
pub fn unwind_throw<S: Slot>(
    fiber: &mut Fiber<S>,
    code: &CodeBuffer,
    debug: &DebugSymbolTable,
    throw_pc: Pc,
    error: S,
    mut release: impl FnMut(&S),
) -> Option<Pc> {
    fiber.throw_trace.clear();
    let mut pc = throw_pc;
    let mut fp = fiber.fp;

    loop {
        let Some(try_frame) = fiber.try_stack.last().copied() else {
            fiber.panic_type = crate::PanicType::UncaughtError;
            fiber.panic_payload = Some(error);
            return None;
        };

        let end_locals_pc = debug.end_locals_pc_at(pc).unwrap_or(pc);

        if fp == try_frame.fp_at_entry {
            release_frame_locals(code, fiber, fp, end_locals_pc, &mut release);
            fiber.try_stack.pop();
            fiber.fp = fp;
            if try_frame.catch_err_dst == NONE_DST {
                release(&error);
            } else {
                fiber.set(fp + try_frame.catch_err_dst as u32, error);
            }
            return Some(try_frame.catch_pc);
        }

        release_frame_locals(code, fiber, fp, end_locals_pc, &mut release);
        fiber.throw_trace.push(pc, fp);

        let (ret_pc, ret_fp, _) = fiber.frame_header_at(fp);
        pc = ret_pc;
        fp = ret_fp;
    }
}

/// Fiber teardown: cancellation of a
/// fiber whose refcount reached zero while still alive. A fiber blocked
/// on `coyield` is unwound frame by frame from its saved PC, running
/// every frame's end-locals releases; a fiber blocked immediately after
/// `coinit` (never resumed) only has its argument slots released,
/// since no locals were ever declared. Finally drops the stack buffer.
pub fn unwind_fiber_teardown<S: Slot>(
    fiber: &mut Fiber<S>,
    code: &CodeBuffer,
    debug: &DebugSymbolTable,
    mut release: impl FnMut(&S),
) {
    match fiber.state() {
        FiberState::Created => {
            for slot in FRAME_HEADER..fiber.len() {
                release(fiber.get(slot));
            }
        }
        FiberState::Yielded => {
            let mut pc = fiber.pc_offset;
            let mut fp = fiber.fp;
            loop {
                let end_locals_pc = debug.end_locals_pc_at(pc).unwrap_or(pc);
                release_frame_locals(code, fiber, fp, end_locals_pc, &mut release);
                if fp == 0 {
                    break;
                }
                let (ret_pc, ret_fp, _) = fiber.frame_header_at(fp);
                pc = ret_pc;
                fp = ret_fp;
            }
        }
        FiberState::Running | FiberState::Done => {}
    }
    fiber.clear_stack();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::TryFrame;
    use crate::FiberId;
    use warp_compiler::opcode::Op;

    #[derive(Clone, Debug, PartialEq)]
    enum TestSlot {
        None,
        Int(u32),
        Err(&'static str),
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
                _ => None,
            }
        }
    }

    fn code_with_end_locals(frames: &[&[Reg]]) -> (CodeBuffer, Vec<Pc>) {
        let mut code = CodeBuffer::new();
        let mut pcs = Vec::new();
        for regs in frames {
            pcs.push(code.pc());
            code.emit(Op::EndLocalsRelease { regs: regs.to_vec() });
        }
        (code, pcs)
    }

    #[test]
    fn throw_releases_intermediate_frames_and_reaches_catch() {
        let (code, pcs) = code_with_end_locals(&[&[0, 1], &[2]]);
        let mut debug = DebugSymbolTable::new();
        debug.record(0, warp_compiler::NodeId(0), pcs[0]);
        debug.record(100, warp_compiler::NodeId(1), pcs[1]);

        let mut fiber: Fiber<TestSlot> = Fiber::coinit(FiberId(0), &[], 0, NONE_DST);
        fiber.try_stack.push(TryFrame {
            fp_at_entry: 0,
            catch_pc: 999,
            catch_err_dst: 3,
        });
        // Throwing frame is a child call at fp=20, whose caller (the
        // try-region's frame) is at fp=0 (retFp = 0, written by push_frame).
        fiber.reserve_through(30);
        fiber.push_frame(20, 999 /* unused */, 0);
        // Mark the registers each frame's EndLocalsRelease will release
        // with distinguishable values so the release order is checkable.
        fiber.set(20 + 2, TestSlot::Int(999)); // child reg 2
        fiber.set(0 + 0, TestSlot::Int(111)); // target reg 0
        fiber.set(0 + 1, TestSlot::Int(222)); // target reg 1

        let mut released = Vec::new();
        let catch_pc = unwind_throw(
            &mut fiber,
            &code,
            &debug,
            100,
            TestSlot::Err("boom"),
            |v| released.push(v.clone()),
        );

        assert_eq!(catch_pc, Some(999));
        // frame at fp=20 released reg 2; the try target frame at fp=0
        // released regs 0, 1 before the catch copy.
        assert_eq!(
            released,
            vec![TestSlot::Int(999), TestSlot::Int(111), TestSlot::Int(222)]
        );
        assert_eq!(fiber.throw_trace.0.len(), 1);
        assert_eq!(fiber.throw_trace.0[0].pc, 100);
        assert_eq!(fiber.throw_trace.0[0].fp, 20);
        assert_eq!(fiber.get(3), &TestSlot::Err("boom"));
        assert!(fiber.try_stack.is_empty());
    }

    #[test]
    fn throw_with_empty_try_stack_panics_fiber() {
        let mut code = CodeBuffer::new();
        code.emit(Op::EndLocalsRelease { regs: vec![] });
        let debug = DebugSymbolTable::new();
        let mut fiber: Fiber<TestSlot> = Fiber::coinit(FiberId(0), &[], 0, NONE_DST);

        let result = unwind_throw(&mut fiber, &code, &debug, 0, TestSlot::Err("x"), |_| {});
        assert_eq!(result, None);
        assert_eq!(fiber.panic_type, crate::PanicType::UncaughtError);
        assert_eq!(fiber.panic_payload, Some(TestSlot::Err("x")));
    }

    #[test]
    fn teardown_of_never_resumed_fiber_releases_only_args() {
        let args = vec![TestSlot::Int(1), TestSlot::Int(2)];
        let mut fiber: Fiber<TestSlot> = Fiber::coinit(FiberId(0), &args, 0, NONE_DST);
        let code = CodeBuffer::new();
        let debug = DebugSymbolTable::new();

        let mut released = Vec::new();
        unwind_fiber_teardown(&mut fiber, &code, &debug, |v| released.push(v.clone()));

        assert_eq!(released.len(), fiber.len() as usize - FRAME_HEADER as usize);
        assert!(fiber.is_empty());
    }

    #[test]
    fn teardown_of_yielded_fiber_walks_every_frame() {
        let (code, pcs) = code_with_end_locals(&[&[0], &[1]]);
        let mut debug = DebugSymbolTable::new();
        debug.record(0, warp_compiler::NodeId(0), pcs[0]);
        debug.record(50, warp_compiler::NodeId(1), pcs[1]);

        let mut fiber: Fiber<TestSlot> = Fiber::coinit(FiberId(0), &[], 0, NONE_DST);
        fiber.reserve_through(30);
        fiber.push_frame(10, 0, 0);
        fiber.pc_offset = 50;
        fiber.set(10 + 1, TestSlot::Int(77)); // child reg 1
        fiber.set(0 + 0, TestSlot::Int(33)); // root reg 0

        let mut released = Vec::new();
        unwind_fiber_teardown(&mut fiber, &code, &debug, |v| released.push(v.clone()));

        assert_eq!(released, vec![TestSlot::Int(77), TestSlot::Int(33)]);
        assert!(fiber.is_empty());
    }
}
