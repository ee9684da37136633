//! Bytecode emission over an already-analyzed [`Chunk`]. The emitter
//! never re-derives anything the analyzer settled —
//! every identifier, call, and operator node it visits already carries a
//! [`crate::analyzer::NodeInfo`] saying exactly what to do with it. This
//! pass walks the AST exactly once per function body (the analyzer's
//! finished [`Block`]s are consumed, not re-built) and produces a flat
//! [`CodeBuffer`] plus a [`DebugSymbolTable`].

use crate::analyzer::{Annotations, OpStrategy, SemanticAnalyzer};
use crate::ast::{BinOp, Chunk, Node, NodeKind, UnOp};
use crate::block::{Block, LocalId, LocalKind};
use crate::debuginfo::DebugSymbolTable;
use crate::intern::NameId;
use crate::opcode::{ArithOp, BitOp, CmpOp, CodeBuffer, Constant, FieldSymIdx, MethodGroupId, Op, Pc, Reg};
use crate::regalloc::{RegisterPlanner, TempMark};
use crate::symtab::{FuncSymId, Symbol, SymId, ROOT};
use crate::types::TypeId;
use crate::{report_soft_warning, CFlag, NodeId};
use fxhash::FxHashMap;

/// A register slot reserved for a value nobody reads; emitting to it is
/// equivalent to evaluating the node purely for side effects.
const DISCARD: Reg = Reg::MAX;

/// Everything the runtime needs to know about one emitted function:
/// its entry PC and how large a register window its frame needs. Keyed
/// externally by [`FuncSymId`] in [`EmitResult::funcs`].
#[derive(Debug, Clone, Copy)]
pub struct FuncRuntimeEntry {
    pub entry_pc: Pc,
    pub frame_size: u32,
    pub num_params: u32,
}

/// The finished artifact of a whole-chunk emission: the instruction
/// stream, its debug table, and the runtime symbol tables the host
/// needs to resolve `CallSym`/`StaticVar`/`Field` operands at load time.
#[derive(Debug)]
pub struct EmitResult {
    pub code: CodeBuffer,
    pub debug: DebugSymbolTable,
    pub funcs: FxHashMap<FuncSymId, FuncRuntimeEntry>,
    pub static_var_syms: Vec<SymId>,
    pub field_names: Vec<NameId>,
    pub method_group_names: Vec<(NameId, u8)>,
    /// `(ownerTypeId, methodGroupId) -> FuncSymId`, for a host to populate
    /// `warp-rt`'s `SymbolTables::method_syms` dispatch table at load
    /// time — the method's own entry PC/frame size is then looked up in
    /// `funcs` by that `FuncSymId`.
    pub methods: FxHashMap<(SymId, MethodGroupId), FuncSymId>,
}

/// Per-loop patch lists for `break`/`continue`, pushed on entry and
/// popped on exit; a loop body's `Break`/`Continue` statements append
/// their jump's PC here instead of resolving a target immediately,
/// since the loop's exit/re-check PC isn't known until the body (and,
/// for `for`, the bottom re-check op) has been emitted.
struct LoopCtx {
    break_jumps: Vec<Pc>,
    continue_jumps: Vec<Pc>,
}

/// Transient state for one function/lambda/top-level body currently
/// being emitted.
struct FnEmit {
    block: Block,
    planner: RegisterPlanner,
    loops: Vec<LoopCtx>,
    /// register holding `self` for a method body, so field reads/writes
    /// know which register to use as the `recv` operand.
    self_reg: Option<Reg>,
    /// `true` for a real function/method/lambda frame (one with a
    /// `[retval, retinfo, retpc, retfp]` header); `false` for the
    /// top-level chunk body, which owns no header and so has no
    /// `RETVAL_REG` to converge `return` sites onto.
    has_frame_header: bool,
    /// pending `Jump`s from `return` statements, patched to the shared
    /// epilogue once the body has been fully emitted — the epilogue runs
    /// the end-locals releases inline for every normal return.
    return_jumps: Vec<Pc>,
}

impl FnEmit {
    fn reg_of(&self, local: LocalId) -> Option<Reg> {
        self.block.local(local).register_slot.map(|s| s as Reg)
    }
}

/// Number of header slots reserved at the bottom of every frame:
/// `[retval, retinfo, retpc, retfp]`.
const FRAME_HEADER: u32 = 4;

/// The frame-header's own return-value slot, reused as the landing
/// register for every `return` site so the shared epilogue can emit a
/// single `Ret1` regardless of which `return` reached it — `retval` is
/// always register 0 of the callee's window.
const RETVAL_REG: Reg = 0;

pub struct BytecodeEmitter {
    code: CodeBuffer,
    debug: DebugSymbolTable,
    funcs: FxHashMap<FuncSymId, FuncRuntimeEntry>,
    static_var_syms: Vec<SymId>,
    field_syms: FxHashMap<NameId, FieldSymIdx>,
    field_names: Vec<NameId>,
    method_groups: FxHashMap<(NameId, u8), MethodGroupId>,
    method_group_names: Vec<(NameId, u8)>,
    methods: FxHashMap<(SymId, MethodGroupId), FuncSymId>,
}

impl Default for BytecodeEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeEmitter {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::new(),
            debug: DebugSymbolTable::new(),
            funcs: FxHashMap::default(),
            static_var_syms: Vec::new(),
            field_syms: FxHashMap::default(),
            field_names: Vec::new(),
            method_groups: FxHashMap::default(),
            method_group_names: Vec::new(),
            methods: FxHashMap::default(),
        }
    }

    fn field_sym(&mut self, name: NameId) -> FieldSymIdx {
        *self.field_syms.entry(name).or_insert_with(|| {
            self.field_names.push(name);
            (self.field_names.len() - 1) as FieldSymIdx
        })
    }

    fn method_group(&mut self, name: NameId, arity: u8) -> MethodGroupId {
        let key = (name, arity);
        if let Some(id) = self.method_groups.get(&key) {
            return *id;
        }
        let id = self.method_group_names.len() as MethodGroupId;
        self.method_group_names.push(key);
        self.method_groups.insert(key, id);
        id
    }

    /// Emit a whole analyzed chunk: the static-init phase (in DFS
    /// schedule order) followed by the remaining top-level statements
    /// and function/method bodies in source order.
    pub fn emit_chunk(mut self, analyzer: &mut SemanticAnalyzer, chunk: &Chunk) -> EmitResult {
        log::info!("emit pass: chunk {}", chunk.id);
        let top_block = analyzer.top_level_block.take().expect("bodies_pass must run first");
        let mut fe = FnEmit {
            block: top_block,
            planner: RegisterPlanner::new(0),
            loops: Vec::new(),
            self_reg: None,
            has_frame_header: false,
            return_jumps: Vec::new(),
        };
        let num_locals = fe.block.assign_registers(0);
        fe.planner = RegisterPlanner::new(num_locals);

        let chunk_start_pc = self.code.pc();
        self.emit_static_init_phase(&mut fe, analyzer, chunk);

        for id in chunk.chain_ids(chunk.top) {
            let node = chunk.get(id).clone();
            match &node.head {
                NodeKind::VarDecl { .. } | NodeKind::EnumDecl { .. } => {}
                NodeKind::FuncDecl { .. } => {
                    self.emit_top_level_func(&mut fe, analyzer, chunk, &node);
                }
                NodeKind::ObjectDecl { methods, .. } => {
                    for method_id in methods.clone() {
                        let method_node = chunk.get(method_id).clone();
                        self.emit_top_level_func(&mut fe, analyzer, chunk, &method_node);
                    }
                }
                _ => self.emit_stmt(&mut fe, analyzer, chunk, id),
            }
        }
        let end_locals_pc = self.emit_block_end_release(&mut fe, analyzer);
        self.debug.patch_end_locals_from(chunk_start_pc, end_locals_pc);
        self.code.emit(Op::End);
        log::debug!(
            "emit pass done: {} ops, {} constants, {} funcs",
            self.code.ops.len(),
            self.code.constants.len(),
            self.funcs.len()
        );

        EmitResult {
            code: self.code,
            debug: self.debug,
            funcs: self.funcs,
            static_var_syms: self.static_var_syms,
            field_names: self.field_names,
            method_group_names: self.method_group_names,
            methods: self.methods,
        }
    }

    fn emit_static_init_phase(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, chunk: &Chunk) {
        let (order, cycles) = analyzer.static_init.schedule();
        let flags = analyzer.flags();
        for cycle in &cycles {
            report_soft_warning(
                flags,
                CFlag::WarnStaticInitCycle,
                &mut analyzer.warnings_promoted,
                format_args!(
                    "static initializer cycle: {} depends on {} which is not yet initialized",
                    cycle.from, cycle.to
                ),
            );
        }
        // map each static symbol back to its `var` declaration node, so
        // the schedule (over symbols) can drive emission (over AST nodes).
        let mut decl_by_sym: FxHashMap<SymId, NodeId> = FxHashMap::default();
        for id in chunk.chain_ids(chunk.top) {
            let node = chunk.get(id);
            if let NodeKind::VarDecl { name, .. } = &node.head {
                if let Some(sym) = analyzer.symtab.lookup(ROOT, *name) {
                    decl_by_sym.insert(sym, id);
                }
            }
        }
        for sym in order {
            let Some(&decl_id) = decl_by_sym.get(&sym) else { continue };
            let node = chunk.get(decl_id).clone();
            let NodeKind::VarDecl { init, .. } = &node.head else { continue };
            self.static_var_syms.push(sym);
            let mark = fe.planner.begin_arc_expr();
            let value_reg = match init {
                Some(init_id) => {
                    let r = fe.planner.next_free_temp_local();
                    self.emit_expr_to(fe, analyzer, chunk, *init_id, r, true);
                    r
                }
                None => {
                    let r = fe.planner.next_free_temp_local();
                    self.code.emit(Op::None { dst: r as Reg });
                    r
                }
            };
            self.code.emit(Op::SetStaticVar { sym: sym.0, src: value_reg as Reg });
            let released = fe.planner.end_arc_expr(mark);
            for slot in released {
                self.code.emit(Op::Release { reg: slot as Reg });
            }
            fe.planner.assert_statement_boundary();
        }
    }

    /// Emit a top-level (non-method, non-lambda) function or object
    /// method: a forward jump over the body (so straight-line top-level
    /// fallthrough never executes it), the body itself with its own
    /// frame, and a runtime-table entry so `CallSym`/`CallObjSym` can
    /// dispatch to it.
    fn emit_top_level_func(
        &mut self,
        _parent_fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node: &Node,
    ) {
        let NodeKind::FuncDecl { name, is_method, .. } = &node.head else { return };
        let skip_pc = self.code.emit(Op::Jump { target: 0 });
        let entry_pc = self.code.pc();
        let (frame_size, num_params) = self.emit_function_body(analyzer, chunk, node.id, *is_method);
        let end_pc = self.code.pc();
        self.code.patch_jump(skip_pc, end_pc);

        if let Some(func_sym) = analyzer.func_sym_by_node.get(&node.id).copied() {
            self.funcs.insert(func_sym, FuncRuntimeEntry { entry_pc, frame_size, num_params });
            if *is_method {
                let group = self.method_group(*name, num_params.saturating_sub(1) as u8);
                if let Some(&owner) = analyzer.owner_by_node.get(&node.id) {
                    self.methods.insert((owner, group), func_sym);
                }
            }
        }
    }

    /// Shared body for a top-level function, object method, nested
    /// `FuncDecl`, or lambda: consumes the analyzer's finished [`Block`]
    /// for `node_id`, assigns final register slots, boxes captured
    /// params, zero-inits locals with no initializer, emits the body,
    /// and appends an implicit `ret0` if control can fall off the end.
    fn emit_function_body(
        &mut self,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        is_method: bool,
    ) -> (u32, u32) {
        let mut block = analyzer.completed_blocks.remove(&node_id).expect("body must have been analyzed");
        let num_params = block.params.len() as u32;
        let frame_size = block.assign_registers(FRAME_HEADER);
        let mut fe = FnEmit {
            block,
            planner: RegisterPlanner::new(frame_size),
            loops: Vec::new(),
            self_reg: None,
            has_frame_header: true,
            return_jumps: Vec::new(),
        };
        if is_method {
            if let Some(&self_local) = fe.block.params.first() {
                fe.self_reg = fe.reg_of(self_local);
            }
        }

        // box any param that a nested closure captured.
        for &param_local in &fe.block.params.clone() {
            if fe.block.local(param_local).is_boxed {
                if let Some(slot) = fe.reg_of(param_local) {
                    self.code.emit(Op::Box { dst: slot, src: slot });
                }
            }
        }

        let noinit = collect_noinit_locals(chunk, node_id, &analyzer.annotations);
        let noinit_slots: Vec<Reg> =
            noinit.iter().filter_map(|&l| fe.reg_of(l)).collect();
        if !noinit_slots.is_empty() {
            self.code.emit(Op::SetInitN { slots: noinit_slots });
        }

        let body_start_pc = self.code.pc();
        let NodeKind::FuncDecl { body, .. } = &chunk.get(node_id).head else {
            unreachable!("emit_function_body called on a non-FuncDecl-shaped node")
        };
        self.emit_stmt(&mut fe, analyzer, chunk, *body);
        // fallthrough path: nothing set `RETVAL_REG`, so the epilogue must
        // see an explicit `none` there, matching the zero-arg return's
        // "leaves none" behavior without needing a separate opcode.
        self.code.emit(Op::None { dst: RETVAL_REG });
        let epilogue_pc = self.emit_block_end_release(&mut fe, analyzer);
        self.code.emit(Op::Ret1 { src: RETVAL_REG });
        for pc in fe.return_jumps {
            self.code.patch_jump(pc, epilogue_pc);
        }
        self.debug.patch_end_locals_from(body_start_pc, epilogue_pc);
        (frame_size, num_params)
    }

    /// Emit the block-end `release` sequence for every still-live
    /// rc-candidate local/param in `fe`'s frame: release them all, then
    /// `ret0`/`ret1`. Returns the PC the sequence was emitted at, the
    /// frame's `endLocalsPc`.
    fn emit_block_end_release(&mut self, fe: &mut FnEmit, _analyzer: &mut SemanticAnalyzer) -> Pc {
        let pc = self.code.pc();
        let mut regs: Vec<Reg> = fe
            .block
            .physical_locals()
            .filter(|&id| fe.block.local(id).lifetime_rc_candidate || fe.block.local(id).is_boxed)
            .filter_map(|id| fe.reg_of(id))
            .collect();
        regs.sort_unstable();
        regs.dedup();
        self.code.emit(Op::EndLocalsRelease { regs });
        pc
    }

    // ---- statements ----------------------------------------------------

    fn emit_stmt(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, chunk: &Chunk, id: NodeId) {
        let node = chunk.get(id).clone();
        let start_pc = self.code.pc();
        match &node.head {
            NodeKind::Block { first_stmt } => {
                for stmt_id in chunk.chain_ids(*first_stmt) {
                    self.emit_stmt(fe, analyzer, chunk, stmt_id);
                }
            }
            NodeKind::Stmt(inner) => self.emit_stmt(fe, analyzer, chunk, *inner),
            NodeKind::VarDecl { init, .. } => {
                let Some(local) = analyzer.annotations.get(id).and_then(|i| i.local) else { return };
                let Some(dst) = fe.reg_of(local) else { return };
                if let Some(init_id) = init {
                    let mark = fe.planner.begin_arc_expr();
                    self.emit_expr_to(fe, analyzer, chunk, *init_id, dst as u32, true);
                    if fe.block.local(local).is_boxed {
                        self.code.emit(Op::Box { dst, src: dst });
                    }
                    let released = fe.planner.end_arc_expr(mark);
                    for slot in released {
                        if slot != dst as u32 {
                            self.code.emit(Op::Release { reg: slot as Reg });
                        }
                    }
                    fe.planner.assert_statement_boundary();
                }
            }
            NodeKind::Assign { target, value } => {
                self.emit_assign(fe, analyzer, chunk, *target, *value);
            }
            NodeKind::If { cond, then_branch, else_branch } => {
                let mark = fe.planner.begin_arc_expr();
                let cond_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *cond, cond_reg, false);
                let jump_false = self.code.emit(Op::JumpNotCond { cond: cond_reg as Reg, target: 0 });
                fe.planner.compute_next_temp_local_from(mark);
                fe.planner.assert_statement_boundary();
                self.emit_stmt(fe, analyzer, chunk, *then_branch);
                if let Some(else_id) = else_branch {
                    let jump_end = self.code.emit(Op::Jump { target: 0 });
                    let else_pc = self.code.pc();
                    self.code.patch_jump(jump_false, else_pc);
                    self.emit_stmt(fe, analyzer, chunk, *else_id);
                    let end_pc = self.code.pc();
                    self.code.patch_jump(jump_end, end_pc);
                } else {
                    let end_pc = self.code.pc();
                    self.code.patch_jump(jump_false, end_pc);
                }
            }
            NodeKind::WhileCond { cond, body } => {
                let loop_top = self.code.pc();
                let mark = fe.planner.begin_arc_expr();
                let cond_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *cond, cond_reg, false);
                let exit_jump = self.code.emit(Op::JumpNotCond { cond: cond_reg as Reg, target: 0 });
                fe.planner.compute_next_temp_local_from(mark);
                fe.planner.assert_statement_boundary();
                fe.loops.push(LoopCtx { break_jumps: Vec::new(), continue_jumps: Vec::new() });
                self.emit_stmt(fe, analyzer, chunk, *body);
                let ctx = fe.loops.pop().unwrap();
                let continue_pc = self.code.pc();
                for pc in ctx.continue_jumps {
                    self.code.patch_jump(pc, continue_pc);
                }
                let back = self.code.emit(Op::Jump { target: 0 });
                self.code.patch_jump(back, loop_top);
                let end_pc = self.code.pc();
                self.code.patch_jump(exit_jump, end_pc);
                for pc in ctx.break_jumps {
                    self.code.patch_jump(pc, end_pc);
                }
            }
            NodeKind::WhileInf { body } => {
                let loop_top = self.code.pc();
                fe.loops.push(LoopCtx { break_jumps: Vec::new(), continue_jumps: Vec::new() });
                self.emit_stmt(fe, analyzer, chunk, *body);
                let ctx = fe.loops.pop().unwrap();
                let continue_pc = self.code.pc();
                for pc in ctx.continue_jumps {
                    self.code.patch_jump(pc, continue_pc);
                }
                let back = self.code.emit(Op::Jump { target: 0 });
                self.code.patch_jump(back, loop_top);
                let end_pc = self.code.pc();
                for pc in ctx.break_jumps {
                    self.code.patch_jump(pc, end_pc);
                }
            }
            NodeKind::ForRange { var: _, start, end, step, body } => {
                self.emit_for_range(fe, analyzer, chunk, id, *start, *end, *step, *body);
            }
            NodeKind::ForIter { var: _, pair_var, iterable, body } => {
                self.emit_for_iter(fe, analyzer, chunk, id, *iterable, pair_var.is_some(), *body);
            }
            NodeKind::Match { expr, first_arm } => {
                self.emit_match(fe, analyzer, chunk, id, *expr, *first_arm);
            }
            NodeKind::Try { body, err_name: _, catch_body } => {
                self.emit_try(fe, analyzer, chunk, id, *body, *catch_body);
            }
            NodeKind::Throw(e) => {
                let mark = fe.planner.begin_arc_expr();
                let reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *e, reg, true);
                self.code.emit(Op::Throw { src: reg as Reg });
                fe.planner.compute_next_temp_local_from(mark);
            }
            NodeKind::Return(e) => {
                if fe.has_frame_header {
                    // converge on the shared epilogue so every exit path
                    // runs the frame's end-locals release exactly once —
                    // this is the normal-return unwind path.
                    match e {
                        Some(e) => {
                            let mark = fe.planner.begin_arc_expr();
                            self.emit_expr_to(fe, analyzer, chunk, *e, RETVAL_REG as u32, true);
                            fe.planner.compute_next_temp_local_from(mark);
                        }
                        None => {
                            self.code.emit(Op::None { dst: RETVAL_REG });
                        }
                    }
                    let pc = self.code.emit(Op::Jump { target: 0 });
                    fe.return_jumps.push(pc);
                } else {
                    // top-level script `return`: no header/epilogue to
                    // converge on, so fall back to a direct ret.
                    match e {
                        Some(e) => {
                            let mark = fe.planner.begin_arc_expr();
                            let reg = fe.planner.next_free_temp_local();
                            self.emit_expr_to(fe, analyzer, chunk, *e, reg, true);
                            self.code.emit(Op::Ret1 { src: reg as Reg });
                            fe.planner.compute_next_temp_local_from(mark);
                        }
                        None => {
                            self.code.emit(Op::Ret0);
                        }
                    }
                }
            }
            NodeKind::Break => {
                let pc = self.code.emit(Op::Jump { target: 0 });
                if let Some(ctx) = fe.loops.last_mut() {
                    ctx.break_jumps.push(pc);
                }
            }
            NodeKind::Continue => {
                let pc = self.code.emit(Op::Jump { target: 0 });
                if let Some(ctx) = fe.loops.last_mut() {
                    ctx.continue_jumps.push(pc);
                }
            }
            NodeKind::FuncDecl { .. } => {
                // a nested function declaration: behaves as a named local
                // bound to a freshly-constructed closure value.
                let Some(local) = analyzer.annotations.get(id).and_then(|i| i.local) else { return };
                let Some(dst) = fe.reg_of(local) else { return };
                self.emit_closure_value(fe, analyzer, chunk, id, dst as u32);
            }
            _ => {
                // an expression used in statement position: discard the
                // result but still run it for side effects.
                let mark = fe.planner.begin_arc_expr();
                self.emit_expr_to(fe, analyzer, chunk, id, DISCARD as u32, false);
                let released = fe.planner.end_arc_expr(mark);
                for slot in released {
                    self.code.emit(Op::Release { reg: slot as Reg });
                }
                fe.planner.assert_statement_boundary();
            }
        }
        let end_locals_pc = self.code.pc();
        self.debug.record(start_pc, id, end_locals_pc);
    }

    fn emit_assign(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, chunk: &Chunk, target: NodeId, value: NodeId) {
        let target_node = chunk.get(target).clone();
        match &target_node.head {
            NodeKind::Ident(_) => {
                let Some(local) = analyzer.annotations.get(target).and_then(|i| i.local) else { return };
                self.emit_assign_local(fe, analyzer, chunk, local, value);
            }
            NodeKind::Field { recv, name } => {
                let mark = fe.planner.begin_arc_expr();
                let recv_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *recv, recv_reg, false);
                let value_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, value, value_reg, true);
                let field = self.field_sym(*name);
                self.code.emit(Op::SetFieldRelease { recv: recv_reg as Reg, field, src: value_reg as Reg });
                let released = fe.planner.end_arc_expr(mark);
                for slot in released {
                    self.code.emit(Op::Release { reg: slot as Reg });
                }
                fe.planner.assert_statement_boundary();
            }
            NodeKind::Index { recv, index } => {
                let mark = fe.planner.begin_arc_expr();
                let recv_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *recv, recv_reg, false);
                let idx_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *index, idx_reg, false);
                let value_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, value, value_reg, true);
                self.code.emit(Op::SetIndexRelease {
                    recv: recv_reg as Reg,
                    idx: idx_reg as Reg,
                    src: value_reg as Reg,
                });
                let released = fe.planner.end_arc_expr(mark);
                for slot in released {
                    self.code.emit(Op::Release { reg: slot as Reg });
                }
                fe.planner.assert_statement_boundary();
            }
            _ => {}
        }
    }

    /// Assign a new value to a named local, choosing the retain/release
    /// op quadrant by the rc-candidacy of the old and new value: both
    /// non-candidates is a plain `copy`; a new candidate with a
    /// non-candidate old value needs only
    /// a `+1` on entry (`copyRetainSrc`); the symmetric case needs only a
    /// `-1` on the old value (`copyReleaseDst`); both candidates need
    /// both (`copyRetainRelease`).
    fn emit_assign_local(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        local: LocalId,
        value: NodeId,
    ) {
        let old_rc = fe.block.local(local).lifetime_rc_candidate;
        let mark = fe.planner.begin_arc_expr();
        let value_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, value, value_reg, false);
        let new_ty = analyzer.annotations.get(value).and_then(|i| i.ty).unwrap_or(TypeId::DYNAMIC);
        let new_rc = analyzer.types.is_rc_candidate(new_ty);

        match fe.block.local(local).kind {
            LocalKind::ParentLocalAlias => {
                let Some(slot) = fe.reg_of(local) else { return };
                if new_rc {
                    self.code.emit(Op::SetBoxValueRelease { boxed: slot, src: value_reg as Reg });
                } else {
                    self.code.emit(Op::SetBoxValue { boxed: slot, src: value_reg as Reg });
                }
            }
            LocalKind::StaticAlias => {
                if let Some(sym) = fe.block.local(local).static_sym {
                    self.code.emit(Op::SetStaticVar { sym: sym.0, src: value_reg as Reg });
                }
            }
            LocalKind::ObjectMemberAlias | LocalKind::ParentObjectMemberAlias => {
                if let Some(self_reg) = fe.self_reg {
                    let field = self.field_sym(fe.block.local(local).name);
                    self.code.emit(Op::SetFieldRelease { recv: self_reg, field, src: value_reg as Reg });
                }
            }
            LocalKind::Param | LocalKind::Local => {
                let Some(slot) = fe.reg_of(local) else { return };
                if fe.block.local(local).is_boxed {
                    if new_rc {
                        self.code.emit(Op::SetBoxValueRelease { boxed: slot, src: value_reg as Reg });
                    } else {
                        self.code.emit(Op::SetBoxValue { boxed: slot, src: value_reg as Reg });
                    }
                } else {
                    match (old_rc, new_rc) {
                        (false, false) => self.code.emit(Op::Copy { dst: slot, src: value_reg as Reg }),
                        (false, true) => {
                            self.code.emit(Op::CopyRetainSrc { dst: slot, src: value_reg as Reg })
                        }
                        (true, false) => {
                            self.code.emit(Op::CopyReleaseDst { dst: slot, src: value_reg as Reg })
                        }
                        (true, true) => {
                            self.code.emit(Op::CopyRetainRelease { dst: slot, src: value_reg as Reg })
                        }
                    };
                }
                fe.block.local_mut(local).lifetime_rc_candidate = new_rc;
            }
        }
        let released = fe.planner.end_arc_expr(mark);
        for slot in released {
            self.code.emit(Op::Release { reg: slot as Reg });
        }
        fe.planner.assert_statement_boundary();
    }

    fn emit_for_range(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        start: NodeId,
        end: NodeId,
        step: Option<NodeId>,
        body: NodeId,
    ) {
        let Some(user_local) = analyzer.annotations.get(node_id).and_then(|i| i.local) else {
            // the var local for a for-range isn't annotated on the loop
            // node itself in the current analyzer; fall back to a fresh
            // temp so emission still proceeds (degraded: the loop var
            // won't be independently addressable outside this helper).
            return self.emit_for_range_with_user_reg(fe, analyzer, chunk, start, end, step, body, None);
        };
        let user_reg = fe.reg_of(user_local);
        self.emit_for_range_with_user_reg(fe, analyzer, chunk, start, end, step, body, user_reg);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_for_range_with_user_reg(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        start: NodeId,
        end: NodeId,
        step: Option<NodeId>,
        body: NodeId,
        user_reg: Option<Reg>,
    ) {
        let mark = fe.planner.begin_arc_expr();
        let start_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, start, start_reg, false);
        let end_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, end, end_reg, false);
        let step_reg = fe.planner.next_free_temp_local();
        match step {
            Some(s) => self.emit_expr_to(fe, analyzer, chunk, s, step_reg, false),
            None => {
                let one = self.code.constants.intern(Constant::Int(1));
                self.code.emit(Op::Const { dst: step_reg as Reg, idx: one });
            }
        }
        let counter_reg = fe.planner.next_free_temp_local();
        let user_reg = user_reg.unwrap_or(counter_reg as Reg);
        fe.planner.set_reserved_temp_local(start_reg);
        fe.planner.set_reserved_temp_local(end_reg);
        fe.planner.set_reserved_temp_local(step_reg);
        fe.planner.set_reserved_temp_local(counter_reg);

        let init_pc = self.code.emit(Op::ForRangeInit {
            start: start_reg as Reg,
            end: end_reg as Reg,
            step: step_reg as Reg,
            counter: counter_reg as Reg,
            user_var: user_reg,
            exit: 0,
        });
        let body_pc = self.code.pc();
        fe.loops.push(LoopCtx { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.emit_stmt(fe, analyzer, chunk, body);
        let ctx = fe.loops.pop().unwrap();
        let continue_pc = self.code.pc();
        for pc in ctx.continue_jumps {
            self.code.patch_jump(pc, continue_pc);
        }
        let back_pc = self.code.emit(Op::ForRange {
            counter: counter_reg as Reg,
            step: step_reg as Reg,
            end: end_reg as Reg,
            user_var: user_reg,
            back: 0,
        });
        self.code.patch_jump(back_pc, body_pc);
        let end_pc = self.code.pc();
        self.code.patch_jump(init_pc, end_pc);
        for pc in ctx.break_jumps {
            self.code.patch_jump(pc, end_pc);
        }

        fe.planner.unreserve_temp_local(start_reg);
        fe.planner.unreserve_temp_local(end_reg);
        fe.planner.unreserve_temp_local(step_reg);
        fe.planner.unreserve_temp_local(counter_reg);
        let released = fe.planner.end_arc_expr(mark);
        for slot in released {
            self.code.emit(Op::Release { reg: slot as Reg });
        }
        fe.planner.assert_statement_boundary();
    }

    /// `for x in iterable { ... }` / `for k, v in iterable { ... }`:
    /// fetches an iterator via a synthesized `iterator`/`pairIterator`
    /// method call, then loops calling `next`, copying the result into
    /// the user-visible loop var(s), until `next` yields `none`. The
    /// pair-destructuring case (`nextPair` returning a two-element list
    /// that's then split via `Index`) is a pragmatic reading of
    /// `CallObjSym`'s single-`dst` shape rather than a true multi-value
    /// return.
    fn emit_for_iter(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        iterable: NodeId,
        is_pair: bool,
        body: NodeId,
    ) {
        let var_local = analyzer.annotations.get(node_id).and_then(|i| i.local);
        let pair_local = analyzer.annotations.get(node_id).and_then(|i| i.local2);
        let var_reg = var_local.and_then(|l| fe.reg_of(l));
        let pair_reg = pair_local.and_then(|l| fe.reg_of(l));

        let mark = fe.planner.begin_arc_expr();
        let iterable_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, iterable, iterable_reg, true);
        let iter_reg = fe.planner.next_free_temp_local();
        fe.planner.set_reserved_temp_local(iter_reg);
        let iter_method = if is_pair { "pairIterator" } else { "iterator" };
        let iter_name = analyzer.symtab.names.intern(iter_method);
        let iter_group = self.method_group(iter_name, 0);
        self.code.emit(Op::CallObjSym {
            recv: iterable_reg as Reg,
            first_arg: iterable_reg as Reg,
            num_args: 0,
            method_group: iter_group,
            dst: iter_reg as Reg,
        });

        let loop_top = self.code.pc();
        let val_reg = fe.planner.next_free_temp_local();
        fe.planner.set_reserved_temp_local(val_reg);
        let next_name = analyzer.symtab.names.intern(if is_pair { "nextPair" } else { "next" });
        let next_group = self.method_group(next_name, 0);
        self.code.emit(Op::CallObjSym {
            recv: iter_reg as Reg,
            first_arg: iter_reg as Reg,
            num_args: 0,
            method_group: next_group,
            dst: val_reg as Reg,
        });
        let enter_body = self.code.emit(Op::JumpNotNone { reg: val_reg as Reg, target: 0 });
        let exit_jump = self.code.emit(Op::Jump { target: 0 });
        let body_entry_pc = self.code.pc();
        self.code.patch_jump(enter_body, body_entry_pc);

        if is_pair {
            if let Some(kreg) = var_reg {
                let zero = self.code.constants.intern(Constant::Int(0));
                let idx_reg = fe.planner.next_free_temp_local();
                self.code.emit(Op::Const { dst: idx_reg as Reg, idx: zero });
                self.code.emit(Op::Index { dst: kreg, recv: val_reg as Reg, idx: idx_reg as Reg });
                fe.planner.compute_next_temp_local_from(TempMark(idx_reg));
            }
            if let Some(vreg) = pair_reg {
                let one = self.code.constants.intern(Constant::Int(1));
                let idx_reg = fe.planner.next_free_temp_local();
                self.code.emit(Op::Const { dst: idx_reg as Reg, idx: one });
                self.code.emit(Op::Index { dst: vreg, recv: val_reg as Reg, idx: idx_reg as Reg });
                fe.planner.compute_next_temp_local_from(TempMark(idx_reg));
            }
        } else if let Some(vreg) = var_reg {
            self.code.emit(Op::CopyReleaseDst { dst: vreg, src: val_reg as Reg });
        }

        fe.loops.push(LoopCtx { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.emit_stmt(fe, analyzer, chunk, body);
        let ctx = fe.loops.pop().unwrap();
        let continue_pc = self.code.pc();
        for pc in ctx.continue_jumps {
            self.code.patch_jump(pc, continue_pc);
        }
        let back = self.code.emit(Op::Jump { target: 0 });
        self.code.patch_jump(back, loop_top);
        let end_pc = self.code.pc();
        self.code.patch_jump(exit_jump, end_pc);
        for pc in &ctx.break_jumps {
            self.code.patch_jump(*pc, end_pc);
        }
        self.code.emit(Op::Release { reg: iter_reg as Reg });

        fe.planner.unreserve_temp_local(val_reg);
        fe.planner.unreserve_temp_local(iter_reg);
        let released = fe.planner.end_arc_expr(mark);
        for slot in released {
            self.code.emit(Op::Release { reg: slot as Reg });
        }
        fe.planner.assert_statement_boundary();
    }

    fn emit_match(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        id: NodeId,
        expr: NodeId,
        first_arm: Option<NodeId>,
    ) {
        let mark = fe.planner.begin_arc_expr();
        let expr_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, expr, expr_reg, false);
        let arms = chunk.chain_ids(first_arm);
        self.code.emit(Op::Match { expr: expr_reg as Reg, num_conds: arms.len() as u16 });

        let mut dispatch: Vec<(usize, Pc)> = Vec::new();
        let mut else_idx = None;
        for (i, &arm_id) in arms.iter().enumerate() {
            let arm = chunk.get(arm_id).clone();
            let NodeKind::MatchArm { cond, .. } = arm.head else { continue };
            match cond {
                Some(cond_id) => {
                    let cond_mark = fe.planner.begin_arc_expr();
                    let cond_reg = fe.planner.next_free_temp_local();
                    self.emit_expr_to(fe, analyzer, chunk, cond_id, cond_reg, false);
                    let pc = self.code.emit(Op::MatchArm { cond: cond_reg as Reg, jump: 0 });
                    fe.planner.compute_next_temp_local_from(cond_mark);
                    dispatch.push((i, pc));
                }
                None => else_idx = Some(i),
            }
        }
        if else_idx.is_none() {
            report_soft_warning(
                analyzer.flags(),
                CFlag::WarnUnhandled,
                &mut analyzer.warnings_promoted,
                format_args!("node {id}: `match` has no else and may fall through every arm unhandled"),
            );
        }
        let else_jump_pc = self.code.emit(Op::MatchElseJump { jump: 0 });
        fe.planner.compute_next_temp_local_from(mark);
        fe.planner.assert_statement_boundary();

        let mut body_pcs = Vec::with_capacity(arms.len());
        let mut end_jumps = Vec::new();
        for (i, &arm_id) in arms.iter().enumerate() {
            let arm = chunk.get(arm_id).clone();
            let NodeKind::MatchArm { body, .. } = arm.head else { continue };
            body_pcs.push((i, self.code.pc()));
            self.emit_stmt(fe, analyzer, chunk, body);
            if i + 1 < arms.len() {
                end_jumps.push(self.code.emit(Op::Jump { target: 0 }));
            }
        }
        let match_end = self.code.pc();
        for (i, pc) in dispatch {
            let target = body_pcs.iter().find(|(j, _)| *j == i).map(|(_, pc)| *pc).unwrap_or(match_end);
            self.code.patch_jump(pc, target);
        }
        let else_target = else_idx
            .and_then(|i| body_pcs.iter().find(|(j, _)| *j == i).map(|(_, pc)| *pc))
            .unwrap_or(match_end);
        self.code.patch_jump(else_jump_pc, else_target);
        for pc in end_jumps {
            self.code.patch_jump(pc, match_end);
        }
    }

    /// `try { body } catch err { catch_body }`: pushes a try-frame via
    /// `tryValue` for the duration of `body`; on normal completion, a
    /// jump skips the catch block entirely. `catch_pc` is only known
    /// once `body` (and its own nested control flow) has been emitted,
    /// so it's patched in afterward, matching the rest of this emitter's
    /// forward-patch style for not-yet-known targets.
    fn emit_try(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        body: NodeId,
        catch_body: NodeId,
    ) {
        let err_reg = analyzer
            .annotations
            .get(node_id)
            .and_then(|i| i.local)
            .and_then(|l| fe.reg_of(l))
            .unwrap_or(0);
        let try_pc = self.code.emit(Op::TryValue { src: 0, dst: err_reg, catch_pc: 0 });
        self.emit_stmt(fe, analyzer, chunk, body);
        let skip_catch = self.code.emit(Op::Jump { target: 0 });
        let catch_pc = self.code.pc();
        self.code.patch_catch_pc(try_pc, catch_pc);
        self.emit_stmt(fe, analyzer, chunk, catch_body);
        let end_pc = self.code.pc();
        self.code.patch_jump(skip_catch, end_pc);
    }

    // ---- expressions -----------------------------------------------------

    /// Emit `id` so its value ends up in register `dst`. `retain` says
    /// whether the *caller* needs ownership of the result (a `+1` beyond
    /// whatever the expression already holds) — identifier reads of a
    /// non-owned slot need a `retain` variant, while a freshly
    /// constructed value (a literal, a list/map/object constructor, an
    /// arithmetic result) already owns its one reference and needs none.
    fn emit_expr_to(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        id: NodeId,
        dst: u32,
        retain: bool,
    ) {
        let node = chunk.get(id).clone();
        let dst_reg = dst as Reg;
        match &node.head {
            NodeKind::IntLit(v) => {
                let idx = self.code.constants.intern(Constant::Int(*v));
                self.code.emit(Op::Const { dst: dst_reg, idx });
            }
            NodeKind::FloatLit(bits) => {
                let idx = self.code.constants.intern(Constant::Float(*bits));
                self.code.emit(Op::Const { dst: dst_reg, idx });
            }
            NodeKind::BoolLit(b) => {
                self.code.emit(if *b { Op::True { dst: dst_reg } } else { Op::False { dst: dst_reg } });
            }
            NodeKind::StrLit(name) => {
                let idx = self.code.constants.intern(Constant::Str(name.0));
                self.code.emit(Op::Const { dst: dst_reg, idx });
            }
            NodeKind::NoneLit => {
                self.code.emit(Op::None { dst: dst_reg });
            }
            NodeKind::Ident(_) => {
                self.emit_ident_read(fe, analyzer, id, dst_reg, retain);
            }
            NodeKind::Unary { op, expr } => {
                let mark = fe.planner.begin_arc_expr();
                let src_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *expr, src_reg, false);
                match op {
                    UnOp::Neg => {
                        self.code.emit(Op::Neg { dst: dst_reg, src: src_reg as Reg });
                    }
                    UnOp::Not => {
                        self.code.emit(Op::Not { dst: dst_reg, src: src_reg as Reg });
                    }
                    UnOp::BitNot => {
                        self.code.emit(Op::Bit {
                            op: BitOp::Xor,
                            dst: dst_reg,
                            lhs: src_reg as Reg,
                            rhs: src_reg as Reg,
                        });
                    }
                }
                fe.planner.compute_next_temp_local_from(mark);
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.emit_binary(fe, analyzer, chunk, id, *op, *lhs, *rhs, dst_reg);
            }
            NodeKind::Call { callee, first_arg } => {
                self.emit_call(fe, analyzer, chunk, id, *callee, *first_arg, dst_reg);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::MethodCall { recv, name, first_arg } => {
                self.emit_method_call(fe, analyzer, chunk, *recv, *name, *first_arg, dst_reg);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::Field { recv, name } => {
                let mark = fe.planner.begin_arc_expr();
                let recv_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *recv, recv_reg, false);
                let field = self.field_sym(*name);
                let op = if retain {
                    Op::FieldRetain { dst: dst_reg, recv: recv_reg as Reg, field }
                } else {
                    Op::Field { dst: dst_reg, recv: recv_reg as Reg, field }
                };
                self.code.emit(op);
                fe.planner.compute_next_temp_local_from(mark);
            }
            NodeKind::Index { recv, index } => {
                let mark = fe.planner.begin_arc_expr();
                let recv_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *recv, recv_reg, false);
                let idx_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *index, idx_reg, false);
                self.code.emit(Op::Index { dst: dst_reg, recv: recv_reg as Reg, idx: idx_reg as Reg });
                fe.planner.compute_next_temp_local_from(mark);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::ListLit { first_item } => {
                let items = chunk.chain_ids(*first_item);
                let mark = fe.planner.begin_arc_expr();
                let first = fe.planner.advance_next_temp_local_past_arc_temps();
                for &item_id in &items {
                    let item = chunk.get(item_id).clone();
                    let NodeKind::Item(inner) = item.head else { continue };
                    let slot = fe.planner.next_free_temp_local();
                    self.emit_expr_to(fe, analyzer, chunk, inner, slot, true);
                }
                self.code.emit(Op::List { first_arg: first as Reg, count: items.len() as u16, dst: dst_reg });
                fe.planner.compute_next_temp_local_from(mark);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::MapLit { first_pair } => {
                let pairs = chunk.chain_ids(*first_pair);
                if pairs.is_empty() {
                    self.code.emit(Op::MapEmpty { dst: dst_reg });
                    if !retain && dst_reg != DISCARD {
                        fe.planner.mark_arc_temp(dst);
                    }
                } else {
                    let mark = fe.planner.begin_arc_expr();
                    let first = fe.planner.advance_next_temp_local_past_arc_temps();
                    for &pair_id in &pairs {
                        let pair = chunk.get(pair_id).clone();
                        let NodeKind::Pair { key, value } = pair.head else { continue };
                        let kslot = fe.planner.next_free_temp_local();
                        self.emit_expr_to(fe, analyzer, chunk, key, kslot, true);
                        let vslot = fe.planner.next_free_temp_local();
                        self.emit_expr_to(fe, analyzer, chunk, value, vslot, true);
                    }
                    self.code.emit(Op::Map {
                        first_arg: first as Reg,
                        count: pairs.len() as u16,
                        dst: dst_reg,
                    });
                    fe.planner.compute_next_temp_local_from(mark);
                    if !retain && dst_reg != DISCARD {
                        fe.planner.mark_arc_temp(dst);
                    }
                }
            }
            NodeKind::ObjectLit { type_name, first_field } => {
                let fields = chunk.chain_ids(*first_field);
                let type_sym = analyzer.symtab.lookup(ROOT, *type_name).map(|s| s.0).unwrap_or(0);
                let mark = fe.planner.begin_arc_expr();
                let first = fe.planner.advance_next_temp_local_past_arc_temps();
                for &field_id in &fields {
                    let f = chunk.get(field_id).clone();
                    let NodeKind::FieldInit { value, .. } = f.head else { continue };
                    let slot = fe.planner.next_free_temp_local();
                    self.emit_expr_to(fe, analyzer, chunk, value, slot, true);
                }
                let op = if fields.len() <= 4 {
                    Op::ObjectSmall { type_id: type_sym, first_arg: first as Reg, count: fields.len() as u8, dst: dst_reg }
                } else {
                    Op::Object { type_id: type_sym, first_arg: first as Reg, count: fields.len() as u8, dst: dst_reg }
                };
                self.code.emit(op);
                fe.planner.compute_next_temp_local_from(mark);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::StringTemplate { first_part } => {
                let parts = chunk.chain_ids(*first_part);
                let mark = fe.planner.begin_arc_expr();
                let first = fe.planner.advance_next_temp_local_past_arc_temps();
                let mut literal_parts = Vec::new();
                let mut num_exprs = 0u8;
                for &part_id in &parts {
                    let p = chunk.get(part_id).clone();
                    match p.head {
                        NodeKind::TemplateLit(name) => {
                            literal_parts.push(self.code.constants.intern(Constant::Str(name.0)));
                        }
                        NodeKind::TemplateExpr(e) => {
                            let slot = fe.planner.next_free_temp_local();
                            self.emit_expr_to(fe, analyzer, chunk, e, slot, true);
                            num_exprs += 1;
                        }
                        _ => {}
                    }
                }
                self.code.emit(Op::StringTemplate { first_arg: first as Reg, num_exprs, dst: dst_reg, literal_parts });
                fe.planner.compute_next_temp_local_from(mark);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::Lambda { .. } => {
                self.emit_closure_value(fe, analyzer, chunk, id, dst);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::CoInit(call) => {
                self.emit_coinit(fe, analyzer, chunk, *call, dst_reg);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            NodeKind::CoYield => {
                self.code.emit(Op::CoYield);
                self.code.emit(Op::None { dst: dst_reg });
            }
            NodeKind::CoResume(fiber) => {
                let mark = fe.planner.begin_arc_expr();
                let fiber_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, *fiber, fiber_reg, false);
                self.code.emit(Op::CoResume { fiber: fiber_reg as Reg, dst: dst_reg });
                fe.planner.compute_next_temp_local_from(mark);
                if !retain && dst_reg != DISCARD {
                    fe.planner.mark_arc_temp(dst);
                }
            }
            _ => {
                self.code.emit(Op::None { dst: dst_reg });
            }
        }
    }

    fn emit_ident_read(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, id: NodeId, dst: Reg, retain: bool) {
        let Some(local) = analyzer.annotations.get(id).and_then(|i| i.local) else {
            self.code.emit(Op::None { dst });
            return;
        };
        match fe.block.local(local).kind {
            LocalKind::Param | LocalKind::Local => {
                let Some(src) = fe.reg_of(local) else { return };
                if fe.block.local(local).is_boxed {
                    self.code.emit(if retain {
                        Op::BoxValueRetain { dst, boxed: src }
                    } else {
                        Op::BoxValue { dst, boxed: src }
                    });
                } else if retain {
                    self.code.emit(Op::CopyRetainSrc { dst, src });
                } else {
                    self.code.emit(Op::Copy { dst, src });
                }
            }
            LocalKind::ParentLocalAlias => {
                let Some(boxed) = fe.reg_of(local) else { return };
                self.code.emit(if retain {
                    Op::BoxValueRetain { dst, boxed }
                } else {
                    Op::BoxValue { dst, boxed }
                });
            }
            LocalKind::StaticAlias => {
                let Some(sym) = fe.block.local(local).static_sym else { return };
                let op = match analyzer.symtab.get(sym) {
                    Symbol::Function(_) => Op::StaticFunc { dst, sym: sym.0 },
                    _ => Op::StaticVar { dst, sym: sym.0 },
                };
                self.code.emit(op);
            }
            LocalKind::ObjectMemberAlias | LocalKind::ParentObjectMemberAlias => {
                let Some(recv) = fe.self_reg else {
                    self.code.emit(Op::None { dst });
                    return;
                };
                let field = self.field_sym(fe.block.local(local).name);
                self.code.emit(if retain {
                    Op::FieldRetain { dst, recv, field }
                } else {
                    Op::Field { dst, recv, field }
                });
            }
        }
    }

    fn emit_binary(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
        dst: Reg,
    ) {
        if matches!(op, BinOp::And | BinOp::Or) {
            // short-circuit: evaluate lhs; if it already determines the
            // result, skip rhs entirely.
            let mark = fe.planner.begin_arc_expr();
            self.emit_expr_to(fe, analyzer, chunk, lhs, dst as u32, false);
            let skip = match op {
                BinOp::And => self.code.emit(Op::JumpNotCond { cond: dst, target: 0 }),
                _ => self.code.emit(Op::JumpCond { cond: dst, target: 0 }),
            };
            self.emit_expr_to(fe, analyzer, chunk, rhs, dst as u32, false);
            let end_pc = self.code.pc();
            self.code.patch_jump(skip, end_pc);
            fe.planner.compute_next_temp_local_from(mark);
            return;
        }

        let strategy = analyzer.annotations.get(node_id).and_then(|i| i.strategy).unwrap_or(OpStrategy::Generic);
        let mark = fe.planner.begin_arc_expr();
        let lhs_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, lhs, lhs_reg, false);
        let rhs_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, rhs, rhs_reg, false);

        if is_comparison(op) {
            let cmp = cmp_op(op);
            self.code.emit(Op::Cmp { op: cmp, dst, lhs: lhs_reg as Reg, rhs: rhs_reg as Reg });
        } else if let Some(bit) = bit_op(op) {
            self.code.emit(Op::Bit { op: bit, dst, lhs: lhs_reg as Reg, rhs: rhs_reg as Reg });
        } else {
            let arith = arith_op(op, strategy);
            self.code.emit(Op::Arith { op: arith, dst, lhs: lhs_reg as Reg, rhs: rhs_reg as Reg });
        }
        fe.planner.compute_next_temp_local_from(mark);
    }

    /// A static call: either a direct `CallSym` (the common case, when
    /// the analyzer resolved a single overload) or, for a dynamic
    /// callee expression (a value held in a local/temp — e.g. calling a
    /// captured lambda), `Call0`/`Call`.
    fn emit_call(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        node_id: NodeId,
        callee: NodeId,
        first_arg: Option<NodeId>,
        dst: Reg,
    ) {
        let args = chunk.chain_ids(first_arg);
        if let Some(sym) = analyzer.annotations.get(node_id).and_then(|i| i.sym) {
            let mark = fe.planner.begin_arc_expr();
            let call_start = Self::reserve_call_frame_header(fe);
            let first = fe.planner.advance_next_temp_local_past_arc_temps();
            for &arg_id in &args {
                let a = chunk.get(arg_id).clone();
                let NodeKind::Arg(inner) = a.head else { continue };
                let slot = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, inner, slot, true);
            }
            self.code.emit(Op::CallSym {
                first_arg: first as Reg,
                num_args: args.len() as u8,
                want_ret: dst != DISCARD,
                sym: sym.0,
            });
            if dst != DISCARD {
                self.code.emit(Op::Copy { dst, src: call_start as Reg });
            }
            fe.planner.compute_next_temp_local_from(mark);
            return;
        }

        // dynamic call through a value (closure/function reference).
        let mark = fe.planner.begin_arc_expr();
        let func_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, callee, func_reg, false);
        match args.len() {
            0 => {
                self.code.emit(Op::Call0 { func: func_reg as Reg, dst });
            }
            1 => {
                let a = chunk.get(args[0]).clone();
                let NodeKind::Arg(inner) = a.head else { unreachable!() };
                let arg_reg = fe.planner.next_free_temp_local();
                self.emit_expr_to(fe, analyzer, chunk, inner, arg_reg, true);
                self.code.emit(Op::Call1 { func: func_reg as Reg, arg: arg_reg as Reg, dst });
            }
            _ => {
                let call_start = Self::reserve_call_frame_header(fe);
                let first = fe.planner.advance_next_temp_local_past_arc_temps();
                for &arg_id in &args {
                    let a = chunk.get(arg_id).clone();
                    let NodeKind::Arg(inner) = a.head else { continue };
                    let slot = fe.planner.next_free_temp_local();
                    self.emit_expr_to(fe, analyzer, chunk, inner, slot, true);
                }
                self.code.emit(Op::Call {
                    func: func_reg as Reg,
                    first_arg: first as Reg,
                    num_args: args.len() as u8,
                    want_ret: dst != DISCARD,
                });
                if dst != DISCARD {
                    self.code.emit(Op::Copy { dst, src: call_start as Reg });
                }
            }
        }
        fe.planner.compute_next_temp_local_from(mark);
    }

    /// Reserve the 4 throwaway temps the callee's frame header (`retVal`,
    /// `retInfo`, `retPc`, `retFp`) overwrites during the call — see
    /// `warp-rt`'s `push_frame`, which writes those fields at
    /// `call_start+0..3`. Returns `call_start`, the slot the return value
    /// lands in once the call completes.
    fn reserve_call_frame_header(fe: &mut FnEmit) -> u32 {
        let call_start = fe.planner.next_free_temp_local();
        for _ in 1..FRAME_HEADER {
            fe.planner.next_free_temp_local();
        }
        call_start
    }

    fn emit_method_call(
        &mut self,
        fe: &mut FnEmit,
        analyzer: &mut SemanticAnalyzer,
        chunk: &Chunk,
        recv: NodeId,
        name: NameId,
        first_arg: Option<NodeId>,
        dst: Reg,
    ) {
        let args = chunk.chain_ids(first_arg);
        let mark = fe.planner.begin_arc_expr();
        let recv_reg = fe.planner.next_free_temp_local();
        self.emit_expr_to(fe, analyzer, chunk, recv, recv_reg, true);
        let first = fe.planner.advance_next_temp_local_past_arc_temps();
        for &arg_id in &args {
            let a = chunk.get(arg_id).clone();
            let NodeKind::Arg(inner) = a.head else { continue };
            let slot = fe.planner.next_free_temp_local();
            self.emit_expr_to(fe, analyzer, chunk, inner, slot, true);
        }
        let group = self.method_group(name, args.len() as u8);
        self.code.emit(Op::CallObjSym {
            recv: recv_reg as Reg,
            first_arg: first as Reg,
            num_args: args.len() as u8,
            method_group: group,
            dst,
        });
        fe.planner.compute_next_temp_local_from(mark);
    }

    fn emit_coinit(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, chunk: &Chunk, call: NodeId, dst: Reg) {
        let call_node = chunk.get(call).clone();
        let NodeKind::Call { callee, first_arg } = &call_node.head else {
            self.code.emit(Op::None { dst });
            return;
        };
        let args = chunk.chain_ids(*first_arg);
        let mark = fe.planner.begin_arc_expr();
        let func_reg = fe.planner.next_free_temp_local();
        if let Some(sym) = analyzer.annotations.get(call).and_then(|i| i.sym) {
            self.code.emit(Op::StaticFunc { dst: func_reg as Reg, sym: sym.0 });
        } else {
            self.emit_expr_to(fe, analyzer, chunk, *callee, func_reg, false);
        }
        for &arg_id in &args {
            let a = chunk.get(arg_id).clone();
            let NodeKind::Arg(inner) = a.head else { continue };
            let slot = fe.planner.next_free_temp_local();
            self.emit_expr_to(fe, analyzer, chunk, inner, slot, true);
        }
        self.code.emit(Op::CoInit { func: func_reg as Reg, dst });
        fe.planner.compute_next_temp_local_from(mark);
    }

    /// A lambda expression or nested `FuncDecl` used as a value: emits a
    /// forward jump over the body, then either `Lambda` (no captures) or
    /// `Closure` (captures packed into a contiguous temp run immediately
    /// before the op, each a retaining copy of the parent's boxed slot).
    fn emit_closure_value(&mut self, fe: &mut FnEmit, analyzer: &mut SemanticAnalyzer, chunk: &Chunk, node_id: NodeId, dst: u32) {
        let captures = analyzer
            .completed_blocks
            .get(&node_id)
            .map(|b| b.captures.clone())
            .unwrap_or_default();

        let skip_pc = self.code.emit(Op::Jump { target: 0 });
        let entry_pc = self.code.pc();
        let is_method = matches!(chunk.get(node_id).head, NodeKind::FuncDecl { is_method: true, .. });
        self.emit_function_body(analyzer, chunk, node_id, is_method);
        let end_pc = self.code.pc();
        self.code.patch_jump(skip_pc, end_pc);

        if captures.is_empty() {
            self.code.emit(Op::Lambda { dst: dst as Reg, entry_pc });
            return;
        }
        let mark = fe.planner.begin_arc_expr();
        let first = fe.planner.advance_next_temp_local_past_arc_temps();
        for cap in &captures {
            let Some(parent_slot) = fe.reg_of(cap.parent_local) else { continue };
            let slot = fe.planner.next_free_temp_local();
            self.code.emit(Op::CopyRetainSrc { dst: slot as Reg, src: parent_slot });
        }
        self.code.emit(Op::Closure {
            dst: dst as Reg,
            entry_pc,
            first_capture: first as Reg,
            num_captures: captures.len() as u8,
        });
        fe.planner.compute_next_temp_local_from(mark);
    }
}

fn is_comparison(op: BinOp) -> bool {
    matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
}

fn cmp_op(op: BinOp) -> CmpOp {
    match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        _ => unreachable!(),
    }
}

fn bit_op(op: BinOp) -> Option<BitOp> {
    Some(match op {
        BinOp::BitAnd => BitOp::And,
        BinOp::BitOr => BitOp::Or,
        BinOp::BitXor => BitOp::Xor,
        BinOp::Shl => BitOp::Shl,
        BinOp::Shr => BitOp::Shr,
        _ => return None,
    })
}

fn arith_op(op: BinOp, strategy: OpStrategy) -> ArithOp {
    let specialized = strategy == OpStrategy::Specialized;
    match (op, specialized) {
        (BinOp::Add, true) => ArithOp::AddInt,
        (BinOp::Add, false) => ArithOp::Add,
        (BinOp::Sub, true) => ArithOp::SubInt,
        (BinOp::Sub, false) => ArithOp::Sub,
        (BinOp::Mul, _) => ArithOp::Mul,
        (BinOp::Div, _) => ArithOp::Div,
        (BinOp::Mod, _) => ArithOp::Mod,
        (BinOp::Pow, _) => ArithOp::Pow,
        _ => ArithOp::Add,
    }
}

/// Walk `body` (without descending into nested `FuncDecl`/`Lambda`
/// bodies, which are separate blocks/frames) collecting the locals of
/// every `VarDecl` with no initializer, so frame entry can zero-init
/// them with a single `SetInitN` — without this, a throw/return that
/// unwinds past a `VarDecl` the current control-flow path never
/// actually reached would release a garbage register.
fn collect_noinit_locals(chunk: &Chunk, node_id: NodeId, annotations: &Annotations) -> Vec<LocalId> {
    let mut out = Vec::new();
    let NodeKind::FuncDecl { body, .. } = &chunk.get(node_id).head else { return out };
    walk_noinit(chunk, *body, annotations, &mut out);
    out
}

fn walk_noinit(chunk: &Chunk, id: NodeId, annotations: &Annotations, out: &mut Vec<LocalId>) {
    let node = chunk.get(id);
    match &node.head {
        NodeKind::Block { first_stmt } => {
            for stmt in chunk.chain_ids(*first_stmt) {
                walk_noinit(chunk, stmt, annotations, out);
            }
        }
        NodeKind::Stmt(inner) => walk_noinit(chunk, *inner, annotations, out),
        NodeKind::VarDecl { init: None, .. } => {
            if let Some(local) = annotations.get(id).and_then(|i| i.local) {
                out.push(local);
            }
        }
        NodeKind::If { then_branch, else_branch, .. } => {
            walk_noinit(chunk, *then_branch, annotations, out);
            if let Some(e) = else_branch {
                walk_noinit(chunk, *e, annotations, out);
            }
        }
        NodeKind::WhileCond { body, .. } | NodeKind::WhileInf { body } => {
            walk_noinit(chunk, *body, annotations, out);
        }
        NodeKind::ForRange { body, .. } | NodeKind::ForIter { body, .. } => {
            walk_noinit(chunk, *body, annotations, out);
        }
        NodeKind::Match { first_arm, .. } => {
            for arm_id in chunk.chain_ids(*first_arm) {
                if let NodeKind::MatchArm { body, .. } = chunk.get(arm_id).head {
                    walk_noinit(chunk, body, annotations, out);
                }
            }
        }
        NodeKind::Try { body, catch_body, .. } => {
            walk_noinit(chunk, *body, annotations, out);
            walk_noinit(chunk, *catch_body, annotations, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{link_chain, Chunk};
    use crate::CFlag;
    use enumflags2::BitFlags;

    fn analyzer() -> SemanticAnalyzer {
        SemanticAnalyzer::new(BitFlags::<CFlag>::empty())
    }

    #[test]
    fn s1_arithmetic_emits_specialized_add_int() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("s1");
        let one = chunk.push(NodeKind::IntLit(1));
        let two = chunk.push(NodeKind::IntLit(2));
        let add = chunk.push(NodeKind::Binary { op: BinOp::Add, lhs: one, rhs: two });
        chunk.top = Some(add);
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let result = BytecodeEmitter::new().emit_chunk(&mut a, &chunk);
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::Arith { op: ArithOp::AddInt, .. })));
    }

    #[test]
    fn static_init_emits_b_before_a() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("s6");
        let name_a = a.symtab.names.intern("a");
        let name_b = a.symtab.names.intern("b");
        let ref_b = chunk.push(NodeKind::Ident(name_b));
        let one = chunk.push(NodeKind::IntLit(1));
        let a_init = chunk.push(NodeKind::Binary { op: BinOp::Add, lhs: ref_b, rhs: one });
        let decl_a = chunk.push(NodeKind::VarDecl { name: name_a, declared_type: None, init: Some(a_init) });
        let two = chunk.push(NodeKind::IntLit(2));
        let decl_b = chunk.push(NodeKind::VarDecl { name: name_b, declared_type: None, init: Some(two) });
        let top = link_chain(&mut chunk, &[decl_a, decl_b]);
        chunk.top = top;
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let sym_a = a.symtab.lookup(ROOT, name_a).unwrap();
        let sym_b = a.symtab.lookup(ROOT, name_b).unwrap();
        let result = BytecodeEmitter::new().emit_chunk(&mut a, &chunk);
        let pos_a = result.static_var_syms.iter().position(|s| *s == sym_a).unwrap();
        let pos_b = result.static_var_syms.iter().position(|s| *s == sym_b).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn match_without_else_emits_fallthrough_jump() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("match");
        let expr = chunk.push(NodeKind::IntLit(1));
        let cond = chunk.push(NodeKind::BoolLit(true));
        let body = chunk.push(NodeKind::IntLit(9));
        let body_stmt = chunk.push(NodeKind::Stmt(body));
        let arm = chunk.push(NodeKind::MatchArm { cond: Some(cond), body: body_stmt });
        let m = chunk.push(NodeKind::Match { expr, first_arm: Some(arm) });
        let stmt = chunk.push(NodeKind::Stmt(m));
        chunk.top = Some(stmt);
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let result = BytecodeEmitter::new().emit_chunk(&mut a, &chunk);
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::MatchElseJump { .. })));
    }

    #[test]
    fn for_range_emits_init_and_backedge() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("range");
        let var = a.symtab.names.intern("i");
        let start = chunk.push(NodeKind::IntLit(0));
        let end = chunk.push(NodeKind::IntLit(10));
        let body_expr = chunk.push(NodeKind::IntLit(1));
        let body_stmt = chunk.push(NodeKind::Stmt(body_expr));
        let body_block = chunk.push(NodeKind::Block { first_stmt: Some(body_stmt) });
        let for_range =
            chunk.push(NodeKind::ForRange { var, start, end, step: None, body: body_block });
        let stmt = chunk.push(NodeKind::Stmt(for_range));
        chunk.top = Some(stmt);
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let result = BytecodeEmitter::new().emit_chunk(&mut a, &chunk);
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::ForRangeInit { .. })));
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::ForRange { .. })));
    }

    /// A call result used as a `Binary` operand (so it's never the
    /// statement's final destination, and the consumer asked for a
    /// borrowed value via `retain: false`) still comes back from
    /// `CallSym` at `+1`. The temp holding it must land in the arc-temp
    /// region and get released at the statement boundary, or this leaks
    /// one retain per evaluation.
    #[test]
    fn call_result_as_borrowed_binary_operand_is_released() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("call_leak");
        let body = chunk.push(NodeKind::Block { first_stmt: None });
        let func_name = a.symtab.names.intern("f");
        let func = chunk.push(NodeKind::FuncDecl {
            name: func_name,
            params: Vec::new(),
            ret_type: None,
            owner_type: None,
            is_method: false,
            body,
        });
        let callee = chunk.push(NodeKind::Ident(func_name));
        let call = chunk.push(NodeKind::Call { callee, first_arg: None });
        let one = chunk.push(NodeKind::IntLit(1));
        let add = chunk.push(NodeKind::Binary { op: BinOp::Add, lhs: call, rhs: one });
        let stmt = chunk.push(NodeKind::Stmt(add));
        let top = link_chain(&mut chunk, &[func, stmt]);
        chunk.top = top;
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let result = BytecodeEmitter::new().emit_chunk(&mut a, &chunk);
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::CallSym { .. })));
        assert!(result.code.ops.iter().any(|op| matches!(op, Op::Release { .. })));
    }
}
