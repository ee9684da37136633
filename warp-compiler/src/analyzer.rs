//! Two-pass name resolution and lightweight type inference over a
//! [`Chunk`]. Pass one registers every top-level
//! declaration so forward references between static symbols work; pass
//! two walks each function body and top-level statement, annotating
//! every expression node with an inferred [`TypeId`] and, for
//! identifiers and calls, a resolved [`SymId`] — so the emitter never
//! re-resolves anything the analyzer already settled.

use crate::ast::{BinOp, Chunk, Node, NodeKind, Param, UnOp};
use crate::block::{Block, LocalId, LocalKind};
use crate::error::{CompileErrorKind, Diagnostics};
use crate::intern::NameId;
use crate::staticinit::StaticInitScheduler;
use crate::symtab::{FuncSym, ResolveError, Symbol, SymbolTable, ROOT};
use crate::types::{TypeId, TypeLattice};
use crate::{report_soft_warning, CFlag, CFlags, NodeId};
use fxhash::{FxHashMap, FxHashSet};
use poolshark::local::LPooled;

/// Whether a binary/unary op was specialized to a numeric-only variant
/// or must lower to the polymorphic runtime op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStrategy {
    Specialized,
    Generic,
}

/// What `emitExprTo` needs for this node besides its own `NodeKind`:
/// the type the analyzer inferred, the symbol (if any) an identifier or
/// call resolved to, and the op-specialization strategy for operator
/// nodes. Kept as a side table rather than fields on [`Node`] — nodes
/// stay plain AST data, annotations are analysis output.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub ty: Option<TypeId>,
    pub sym: Option<crate::symtab::SymId>,
    pub local: Option<LocalId>,
    /// second local slot, used only by `ForIter` nodes with a `pair_var`
    /// (the primary var goes in `local`, the pair var here).
    pub local2: Option<LocalId>,
    pub strategy: Option<OpStrategy>,
}

#[derive(Debug, Default)]
pub struct Annotations(FxHashMap<NodeId, NodeInfo>);

impl Annotations {
    pub fn get(&self, node: NodeId) -> Option<&NodeInfo> {
        self.0.get(&node)
    }

    fn entry(&mut self, node: NodeId) -> &mut NodeInfo {
        self.0.entry(node).or_default()
    }
}

fn is_numeric(ty: TypeId) -> bool {
    ty == TypeId::INTEGER || ty == TypeId::FLOAT
}

fn is_comparison(op: BinOp) -> bool {
    matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
}

const BUILTIN_TYPE_NAMES: &[(&str, TypeId)] = &[
    ("any", TypeId::ANY),
    ("boolean", TypeId::BOOLEAN),
    ("float", TypeId::FLOAT),
    ("integer", TypeId::INTEGER),
    ("string", TypeId::STRING),
    ("staticstring", TypeId::STATIC_STRING),
    ("rawstring", TypeId::RAWSTRING),
    ("symbol", TypeId::SYMBOL),
    ("list", TypeId::LIST),
    ("listiterator", TypeId::LIST_ITERATOR),
    ("map", TypeId::MAP),
    ("mapiterator", TypeId::MAP_ITERATOR),
    ("pointer", TypeId::POINTER),
    ("none", TypeId::NONE),
    ("error", TypeId::ERROR),
    ("fiber", TypeId::FIBER),
    ("metatype", TypeId::METATYPE),
    ("dynamic", TypeId::DYNAMIC),
    ("undefined", TypeId::UNDEFINED),
];

pub struct SemanticAnalyzer {
    pub symtab: SymbolTable,
    pub types: TypeLattice,
    pub diagnostics: Diagnostics,
    pub annotations: Annotations,
    pub static_init: StaticInitScheduler,
    /// finished [`Block`]s keyed by their owning `func`/`lambda` node, so
    /// the emitter can read back local kinds, capture lists and register
    /// slots without re-walking the AST to rediscover them.
    pub completed_blocks: FxHashMap<NodeId, Block>,
    pub top_level_block: Option<Block>,
    blocks: Vec<Block>,
    object_fields: FxHashMap<crate::symtab::SymId, FxHashMap<NameId, TypeId>>,
    cur_static_init_sym: Option<crate::symtab::SymId>,
    /// pooled rather than a plain `FxHashSet`: a fresh analyzer is built
    /// per chunk, and this set's backing allocation is otherwise thrown
    /// away and reallocated on every single-file compile in a batch.
    seen_static_deps: LPooled<FxHashSet<(crate::symtab::SymId, crate::symtab::SymId)>>,
    flags: CFlags,
    /// flipped by [`crate::report_soft_warning`] the first time a soft
    /// diagnostic fires with `CFlag::WarningsAreErrors` set; `compile_chunk`
    /// checks this after emission and fails the compile if it's set.
    pub warnings_promoted: bool,
    /// which concrete overload a `FuncDecl` node declared, so the emitter
    /// can populate the runtime func table without re-resolving a
    /// signature from scratch.
    pub func_sym_by_node: FxHashMap<NodeId, crate::symtab::FuncSymId>,
    /// the enclosing object type for a method's `FuncDecl` node, so the
    /// emitter knows which `(typeId, methodGroupId)` to register it under.
    pub owner_by_node: FxHashMap<NodeId, crate::symtab::SymId>,
}

impl SemanticAnalyzer {
    pub fn new(flags: CFlags) -> Self {
        let mut symtab = SymbolTable::new();
        for (name, ty) in BUILTIN_TYPE_NAMES {
            let id = symtab.names.intern(name);
            symtab.declare(ROOT, id, Symbol::BuiltinType(*ty));
        }
        Self {
            symtab,
            types: TypeLattice::new(),
            diagnostics: Diagnostics::new(),
            annotations: Annotations::default(),
            static_init: StaticInitScheduler::new(),
            completed_blocks: FxHashMap::default(),
            top_level_block: None,
            blocks: Vec::new(),
            object_fields: FxHashMap::default(),
            cur_static_init_sym: None,
            seen_static_deps: LPooled::take(),
            flags,
            warnings_promoted: false,
            func_sym_by_node: FxHashMap::default(),
            owner_by_node: FxHashMap::default(),
        }
    }

    pub fn flags(&self) -> CFlags {
        self.flags
    }

    fn cur_block(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("no active block")
    }

    /// Resolve a type annotation name (e.g. a `var x: Foo`'s `Foo`) to a
    /// [`TypeId`], falling back to `dynamic` with a diagnostic if the
    /// name is neither a builtin type nor a declared object/enum type.
    fn resolve_type_name(&mut self, node: NodeId, name: Option<NameId>) -> TypeId {
        let Some(name) = name else { return TypeId::DYNAMIC };
        match self.symtab.lookup(ROOT, name) {
            Some(sym) => match self.symtab.get(sym) {
                Symbol::BuiltinType(ty) => *ty,
                Symbol::Object { runtime_type, .. } => *runtime_type,
                Symbol::EnumType => TypeId::DYNAMIC,
                _ => {
                    self.diagnostics.push(node, CompileErrorKind::UnknownSymbol { name });
                    TypeId::DYNAMIC
                }
            },
            None => {
                self.diagnostics.push(node, CompileErrorKind::UnknownSymbol { name });
                TypeId::DYNAMIC
            }
        }
    }

    /// Pass one: register every top-level declaration. Only top-level
    /// `var`/`func`/`object`/`enum` nodes are inspected; anything else
    /// at the top level is left for the bodies pass.
    pub fn declare_pass(&mut self, chunk: &Chunk) {
        log::info!("declare pass: chunk {}", chunk.id);
        let top_ids = chunk.chain_ids(chunk.top);
        for id in top_ids {
            let node = chunk.get(id).clone();
            log::trace!("declare_top_level: node {}", node.id);
            self.declare_top_level(chunk, &node);
        }
        log::debug!(
            "declare pass done: {} symbols declared, {} static initializers registered",
            self.symtab.len(),
            self.static_init.len()
        );
    }

    fn declare_top_level(&mut self, chunk: &Chunk, node: &Node) {
        match &node.head {
            NodeKind::VarDecl { name, declared_type, .. } => {
                if self.symtab.lookup(ROOT, *name).is_some() {
                    self.diagnostics.push(node.id, CompileErrorKind::DuplicateSymbol { name: *name });
                }
                let ty = self.resolve_type_name(node.id, *declared_type);
                let sym = self.symtab.declare(
                    ROOT,
                    *name,
                    Symbol::Variable { typ: ty, decl_chunk: chunk.id, decl_node: node.id },
                );
                self.static_init.register(sym);
            }
            NodeKind::FuncDecl { name, params, ret_type, owner_type, is_method, .. } => {
                self.declare_func(chunk, node, *name, params, *ret_type, *owner_type, *is_method);
            }
            NodeKind::ObjectDecl { name: obj_name, fields, methods } => {
                if self.symtab.lookup(ROOT, *obj_name).is_some() {
                    self.diagnostics.push(node.id, CompileErrorKind::DuplicateSymbol { name: *obj_name });
                }
                let runtime_type = self.types.alloc_object_type(self.symtab.names.resolve(*obj_name));
                let sym =
                    self.symtab.declare(ROOT, *obj_name, Symbol::Object { runtime_type, module: None });
                let mut field_map = FxHashMap::default();
                for field_name in fields {
                    field_map.insert(*field_name, TypeId::DYNAMIC);
                }
                self.object_fields.insert(sym, field_map);
                for method_id in methods {
                    let method_node = chunk.get(*method_id).clone();
                    if let NodeKind::FuncDecl { name, params, ret_type, owner_type, is_method, .. } =
                        &method_node.head
                    {
                        self.declare_func(
                            chunk,
                            &method_node,
                            *name,
                            params,
                            *ret_type,
                            owner_type.or(Some(*obj_name)),
                            *is_method,
                        );
                    }
                }
            }
            NodeKind::EnumDecl { name, members } => {
                if self.symtab.lookup(ROOT, *name).is_some() {
                    self.diagnostics.push(node.id, CompileErrorKind::DuplicateSymbol { name: *name });
                }
                let runtime_type = self.types.alloc_object_type(self.symtab.names.resolve(*name));
                let owner = self.symtab.declare(ROOT, *name, Symbol::Object { runtime_type, module: None });
                *self.symtab.get_mut(owner) = Symbol::EnumType;
                for (tag, member) in members.iter().enumerate() {
                    self.symtab.declare(owner, *member, Symbol::EnumMember { owner, tag: tag as u32 });
                }
            }
            _ => {}
        }
    }

    fn declare_func(
        &mut self,
        chunk: &Chunk,
        node: &Node,
        name: NameId,
        params: &[Param],
        ret_type: Option<NameId>,
        owner_type: Option<NameId>,
        _is_method: bool,
    ) {
        let parent = match owner_type.and_then(|t| self.symtab.lookup(ROOT, t)) {
            Some(owner_sym) => {
                self.owner_by_node.insert(node.id, owner_sym);
                owner_sym
            }
            None => ROOT,
        };
        let param_types: Vec<TypeId> =
            params.iter().map(|p| self.resolve_type_name(node.id, p.declared_type)).collect();
        let ret = self.resolve_type_name(node.id, ret_type);
        let sig = self.symtab.ensure_func_sig(param_types.as_slice(), ret);
        let func_sym = self.symtab.declare_func_overload(
            parent,
            name,
            sig,
            FuncSym { chunk: chunk.id, decl: node.id, ret_type: ret, has_static_initializer: false },
        );
        self.func_sym_by_node.insert(node.id, func_sym);
    }

    /// Pass two: walk each top-level statement and function body,
    /// inferring types and resolving names.
    pub fn bodies_pass(&mut self, chunk: &mut Chunk) {
        log::info!("bodies pass: chunk {}", chunk.id);
        let top_ids = chunk.chain_ids(chunk.top);
        self.blocks.push(Block::new(true, false));
        for id in top_ids {
            self.analyze_top_level_stmt(chunk, id);
        }
        if let Some(top) = self.blocks.pop() {
            self.warn_unused_locals(chunk, None, &top);
            self.top_level_block = Some(top);
        }
        log::debug!("bodies pass done: {} diagnostics raised", self.diagnostics.len());
    }

    fn analyze_top_level_stmt(&mut self, chunk: &mut Chunk, id: NodeId) {
        let node = chunk.get(id).clone();
        match &node.head {
            NodeKind::VarDecl { name, init, .. } => {
                let sym = self.symtab.lookup(ROOT, *name);
                self.cur_static_init_sym = sym;
                if let Some(init_id) = init {
                    let init_ty = self.analyze_expr(chunk, *init_id);
                    if let Some(sym) = sym {
                        if let Symbol::Variable { typ, .. } = self.symtab.get(sym) {
                            if *typ == TypeId::DYNAMIC {
                                if let Symbol::Variable { typ, .. } = self.symtab.get_mut(sym) {
                                    *typ = init_ty;
                                }
                            }
                        }
                    }
                }
                self.cur_static_init_sym = None;
            }
            NodeKind::FuncDecl { body, params, is_method, .. } => {
                self.analyze_func_body(chunk, &node, body, params, *is_method, None);
            }
            NodeKind::ObjectDecl { name: obj_name, methods, .. } => {
                let obj_sym = self.symtab.lookup(ROOT, *obj_name);
                for method_id in methods.clone() {
                    let method_node = chunk.get(method_id).clone();
                    if let NodeKind::FuncDecl { body, params, is_method, owner_type, .. } =
                        &method_node.head
                    {
                        let owner_sym = owner_type.and_then(|t| self.symtab.lookup(ROOT, t)).or(obj_sym);
                        self.analyze_func_body(
                            chunk,
                            &method_node,
                            body,
                            params,
                            *is_method,
                            owner_sym,
                        );
                    }
                }
            }
            NodeKind::EnumDecl { .. } => {}
            _ => {
                self.analyze_stmt(chunk, id);
            }
        }
    }

    fn analyze_func_body(
        &mut self,
        chunk: &mut Chunk,
        node: &Node,
        body: &NodeId,
        params: &[Param],
        is_method: bool,
        owner_sym: Option<crate::symtab::SymId>,
    ) {
        let is_static_function = self.blocks.len() == 1;
        log::trace!(
            "analyze_func_body: node {} ({} params, static={})",
            node.id,
            params.len(),
            is_static_function
        );
        let param_types: Vec<TypeId> =
            params.iter().map(|p| self.resolve_type_name(node.id, p.declared_type)).collect();
        let mut block = Block::new(is_static_function, is_method);
        block.self_object_sym = owner_sym;
        self.blocks.push(block);
        for (p, ty) in params.iter().zip(param_types) {
            let dynamic = p.declared_type.is_none();
            let local = self.cur_block().declare_param(p.name, ty, dynamic);
            let slot = self.cur_block().params.len() as u32 - 1;
            self.cur_block().reserve_register(local, slot);
        }
        self.analyze_stmt(chunk, *body);
        if let Some(finished) = self.blocks.pop() {
            self.warn_unused_locals(chunk, Some(node.id), &finished);
            self.completed_blocks.insert(node.id, finished);
        }
    }

    /// `CFlag::WarnUnused`: warn once per named local in `block` that was
    /// declared and never read. `context` anchors the message to the
    /// function/lambda node the block belongs to (`None` for the
    /// top-level block, which has no single owning node).
    fn warn_unused_locals(&mut self, chunk: &Chunk, context: Option<NodeId>, block: &Block) {
        for id in block.unread_locals() {
            let name = block.local(id).name;
            report_soft_warning(
                self.flags,
                CFlag::WarnUnused,
                &mut self.warnings_promoted,
                format_args!(
                    "chunk `{}`: local `{}` ({}) is never read",
                    chunk.name,
                    self.symtab.names.resolve(name),
                    context.map_or("top level".to_string(), |n| format!("node {n}")),
                ),
            );
        }
    }

    fn analyze_stmt(&mut self, chunk: &mut Chunk, id: NodeId) {
        let node = chunk.get(id).clone();
        match &node.head {
            NodeKind::Block { first_stmt } => {
                self.cur_block().push_sub_block();
                for stmt_id in chunk.chain_ids(*first_stmt) {
                    self.analyze_stmt(chunk, stmt_id);
                }
                self.cur_block().pop_sub_block();
            }
            NodeKind::Stmt(inner) => self.analyze_stmt(chunk, *inner),
            NodeKind::VarDecl { name, declared_type, init } => {
                let declared = declared_type.map(|t| self.resolve_type_name(id, Some(t)));
                let init_ty = init.map(|e| self.analyze_expr(chunk, e));
                if let (Some(declared_ty), Some(actual_ty)) = (declared, init_ty) {
                    if !self.types.is_compat(actual_ty, declared_ty) {
                        self.diagnostics.push(id, CompileErrorKind::TypeMismatch);
                    }
                }
                let dynamic = declared_type.is_none();
                let ty = declared.or(init_ty).unwrap_or(TypeId::DYNAMIC);
                let local = self.cur_block().declare_local(*name, ty, dynamic);
                self.annotations.entry(id).local = Some(local);
            }
            NodeKind::Assign { target, value } => {
                let value_ty = self.analyze_expr(chunk, *value);
                self.analyze_assign_target(chunk, *target, value_ty);
            }
            NodeKind::If { cond, then_branch, else_branch } => {
                self.analyze_expr(chunk, *cond);
                self.analyze_stmt(chunk, *then_branch);
                if let Some(e) = else_branch {
                    self.analyze_stmt(chunk, *e);
                }
            }
            NodeKind::WhileCond { cond, body } => {
                self.analyze_expr(chunk, *cond);
                let sb = self.cur_block().push_sub_block();
                self.cur_block().widen_dynamic_types_for_loop(sb);
                self.analyze_stmt(chunk, *body);
                self.cur_block().pop_sub_block();
            }
            NodeKind::WhileInf { body } => {
                let sb = self.cur_block().push_sub_block();
                self.cur_block().widen_dynamic_types_for_loop(sb);
                self.analyze_stmt(chunk, *body);
                self.cur_block().pop_sub_block();
            }
            NodeKind::ForRange { var, start, end, step, body } => {
                self.analyze_expr(chunk, *start);
                self.analyze_expr(chunk, *end);
                if let Some(s) = step {
                    self.analyze_expr(chunk, *s);
                }
                let sb = self.cur_block().push_sub_block();
                self.cur_block().widen_dynamic_types_for_loop(sb);
                let local = self.cur_block().declare_local(*var, TypeId::INTEGER, false);
                self.annotations.entry(id).local = Some(local);
                self.analyze_stmt(chunk, *body);
                self.cur_block().pop_sub_block();
            }
            NodeKind::ForIter { var, pair_var, iterable, body } => {
                self.analyze_expr(chunk, *iterable);
                let sb = self.cur_block().push_sub_block();
                self.cur_block().widen_dynamic_types_for_loop(sb);
                let local = self.cur_block().declare_local(*var, TypeId::DYNAMIC, true);
                self.annotations.entry(id).local = Some(local);
                if let Some(pv) = pair_var {
                    let local2 = self.cur_block().declare_local(*pv, TypeId::DYNAMIC, true);
                    self.annotations.entry(id).local2 = Some(local2);
                }
                self.analyze_stmt(chunk, *body);
                self.cur_block().pop_sub_block();
            }
            NodeKind::Match { expr, first_arm } => {
                self.analyze_expr(chunk, *expr);
                for arm_id in chunk.chain_ids(*first_arm) {
                    let arm = chunk.get(arm_id).clone();
                    if let NodeKind::MatchArm { cond, body } = arm.head {
                        self.cur_block().push_sub_block();
                        if let Some(c) = cond {
                            self.analyze_expr(chunk, c);
                        }
                        self.analyze_stmt(chunk, body);
                        self.cur_block().pop_sub_block();
                    }
                }
            }
            NodeKind::Try { body, err_name, catch_body } => {
                self.cur_block().push_sub_block();
                self.analyze_stmt(chunk, *body);
                self.cur_block().pop_sub_block();
                self.cur_block().push_sub_block();
                let err_local = self.cur_block().declare_local(*err_name, TypeId::ERROR, false);
                self.annotations.entry(id).local = Some(err_local);
                self.analyze_stmt(chunk, *catch_body);
                self.cur_block().pop_sub_block();
            }
            NodeKind::Throw(e) => {
                self.analyze_expr(chunk, *e);
            }
            NodeKind::Return(e) => {
                if let Some(e) = e {
                    self.analyze_expr(chunk, *e);
                }
            }
            NodeKind::Break | NodeKind::Continue => {}
            NodeKind::FuncDecl { name, body, params, is_method, .. } => {
                // a nested (non-top-level) function declaration: behaves
                // like a named local bound to the produced closure value,
                // analyzed in place so its body can capture from the
                // enclosing block.
                let local = self.cur_block().declare_local(*name, TypeId::DYNAMIC, true);
                self.annotations.entry(id).local = Some(local);
                self.analyze_func_body(chunk, &node, body, params, *is_method, None);
            }
            _ => {
                // an expression used in statement position.
                self.analyze_expr(chunk, id);
            }
        }
    }

    fn analyze_assign_target(&mut self, chunk: &mut Chunk, target: NodeId, value_ty: TypeId) {
        let node = chunk.get(target).clone();
        match &node.head {
            NodeKind::Ident(name) => match self.get_or_lookup_var(*name, true) {
                Ok(local) => {
                    self.annotations.entry(target).local = Some(local);
                    let dynamic = self.cur_block().local(local).dynamic;
                    if dynamic {
                        self.cur_block().local_mut(local).current_type = value_ty;
                    } else {
                        let declared_ty = self.cur_block().local(local).current_type;
                        if !self.types.is_compat(value_ty, declared_ty) {
                            self.diagnostics.push(target, CompileErrorKind::TypeMismatch);
                        }
                    }
                }
                Err(kind) => self.diagnostics.push(target, kind),
            },
            NodeKind::Field { recv, .. } => {
                self.analyze_expr(chunk, *recv);
            }
            NodeKind::Index { recv, index } => {
                self.analyze_expr(chunk, *recv);
                self.analyze_expr(chunk, *index);
            }
            _ => self.diagnostics.push(target, CompileErrorKind::InvalidAssignmentTarget),
        }
    }

    /// `getOrLookupVar`: resolve `name` to a local in the
    /// current block, synthesizing an `objectMemberAlias`,
    /// `parentLocalAlias`, or `staticAlias` as needed.
    fn get_or_lookup_var(&mut self, name: NameId, allow_static: bool) -> Result<LocalId, CompileErrorKind> {
        if let Some(local) = self.blocks.last().unwrap().lookup(name) {
            if self.cur_static_init_sym.is_some() {
                return Err(CompileErrorKind::LocalReferencedFromStaticInit { name });
            }
            return Ok(local);
        }

        if self.blocks.last().unwrap().is_method {
            if let Some(owner) = self.blocks.last().unwrap().self_object_sym {
                if let Some(fields) = self.object_fields.get(&owner) {
                    if let Some(field_ty) = fields.get(&name).copied() {
                        let local =
                            self.cur_block().declare_alias(name, LocalKind::ObjectMemberAlias, field_ty);
                        return Ok(local);
                    }
                }
            }
        }

        if self.blocks.len() >= 2 {
            let parent_idx = self.blocks.len() - 2;
            if let Some(parent_local) = self.blocks[parent_idx].lookup(name) {
                if self.blocks.last().unwrap().is_static_function {
                    return Err(CompileErrorKind::CaptureInStaticFunc { name });
                }
                self.blocks[parent_idx].local_mut(parent_local).is_boxed = true;
                self.blocks[parent_idx].local_mut(parent_local).read = true;
                let parent_ty = self.blocks[parent_idx].local(parent_local).current_type;
                let idx = self.cur_block_at(self.blocks.len() - 1).add_capture(name, parent_local);
                let local =
                    self.cur_block().declare_alias(name, LocalKind::ParentLocalAlias, parent_ty);
                self.cur_block().local_mut(local).captured_idx = Some(idx);
                return Ok(local);
            }
        }

        if allow_static {
            match self.symtab.resolve_distinct(ROOT, name) {
                Ok(Some(sym)) => {
                    if let Some(cur) = self.cur_static_init_sym {
                        if self.seen_static_deps.insert((cur, sym)) {
                            log::trace!("static init dependency: {cur:?} reads {sym:?}");
                            self.static_init.add_dependency(cur, sym);
                        }
                    }
                    let ty = match self.symtab.get(sym) {
                        Symbol::Variable { typ, .. } => *typ,
                        Symbol::BuiltinType(t) => *t,
                        Symbol::Object { runtime_type, .. } => *runtime_type,
                        _ => TypeId::DYNAMIC,
                    };
                    let local = self.cur_block().declare_alias(name, LocalKind::StaticAlias, ty);
                    self.cur_block().local_mut(local).static_sym = Some(sym);
                    return Ok(local);
                }
                Ok(None) => return Err(CompileErrorKind::UnknownSymbol { name }),
                Err(ResolveError::OverloadedAsValue(_)) => {
                    return Err(CompileErrorKind::AmbiguousOverload { name })
                }
                Err(_) => return Err(CompileErrorKind::UnknownSymbol { name }),
            }
        }

        Err(CompileErrorKind::UnknownSymbol { name })
    }

    fn cur_block_at(&mut self, idx: usize) -> &mut Block {
        &mut self.blocks[idx]
    }

    fn analyze_expr(&mut self, chunk: &mut Chunk, id: NodeId) -> TypeId {
        let node = chunk.get(id).clone();
        let ty = match &node.head {
            NodeKind::IntLit(_) => TypeId::INTEGER,
            NodeKind::FloatLit(_) => TypeId::FLOAT,
            NodeKind::BoolLit(_) => TypeId::BOOLEAN,
            NodeKind::StrLit(_) => TypeId::STATIC_STRING,
            NodeKind::NoneLit => TypeId::NONE,
            NodeKind::Ident(name) => match self.get_or_lookup_var(*name, true) {
                Ok(local) => {
                    self.annotations.entry(id).local = Some(local);
                    self.cur_block().local_mut(local).read = true;
                    self.blocks.last().unwrap().local(local).current_type
                }
                Err(kind) => {
                    self.diagnostics.push(id, kind);
                    TypeId::DYNAMIC
                }
            },
            NodeKind::Unary { op, expr } => {
                let inner = self.analyze_expr(chunk, *expr);
                match op {
                    UnOp::Neg if is_numeric(inner) => {
                        self.annotations.entry(id).strategy = Some(OpStrategy::Specialized);
                        inner
                    }
                    UnOp::Neg => {
                        self.annotations.entry(id).strategy = Some(OpStrategy::Generic);
                        TypeId::DYNAMIC
                    }
                    UnOp::Not => TypeId::BOOLEAN,
                    UnOp::BitNot if inner == TypeId::INTEGER => {
                        self.annotations.entry(id).strategy = Some(OpStrategy::Specialized);
                        TypeId::INTEGER
                    }
                    UnOp::BitNot => {
                        self.annotations.entry(id).strategy = Some(OpStrategy::Generic);
                        TypeId::DYNAMIC
                    }
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let lt = self.analyze_expr(chunk, *lhs);
                let rt = self.analyze_expr(chunk, *rhs);
                self.infer_binary(id, *op, lt, rt)
            }
            NodeKind::Call { callee, first_arg } => {
                let arg_ids = chunk.chain_ids(*first_arg);
                let arg_types: Vec<TypeId> =
                    arg_ids.iter().map(|a| self.analyze_expr(chunk, *a)).collect();
                self.analyze_call(chunk, id, *callee, &arg_types)
            }
            NodeKind::MethodCall { recv, first_arg, .. } => {
                self.analyze_expr(chunk, *recv);
                for a in chunk.chain_ids(*first_arg) {
                    self.analyze_expr(chunk, a);
                }
                TypeId::DYNAMIC
            }
            NodeKind::Arg(inner) | NodeKind::Item(inner) => self.analyze_expr(chunk, *inner),
            NodeKind::Field { recv, name } => {
                let recv_ty = self.analyze_expr(chunk, *recv);
                if let Some(fields) = self.object_fields.get(&self.object_sym_for_type(recv_ty)) {
                    fields.get(name).copied().unwrap_or(TypeId::DYNAMIC)
                } else {
                    TypeId::DYNAMIC
                }
            }
            NodeKind::Index { recv, index } => {
                self.analyze_expr(chunk, *recv);
                self.analyze_expr(chunk, *index);
                TypeId::DYNAMIC
            }
            NodeKind::ListLit { first_item } => {
                for item in chunk.chain_ids(*first_item) {
                    self.analyze_expr(chunk, item);
                }
                TypeId::LIST
            }
            NodeKind::MapLit { first_pair } => {
                for pair_id in chunk.chain_ids(*first_pair) {
                    let pair = chunk.get(pair_id).clone();
                    if let NodeKind::Pair { key, value } = pair.head {
                        self.analyze_expr(chunk, key);
                        self.analyze_expr(chunk, value);
                    }
                }
                TypeId::MAP
            }
            NodeKind::ObjectLit { type_name, first_field } => {
                for field_id in chunk.chain_ids(*first_field) {
                    let f = chunk.get(field_id).clone();
                    if let NodeKind::FieldInit { value, .. } = f.head {
                        self.analyze_expr(chunk, value);
                    }
                }
                match self.symtab.lookup(ROOT, *type_name) {
                    Some(sym) => match self.symtab.get(sym) {
                        Symbol::Object { runtime_type, .. } => *runtime_type,
                        _ => TypeId::DYNAMIC,
                    },
                    None => {
                        self.diagnostics.push(id, CompileErrorKind::UnknownSymbol { name: *type_name });
                        TypeId::DYNAMIC
                    }
                }
            }
            NodeKind::Pair { .. } | NodeKind::FieldInit { .. } => TypeId::DYNAMIC,
            NodeKind::StringTemplate { first_part } => {
                for part in chunk.chain_ids(*first_part) {
                    let p = chunk.get(part).clone();
                    if let NodeKind::TemplateExpr(e) = p.head {
                        self.analyze_expr(chunk, e);
                    }
                }
                TypeId::STRING
            }
            NodeKind::TemplateLit(_) | NodeKind::TemplateExpr(_) => TypeId::DYNAMIC,
            NodeKind::Lambda { params, body } => {
                self.analyze_func_body(
                    chunk,
                    &node,
                    body,
                    params,
                    false,
                    self.blocks.last().and_then(|b| b.self_object_sym),
                );
                TypeId::DYNAMIC
            }
            NodeKind::CoInit(call) => {
                self.analyze_expr(chunk, *call);
                TypeId::FIBER
            }
            NodeKind::CoYield => TypeId::NONE,
            NodeKind::CoResume(fiber) => {
                self.analyze_expr(chunk, *fiber);
                TypeId::DYNAMIC
            }
            _ => {
                self.diagnostics.push(id, CompileErrorKind::UnsupportedNode);
                TypeId::DYNAMIC
            }
        };
        self.annotations.entry(id).ty = Some(ty);
        ty
    }

    /// A crude reverse map from a runtime object-type id back to the
    /// declaring symbol, used only for field-type lookups during
    /// inference; `None`/non-object types map to [`ROOT`] (a lookup miss).
    fn object_sym_for_type(&self, ty: TypeId) -> crate::symtab::SymId {
        self.object_fields
            .iter()
            .find(|(sym, _)| matches!(self.symtab.get(**sym), Symbol::Object { runtime_type, .. } if *runtime_type == ty))
            .map(|(sym, _)| *sym)
            .unwrap_or(ROOT)
    }

    fn infer_binary(&mut self, node: NodeId, op: BinOp, lt: TypeId, rt: TypeId) -> TypeId {
        match op {
            BinOp::And | BinOp::Or => self.types.common_type(lt, rt),
            _ if is_comparison(op) => {
                let specialized = is_numeric(lt) && is_numeric(rt);
                self.annotations.entry(node).strategy =
                    Some(if specialized { OpStrategy::Specialized } else { OpStrategy::Generic });
                TypeId::BOOLEAN
            }
            _ => {
                let specialized = is_numeric(lt) && is_numeric(rt);
                self.annotations.entry(node).strategy =
                    Some(if specialized { OpStrategy::Specialized } else { OpStrategy::Generic });
                if specialized {
                    if lt == TypeId::INTEGER && rt == TypeId::INTEGER {
                        TypeId::INTEGER
                    } else {
                        TypeId::FLOAT
                    }
                } else {
                    TypeId::DYNAMIC
                }
            }
        }
    }

    fn analyze_call(
        &mut self,
        chunk: &mut Chunk,
        node: NodeId,
        callee: NodeId,
        arg_types: &[TypeId],
    ) -> TypeId {
        let callee_node = chunk.get(callee).clone();
        let NodeKind::Ident(name) = callee_node.head else {
            self.analyze_expr(chunk, callee);
            return TypeId::DYNAMIC;
        };
        let has_dynamic_arg = arg_types.iter().any(|t| *t == TypeId::DYNAMIC);
        match self.symtab.resolve_for_call(ROOT, &[], name, arg_types, &self.types, has_dynamic_arg) {
            Ok(Some(result)) => {
                self.annotations.entry(node).sym = Some(result.sym);
                self.symtab.func_sig(result.sig).ret
            }
            Ok(None) => {
                self.diagnostics.push(node, CompileErrorKind::UnknownSymbol { name });
                TypeId::DYNAMIC
            }
            Err(ResolveError::AmbiguousOverload(_)) => {
                self.diagnostics.push(node, CompileErrorKind::AmbiguousOverload { name });
                TypeId::DYNAMIC
            }
            Err(_) => {
                self.diagnostics.push(node, CompileErrorKind::IncompatibleSignature { name });
                TypeId::DYNAMIC
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{link_chain, Chunk, NodeKind};
    use crate::CFlag;
    use enumflags2::BitFlags;

    fn analyzer() -> SemanticAnalyzer {
        SemanticAnalyzer::new(BitFlags::<CFlag>::empty())
    }

    #[test]
    fn s1_arithmetic_specializes_for_two_integers() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("s1");
        let one = chunk.push(NodeKind::IntLit(1));
        let two = chunk.push(NodeKind::IntLit(2));
        let add = chunk.push(NodeKind::Binary { op: BinOp::Add, lhs: one, rhs: two });
        chunk.top = Some(add);
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        let info = a.annotations.get(add).unwrap();
        assert_eq!(info.ty, Some(TypeId::INTEGER));
        assert_eq!(info.strategy, Some(OpStrategy::Specialized));
    }

    #[test]
    fn s6_static_init_orders_b_before_a() {
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
        assert!(a.diagnostics.is_empty());

        let (order, cycles) = a.static_init.schedule();
        assert!(cycles.is_empty());
        let sym_a = a.symtab.lookup(ROOT, name_a).unwrap();
        let sym_b = a.symtab.lookup(ROOT, name_b).unwrap();
        let pos_a = order.iter().position(|s| *s == sym_a).unwrap();
        let pos_b = order.iter().position(|s| *s == sym_b).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn redeclaring_a_top_level_name_reports_duplicate_symbol() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("dup");
        let name = a.symtab.names.intern("x");
        let one = chunk.push(NodeKind::IntLit(1));
        let decl_one = chunk.push(NodeKind::VarDecl { name, declared_type: None, init: Some(one) });
        let two = chunk.push(NodeKind::IntLit(2));
        let decl_two = chunk.push(NodeKind::VarDecl { name, declared_type: None, init: Some(two) });
        let top = link_chain(&mut chunk, &[decl_one, decl_two]);
        chunk.top = top;
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        assert!(a
            .diagnostics
            .iter()
            .any(|e| matches!(e.kind, CompileErrorKind::DuplicateSymbol { .. })));
    }

    #[test]
    fn assigning_an_incompatible_type_to_a_typed_local_reports_type_mismatch() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("mismatch");
        let string_ty = a.symtab.names.intern("string");
        let name = a.symtab.names.intern("s");
        let lit = chunk.push(NodeKind::StrLit(a.symtab.names.intern("hi")));
        let decl =
            chunk.push(NodeKind::VarDecl { name, declared_type: Some(string_ty), init: Some(lit) });
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
        let ident = chunk.push(NodeKind::Ident(name));
        let num = chunk.push(NodeKind::IntLit(7));
        let assign = chunk.push(NodeKind::Assign { target: ident, value: num });
        if let NodeKind::Block { first_stmt } = &mut chunk.get_mut(body).head {
            *first_stmt = Some(assign);
        }
        let top = link_chain(&mut chunk, &[decl, func]);
        chunk.top = top;
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        assert!(a.diagnostics.iter().any(|e| matches!(e.kind, CompileErrorKind::TypeMismatch)));
    }

    #[test]
    fn unknown_identifier_reports_diagnostic() {
        let mut a = analyzer();
        let mut chunk = Chunk::new("err");
        let bogus = a.symtab.names.intern("nope");
        let ident = chunk.push(NodeKind::Ident(bogus));
        chunk.top = Some(ident);
        a.declare_pass(&chunk);
        a.bodies_pass(&mut chunk);
        assert_eq!(a.diagnostics.len(), 1);
    }
}
