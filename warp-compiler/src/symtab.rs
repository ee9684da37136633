//! The global symbol graph: interned names, the `(parent, name) -> Symbol`
//! graph, function-signature interning and overload resolution
//!.

use crate::interned_id;
use crate::intern::{Interner, NameId};
use crate::types::TypeId;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

interned_id! {
    /// A global symbol: a variable, function family, object/enum type,
    /// module, or builtin-type entry, keyed by `(parent, name)`.
    SymId
}

interned_id! {
    /// One concrete overload of a function family, keyed by
    /// `(SymId, FuncSigId)`.
    FuncSymId
}

interned_id! {
    /// An interned `(paramTypes[], returnType)` tuple — the overloading
    /// key.
    FuncSigId
}

/// `CompactSymbolId` — a 31-bit id plus one flag bit distinguishing a
/// `FuncSym` reference from a plain `Symbol` reference, with the
/// all-bits-set pattern reserved as `NULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompactSymbolId(u32);

impl CompactSymbolId {
    pub const NULL: Self = Self(u32::MAX);
    const FUNC_FLAG: u32 = 1 << 31;
    const INDEX_MASK: u32 = !Self::FUNC_FLAG;

    pub fn from_sym(id: SymId) -> Self {
        debug_assert!(id.0 & Self::FUNC_FLAG == 0, "SymId overflowed 31 bits");
        Self(id.0 & Self::INDEX_MASK)
    }

    pub fn from_func_sym(id: FuncSymId) -> Self {
        debug_assert!(id.0 & Self::FUNC_FLAG == 0, "FuncSymId overflowed 31 bits");
        Self(id.0 | Self::FUNC_FLAG)
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn is_func_sym(self) -> bool {
        !self.is_null() && self.0 & Self::FUNC_FLAG != 0
    }

    pub fn as_sym(self) -> Option<SymId> {
        (!self.is_null() && !self.is_func_sym()).then(|| SymId(self.0 & Self::INDEX_MASK))
    }

    pub fn as_func_sym(self) -> Option<FuncSymId> {
        (self.is_func_sym()).then(|| FuncSymId(self.0 & Self::INDEX_MASK))
    }
}

/// When a name resolves to more than one overload, the parent `Symbol`'s
/// function binding becomes this sentinel instead of a single
/// `FuncSymId`; callers must resolve through [`SymbolTable::resolve_for_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncBinding {
    Single(FuncSymId),
    Overloaded,
}

#[derive(Debug, Clone)]
pub enum Symbol {
    Variable { typ: TypeId, decl_chunk: crate::ChunkId, decl_node: crate::NodeId },
    Function(FuncBinding),
    Object { runtime_type: TypeId, module: Option<SymId> },
    EnumType,
    EnumMember { owner: SymId, tag: u32 },
    Module,
    BuiltinType(TypeId),
    Internal,
}

#[derive(Debug, Clone)]
pub struct FuncSig {
    pub params: SmallVec<[TypeId; 4]>,
    pub ret: TypeId,
    /// true iff any param type is neither `any` nor `dynamic` — the
    /// emitter must insert a runtime arity+type check at call sites that
    /// cannot be verified statically.
    pub req_call_type_check: bool,
}

#[derive(Debug, Clone)]
pub struct FuncSym {
    pub chunk: crate::ChunkId,
    pub decl: crate::NodeId,
    pub ret_type: TypeId,
    pub has_static_initializer: bool,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("multiple overloads named {0}")]
    AmbiguousOverload(String),
    #[error("no overload of {name} matches the given arguments; the only overload is {sole}")]
    WrongSignature { name: String, sole: String },
    #[error("no overload of {0} matches the given arguments")]
    NoMatchingOverload(String),
    #[error("{0} names an overloaded function; use it as a call, not a value")]
    OverloadedAsValue(String),
}

pub struct FuncCallSymResult {
    pub func_sym: FuncSymId,
    pub sig: FuncSigId,
    pub sym: SymId,
}

#[derive(Default)]
pub struct SymbolTable {
    pub names: Interner,
    syms: Vec<Symbol>,
    by_parent_name: FxHashMap<(SymId, NameId), SymId>,
    sym_name: FxHashMap<SymId, (SymId, NameId)>,

    funcsigs: Vec<FuncSig>,
    funcsig_index: FxHashMap<(SmallVec<[TypeId; 4]>, TypeId), FuncSigId>,
    /// untyped signatures (every param `any`/`dynamic`) cached by arity,
    /// for the common "no declared param types" case.
    untyped_sig_by_arity: FxHashMap<usize, FuncSigId>,

    funcsyms: Vec<FuncSym>,
    funcsyms_by_sym: FxHashMap<SymId, SmallVec<[(FuncSigId, FuncSymId); 2]>>,
}

/// Distinguished "null parent" — the root of the symbol graph.
pub const ROOT: SymId = SymId(u32::MAX - 1);

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sym_id(&self) -> SymId {
        SymId(self.syms.len() as u32)
    }

    /// Total number of symbols declared so far, for progress logging.
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Declare a new symbol under `(parent, name)`. Invariant: a
    /// `(parent,name)` pair maps to at most one `Symbol` — calling
    /// this twice for the same pair returns the existing id without
    /// overwriting it; callers that want shadowing must `undeclare` first.
    pub fn declare(&mut self, parent: SymId, name: NameId, sym: Symbol) -> SymId {
        if let Some(existing) = self.by_parent_name.get(&(parent, name)) {
            return *existing;
        }
        let id = self.next_sym_id();
        self.syms.push(sym);
        self.by_parent_name.insert((parent, name), id);
        self.sym_name.insert(id, (parent, name));
        id
    }

    pub fn get(&self, id: SymId) -> &Symbol {
        &self.syms[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SymId) -> &mut Symbol {
        &mut self.syms[id.0 as usize]
    }

    pub fn lookup(&self, parent: SymId, name: NameId) -> Option<SymId> {
        self.by_parent_name.get(&(parent, name)).copied()
    }

    /// `resolveDistinct` — for value-context uses (variable read, import).
    /// Fails if the name exists only as an overloaded function family.
    pub fn resolve_distinct(
        &self,
        parent: SymId,
        name: NameId,
    ) -> Result<Option<SymId>, ResolveError> {
        let Some(id) = self.lookup(parent, name) else { return Ok(None) };
        if let Symbol::Function(FuncBinding::Overloaded) = self.get(id) {
            return Err(ResolveError::OverloadedAsValue(
                self.names.resolve(name).to_string(),
            ));
        }
        Ok(Some(id))
    }

    pub fn ensure_func_sig(
        &mut self,
        params: impl Into<SmallVec<[TypeId; 4]>>,
        ret: TypeId,
    ) -> FuncSigId {
        let params = params.into();
        let req_call_type_check =
            params.iter().any(|t| *t != TypeId::ANY && *t != TypeId::DYNAMIC);
        let key = (params.clone(), ret);
        if let Some(id) = self.funcsig_index.get(&key) {
            return *id;
        }
        let id = FuncSigId(self.funcsigs.len() as u32);
        self.funcsigs.push(FuncSig { params: params.clone(), ret, req_call_type_check });
        self.funcsig_index.insert(key, id);
        if !req_call_type_check {
            self.untyped_sig_by_arity.entry(params.len()).or_insert(id);
        }
        id
    }

    pub fn func_sig(&self, id: FuncSigId) -> &FuncSig {
        &self.funcsigs[id.0 as usize]
    }

    /// Register a concrete overload of the function family named by
    /// `(parent, name)`. Updates the family's binding to
    /// [`FuncBinding::Overloaded`] as soon as a second signature appears.
    pub fn declare_func_overload(
        &mut self,
        parent: SymId,
        name: NameId,
        sig: FuncSigId,
        entry: FuncSym,
    ) -> FuncSymId {
        let sym = self.declare(parent, name, Symbol::Function(FuncBinding::Single(FuncSymId(0))));
        let func_sym_id = FuncSymId(self.funcsyms.len() as u32);
        self.funcsyms.push(entry);
        let overloads = self.funcsyms_by_sym.entry(sym).or_default();
        overloads.push((sig, func_sym_id));
        let binding = if overloads.len() == 1 {
            FuncBinding::Single(func_sym_id)
        } else {
            FuncBinding::Overloaded
        };
        *self.get_mut(sym) = Symbol::Function(binding);
        func_sym_id
    }

    pub fn func_sym(&self, id: FuncSymId) -> &FuncSym {
        &self.funcsyms[id.0 as usize]
    }

    /// `resolveForCall` — match an exact overload of `name` under `parent`
    /// against `arg_types`. `search_order` lists additional ancestor/using
    /// scopes to try, in order, if `parent` has no matching name; the
    /// analyzer builds this list from lexical nesting, the enclosing
    /// object module, and `use` imports. Returns `Ok(None)`
    /// only when the name is unknown in every scope searched.
    pub fn resolve_for_call(
        &self,
        parent: SymId,
        search_order: &[SymId],
        name: NameId,
        arg_types: &[TypeId],
        lattice: &crate::types::TypeLattice,
        has_dynamic_arg: bool,
    ) -> Result<Option<FuncCallSymResult>, ResolveError> {
        for scope in std::iter::once(parent).chain(search_order.iter().copied()) {
            let Some(sym) = self.lookup(scope, name) else { continue };
            let Symbol::Function(_) = self.get(sym) else { continue };
            let Some(overloads) = self.funcsyms_by_sym.get(&sym) else { continue };
            let mut matches: SmallVec<[(FuncSigId, FuncSymId); 2]> = SmallVec::new();
            for (sig_id, func_id) in overloads {
                let sig = self.func_sig(*sig_id);
                if sig.params.len() != arg_types.len() {
                    continue;
                }
                let ok = sig
                    .params
                    .iter()
                    .zip(arg_types.iter())
                    .all(|(p, a)| lattice.is_compat(*a, *p) || (has_dynamic_arg && *a == TypeId::DYNAMIC));
                if ok {
                    matches.push((*sig_id, *func_id));
                }
            }
            return match matches.len() {
                0 if overloads.len() == 1 => {
                    let (sole_sig, _) = overloads[0];
                    Err(ResolveError::WrongSignature {
                        name: self.names.resolve(name).to_string(),
                        sole: format!("{:?}", self.func_sig(sole_sig)),
                    })
                }
                0 => Err(ResolveError::NoMatchingOverload(
                    self.names.resolve(name).to_string(),
                )),
                1 => {
                    let (sig, func_sym) = matches[0];
                    Ok(Some(FuncCallSymResult { func_sym, sig, sym }))
                }
                _ => Err(ResolveError::AmbiguousOverload(
                    self.names.resolve(name).to_string(),
                )),
            };
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeLattice;

    fn make() -> (SymbolTable, crate::ChunkId, crate::NodeId) {
        (SymbolTable::new(), crate::ChunkId::fresh(), crate::NodeId::fresh())
    }

    #[test]
    fn compact_symbol_id_round_trips() {
        let s = SymId(42);
        let f = FuncSymId(7);
        assert_eq!(CompactSymbolId::from_sym(s).as_sym(), Some(s));
        assert_eq!(CompactSymbolId::from_func_sym(f).as_func_sym(), Some(f));
        assert!(CompactSymbolId::NULL.is_null());
        assert!(CompactSymbolId::from_func_sym(f).is_func_sym());
        assert!(!CompactSymbolId::from_sym(s).is_func_sym());
    }

    #[test]
    fn single_overload_resolves_and_becomes_value() {
        let (mut st, chunk, node) = make();
        let name = st.names.intern("foo");
        let sig = st.ensure_func_sig([TypeId::INTEGER].as_slice(), TypeId::INTEGER);
        st.declare_func_overload(
            ROOT,
            name,
            sig,
            FuncSym { chunk, decl: node, ret_type: TypeId::INTEGER, has_static_initializer: false },
        );
        let sym = st.resolve_distinct(ROOT, name).unwrap().unwrap();
        assert!(matches!(st.get(sym), Symbol::Function(FuncBinding::Single(_))));
    }

    #[test]
    fn two_overloads_mark_family_overloaded_and_resolve_by_sig() {
        let (mut st, chunk, node) = make();
        let lat = TypeLattice::new();
        let name = st.names.intern("foo");
        let sig_i = st.ensure_func_sig([TypeId::INTEGER].as_slice(), TypeId::INTEGER);
        let sig_s = st.ensure_func_sig([TypeId::STRING].as_slice(), TypeId::STRING);
        st.declare_func_overload(
            ROOT,
            name,
            sig_i,
            FuncSym { chunk, decl: node, ret_type: TypeId::INTEGER, has_static_initializer: false },
        );
        st.declare_func_overload(
            ROOT,
            name,
            sig_s,
            FuncSym { chunk, decl: node, ret_type: TypeId::STRING, has_static_initializer: false },
        );
        assert!(st.resolve_distinct(ROOT, name).is_err());
        let r = st
            .resolve_for_call(ROOT, &[], name, &[TypeId::STRING], &lat, false)
            .unwrap()
            .unwrap();
        assert_eq!(r.sig, sig_s);
    }

    #[test]
    fn wrong_signature_names_sole_overload() {
        let (mut st, chunk, node) = make();
        let lat = TypeLattice::new();
        let name = st.names.intern("foo");
        let sig = st.ensure_func_sig([TypeId::INTEGER].as_slice(), TypeId::INTEGER);
        st.declare_func_overload(
            ROOT,
            name,
            sig,
            FuncSym { chunk, decl: node, ret_type: TypeId::INTEGER, has_static_initializer: false },
        );
        let err = st
            .resolve_for_call(ROOT, &[], name, &[TypeId::STRING], &lat, false)
            .unwrap_err();
        assert!(matches!(err, ResolveError::WrongSignature { .. }));
    }

    #[test]
    fn unknown_name_is_none_not_error() {
        let (st, _c, _n) = make();
        let lat = TypeLattice::new();
        let name = NameId(9999);
        assert!(st.resolve_for_call(ROOT, &[], name, &[], &lat, false).unwrap().is_none());
    }

    #[test]
    fn determinism_same_args_same_callee_same_funcsym() {
        let (mut st, chunk, node) = make();
        let lat = TypeLattice::new();
        let name = st.names.intern("f");
        let sig = st.ensure_func_sig([TypeId::INTEGER, TypeId::INTEGER].as_slice(), TypeId::INTEGER);
        st.declare_func_overload(
            ROOT,
            name,
            sig,
            FuncSym { chunk, decl: node, ret_type: TypeId::INTEGER, has_static_initializer: false },
        );
        let a = st
            .resolve_for_call(ROOT, &[], name, &[TypeId::INTEGER, TypeId::INTEGER], &lat, false)
            .unwrap()
            .unwrap();
        let b = st
            .resolve_for_call(ROOT, &[], name, &[TypeId::INTEGER, TypeId::INTEGER], &lat, false)
            .unwrap()
            .unwrap();
        assert_eq!(a.func_sym, b.func_sym);
    }
}
