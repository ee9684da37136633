//! Fiber stack model and ARC unwinding runtime for the `warp` scripting
//! language. This crate owns everything the fiber runtime model delegates
//! to it rather than inlining into the instruction-dispatch loop itself:
//! stack/frame-pointer bookkeeping, the try-frame stack, the three
//! unwinders (normal return is trivial and left to the loop; throw and
//! fiber teardown are not), and the runtime-side symbol tables the
//! dispatch loop consults to resolve `callSym`/`staticVar`/`field`
//! operands. It depends on `warp-compiler` for the bytecode shape
//! (`Op`, `Pc`, `Reg`) and the [`warp_compiler::debuginfo::DebugSymbolTable`]
//! built during emission.
//!
//! The dispatch loop itself — the thing that actually interprets `Op`
//! values and owns a concrete heap/value representation — is an external
//! collaborator, same as the lexer/parser. This crate is therefore
//! generic over the host's stack-slot representation via the [`fiber::Slot`]
//! trait rather than assuming one.

pub mod fiber;
pub mod unwind;

use fxhash::FxHashMap;
use indexmap::IndexMap;
use thiserror::Error;
use warp_compiler::opcode::Pc;
use warp_compiler::symtab::{FuncSigId, SymId};

warp_compiler::interned_id! {
    /// Identifies one live fiber. Allocated on `coinit`, never reused.
    FiberId
}

/// The tag half of a runtime panic payload: every thrown error that
/// escapes its fiber with no catching try-frame becomes one of these,
/// carried back to whichever
/// fiber issued the `coresume` that was running when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicType {
    None,
    UncaughtError,
    StaticMsg,
    Msg,
    NativeThrow,
    InflightOom,
}

/// A runtime error kind. Each becomes a
/// thrown `Error` value that unwinds through try-frames; `Panic` wraps a
/// [`PanicType`] for the cases where there is no catching frame left at
/// all and the fiber itself must panic.
#[derive(Debug, Error)]
pub enum RuntimePanic {
    #[error("type error: {detail}")]
    TypeError { detail: &'static str },

    #[error("field missing")]
    FieldMissing,

    #[error("divide by zero")]
    DivideByZero,

    #[error("index out of bounds")]
    IndexOutOfBounds,

    #[error("panic: {kind:?}")]
    Panic { kind: PanicType },

    #[error("out of memory")]
    OutOfMemory,
}

/// How a `funcSyms` entry resolves at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncRuntimeKind {
    HostFunc,
    HostQuickenFunc,
    UserFunc,
    Closure,
    None,
}

/// One row of the runtime's `funcSyms[symId]` table: everything the
/// dispatch loop needs to perform a `callSym`/`callObjSym` without
/// touching the compiler's own `SymbolTable`.
#[derive(Debug, Clone, Copy)]
pub struct FuncSymEntry {
    pub kind: FuncRuntimeKind,
    pub entry_pc: Pc,
    pub num_locals: u32,
    pub num_params: u32,
    pub sig: FuncSigId,
    pub req_call_type_check: bool,
}

/// Lazy per-field-symbol most-recently-used cache, keyed by
/// `fieldSyms[fieldSymId]`: the last `(type, offset)` pair a `field`/
/// `setField` op resolved to, so repeat accesses on monomorphic call
/// sites skip a full field lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldSymCache {
    pub mru_type: Option<SymId>,
    pub mru_offset: u32,
    pub mru_field_type: Option<SymId>,
}

/// `methodSyms[(typeId, methodGroupId)]` entry: either a user bytecode
/// entry point or a host function pointer, keyed by the interned
/// `(name, arity)` method-group id the emitter wrote at the call site.
#[derive(Debug, Clone, Copy)]
pub enum MethodEntry {
    User { entry_pc: Pc, sig: FuncSigId },
    Host { slot: u32 },
}

/// The runtime-side symbol tables populated by the host as it loads a
/// compiled chunk. `warp-compiler` never constructs these —
/// it only hands back the `SymId`/`FuncSigId` keys they're indexed by.
///
/// `method_syms` is an `IndexMap` rather than a plain hash map: a host
/// dumping the loaded method table for diagnostics gets it back in
/// load order, matching how the emitter interned method-group ids.
#[derive(Debug, Default)]
pub struct SymbolTables {
    pub func_syms: FxHashMap<SymId, FuncSymEntry>,
    pub field_syms: Vec<FieldSymCache>,
    pub method_syms: IndexMap<(SymId, u32), MethodEntry>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Invoked at declaration time for an `@host` type marker. Fills in the
/// runtime type id (and, optionally, a semantic type id the analyzer's
/// `TypeLattice` already allocated for it), the same way a module
/// resolver supplies a concrete binding for an otherwise-unresolved
/// import.
pub trait TypeLoader {
    fn load_type(&mut self, module: &str, name: &str, idx: u32) -> Option<HostTypeResult>;
}

#[derive(Debug, Clone, Copy)]
pub struct HostTypeResult {
    pub runtime_type_id: SymId,
    pub semantic_type_id: Option<SymId>,
}

/// Resolves a declared host function to either a plain function pointer
/// or a "quicken" pointer that may rewrite its own call site's opcode
/// after the first execution (e.g. specializing a generic call to a
/// monomorphic one once the receiver type is known).
pub trait FuncLoader {
    fn load_func(&mut self, module: &str, name: &str) -> Option<FuncLoadResult>;
}

#[derive(Debug, Clone, Copy)]
pub enum FuncLoadResult {
    Host { slot: u32 },
    Quicken { slot: u32 },
}

/// Supplies a top-level host-backed variable's initial value. Returning
/// `None` leaves the variable `none`, matching `var-loader` semantics.
pub trait VarLoader<V> {
    fn load_var(&mut self, module: &str, name: &str) -> Option<V>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fiber_ids_are_distinct_and_ordered() {
        let a = FiberId::next(&std::sync::atomic::AtomicU32::new(0));
        let b = FiberId::next(&std::sync::atomic::AtomicU32::new(1));
        assert_ne!(a, b);
        assert!(a.0 < b.0);
    }

    #[test]
    fn func_sym_entry_carries_dispatch_shape() {
        let e = FuncSymEntry {
            kind: FuncRuntimeKind::UserFunc,
            entry_pc: 42,
            num_locals: 8,
            num_params: 2,
            sig: FuncSigId(0),
            req_call_type_check: false,
        };
        assert_eq!(e.entry_pc, 42);
        assert_eq!(e.kind, FuncRuntimeKind::UserFunc);
    }
}
