//! Semantic-analysis and bytecode-emission core of the `warp` scripting
//! language. This crate owns name resolution, lightweight type inference,
//! register allocation and bytecode emission; it does not lex, parse, or
//! execute anything — see [`ast`] for the node shape it consumes and
//! `warp-rt` for the fiber runtime that executes what [`emit`] produces.

pub mod analyzer;
pub mod ast;
pub mod block;
pub mod debuginfo;
pub mod emit;
pub mod error;
pub mod intern;
pub mod opcode;
pub mod regalloc;
pub mod staticinit;
pub mod symtab;
pub mod types;

use enumflags2::{bitflags, BitFlags};
use std::sync::atomic::{AtomicU32, Ordering};

/// Declares a 32-bit interned-id newtype with a monotonic allocator and a
/// sentinel `NULL` (all bits set), matching the `atomic_id!`-style handles
/// used throughout the symbol table and emitter (`NameId`, `SymId`,
/// `FuncSigId`, `NodeId`, ...).
#[macro_export]
macro_rules! interned_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub const NULL: Self = Self(u32::MAX);

            pub fn is_null(self) -> bool {
                self == Self::NULL
            }

            pub fn next(counter: &::std::sync::atomic::AtomicU32) -> Self {
                Self(counter.fetch_add(1, ::std::sync::atomic::Ordering::Relaxed))
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                if self.is_null() {
                    write!(f, "{}(NULL)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), self.0)
                }
            }
        }
    };
}

/// Flags that change how the compiler reports soft diagnostics. Threaded
/// through `SemanticAnalyzer` and `BytecodeEmitter` much like node
/// compilers thread a `CFlag` set through their own checks.
#[derive(Debug, Clone, Copy)]
#[bitflags]
#[repr(u64)]
pub enum CFlag {
    /// Warn when a `match` without an else has an unreachable tail.
    WarnUnhandled,
    /// Warn when static-initializer dependency cycles resolve to `none`.
    WarnStaticInitCycle,
    /// Warn when a local is declared and never read.
    WarnUnused,
    /// Promote every warning enabled above to a hard compile error.
    WarningsAreErrors,
}

pub type CFlags = BitFlags<CFlag>;

/// Emits a soft diagnostic gated by `flag`: a no-op unless `flags` has it
/// set. If `CFlag::WarningsAreErrors` is also set, logs at `error!` level
/// and flips `promoted` to `true` (the caller treats this as a failed
/// compile); otherwise logs at `warn!` level and leaves `promoted` alone.
pub fn report_soft_warning(flags: CFlags, flag: CFlag, promoted: &mut bool, msg: std::fmt::Arguments) {
    if !flags.contains(flag) {
        return;
    }
    if flags.contains(CFlag::WarningsAreErrors) {
        *promoted = true;
        log::error!("{msg}");
    } else {
        log::warn!("{msg}");
    }
}

static NODE_ID_COUNTER: AtomicU32 = AtomicU32::new(0);
static CHUNK_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

interned_id! {
    /// Identifies one AST node within its chunk's arena.
    NodeId
}

impl NodeId {
    pub fn fresh() -> Self {
        Self::next(&NODE_ID_COUNTER)
    }
}

interned_id! {
    /// Identifies one compile unit (one source file's worth of AST).
    ChunkId
}

impl ChunkId {
    pub fn fresh() -> Self {
        Self::next(&CHUNK_ID_COUNTER)
    }
}

/// The single entry point a host embedding this crate calls to turn an
/// externally-built [`ast::Chunk`] into bytecode: validate, declare,
/// analyze bodies, emit. Returns `Err` only for a malformed `Chunk` (a
/// dangling `NodeId`) — the program's own semantic errors accumulate
/// non-fatally in [`analyzer::SemanticAnalyzer::diagnostics`] instead,
/// since a host generally wants every diagnostic in one pass rather than
/// stopping at the first.
pub fn compile_chunk(
    analyzer: &mut analyzer::SemanticAnalyzer,
    chunk: &mut ast::Chunk,
) -> anyhow::Result<emit::EmitResult> {
    use anyhow::Context;
    chunk.validate().with_context(|| format!("chunk `{}` failed validation", chunk.name))?;
    analyzer.declare_pass(chunk);
    analyzer.bodies_pass(chunk);
    let result = emit::BytecodeEmitter::new().emit_chunk(analyzer, chunk);
    anyhow::ensure!(
        !analyzer.warnings_promoted,
        "chunk `{}` failed: a CFlag::WarningsAreErrors-gated warning fired",
        chunk.name
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Chunk, NodeKind};
    use crate::CFlag;
    use enumflags2::BitFlags;

    #[test]
    fn compile_chunk_rejects_a_dangling_next_link() {
        let mut chunk = Chunk::new("dangling");
        let a = chunk.push(NodeKind::IntLit(1));
        chunk.set_next(a, NodeId(999_999));
        chunk.top = Some(a);
        let mut analyzer = analyzer::SemanticAnalyzer::new(BitFlags::<CFlag>::empty());
        assert!(compile_chunk(&mut analyzer, &mut chunk).is_err());
    }

    #[test]
    fn compile_chunk_succeeds_on_a_well_formed_chunk() {
        let mut chunk = Chunk::new("ok");
        let lit = chunk.push(NodeKind::IntLit(1));
        chunk.top = Some(lit);
        let mut analyzer = analyzer::SemanticAnalyzer::new(BitFlags::<CFlag>::empty());
        assert!(compile_chunk(&mut analyzer, &mut chunk).is_ok());
    }
}
