//! Compile-time diagnostics. Every kind carries the
//! [`NodeId`] of the AST node it was raised against, so a host can map it
//! back to source without this crate knowing anything about source spans.

use crate::intern::NameId;
use crate::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileErrorKind {
    #[error("unknown symbol `{name}`")]
    UnknownSymbol { name: NameId },

    #[error("`{name}` is already declared in this scope")]
    DuplicateSymbol { name: NameId },

    #[error("call to `{name}` matches more than one overload")]
    AmbiguousOverload { name: NameId },

    #[error("no overload of `{name}` accepts these argument types")]
    IncompatibleSignature { name: NameId },

    #[error("left-hand side of assignment is not assignable")]
    InvalidAssignmentTarget,

    #[error("expected a value compatible with the declared type, found an incompatible one")]
    TypeMismatch,

    #[error("`{name}` is captured from an enclosing scope inside a static function")]
    CaptureInStaticFunc { name: NameId },

    #[error("`{name}` is a local variable referenced from a static initializer")]
    LocalReferencedFromStaticInit { name: NameId },

    #[error("this node kind is not supported here")]
    UnsupportedNode,
}

/// A diagnostic: a [`CompileErrorKind`] anchored to the node that caused
/// it. `Display`/`Error` come from the kind; the node id is carried
/// alongside for callers that need to locate it in the source.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct CompileError {
    pub node: NodeId,
    pub kind: CompileErrorKind,
}

impl CompileError {
    pub fn new(node: NodeId, kind: CompileErrorKind) -> Self {
        Self { node, kind }
    }
}

/// Diagnostics accumulated across one analysis pass. The analyzer keeps
/// walking after a recoverable error (so a single bad declaration doesn't
/// hide every other error in the chunk), pushing here rather than
/// aborting; `anyhow::Result` is reserved for truly unrecoverable host
/// failures (e.g. a malformed `Chunk`).
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<CompileError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: NodeId, kind: CompileErrorKind) {
        self.errors.push(CompileError::new(node, kind));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<CompileError> {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_accumulate_in_order() {
        let mut diags = Diagnostics::new();
        diags.push(NodeId(1), CompileErrorKind::UnknownSymbol { name: NameId(9) });
        diags.push(NodeId(2), CompileErrorKind::InvalidAssignmentTarget);
        assert_eq!(diags.len(), 2);
        let nodes: Vec<_> = diags.iter().map(|e| e.node).collect();
        assert_eq!(nodes, vec![NodeId(1), NodeId(2)]);
    }
}
