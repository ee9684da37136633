//! The AST shape the core reads. Lexing and parsing are explicitly out of
//! scope: nothing here builds a [`Chunk`] from source text.
//! Parsers — or tests — construct chunks directly by pushing [`Node`]s into
//! the arena and wiring them together with [`NodeId`]s and sibling `next`
//! links, exactly the interface [`crate::analyzer`] and [`crate::emit`]
//! consume.

use crate::intern::NameId;
use crate::{ChunkId, NodeId};
use anyhow::{bail, Result};

/// One node in a chunk's arena. `next` is the sibling link: sequences
/// (statement lists, call argument lists, struct field lists, match
/// arms, string-template parts) are formed by following
/// `next` starting from a "first child" id stored in the owning node's
/// `head`, not by a `Vec` on every list-shaped node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub head: NodeKind,
    pub next: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: NameId,
    pub declared_type: Option<NameId>,
    pub is_static: bool,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    IntLit(i64),
    FloatLit(u64), // bit pattern, so Node stays Eq-free but deterministic
    BoolLit(bool),
    StrLit(NameId),
    NoneLit,

    Ident(NameId),

    Unary { op: UnOp, expr: NodeId },
    Binary { op: BinOp, lhs: NodeId, rhs: NodeId },

    Assign { target: NodeId, value: NodeId },

    /// `var name[: type] [= init]`. Static (top-level) vars use the same
    /// node shape; `is_static` is set by the chunk builder based on depth,
    /// not stored redundantly here.
    VarDecl { name: NameId, declared_type: Option<NameId>, init: Option<NodeId> },

    FuncDecl {
        name: NameId,
        params: Vec<Param>,
        ret_type: Option<NameId>,
        body: NodeId,
        is_method: bool,
        owner_type: Option<NameId>,
    },

    ObjectDecl { name: NameId, fields: Vec<NameId>, methods: Vec<NodeId> },

    EnumDecl { name: NameId, members: Vec<NameId> },

    Call { callee: NodeId, first_arg: Option<NodeId> },
    MethodCall { recv: NodeId, name: NameId, first_arg: Option<NodeId> },
    Arg(NodeId),

    Field { recv: NodeId, name: NameId },
    Index { recv: NodeId, index: NodeId },

    ListLit { first_item: Option<NodeId> },
    Item(NodeId),

    MapLit { first_pair: Option<NodeId> },
    Pair { key: NodeId, value: NodeId },

    ObjectLit { type_name: NameId, first_field: Option<NodeId> },
    FieldInit { name: NameId, value: NodeId },

    StringTemplate { first_part: Option<NodeId> },
    TemplateLit(NameId),
    TemplateExpr(NodeId),

    If { cond: NodeId, then_branch: NodeId, else_branch: Option<NodeId> },
    WhileCond { cond: NodeId, body: NodeId },
    WhileInf { body: NodeId },
    ForRange { var: NameId, start: NodeId, end: NodeId, step: Option<NodeId>, body: NodeId },
    ForIter { var: NameId, pair_var: Option<NameId>, iterable: NodeId, body: NodeId },

    Match { expr: NodeId, first_arm: Option<NodeId> },
    MatchArm { cond: Option<NodeId>, body: NodeId },

    Try { body: NodeId, err_name: NameId, catch_body: NodeId },
    Throw(NodeId),

    Return(Option<NodeId>),
    Break,
    Continue,

    Lambda { params: Vec<Param>, body: NodeId },

    CoInit(NodeId),
    CoYield,
    CoResume(NodeId),

    Block { first_stmt: Option<NodeId> },
    Stmt(NodeId),
}

/// One compile unit: a flat arena of nodes plus its top-level statement
/// list head. Owns no parser state — it is purely data.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub name: compact_str::CompactString,
    arena: Vec<Node>,
    pub top: Option<NodeId>,
}

impl Chunk {
    pub fn new(name: impl Into<compact_str::CompactString>) -> Self {
        Self { id: ChunkId::fresh(), name: name.into(), arena: Vec::new(), top: None }
    }

    /// Push a node into the arena and return its id. Callers are
    /// responsible for wiring `next` and any head references to form
    /// sibling chains — the arena itself does not validate structure.
    pub fn push(&mut self, head: NodeKind) -> NodeId {
        let id = NodeId::fresh();
        self.arena.push(Node { id, head, next: None });
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        self.arena.iter().find(|n| n.id == id).expect("dangling NodeId")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena.iter_mut().find(|n| n.id == id).expect("dangling NodeId")
    }

    pub fn set_next(&mut self, id: NodeId, next: NodeId) {
        self.get_mut(id).next = Some(next);
    }

    /// Walk a sibling chain starting at `first`, yielding every node in
    /// order. Used for statement lists, argument lists, match arms, etc.
    pub fn chain(&self, first: Option<NodeId>) -> impl Iterator<Item = &Node> {
        let mut cur = first;
        std::iter::from_fn(move || {
            let id = cur?;
            let n = self.get(id);
            cur = n.next;
            Some(n)
        })
    }

    pub fn chain_ids(&self, first: Option<NodeId>) -> Vec<NodeId> {
        self.chain(first).map(|n| n.id).collect()
    }

    /// Structural sanity check for a chunk a host built by hand: every
    /// `next` sibling link and `top` must resolve inside this chunk's own
    /// arena. This is the one failure mode this crate treats as a genuine
    /// `anyhow` host error rather than a [`crate::error::CompileErrorKind`]
    /// diagnostic — a dangling link means the `Chunk` itself is malformed,
    /// not that the program it describes has a semantic error.
    pub fn validate(&self) -> Result<()> {
        let ids: fxhash::FxHashSet<NodeId> = self.arena.iter().map(|n| n.id).collect();
        if let Some(top) = self.top {
            if !ids.contains(&top) {
                bail!("chunk `{}`: top-level NodeId {top:?} is not in the arena", self.name);
            }
        }
        for node in &self.arena {
            if let Some(next) = node.next {
                if !ids.contains(&next) {
                    bail!(
                        "chunk `{}`: node {:?}'s `next` link {next:?} is not in the arena",
                        self.name,
                        node.id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Builds a sibling chain from a sequence of already-pushed node ids,
/// returning the chain's head (or `None` for an empty sequence). A small
/// helper for chunk/test construction, not used by the analyzer.
pub fn link_chain(chunk: &mut Chunk, ids: &[NodeId]) -> Option<NodeId> {
    for w in ids.windows(2) {
        chunk.set_next(w[0], w[1]);
    }
    ids.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_walks_in_order() {
        let mut c = Chunk::new("test");
        let a = c.push(NodeKind::IntLit(1));
        let b = c.push(NodeKind::IntLit(2));
        let d = c.push(NodeKind::IntLit(3));
        let head = link_chain(&mut c, &[a, b, d]);
        let ids = c.chain_ids(head);
        assert_eq!(ids, vec![a, b, d]);
    }
}
