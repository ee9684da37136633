//! Per-function/lambda emission scopes. A [`Block`] is created once per function, lambda, or the
//! top level; [`SubBlock`]s nest inside it for every lexical scope (loop
//! body, if-branch, match-arm, try/catch).

use crate::interned_id;
use crate::intern::NameId;
use crate::types::TypeId;
use fxhash::FxHashMap;
use smallvec::SmallVec;

interned_id! {
    /// Identifies one [`LocalVar`] within its owning [`Block`].
    LocalId
}

interned_id! {
    /// Identifies one [`SubBlock`] within its owning [`Block`].
    SubBlockId
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Local,
    Param,
    /// Synthesized alias for a top-level (static) symbol referenced from
    /// inside a function body.
    StaticAlias,
    /// Synthesized alias for a local captured from the immediately
    /// enclosing block.
    ParentLocalAlias,
    /// Synthesized alias for a field read through an implicit `self`.
    ObjectMemberAlias,
    /// Synthesized alias for a field read through a captured `self` in an
    /// enclosing block.
    ParentObjectMemberAlias,
}

#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: NameId,
    pub kind: LocalKind,
    pub declared_type: TypeId,
    /// Narrows for `dynamic` vars across sub-blocks; static (typed) vars
    /// never mutate this field once declared.
    pub current_type: TypeId,
    pub is_boxed: bool,
    pub captured_idx: Option<u32>,
    /// Whether the currently-assigned value is an rc-candidate; tracked
    /// per-assignment so the emitter knows whether an overwrite needs a
    /// `release` of the old value.
    pub lifetime_rc_candidate: bool,
    pub register_slot: Option<u32>,
    pub dynamic: bool,
    /// for `LocalKind::StaticAlias`: the global symbol this alias reads
    /// through (a plain variable vs. a function value changes which op
    /// the emitter picks — `staticVar` vs `staticFunc`).
    pub static_sym: Option<crate::symtab::SymId>,
    /// set the first time this local is read as a value (not merely
    /// assigned to); drives the `WarnUnused` soft diagnostic.
    pub read: bool,
}

impl LocalVar {
    fn new(name: NameId, kind: LocalKind, declared_type: TypeId, dynamic: bool) -> Self {
        Self {
            name,
            kind,
            declared_type,
            current_type: declared_type,
            is_boxed: false,
            captured_idx: None,
            lifetime_rc_candidate: false,
            register_slot: None,
            dynamic,
            static_sym: None,
            read: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub name: NameId,
    /// the local in the *parent* block that this capture boxes.
    pub parent_local: LocalId,
    pub idx: u32,
}

/// A watermark snapshot taken when a sub-block is pushed, so popping it
/// can roll back exactly the declarations/shadows/assignments it
/// introduced without disturbing anything declared before it.
#[derive(Debug, Clone)]
pub struct SubBlock {
    pub id: SubBlockId,
    pub parent: Option<SubBlockId>,
    pub declared_watermark: usize,
    pub shadowed_watermark: usize,
    /// dynamic-var types saved and widened to `any` at loop entry, so that
    /// a second iteration sees the widened type; restored (if the widened
    /// type was never actually assigned) on exit.
    pub pre_loop_saved_types: Vec<(LocalId, TypeId)>,
}

#[derive(Debug)]
pub struct Block {
    name_table: FxHashMap<NameId, SmallVec<[LocalId; 2]>>,
    locals: Vec<LocalVar>,
    pub params: Vec<LocalId>,
    pub captures: Vec<Capture>,
    /// declaration order, used to compute shadow-watermarks.
    decl_order: Vec<LocalId>,
    sub_blocks: Vec<SubBlock>,
    cur_sub_block: Option<SubBlockId>,
    pub is_static_function: bool,
    pub is_method: bool,
    /// the receiver's object-type symbol, set for method blocks so
    /// `self` field lookups know which type's fields to search.
    pub self_object_sym: Option<crate::symtab::SymId>,
    /// high-water mark of locals reserved, bounding the frame's
    /// register window.
    pub max_locals: u32,
}

impl Block {
    pub fn new(is_static_function: bool, is_method: bool) -> Self {
        Self {
            name_table: FxHashMap::default(),
            locals: Vec::new(),
            params: Vec::new(),
            captures: Vec::new(),
            decl_order: Vec::new(),
            sub_blocks: Vec::new(),
            cur_sub_block: None,
            is_static_function,
            is_method,
            self_object_sym: None,
            max_locals: 0,
        }
    }

    pub fn local(&self, id: LocalId) -> &LocalVar {
        &self.locals[id.0 as usize]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut LocalVar {
        &mut self.locals[id.0 as usize]
    }

    fn push_local(&mut self, name: NameId, kind: LocalKind, typ: TypeId, dynamic: bool) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalVar::new(name, kind, typ, dynamic));
        self.name_table.entry(name).or_default().push(id);
        self.decl_order.push(id);
        id
    }

    pub fn declare_param(&mut self, name: NameId, typ: TypeId, dynamic: bool) -> LocalId {
        let id = self.push_local(name, LocalKind::Param, typ, dynamic);
        self.params.push(id);
        id
    }

    pub fn declare_local(&mut self, name: NameId, typ: TypeId, dynamic: bool) -> LocalId {
        self.push_local(name, LocalKind::Local, typ, dynamic)
    }

    pub fn declare_alias(&mut self, name: NameId, kind: LocalKind, typ: TypeId) -> LocalId {
        debug_assert!(matches!(
            kind,
            LocalKind::StaticAlias
                | LocalKind::ParentLocalAlias
                | LocalKind::ObjectMemberAlias
                | LocalKind::ParentObjectMemberAlias
        ));
        self.push_local(name, kind, typ, false)
    }

    /// Look up the *innermost* (most recently shadowing) local bound to
    /// `name`, as visible right now.
    pub fn lookup(&self, name: NameId) -> Option<LocalId> {
        self.name_table.get(&name).and_then(|v| v.last().copied())
    }

    pub fn add_capture(&mut self, name: NameId, parent_local: LocalId) -> u32 {
        let idx = self.captures.len() as u32;
        self.captures.push(Capture { name, parent_local, idx });
        idx
    }

    pub fn push_sub_block(&mut self) -> SubBlockId {
        let id = SubBlockId(self.sub_blocks.len() as u32);
        self.sub_blocks.push(SubBlock {
            id,
            parent: self.cur_sub_block,
            declared_watermark: self.decl_order.len(),
            shadowed_watermark: self.decl_order.len(),
            pre_loop_saved_types: Vec::new(),
        });
        self.cur_sub_block = Some(id);
        id
    }

    /// Entering a loop body: widen every currently-dynamic local's
    /// `current_type` to `any` so the second iteration doesn't see a
    /// stale narrowed type from the first, saving the prior type to
    /// restore on exit if it turns out never to have been reassigned.
    pub fn widen_dynamic_types_for_loop(&mut self, sb: SubBlockId) {
        let mut saved = Vec::new();
        for id in self.decl_order.clone() {
            let local = self.local_mut(id);
            if local.dynamic && local.current_type != TypeId::ANY {
                saved.push((id, local.current_type));
                local.current_type = TypeId::ANY;
            }
        }
        self.sub_blocks[sb.0 as usize].pre_loop_saved_types = saved;
    }

    /// Pop the current sub-block, rolling back shadowing introduced
    /// inside it and merging any narrowed dynamic-var types back to the
    /// parent scope — it merges the sub-block's current dynamic-var
    /// types back into the parent.
    pub fn pop_sub_block(&mut self) {
        let Some(cur) = self.cur_sub_block else { return };
        let sb = self.sub_blocks[cur.0 as usize].clone();
        // restore any loop-widened types that were never reassigned, i.e.
        // are still `any` (nothing narrowed them back down).
        for (id, saved_type) in &sb.pre_loop_saved_types {
            if self.local(*id).current_type == TypeId::ANY {
                self.local_mut(*id).current_type = *saved_type;
            }
        }
        // unshadow names declared inside this sub-block so lookups from
        // the parent scope see what they saw before it was pushed.
        for id in self.decl_order.split_off(sb.declared_watermark) {
            let name = self.local(id).name;
            if let Some(stack) = self.name_table.get_mut(&name) {
                stack.pop();
            }
        }
        self.cur_sub_block = sb.parent;
    }

    pub fn reserve_register(&mut self, id: LocalId, slot: u32) {
        self.local_mut(id).register_slot = Some(slot);
        self.max_locals = self.max_locals.max(slot + 1);
    }

    /// Assign dense, physical register slots to every local that needs
    /// frame storage, in the layout the emitter targets:
    /// `[header(4), captured boxes, params, named locals]`, with temps
    /// starting immediately above the returned watermark. Aliases that
    /// resolve through a symbol or field op (`StaticAlias`,
    /// `ObjectMemberAlias`, `ParentObjectMemberAlias`) never occupy a
    /// slot — only `Param`, `Local`, and the captured-box placeholder
    /// (`ParentLocalAlias`) do. Overwrites whatever slots analysis may
    /// have provisionally assigned to params, since final numbering can
    /// only be known once the whole block (and its capture list) is
    /// complete.
    pub fn assign_registers(&mut self, header: u32) -> u32 {
        let capture_base = header;
        let mut next = capture_base + self.captures.len() as u32;
        // `locals` is append-only (only `decl_order`/`name_table` are
        // truncated on sub-block pop, to implement shadowing), so walking
        // it by index is declaration order for every local the block
        // ever held, not just the ones visible at the end.
        for i in 0..self.locals.len() as u32 {
            let id = LocalId(i);
            match self.local(id).kind {
                LocalKind::ParentLocalAlias => {
                    if let Some(idx) = self.local(id).captured_idx {
                        self.local_mut(id).register_slot = Some(capture_base + idx);
                    }
                }
                LocalKind::Param | LocalKind::Local => {
                    self.local_mut(id).register_slot = Some(next);
                    next += 1;
                }
                LocalKind::StaticAlias
                | LocalKind::ObjectMemberAlias
                | LocalKind::ParentObjectMemberAlias => {}
            }
        }
        self.max_locals = next;
        next
    }

    /// Every `Local`/`Param` register slot currently assigned, for the
    /// block-end release sequence of rc-candidate locals. Callers filter
    /// by rc-candidacy themselves.
    pub fn physical_locals(&self) -> impl Iterator<Item = LocalId> + '_ {
        (0..self.locals.len() as u32).map(LocalId).filter(|id| {
            matches!(self.local(*id).kind, LocalKind::Local | LocalKind::Param)
        })
    }

    pub fn num_locals_declared(&self) -> usize {
        self.locals.len()
    }

    /// Named locals (`LocalKind::Local` only — params and aliases are
    /// exempt) declared in this block and never read, for the
    /// `WarnUnused` soft diagnostic.
    pub fn unread_locals(&self) -> impl Iterator<Item = LocalId> + '_ {
        (0..self.locals.len() as u32)
            .map(LocalId)
            .filter(|id| self.local(*id).kind == LocalKind::Local && !self.local(*id).read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_is_restored_on_sub_block_pop() {
        let mut b = Block::new(false, false);
        let n = NameId(1);
        let outer = b.declare_local(n, TypeId::INTEGER, false);
        b.push_sub_block();
        let inner = b.declare_local(n, TypeId::STRING, false);
        assert_eq!(b.lookup(n), Some(inner));
        b.pop_sub_block();
        assert_eq!(b.lookup(n), Some(outer));
    }

    #[test]
    fn loop_widen_restores_unreassigned_type_on_exit() {
        let mut b = Block::new(false, false);
        let n = NameId(1);
        let id = b.declare_local(n, TypeId::INTEGER, true);
        let sb = b.push_sub_block();
        b.widen_dynamic_types_for_loop(sb);
        assert_eq!(b.local(id).current_type, TypeId::ANY);
        b.pop_sub_block();
        assert_eq!(b.local(id).current_type, TypeId::INTEGER);
    }

    #[test]
    fn loop_widen_keeps_type_if_reassigned_to_any() {
        let mut b = Block::new(false, false);
        let n = NameId(1);
        let id = b.declare_local(n, TypeId::INTEGER, true);
        let sb = b.push_sub_block();
        b.widen_dynamic_types_for_loop(sb);
        b.local_mut(id).current_type = TypeId::STRING;
        b.pop_sub_block();
        // was reassigned away from ANY inside the loop, so the saved
        // restore does not clobber it.
        assert_eq!(b.local(id).current_type, TypeId::STRING);
    }

    #[test]
    fn register_reservation_tracks_max_locals() {
        let mut b = Block::new(false, false);
        let id = b.declare_local(NameId(1), TypeId::INTEGER, false);
        b.reserve_register(id, 5);
        assert_eq!(b.max_locals, 6);
    }
}
