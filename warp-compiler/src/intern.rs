//! Name interning. Every identifier the analyzer touches — variable names,
//! field names, module path segments, type names — passes through here
//! first so that comparisons and hash-map keys throughout the symbol table
//! are a single `u32` compare rather than a string compare.

use crate::interned_id;
use arcstr::ArcStr;
use fxhash::FxHashMap;

interned_id! {
    /// An interned name. Stable for the lifetime of the [`Interner`] that
    /// produced it; two equal byte slices always intern to the same id.
    NameId
}

#[derive(Debug, Default)]
pub struct Interner {
    by_id: Vec<ArcStr>,
    by_bytes: FxHashMap<ArcStr, NameId>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> NameId {
        if let Some(id) = self.by_bytes.get(s) {
            return *id;
        }
        let id = NameId(self.by_id.len() as u32);
        let arc = ArcStr::from(s);
        self.by_id.push(arc.clone());
        self.by_bytes.insert(arc, id);
        id
    }

    pub fn resolve(&self, id: NameId) -> &str {
        &self.by_id[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut i = Interner::new();
        let a = i.intern("foo");
        let b = i.intern("foo");
        let c = i.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(i.resolve(a), "foo");
        assert_eq!(i.len(), 2);
    }
}
