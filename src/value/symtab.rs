//! The symbol table.
//!
//! Interns identifier text and assigns each distinct identifier a
//! monotonic [`IdentifierId`]. Repeated interning of the same text
//! returns the same id, and the id/length are reachable from the
//! interned handle through an owned struct rather than pointer
//! arithmetic into the string's storage.

use std::rc::Rc;

use crate::common::{IdentifierId, FIRST_USER_SYMBOL_ID};
use crate::value::dict::Dict;

/// A handle to an interned identifier. Cheap to copy (an `Rc` clone);
/// equality and hashing are by identity of the interned id.
#[derive(Clone)]
pub struct Symbol {
    inner: Rc<SymbolData>,
}

struct SymbolData {
    id: IdentifierId,
    text: Box<str>,
}

impl Symbol {
    pub fn id(&self) -> IdentifierId {
        self.inner.id
    }

    pub fn as_str(&self) -> &str {
        &self.inner.text
    }

    pub fn len(&self) -> usize {
        self.inner.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.text.is_empty()
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}
impl Eq for Symbol {}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state)
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.inner.id, self.inner.text)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.text)
    }
}

/// Interns identifier text and allocates monotonic identifier ids,
/// keyed by content equality of the text.
pub struct SymbolTable {
    by_text: Dict<Box<str>, Symbol>,
    next_id: IdentifierId,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            by_text: Dict::new(),
            next_id: FIRST_USER_SYMBOL_ID,
        }
    }

    /// Reserve an id below [`FIRST_USER_SYMBOL_ID`] for a built-in or
    /// keyword binding, interning its text with a caller-chosen id.
    pub fn intern_reserved(&mut self, text: &str, id: IdentifierId) -> Symbol {
        debug_assert!(id <= crate::common::MAX_RESERVED_IDENTIFIER_ID);
        if let Some(existing) = self.by_text.get(&Box::from(text)) {
            return existing.clone();
        }
        let symbol = Symbol {
            inner: Rc::new(SymbolData {
                id,
                text: Box::from(text),
            }),
        };
        self.by_text.set(Box::from(text), symbol.clone());
        symbol
    }

    /// Interns `text`, returning the existing symbol if already interned
    /// or allocating a fresh monotonic id otherwise.
    pub fn intern(&mut self, text: &str) -> Symbol {
        if let Some(existing) = self.by_text.get(&Box::from(text)) {
            return existing.clone();
        }
        let id = self.next_id;
        self.next_id += 1;
        let symbol = Symbol {
            inner: Rc::new(SymbolData {
                id,
                text: Box::from(text),
            }),
        };
        self.by_text.set(Box::from(text), symbol.clone());
        symbol
    }

    pub fn get(&self, text: &str) -> Option<Symbol> {
        self.by_text.get(&Box::from(text)).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_the_same_text_returns_the_same_id() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn distinct_text_gets_distinct_monotonic_ids() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("bar");
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn user_ids_start_after_the_reserved_range() {
        let mut table = SymbolTable::new();
        let a = table.intern("x");
        assert!(a.id() >= FIRST_USER_SYMBOL_ID);
    }
}
