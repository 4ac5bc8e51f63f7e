//! Symbol interning.
//!
//! Symbols are interned once and compared by id afterwards. Ids are assigned
//! monotonically in interning order and are never reused.

use string_interner::{DefaultBackend, StringInterner};

use crate::ast::Symbol;

pub struct SymbolTable {
    interner: StringInterner<DefaultBackend>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            interner: StringInterner::new(),
        }
    }

    /// Return the symbol for `text`, interning it on first use
    pub fn intern(&mut self, text: &str) -> Symbol {
        Symbol(self.interner.get_or_intern(text))
    }

    /// Look up an already interned symbol without interning
    pub fn get(&self, text: &str) -> Option<Symbol> {
        self.interner.get(text).map(Symbol)
    }

    /// The text of a symbol. Symbols from another table resolve to `""`.
    pub fn resolve(&self, symbol: Symbol) -> &str {
        self.interner.resolve(symbol.0).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.interner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let mut symbols = SymbolTable::new();
        let cat = symbols.intern("cat");
        let again = symbols.intern("cat");
        let dog = symbols.intern("dog");

        assert_eq!(cat, again);
        assert_ne!(cat, dog);
        assert_eq!(symbols.resolve(cat), "cat");
        assert_eq!(symbols.resolve(dog), "dog");
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut symbols = SymbolTable::new();
        let ids: Vec<usize> = ["a", "b", "c", "a"]
            .iter()
            .map(|name| symbols.intern(name).id())
            .collect();
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
        assert_eq!(ids[0], ids[3]);
    }

    #[test]
    fn test_get_does_not_intern() {
        let mut symbols = SymbolTable::new();
        assert!(symbols.get("unicorn").is_none());
        assert!(symbols.is_empty());
        let unicorn = symbols.intern("unicorn");
        assert_eq!(symbols.get("unicorn"), Some(unicorn));
    }
}
