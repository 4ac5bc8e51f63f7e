//! Runtime value types.
//!
//! [`Item`] is the closed tagged value every part of the runtime passes around. It is
//! cheap to clone: numbers and symbols are inline, cons cells and environment frames
//! are referred to through generation-checked arena handles ([`CellRef`],
//! [`ContextRef`]), and procedures either hold handles or a reference-counted native
//! descriptor / escape continuation.
//!
//! Handles carry no ownership. Whether the node they point at stays alive is decided
//! only by reachability from the collector's roots (see [`crate::arena`]).

use std::fmt;
use std::rc::Rc;

use crate::arena::Handle;
use crate::builtinops::NativeOp;
use crate::evaluator::continuation::Escape;

/// Type alias for number values in interpreter
pub type Number = i32;

/// Interned symbol id. Two symbols are the same name iff their ids are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(pub(crate) string_interner::DefaultSymbol);

impl Symbol {
    /// The monotonically assigned numeric id of this symbol
    pub fn id(self) -> usize {
        use string_interner::Symbol as _;
        self.0.to_usize()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol#{}", self.id())
    }
}

/// Reference to a cons cell in the arena
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef(pub(crate) Handle);

/// Reference to an environment frame in the arena
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextRef(pub(crate) Handle);

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellRef({:?})", self.0)
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextRef({:?})", self.0)
    }
}

/// A cons node. Cells are never mutated after construction.
#[derive(Debug, Clone)]
pub struct Cell {
    pub car: Item,
    pub cdr: Item,
}

/// Callable values
#[derive(Clone)]
pub enum Proc {
    /// Interpreted closure. `code` is the cell `(params . body)`; `closure` is the
    /// environment the lambda was evaluated in.
    Closure { code: CellRef, closure: ContextRef },
    /// Native procedure from the registry
    Native(Rc<NativeOp>),
    /// Escape continuation captured by `callcc`
    Continuation(Rc<Escape>),
}

impl Proc {
    /// Identity comparison: closures by code cell and captured frame, natives and
    /// continuations by allocation.
    pub fn same(&self, other: &Proc) -> bool {
        match (self, other) {
            (
                Proc::Closure {
                    code: c1,
                    closure: e1,
                },
                Proc::Closure {
                    code: c2,
                    closure: e2,
                },
            ) => c1 == c2 && e1 == e2,
            (Proc::Native(a), Proc::Native(b)) => Rc::ptr_eq(a, b),
            (Proc::Continuation(a), Proc::Continuation(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proc::Closure { code, closure } => {
                write!(f, "Closure(code={code:?}, closure={closure:?})")
            }
            Proc::Native(op) => write!(f, "Native({})", op.name),
            Proc::Continuation(_) => write!(f, "Continuation"),
        }
    }
}

/// Core runtime value
#[derive(Clone)]
pub enum Item {
    /// Signed 32-bit integer
    Number(Number),
    /// Interned identifier
    Symbol(Symbol),
    /// Cons cell reference; `None` is the empty list
    Cell(Option<CellRef>),
    /// Callable value
    Proc(Proc),
    /// Result of forms with no meaningful value, and of unbound lookups.
    /// Unspecified never equals anything, including itself.
    Unspecified,
}

impl Item {
    /// The empty list
    pub const NIL: Item = Item::Cell(None);

    pub fn is_nil(&self) -> bool {
        matches!(self, Item::Cell(None))
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Item::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<Symbol> {
        match self {
            Item::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<CellRef> {
        match self {
            Item::Cell(cell) => *cell,
            _ => None,
        }
    }

    pub fn as_proc(&self) -> Option<&Proc> {
        match self {
            Item::Proc(p) => Some(p),
            _ => None,
        }
    }

    /// Name of the variant, used in error messages
    pub fn tag_name(&self) -> &'static str {
        match self {
            Item::Number(_) => "number",
            Item::Symbol(_) => "symbol",
            Item::Cell(None) => "empty list",
            Item::Cell(Some(_)) => "pair",
            Item::Proc(_) => "procedure",
            Item::Unspecified => "unspecified",
        }
    }
}

impl From<Number> for Item {
    fn from(n: Number) -> Self {
        Item::Number(n)
    }
}

impl From<Symbol> for Item {
    fn from(s: Symbol) -> Self {
        Item::Symbol(s)
    }
}

impl From<CellRef> for Item {
    fn from(cell: CellRef) -> Self {
        Item::Cell(Some(cell))
    }
}

impl From<bool> for Item {
    fn from(b: bool) -> Self {
        Item::Number(Number::from(b))
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Number(n) => write!(f, "Number({n})"),
            Item::Symbol(s) => write!(f, "{s:?}"),
            Item::Cell(None) => write!(f, "Nil"),
            Item::Cell(Some(cell)) => write!(f, "{cell:?}"),
            Item::Proc(p) => write!(f, "{p:?}"),
            Item::Unspecified => write!(f, "Unspecified"),
        }
    }
}

/// Shallow equality: numbers and symbols by value, cells by reference, procedures by
/// identity. This is exactly the semantics of the `=` native.
impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Item::Number(a), Item::Number(b)) => a == b,
            (Item::Symbol(a), Item::Symbol(b)) => a == b,
            (Item::Cell(a), Item::Cell(b)) => a == b,
            (Item::Proc(a), Item::Proc(b)) => a.same(b),
            (Item::Unspecified, _) | (_, Item::Unspecified) => false,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shallow_equality() {
        assert_eq!(Item::Number(3), Item::from(3));
        assert_ne!(Item::Number(3), Item::Number(4));
        assert_eq!(Item::NIL, Item::Cell(None));
        assert_eq!(Item::from(true), Item::Number(1));
        assert_eq!(Item::from(false), Item::Number(0));

        // Unspecified never equals anything, including itself
        assert_ne!(Item::Unspecified, Item::Unspecified);
        assert_ne!(Item::Unspecified, Item::NIL);
        assert_ne!(Item::Number(0), Item::NIL);
    }

    #[test]
    fn test_accessors_and_tags() {
        assert_eq!(Item::Number(7).as_number(), Some(7));
        assert_eq!(Item::NIL.as_number(), None);
        assert!(Item::NIL.is_nil());
        assert!(!Item::Number(0).is_nil());
        assert_eq!(Item::NIL.as_cell(), None);
        assert_eq!(Item::Number(1).tag_name(), "number");
        assert_eq!(Item::NIL.tag_name(), "empty list");
        assert_eq!(Item::Unspecified.tag_name(), "unspecified");
    }
}
