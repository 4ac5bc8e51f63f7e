//! Canonical text form of runtime values.
//!
//! Literal data (numbers, symbols, proper and dotted lists) prints in a form the
//! parser reads back as a structurally equal value. Procedures and the unspecified
//! value print as unreadable `#<...>` markers.

use std::fmt;

use crate::arena::Heap;
use crate::ast::{Item, Proc};
use crate::symbols::SymbolTable;

/// A value paired with the tables needed to render it. Implements [`fmt::Display`].
pub struct Printed<'a> {
    heap: &'a Heap,
    symbols: &'a SymbolTable,
    item: &'a Item,
}

impl<'a> Printed<'a> {
    pub fn new(heap: &'a Heap, symbols: &'a SymbolTable, item: &'a Item) -> Self {
        Printed {
            heap,
            symbols,
            item,
        }
    }

    fn write_item(&self, f: &mut fmt::Formatter<'_>, item: &Item) -> fmt::Result {
        match item {
            Item::Number(n) => write!(f, "{n}"),
            Item::Symbol(s) => write!(f, "{}", self.symbols.resolve(*s)),
            Item::Cell(None) => write!(f, "()"),
            Item::Cell(Some(_)) => self.write_list(f, item),
            Item::Proc(Proc::Closure { .. }) => write!(f, "#<procedure>"),
            Item::Proc(Proc::Native(op)) => write!(f, "#<native:{}>", op.name),
            Item::Proc(Proc::Continuation(_)) => write!(f, "#<continuation>"),
            Item::Unspecified => write!(f, "#<unspecified>"),
        }
    }

    fn write_list(&self, f: &mut fmt::Formatter<'_>, list: &Item) -> fmt::Result {
        write!(f, "(")?;
        let mut current = list.clone();
        let mut first = true;
        loop {
            match current {
                Item::Cell(None) => break,
                Item::Cell(Some(cell)) => {
                    if !first {
                        write!(f, " ")?;
                    }
                    let Ok(node) = self.heap.cell(cell) else {
                        write!(f, "#<stale>")?;
                        break;
                    };
                    self.write_item(f, &node.car)?;
                    current = node.cdr.clone();
                    first = false;
                }
                tail => {
                    write!(f, " . ")?;
                    self.write_item(f, &tail)?;
                    break;
                }
            }
        }
        write!(f, ")")
    }
}

impl fmt::Display for Printed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_item(f, self.item)
    }
}
