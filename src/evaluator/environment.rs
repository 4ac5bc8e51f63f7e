//! Environment frames and parameter binding.
//!
//! A [`Context`] is one lexical frame: a table of local bindings plus an optional
//! link to the enclosing frame. Frames live in the arena and refer to each other
//! through [`ContextRef`] handles, so closures that capture their own defining frame
//! form ordinary (collectible) cycles.

use std::collections::HashMap;

use tracing::trace;

use crate::arena::Heap;
use crate::ast::{ContextRef, Item, Symbol};
use crate::{Error, EvalErrorKind};

/// Environment for variable bindings
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub(crate) bindings: HashMap<Symbol, Item>,
    pub(crate) outer: Option<ContextRef>,
}

impl Context {
    pub(crate) fn new(outer: Option<ContextRef>) -> Self {
        Context {
            bindings: HashMap::new(),
            outer,
        }
    }

    pub fn outer(&self) -> Option<ContextRef> {
        self.outer
    }

    /// Binding in this frame only
    pub fn get_local(&self, symbol: Symbol) -> Option<&Item> {
        self.bindings.get(&symbol)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Local bindings, in no particular order
    pub fn bindings(&self) -> impl Iterator<Item = (Symbol, &Item)> {
        self.bindings.iter().map(|(symbol, item)| (*symbol, item))
    }
}

impl Heap {
    /// Search the frame chain outward. Exhausting the chain is not an error: the
    /// result is `Unspecified`.
    pub fn lookup(&self, context: ContextRef, symbol: Symbol) -> Result<Item, Error> {
        let mut cursor = Some(context);
        while let Some(current) = cursor {
            let frame = self.context(current)?;
            if let Some(value) = frame.bindings.get(&symbol) {
                return Ok(value.clone());
            }
            cursor = frame.outer;
        }
        Ok(Item::Unspecified)
    }

    /// Write `symbol` into this frame's own table. Outer frames are never searched,
    /// so assigning a name bound further out shadows it instead of mutating it.
    pub fn set_local(&mut self, context: ContextRef, symbol: Symbol, value: Item) -> Result<(), Error> {
        self.context_mut(context)?.bindings.insert(symbol, value);
        Ok(())
    }

    /// Bind a parameter list against an evaluated argument list inside `context`.
    ///
    /// It is a proper list of symbols (positional, exact arity), a dotted list
    /// whose final symbol collects the remaining arguments, or a single symbol that
    /// collects every argument.
    pub fn bind_params(&mut self, context: ContextRef, params: &Item, args: &Item) -> Result<(), Error> {
        let mut cursor = params.clone();
        let mut rest = args.clone();
        let mut bound = 0;
        loop {
            match cursor {
                Item::Cell(None) => {
                    if rest.is_nil() {
                        return Ok(());
                    }
                    let got = bound + self.length(&rest)?;
                    return Err(Error::bind_error(bound, got, false));
                }
                Item::Symbol(collector) => {
                    trace!(param = collector.id(), "binding rest parameter");
                    return self.set_local(context, collector, rest);
                }
                Item::Cell(Some(cell)) => {
                    let node = self.cell(cell)?;
                    let (name, next) = (node.car.clone(), node.cdr.clone());
                    let Item::Symbol(name) = name else {
                        return Err(Error::eval(
                            EvalErrorKind::MalformedForm,
                            format!("parameter must be a symbol, got {}", name.tag_name()),
                        ));
                    };
                    let Some((value, remaining)) = self.uncons(&rest)? else {
                        let (expected, variadic) = self.arity_of(params)?;
                        return Err(Error::bind_error(expected, bound, variadic));
                    };
                    trace!(param = name.id(), "binding parameter");
                    self.set_local(context, name, value)?;
                    bound += 1;
                    cursor = next;
                    rest = remaining;
                }
                other => {
                    return Err(Error::eval(
                        EvalErrorKind::MalformedForm,
                        format!("malformed parameter list ending in {}", other.tag_name()),
                    ));
                }
            }
        }
    }

    /// Number of positional parameters, and whether a rest parameter follows them
    pub fn arity_of(&self, params: &Item) -> Result<(usize, bool), Error> {
        let mut count = 0;
        let mut cursor = params.clone();
        loop {
            match cursor {
                Item::Cell(Some(cell)) => {
                    count += 1;
                    cursor = self.cell(cell)?.cdr.clone();
                }
                Item::Symbol(_) => return Ok((count, true)),
                _ => return Ok((count, false)),
            }
        }
    }
}
