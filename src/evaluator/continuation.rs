//! Continuation frames for the CPS evaluator.
//!
//! Every pending "rest of the computation" is a heap-allocated frame implementing
//! [`Continuation`]. A frame is resumed exactly once along any evaluation path with the
//! value of the sub-expression it was waiting on, and then either resumes its own
//! parent or hands control to the evaluator again.
//!
//! Frames hold arena handles, so each frame also knows how to [`trace`] itself for
//! the collector. This is what keeps environments alive that are reachable only from a
//! pending continuation (an escape procedure stored in a variable, an argument list
//! half way through evaluation, the frame a `let*` is filling in).
//!
//! [`trace`]: Continuation::trace

use std::cell::Cell;
use std::rc::Rc;

use crate::arena::Tracer;
use crate::ast::{ContextRef, Item, Proc, Symbol};
use crate::builtinops::OpKind;
use crate::evaluator::Interpreter;
use crate::{Error, EvalErrorKind};

/// A suspended computation waiting for one value.
pub trait Continuation {
    /// Continue the computation with `value`.
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error>;

    /// Push every arena reference and parent continuation held by this frame.
    fn trace(&self, tracer: &mut Tracer);
}

/// Shared handle to a continuation frame
pub type Cont = Rc<dyn Continuation>;

/// Bottom of a top-level evaluation: stores the final value.
pub(crate) struct Finish;

impl Continuation for Finish {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        m.result = Some(value);
        Ok(())
    }

    fn trace(&self, _tracer: &mut Tracer) {}
}

/// Remaining forms of a body, evaluated after the current one. The value of every
/// form but the last is discarded.
pub(crate) struct Sequence {
    pub rest: Item,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for Sequence {
    fn resume(self: Rc<Self>, m: &mut Interpreter, _value: Item) -> Result<(), Error> {
        m.eval_sequence(self.rest.clone(), self.env, self.k.clone())
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.rest);
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Waiting on an `if` condition
pub(crate) struct Branch {
    pub then_branch: Item,
    pub else_branch: Option<Item>,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for Branch {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        if m.truthy(&value)? {
            m.eval(self.then_branch.clone(), self.env, self.k.clone())
        } else if let Some(else_branch) = &self.else_branch {
            m.eval(else_branch.clone(), self.env, self.k.clone())
        } else {
            m.resume(self.k.clone(), Item::Unspecified)
        }
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.then_branch);
        if let Some(else_branch) = &self.else_branch {
            tracer.item(else_branch);
        }
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// `define` / `set!`: store the value in the frame, then pass it on.
pub(crate) struct Bind {
    pub name: Symbol,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for Bind {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        m.heap.set_local(self.env, self.name, value.clone())?;
        m.resume(self.k.clone(), value)
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Waiting on the operator of an application
pub(crate) struct Apply {
    pub args: Item,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for Apply {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        let Item::Proc(proc) = value else {
            let shown = m.display(&value).to_string();
            return Err(Error::eval_with(
                EvalErrorKind::NotAProcedure,
                format!("cannot apply {}", value.tag_name()),
                shown,
            ));
        };
        if let Proc::Native(op) = &proc
            && let OpKind::SpecialForm(native) = op.kind
        {
            op.arity.validate(m.heap.length(&self.args)?)?;
            return native(m, self.args.clone(), self.env, self.k.clone());
        }
        let call = Rc::new(Call {
            proc,
            env: self.env,
            k: self.k.clone(),
        });
        m.eval_list(self.args.clone(), self.env, Projection::Element, call)
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.args);
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Which part of each list element the list-mapping evaluator evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// The element itself (argument lists)
    Element,
    /// The second item of a `(name init)` pair (`let` bindings)
    BindingInit,
}

/// Waiting on the head of a list being evaluated element by element
pub(crate) struct MapHead {
    pub rest: Item,
    pub env: ContextRef,
    pub projection: Projection,
    pub k: Cont,
}

impl Continuation for MapHead {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        let tail = Rc::new(MapTail {
            head: value,
            k: self.k.clone(),
        });
        m.eval_list(self.rest.clone(), self.env, self.projection, tail)
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.rest);
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Holds an evaluated head until the rest of the list is done, then conses them
pub(crate) struct MapTail {
    pub head: Item,
    pub k: Cont,
}

impl Continuation for MapTail {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        let cell = m.alloc_cell(self.head.clone(), value)?;
        m.resume(self.k.clone(), Item::from(cell))
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.head);
        tracer.continuation(&self.k);
    }
}

/// Waiting on the evaluated argument list of a procedure call
pub(crate) struct Call {
    pub proc: Proc,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for Call {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        m.apply(&self.proc, value, self.env, self.k.clone())
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&Item::Proc(self.proc.clone()));
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Waiting on the evaluated inits of a `let`
pub(crate) struct LetBody {
    pub bindings: Item,
    pub body: Item,
    pub env: ContextRef,
    pub k: Cont,
}

impl Continuation for LetBody {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        let frame = m.alloc_context(Some(self.env))?;
        let mut bindings = self.bindings.clone();
        let mut values = value;
        while let Some((binding, rest)) = m.heap.uncons(&bindings)? {
            let name = m.binding_name(&binding)?;
            let (init, remaining) = m.heap.uncons(&values)?.unwrap_or((Item::Unspecified, Item::NIL));
            m.heap.set_local(frame, name, init)?;
            bindings = rest;
            values = remaining;
        }
        m.eval_sequence(self.body.clone(), frame, self.k.clone())
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.bindings);
        tracer.item(&self.body);
        tracer.context(self.env);
        tracer.continuation(&self.k);
    }
}

/// Waiting on one `let*` init. `frame` is the fresh frame the value goes into; the
/// remaining bindings are evaluated inside it.
pub(crate) struct LetStarBind {
    pub remaining: Item,
    pub name: Symbol,
    pub body: Item,
    pub frame: ContextRef,
    pub k: Cont,
}

impl Continuation for LetStarBind {
    fn resume(self: Rc<Self>, m: &mut Interpreter, value: Item) -> Result<(), Error> {
        m.heap.set_local(self.frame, self.name, value)?;
        m.eval_let_star(self.remaining.clone(), self.body.clone(), self.frame, self.k.clone())
    }

    fn trace(&self, tracer: &mut Tracer) {
        tracer.item(&self.remaining);
        tracer.item(&self.body);
        tracer.context(self.frame);
        tracer.continuation(&self.k);
    }
}

/// Escape procedure created by `callcc`.
///
/// Invoking it abandons the current continuation and resumes the one captured at
/// the `callcc` site. It can be used once; a second invocation is an error. Invoking
/// it after the `callcc` form has already returned is not supported.
pub struct Escape {
    spent: Cell<bool>,
    k: Cont,
}

impl Escape {
    pub(crate) fn new(k: Cont) -> Self {
        Escape {
            spent: Cell::new(false),
            k,
        }
    }

    pub fn continuation(&self) -> &Cont {
        &self.k
    }

    pub fn is_spent(&self) -> bool {
        self.spent.get()
    }

    pub(crate) fn invoke(&self, m: &mut Interpreter, args: &Item) -> Result<(), Error> {
        let Some((value, rest)) = m.heap.uncons(args)? else {
            return Err(Error::bind_error(1, 0, false));
        };
        if !rest.is_nil() {
            let got = 1 + m.heap.length(&rest)?;
            return Err(Error::bind_error(1, got, false));
        }
        if self.spent.replace(true) {
            return Err(Error::eval(
                EvalErrorKind::ContinuationSpent,
                "escape continuation invoked more than once",
            ));
        }
        m.resume(self.k.clone(), value)
    }
}
