//! The interpreter: CPS evaluator, trampoline and allocation/GC entry points.
//!
//! [`Interpreter`] owns all runtime state: the arena ([`Heap`]), the symbol table, the
//! root environment, the pending trampoline step and the pin stack. There is no global
//! state; independent interpreters can coexist.
//!
//! ## Evaluation
//!
//! `eval(expr, env, k)` never returns a value. It arranges for the continuation `k`
//! to be resumed exactly once with the result. Special forms are recognised by their
//! leading keyword; everything else is an application whose operator and arguments
//! are evaluated left to right.
//!
//! Calling an interpreted procedure does not evaluate its body. The body is stored as
//! the single pending step and control returns to [`Interpreter::evaluate`], which
//! drains the pending slot in a loop. Tail calls therefore run in constant native
//! stack; non-tail nesting (arguments, `let` inits) still uses the native stack.
//!
//! ## Rooting
//!
//! A collection can only happen inside [`Interpreter::alloc_cell`] and
//! [`Interpreter::alloc_context`], or when a host calls [`Interpreter::gc`]. Its roots
//! are the root environment, the pending step, the last top-level result and every
//! entry on the pin stack. `eval` pins its expression, environment and continuation,
//! and `resume` pins the continuation and the value for as long as they run, so every
//! value a native frame is working on is reachable. Continuations trace the handles
//! they capture, which keeps environments alive that are only referenced from a
//! pending continuation or an escape procedure.

pub mod continuation;
pub mod environment;

use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::arena::{GcStats, Heap, Tracer};
use crate::ast::{CellRef, ContextRef, Item, Proc, Symbol};
use crate::builtinops::{Arity, NativeFn, NativeOp, OpKind, StrictFn, get_builtin_ops};
use crate::printer::Printed;
use crate::symbols::SymbolTable;
use crate::{DEFAULT_CELL_CAPACITY, DEFAULT_CONTEXT_CAPACITY, Error, EvalErrorKind, PoolKind};
use continuation::{
    Apply, Bind, Branch, Cont, Escape, Finish, LetBody, LetStarBind, MapHead, Projection,
    Sequence,
};

/// Arena sizes, fixed for the lifetime of an interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub cell_capacity: usize,
    pub context_capacity: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            cell_capacity: DEFAULT_CELL_CAPACITY,
            context_capacity: DEFAULT_CONTEXT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialForm {
    Quote,
    Define,
    Set,
    If,
    Lambda,
    Let,
    LetStar,
    Begin,
    CallCc,
}

const SPECIAL_FORMS: &[(&str, SpecialForm)] = &[
    ("quote", SpecialForm::Quote),
    ("define", SpecialForm::Define),
    ("set!", SpecialForm::Set),
    ("if", SpecialForm::If),
    ("lambda", SpecialForm::Lambda),
    ("let", SpecialForm::Let),
    ("let*", SpecialForm::LetStar),
    ("begin", SpecialForm::Begin),
    ("callcc", SpecialForm::CallCc),
    ("call/cc", SpecialForm::CallCc),
];

/// A procedure body waiting to be run by the trampoline
struct Step {
    body: Item,
    env: ContextRef,
    k: Cont,
}

/// A value native code is holding across a possible collection
pub(crate) enum Pin {
    Item(Item),
    Context(ContextRef),
    Cont(Cont),
}

type ArgVec = SmallVec<[Item; 4]>;

pub struct Interpreter {
    pub(crate) heap: Heap,
    symbols: SymbolTable,
    root: ContextRef,
    keywords: HashMap<Symbol, SpecialForm>,
    pending: Option<Step>,
    pins: Vec<Pin>,
    pub(crate) result: Option<Item>,
    output: Box<dyn Write>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Interpreter with the default arena sizes, printing to stdout
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
            .unwrap_or_else(|_| unreachable!("default context pool holds the root frame"))
    }

    /// Fails only when the context pool cannot hold the root frame.
    pub fn with_config(config: InterpreterConfig) -> Result<Self, Error> {
        let mut heap = Heap::new(config.cell_capacity, config.context_capacity);
        let root = heap.alloc_context(None).ok_or(Error::ArenaExhausted {
            pool: PoolKind::Contexts,
            capacity: config.context_capacity,
        })?;

        let mut symbols = SymbolTable::new();
        let keywords = SPECIAL_FORMS
            .iter()
            .map(|&(name, form)| (symbols.intern(name), form))
            .collect();

        let mut interpreter = Interpreter {
            heap,
            symbols,
            root,
            keywords,
            pending: None,
            pins: Vec::new(),
            result: None,
            output: Box::new(io::stdout()),
        };
        for op in get_builtin_ops() {
            interpreter.install(op.clone())?;
        }
        Ok(interpreter)
    }

    /// Redirect the output of `print`
    pub fn with_output(mut self, output: Box<dyn Write>) -> Self {
        self.output = output;
        self
    }

    pub fn root(&self) -> ContextRef {
        self.root
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn output(&mut self) -> &mut dyn Write {
        self.output.as_mut()
    }

    /// Render a value in its canonical text form
    pub fn display<'a>(&'a self, item: &'a Item) -> Printed<'a> {
        Printed::new(&self.heap, &self.symbols, item)
    }

    fn install(&mut self, op: NativeOp) -> Result<(), Error> {
        let name = self.symbols.intern(&op.name);
        self.heap
            .set_local(self.root, name, Item::Proc(Proc::Native(Rc::new(op))))
    }

    /// Bind a native that receives its argument list unevaluated, together with the
    /// caller's environment and continuation. It must resume the continuation (or
    /// call [`Interpreter::eval`] with it) exactly once.
    pub fn register_native(&mut self, name: &str, arity: Arity, native: NativeFn) -> Result<(), Error> {
        self.install(NativeOp::new(name, OpKind::SpecialForm(native), arity))
    }

    /// Bind a native that receives evaluated arguments and returns one value.
    pub fn register_function(&mut self, name: &str, arity: Arity, function: StrictFn) -> Result<(), Error> {
        self.install(NativeOp::new(name, OpKind::Function(function), arity))
    }

    //
    // Top level
    //

    /// Evaluate `expr` in `env` to completion, draining the trampoline.
    ///
    /// After an error the pending step and pin stack are discarded, so the interpreter
    /// can be used again unless the error [is fatal](Error::is_fatal).
    pub fn evaluate(&mut self, expr: Item, env: ContextRef) -> Result<Item, Error> {
        self.result = None;
        self.pending = None;
        let finish: Cont = Rc::new(Finish);
        let outcome = self.eval(expr, env, finish).and_then(|()| self.drain());
        match outcome {
            Ok(()) => Ok(self.result.take().unwrap_or(Item::Unspecified)),
            Err(err) => {
                self.pending = None;
                self.pins.clear();
                self.result = None;
                Err(err)
            }
        }
    }

    /// Parse and evaluate every form in `source` against the root environment, in
    /// order. Returns the value of the last form.
    #[cfg(feature = "scheme")]
    pub fn eval_str(&mut self, source: &str) -> Result<Item, Error> {
        let mut rest = source;
        let mut last = Item::Unspecified;
        while let Some((form, remaining)) = self.parse_form(rest)? {
            last = self.evaluate(form, self.root)?;
            rest = remaining;
        }
        Ok(last)
    }

    fn drain(&mut self) -> Result<(), Error> {
        while let Some(Step { body, env, k }) = self.pending.take() {
            self.eval_sequence(body, env, k)?;
        }
        Ok(())
    }

    fn schedule(&mut self, step: Step) {
        debug_assert!(self.pending.is_none(), "trampoline slot already occupied");
        self.pending = Some(step);
    }

    pub(crate) fn pinned<R>(&mut self, pins: impl IntoIterator<Item = Pin>, f: impl FnOnce(&mut Self) -> R) -> R {
        let mark = self.pins.len();
        self.pins.extend(pins);
        let result = f(self);
        self.pins.truncate(mark);
        result
    }

    //
    // CPS core
    //

    /// Evaluate `expr` in `env` and resume `k` with its value.
    pub fn eval(&mut self, expr: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        trace!(expr = %self.display(&expr), "eval");
        self.pinned(
            [Pin::Item(expr.clone()), Pin::Context(env), Pin::Cont(k.clone())],
            |m| m.eval_form(expr, env, k),
        )
    }

    /// Resume `k` with `value`.
    pub fn resume(&mut self, k: Cont, value: Item) -> Result<(), Error> {
        self.pinned([Pin::Cont(k.clone()), Pin::Item(value.clone())], |m| {
            k.resume(m, value)
        })
    }

    fn eval_form(&mut self, expr: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        match expr {
            Item::Number(_) | Item::Unspecified | Item::Proc(_) | Item::Cell(None) => {
                self.resume(k, expr)
            }
            Item::Symbol(symbol) => {
                let value = self.heap.lookup(env, symbol)?;
                self.resume(k, value)
            }
            Item::Cell(Some(cell)) => {
                let node = self.heap.cell(cell)?;
                let (head, args) = (node.car.clone(), node.cdr.clone());
                if let Item::Symbol(symbol) = head
                    && let Some(&form) = self.keywords.get(&symbol)
                {
                    return self.eval_special(form, &expr, args, env, k);
                }
                self.eval(head, env, Rc::new(Apply { args, env, k }))
            }
        }
    }

    fn eval_special(
        &mut self,
        form: SpecialForm,
        expr: &Item,
        args: Item,
        env: ContextRef,
        k: Cont,
    ) -> Result<(), Error> {
        match form {
            SpecialForm::Quote => {
                let parts = self.form_args(expr, &args, "quote", 1, 1)?;
                self.resume(k, parts[0].clone())
            }
            SpecialForm::Define => self.eval_define(expr, args, env, k),
            SpecialForm::Set => {
                let parts = self.form_args(expr, &args, "set!", 2, 2)?;
                let Item::Symbol(name) = parts[0] else {
                    return Err(self.malformed(expr, "set! expects a symbol"));
                };
                self.eval(parts[1].clone(), env, Rc::new(Bind { name, env, k }))
            }
            SpecialForm::If => {
                let parts = self.form_args(expr, &args, "if", 2, 3)?;
                let branch = Branch {
                    then_branch: parts[1].clone(),
                    else_branch: parts.get(2).cloned(),
                    env,
                    k,
                };
                self.eval(parts[0].clone(), env, Rc::new(branch))
            }
            SpecialForm::Lambda => {
                let Item::Cell(Some(code)) = args else {
                    return Err(self.malformed(expr, "lambda expects a parameter list"));
                };
                self.resume(k, Item::Proc(Proc::Closure { code, closure: env }))
            }
            SpecialForm::Begin => self.eval_sequence(args, env, k),
            SpecialForm::Let => {
                let Some((bindings, body)) = self.heap.uncons(&args)? else {
                    return Err(self.malformed(expr, "let expects a binding list"));
                };
                let frame = Rc::new(LetBody {
                    bindings: bindings.clone(),
                    body,
                    env,
                    k,
                });
                self.eval_list(bindings, env, Projection::BindingInit, frame)
            }
            SpecialForm::LetStar => {
                let Some((bindings, body)) = self.heap.uncons(&args)? else {
                    return Err(self.malformed(expr, "let* expects a binding list"));
                };
                self.eval_let_star(bindings, body, env, k)
            }
            SpecialForm::CallCc => {
                let Some((Item::Symbol(name), body)) = self.heap.uncons(&args)? else {
                    return Err(self.malformed(expr, "callcc expects a name"));
                };
                let frame = self.alloc_context(Some(env))?;
                let escape = Rc::new(Escape::new(k.clone()));
                self.heap
                    .set_local(frame, name, Item::Proc(Proc::Continuation(escape)))?;
                self.eval_sequence(body, frame, k)
            }
        }
    }

    /// `(define name)`, `(define name expr)` and `(define (name . params) body...)`
    fn eval_define(&mut self, expr: &Item, args: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        let Some((target, rest)) = self.heap.uncons(&args)? else {
            return Err(self.malformed(expr, "define expects a name"));
        };
        match target {
            Item::Symbol(name) => {
                let parts = self.form_args(expr, &rest, "define", 0, 1)?;
                match parts.first() {
                    Some(init) => self.eval(init.clone(), env, Rc::new(Bind { name, env, k })),
                    None => {
                        self.heap.set_local(env, name, Item::Unspecified)?;
                        self.resume(k, Item::Unspecified)
                    }
                }
            }
            Item::Cell(Some(signature)) => {
                let node = self.heap.cell(signature)?;
                let (name, params) = (node.car.clone(), node.cdr.clone());
                let Item::Symbol(name) = name else {
                    return Err(self.malformed(expr, "define expects a procedure name"));
                };
                let code = self.alloc_cell(params, rest)?;
                let closure = Item::Proc(Proc::Closure { code, closure: env });
                self.heap.set_local(env, name, closure.clone())?;
                self.resume(k, closure)
            }
            _ => Err(self.malformed(expr, "define expects a symbol or a signature")),
        }
    }

    /// Evaluate the forms of `body` in order, resuming `k` with the last value. An
    /// empty body yields `Unspecified`.
    pub(crate) fn eval_sequence(&mut self, body: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        match self.heap.uncons(&body)? {
            None if body.is_nil() => self.resume(k, Item::Unspecified),
            None => Err(self.malformed(&body, "improper body")),
            Some((first, rest)) if rest.is_nil() => self.eval(first, env, k),
            Some((first, rest)) => self.eval(first, env, Rc::new(Sequence { rest, env, k })),
        }
    }

    /// Evaluate every element of `list` left to right and resume `k` with a fresh
    /// list of the results.
    pub fn eval_list(
        &mut self,
        list: Item,
        env: ContextRef,
        projection: Projection,
        k: Cont,
    ) -> Result<(), Error> {
        match self.heap.uncons(&list)? {
            None if list.is_nil() => self.resume(k, Item::NIL),
            None => Err(self.malformed(&list, "improper argument list")),
            Some((head, rest)) => {
                let expr = match projection {
                    Projection::Element => head,
                    Projection::BindingInit => self.binding_init(&head)?,
                };
                let frame = Rc::new(MapHead {
                    rest,
                    env,
                    projection,
                    k,
                });
                self.eval(expr, env, frame)
            }
        }
    }

    /// One `let*` step: a fresh frame per binding, whose init is evaluated in the
    /// previous one.
    pub(crate) fn eval_let_star(
        &mut self,
        bindings: Item,
        body: Item,
        env: ContextRef,
        k: Cont,
    ) -> Result<(), Error> {
        let frame = self.alloc_context(Some(env))?;
        match self.heap.uncons(&bindings)? {
            None if bindings.is_nil() => self.eval_sequence(body, frame, k),
            None => Err(self.malformed(&bindings, "improper binding list")),
            Some((binding, remaining)) => {
                let name = self.binding_name(&binding)?;
                let init = self.binding_init(&binding)?;
                let step = Rc::new(LetStarBind {
                    remaining,
                    name,
                    body,
                    frame,
                    k,
                });
                self.eval(init, env, step)
            }
        }
    }

    /// Apply a procedure to an evaluated argument list.
    pub(crate) fn apply(&mut self, proc: &Proc, args: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        match proc {
            Proc::Closure { code, closure } => {
                let node = self.heap.cell(*code)?;
                let (params, body) = (node.car.clone(), node.cdr.clone());
                let frame = self.alloc_context(Some(*closure))?;
                self.heap.bind_params(frame, &params, &args)?;
                self.schedule(Step {
                    body,
                    env: frame,
                    k,
                });
                Ok(())
            }
            Proc::Native(op) => match op.kind {
                OpKind::Function(function) => {
                    let values = self.collect_args(&args)?;
                    op.arity.validate(values.len())?;
                    let value = function(self, &values)?;
                    self.resume(k, value)
                }
                OpKind::SpecialForm(native) => native(self, args, env, k),
            },
            Proc::Continuation(escape) => escape.invoke(self, &args),
        }
    }

    /// Only numbers are conditions: zero is false, anything else is true.
    pub(crate) fn truthy(&self, value: &Item) -> Result<bool, Error> {
        match value {
            Item::Number(n) => Ok(*n != 0),
            other => Err(Error::eval_with(
                EvalErrorKind::TypeMismatch,
                format!("if condition must be a number, got {}", other.tag_name()),
                self.display(other).to_string(),
            )),
        }
    }

    //
    // Form destructuring
    //

    fn malformed(&self, expr: &Item, message: &str) -> Error {
        Error::eval_with(
            EvalErrorKind::MalformedForm,
            message,
            self.display(expr).to_string(),
        )
    }

    /// Elements of a form's argument list, checking their count
    fn form_args(
        &self,
        expr: &Item,
        args: &Item,
        name: &str,
        min: usize,
        max: usize,
    ) -> Result<ArgVec, Error> {
        let parts = self
            .collect_args(args)
            .map_err(|_| self.malformed(expr, &format!("{name} form is an improper list")))?;
        if parts.len() < min || parts.len() > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(self.malformed(
                expr,
                &format!("{name} expects {expected} operands, got {}", parts.len()),
            ));
        }
        Ok(parts)
    }

    fn collect_args(&self, args: &Item) -> Result<ArgVec, Error> {
        let mut values = ArgVec::new();
        let mut cursor = args.clone();
        loop {
            match cursor {
                Item::Cell(None) => return Ok(values),
                Item::Cell(Some(cell)) => {
                    let node = self.heap.cell(cell)?;
                    values.push(node.car.clone());
                    cursor = node.cdr.clone();
                }
                _ => return Err(self.malformed(args, "improper argument list")),
            }
        }
    }

    pub(crate) fn binding_name(&self, binding: &Item) -> Result<Symbol, Error> {
        match self.heap.uncons(binding)? {
            Some((Item::Symbol(name), _)) => Ok(name),
            _ => Err(self.malformed(binding, "binding must start with a symbol")),
        }
    }

    fn binding_init(&self, binding: &Item) -> Result<Item, Error> {
        let parts = self.collect_args(binding)?;
        match parts.as_slice() {
            [Item::Symbol(_), init] => Ok(init.clone()),
            _ => Err(self.malformed(binding, "binding must be (name init)")),
        }
    }

    //
    // Allocation and collection
    //

    /// Allocate a cons cell, collecting once if the pool is full.
    pub fn alloc_cell(&mut self, car: Item, cdr: Item) -> Result<CellRef, Error> {
        if self.heap.cells.is_exhausted() {
            self.pinned([Pin::Item(car.clone()), Pin::Item(cdr.clone())], |m| {
                m.collect_garbage(None, "cell pool exhausted")
            });
        }
        self.heap
            .alloc_cell(car, cdr)
            .ok_or_else(|| self.exhausted(PoolKind::Cells))
    }

    /// Allocate an empty frame, collecting once if the pool is full.
    pub fn alloc_context(&mut self, outer: Option<ContextRef>) -> Result<ContextRef, Error> {
        if self.heap.contexts.is_exhausted() {
            self.collect_garbage(outer, "context pool exhausted");
        }
        self.heap
            .alloc_context(outer)
            .ok_or_else(|| self.exhausted(PoolKind::Contexts))
    }

    fn exhausted(&self, pool: PoolKind) -> Error {
        let capacity = match pool {
            PoolKind::Cells => self.heap.cells.capacity(),
            PoolKind::Contexts => self.heap.contexts.capacity(),
        };
        warn!(%pool, capacity, "allocation failed after collection");
        Error::ArenaExhausted { pool, capacity }
    }

    /// Build a proper list from `items`
    pub fn list_from(&mut self, items: &[Item]) -> Result<Item, Error> {
        self.pinned(items.iter().cloned().map(Pin::Item), |m| {
            let mut list = Item::NIL;
            for item in items.iter().rev() {
                list = Item::from(m.alloc_cell(item.clone(), list)?);
            }
            Ok(list)
        })
    }

    /// Run a full collection. `env` is kept alive in addition to the interpreter's
    /// own roots.
    pub fn gc(&mut self, env: ContextRef) -> GcStats {
        self.collect_garbage(Some(env), "requested")
    }

    fn collect_garbage(&mut self, extra: Option<ContextRef>, reason: &'static str) -> GcStats {
        debug!(reason, pins = self.pins.len(), "collecting");
        let mut tracer = Tracer::new();
        tracer.context(self.root);
        if let Some(env) = extra {
            tracer.context(env);
        }
        for pin in &self.pins {
            match pin {
                Pin::Item(item) => tracer.item(item),
                Pin::Context(context) => tracer.context(*context),
                Pin::Cont(k) => tracer.continuation(k),
            }
        }
        if let Some(step) = &self.pending {
            tracer.item(&step.body);
            tracer.context(step.env);
            tracer.continuation(&step.k);
        }
        if let Some(result) = &self.result {
            tracer.item(result);
        }
        self.heap.collect(tracer)
    }
}

#[cfg(all(test, feature = "scheme"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn small(cells: usize, contexts: usize) -> Interpreter {
        Interpreter::with_config(InterpreterConfig {
            cell_capacity: cells,
            context_capacity: contexts,
        })
        .unwrap()
    }

    fn eval_to_string(m: &mut Interpreter, source: &str) -> String {
        let value = m.eval_str(source).unwrap();
        m.display(&value).to_string()
    }

    #[test]
    fn test_evaluation_cases() {
        let cases = [
            ("10", "10"),
            ("(+ 10 1)", "11"),
            ("(* 10 10)", "100"),
            ("(/ 10 2)", "5"),
            ("(- 10 2)", "8"),
            ("(% 3 2)", "1"),
            ("()", "()"),
            ("(quote cat)", "cat"),
            ("'(1 2 . 3)", "(1 2 . 3)"),
            ("(if 1 'true 'false)", "true"),
            ("(if 0 'true 'false)", "false"),
            ("(if 0 'true)", "#<unspecified>"),
            ("((lambda (x) (if x 'true 'false)) 1)", "true"),
            ("((lambda (x) (if x 'true 'false)) 0)", "false"),
            ("(let ((x 3) (y 4)) (+ x y))", "7"),
            ("(let* ((x 5) (y x)) (+ x y))", "10"),
            ("(let* () 1)", "1"),
            ("(begin 1 2 3)", "3"),
            ("(begin)", "#<unspecified>"),
            ("((lambda args args) 1 2 3)", "(1 2 3)"),
            ("((lambda (a . rest) rest) 1 2 3)", "(2 3)"),
            ("((lambda (x) (define y 2) (+ x y)) 1)", "3"),
            ("(define x 'cat)", "cat"),
            ("(define x)", "#<unspecified>"),
            ("unbound-name", "#<unspecified>"),
            ("(+ 1 (callcc k (+ 10 (k 5))))", "6"),
            ("(call/cc k (k 1) 2)", "1"),
            ("(callcc k 42)", "42"),
        ];
        for (source, expected) in cases {
            let mut m = Interpreter::new();
            assert_eq!(eval_to_string(&mut m, source), expected, "{source}");
        }
    }

    #[test]
    fn test_program_cases() {
        let mut m = Interpreter::new();
        let steps = [
            ("(define (length xs) (if (null? xs) 0 (+ 1 (length (cdr xs)))))", "#<procedure>"),
            ("(length ())", "0"),
            ("(length '(cat 'dog))", "2"),
            ("(define make-plus (lambda (x) (lambda (y) (+ x y))))", "#<procedure>"),
            ("(define plus10 (make-plus 10))", "#<procedure>"),
            ("(define inc (make-plus 1))", "#<procedure>"),
            ("(plus10 1)", "11"),
            ("(inc 10)", "11"),
            (
                "(define (map p xs) (if (null? xs) () (cons (p (car xs)) (map p (cdr xs)))))",
                "#<procedure>",
            ),
            ("(map inc '(1 2 3))", "(2 3 4)"),
            ("(define (f x) (callcc ret (if (= x 10) (ret x) (f (+ 1 x)))))", "#<procedure>"),
            ("(f 0)", "10"),
        ];
        for (source, expected) in steps {
            assert_eq!(eval_to_string(&mut m, source), expected, "{source}");
        }
    }

    #[test]
    fn test_let_inits_see_outer_environment() {
        let mut m = Interpreter::new();
        assert_eq!(eval_to_string(&mut m, "(define x 1) (let ((x 2) (y x)) y)"), "1");
        assert_eq!(eval_to_string(&mut m, "(let* ((x 2) (y x)) y)"), "2");
        assert_eq!(eval_to_string(&mut m, "x"), "1");
    }

    #[test]
    fn test_set_creates_local_binding() {
        let mut m = Interpreter::new();
        assert_eq!(eval_to_string(&mut m, "(set! x 10)"), "10");
        assert_eq!(eval_to_string(&mut m, "x"), "10");

        // Assigning inside a procedure shadows the outer binding instead of mutating it
        let source = "(define y 1) (define (f) (set! y 2) y) (f)";
        assert_eq!(eval_to_string(&mut m, source), "2");
        assert_eq!(eval_to_string(&mut m, "y"), "1");
    }

    #[test]
    fn test_deep_tail_recursion_runs_in_constant_stack() {
        let mut m = small(10_000, 16);
        let source = "(define (count n) (if (= n 0) 'done (count (- n 1)))) (count 300000)";
        assert_eq!(eval_to_string(&mut m, source), "done");

        let source = "(define (loop n acc) (if (= n 0) acc (loop (- n 1) (+ acc 1)))) (loop 300000 0)";
        assert_eq!(eval_to_string(&mut m, source), "300000");
    }

    #[test]
    fn test_escape_continuation_is_single_shot() {
        let mut m = Interpreter::new();
        // The first pass escapes with (1 k); the second pass tries to reuse k
        let source = "(let ((r (callcc k (list k k)))) \
                        (if (= (car r) 1) \
                            ((car (cdr r)) 2) \
                            ((car r) (list 1 (car (cdr r))))))";
        let err = m.eval_str(source).unwrap_err();
        assert_eq!(err.eval_kind(), Some(EvalErrorKind::ContinuationSpent));
        assert!(!err.is_fatal());

        // Returned without being invoked, then returned through itself
        let cases = [("(callcc k k)", false), ("(callcc k (k k) 0)", true)];
        for (source, spent) in cases {
            match m.eval_str(source).unwrap() {
                Item::Proc(Proc::Continuation(escape)) => {
                    assert_eq!(escape.is_spent(), spent, "{source}");
                }
                other => panic!("{source}: expected continuation, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_escape_arity() {
        let mut m = Interpreter::new();
        let err = m.eval_str("(callcc k (k 1 2))").unwrap_err();
        assert_eq!(err, Error::bind_error(1, 2, false));
        let err = m.eval_str("(callcc k (k))").unwrap_err();
        assert_eq!(err, Error::bind_error(1, 0, false));
    }

    #[test]
    fn test_evaluation_errors() {
        let cases = [
            ("(if 'cat 1 2)", EvalErrorKind::TypeMismatch),
            ("(if '() 1 2)", EvalErrorKind::TypeMismatch),
            ("(1 2)", EvalErrorKind::NotAProcedure),
            ("(undefined-proc 2)", EvalErrorKind::NotAProcedure),
            ("(car 5)", EvalErrorKind::TypeMismatch),
            ("(+ 1 'a)", EvalErrorKind::TypeMismatch),
            ("(/ 1 0)", EvalErrorKind::DivisionByZero),
            ("(quote)", EvalErrorKind::MalformedForm),
            ("(if)", EvalErrorKind::MalformedForm),
            ("(set! 1 2)", EvalErrorKind::MalformedForm),
            ("(lambda)", EvalErrorKind::MalformedForm),
            ("(let ((1 2)) 3)", EvalErrorKind::MalformedForm),
            ("(let ((x)) x)", EvalErrorKind::MalformedForm),
            ("(callcc 5 1)", EvalErrorKind::MalformedForm),
            ("(+ 1 . 2)", EvalErrorKind::MalformedForm),
        ];
        for (source, expected) in cases {
            let mut m = Interpreter::new();
            let err = m.eval_str(source).unwrap_err();
            assert_eq!(err.eval_kind(), Some(expected), "{source}: {err}");
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_errors_report_offending_value() {
        let cases = [
            ("('(1 2) 3)", EvalErrorKind::NotAProcedure, "(1 2)"),
            ("(car 5)", EvalErrorKind::TypeMismatch, "5"),
            ("(cdr 'cat)", EvalErrorKind::TypeMismatch, "cat"),
            ("(+ 1 'a)", EvalErrorKind::TypeMismatch, "a"),
            ("(if '(x) 1 2)", EvalErrorKind::TypeMismatch, "(x)"),
        ];
        for (source, kind, offending) in cases {
            let mut m = Interpreter::new();
            match m.eval_str(source).unwrap_err() {
                Error::EvalError(e) => {
                    assert_eq!(e.kind, kind, "{source}");
                    assert_eq!(e.offending.as_deref(), Some(offending), "{source}");
                }
                other => panic!("{source}: expected EvalError, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_bind_errors() {
        let mut m = Interpreter::new();
        m.eval_str("(define (two a b) a) (define (some a . rest) a)").unwrap();
        assert_eq!(m.eval_str("(two 1)").unwrap_err(), Error::bind_error(2, 1, false));
        assert_eq!(m.eval_str("(two 1 2 3)").unwrap_err(), Error::bind_error(2, 3, false));
        assert_eq!(m.eval_str("(some)").unwrap_err(), Error::bind_error(1, 0, true));
        assert_eq!(m.eval_str("(cons 1)").unwrap_err(), Error::bind_error(2, 1, false));
    }

    #[test]
    fn test_interpreter_recovers_after_error() {
        let mut m = Interpreter::new();
        m.eval_str("(define (boom x) (car x))").unwrap();
        assert!(m.eval_str("(boom 1)").is_err());
        assert_eq!(eval_to_string(&mut m, "(boom '(7))"), "7");
    }

    fn native_first(m: &mut Interpreter, args: Item, _env: ContextRef, k: Cont) -> Result<(), Error> {
        let first = m.heap().car(&args)?;
        m.resume(k, first)
    }

    fn native_twice(m: &mut Interpreter, args: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        // Evaluates its single operand as a list of two copies
        let expr = m.heap().car(&args)?;
        let doubled = m.list_from(&[expr.clone(), expr])?;
        m.eval_list(doubled, env, Projection::Element, k)
    }

    fn native_collect(m: &mut Interpreter, _args: Item, env: ContextRef, k: Cont) -> Result<(), Error> {
        m.gc(env);
        m.resume(k, Item::NIL)
    }

    fn function_square(_m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
        let n = args[0].as_number().unwrap_or_default();
        Ok(Item::Number(n * n))
    }

    #[test]
    fn test_registered_natives() {
        let mut m = Interpreter::new();
        m.register_native("first-unevaluated", Arity::AtLeast(1), native_first)
            .unwrap();
        m.register_native("twice", Arity::Exact(1), native_twice).unwrap();
        m.register_function("square", Arity::Exact(1), function_square)
            .unwrap();

        assert_eq!(eval_to_string(&mut m, "(first-unevaluated (+ 1 2) 3)"), "(+ 1 2)");
        assert_eq!(eval_to_string(&mut m, "(twice (+ 1 2))"), "(3 3)");
        assert_eq!(eval_to_string(&mut m, "(square 7)"), "49");
        assert_eq!(eval_to_string(&mut m, "((lambda (f) (f 3)) square)"), "9");
        assert_eq!(
            m.eval_str("(twice 1 2)").unwrap_err(),
            Error::bind_error(1, 2, false)
        );
        assert_eq!(eval_to_string(&mut m, "square"), "#<native:square>");
    }

    #[test]
    fn test_values_held_by_pending_continuations_survive_collection() {
        let mut m = small(1_000, 16);
        m.register_native("collect!", Arity::Exact(0), native_collect)
            .unwrap();

        // (1 2 3) is only referenced by the argument evaluator while collect! runs
        assert_eq!(
            eval_to_string(&mut m, "(cons (list 1 2 3) (collect!))"),
            "((1 2 3))"
        );

        // The let frame being built and the escape procedure are only reachable
        // from continuations
        let source = "(callcc k (let* ((a (list 4 5)) (b (collect!)) (c (cons 6 a))) (k c)))";
        assert_eq!(eval_to_string(&mut m, source), "(6 4 5)");
    }

    #[test]
    fn test_collection_under_pressure() {
        let mut m = small(300, 8);
        m.eval_str("(define (build n acc) (if (= n 0) acc (build (- n 1) (cons n acc))))")
            .unwrap();
        for _ in 0..20 {
            assert_eq!(eval_to_string(&mut m, "(car (build 50 ()))"), "1");
        }
        m.eval_str("(define kept (build 40 ()))").unwrap();
        for _ in 0..20 {
            m.eval_str("(build 50 ())").unwrap();
        }
        let kept = m.eval_str("kept").unwrap();
        assert_eq!(m.heap().length(&kept).unwrap(), 40);
        assert!(m.heap().live_cells() <= 300);
    }

    #[test]
    fn test_arena_exhaustion_is_fatal() {
        let mut m = small(100, 8);
        m.eval_str("(define (build n acc) (if (= n 0) acc (build (- n 1) (cons n acc))))")
            .unwrap();
        let err = m.eval_str("(build 500 ())").unwrap_err();
        assert!(matches!(
            err,
            Error::ArenaExhausted {
                pool: PoolKind::Cells,
                capacity: 100
            }
        ));
        assert!(err.is_fatal());

        let err = Interpreter::with_config(InterpreterConfig {
            cell_capacity: 10,
            context_capacity: 0,
        })
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_gc_reclaims_unreachable_frames_and_cells() {
        let mut m = Interpreter::new();
        m.eval_str("(define (f x) (let ((y (list x x))) (car y)))").unwrap();
        let root = m.root();
        m.gc(root);
        assert_eq!(m.heap().live_contexts(), 1);
        for n in 0..10 {
            m.eval_str(&format!("(f {n})")).unwrap();
        }
        let stats = m.gc(root);
        assert_eq!(m.heap().live_contexts(), 1);
        assert!(stats.contexts_reclaimed >= 20);
        assert!(stats.cells_reclaimed >= 20);
    }
}
