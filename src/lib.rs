//! cellscheme - a small Scheme runtime with a continuation-passing evaluator
//!
//! This crate implements a dynamically-typed Lisp/Scheme dialect on top of three
//! pieces that are designed to work together:
//!
//! - a closed tagged value type ([`ast::Item`]) over numbers, symbols, cons cells,
//!   procedures and an unspecified value,
//! - a fixed-capacity arena of cons cells and environment frames with a synchronous
//!   mark-and-sweep collector ([`arena`]),
//! - a continuation-passing evaluator ([`evaluator`]) whose procedure bodies are run
//!   from a trampoline, so tail calls never grow the native stack.
//!
//! ```scheme
//! (define (count n) (if (= n 0) 'done (count (- n 1))))
//! (count 500000)                              ; => done, constant native stack
//! (define (f x) (callcc ret (if (= x 10) (ret x) (f (+ 1 x)))))
//! (f 0)                                       ; => 10, escape continuation
//! (let* ((x 5) (y x)) (+ x y))                ; => 10
//! ```
//!
//! ## Semantics worth knowing up front
//!
//! - Numbers are 32-bit signed integers; overflow is reported, never wrapped.
//! - `if` accepts only numbers as conditions: zero is false, anything else is true.
//!   Any other condition value is a type mismatch.
//! - Looking up an unbound symbol yields the unspecified value rather than an error.
//! - `set!` and `define` both write into the *current* frame; assigning a name that is
//!   not bound locally creates a new local binding.
//! - `callcc` continuations are escape-only and single-shot.
//!
//! ## Modules
//!
//! - `ast`: runtime values, cells and handles
//! - `symbols`: symbol interning
//! - `arena`: fixed-capacity pools and the garbage collector
//! - `evaluator`: the interpreter, CPS evaluator and trampoline
//! - `builtinops`: native procedures installed in the root environment
//! - `printer`: canonical text rendering of values
//! - `scheme`: S-expression parsing from text

use std::fmt;

/// Maximum parsing depth to prevent stack overflow on deeply nested input
pub const MAX_PARSE_DEPTH: usize = 512;

/// Default number of cons cells in the arena
pub const DEFAULT_CELL_CAPACITY: usize = 1_000_000;

/// Default number of environment frames in the arena
pub const DEFAULT_CONTEXT_CAPACITY: usize = 1_000;

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (EOF, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
    /// Implementation-imposed limit exceeded (integer overflow)
    ImplementationLimit,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    /// Create a ParseError with all fields
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }

        // Replace newlines with visible markers for better error display
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        let found = input
            .get(error_offset..)
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_owned);

        Self::new(kind, message, Some(display_context), found)
    }
}

/// Categorizes evaluation failures.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum EvalErrorKind {
    /// An operand had the wrong variant (e.g. `car` of a number, arithmetic on a symbol)
    TypeMismatch,
    /// The operator position of an application did not evaluate to a procedure
    NotAProcedure,
    /// A special form did not have the expected shape
    MalformedForm,
    /// Integer division or remainder by zero
    DivisionByZero,
    /// 32-bit integer overflow
    Overflow,
    /// An escape continuation was invoked a second time
    ContinuationSpent,
}

/// An evaluation failure together with the printed form of the offending value.
#[derive(Debug, PartialEq, Clone)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
    /// Printed offending value. Handles are not kept: the collector may reclaim them.
    pub offending: Option<String>,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        EvalError {
            kind,
            message: message.into(),
            offending: None,
        }
    }

    pub fn with_offending(mut self, offending: impl Into<String>) -> Self {
        self.offending = Some(offending.into());
        self
    }
}

/// Which arena pool an allocation or handle belongs to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PoolKind {
    Cells,
    Contexts,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PoolKind::Cells => write!(f, "cell"),
            PoolKind::Contexts => write!(f, "context"),
        }
    }
}

/// Error types for the interpreter
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    ParseError(ParseError),
    EvalError(EvalError),
    /// Argument count did not match a parameter list or a native's arity
    BindError {
        expected: usize,
        got: usize,
        /// True when `expected` is a minimum (rest parameter or variadic native)
        variadic: bool,
    },
    /// The arena pool stayed full after a collection. Not recoverable.
    ArenaExhausted { pool: PoolKind, capacity: usize },
    /// A handle referred to a slot that has been recycled. Not recoverable.
    StaleReference(PoolKind),
    IoError(String),
}

impl Error {
    pub(crate) fn eval(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Error::EvalError(EvalError::new(kind, message))
    }

    pub(crate) fn eval_with(
        kind: EvalErrorKind,
        message: impl Into<String>,
        offending: impl Into<String>,
    ) -> Self {
        Error::EvalError(EvalError::new(kind, message).with_offending(offending))
    }

    pub(crate) fn bind_error(expected: usize, got: usize, variadic: bool) -> Self {
        Error::BindError {
            expected,
            got,
            variadic,
        }
    }

    /// Returns the evaluation error kind, if this is an evaluation error
    pub fn eval_kind(&self) -> Option<EvalErrorKind> {
        match self {
            Error::EvalError(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Fatal errors mean the interpreter's memory invariants no longer hold; a host
    /// should stop using the interpreter instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ArenaExhausted { .. } | Error::StaleReference(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(e) => {
                write!(f, "ParseError: {}", e.message)?;
                if let Some(found) = &e.found {
                    write!(f, "\nFound: {found}")?;
                }
                if let Some(context) = &e.context {
                    write!(f, "\nContext: {context}")?;
                }
                Ok(())
            }
            Error::EvalError(e) => {
                let label = match e.kind {
                    EvalErrorKind::TypeMismatch => "Type mismatch",
                    EvalErrorKind::NotAProcedure => "Not a procedure",
                    EvalErrorKind::MalformedForm => "Malformed form",
                    EvalErrorKind::DivisionByZero => "Division by zero",
                    EvalErrorKind::Overflow => "Integer overflow",
                    EvalErrorKind::ContinuationSpent => "Continuation spent",
                };
                write!(f, "{label}: {}", e.message)?;
                if let Some(value) = &e.offending {
                    write!(f, "\n  Offending value: {value}")?;
                }
                Ok(())
            }
            Error::BindError {
                expected,
                got,
                variadic,
            } => {
                if *variadic {
                    write!(f, "BindError: expected at least {expected} arguments, got {got}")
                } else {
                    write!(f, "BindError: expected {expected} arguments, got {got}")
                }
            }
            Error::ArenaExhausted { pool, capacity } => write!(
                f,
                "Fatal: {pool} arena exhausted after collection (capacity {capacity})"
            ),
            Error::StaleReference(pool) => {
                write!(f, "Fatal: stale {pool} reference (slot was reclaimed)")
            }
            Error::IoError(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::ParseError(e)
    }
}

pub mod arena;
pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod printer;
pub mod symbols;

#[cfg(feature = "scheme")]
pub mod scheme;

pub use arena::{GcStats, Heap};
pub use ast::{CellRef, ContextRef, Item, Number, Proc, Symbol};
pub use evaluator::{Interpreter, InterpreterConfig};
