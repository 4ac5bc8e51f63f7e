//! Native procedure registry.
//!
//! The root environment is populated from [`get_builtin_ops`] when an interpreter is
//! created. Each entry is a [`NativeOp`] pairing a name with its implementation and
//! arity:
//!
//! ```scheme
//! (cons 1 '(2 3))   ; => (1 2 3)
//! (+ 1 2 3)         ; => 6
//! (- 5)             ; => -5
//! (= 'cat 'cat)     ; => 1
//! (null? '())       ; => 1
//! (print '(a . b))  ; writes "(a . b)", returns its argument
//! ```
//!
//! ## Functions vs Special Forms
//!
//! - **Functions** receive their arguments already evaluated, left to right, and
//!   return one value. Arity is validated before the call.
//! - **Special forms** receive the unevaluated argument list, the caller's environment
//!   and the continuation, and must invoke the continuation (or hand off to the
//!   evaluator) exactly once. Hosts install these with
//!   [`Interpreter::register_native`].
//!
//! ## Error Handling
//!
//! - Operations reject values of the wrong variant with a type mismatch; nothing is
//!   coerced.
//! - Arithmetic is checked: overflow and division by zero are errors, never wrapped.
//! - Arity is checked for every call, including calls through variables.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::ast::{ContextRef, Item, Number};
use crate::evaluator::Interpreter;
use crate::evaluator::continuation::Cont;
use crate::{Error, EvalErrorKind};

/// Signature of a function builtin: evaluated arguments in, one value out.
pub type StrictFn = fn(&mut Interpreter, &[Item]) -> Result<Item, Error>;

/// Signature of a special-form native: unevaluated argument list, caller environment
/// and continuation.
pub type NativeFn = fn(&mut Interpreter, Item, ContextRef, Cont) -> Result<(), Error>;

/// Represents the implementation of a native procedure
#[derive(Clone, Copy)]
pub enum OpKind {
    Function(StrictFn),
    SpecialForm(NativeFn),
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::SpecialForm(_) => write!(f, "SpecialForm(<fn>)"),
        }
    }
}

/// Accepted argument counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive bounds
    Range(usize, usize),
    Any,
}

impl Arity {
    pub fn validate(self, got: usize) -> Result<(), Error> {
        match self {
            Arity::Exact(n) if got != n => Err(Error::bind_error(n, got, false)),
            Arity::AtLeast(n) if got < n => Err(Error::bind_error(n, got, true)),
            Arity::Range(min, _) if got < min => Err(Error::bind_error(min, got, true)),
            Arity::Range(_, max) if got > max => Err(Error::bind_error(max, got, false)),
            _ => Ok(()),
        }
    }
}

/// A named native procedure
#[derive(Debug, Clone)]
pub struct NativeOp {
    pub name: String,
    pub kind: OpKind,
    pub arity: Arity,
}

impl NativeOp {
    pub fn new(name: impl Into<String>, kind: OpKind, arity: Arity) -> Self {
        NativeOp {
            name: name.into(),
            kind,
            arity,
        }
    }

    pub fn is_special_form(&self) -> bool {
        matches!(self.kind, OpKind::SpecialForm(_))
    }
}

//
// Builtin Function Implementations
//

fn number_arg(m: &Interpreter, op: &str, item: &Item) -> Result<Number, Error> {
    item.as_number().ok_or_else(|| {
        Error::eval_with(
            EvalErrorKind::TypeMismatch,
            format!("{op} expects numbers, got {}", item.tag_name()),
            m.display(item).to_string(),
        )
    })
}

fn overflow(op: &str) -> Error {
    Error::eval(EvalErrorKind::Overflow, format!("integer overflow in {op}"))
}

fn builtin_cons(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let cell = m.alloc_cell(args[0].clone(), args[1].clone())?;
    Ok(Item::from(cell))
}

/// Mismatch errors from the heap know the variant but not how to print it
fn with_offending(m: &Interpreter, item: &Item, result: Result<Item, Error>) -> Result<Item, Error> {
    result.map_err(|err| match err {
        Error::EvalError(e) if e.kind == EvalErrorKind::TypeMismatch => {
            Error::EvalError(e.with_offending(m.display(item).to_string()))
        }
        other => other,
    })
}

fn builtin_car(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    with_offending(m, &args[0], m.heap().car(&args[0]))
}

fn builtin_cdr(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    with_offending(m, &args[0], m.heap().cdr(&args[0]))
}

fn builtin_add(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let mut sum: Number = 0;
    for arg in args {
        sum = sum
            .checked_add(number_arg(m, "+", arg)?)
            .ok_or_else(|| overflow("addition"))?;
    }
    Ok(Item::Number(sum))
}

fn builtin_sub(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let first = number_arg(m, "-", &args[0])?;
    if args.len() == 1 {
        return first
            .checked_neg()
            .map(Item::Number)
            .ok_or_else(|| overflow("negation"));
    }
    let mut result = first;
    for arg in &args[1..] {
        result = result
            .checked_sub(number_arg(m, "-", arg)?)
            .ok_or_else(|| overflow("subtraction"))?;
    }
    Ok(Item::Number(result))
}

fn builtin_mul(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let mut product: Number = 1;
    for arg in args {
        product = product
            .checked_mul(number_arg(m, "*", arg)?)
            .ok_or_else(|| overflow("multiplication"))?;
    }
    Ok(Item::Number(product))
}

fn builtin_div(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let (a, b) = (number_arg(m, "/", &args[0])?, number_arg(m, "/", &args[1])?);
    if b == 0 {
        return Err(Error::eval(EvalErrorKind::DivisionByZero, "division by zero"));
    }
    a.checked_div(b)
        .map(Item::Number)
        .ok_or_else(|| overflow("division"))
}

fn builtin_rem(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let (a, b) = (number_arg(m, "%", &args[0])?, number_arg(m, "%", &args[1])?);
    if b == 0 {
        return Err(Error::eval(EvalErrorKind::DivisionByZero, "remainder by zero"));
    }
    a.checked_rem(b)
        .map(Item::Number)
        .ok_or_else(|| overflow("remainder"))
}

fn builtin_eq(_m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    Ok(Item::from(args[0] == args[1]))
}

fn builtin_null(_m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    Ok(Item::from(args[0].is_nil()))
}

fn builtin_print(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    let text = m.display(&args[0]).to_string();
    writeln!(m.output(), "{text}").map_err(|e| Error::IoError(e.to_string()))?;
    Ok(args[0].clone())
}

fn builtin_list(m: &mut Interpreter, args: &[Item]) -> Result<Item, Error> {
    m.list_from(args)
}

/// Registry of every native installed in a fresh root environment.
static BUILTIN_OPS: LazyLock<Vec<NativeOp>> = LazyLock::new(|| {
    use Arity::*;
    use OpKind::Function;

    vec![
        // List operations
        NativeOp::new("cons", Function(builtin_cons), Exact(2)),
        NativeOp::new("car", Function(builtin_car), Exact(1)),
        NativeOp::new("cdr", Function(builtin_cdr), Exact(1)),
        NativeOp::new("list", Function(builtin_list), Any),
        NativeOp::new("null?", Function(builtin_null), Exact(1)),
        // Arithmetic operations
        NativeOp::new("+", Function(builtin_add), AtLeast(0)),
        NativeOp::new("-", Function(builtin_sub), AtLeast(1)),
        NativeOp::new("*", Function(builtin_mul), AtLeast(0)),
        NativeOp::new("/", Function(builtin_div), Exact(2)),
        NativeOp::new("%", Function(builtin_rem), Exact(2)),
        // Comparison
        NativeOp::new("=", Function(builtin_eq), Exact(2)),
        // Output
        NativeOp::new("print", Function(builtin_print), Exact(1)),
    ]
});

static BUILTIN_BY_NAME: LazyLock<HashMap<&'static str, &'static NativeOp>> =
    LazyLock::new(|| {
        let ops: &'static [NativeOp] = BUILTIN_OPS.as_slice();
        ops.iter().map(|op| (op.name.as_str(), op)).collect()
    });

/// Get all builtin operations
pub fn get_builtin_ops() -> &'static [NativeOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by name
pub fn find_builtin_op(name: &str) -> Option<&'static NativeOp> {
    BUILTIN_BY_NAME.get(name).copied()
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::Proc;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    /// Invoke a function builtin directly, bypassing the evaluator
    fn call_builtin(m: &mut Interpreter, name: &str, args: &[Item]) -> Result<Item, Error> {
        let op = find_builtin_op(name).unwrap();
        op.arity.validate(args.len())?;
        match op.kind {
            OpKind::Function(func) => func(m, args),
            OpKind::SpecialForm(_) => panic!("expected function builtin: {name}"),
        }
    }

    fn num(n: Number) -> Item {
        Item::Number(n)
    }

    #[test]
    fn test_registry() {
        let names: Vec<&str> = get_builtin_ops().iter().map(|op| op.name.as_str()).collect();
        for expected in [
            "cons", "car", "cdr", "+", "-", "*", "/", "%", "=", "null?", "print", "list",
        ] {
            assert!(names.contains(&expected), "missing builtin {expected}");
        }
        assert!(find_builtin_op("unknown").is_none());
        assert!(get_builtin_ops().iter().all(|op| !op.is_special_form()));
        assert_eq!(find_builtin_op("cons").unwrap().arity, Arity::Exact(2));
        assert_eq!(find_builtin_op("+").unwrap().arity, Arity::AtLeast(0));
    }

    #[test]
    fn test_builtins_are_bound_in_root() {
        let m = Interpreter::new();
        for op in get_builtin_ops() {
            let symbol = m.symbols().get(&op.name).unwrap();
            let value = m.heap().lookup(m.root(), symbol).unwrap();
            match value {
                Item::Proc(Proc::Native(bound)) => assert_eq!(bound.name, op.name),
                other => panic!("{} bound to {other:?}", op.name),
            }
        }
    }

    #[test]
    fn test_arithmetic() {
        let mut m = Interpreter::new();
        let ok_cases: Vec<(&str, Vec<Item>, Number)> = vec![
            ("+", vec![], 0),
            ("+", vec![num(10), num(1)], 11),
            ("+", vec![num(1), num(2), num(3)], 6),
            ("-", vec![num(5)], -5),
            ("-", vec![num(10), num(2)], 8),
            ("-", vec![num(10), num(2), num(3)], 5),
            ("*", vec![], 1),
            ("*", vec![num(10), num(10)], 100),
            ("/", vec![num(10), num(2)], 5),
            ("/", vec![num(-7), num(2)], -3),
            ("%", vec![num(3), num(2)], 1),
            ("%", vec![num(-7), num(2)], -1),
        ];
        for (name, args, expected) in ok_cases {
            assert_eq!(
                call_builtin(&mut m, name, &args).unwrap(),
                num(expected),
                "({name} {args:?})"
            );
        }

        let err_cases: Vec<(&str, Vec<Item>, EvalErrorKind)> = vec![
            ("+", vec![num(Number::MAX), num(1)], EvalErrorKind::Overflow),
            ("-", vec![num(Number::MIN)], EvalErrorKind::Overflow),
            ("*", vec![num(Number::MAX), num(2)], EvalErrorKind::Overflow),
            ("/", vec![num(1), num(0)], EvalErrorKind::DivisionByZero),
            ("%", vec![num(1), num(0)], EvalErrorKind::DivisionByZero),
            ("/", vec![num(Number::MIN), num(-1)], EvalErrorKind::Overflow),
            ("+", vec![num(1), Item::NIL], EvalErrorKind::TypeMismatch),
        ];
        for (name, args, expected) in err_cases {
            let err = call_builtin(&mut m, name, &args).unwrap_err();
            assert_eq!(err.eval_kind(), Some(expected), "({name} {args:?})");
        }
    }

    #[test]
    fn test_type_mismatch_reports_offending_value() {
        let mut m = Interpreter::new();
        let cat = Item::Symbol(m.intern("cat"));
        let test_cases = vec![
            ("*", vec![num(2), cat.clone()], "cat"),
            ("car", vec![num(5)], "5"),
            ("cdr", vec![cat], "cat"),
            ("car", vec![Item::NIL], "()"),
        ];
        for (name, args, expected) in test_cases {
            match call_builtin(&mut m, name, &args).unwrap_err() {
                Error::EvalError(e) => {
                    assert_eq!(e.kind, EvalErrorKind::TypeMismatch, "{name}");
                    assert_eq!(e.offending.as_deref(), Some(expected), "{name}");
                }
                other => panic!("{name}: expected EvalError, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_list_operations() {
        let mut m = Interpreter::new();
        let pair = call_builtin(&mut m, "cons", &[num(1), num(2)]).unwrap();
        assert_eq!(call_builtin(&mut m, "car", &[pair.clone()]).unwrap(), num(1));
        assert_eq!(call_builtin(&mut m, "cdr", &[pair.clone()]).unwrap(), num(2));

        let list = call_builtin(&mut m, "list", &[num(1), num(2), num(3)]).unwrap();
        assert_eq!(m.display(&list).to_string(), "(1 2 3)");
        assert_eq!(call_builtin(&mut m, "list", &[]).unwrap(), Item::NIL);

        assert_eq!(call_builtin(&mut m, "null?", &[Item::NIL]).unwrap(), num(1));
        assert_eq!(call_builtin(&mut m, "null?", &[pair.clone()]).unwrap(), num(0));
        assert_eq!(call_builtin(&mut m, "null?", &[num(0)]).unwrap(), num(0));

        for name in ["car", "cdr"] {
            let err = call_builtin(&mut m, name, &[Item::NIL]).unwrap_err();
            assert_eq!(err.eval_kind(), Some(EvalErrorKind::TypeMismatch));
        }
    }

    #[test]
    fn test_shallow_equality() {
        let mut m = Interpreter::new();
        let cat = Item::Symbol(m.intern("cat"));
        let dog = Item::Symbol(m.intern("dog"));
        let a = call_builtin(&mut m, "cons", &[num(1), Item::NIL]).unwrap();
        let b = call_builtin(&mut m, "cons", &[num(1), Item::NIL]).unwrap();

        let cases = vec![
            (num(3), num(3), 1),
            (num(3), num(4), 0),
            (cat.clone(), cat.clone(), 1),
            (cat, dog, 0),
            (a.clone(), a.clone(), 1),
            // Structurally equal but distinct cells
            (a, b, 0),
            (Item::NIL, Item::NIL, 1),
            (num(0), Item::NIL, 0),
        ];
        for (x, y, expected) in cases {
            assert_eq!(
                call_builtin(&mut m, "=", &[x.clone(), y.clone()]).unwrap(),
                num(expected),
                "(= {x:?} {y:?})"
            );
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_print_writes_and_returns_argument() {
        let buffer = SharedBuffer::default();
        let mut m = Interpreter::new().with_output(Box::new(buffer.clone()));
        let list = call_builtin(&mut m, "list", &[num(1), num(2)]).unwrap();

        assert_eq!(call_builtin(&mut m, "print", &[list.clone()]).unwrap(), list);
        assert_eq!(call_builtin(&mut m, "print", &[num(-4)]).unwrap(), num(-4));
        assert_eq!(
            String::from_utf8(buffer.0.borrow().clone()).unwrap(),
            "(1 2)\n-4\n"
        );
    }

    #[test]
    fn test_arity_validation() {
        use Arity::*;

        Exact(2).validate(2).unwrap();
        Exact(2).validate(1).unwrap_err();
        Exact(2).validate(3).unwrap_err();

        AtLeast(1).validate(1).unwrap();
        AtLeast(1).validate(5).unwrap();
        AtLeast(1).validate(0).unwrap_err();

        Range(1, 3).validate(1).unwrap();
        Range(1, 3).validate(3).unwrap();
        Range(1, 3).validate(0).unwrap_err();
        Range(1, 3).validate(4).unwrap_err();

        Any.validate(0).unwrap();
        Any.validate(100).unwrap();

        assert_eq!(
            Exact(2).validate(1).unwrap_err(),
            Error::BindError {
                expected: 2,
                got: 1,
                variadic: false
            }
        );
        assert_eq!(
            AtLeast(1).validate(0).unwrap_err(),
            Error::BindError {
                expected: 1,
                got: 0,
                variadic: true
            }
        );
    }
}
