//! S-expression reader.
//!
//! Text is parsed with nom into a [`Datum`] tree first, and only then materialized
//! into arena cells by [`Interpreter::read`] / [`Interpreter::parse_form`]. Keeping
//! the two steps apart means a syntax error never leaves half-built cells behind.
//!
//! Accepted syntax:
//!
//! ```scheme
//! 42 -7                  ; 32-bit integers
//! cat set! null? call/cc ; symbols
//! () (1 2 3) (1 2 . 3)   ; lists, including dotted tails
//! 'x                     ; (quote x)
//! ```

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, digit1, multispace1, not_line_ending, satisfy},
    combinator::{not, opt, peek, recognize, value},
    error::ErrorKind,
    multi::many0_count,
    sequence::pair,
};

use crate::ast::{Item, Number};
use crate::evaluator::{Interpreter, Pin};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Special characters allowed in symbols in addition to letters and digits
pub const SYMBOL_SPECIAL_CHARS: &str = "+-*/%<>=!?_$";

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)
}

/// Parsed but not yet allocated S-expression
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Number(Number),
    Symbol(String),
    /// Elements and an optional dotted tail
    List(Vec<Datum>, Option<Box<Datum>>),
}

impl Datum {
    fn quoted(datum: Datum) -> Datum {
        Datum::List(vec![Datum::Symbol("quote".into()), datum], None)
    }
}

fn failure(input: &str, kind: ErrorKind) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, kind))
}

/// Once inside a form there is nothing to backtrack to, so errors become failures
/// and keep pointing at the offending token.
fn committed<'a, T>(result: IResult<&'a str, T>) -> IResult<&'a str, T> {
    result.map_err(|e| match e {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    })
}

/// Whitespace and `;` comments
fn atmosphere(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0_count(alt((
            multispace1,
            recognize(pair(char(';'), not_line_ending)),
        ))),
    )
    .parse(input)
}

/// Parse an integer. A number running straight into symbol characters is rejected.
fn parse_number(input: &str) -> IResult<&str, Datum> {
    let (rest, digits) = recognize(pair(opt(char('-')), digit1)).parse(input)?;
    let (rest, _) = peek(not(satisfy(is_symbol_char))).parse(rest)?;

    match digits.parse::<Number>() {
        Ok(n) => Ok((rest, Datum::Number(n))),
        // Digits were validated above, so only overflow remains
        Err(_) => Err(failure(input, ErrorKind::Digit)),
    }
}

/// Parse a symbol (identifier). Anything that starts like a number, a digit or a
/// `-` followed by a digit, is not a symbol.
fn parse_symbol(input: &str) -> IResult<&str, Datum> {
    let (rest, candidate) = take_while1(is_symbol_char).parse(input)?;
    let unsigned = candidate.strip_prefix('-').unwrap_or(candidate);
    if unsigned.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::Alpha,
        )));
    }
    Ok((rest, Datum::Symbol(candidate.to_owned())))
}

/// Parse a list, with an optional dotted tail after at least one element
fn parse_list(input: &str, depth: usize) -> IResult<&str, Datum> {
    let (mut input, _) = char('(').parse(input)?;
    let mut elements = Vec::new();

    loop {
        let (rest, _) = atmosphere(input)?;
        input = rest;

        if input.is_empty() {
            return Err(failure(input, ErrorKind::Eof));
        }
        if let Ok((rest, _)) = char::<&str, nom::error::Error<&str>>(')').parse(input) {
            return Ok((rest, Datum::List(elements, None)));
        }

        let dot: IResult<&str, char> = char('.').parse(input);
        if let Ok((after_dot, _)) = dot {
            if elements.is_empty() {
                return Err(failure(input, ErrorKind::Char));
            }
            let (rest, tail) = committed(parse_datum(after_dot, depth + 1))?;
            let (rest, _) = atmosphere(rest)?;
            if rest.is_empty() {
                return Err(failure(rest, ErrorKind::Eof));
            }
            let (rest, _) = char(')')
                .parse(rest)
                .map_err(|_: nom::Err<nom::error::Error<&str>>| failure(rest, ErrorKind::Char))?;
            return Ok((rest, Datum::List(elements, Some(Box::new(tail)))));
        }

        let (rest, element) = committed(parse_datum(input, depth + 1))?;
        elements.push(element);
        input = rest;
    }
}

/// Parse quoted expression ('expr -> (quote expr))
fn parse_quote(input: &str, depth: usize) -> IResult<&str, Datum> {
    let (input, _) = char('\'').parse(input)?;
    let (input, datum) = committed(parse_datum(input, depth + 1))?;
    Ok((input, Datum::quoted(datum)))
}

/// Parse one datum, skipping leading whitespace and comments
fn parse_datum(input: &str, depth: usize) -> IResult<&str, Datum> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(failure(input, ErrorKind::TooLarge));
    }
    let (input, _) = atmosphere(input)?;
    if input.is_empty() {
        return Err(failure(input, ErrorKind::Eof));
    }
    alt((
        |input| parse_quote(input, depth),
        |input| parse_list(input, depth),
        parse_number,
        parse_symbol,
    ))
    .parse(input)
}

/// Convert nom parsing errors to structured parse errors
fn to_parse_error(input: &str, error: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let position = input.len().saturating_sub(e.input.len());
            let (kind, message) = match e.code {
                ErrorKind::Eof => (ParseErrorKind::Incomplete, "Unexpected end of input".into()),
                ErrorKind::TooLarge => (
                    ParseErrorKind::TooDeeplyNested,
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                ),
                ErrorKind::Digit => (
                    ParseErrorKind::ImplementationLimit,
                    "Integer literal does not fit in 32 bits".into(),
                ),
                _ => (
                    ParseErrorKind::InvalidSyntax,
                    format!("Invalid syntax at position {position}"),
                ),
            };
            ParseError::with_context(kind, message, input, position)
        }
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::Incomplete, "Incomplete input")
        }
    }
}

/// Parse the next datum from `input`. Returns `None` if only whitespace and comments
/// remain.
pub fn parse_next(input: &str) -> Result<Option<(Datum, &str)>, Error> {
    let (start, _) = atmosphere(input).map_err(|e| to_parse_error(input, e))?;
    if start.is_empty() {
        return Ok(None);
    }
    let (rest, datum) = parse_datum(start, 0).map_err(|e| to_parse_error(input, e))?;
    Ok(Some((datum, rest)))
}

/// Parse exactly one datum; anything but whitespace and comments after it is an error.
pub fn parse_scheme(input: &str) -> Result<Datum, Error> {
    let Some((datum, rest)) = parse_next(input)? else {
        return Err(ParseError::from_message(ParseErrorKind::Incomplete, "Empty input").into());
    };
    let (rest, _) = atmosphere(rest).map_err(|e| to_parse_error(input, e))?;
    if !rest.is_empty() {
        let offset = input.len() - rest.len();
        return Err(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("Unexpected remaining input: '{rest}'"),
            input,
            offset,
        )
        .into());
    }
    Ok(datum)
}

impl Interpreter {
    /// Allocate the cells for a parsed datum. Symbols are interned on the way.
    pub fn materialize(&mut self, datum: &Datum) -> Result<Item, Error> {
        match datum {
            Datum::Number(n) => Ok(Item::Number(*n)),
            Datum::Symbol(name) => Ok(Item::Symbol(self.intern(name))),
            Datum::List(elements, tail) => {
                let mut list = match tail {
                    Some(tail) => self.materialize(tail)?,
                    None => Item::NIL,
                };
                for element in elements.iter().rev() {
                    let head = self.pinned([Pin::Item(list.clone())], |m| m.materialize(element))?;
                    list = Item::from(self.alloc_cell(head, list)?);
                }
                Ok(list)
            }
        }
    }

    /// Read the next form from `input` into the arena, returning it with the
    /// unconsumed rest. `None` once only whitespace and comments remain.
    pub fn parse_form<'s>(&mut self, input: &'s str) -> Result<Option<(Item, &'s str)>, Error> {
        match parse_next(input)? {
            Some((datum, rest)) => Ok(Some((self.materialize(&datum)?, rest))),
            None => Ok(None),
        }
    }

    /// Read exactly one form into the arena
    pub fn read(&mut self, input: &str) -> Result<Item, Error> {
        let datum = parse_scheme(input)?;
        self.materialize(&datum)
    }
}
