use cellscheme::scheme::parse_next;
use cellscheme::{Error, Interpreter, Item, ParseErrorKind, Proc};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::panic;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = panic::catch_unwind(run_repl);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(fatal)) => {
            eprintln!("{fatal}");
            eprintln!("The interpreter's memory can no longer be trusted; exiting.");
            process::exit(1);
        }
        Err(panic_info) => {
            eprintln!("The REPL encountered an unexpected error and must exit.");

            if let Some(msg) = panic_info.downcast_ref::<&str>() {
                eprintln!("Error: {msg}");
            } else if let Some(msg) = panic_info.downcast_ref::<String>() {
                eprintln!("Error: {msg}");
            } else {
                eprintln!("Error: Unknown panic occurred");
            }

            process::exit(1);
        }
    }
}

/// Whether `source` still needs more lines before it forms complete expressions
fn is_incomplete(source: &str) -> bool {
    let mut rest = source;
    loop {
        match parse_next(rest) {
            Ok(Some((_, remaining))) => rest = remaining,
            Ok(None) => return false,
            Err(Error::ParseError(e)) => return e.kind == ParseErrorKind::Incomplete,
            Err(_) => return false,
        }
    }
}

fn run_repl() -> Result<(), Error> {
    println!("cellscheme: a small Scheme with tail calls and escape continuations");
    println!("Enter S-expressions like: (+ 1 2)");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => return Err(Error::IoError(err.to_string())),
    };
    let mut m = Interpreter::new();
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "scheme> " } else { "   ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(command);

                    match command {
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(&m)?;
                            continue;
                        }
                        ":gc" => {
                            let stats = m.gc(m.root());
                            println!(
                                "{stats}; {} cells and {} contexts live",
                                m.heap().live_cells(),
                                m.heap().live_contexts()
                            );
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                } else {
                    let _ = rl.add_history_entry(line.trim());
                }

                pending.push_str(&line);
                pending.push('\n');
                if is_incomplete(&pending) {
                    continue;
                }

                let source = std::mem::take(&mut pending);
                eval_source(&mut m, &source)?;
            }

            Err(ReadlineError::Interrupted) => {
                // Abandon a half-typed expression
                pending.clear();
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    Ok(())
}

/// Evaluate every form in `source`, printing each result. Only fatal errors escape.
fn eval_source(m: &mut Interpreter, source: &str) -> Result<(), Error> {
    let mut rest = source;
    loop {
        let form = match m.parse_form(rest) {
            Ok(Some((form, remaining))) => {
                rest = remaining;
                form
            }
            Ok(None) => break,
            Err(e) => {
                println!("Error: {e}");
                break;
            }
        };

        let root = m.root();
        match m.evaluate(form, root) {
            // Don't print Unspecified values (e.g., from define)
            Ok(Item::Unspecified) => {}
            Ok(value) => println!("{}", m.display(&value)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => println!("Error: {e}"),
        }
        m.gc(root);
    }
    Ok(())
}

fn print_help() {
    println!("cellscheme REPL commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show root environment bindings");
    println!("  :gc        - Run a collection and show arena usage");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Discard the expression being typed");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms:");
    println!("  quote define set! if lambda begin let let* callcc");
    println!();
    println!("Built-in procedures:");
    println!("  cons car cdr list null? + - * / % = print");
    println!();
    println!("Examples:");
    println!("  (define (fact n) (if (= n 0) 1 (* n (fact (- n 1)))))");
    println!("  (let* ((x 5) (y x)) (+ x y))");
    println!("  (define (f x) (callcc ret (if (= x 10) (ret x) (f (+ 1 x)))))");
    println!();
}

fn print_environment(m: &Interpreter) -> Result<(), Error> {
    let frame = m.heap().context(m.root())?;

    // Separate built-in procedures from user-defined values
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();
    for (symbol, value) in frame.bindings() {
        let name = m.symbols().resolve(symbol);
        match value {
            Item::Proc(Proc::Native(_)) => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }
    builtins.sort_unstable();
    user_defined.sort_unstable_by_key(|(name, _)| *name);

    println!("Built-in procedures ({}):", builtins.len());
    let mut col = 0;
    for name in builtins {
        print!("  {name:<15}");
        col += 1;
        if col % 4 == 0 {
            println!();
        }
    }
    if col % 4 != 0 {
        println!();
    }
    println!();

    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {}", m.display(value));
        }
    }
    Ok(())
}
