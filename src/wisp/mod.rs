// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/mod.rs

// The interpreter's top level: status codes, value rendering, and
// the pipeline driver taking source text through tokens, annotation,
// the program flux and evaluation.

// <>

pub mod core;
pub use self::core::*;

pub mod annotate;
pub mod arena;
pub mod eval;
pub mod flux;
pub mod lexer;
pub mod memmgt;
pub mod stdenv;
pub mod symtab;
pub mod vec;

use self::annotate::AnnotateError;
use self::arena::Arena;
use self::flux::{FluxError, TopForm};
use self::memmgt::{Gc, GcConfig};
use self::symtab::SymTab;
use self::vec::DenseVec;

use std::ptr;

/// Status codes shared by every layer of the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrCode {
    #[error("invalid argument")]
    Arg,
    #[error("operand type mismatch")]
    Type,
    #[error("unbound symbol")]
    Unbound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("evaluation failure")]
    Eval,
    #[error("syntax error")]
    Syntax,
    #[error("constant binding violated")]
    ConstViolation,
    #[error("name not found")]
    NotFound,
}

impl ErrCode {
    /// The numeric status as surfaced on the command line
    pub fn status(&self) -> i32 {
        match self {
            ErrCode::Arg => -1,
            ErrCode::Type => -2,
            ErrCode::Unbound => -3,
            ErrCode::OutOfMemory => -4,
            ErrCode::Eval => -5,
            ErrCode::Syntax => -6,
            ErrCode::ConstViolation => -7,
            ErrCode::NotFound => -8,
        }
    }
}

impl From<AnnotateError> for ErrCode {
    fn from(e: AnnotateError) -> Self {
        match e {
            AnnotateError::ScratchAlloc => ErrCode::OutOfMemory,
            _ => ErrCode::Syntax,
        }
    }
}

impl From<FluxError> for ErrCode {
    fn from(e: FluxError) -> Self {
        match e {
            FluxError::Alloc => ErrCode::OutOfMemory,
            FluxError::InconsistentIds => ErrCode::Syntax,
        }
    }
}

// --------------------------- rendering ----------------------------

/// Renders a value as text; `readable` quotes strings, the display
/// mode prints their raw contents
pub fn render_value(v: &Value, readable: bool) -> String {
    let mut out = String::new();
    let mut seen: DenseVec<*mut u8> = DenseVec::new(8);
    fmt_value(&mut out, v, readable, &mut seen);
    out
}

fn fmt_value(out: &mut String, v: &Value, readable: bool, seen: &mut DenseVec<*mut u8>) {
    use std::fmt::Write;

    match v.kind {
        ValueKind::Undefined => out.push_str("#<undefined>"),
        ValueKind::Integer => {
            let _ = write!(out, "{}", unsafe { v.data.int_ });
        }
        ValueKind::Float => {
            let f = unsafe { v.data.float_ };
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                let _ = write!(out, "{:.1}", f);
            } else {
                let _ = write!(out, "{}", f);
            }
        }
        ValueKind::Bool => {
            out.push_str(if unsafe { v.data.bool_ } { "#t" } else { "#f" });
        }
        ValueKind::String => {
            let text = String::from_utf8_lossy(str_bytes(unsafe { v.data.obj }));
            if readable {
                let _ = write!(out, "\"{}\"", text);
            } else {
                out.push_str(&text);
            }
        }
        ValueKind::Symbol => {
            out.push_str(&String::from_utf8_lossy(sym_bytes(unsafe { v.data.obj })));
        }
        ValueKind::List => {
            if v.is_nil() {
                out.push_str("()");
                return;
            }
            out.push('(');
            let mut cur = *v;
            loop {
                let cell = unsafe { cur.data.obj };
                if seen.find(&cell).is_some() {
                    out.push_str("...");
                    break;
                }
                seen.push(cell);

                fmt_value(out, &cons_car(cell), readable, seen);

                let next = cons_cdr(cell);
                if next.is_nil() {
                    break;
                }
                if next.is_pair() {
                    out.push(' ');
                    cur = next;
                    continue;
                }
                out.push_str(" . ");
                fmt_value(out, &next, readable, seen);
                break;
            }
            out.push(')');
        }
        ValueKind::Function => out.push_str("#<lambda>"),
        ValueKind::Builtin => {
            let name = unsafe { (*v.data.bltn).name };
            let _ = write!(out, "#<builtin {}>", name);
        }
        ValueKind::Promise => out.push_str("#<promise>"),
    }
}

// ---------------------------- driving -----------------------------

/// Interprets source text, returning the rendering of the last
/// top-level value; an empty program yields an empty string
pub fn interpret(code: &str) -> Result<String, ErrCode> {
    interpret_with(code, GcConfig::default())
}

/// As `interpret`, with explicit heap geometry
pub fn interpret_with(code: &str, cfg: GcConfig) -> Result<String, ErrCode> {
    let mut tokens = lexer::lex_tokens(code.as_bytes());
    if tokens.is_empty() {
        return Ok(String::new());
    }

    annotate::annotate(&mut tokens)?;
    let flux = flux::build(&tokens)?;

    log::debug!(
        "program: {} tokens, {} spans",
        tokens.len(),
        flux.sexprs.len()
    );

    let mut global_arena = Arena::new(8192);
    let mut gc = Box::new(Gc::new(cfg).ok_or(ErrCode::OutOfMemory)?);
    let gp: *mut Gc = &mut *gc;

    let genv = SymTab::new(32, ptr::null_mut(), &mut global_arena, gp);
    if genv.is_null() {
        return Err(ErrCode::OutOfMemory);
    }
    stdenv::environment_setup(genv)?;

    let mut vm = eval::Vm::new(&flux, gp)?;

    let mut rendered = String::new();
    for form in flux.top_forms().as_slice() {
        let result = match form {
            TopForm::Span(id) => {
                let span = *flux.span(*id).unwrap();
                let mut v = Value::undefined();
                vm.eval_expr(genv, &span, &mut v).map(|_| v)
            }
            TopForm::Atom(idx) => {
                let tok = span_token(&tokens, *idx);
                vm.eval_atom(genv, &tok)
            }
        };

        match result {
            Ok(v) => rendered = render_value(&v, true),
            Err(e) => {
                eprintln!("Error: evaluation failed with code {}", e.status());
                return Err(e);
            }
        }
    }

    Ok(rendered)
}

fn span_token(tokens: &DenseVec<lexer::Token>, idx: usize) -> lexer::Token {
    let mut out = lexer::Token {
        kind: lexer::TokenKind::Error,
        value: ptr::null(),
        len: 0,
        sexpr_id: 0,
    };
    assert!(tokens.get(idx, &mut out));
    out
}

/// Reads and interprets a source file
pub fn run_file(path: &std::path::Path) -> Result<(), ErrCode> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: cannot read {}: {}", path.display(), e);
        ErrCode::Arg
    })?;
    interpret(&data).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_forms() {
        assert_eq!(interpret("(+ 1 2 3)").unwrap(), "6");
        assert_eq!(interpret("(* 2 (+ 3 4))").unwrap(), "14");
        assert_eq!(interpret("(/ 10 4)").unwrap(), "2.5");
        assert_eq!(interpret("(- 5)").unwrap(), "-5");
        assert_eq!(interpret("(mod 7 3)").unwrap(), "1");
    }

    #[test]
    fn lambda_application() {
        assert_eq!(interpret("((lambda (x y) (+ x (* y y))) 3 4)").unwrap(), "19");
        assert_eq!(interpret("((lambda () 1 2 3))").unwrap(), "3");
        assert_eq!(interpret("((lambda ()))").unwrap(), "()");
    }

    #[test]
    fn division_by_zero_is_eval_error() {
        assert_eq!(interpret("(/ 1 0)").unwrap_err(), ErrCode::Eval);
    }

    #[test]
    fn unbound_symbol_errors() {
        assert_eq!(interpret("(foo)").unwrap_err(), ErrCode::Unbound);
        assert_eq!(interpret("nope").unwrap_err(), ErrCode::Unbound);
    }

    #[test]
    fn mixed_operand_type_error() {
        assert_eq!(interpret("(+ 1 \"x\")").unwrap_err(), ErrCode::Type);
    }

    #[test]
    fn deep_nesting_does_not_recurse() {
        let depth = 999;
        let mut src = String::new();
        for _ in 0..depth {
            src.push_str("(+ 1 ");
        }
        src.push('1');
        for _ in 0..depth {
            src.push(')');
        }
        assert_eq!(interpret(&src).unwrap(), "1000");
    }

    #[test]
    fn define_is_const() {
        assert_eq!(interpret("(define x 2) (+ x 3)").unwrap(), "5");
        assert_eq!(
            interpret("(define pi 3.14) (define pi 2.71)").unwrap_err(),
            ErrCode::ConstViolation
        );
        // the first binding survives the failed redefinition
        assert_eq!(interpret("(define pi 3.14) pi").unwrap(), "3.14");
    }

    #[test]
    fn closures_capture_definition_scope() {
        let src = "(define make-adder (lambda (n) (lambda (x) (+ x n)))) \
                   ((make-adder 2) 3)";
        assert_eq!(interpret(src).unwrap(), "5");
    }

    #[test]
    fn repeated_application_recomputes_bodies() {
        let src = "(define sq (lambda (x) (* x x))) (+ (sq 3) (sq 4))";
        assert_eq!(interpret(src).unwrap(), "25");
    }

    #[test]
    fn quote_returns_structure_unevaluated() {
        assert_eq!(interpret("(quote (1 2 3))").unwrap(), "(1 2 3)");
        assert_eq!(interpret("(quote abc)").unwrap(), "abc");
        assert_eq!(interpret("(quote ())").unwrap(), "()");
        assert_eq!(interpret("(quote (foo (bar) 2.5))").unwrap(), "(foo (bar) 2.5)");
    }

    #[test]
    fn cons_car_cdr_laws() {
        assert_eq!(interpret("(car (cons 1 2))").unwrap(), "1");
        assert_eq!(interpret("(cdr (cons 1 2))").unwrap(), "2");
        assert_eq!(interpret("(cons 1 2)").unwrap(), "(1 . 2)");
        assert_eq!(
            interpret("(equal? (list 1 2 3) (cons 1 (cons 2 (cons 3 (quote ())))))").unwrap(),
            "#t"
        );
    }

    #[test]
    fn render_reparse_round_trip() {
        let first = interpret("(quote (1 (2 3) \"s\" sym))").unwrap();
        let second = interpret(&format!("(quote {})", first)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn predicates() {
        assert_eq!(interpret("(null? (quote ()))").unwrap(), "#t");
        assert_eq!(interpret("(null? (quote (1)))").unwrap(), "#f");
        assert_eq!(interpret("(pair? (quote (1)))").unwrap(), "#t");
        assert_eq!(interpret("(atom? 5)").unwrap(), "#t");
        assert_eq!(interpret("(atom? (quote (1)))").unwrap(), "#f");
        assert_eq!(interpret("(list? (quote (1 2)))").unwrap(), "#t");
        assert_eq!(interpret("(list? (cons 1 2))").unwrap(), "#f");
        assert_eq!(interpret("(number? 1.5)").unwrap(), "#t");
        assert_eq!(interpret("(string? \"s\")").unwrap(), "#t");
        assert_eq!(interpret("(symbol? (quote abc))").unwrap(), "#t");
        assert_eq!(interpret("(procedure? +)").unwrap(), "#t");
        assert_eq!(interpret("(procedure? (lambda (x) x))").unwrap(), "#t");
    }

    #[test]
    fn equality() {
        assert_eq!(interpret("(eq? (quote a) (quote a))").unwrap(), "#t");
        assert_eq!(interpret("(eq? 1 1)").unwrap(), "#t");
        assert_eq!(interpret("(eq? 1 1.0)").unwrap(), "#f");
        assert_eq!(
            interpret("(equal? (quote (1 (2) 3)) (quote (1 (2) 3)))").unwrap(),
            "#t"
        );
        assert_eq!(
            interpret("(eq? (quote (1 2)) (quote (1 2)))").unwrap(),
            "#f"
        );
    }

    #[test]
    fn comparisons() {
        assert_eq!(interpret("(< 1 2 3)").unwrap(), "#t");
        assert_eq!(interpret("(< 1 3 2)").unwrap(), "#f");
        assert_eq!(interpret("(= 2 2.0)").unwrap(), "#t");
        assert_eq!(interpret("(>= 3 3 2)").unwrap(), "#t");
        assert_eq!(interpret("(<= 1 1 0)").unwrap(), "#f");
    }

    #[test]
    fn apply_and_eval() {
        assert_eq!(interpret("(apply + (list 1 2 3))").unwrap(), "6");
        assert_eq!(interpret("(eval (quote (+ 1 2)))").unwrap(), "3");
        assert_eq!(interpret("(eval 5)").unwrap(), "5");
        assert_eq!(
            interpret("(define twice (lambda (x) (* 2 x))) (apply twice (list 21))").unwrap(),
            "42"
        );
    }

    #[test]
    fn boundary_programs() {
        assert_eq!(interpret("").unwrap(), "");
        assert_eq!(interpret("   ; just a comment\n").unwrap(), "");
        assert_eq!(interpret("42").unwrap(), "42");
        assert_eq!(interpret("\"hey\"").unwrap(), "\"hey\"");
        assert_eq!(interpret("()").unwrap(), "()");
        assert_eq!(interpret("#:gen1").unwrap(), "#:gen1");
    }

    #[test]
    fn unbalanced_programs_are_syntax_errors() {
        assert_eq!(interpret("(+ 1 2").unwrap_err(), ErrCode::Syntax);
        assert_eq!(interpret("(+ 1 2))").unwrap_err(), ErrCode::Syntax);
    }

    #[test]
    fn display_and_newline() {
        // program output goes to stdout; the forms themselves yield
        // the empty list
        assert_eq!(interpret("(display \"out\") (newline)").unwrap(), "()");
    }

    #[test]
    fn quote_mark_is_not_sugar() {
        // the lexer recognizes the mark, but the evaluator only
        // accepts the parenthesized form
        assert_eq!(interpret("'x").unwrap_err(), ErrCode::Eval);
    }

    #[test]
    fn computed_heads() {
        assert_eq!(interpret("((car (list + -)) 7 5)").unwrap(), "12");
    }

    #[test]
    fn last_value_wins() {
        assert_eq!(interpret("1 2 3").unwrap(), "3");
        assert_eq!(interpret("(+ 1 1) (+ 2 2)").unwrap(), "4");
    }

    #[test]
    fn float_rendering() {
        assert_eq!(interpret("3.0").unwrap(), "3.0");
        assert_eq!(interpret("2.5").unwrap(), "2.5");
        assert_eq!(interpret("(- 2.5)").unwrap(), "-2.5");
    }

    #[test]
    fn functions_build_lists() {
        let src = "(define build (lambda (a b c d) (list a b c d)))\
                   (equal? (build 1 2 3 4) (quote (1 2 3 4)))";
        assert_eq!(interpret(src).unwrap(), "#t");
    }

    fn cramped() -> GcConfig {
        GcConfig {
            eden_size: 2048,
            survivor_size: 2048,
            old_size: 64 * 1024,
            align: 16,
        }
    }

    #[test]
    fn collections_run_during_evaluation() {
        // a 200-cell quoted list overflows a 2 KiB Eden many times
        // over; the chain under construction must ride out every
        // collection, including overflow promotion into old space
        let mut src = String::from("(define xs (quote (");
        for i in 0..200 {
            src.push_str(&format!("{} ", i));
        }
        src.push_str("))) (apply + xs)");

        assert_eq!(interpret_with(&src, cramped()).unwrap(), "19900");
    }

    #[test]
    fn bindings_survive_collection_churn() {
        // the binding for xs is a collector root; the garbage lists
        // between definition and use force evacuations and promotion
        let mut src = String::from("(define xs (quote (1 2 3))) ");
        for _ in 0..50 {
            src.push_str("(list 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15 16 17 18 19 20) ");
        }
        src.push_str("(equal? xs (quote (1 2 3)))");

        assert_eq!(interpret_with(&src, cramped()).unwrap(), "#t");
    }

    #[test]
    fn strings_and_symbols_move_intact() {
        let src = "(define greeting \"hello there\") \
                   (define tag (quote marker)) \
                   (list 1 2 3 4 5 6 7 8 9 10) \
                   (list 1 2 3 4 5 6 7 8 9 10) \
                   (list greeting (eq? tag (quote marker)))";
        assert_eq!(
            interpret_with(src, cramped()).unwrap(),
            "(\"hello there\" #t)"
        );
    }
}
