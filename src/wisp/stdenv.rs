// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/stdenv.rs

// Native procedures that make up the standard environment, loaded
// into the global scope at startup. Every primitive has a span-level
// entry point that gathers its own arguments from the call site, and
// a value-level core shared with `apply` and `eval`.

// <>

use super::core::*;
use super::eval::Vm;
use super::flux::SExpr;
use super::symtab::{SymTab, FLAG_CONST};
use super::vec::ArenaVec;
use super::ErrCode;

use std::ptr;

/// Value-level core of a primitive
pub type CoreFn = fn(&mut Vm, *mut SymTab, &[Value], &mut Value) -> Result<(), ErrCode>;

/// Span-level primitive contract: gather arguments by walking the
/// call span, produce one output value or a status
pub type PrimitiveFn = fn(&mut Vm, *mut SymTab, &SExpr, &mut Value) -> Result<(), ErrCode>;

/// One registry row; bound into the global scope as a const builtin
pub struct BuiltinEntry {
    pub name: &'static str,
    pub invoke: PrimitiveFn,
    pub apply: CoreFn,
}

fn invoke_with_args(
    vm: &mut Vm,
    env: *mut SymTab,
    call: &SExpr,
    out: &mut Value,
    core: CoreFn,
) -> Result<(), ErrCode> {
    let mut args = vm.collect_args(env, call)?;
    let r = core(vm, env, args.as_slice(), out);
    vm.release_args(&mut args);
    r
}

/// Generates the value-level cores along with the registry table
///
/// The syntax is close to that of regular functions but fixes the
/// argument idents, easing access in the bodies. Each row also gets
/// a span-level wrapper satisfying the primitive contract.
macro_rules! native_fns {
    ( const $table:ident; $vm:ident $env:ident $args:ident $out:ident;
      $( $name:literal $fname:ident $body:block )+ ) => {
        $(
            fn $fname(
                $vm: &mut Vm,
                $env: *mut SymTab,
                $args: &[Value],
                $out: &mut Value,
            ) -> Result<(), ErrCode> {
                $body
            }
        )+

        pub const $table: &[BuiltinEntry] = &[
            $( BuiltinEntry {
                name: $name,
                invoke: |vm, env, call, out| invoke_with_args(vm, env, call, out, $fname),
                apply: $fname,
            } ),+
        ];
    };
}

// ------------------------- numeric helpers -------------------------

fn check_numeric(args: &[Value]) -> Result<bool, ErrCode> {
    let mut all_int = true;
    for a in args {
        match a.kind {
            ValueKind::Integer => {}
            ValueKind::Float => all_int = false,
            _ => {
                eprintln!("Error: operand is not a number");
                return Err(ErrCode::Type);
            }
        }
    }
    Ok(all_int)
}

fn numeric_chain(
    args: &[Value],
    out: &mut Value,
    cmp: fn(f64, f64) -> bool,
) -> Result<(), ErrCode> {
    if args.is_empty() {
        return Err(ErrCode::Arg);
    }
    check_numeric(args)?;

    let mut ok = true;
    for w in args.windows(2) {
        if !cmp(w[0].as_f64(), w[1].as_f64()) {
            ok = false;
            break;
        }
    }
    *out = Value::boolean(ok);
    Ok(())
}

fn is_zero(v: &Value) -> bool {
    match v.kind {
        ValueKind::Integer => (unsafe { v.data.int_ }) == 0,
        ValueKind::Float => (unsafe { v.data.float_ }) == 0.0,
        _ => false,
    }
}

/// Proper-list check, cycle-safe via the two-cursor walk
fn proper_list_p(v: &Value) -> bool {
    if v.kind != ValueKind::List {
        return false;
    }
    let mut slow = *v;
    let mut fast = *v;
    loop {
        if fast.is_nil() {
            return true;
        }
        if !fast.is_pair() {
            return false;
        }
        fast = cons_cdr(unsafe { fast.data.obj });

        if fast.is_nil() {
            return true;
        }
        if !fast.is_pair() {
            return false;
        }
        fast = cons_cdr(unsafe { fast.data.obj });
        slow = cons_cdr(unsafe { slow.data.obj });

        if fast.is_pair() && slow.is_pair() && unsafe { fast.data.obj == slow.data.obj } {
            return false;
        }
    }
}

fn list_length(v: &Value) -> usize {
    let mut n = 0;
    let mut cur = *v;
    while cur.is_pair() {
        n += 1;
        cur = cons_cdr(unsafe { cur.data.obj });
    }
    n
}

/// Copies a proper list's elements into a rooted work buffer
fn collect_list_values(vm: &mut Vm, list: &Value) -> Result<ArenaVec<Value>, ErrCode> {
    let n = list_length(list);
    let work: *mut super::arena::Arena = &mut vm.work;
    let mut vec: ArenaVec<Value> = ArenaVec::new(work, n.max(1)).ok_or(ErrCode::OutOfMemory)?;
    for _ in 0..n {
        vec.push(Value::undefined());
    }
    unsafe { (*vm.gc).root_span(vec.as_mut_ptr(), n) };

    let mut cur = *list;
    let mut k = 0;
    while cur.is_pair() {
        let cell = unsafe { cur.data.obj };
        unsafe { ptr::write(vec.at(k), cons_car(cell)) };
        k += 1;
        cur = cons_cdr(cell);
    }
    Ok(vec)
}

fn release_list_values(vm: &mut Vm, vec: &mut ArenaVec<Value>) {
    let n = vec.len();
    unsafe { (*vm.gc).unroot_span(vec.as_mut_ptr(), n) };
}

/// Applies an already-computed callable to value arguments
fn apply_values(
    vm: &mut Vm,
    env: *mut SymTab,
    callee: &Value,
    args: &[Value],
    out: &mut Value,
) -> Result<(), ErrCode> {
    match callee.kind {
        ValueKind::Builtin => {
            let entry = unsafe { &*callee.data.bltn };
            (entry.apply)(vm, env, args, out)
        }
        ValueKind::Function => {
            let f = unsafe { callee.data.func };
            vm.apply_function_values(f, args, out)
        }
        _ => {
            eprintln!("Error: value is not a procedure");
            Err(ErrCode::Type)
        }
    }
}

/// Evaluates a quoted structure: symbols look up, lists apply their
/// heads, everything else is self-evaluating
fn eval_value(vm: &mut Vm, env: *mut SymTab, v: &Value, out: &mut Value) -> Result<(), ErrCode> {
    match v.kind {
        ValueKind::Undefined => Err(ErrCode::Eval),
        ValueKind::Symbol => {
            let name = sym_bytes(unsafe { v.data.obj });
            let b = unsafe { (*env).lookup(name) };
            if b.is_null() {
                eprintln!(
                    "Error: undefined symbol '{}'",
                    String::from_utf8_lossy(name)
                );
                return Err(ErrCode::Unbound);
            }
            *out = unsafe { (*b).value };
            Ok(())
        }
        ValueKind::List => {
            if v.is_nil() {
                *out = Value::nil();
                return Ok(());
            }
            if !proper_list_p(v) {
                eprintln!("Error: cannot evaluate an improper list");
                return Err(ErrCode::Eval);
            }

            let head_cell = unsafe { v.data.obj };
            let mut headv = Value::undefined();
            eval_value(vm, env, &cons_car(head_cell), &mut headv)?;
            unsafe { (*vm.gc).push_root(&mut headv) };

            let rest = cons_cdr(head_cell);
            let mut run = |vm: &mut Vm| -> Result<(), ErrCode> {
                let mut vals = collect_list_values(vm, &rest)?;
                let n = vals.len();
                for k in 0..n {
                    let arg = unsafe { ptr::read(vals.at(k)) };
                    let mut evaluated = Value::undefined();
                    if let Err(e) = eval_value(vm, env, &arg, &mut evaluated) {
                        release_list_values(vm, &mut vals);
                        return Err(e);
                    }
                    unsafe { ptr::write(vals.at(k), evaluated) };
                }
                let r = apply_values(vm, env, &headv, vals.as_slice(), out);
                release_list_values(vm, &mut vals);
                r
            };
            let r = run(vm);
            unsafe { (*vm.gc).unroot_span(&mut headv, 1) };
            r
        }
        _ => {
            *out = *v;
            Ok(())
        }
    }
}

// --------------------------- the registry --------------------------

native_fns! {
    const BUILTINS;
    _vm _env args out;

    "+" bltn_add {
        if check_numeric(args)? {
            let mut acc: i64 = 0;
            for a in args {
                acc = acc.wrapping_add(unsafe { a.data.int_ });
            }
            *out = Value::integer(acc);
        } else {
            let mut acc: f64 = 0.0;
            for a in args {
                acc += a.as_f64();
            }
            *out = Value::float(acc);
        }
        Ok(())
    }

    "-" bltn_sub {
        if args.is_empty() {
            *out = Value::integer(0);
            return Ok(());
        }
        let all_int = check_numeric(args)?;

        if args.len() == 1 {
            *out = match args[0].kind {
                ValueKind::Integer => Value::integer(unsafe { args[0].data.int_ }.wrapping_neg()),
                _ => Value::float(-unsafe { args[0].data.float_ }),
            };
            return Ok(());
        }

        if all_int {
            let mut acc = unsafe { args[0].data.int_ };
            for a in &args[1..] {
                acc = acc.wrapping_sub(unsafe { a.data.int_ });
            }
            *out = Value::integer(acc);
        } else {
            let mut acc = args[0].as_f64();
            for a in &args[1..] {
                acc -= a.as_f64();
            }
            *out = Value::float(acc);
        }
        Ok(())
    }

    "*" bltn_mul {
        if check_numeric(args)? {
            let mut acc: i64 = 1;
            for a in args {
                acc = acc.wrapping_mul(unsafe { a.data.int_ });
            }
            *out = Value::integer(acc);
        } else {
            let mut acc: f64 = 1.0;
            for a in args {
                acc *= a.as_f64();
            }
            *out = Value::float(acc);
        }
        Ok(())
    }

    "/" bltn_div {
        if args.is_empty() {
            return Err(ErrCode::Arg);
        }
        check_numeric(args)?;

        if args.len() == 1 {
            if is_zero(&args[0]) {
                eprintln!("Error: reciprocal of zero");
                return Err(ErrCode::Eval);
            }
            *out = Value::float(1.0 / args[0].as_f64());
            return Ok(());
        }

        for a in &args[1..] {
            if is_zero(a) {
                eprintln!("Error: division by zero");
                return Err(ErrCode::Eval);
            }
        }

        // division always lands in floats
        let mut acc = args[0].as_f64();
        for a in &args[1..] {
            acc /= a.as_f64();
        }
        *out = Value::float(acc);
        Ok(())
    }

    "mod" bltn_mod {
        if args.len() != 2 {
            return Err(ErrCode::Arg);
        }
        if args[0].kind != ValueKind::Integer || args[1].kind != ValueKind::Integer {
            eprintln!("Error: mod takes integer operands");
            return Err(ErrCode::Type);
        }
        let d = unsafe { args[1].data.int_ };
        if d == 0 {
            eprintln!("Error: division by zero");
            return Err(ErrCode::Eval);
        }
        *out = Value::integer(unsafe { args[0].data.int_ }.wrapping_rem(d));
        Ok(())
    }

    "=" bltn_num_eq {
        numeric_chain(args, out, |a, b| a == b)
    }

    "<" bltn_lt {
        numeric_chain(args, out, |a, b| a < b)
    }

    ">" bltn_gt {
        numeric_chain(args, out, |a, b| a > b)
    }

    "<=" bltn_le {
        numeric_chain(args, out, |a, b| a <= b)
    }

    ">=" bltn_ge {
        numeric_chain(args, out, |a, b| a >= b)
    }

    "cons" bltn_cons {
        if args.len() != 2 {
            return Err(ErrCode::Arg);
        }
        let cell = cons_init(_vm.gc, args[0], args[1]);
        if cell.is_null() {
            return Err(ErrCode::OutOfMemory);
        }
        *out = Value::list(cell);
        Ok(())
    }

    "car" bltn_car {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        if !args[0].is_pair() {
            eprintln!("Error: car of a non-pair");
            return Err(ErrCode::Type);
        }
        *out = cons_car(unsafe { args[0].data.obj });
        Ok(())
    }

    "cdr" bltn_cdr {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        if !args[0].is_pair() {
            eprintln!("Error: cdr of a non-pair");
            return Err(ErrCode::Type);
        }
        *out = cons_cdr(unsafe { args[0].data.obj });
        Ok(())
    }

    "list" bltn_list {
        // chain from the rear; the argument buffer is already rooted
        let mut acc = Value::nil();
        for v in args.iter().rev() {
            let cell = cons_init(_vm.gc, *v, acc);
            if cell.is_null() {
                return Err(ErrCode::OutOfMemory);
            }
            acc = Value::list(cell);
        }
        *out = acc;
        Ok(())
    }

    "atom?" bltn_atom_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(!args[0].is_pair());
        Ok(())
    }

    "pair?" bltn_pair_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(args[0].is_pair());
        Ok(())
    }

    "list?" bltn_list_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(proper_list_p(&args[0]));
        Ok(())
    }

    "null?" bltn_null_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(args[0].is_nil());
        Ok(())
    }

    "number?" bltn_number_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(args[0].is_numeric());
        Ok(())
    }

    "string?" bltn_string_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(args[0].kind == ValueKind::String);
        Ok(())
    }

    "symbol?" bltn_symbol_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(args[0].kind == ValueKind::Symbol);
        Ok(())
    }

    "procedure?" bltn_procedure_p {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(
            args[0].kind == ValueKind::Function || args[0].kind == ValueKind::Builtin,
        );
        Ok(())
    }

    "eq?" bltn_eq_p {
        if args.len() != 2 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(core_eq(&args[0], &args[1]));
        Ok(())
    }

    "equal?" bltn_equal_p {
        if args.len() != 2 {
            return Err(ErrCode::Arg);
        }
        *out = Value::boolean(core_equal(&args[0], &args[1]));
        Ok(())
    }

    "display" bltn_display {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        print!("{}", super::render_value(&args[0], false));
        *out = Value::nil();
        Ok(())
    }

    "newline" bltn_newline {
        if !args.is_empty() {
            return Err(ErrCode::Arg);
        }
        println!();
        *out = Value::nil();
        Ok(())
    }

    "apply" bltn_apply {
        if args.len() != 2 {
            return Err(ErrCode::Arg);
        }
        if !proper_list_p(&args[1]) {
            eprintln!("Error: apply requires an argument list");
            return Err(ErrCode::Type);
        }

        let callee = args[0];
        let mut vals = collect_list_values(_vm, &args[1])?;
        let r = apply_values(_vm, _env, &callee, vals.as_slice(), out);
        release_list_values(_vm, &mut vals);
        r
    }

    "eval" bltn_eval {
        if args.len() != 1 {
            return Err(ErrCode::Arg);
        }
        eval_value(_vm, _env, &args[0], out)
    }

    "exit" bltn_exit {
        let code = match args.len() {
            0 => 0,
            1 if args[0].kind == ValueKind::Integer => (unsafe { args[0].data.int_ }) as i32,
            _ => return Err(ErrCode::Arg),
        };
        std::process::exit(code);
    }
}

/// Binds every registered primitive into the global scope with the
/// builtin type and the const flag
pub fn environment_setup(env: *mut SymTab) -> Result<(), ErrCode> {
    for entry in BUILTINS {
        let v = Value::builtin(entry as *const BuiltinEntry);
        unsafe {
            (*env).define(entry.name.as_bytes(), ValueKind::Builtin, v, FLAG_CONST)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::memmgt::{Gc, GcConfig};
    use super::*;

    fn dummy_vm() -> (Box<Gc>, Vm) {
        // an empty program is enough for the value-level cores
        let tokens = Box::leak(Box::new(super::super::lexer::lex_tokens(b"0")));
        super::super::annotate::annotate(tokens).unwrap();
        let flux = Box::leak(Box::new(super::super::flux::build(tokens).unwrap()));
        let mut gc = Box::new(Gc::new(GcConfig::default()).unwrap());
        let vm = Vm::new(flux, &mut *gc).unwrap();
        (gc, vm)
    }

    fn ints(ns: &[i64]) -> Vec<Value> {
        ns.iter().map(|n| Value::integer(*n)).collect()
    }

    #[test]
    fn addition_identities_and_promotion() {
        let (_gc, mut vm) = dummy_vm();
        let env = ptr::null_mut();
        let mut out = Value::undefined();

        bltn_add(&mut vm, env, &[], &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, 0);

        bltn_add(&mut vm, env, &ints(&[1, 2, 3]), &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, 6);

        bltn_add(
            &mut vm,
            env,
            &[Value::integer(1), Value::float(0.5)],
            &mut out,
        )
        .unwrap();
        assert_eq!(out.kind, ValueKind::Float);
        assert_eq!(unsafe { out.data.float_ }, 1.5);

        bltn_mul(&mut vm, env, &[], &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, 1);

        assert_eq!(
            bltn_add(
                &mut vm,
                env,
                &[Value::integer(1), Value::boolean(true)],
                &mut out
            ),
            Err(ErrCode::Type)
        );
    }

    #[test]
    fn subtraction_and_negation() {
        let (_gc, mut vm) = dummy_vm();
        let env = ptr::null_mut();
        let mut out = Value::undefined();

        bltn_sub(&mut vm, env, &[], &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, 0);

        bltn_sub(&mut vm, env, &ints(&[5]), &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, -5);

        bltn_sub(&mut vm, env, &ints(&[10, 3, 2]), &mut out).unwrap();
        assert_eq!(unsafe { out.data.int_ }, 5);
    }

    #[test]
    fn division_is_float_and_guards_zero() {
        let (_gc, mut vm) = dummy_vm();
        let env = ptr::null_mut();
        let mut out = Value::undefined();

        bltn_div(&mut vm, env, &ints(&[10, 4]), &mut out).unwrap();
        assert_eq!(out.kind, ValueKind::Float);
        assert_eq!(unsafe { out.data.float_ }, 2.5);

        bltn_div(&mut vm, env, &ints(&[4]), &mut out).unwrap();
        assert_eq!(unsafe { out.data.float_ }, 0.25);

        assert_eq!(
            bltn_div(&mut vm, env, &ints(&[1, 0]), &mut out),
            Err(ErrCode::Eval)
        );
        assert_eq!(bltn_div(&mut vm, env, &[], &mut out), Err(ErrCode::Arg));
        assert_eq!(
            bltn_div(&mut vm, env, &ints(&[0]), &mut out),
            Err(ErrCode::Eval)
        );
    }

    #[test]
    fn comparison_chains() {
        let (_gc, mut vm) = dummy_vm();
        let env = ptr::null_mut();
        let mut out = Value::undefined();

        bltn_lt(&mut vm, env, &ints(&[1, 2, 3]), &mut out).unwrap();
        assert!(unsafe { out.data.bool_ });

        bltn_lt(&mut vm, env, &ints(&[1, 3, 2]), &mut out).unwrap();
        assert!(!unsafe { out.data.bool_ });

        bltn_num_eq(
            &mut vm,
            env,
            &[Value::integer(2), Value::float(2.0)],
            &mut out,
        )
        .unwrap();
        assert!(unsafe { out.data.bool_ });

        bltn_ge(&mut vm, env, &ints(&[3, 3, 2]), &mut out).unwrap();
        assert!(unsafe { out.data.bool_ });
    }

    #[test]
    fn list_primitives() {
        let (mut _gc, mut vm) = dummy_vm();
        let env = ptr::null_mut();
        let mut out = Value::undefined();

        bltn_list(&mut vm, env, &ints(&[1, 2, 3]), &mut out).unwrap();
        assert!(proper_list_p(&out));
        assert_eq!(list_length(&out), 3);

        let lst = out;
        let mut first = Value::undefined();
        bltn_car(&mut vm, env, &[lst], &mut first).unwrap();
        assert_eq!(unsafe { first.data.int_ }, 1);

        let mut rest = Value::undefined();
        bltn_cdr(&mut vm, env, &[lst], &mut rest).unwrap();
        assert_eq!(list_length(&rest), 2);

        // an improper pair is a pair but not a list
        let mut pair = Value::undefined();
        bltn_cons(
            &mut vm,
            env,
            &[Value::integer(1), Value::integer(2)],
            &mut pair,
        )
        .unwrap();
        assert!(pair.is_pair());
        assert!(!proper_list_p(&pair));

        assert_eq!(
            bltn_car(&mut vm, env, &[Value::integer(9)], &mut out),
            Err(ErrCode::Type)
        );
    }

    #[test]
    fn cycle_safe_list_check() {
        let (mut gc, mut _vm) = dummy_vm();
        let gp: *mut Gc = &mut *gc;

        let cell = cons_init(gp, Value::integer(1), Value::nil());
        cons_set_cdr(cell, Value::list(cell));
        assert!(!proper_list_p(&Value::list(cell)));
    }

    #[test]
    fn registry_is_complete_and_named() {
        let expected = [
            "+", "-", "*", "/", "mod", "=", "<", ">", "<=", ">=", "cons", "car", "cdr",
            "list", "atom?", "pair?", "list?", "null?", "number?", "string?", "symbol?",
            "procedure?", "eq?", "equal?", "display", "newline", "apply", "eval", "exit",
        ];
        assert_eq!(BUILTINS.len(), expected.len());
        for name in expected {
            assert!(BUILTINS.iter().any(|e| e.name == name), "missing {}", name);
        }
    }
}
