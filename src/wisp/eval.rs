// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/eval.rs

// Iterative work-stack evaluator. Keeps a per-id result cache, walks
// span children without host recursion, recognizes the special forms
// ahead of child fan-out, and drives user function bodies through
// sentinel frames that route the final value to the call site.

// <>

use super::arena::Arena;
use super::core::*;
use super::flux::{ProgramFlux, SExpr};
use super::lexer::{Token, TokenKind};
use super::memmgt::Gc;
use super::symtab::{self, SymTab, FLAG_MUTABLE};
use super::vec::ArenaVec;
use super::ErrCode;

use std::mem;
use std::ptr;

/// Span id marking a lambda-body sentinel frame
pub const SENTINEL_ID: usize = usize::MAX;

/// One evaluation frame
///
/// Ordinary frames carry the span under reduction; sentinel frames
/// (`expr.id == SENTINEL_ID`) carry the function whose body is being
/// sequenced and the call-site slot the result lands in.
#[derive(Clone, Copy)]
pub struct Frame {
    pub expr: SExpr,
    pub env: *mut SymTab,
    pub func: *const Lambda,
    pub body_idx: u32,
    pub dest_id: usize,
}

/// One element of a span: an inline atom token or a nested span
#[derive(Clone, Copy)]
enum Elem {
    Atom(usize),
    Sub(usize),
}

/// The virtual machine: flux reference, result cache, work arena
pub struct Vm {
    flux: *const ProgramFlux,
    pub gc: *mut Gc,
    cache: *mut Value,
    slots: usize,
    cache_arena: Arena,
    pub work: Arena,
    /// Currently active call span, for primitives that need it
    pub pc: usize,
}

fn text_lossy(tok: &Token) -> String {
    String::from_utf8_lossy(tok.text()).into_owned()
}

impl Vm {
    /// Builds a VM for one program: a result cache slot per span id,
    /// initialized to undefined and registered as collector roots
    pub fn new(flux: *const ProgramFlux, gc: *mut Gc) -> Result<Vm, ErrCode> {
        let slots = unsafe { (*flux).max_id } + 1;

        let cache_bytes = slots * mem::size_of::<Value>();
        let mut cache_arena = Arena::new(cache_bytes.max(4096));
        let cache = cache_arena.alloc(cache_bytes) as *mut Value;
        if cache.is_null() {
            return Err(ErrCode::OutOfMemory);
        }
        for i in 0..slots {
            unsafe { ptr::write(cache.add(i), Value::undefined()) };
        }
        unsafe { (*gc).root_span(cache, slots) };

        Ok(Vm {
            flux,
            gc,
            cache,
            slots,
            cache_arena,
            work: Arena::new(16 * 1024),
            pc: 0,
        })
    }

    #[inline(always)]
    fn cache_get(&self, id: usize) -> Value {
        assert!(id < self.slots);
        unsafe { ptr::read(self.cache.add(id)) }
    }

    #[inline(always)]
    fn cache_put(&mut self, id: usize, v: Value) {
        assert!(id < self.slots);
        unsafe { ptr::write(self.cache.add(id), v) };
    }

    #[inline(always)]
    fn span_of(&self, id: usize) -> SExpr {
        unsafe { *(*self.flux).span(id).expect("span id out of range") }
    }

    /// The next element of `cur` at or after token index `*i`,
    /// advancing `*i` past it
    fn next_elem(&self, cur: &SExpr, i: &mut usize) -> Option<Elem> {
        while *i <= cur.end_idx {
            let tok = cur.token(*i);
            if tok.sexpr_id > cur.id {
                // the first such token is the child's opening paren
                let child = self.span_of(tok.sexpr_id);
                *i = child.end_idx + 2;
                return Some(Elem::Sub(child.id));
            }
            if tok.kind == TokenKind::Ignored {
                *i += 1;
                continue;
            }
            let idx = *i;
            *i += 1;
            return Some(Elem::Atom(idx));
        }
        None
    }

    fn count_args(&self, call: &SExpr) -> usize {
        let mut i = call.start_idx;
        let _head = self.next_elem(call, &mut i);
        let mut n = 0;
        while self.next_elem(call, &mut i).is_some() {
            n += 1;
        }
        n
    }

    // ----------------------- atom evaluation -----------------------

    fn parse_int_token(&mut self, tok: &Token) -> Result<Value, ErrCode> {
        let mut buf = [0u8; 31];
        let len = tok.len.min(31);
        buf[..len].copy_from_slice(&tok.text()[..len]);

        match std::str::from_utf8(&buf[..len])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        {
            Some(n) => Ok(Value::integer(n)),
            // overflow and malformed digits fall back to a symbol
            // carrying the raw text
            None => self.symbol_from(tok),
        }
    }

    fn parse_float_token(&mut self, tok: &Token) -> Result<Value, ErrCode> {
        let mut buf = [0u8; 63];
        let len = tok.len.min(63);
        buf[..len].copy_from_slice(&tok.text()[..len]);

        match std::str::from_utf8(&buf[..len])
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|f| f.is_finite())
        {
            Some(f) => Ok(Value::float(f)),
            None => self.symbol_from(tok),
        }
    }

    fn string_token_value(&mut self, tok: &Token) -> Result<Value, ErrCode> {
        let text = tok.text();
        debug_assert!(text.len() >= 2);
        let body = str_init(self.gc, &text[1..text.len() - 1]);
        if body.is_null() {
            return Err(ErrCode::OutOfMemory);
        }
        Ok(Value::string(body))
    }

    fn symbol_from(&mut self, tok: &Token) -> Result<Value, ErrCode> {
        let body = sym_init(self.gc, tok.text());
        if body.is_null() {
            return Err(ErrCode::OutOfMemory);
        }
        Ok(Value::symbol(body))
    }

    /// Evaluates a single token in the given environment
    pub fn eval_atom(&mut self, env: *mut SymTab, tok: &Token) -> Result<Value, ErrCode> {
        match tok.kind {
            TokenKind::Integer => self.parse_int_token(tok),
            TokenKind::Float => self.parse_float_token(tok),
            TokenKind::String => self.string_token_value(tok),
            TokenKind::Identifier => {
                let b = unsafe { (*env).lookup(tok.text()) };
                if b.is_null() {
                    eprintln!("Error: undefined symbol '{}'", text_lossy(tok));
                    return Err(ErrCode::Unbound);
                }
                Ok(unsafe { (*b).value })
            }
            TokenKind::Uninterned => self.symbol_from(tok),
            TokenKind::Quote | TokenKind::Quasiquote | TokenKind::Unquote => {
                eprintln!("Error: unexpected operator '{}' as atom", text_lossy(tok));
                Err(ErrCode::Eval)
            }
            TokenKind::Error => {
                eprintln!("Error: invalid token '{}'", text_lossy(tok));
                Err(ErrCode::Eval)
            }
            TokenKind::Ignored | TokenKind::LParen | TokenKind::RParen => Err(ErrCode::Eval),
        }
    }

    // ------------------------- quotation ---------------------------

    fn quote_atom(&mut self, tok: &Token) -> Result<Value, ErrCode> {
        match tok.kind {
            TokenKind::Integer => self.parse_int_token(tok),
            TokenKind::Float => self.parse_float_token(tok),
            TokenKind::String => self.string_token_value(tok),
            TokenKind::Identifier | TokenKind::Uninterned => self.symbol_from(tok),
            _ => {
                eprintln!("Error: cannot quote token '{}'", text_lossy(tok));
                Err(ErrCode::Eval)
            }
        }
    }

    fn quote_elem(&mut self, cur: &SExpr, elem: Elem) -> Result<Value, ErrCode> {
        match elem {
            Elem::Atom(idx) => self.quote_atom(&cur.token(idx)),
            Elem::Sub(id) => {
                let span = self.span_of(id);
                self.quote_span(&span)
            }
        }
    }

    /// Builds the cons-chain image of a span without evaluating it
    fn quote_span(&mut self, span: &SExpr) -> Result<Value, ErrCode> {
        // count, then fill a fixed buffer so its slots can be rooted
        let mut n = 0;
        let mut i = span.start_idx;
        while self.next_elem(span, &mut i).is_some() {
            n += 1;
        }

        let work: *mut Arena = &mut self.work;
        let mut elems: ArenaVec<Value> =
            ArenaVec::new(work, n.max(1)).ok_or(ErrCode::OutOfMemory)?;
        for _ in 0..n {
            elems.push(Value::undefined());
        }
        unsafe { (*self.gc).root_span(elems.as_mut_ptr(), n) };

        let build = |vm: &mut Vm, elems: &mut ArenaVec<Value>| -> Result<Value, ErrCode> {
            let mut i = span.start_idx;
            let mut k = 0;
            while let Some(elem) = vm.next_elem(span, &mut i) {
                let v = vm.quote_elem(span, elem)?;
                unsafe { ptr::write(elems.at(k), v) };
                k += 1;
            }

            // fold into a chain from the rear
            let mut acc = Value::nil();
            unsafe { (*vm.gc).push_root(&mut acc) };
            for k in (0..n).rev() {
                let v = unsafe { ptr::read(elems.at(k)) };
                let cell = cons_init(vm.gc, v, acc);
                if cell.is_null() {
                    unsafe { (*vm.gc).unroot_span(&mut acc, 1) };
                    return Err(ErrCode::OutOfMemory);
                }
                acc = Value::list(cell);
            }
            unsafe { (*vm.gc).unroot_span(&mut acc, 1) };
            Ok(acc)
        };

        let result = build(self, &mut elems);
        unsafe { (*self.gc).unroot_span(elems.as_mut_ptr(), n) };
        result
    }

    // ------------------------ special forms ------------------------

    fn form_quote(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        cur: &SExpr,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        let mut i = cur.start_idx;
        let _head = self.next_elem(cur, &mut i);

        let arg = match self.next_elem(cur, &mut i) {
            Some(e) => e,
            None => {
                eprintln!("Error: quote requires an argument");
                return Err(ErrCode::Eval);
            }
        };
        if self.next_elem(cur, &mut i).is_some() {
            eprintln!("Error: quote takes exactly one argument");
            return Err(ErrCode::Eval);
        }

        let v = self.quote_elem(cur, arg)?;
        self.cache_put(cur.id, v);
        if cur.id == root_id {
            *out = v;
        }
        stack.pop_discard();
        Ok(true)
    }

    fn form_define(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        cur: &SExpr,
        env: *mut SymTab,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        let mut i = cur.start_idx;
        let _head = self.next_elem(cur, &mut i);

        let name_elem = self.next_elem(cur, &mut i);
        let val_elem = self.next_elem(cur, &mut i);
        let extra = self.next_elem(cur, &mut i);

        let (name_elem, val_elem) = match (name_elem, val_elem, extra) {
            (Some(n), Some(v), None) => (n, v),
            _ => {
                eprintln!("Error: define requires a name and a value");
                return Err(ErrCode::Eval);
            }
        };

        let name_tok = match name_elem {
            Elem::Atom(idx) => cur.token(idx),
            Elem::Sub(_) => {
                eprintln!("Error: define requires an identifier to bind");
                return Err(ErrCode::Eval);
            }
        };
        if name_tok.kind != TokenKind::Identifier {
            eprintln!("Error: cannot bind '{}'", text_lossy(&name_tok));
            return Err(ErrCode::Eval);
        }

        let v = match val_elem {
            Elem::Atom(idx) => self.eval_atom(env, &cur.token(idx))?,
            Elem::Sub(id) => {
                let v = self.cache_get(id);
                if v.is_undefined() {
                    let child = self.span_of(id);
                    let pushed = stack.push(Frame {
                        expr: child,
                        env,
                        func: ptr::null(),
                        body_idx: 0,
                        dest_id: child.id,
                    });
                    if !pushed {
                        return Err(ErrCode::OutOfMemory);
                    }
                    return Ok(true);
                }
                v
            }
        };

        unsafe { (*env).define(name_tok.text(), v.kind, v, symtab::FLAG_CONST)? };

        self.cache_put(cur.id, v);
        if cur.id == root_id {
            *out = v;
        }
        stack.pop_discard();
        Ok(true)
    }

    fn form_lambda(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        cur: &SExpr,
        env: *mut SymTab,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        let mut i = cur.start_idx;
        let _head = self.next_elem(cur, &mut i);

        let pspan = match self.next_elem(cur, &mut i) {
            Some(Elem::Sub(id)) => self.span_of(id),
            _ => {
                eprintln!("Error: lambda requires a parameter list");
                return Err(ErrCode::Eval);
            }
        };

        let mut params: Vec<ParamName> = Vec::new();
        let mut pi = pspan.start_idx;
        while let Some(e) = self.next_elem(&pspan, &mut pi) {
            match e {
                Elem::Atom(idx) => {
                    let t = pspan.token(idx);
                    if t.kind != TokenKind::Identifier {
                        eprintln!("Error: parameter '{}' is not an identifier", text_lossy(&t));
                        return Err(ErrCode::Eval);
                    }
                    params.push(ParamName {
                        ptr: t.value,
                        len: t.len,
                    });
                }
                Elem::Sub(_) => {
                    eprintln!("Error: nested form in parameter list");
                    return Err(ErrCode::Eval);
                }
            }
        }

        let dummy = Token {
            kind: TokenKind::Ignored,
            value: ptr::null(),
            len: 0,
            sexpr_id: 0,
        };
        let mut body: Vec<BodyElem> = Vec::new();
        while let Some(e) = self.next_elem(cur, &mut i) {
            body.push(match e {
                Elem::Atom(idx) => BodyElem {
                    child_id: BODY_ATOM,
                    tok: cur.token(idx),
                },
                Elem::Sub(id) => BodyElem {
                    child_id: id,
                    tok: dummy,
                },
            });
        }

        let f = lambda_init(&mut self.work, env, &params, &body);
        if f.is_null() {
            return Err(ErrCode::OutOfMemory);
        }
        symtab::retain_frame(env);

        let v = Value::function(f);
        self.cache_put(cur.id, v);
        if cur.id == root_id {
            *out = v;
        }
        stack.pop_discard();
        Ok(true)
    }

    // ------------------------- application -------------------------

    /// Resets the cache slots of every span nested in the function's
    /// body, so each application recomputes it
    fn clear_body_cache(&mut self, f: *const Lambda) {
        let nbody = unsafe { (*f).nbody };
        for bi in 0..nbody {
            let elem = lambda_body_elem(f, bi);
            if elem.child_id == BODY_ATOM {
                continue;
            }
            let bspan = self.span_of(elem.child_id);
            let flux = unsafe { &*self.flux };
            for s in flux.sexprs.as_slice() {
                if s.start_idx >= bspan.start_idx && s.end_idx <= bspan.end_idx {
                    let id = s.id;
                    self.cache_put(id, Value::undefined());
                }
            }
        }
    }

    fn apply_lambda(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        cur: &SExpr,
        env: *mut SymTab,
        f: *const Lambda,
    ) -> Result<(), ErrCode> {
        let nparams = unsafe { (*f).nparams };

        // the new scope's parent is the function's captured
        // environment, never the caller's
        let fn_scope = symtab::push_scope(unsafe { (*f).scope });
        if fn_scope.is_null() {
            return Err(ErrCode::OutOfMemory);
        }

        let mut i = cur.start_idx;
        let _head = self.next_elem(cur, &mut i);

        let fail = |scope: *mut SymTab, e: ErrCode| {
            symtab::pop_scope(scope);
            Err(e)
        };

        for p in 0..nparams {
            let elem = match self.next_elem(cur, &mut i) {
                Some(e) => e,
                None => {
                    eprintln!("Error: too few arguments to function");
                    return fail(fn_scope, ErrCode::Arg);
                }
            };

            let v = match elem {
                Elem::Atom(idx) => {
                    let tok = cur.token(idx);
                    match self.eval_atom(env, &tok) {
                        Ok(v) => v,
                        Err(e) => return fail(fn_scope, e),
                    }
                }
                Elem::Sub(id) => {
                    let v = self.cache_get(id);
                    if v.is_undefined() {
                        return fail(fn_scope, ErrCode::Eval);
                    }
                    v
                }
            };

            let name = lambda_param(f, p);
            if let Err(e) =
                unsafe { (*fn_scope).define(name.text(), v.kind, v, FLAG_MUTABLE) }
            {
                return fail(fn_scope, e);
            }
        }

        if self.next_elem(cur, &mut i).is_some() {
            eprintln!("Error: too many arguments to function");
            return fail(fn_scope, ErrCode::Arg);
        }

        self.clear_body_cache(f);

        // the sentinel takes the call frame's place; the final body
        // value flows to the call site through it
        stack.pop_discard();
        let sentinel = Frame {
            expr: SExpr {
                id: SENTINEL_ID,
                start_idx: 1,
                end_idx: 0,
                tokens: ptr::null(),
            },
            env: fn_scope,
            func: f,
            body_idx: 0,
            dest_id: cur.id,
        };
        if !stack.push(sentinel) {
            return Err(ErrCode::OutOfMemory);
        }
        Ok(())
    }

    fn apply(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        cur: &SExpr,
        env: *mut SymTab,
        root_id: usize,
        out: &mut Value,
    ) -> Result<(), ErrCode> {
        let mut i = cur.start_idx;
        let head = match self.next_elem(cur, &mut i) {
            Some(h) => h,
            None => return Err(ErrCode::Eval),
        };

        let callee = match head {
            Elem::Atom(idx) => {
                let tok = cur.token(idx);
                if tok.kind != TokenKind::Identifier {
                    eprintln!("Error: '{}' is not applicable", text_lossy(&tok));
                    return Err(ErrCode::Type);
                }
                let b = unsafe { (*env).lookup(tok.text()) };
                if b.is_null() {
                    eprintln!("Error: undefined symbol '{}'", text_lossy(&tok));
                    return Err(ErrCode::Unbound);
                }
                unsafe { (*b).value }
            }
            Elem::Sub(id) => self.cache_get(id),
        };

        match callee.kind {
            ValueKind::Builtin => {
                let entry = unsafe { &*callee.data.bltn };
                self.pc = cur.id;
                let mut res = Value::undefined();
                (entry.invoke)(self, env, cur, &mut res)?;
                self.cache_put(cur.id, res);
                if cur.id == root_id {
                    *out = res;
                }
                stack.pop_discard();
                Ok(())
            }
            ValueKind::Function => {
                let f = unsafe { callee.data.func };
                self.apply_lambda(stack, cur, env, f)
            }
            _ => {
                eprintln!("Error: head of call is not a procedure");
                Err(ErrCode::Type)
            }
        }
    }

    // ------------------------ the step loop ------------------------

    fn sentinel_step(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        let frp = stack.peek();
        let fr = unsafe { ptr::read(frp) };
        let f = fr.func;
        let nbody = unsafe { (*f).nbody };

        if nbody == 0 {
            return self.finish_sentinel(stack, &fr, Value::nil(), root_id, out);
        }

        let elem = lambda_body_elem(f, fr.body_idx as u16);
        let is_last = fr.body_idx as u16 + 1 == nbody;

        if elem.child_id != BODY_ATOM {
            let v = self.cache_get(elem.child_id);
            if v.is_undefined() {
                let child = self.span_of(elem.child_id);
                let pushed = stack.push(Frame {
                    expr: child,
                    env: fr.env,
                    func: ptr::null(),
                    body_idx: 0,
                    dest_id: child.id,
                });
                if !pushed {
                    return Err(ErrCode::OutOfMemory);
                }
                return Ok(true);
            }

            unsafe { (*stack.peek()).body_idx += 1 };
            if is_last {
                return self.finish_sentinel(stack, &fr, v, root_id, out);
            }
            return Ok(true);
        }

        // inline atom body form; intermediate ones are effect-free,
        // so only errors and the final value matter
        let v = self.eval_atom(fr.env, &elem.tok)?;
        unsafe { (*stack.peek()).body_idx += 1 };
        if is_last {
            return self.finish_sentinel(stack, &fr, v, root_id, out);
        }
        Ok(true)
    }

    fn finish_sentinel(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        fr: &Frame,
        v: Value,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        self.cache_put(fr.dest_id, v);
        if fr.dest_id == root_id {
            *out = v;
        }
        symtab::pop_scope(fr.env);
        stack.pop_discard();
        Ok(true)
    }

    /// Consumes one frame off the top of the stack and advances it
    ///
    /// Repeated execution reduces any expression without recursing
    /// into the host stack; new frames are pushed as children are
    /// discovered.
    pub fn step(
        &mut self,
        stack: &mut ArenaVec<Frame>,
        root_id: usize,
        out: &mut Value,
    ) -> Result<bool, ErrCode> {
        if stack.is_empty() {
            return Ok(false);
        }

        let fr = unsafe { ptr::read(stack.peek()) };

        if cfg!(feature = "stkdbg") {
            log::trace!("step: frame id {} depth {}", fr.expr.id, stack.len());
        }

        if fr.expr.id == SENTINEL_ID {
            return self.sentinel_step(stack, root_id, out);
        }

        let cur = fr.expr;
        let env = fr.env;

        let cached = self.cache_get(cur.id);
        if !cached.is_undefined() {
            if cur.id == root_id {
                *out = cached;
            }
            stack.pop_discard();
            return Ok(true);
        }

        if cur.is_empty_form() {
            self.cache_put(cur.id, Value::nil());
            if cur.id == root_id {
                *out = Value::nil();
            }
            stack.pop_discard();
            return Ok(true);
        }

        // single-token span: an atom
        if cur.start_idx == cur.end_idx {
            let tok = cur.token(cur.start_idx);
            let v = self.eval_atom(env, &tok)?;
            self.cache_put(cur.id, v);
            if cur.id == root_id {
                *out = v;
            }
            stack.pop_discard();
            return Ok(true);
        }

        // special forms manage their own argument evaluation
        let head_tok = cur.token(cur.start_idx);
        if head_tok.sexpr_id == cur.id && head_tok.kind == TokenKind::Identifier {
            match head_tok.text() {
                b"quote" => return self.form_quote(stack, &cur, root_id, out),
                b"define" => return self.form_define(stack, &cur, env, root_id, out),
                b"lambda" => return self.form_lambda(stack, &cur, env, root_id, out),
                _ => {}
            }
        }

        // fan out the first uncomputed child, then suspend
        let mut i = cur.start_idx;
        while i <= cur.end_idx {
            let tok = cur.token(i);
            if tok.sexpr_id > cur.id {
                let child = self.span_of(tok.sexpr_id);
                if self.cache_get(child.id).is_undefined() {
                    let pushed = stack.push(Frame {
                        expr: child,
                        env,
                        func: ptr::null(),
                        body_idx: 0,
                        dest_id: child.id,
                    });
                    if !pushed {
                        return Err(ErrCode::OutOfMemory);
                    }
                    return Ok(true);
                }
                i = child.end_idx + 2;
                continue;
            }
            i += 1;
        }

        // every child is cached: apply
        self.apply(stack, &cur, env, root_id, out)?;
        Ok(true)
    }

    /// Fully reduces one span, leaving its value in `out`
    pub fn eval_expr(
        &mut self,
        env: *mut SymTab,
        expr: &SExpr,
        out: &mut Value,
    ) -> Result<(), ErrCode> {
        let cached = self.cache_get(expr.id);
        if !cached.is_undefined() {
            *out = cached;
            return Ok(());
        }

        let nspans = unsafe { (*self.flux).sexprs.len() };
        let work: *mut Arena = &mut self.work;
        let mut stack: ArenaVec<Frame> =
            ArenaVec::new(work, 2 * nspans + 8).ok_or(ErrCode::OutOfMemory)?;

        let pushed = stack.push(Frame {
            expr: *expr,
            env,
            func: ptr::null(),
            body_idx: 0,
            dest_id: expr.id,
        });
        if !pushed {
            return Err(ErrCode::OutOfMemory);
        }

        while self.step(&mut stack, expr.id, out)? {}
        Ok(())
    }

    // ----------------- value-level application ---------------------

    /// Collects a call's argument values: cached results for nested
    /// spans, fresh evaluation for inline atoms. The returned buffer
    /// is registered as collector roots; pair with `release_args`.
    pub fn collect_args(
        &mut self,
        env: *mut SymTab,
        call: &SExpr,
    ) -> Result<ArenaVec<Value>, ErrCode> {
        let n = self.count_args(call);

        let work: *mut Arena = &mut self.work;
        let mut vec: ArenaVec<Value> =
            ArenaVec::new(work, n.max(1)).ok_or(ErrCode::OutOfMemory)?;
        for _ in 0..n {
            vec.push(Value::undefined());
        }
        unsafe { (*self.gc).root_span(vec.as_mut_ptr(), n) };

        let mut i = call.start_idx;
        let _head = self.next_elem(call, &mut i);
        let mut k = 0;
        while let Some(elem) = self.next_elem(call, &mut i) {
            let v = match elem {
                Elem::Atom(idx) => match self.eval_atom(env, &call.token(idx)) {
                    Ok(v) => v,
                    Err(e) => {
                        unsafe { (*self.gc).unroot_span(vec.as_mut_ptr(), n) };
                        return Err(e);
                    }
                },
                Elem::Sub(id) => {
                    let v = self.cache_get(id);
                    if v.is_undefined() {
                        unsafe { (*self.gc).unroot_span(vec.as_mut_ptr(), n) };
                        return Err(ErrCode::Eval);
                    }
                    v
                }
            };
            unsafe { ptr::write(vec.at(k), v) };
            k += 1;
        }

        Ok(vec)
    }

    /// Unregisters an argument buffer from the root set
    pub fn release_args(&mut self, args: &mut ArenaVec<Value>) {
        let n = args.len();
        unsafe { (*self.gc).unroot_span(args.as_mut_ptr(), n) };
    }

    /// Applies a user function to already-computed argument values,
    /// driving its body spans on a nested work stack
    pub fn apply_function_values(
        &mut self,
        f: *const Lambda,
        args: &[Value],
        out: &mut Value,
    ) -> Result<(), ErrCode> {
        let nparams = unsafe { (*f).nparams } as usize;
        if args.len() != nparams {
            eprintln!("Error: function expects {} argument(s)", nparams);
            return Err(ErrCode::Arg);
        }

        let scope = symtab::push_scope(unsafe { (*f).scope });
        if scope.is_null() {
            return Err(ErrCode::OutOfMemory);
        }

        for (k, v) in args.iter().enumerate() {
            let name = lambda_param(f, k as u16);
            if let Err(e) = unsafe { (*scope).define(name.text(), v.kind, *v, FLAG_MUTABLE) } {
                symtab::pop_scope(scope);
                return Err(e);
            }
        }

        self.clear_body_cache(f);

        let mut last = Value::nil();
        unsafe { (*self.gc).push_root(&mut last) };

        let nbody = unsafe { (*f).nbody };
        for bi in 0..nbody {
            let elem = lambda_body_elem(f, bi);
            let r = if elem.child_id == BODY_ATOM {
                self.eval_atom(scope, &elem.tok)
            } else {
                let span = self.span_of(elem.child_id);
                let mut v = Value::undefined();
                self.eval_expr(scope, &span, &mut v).map(|_| v)
            };
            match r {
                Ok(v) => last = v,
                Err(e) => {
                    unsafe { (*self.gc).unroot_span(&mut last, 1) };
                    symtab::pop_scope(scope);
                    return Err(e);
                }
            }
        }

        unsafe { (*self.gc).unroot_span(&mut last, 1) };
        symtab::pop_scope(scope);
        *out = last;
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        unsafe { (*self.gc).unroot_span(self.cache, self.slots) };
    }
}

#[cfg(test)]
mod tests {
    use super::super::annotate::annotate;
    use super::super::flux;
    use super::super::lexer::lex_tokens;
    use super::super::memmgt::GcConfig;
    use super::*;

    struct Rig {
        gc: Box<Gc>,
        flux: Box<flux::ProgramFlux>,
        _tokens: &'static mut super::super::vec::DenseVec<Token>,
        _source: &'static [u8],
    }

    fn rig(src: &'static [u8]) -> Rig {
        let tokens = Box::leak(Box::new(lex_tokens(src)));
        annotate(tokens).unwrap();
        let fx = Box::new(flux::build(tokens).unwrap());
        Rig {
            gc: Box::new(Gc::new(GcConfig::default()).unwrap()),
            flux: fx,
            _tokens: tokens,
            _source: src,
        }
    }

    #[test]
    fn literal_parsing_and_overflow_fallback() {
        let mut r = rig(b"1");
        let mut vm = Vm::new(&*r.flux, &mut *r.gc).unwrap();

        let big = b"99999999999999999999999999";
        let tok = Token {
            kind: TokenKind::Integer,
            value: big.as_ptr(),
            len: big.len(),
            sexpr_id: 0,
        };
        let v = vm.eval_atom(ptr::null_mut(), &tok).unwrap();
        assert_eq!(v.kind, ValueKind::Symbol);
        assert_eq!(sym_bytes(unsafe { v.data.obj }), &big[..]);

        let small = b"-42";
        let tok = Token {
            kind: TokenKind::Integer,
            value: small.as_ptr(),
            len: small.len(),
            sexpr_id: 0,
        };
        let v = vm.eval_atom(ptr::null_mut(), &tok).unwrap();
        assert_eq!(v.kind, ValueKind::Integer);
        assert_eq!(unsafe { v.data.int_ }, -42);
    }

    #[test]
    fn float_parsing_and_infinity_fallback() {
        let mut r = rig(b"1");
        let mut vm = Vm::new(&*r.flux, &mut *r.gc).unwrap();

        let huge = b"1e999";
        let tok = Token {
            kind: TokenKind::Float,
            value: huge.as_ptr(),
            len: huge.len(),
            sexpr_id: 0,
        };
        let v = vm.eval_atom(ptr::null_mut(), &tok).unwrap();
        assert_eq!(v.kind, ValueKind::Symbol);
    }

    #[test]
    fn quote_tokens_error_in_atom_position() {
        let mut r = rig(b"1");
        let mut vm = Vm::new(&*r.flux, &mut *r.gc).unwrap();

        let q = b"'";
        let tok = Token {
            kind: TokenKind::Quote,
            value: q.as_ptr(),
            len: 1,
            sexpr_id: 0,
        };
        assert_eq!(
            vm.eval_atom(ptr::null_mut(), &tok).unwrap_err(),
            ErrCode::Eval
        );
    }
}
