// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/core.rs

// The value model and many important utility functions for building
// heap structures. Defines the tagged value record the evaluator and
// symbol table traffic in, the collector-managed object layouts, and
// the per-type reference extractors.

// <>

use super::arena::Arena;
use super::lexer::Token;
use super::memmgt::Gc;
use super::symtab::SymTab;
use super::vec::DenseVec;

use std::mem;
use std::ptr;

/// Value kind assertion
macro_rules! valtypck {
    ( $var:ident ; $kind:ident ) => {
        assert_eq!($var.kind, $crate::wisp::core::ValueKind::$kind);
    };
}

/// Every mutator-visible value carries one of these tags
///
/// `Undefined` is strictly an internal "not yet computed" marker
/// and never escapes to the user. `Promise` is reserved.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ValueKind {
    Undefined,
    Integer,
    Float,
    Bool,
    String,
    Symbol,
    List,
    Function,
    Builtin,
    Promise,
}

/// Kinds of object living in collector-managed memory
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ObjKind {
    Cons,
    Str,
    Sym,
}

impl ObjKind {
    /// Recovers the kind from a header byte; None for anything the
    /// allocator never wrote
    #[inline(always)]
    pub fn from_raw(v: u8) -> Option<ObjKind> {
        match v {
            v if v == ObjKind::Cons as u8 => Some(ObjKind::Cons),
            v if v == ObjKind::Str as u8 => Some(ObjKind::Str),
            v if v == ObjKind::Sym as u8 => Some(ObjKind::Sym),
            _ => None,
        }
    }
}

/// Untyped payload; which field is live follows from the kind tag
#[derive(Clone, Copy)]
#[repr(C)]
pub union ValueData {
    pub int_: i64,
    pub float_: f64,
    pub bool_: bool,
    /// Body pointer of a collector-managed object
    pub obj: *mut u8,
    /// Arena-resident user function
    pub func: *const Lambda,
    /// Static builtin registry entry
    pub bltn: *const super::stdenv::BuiltinEntry,
    pub raw: u64,
}

/// A tagged value: one kind byte plus an eight-byte payload
///
/// Values are copied freely between the result cache, symbol table
/// bindings and cons cells; the collector rewrites the `obj` payload
/// of heap-kinded values when their targets move.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Value {
    pub kind: ValueKind,
    pub data: ValueData,
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("kind", &self.kind)
            .field("data", unsafe { &self.data.raw })
            .finish()
    }
}

impl Value {
    #[inline(always)]
    pub fn undefined() -> Self {
        Value {
            kind: ValueKind::Undefined,
            data: ValueData { raw: 0 },
        }
    }

    #[inline(always)]
    pub fn integer(v: i64) -> Self {
        Value {
            kind: ValueKind::Integer,
            data: ValueData { int_: v },
        }
    }

    #[inline(always)]
    pub fn float(v: f64) -> Self {
        Value {
            kind: ValueKind::Float,
            data: ValueData { float_: v },
        }
    }

    #[inline(always)]
    pub fn boolean(v: bool) -> Self {
        Value {
            kind: ValueKind::Bool,
            data: ValueData { bool_: v },
        }
    }

    /// The empty list
    #[inline(always)]
    pub fn nil() -> Self {
        Value {
            kind: ValueKind::List,
            data: ValueData {
                obj: ptr::null_mut(),
            },
        }
    }

    #[inline(always)]
    pub fn list(body: *mut u8) -> Self {
        Value {
            kind: ValueKind::List,
            data: ValueData { obj: body },
        }
    }

    #[inline(always)]
    pub fn string(body: *mut u8) -> Self {
        Value {
            kind: ValueKind::String,
            data: ValueData { obj: body },
        }
    }

    #[inline(always)]
    pub fn symbol(body: *mut u8) -> Self {
        Value {
            kind: ValueKind::Symbol,
            data: ValueData { obj: body },
        }
    }

    #[inline(always)]
    pub fn function(f: *const Lambda) -> Self {
        Value {
            kind: ValueKind::Function,
            data: ValueData { func: f },
        }
    }

    #[inline(always)]
    pub fn builtin(e: *const super::stdenv::BuiltinEntry) -> Self {
        Value {
            kind: ValueKind::Builtin,
            data: ValueData { bltn: e },
        }
    }

    #[inline(always)]
    pub fn is_undefined(&self) -> bool {
        self.kind == ValueKind::Undefined
    }

    #[inline(always)]
    pub fn is_numeric(&self) -> bool {
        self.kind == ValueKind::Integer || self.kind == ValueKind::Float
    }

    /// Non-empty list
    #[inline(always)]
    pub fn is_pair(&self) -> bool {
        self.kind == ValueKind::List && !unsafe { self.data.obj }.is_null()
    }

    #[inline(always)]
    pub fn is_nil(&self) -> bool {
        self.kind == ValueKind::List && unsafe { self.data.obj }.is_null()
    }

    /// Numeric payload widened to a float
    #[inline(always)]
    pub fn as_f64(&self) -> f64 {
        match self.kind {
            ValueKind::Integer => (unsafe { self.data.int_ }) as f64,
            ValueKind::Float => unsafe { self.data.float_ },
            _ => panic!("not a numeric value"),
        }
    }
}

/// Returns the truthiness of a value: false and the empty list are
/// falsy, everything else is truthy
#[inline(always)]
pub fn truthy(v: &Value) -> bool {
    !(v.is_undefined()
        || (v.kind == ValueKind::Bool && !unsafe { v.data.bool_ })
        || v.is_nil())
}

/// Body pointer of a heap-kinded value, if it has one
#[inline(always)]
pub fn value_heap_body(v: &Value) -> Option<*mut u8> {
    match v.kind {
        ValueKind::String | ValueKind::Symbol => Some(unsafe { v.data.obj }),
        ValueKind::List => {
            let p = unsafe { v.data.obj };
            if p.is_null() {
                None
            } else {
                Some(p)
            }
        }
        _ => None,
    }
}

// **********************************************************
// * Cons cells: two value slots, car then cdr
// **********************************************************

pub const CONS_SIZE: usize = 2 * mem::size_of::<Value>();

/// Allocates a cons cell in the nursery; the arguments are rooted
/// across the allocation. Null on out-of-memory.
pub fn cons_init(gc: *mut Gc, car: Value, cdr: Value) -> *mut u8 {
    unsafe {
        let mut car = car;
        let mut cdr = cdr;
        (*gc).push_root(&mut car);
        (*gc).push_root(&mut cdr);
        let body = (*gc).alloc_nursery(CONS_SIZE, ObjKind::Cons);
        (*gc).pop_roots(2);

        if body.is_null() {
            return body;
        }
        ptr::write(body as *mut Value, car);
        ptr::write((body as *mut Value).add(1), cdr);
        body
    }
}

#[inline(always)]
pub fn cons_car(body: *mut u8) -> Value {
    unsafe { ptr::read(body as *const Value) }
}

#[inline(always)]
pub fn cons_cdr(body: *mut u8) -> Value {
    unsafe { ptr::read((body as *const Value).add(1)) }
}

#[inline(always)]
pub fn cons_set_car(body: *mut u8, v: Value) {
    unsafe { ptr::write(body as *mut Value, v) }
}

#[inline(always)]
pub fn cons_set_cdr(body: *mut u8, v: Value) {
    unsafe { ptr::write((body as *mut Value).add(1), v) }
}

// **********************************************************
// * Strings: four-byte length, then the bytes
// **********************************************************

pub const STR_SH_LEN: usize = 8;

/// Allocates a string object in the nursery; null on out-of-memory
pub fn str_init(gc: *mut Gc, bytes: &[u8]) -> *mut u8 {
    unsafe {
        let body = (*gc).alloc_nursery(STR_SH_LEN + bytes.len(), ObjKind::Str);
        if body.is_null() {
            return body;
        }
        ptr::write(body as *mut u32, bytes.len() as u32);
        ptr::copy_nonoverlapping(bytes.as_ptr(), body.add(STR_SH_LEN), bytes.len());
        body
    }
}

#[inline(always)]
pub fn str_len(body: *mut u8) -> u32 {
    unsafe { ptr::read(body as *const u32) }
}

#[inline(always)]
pub fn str_bytes<'a>(body: *mut u8) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(body.add(STR_SH_LEN), str_len(body) as usize) }
}

// **********************************************************
// * Symbols: one value slot naming a string object
// **********************************************************

pub const SYM_SIZE: usize = mem::size_of::<Value>();

/// Allocates a symbol carrying the given name; null on out-of-memory
pub fn sym_init(gc: *mut Gc, name: &[u8]) -> *mut u8 {
    unsafe {
        let s = str_init(gc, name);
        if s.is_null() {
            return s;
        }

        let mut namev = Value::string(s);
        (*gc).push_root(&mut namev);
        let body = (*gc).alloc_nursery(SYM_SIZE, ObjKind::Sym);
        (*gc).pop_roots(1);

        if body.is_null() {
            return body;
        }
        ptr::write(body as *mut Value, namev);
        body
    }
}

#[inline(always)]
pub fn sym_name(body: *mut u8) -> Value {
    unsafe { ptr::read(body as *const Value) }
}

#[inline(always)]
pub fn sym_bytes<'a>(body: *mut u8) -> &'a [u8] {
    let name = sym_name(body);
    valtypck!(name ; String);
    str_bytes(unsafe { name.data.obj })
}

// **********************************************************
// * Reference extraction
// **********************************************************

/// Per-type callback handing the collector the address of every
/// traceable value slot inside an object body, each exactly once
pub type RefExtract = unsafe fn(body: *mut u8, out: &mut DenseVec<*mut Value>);

unsafe fn extract_cons(body: *mut u8, out: &mut DenseVec<*mut Value>) {
    out.push(body as *mut Value);
    out.push((body as *mut Value).add(1));
}

unsafe fn extract_sym(body: *mut u8, out: &mut DenseVec<*mut Value>) {
    out.push(body as *mut Value);
}

/// Extractor registry, indexed by object kind; leaf types carry no
/// traceable slots. User functions are arena-resident and so never
/// appear here.
pub const REF_EXTRACTORS: [Option<RefExtract>; 3] = [
    Some(extract_cons), // Cons
    None,               // Str
    Some(extract_sym),  // Sym
];

#[inline(always)]
pub fn extractor_for(kind: ObjKind) -> Option<RefExtract> {
    REF_EXTRACTORS[kind as u8 as usize]
}

// **********************************************************
// * User functions (arena-resident)
// **********************************************************

/// Marks a lambda body element holding an inline atom token rather
/// than a sub-expression id
pub const BODY_ATOM: usize = usize::MAX;

/// A parameter name: a slice of the source buffer
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ParamName {
    pub ptr: *const u8,
    pub len: usize,
}

impl ParamName {
    #[inline(always)]
    pub fn text(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

/// One element of a lambda body: a sub-expression id, or an inline
/// atom token when `child_id` is `BODY_ATOM`
#[derive(Clone, Copy)]
#[repr(C)]
pub struct BodyElem {
    pub child_id: usize,
    pub tok: Token,
}

/// A user function: captured definition scope plus trailing arrays
/// of parameter names and body elements
///
/// Lives in the VM arena, so it is stable for the interpreter's
/// lifetime and carries no collector-traceable slots.
#[repr(C)]
pub struct Lambda {
    pub scope: *mut SymTab,
    pub nparams: u16,
    pub nbody: u16,
}

const LAMBDA_HEAD: usize = mem::size_of::<Lambda>();

/// Builds a lambda in the given arena; null on out-of-memory
pub fn lambda_init(
    arena: &mut Arena,
    scope: *mut SymTab,
    params: &[ParamName],
    body: &[BodyElem],
) -> *const Lambda {
    let size = LAMBDA_HEAD
        + params.len() * mem::size_of::<ParamName>()
        + body.len() * mem::size_of::<BodyElem>();

    let base = arena.alloc(size);
    if base.is_null() {
        return ptr::null();
    }

    unsafe {
        let head = base as *mut Lambda;
        ptr::write(
            head,
            Lambda {
                scope,
                nparams: params.len() as u16,
                nbody: body.len() as u16,
            },
        );

        let pbase = base.add(LAMBDA_HEAD) as *mut ParamName;
        for (i, p) in params.iter().enumerate() {
            ptr::write(pbase.add(i), *p);
        }

        let bbase = pbase.add(params.len()) as *mut BodyElem;
        for (i, b) in body.iter().enumerate() {
            ptr::write(bbase.add(i), *b);
        }

        head
    }
}

#[inline(always)]
pub fn lambda_param(l: *const Lambda, idx: u16) -> ParamName {
    unsafe {
        debug_assert!(idx < (*l).nparams);
        let pbase = (l as *const u8).add(LAMBDA_HEAD) as *const ParamName;
        ptr::read(pbase.add(idx as usize))
    }
}

#[inline(always)]
pub fn lambda_body_elem(l: *const Lambda, idx: u16) -> BodyElem {
    unsafe {
        debug_assert!(idx < (*l).nbody);
        let bbase = (l as *const u8)
            .add(LAMBDA_HEAD + (*l).nparams as usize * mem::size_of::<ParamName>())
            as *const BodyElem;
        ptr::read(bbase.add(idx as usize))
    }
}

// **********************************************************
// * Equality
// **********************************************************

/// Identity-flavored equality: numbers and booleans by value,
/// symbols by name, heap structures by location
pub fn core_eq(fst: &Value, snd: &Value) -> bool {
    if fst.kind != snd.kind {
        return false;
    }
    unsafe {
        match fst.kind {
            ValueKind::Undefined => true,
            ValueKind::Integer => fst.data.int_ == snd.data.int_,
            ValueKind::Float => fst.data.float_ == snd.data.float_,
            ValueKind::Bool => fst.data.bool_ == snd.data.bool_,
            ValueKind::Symbol => sym_bytes(fst.data.obj) == sym_bytes(snd.data.obj),
            ValueKind::String | ValueKind::List => fst.data.obj == snd.data.obj,
            ValueKind::Function => fst.data.func == snd.data.func,
            ValueKind::Builtin => fst.data.bltn == snd.data.bltn,
            ValueKind::Promise => false,
        }
    }
}

/// Structural equality: strings by contents, lists element-wise;
/// undefined on cyclic arguments, like the classic Lisps
pub fn core_equal(fst: &Value, snd: &Value) -> bool {
    if fst.kind != snd.kind {
        return false;
    }
    unsafe {
        match fst.kind {
            ValueKind::String => str_bytes(fst.data.obj) == str_bytes(snd.data.obj),
            ValueKind::List => {
                let mut a = *fst;
                let mut b = *snd;
                loop {
                    match (a.is_pair(), b.is_pair()) {
                        (false, false) => return core_equal_leaf(&a, &b),
                        (true, true) => {
                            let (pa, pb) = (a.data.obj, b.data.obj);
                            if !core_equal(&cons_car(pa), &cons_car(pb)) {
                                return false;
                            }
                            a = cons_cdr(pa);
                            b = cons_cdr(pb);
                        }
                        _ => return false,
                    }
                }
            }
            _ => core_eq(fst, snd),
        }
    }
}

fn core_equal_leaf(a: &Value, b: &Value) -> bool {
    if a.kind == ValueKind::List && b.kind == ValueKind::List {
        a.is_nil() && b.is_nil()
    } else {
        core_equal(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::super::memmgt::{Gc, GcConfig};
    use super::*;

    fn small_gc() -> Box<Gc> {
        Box::new(Gc::new(GcConfig::default()).unwrap())
    }

    #[test]
    fn cons_laws() {
        let mut gc = small_gc();
        let gp: *mut Gc = &mut *gc;

        let x = Value::integer(7);
        let y = Value::float(1.5);
        let cell = cons_init(gp, x, y);
        assert!(!cell.is_null());

        assert!(core_eq(&cons_car(cell), &x));
        assert!(core_eq(&cons_cdr(cell), &y));
    }

    #[test]
    fn strings_and_symbols() {
        let mut gc = small_gc();
        let gp: *mut Gc = &mut *gc;

        let s = str_init(gp, b"hello");
        assert_eq!(str_len(s), 5);
        assert_eq!(str_bytes(s), b"hello");

        let sym = sym_init(gp, b"lambda");
        assert_eq!(sym_bytes(sym), b"lambda");

        let a = Value::symbol(sym);
        let b = Value::symbol(sym_init(gp, b"lambda"));
        assert!(core_eq(&a, &b));
    }

    #[test]
    fn equality_flavours() {
        let mut gc = small_gc();
        let gp: *mut Gc = &mut *gc;

        let l1 = Value::list(cons_init(gp, Value::integer(1), Value::nil()));
        let l2 = Value::list(cons_init(gp, Value::integer(1), Value::nil()));

        assert!(!core_eq(&l1, &l2));
        assert!(core_equal(&l1, &l2));

        assert!(!core_equal(&Value::integer(1), &Value::float(1.0)));
        assert!(core_equal(&Value::nil(), &Value::nil()));
        assert!(core_eq(&Value::nil(), &Value::nil()));
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&Value::boolean(false)));
        assert!(!truthy(&Value::nil()));
        assert!(!truthy(&Value::undefined()));
        assert!(truthy(&Value::integer(0)));
        assert!(truthy(&Value::boolean(true)));
    }

    #[test]
    fn extractor_registry_shape() {
        assert!(extractor_for(ObjKind::Cons).is_some());
        assert!(extractor_for(ObjKind::Str).is_none());
        assert!(extractor_for(ObjKind::Sym).is_some());
    }

    #[test]
    fn lambda_layout() {
        let mut arena = Arena::new(1024);
        let name = b"x";
        let params = [ParamName {
            ptr: name.as_ptr(),
            len: 1,
        }];
        let body = [BodyElem {
            child_id: 4,
            tok: Token {
                kind: super::super::lexer::TokenKind::Ignored,
                value: ptr::null(),
                len: 0,
                sexpr_id: 0,
            },
        }];

        let l = lambda_init(&mut arena, ptr::null_mut(), &params, &body);
        assert!(!l.is_null());
        unsafe {
            assert_eq!((*l).nparams, 1);
            assert_eq!((*l).nbody, 1);
        }
        assert_eq!(lambda_param(l, 0).text(), b"x");
        assert_eq!(lambda_body_elem(l, 0).child_id, 4);
    }
}
