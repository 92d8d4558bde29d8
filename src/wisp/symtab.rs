// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/symtab.rs

// Scope-chained symbol table. Buckets of chained bindings, FNV-1a
// hashing, arena-interned names, const discipline on definition and
// assignment, and a closure refcount that keeps captured scopes
// alive past their pop.

// <>

use super::arena::Arena;
use super::core::{Value, ValueKind};
use super::memmgt::Gc;
use super::ErrCode;

use std::mem;
use std::ptr;

pub const FLAG_CONST: u8 = 1 << 0;
pub const FLAG_MUTABLE: u8 = 1 << 1;
pub const FLAG_GLOBAL: u8 = 1 << 2;
pub const FLAG_EXPORTED: u8 = 1 << 3;
pub const FLAG_TEMPORARY: u8 = 1 << 4;

// rehash past three quarters full
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

/// One name binding; lives in the scope's arena, so its value slot
/// address is stable and can be registered as a collector root
#[repr(C)]
pub struct Binding {
    pub name: *const u8,
    pub name_len: u16,
    pub hash: u32,
    pub kind: ValueKind,
    pub flags: u8,
    pub value: Value,
    pub next: *mut Binding,
}

impl Binding {
    #[inline(always)]
    pub fn name_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.name, self.name_len as usize) }
    }

    #[inline(always)]
    pub fn is_const(&self) -> bool {
        self.flags & FLAG_CONST != 0
    }
}

/// One lexical scope: a power-of-two bucket array plus a parent link
#[repr(C)]
pub struct SymTab {
    buckets: *mut *mut Binding,
    bucket_count: usize,
    count: usize,
    pub depth: u32,
    closure_rc: u32,
    pub parent: *mut SymTab,
    arena: *mut Arena,
    gc: *mut Gc,
}

/// FNV-1a over the name bytes
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811C9DC5;
    for b in bytes {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    h
}

impl SymTab {
    /// Allocates a scope in the given arena; null on exhaustion
    pub fn new(
        initial_capacity: usize,
        parent: *mut SymTab,
        arena: *mut Arena,
        gc: *mut Gc,
    ) -> *mut SymTab {
        let bucket_count = initial_capacity.next_power_of_two().max(8);
        unsafe {
            let st = (*arena).alloc(mem::size_of::<SymTab>()) as *mut SymTab;
            if st.is_null() {
                return ptr::null_mut();
            }

            let buckets =
                (*arena).alloc(bucket_count * mem::size_of::<*mut Binding>()) as *mut *mut Binding;
            if buckets.is_null() {
                return ptr::null_mut();
            }
            for i in 0..bucket_count {
                ptr::write(buckets.add(i), ptr::null_mut());
            }

            let depth = if parent.is_null() {
                0
            } else {
                (*parent).depth + 1
            };

            ptr::write(
                st,
                SymTab {
                    buckets,
                    bucket_count,
                    count: 0,
                    depth,
                    closure_rc: 0,
                    parent,
                    arena,
                    gc,
                },
            );

            st
        }
    }

    #[inline(always)]
    fn bucket(&self, hash: u32) -> usize {
        hash as usize & (self.bucket_count - 1)
    }

    fn find_local(&self, name: &[u8], hash: u32) -> *mut Binding {
        let mut b = unsafe { ptr::read(self.buckets.add(self.bucket(hash))) };
        while !b.is_null() {
            unsafe {
                if (*b).hash == hash && (*b).name_bytes() == name {
                    return b;
                }
                b = (*b).next;
            }
        }
        ptr::null_mut()
    }

    /// Finds a binding in this scope only
    pub fn lookup_local(&self, name: &[u8]) -> *mut Binding {
        self.find_local(name, fnv1a(name))
    }

    /// Finds a binding anywhere along the scope chain
    pub fn lookup(&self, name: &[u8]) -> *mut Binding {
        let hash = fnv1a(name);
        let mut st: *const SymTab = self;
        while !st.is_null() {
            let b = unsafe { (*st).find_local(name, hash) };
            if !b.is_null() {
                return b;
            }
            st = unsafe { (*st).parent };
        }
        ptr::null_mut()
    }

    pub fn exists(&self, name: &[u8]) -> bool {
        !self.lookup(name).is_null()
    }

    /// Bindings in this scope, parents excluded
    pub fn size(&self) -> usize {
        self.count
    }

    /// Defines `name` in this scope, or updates a non-const binding
    /// already present here
    pub fn define(
        &mut self,
        name: &[u8],
        kind: ValueKind,
        value: Value,
        flags: u8,
    ) -> Result<*mut Binding, ErrCode> {
        let hash = fnv1a(name);

        let existing = self.find_local(name, hash);
        if !existing.is_null() {
            unsafe {
                if (*existing).is_const() {
                    eprintln!(
                        "Error: constant binding '{}' cannot be redefined",
                        String::from_utf8_lossy(name)
                    );
                    return Err(ErrCode::ConstViolation);
                }
                (*existing).kind = kind;
                (*existing).value = value;
                (*existing).flags = flags;
                return Ok(existing);
            }
        }

        if (self.count + 1) * LOAD_DEN > self.bucket_count * LOAD_NUM {
            self.rehash()?;
        }

        unsafe {
            let b = (*self.arena).alloc(mem::size_of::<Binding>()) as *mut Binding;
            if b.is_null() {
                return Err(ErrCode::OutOfMemory);
            }

            // intern the name into this scope's arena
            let nm = (*self.arena).alloc(name.len().max(1));
            if nm.is_null() {
                return Err(ErrCode::OutOfMemory);
            }
            ptr::copy_nonoverlapping(name.as_ptr(), nm, name.len());

            let idx = self.bucket(hash);
            ptr::write(
                b,
                Binding {
                    name: nm,
                    name_len: name.len() as u16,
                    hash,
                    kind,
                    flags,
                    value,
                    next: ptr::read(self.buckets.add(idx)),
                },
            );
            ptr::write(self.buckets.add(idx), b);
            self.count += 1;

            (*self.gc).root_span(&mut (*b).value, 1);

            Ok(b)
        }
    }

    fn rehash(&mut self) -> Result<(), ErrCode> {
        let new_count = self.bucket_count * 2;
        unsafe {
            let buckets =
                (*self.arena).alloc(new_count * mem::size_of::<*mut Binding>()) as *mut *mut Binding;
            if buckets.is_null() {
                return Err(ErrCode::OutOfMemory);
            }
            for i in 0..new_count {
                ptr::write(buckets.add(i), ptr::null_mut());
            }

            for i in 0..self.bucket_count {
                let mut b = ptr::read(self.buckets.add(i));
                while !b.is_null() {
                    let next = (*b).next;
                    let idx = (*b).hash as usize & (new_count - 1);
                    (*b).next = ptr::read(buckets.add(idx));
                    ptr::write(buckets.add(idx), b);
                    b = next;
                }
            }

            self.buckets = buckets;
            self.bucket_count = new_count;
        }
        Ok(())
    }

    /// Assigns through the scope chain; the first binding found is
    /// updated in its defining scope
    pub fn set(&mut self, name: &[u8], kind: ValueKind, value: Value) -> Result<(), ErrCode> {
        let hash = fnv1a(name);
        let mut st: *mut SymTab = self;
        while !st.is_null() {
            let b = unsafe { (*st).find_local(name, hash) };
            if !b.is_null() {
                unsafe {
                    if (*b).is_const() {
                        eprintln!(
                            "Error: constant binding '{}' cannot be assigned",
                            String::from_utf8_lossy(name)
                        );
                        return Err(ErrCode::ConstViolation);
                    }
                    (*b).kind = kind;
                    (*b).value = value;
                }
                return Ok(());
            }
            st = unsafe { (*st).parent };
        }
        Err(ErrCode::NotFound)
    }

    /// Unlinks a binding from this scope
    pub fn remove(&mut self, name: &[u8]) -> Result<(), ErrCode> {
        let hash = fnv1a(name);
        let idx = self.bucket(hash);
        unsafe {
            let mut prev: *mut *mut Binding = self.buckets.add(idx);
            let mut b = ptr::read(prev);
            while !b.is_null() {
                if (*b).hash == hash && (*b).name_bytes() == name {
                    ptr::write(prev, (*b).next);
                    (*self.gc).unroot_span(&mut (*b).value, 1);
                    self.count -= 1;
                    return Ok(());
                }
                prev = &mut (*b).next;
                b = (*b).next;
            }
        }
        Err(ErrCode::NotFound)
    }

    /// Logs every binding in this scope
    pub fn dump(&self) {
        for i in 0..self.bucket_count {
            let mut b = unsafe { ptr::read(self.buckets.add(i)) };
            while !b.is_null() {
                unsafe {
                    log::debug!(
                        "binding '{}' kind {:?} flags {:#04b} depth {}",
                        String::from_utf8_lossy((*b).name_bytes()),
                        (*b).kind,
                        (*b).flags,
                        self.depth
                    );
                    b = (*b).next;
                }
            }
        }
    }
}

/// Creates a child scope that borrows the parent's arena
pub fn push_scope(parent: *mut SymTab) -> *mut SymTab {
    unsafe { SymTab::new(8, parent, (*parent).arena, (*parent).gc) }
}

/// Creates a child scope with its own arena, for heavy-churn blocks
pub fn push_scope_in(parent: *mut SymTab, arena: *mut Arena) -> *mut SymTab {
    unsafe { SymTab::new(8, parent, arena, (*parent).gc) }
}

/// Leaves a scope, returning its parent
///
/// Bindings are unregistered from the root set unless a closure
/// still holds the scope, in which case it stays intact.
pub fn pop_scope(st: *mut SymTab) -> *mut SymTab {
    unsafe {
        if (*st).closure_rc == 0 {
            for i in 0..(*st).bucket_count {
                let mut b = ptr::read((*st).buckets.add(i));
                while !b.is_null() {
                    (*(*st).gc).unroot_span(&mut (*b).value, 1);
                    b = (*b).next;
                }
            }
        }
        (*st).parent
    }
}

/// Records a closure capturing this scope
///
/// Claims are never relinquished: closures live in the VM arena for
/// the interpreter's lifetime, so a claimed scope stays intact from
/// its first capture onward.
pub fn retain_frame(st: *mut SymTab) {
    unsafe { (*st).closure_rc += 1 }
}

#[cfg(test)]
mod tests {
    use super::super::core::{str_bytes, str_init};
    use super::super::memmgt::GcConfig;
    use super::*;

    struct Fixture {
        arena: Box<Arena>,
        gc: Box<Gc>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                arena: Box::new(Arena::new(64 * 1024)),
                gc: Box::new(Gc::new(GcConfig::default()).unwrap()),
            }
        }

        fn global(&mut self) -> *mut SymTab {
            SymTab::new(8, ptr::null_mut(), &mut *self.arena, &mut *self.gc)
        }
    }

    #[test]
    fn fnv1a_known_vector() {
        assert_eq!(fnv1a(b""), 0x811C9DC5);
        assert_eq!(fnv1a(b"hello"), 0x4F9F2CAB);
    }

    #[test]
    fn define_lookup_shadow() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            (*g).define(b"x", ValueKind::Integer, Value::integer(1), FLAG_MUTABLE)
                .unwrap();

            let child = push_scope(g);
            (*child)
                .define(b"x", ValueKind::Integer, Value::integer(2), FLAG_MUTABLE)
                .unwrap();

            // the shadow wins along the chain; the parent is intact
            assert_eq!((*(*child).lookup(b"x")).value.data.int_, 2);
            assert_eq!((*(*g).lookup(b"x")).value.data.int_, 1);

            // local lookup ignores parents
            assert!((*child).lookup_local(b"x") != (*g).lookup_local(b"x"));
            assert!((*child).lookup_local(b"y").is_null());
            assert!((*child).lookup(b"y").is_null());
        }
    }

    #[test]
    fn set_reaches_defining_scope() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            (*g).define(b"n", ValueKind::Integer, Value::integer(10), FLAG_MUTABLE)
                .unwrap();
            let child = push_scope(g);

            // no local binding: assignment lands on the parent
            (*child)
                .set(b"n", ValueKind::Integer, Value::integer(20))
                .unwrap();
            assert_eq!((*(*g).lookup_local(b"n")).value.data.int_, 20);
            assert_eq!((*child).size(), 0);

            assert_eq!(
                (*child).set(b"missing", ValueKind::Integer, Value::integer(0)),
                Err(ErrCode::NotFound)
            );
        }
    }

    #[test]
    fn const_discipline() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            (*g).define(b"pi", ValueKind::Float, Value::float(3.14), FLAG_CONST)
                .unwrap();

            assert_eq!(
                (*g).define(b"pi", ValueKind::Float, Value::float(2.71), FLAG_CONST),
                Err(ErrCode::ConstViolation)
            );
            assert_eq!(
                (*g).set(b"pi", ValueKind::Float, Value::float(2.71)),
                Err(ErrCode::ConstViolation)
            );

            // the original value is untouched
            assert_eq!((*(*g).lookup(b"pi")).value.data.float_, 3.14);
        }
    }

    #[test]
    fn set_string_uses_value_length() {
        let mut fx = Fixture::new();
        let gp: *mut Gc = &mut *fx.gc;
        let g = fx.global();
        unsafe {
            let short = Value::string(str_init(gp, b"ab"));
            (*g).define(b"s", ValueKind::String, short, FLAG_MUTABLE)
                .unwrap();

            // the replacement carries its own, longer contents intact
            let long = Value::string(str_init(gp, b"abcdefgh"));
            (*g).set(b"s", ValueKind::String, long).unwrap();

            let got = (*(*g).lookup(b"s")).value;
            assert_eq!(str_bytes(got.data.obj), b"abcdefgh");
        }
    }

    #[test]
    fn remove_and_exists() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            (*g).define(b"tmp", ValueKind::Integer, Value::integer(1), FLAG_TEMPORARY)
                .unwrap();
            assert!((*g).exists(b"tmp"));
            assert_eq!((*g).size(), 1);

            (*g).remove(b"tmp").unwrap();
            assert!(!(*g).exists(b"tmp"));
            assert_eq!((*g).size(), 0);
            assert_eq!((*g).remove(b"tmp"), Err(ErrCode::NotFound));
        }
    }

    #[test]
    fn rehash_preserves_bindings() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            for i in 0..100u32 {
                let name = format!("sym{}", i);
                (*g).define(
                    name.as_bytes(),
                    ValueKind::Integer,
                    Value::integer(i as i64),
                    FLAG_MUTABLE,
                )
                .unwrap();
            }
            assert_eq!((*g).size(), 100);
            for i in 0..100u32 {
                let name = format!("sym{}", i);
                let b = (*g).lookup(name.as_bytes());
                assert!(!b.is_null());
                assert_eq!((*b).value.data.int_, i as i64);
            }
        }
    }

    #[test]
    fn retained_scope_survives_pop() {
        let mut fx = Fixture::new();
        let g = fx.global();
        unsafe {
            let child = push_scope(g);
            (*child)
                .define(b"captured", ValueKind::Integer, Value::integer(5), FLAG_MUTABLE)
                .unwrap();

            retain_frame(child);
            let parent = pop_scope(child);
            assert_eq!(parent, g);

            // the closure can still read through the popped scope
            assert_eq!((*(*child).lookup(b"captured")).value.data.int_, 5);
        }
    }
}
