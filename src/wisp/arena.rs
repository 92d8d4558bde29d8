// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/arena.rs

// Chained bump allocator backing compile-time and per-evaluation
// scratch data. Pointers handed out remain valid until the arena is
// dropped.

// <>

use std::alloc;
use std::ptr;

const ALIGN: usize = std::mem::size_of::<*mut u8>();

/// One contiguous node in an arena chain
#[repr(C)]
struct Chunk {
    base: *mut u8,
    capacity: usize,
    offset: usize,
    next: *mut Chunk,
}

/// Monotonic bump allocator with chained growth
///
/// Exhausting the current node links in a fresh node of capacity
/// `max(request, current capacity)`. All nodes are released together
/// when the arena is dropped.
pub struct Arena {
    /// Most recently added node; allocation always bumps here
    head: *mut Chunk,
    /// First node ever created; chain traversal starts here
    first: *mut Chunk,
}

fn chunk_create(capacity: usize) -> *mut Chunk {
    unsafe {
        let layout = alloc::Layout::from_size_align_unchecked(capacity, ALIGN);
        let base = alloc::alloc(layout);
        if base.is_null() {
            return ptr::null_mut();
        }

        let node = Box::into_raw(Box::new(Chunk {
            base,
            capacity,
            offset: 0,
            next: ptr::null_mut(),
        }));

        node
    }
}

unsafe fn chunk_destroy(node: *mut Chunk) {
    let layout = alloc::Layout::from_size_align_unchecked((*node).capacity, ALIGN);
    alloc::dealloc((*node).base, layout);
    drop(Box::from_raw(node));
}

impl Arena {
    /// Creates an arena with a single node of the given capacity
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        let node = chunk_create(capacity);
        if node.is_null() {
            alloc::handle_alloc_error(unsafe {
                alloc::Layout::from_size_align_unchecked(capacity, ALIGN)
            });
        }

        Arena {
            head: node,
            first: node,
        }
    }

    /// Bump-allocates `size` bytes, aligned to the pointer size
    ///
    /// Returns null if the request is zero or host memory is
    /// exhausted; the returned pointer is stable across subsequent
    /// allocations.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        unsafe {
            let cur = self.head;
            let aligned = ((*cur).offset + (ALIGN - 1)) & !(ALIGN - 1);

            if aligned + size > (*cur).capacity {
                let grown = if size > (*cur).capacity {
                    size
                } else {
                    (*cur).capacity
                };

                let node = chunk_create(grown);
                if node.is_null() {
                    return ptr::null_mut();
                }

                (*self.head).next = node;
                self.head = node;

                (*node).offset = size;
                return (*node).base;
            }

            (*cur).offset = aligned + size;
            (*cur).base.add(aligned)
        }
    }

    /// Rewinds the current node's offset; earlier nodes in the chain
    /// are untouched and their contents stay reachable
    pub fn reset(&mut self) {
        unsafe { (*self.head).offset = 0 }
    }

    /// Bytes currently handed out from the active node
    pub fn used(&self) -> usize {
        unsafe { (*self.head).offset }
    }

    /// Capacity of the active node
    pub fn capacity(&self) -> usize {
        unsafe { (*self.head).capacity }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let mut node = self.first;
            while !node.is_null() {
                let next = (*node).next;
                chunk_destroy(node);
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_align() {
        let mut arena = Arena::new(256);

        let a = arena.alloc(3);
        let b = arena.alloc(8);
        assert!(!a.is_null());
        assert!(!b.is_null());

        assert_eq!(b as usize % ALIGN, 0);
        assert!(b as usize >= a as usize + 3);
    }

    #[test]
    fn pointers_stable_across_growth() {
        let mut arena = Arena::new(64);

        let early = arena.alloc(32);
        unsafe { ptr::write(early, 0xAB) };

        // force several growth steps
        for _ in 0..16 {
            assert!(!arena.alloc(48).is_null());
        }

        assert_eq!(unsafe { ptr::read(early) }, 0xAB);
    }

    #[test]
    fn oversize_request_gets_own_node() {
        let mut arena = Arena::new(64);

        let big = arena.alloc(1024);
        assert!(!big.is_null());
        assert_eq!(arena.capacity(), 1024);
    }

    #[test]
    fn reset_rewinds_current_node() {
        let mut arena = Arena::new(128);

        arena.alloc(40);
        assert!(arena.used() >= 40);

        arena.reset();
        assert_eq!(arena.used(), 0);

        let p = arena.alloc(8);
        assert!(!p.is_null());
    }

    #[test]
    fn zero_size_returns_null() {
        let mut arena = Arena::new(64);
        assert!(arena.alloc(0).is_null());
    }
}
