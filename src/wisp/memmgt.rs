// Wisp, an annotation-driven Lisp interpreter.
// Copyright (C) 2025 Wisp contributors

// Wisp is licensed under the terms of the MIT License. See the top
// level LICENSE file for the license text.

// <>

// src/wisp/memmgt.rs

// Memory management for runtime values. Carves one host allocation
// into Eden, two survivor spaces and an old generation, allocates by
// bumping, and reclaims with a copying minor collection plus a
// sliding mark-compact major collection.

// <>

use super::core::{extractor_for, value_heap_body, ObjKind, Value};
use super::vec::DenseVec;

use std::alloc;
use std::mem;
use std::ptr;

pub const DEFAULT_ALIGN: usize = 16;
pub const HEADER_LEN: usize = mem::size_of::<GcInfo>();

const GEN_NURSERY: u8 = 0;
const GEN_OLD: u8 = 1;
const GEN_MARK: u8 = 2;

/// Fixed prefix on every heap object
#[repr(C)]
pub struct GcInfo {
    pub gen: u8,
    pub age: u8,
    pub kind: u8,
    _pad: u8,
    /// Total size including this header, rounded up to the alignment
    pub size: u32,
    /// Null except while the object is being moved
    pub forwarding: *mut u8,
}

/// A contiguous memory range; `end` is exclusive
#[derive(Clone, Copy)]
struct MemRegion {
    start: *mut u8,
    end: *mut u8,
}

impl MemRegion {
    #[inline(always)]
    fn contains(&self, p: *mut u8) -> bool {
        p >= self.start && p < self.end
    }
}

/// Young generation: Eden plus two survivor semi-spaces
struct Nursery {
    eden: MemRegion,
    s0: MemRegion,
    s1: MemRegion,
    /// Which survivor receives the next evacuation
    to_space_is_s0: bool,
    /// Eden bump pointer
    bump: *mut u8,
    /// Top of the survivor currently holding live objects
    survivor_top: *mut u8,
}

/// Old generation: plain bump allocation, compacted by major GC
struct OldGen {
    region: MemRegion,
    bump: *mut u8,
}

struct Heap {
    nursery: Nursery,
    old: OldGen,
    block: *mut u8,
    layout: alloc::Layout,
}

/// Heap geometry; all sizes in bytes
#[derive(Clone, Copy)]
pub struct GcConfig {
    pub eden_size: usize,
    pub survivor_size: usize,
    pub old_size: usize,
    pub align: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            eden_size: 2 * 1024 * 1024,
            survivor_size: 1024 * 1024,
            old_size: 2 * 1024 * 1024,
            align: DEFAULT_ALIGN,
        }
    }
}

/// A run of root value slots the collector must trace and rewrite
#[derive(Clone, Copy, PartialEq)]
struct RootSpan {
    ptr: *mut Value,
    len: usize,
}

/// The collector: heap, root registry and tunables
pub struct Gc {
    heap: Heap,
    roots: DenseVec<RootSpan>,
    promotion_age_threshold: u8,
    collection_in_progress: bool,
    minor_count: u64,
    major_count: u64,
}

#[inline(always)]
fn align_up(n: usize, a: usize) -> usize {
    (n + (a - 1)) & !(a - 1)
}

#[inline(always)]
pub fn header_of(body: *mut u8) -> *mut GcInfo {
    unsafe { body.sub(HEADER_LEN) as *mut GcInfo }
}

#[inline(always)]
fn body_of(hdr: *mut u8) -> *mut u8 {
    unsafe { hdr.add(HEADER_LEN) }
}

impl Gc {
    /// Acquires and subdivides the heap block; None if the host
    /// allocator refuses
    pub fn new(cfg: GcConfig) -> Option<Self> {
        let align = if cfg.align == 0 || !cfg.align.is_power_of_two() {
            DEFAULT_ALIGN
        } else {
            cfg.align
        };

        let total = cfg.eden_size + 2 * cfg.survivor_size + cfg.old_size;
        let layout = alloc::Layout::from_size_align(total, align).ok()?;
        let block = unsafe { alloc::alloc(layout) };
        if block.is_null() {
            return None;
        }

        let mut p = block;
        let mut take = |size: usize| {
            let r = MemRegion {
                start: p,
                end: unsafe { p.add(size) },
            };
            p = r.end;
            r
        };

        let eden = take(cfg.eden_size);
        let s0 = take(cfg.survivor_size);
        let s1 = take(cfg.survivor_size);
        let old = take(cfg.old_size);

        Some(Gc {
            heap: Heap {
                nursery: Nursery {
                    eden,
                    s0,
                    s1,
                    to_space_is_s0: true,
                    bump: eden.start,
                    survivor_top: s1.start,
                },
                old: OldGen {
                    region: old,
                    bump: old.start,
                },
                block,
                layout,
            },
            roots: DenseVec::new(64),
            promotion_age_threshold: 3,
            collection_in_progress: false,
            minor_count: 0,
            major_count: 0,
        })
    }

    // ------------------------- roots -------------------------

    /// Registers a run of value slots as roots
    pub fn root_span(&mut self, ptr: *mut Value, len: usize) {
        if len > 0 {
            self.roots.push(RootSpan { ptr, len });
        }
    }

    /// Removes a previously registered run
    pub fn unroot_span(&mut self, ptr: *mut Value, len: usize) {
        self.roots.delete_first(&RootSpan { ptr, len });
    }

    /// Registers a single slot, stack-wise
    #[inline(always)]
    pub fn push_root(&mut self, slot: *mut Value) {
        self.roots.push(RootSpan { ptr: slot, len: 1 });
    }

    /// Pops the `n` most recently pushed slots
    #[inline(always)]
    pub fn pop_roots(&mut self, n: usize) {
        for _ in 0..n {
            self.roots.pop_discard();
        }
    }

    // ----------------------- allocation ----------------------

    fn from_survivor(&self) -> MemRegion {
        if self.heap.nursery.to_space_is_s0 {
            self.heap.nursery.s1
        } else {
            self.heap.nursery.s0
        }
    }

    fn to_survivor(&self) -> MemRegion {
        if self.heap.nursery.to_space_is_s0 {
            self.heap.nursery.s0
        } else {
            self.heap.nursery.s1
        }
    }

    #[inline(always)]
    fn in_from_space(&self, hdr: *mut u8) -> bool {
        self.heap.nursery.eden.contains(hdr) || self.from_survivor().contains(hdr)
    }

    #[inline(always)]
    pub fn in_old(&self, body: *mut u8) -> bool {
        self.heap.old.region.contains(body)
    }

    fn place(hdr: *mut u8, total: usize, kind: ObjKind, gen: u8) -> *mut u8 {
        unsafe {
            ptr::write(
                hdr as *mut GcInfo,
                GcInfo {
                    gen,
                    age: 0,
                    kind: kind as u8,
                    _pad: 0,
                    size: total as u32,
                    forwarding: ptr::null_mut(),
                },
            );
            let body = body_of(hdr);
            if cfg!(feature = "zeromem") {
                ptr::write_bytes(body, 0, total - HEADER_LEN);
            }
            body
        }
    }

    /// Nursery allocation with the full fallback ladder: minor
    /// collection, then the old generation, then a major collection.
    /// Null when every avenue is exhausted.
    pub fn alloc_nursery(&mut self, body_size: usize, kind: ObjKind) -> *mut u8 {
        if body_size == 0 {
            return ptr::null_mut();
        }

        let total = align_up(HEADER_LEN + body_size, DEFAULT_ALIGN);

        let n = &mut self.heap.nursery;
        if (n.eden.end as usize - n.bump as usize) < total {
            self.minor_collect();

            let n = &mut self.heap.nursery;
            if (n.eden.end as usize - n.bump as usize) < total {
                // Eden still cramped; place the object in the old
                // generation instead
                return self.alloc_old(body_size, kind);
            }
        }

        let n = &mut self.heap.nursery;
        let hdr = n.bump;
        n.bump = unsafe { n.bump.add(total) };

        if cfg!(feature = "memdbg") {
            log::trace!("nursery alloc {:?} {} bytes", kind, total);
        }

        Self::place(hdr, total, kind, GEN_NURSERY)
    }

    /// Direct old-generation allocation; triggers a major collection
    /// on exhaustion, then reports out-of-memory with null
    pub fn alloc_old(&mut self, body_size: usize, kind: ObjKind) -> *mut u8 {
        if body_size == 0 {
            return ptr::null_mut();
        }

        let total = align_up(HEADER_LEN + body_size, DEFAULT_ALIGN);

        let o = &mut self.heap.old;
        if (o.region.end as usize - o.bump as usize) < total {
            self.major_collect();

            let o = &mut self.heap.old;
            if (o.region.end as usize - o.bump as usize) < total {
                log::error!("old generation exhausted after major collection");
                return ptr::null_mut();
            }
        }

        let o = &mut self.heap.old;
        let hdr = o.bump;
        o.bump = unsafe { o.bump.add(total) };

        if cfg!(feature = "memdbg") {
            log::trace!("old-gen alloc {:?} {} bytes", kind, total);
        }

        Self::place(hdr, total, kind, GEN_OLD)
    }

    // ---------------------- slot helpers ---------------------

    /// Enqueues the traceable slots of the object at `body`
    fn enqueue_object_slots(body: *mut u8, out: &mut DenseVec<*mut Value>) {
        let hdr = header_of(body);
        let kind = match ObjKind::from_raw(unsafe { (*hdr).kind }) {
            Some(k) => k,
            None => panic!("corrupt object header"),
        };
        if let Some(extract) = extractor_for(kind) {
            unsafe { extract(body, out) };
        }
    }

    /// Runs `f` over the header of every object in `[start, end)`
    fn walk_objects(start: *mut u8, end: *mut u8, mut f: impl FnMut(*mut u8)) {
        let mut p = start;
        while p < end {
            let hdr = p as *mut GcInfo;
            let size = unsafe { (*hdr).size } as usize;
            assert!(size >= HEADER_LEN);
            f(p);
            p = unsafe { p.add(size) };
        }
    }

    fn seed_root_slots(&self, out: &mut DenseVec<*mut Value>) {
        for span in self.roots.as_slice() {
            for i in 0..span.len {
                out.push(unsafe { span.ptr.add(i) });
            }
        }
    }

    // -------------------- minor collection -------------------

    /// Copying collection over Eden and the live survivor space,
    /// with age-based promotion into the old generation
    ///
    /// Works a single worklist of value slots: roots, old-generation
    /// fields, and the fields of every freshly evacuated object all
    /// pass through it, so root rewriting and old-to-young fixups
    /// fall out of the same drain.
    pub fn minor_collect(&mut self) {
        if self.collection_in_progress {
            return;
        }
        self.collection_in_progress = true;
        self.minor_count += 1;

        let to_space = self.to_survivor();
        let mut to_bump = to_space.start;

        let mut worklist: DenseVec<*mut Value> = DenseVec::new(128);
        self.seed_root_slots(&mut worklist);

        // no write barrier: the whole old generation is scanned for
        // references into from-space
        Self::walk_objects(self.heap.old.region.start, self.heap.old.bump, |hdr| {
            Self::enqueue_object_slots(body_of(hdr), &mut worklist);
        });

        let mut copied = 0usize;
        let mut promoted = 0usize;
        let mut overflow = false;

        while let Some(slot) = worklist.pop_copy() {
            let body = match value_heap_body(unsafe { &*slot }) {
                Some(b) => b,
                None => continue,
            };
            let hdr = header_of(body) as *mut u8;

            unsafe {
                let info = hdr as *mut GcInfo;

                if !(*info).forwarding.is_null() {
                    (*slot).data.obj = body_of((*info).forwarding);
                    continue;
                }
                if !self.in_from_space(hdr) {
                    continue;
                }

                let size = (*info).size as usize;
                let new_age = (*info).age + 1;

                // survivor copy while young enough and space remains,
                // else promotion into the old generation
                let dest = if new_age < self.promotion_age_threshold
                    && (to_space.end as usize - to_bump as usize) >= size
                {
                    let d = to_bump;
                    to_bump = to_bump.add(size);
                    ptr::copy_nonoverlapping(hdr, d, size);
                    (*(d as *mut GcInfo)).age = new_age;
                    copied += 1;
                    d
                } else if (self.heap.old.region.end as usize - self.heap.old.bump as usize)
                    >= size
                {
                    let d = self.heap.old.bump;
                    self.heap.old.bump = self.heap.old.bump.add(size);
                    ptr::copy_nonoverlapping(hdr, d, size);
                    (*(d as *mut GcInfo)).gen = GEN_OLD;
                    (*(d as *mut GcInfo)).age = 0;
                    promoted += 1;
                    d
                } else {
                    overflow = true;
                    continue;
                };

                (*info).forwarding = dest;
                let new_body = body_of(dest);
                (*slot).data.obj = new_body;
                Self::enqueue_object_slots(new_body, &mut worklist);
            }
        }

        if overflow {
            // both survivor and old space ran dry mid-evacuation;
            // leave the spaces unflipped so nothing live is reused
            log::error!("survivor and old generation exhausted during minor collection");
            self.collection_in_progress = false;
            return;
        }

        let n = &mut self.heap.nursery;
        n.to_space_is_s0 = !n.to_space_is_s0;
        n.bump = n.eden.start;
        n.survivor_top = to_bump;

        log::debug!(
            "minor collection {}: {} copied, {} promoted",
            self.minor_count,
            copied,
            promoted
        );

        self.collection_in_progress = false;
    }

    // -------------------- major collection -------------------

    /// Sliding compaction over the old generation: mark from roots
    /// and live nursery references, assign forwarding addresses,
    /// rewrite every reference, then slide survivors toward the
    /// region start
    pub fn major_collect(&mut self) {
        if self.collection_in_progress {
            return;
        }
        self.collection_in_progress = true;
        self.major_count += 1;

        let old_start = self.heap.old.region.start;
        let old_bump = self.heap.old.bump;

        // slots outside the old generation that may point into it
        let mut outside_slots: DenseVec<*mut Value> = DenseVec::new(128);
        self.seed_root_slots(&mut outside_slots);

        let n = &self.heap.nursery;
        let from_surv = self.from_survivor();
        Self::walk_objects(n.eden.start, n.bump, |hdr| {
            Self::enqueue_object_slots(body_of(hdr), &mut outside_slots);
        });
        Self::walk_objects(from_surv.start, n.survivor_top, |hdr| {
            Self::enqueue_object_slots(body_of(hdr), &mut outside_slots);
        });

        // mark phase
        let mut worklist = outside_slots.duplicate();
        let mut live = 0usize;
        while let Some(slot) = worklist.pop_copy() {
            let body = match value_heap_body(unsafe { &*slot }) {
                Some(b) => b,
                None => continue,
            };
            let hdr = header_of(body);
            if !self.in_old(body) {
                continue;
            }
            unsafe {
                if (*hdr).gen == GEN_MARK {
                    continue;
                }
                (*hdr).gen = GEN_MARK;
                live += 1;
            }
            Self::enqueue_object_slots(body, &mut worklist);
        }

        // forwarding addresses: live objects slide toward the start
        let mut new_addr = old_start;
        Self::walk_objects(old_start, old_bump, |hdr| unsafe {
            let info = hdr as *mut GcInfo;
            if (*info).gen == GEN_MARK {
                (*info).forwarding = new_addr;
                new_addr = new_addr.add((*info).size as usize);
            }
        });

        // rewrite references: from outside, and from marked objects
        let mut patch = |slot: *mut Value| {
            if let Some(body) = value_heap_body(unsafe { &*slot }) {
                if self.in_old(body) {
                    let fwd = unsafe { (*header_of(body)).forwarding };
                    debug_assert!(!fwd.is_null());
                    unsafe { (*slot).data.obj = body_of(fwd) };
                }
            }
        };

        for slot in outside_slots.as_slice() {
            patch(*slot);
        }
        Self::walk_objects(old_start, old_bump, |hdr| unsafe {
            if (*(hdr as *mut GcInfo)).gen == GEN_MARK {
                let mut slots: DenseVec<*mut Value> = DenseVec::new(4);
                Self::enqueue_object_slots(body_of(hdr), &mut slots);
                for slot in slots.as_slice() {
                    patch(*slot);
                }
            }
        });

        // slide
        Self::walk_objects(old_start, old_bump, |hdr| unsafe {
            let info = hdr as *mut GcInfo;
            if (*info).gen == GEN_MARK {
                let dest = (*info).forwarding;
                let size = (*info).size as usize;
                if dest != hdr {
                    ptr::copy(hdr, dest, size);
                }
                let moved = dest as *mut GcInfo;
                (*moved).gen = GEN_OLD;
                (*moved).forwarding = ptr::null_mut();
            }
        });

        self.heap.old.bump = new_addr;

        log::debug!(
            "major collection {}: {} live objects, {} bytes retained",
            self.major_count,
            live,
            new_addr as usize - old_start as usize
        );

        self.collection_in_progress = false;
    }

    // ----------------------- inspection ----------------------

    pub fn eden_used(&self) -> usize {
        self.heap.nursery.bump as usize - self.heap.nursery.eden.start as usize
    }

    pub fn survivor_used(&self) -> usize {
        self.heap.nursery.survivor_top as usize - self.from_survivor().start as usize
    }

    pub fn old_used(&self) -> usize {
        self.heap.old.bump as usize - self.heap.old.region.start as usize
    }

    pub fn minor_count(&self) -> u64 {
        self.minor_count
    }

    pub fn major_count(&self) -> u64 {
        self.major_count
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.heap.block, self.heap.layout) }
    }
}
