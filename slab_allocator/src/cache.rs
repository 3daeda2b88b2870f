//! Object caches: a name, a slab geometry, optional object callbacks, and
//! three lists of slabs (empty, partial, full) behind the cache's own lock.
//!
//! The `Cache` struct itself lives in buddy-granted memory, so after
//! creation it is only ever reached through raw pointer field projections.
//! The registry's lock guards `links`; everything behind `state` is guarded
//! by the cache's lock; the remaining fields are immutable once published.

use core::fmt;
use core::ptr::{addr_of, addr_of_mut, NonNull};

use spin::Mutex;

use crate::list::{Linked, Links, RawList};
use crate::slab::{Slab, SlabGeometry};
use crate::{CacheError, ObjectCallback, CACHE_LINE_SIZE, CACHE_NAME_LEN};

/// Fixed-capacity cache name, truncated on overflow.
#[derive(Clone, Copy)]
pub(crate) struct CacheName {
    bytes: [u8; CACHE_NAME_LEN],
    len: usize,
}

impl CacheName {
    /// Stores up to `CACHE_NAME_LEN - 1` bytes of `name`, truncating at a
    /// character boundary.
    pub(crate) fn new(name: &str) -> CacheName {
        let mut take = name.len().min(CACHE_NAME_LEN - 1);
        while !name.is_char_boundary(take) {
            take -= 1;
        }
        let mut bytes = [0; CACHE_NAME_LEN];
        bytes[..take].copy_from_slice(&name.as_bytes()[..take]);
        CacheName { bytes, len: take }
    }

    pub(crate) fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl fmt::Debug for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cache of same-sized objects carved from the buddy allocator.
#[repr(C)]
pub(crate) struct Cache {
    links: Links<Cache>,
    name: CacheName,
    geometry: SlabGeometry,
    ctor: Option<ObjectCallback>,
    dtor: Option<ObjectCallback>,
    state: Mutex<CacheState>,
}

impl Linked for Cache {
    unsafe fn links(node: NonNull<Cache>) -> *mut Links<Cache> {
        addr_of_mut!((*node.as_ptr()).links)
    }
}

impl Cache {
    /// Writes a fully initialized cache struct into `storage`. The caller
    /// publishes it afterwards; nothing can observe it half-built.
    ///
    /// # Safety
    ///
    /// `storage` must point to unused memory large and aligned enough for
    /// a `Cache`.
    pub(crate) unsafe fn initialize(
        storage: NonNull<u8>,
        name: CacheName,
        geometry: SlabGeometry,
        ctor: Option<ObjectCallback>,
        dtor: Option<ObjectCallback>,
    ) -> NonNull<Cache> {
        let cache = storage.cast::<Cache>();
        cache.as_ptr().write(Cache {
            links: Links::new(),
            name,
            geometry,
            ctor,
            dtor,
            state: Mutex::new(CacheState {
                empty: RawList::new(),
                partial: RawList::new(),
                full: RawList::new(),
                can_shrink: true,
                dealloc_count: 0,
                color: 0,
                last_error: None,
            }),
        });
        cache
    }

    /// # Safety
    ///
    /// `cache` must point to a live cache; the returned borrow must not
    /// outlive it.
    pub(crate) unsafe fn state<'a>(cache: NonNull<Cache>) -> &'a Mutex<CacheState> {
        &*addr_of!((*cache.as_ptr()).state)
    }

    /// # Safety
    ///
    /// `cache` must point to a live cache.
    pub(crate) unsafe fn geometry(cache: NonNull<Cache>) -> SlabGeometry {
        addr_of!((*cache.as_ptr()).geometry).read()
    }

    /// # Safety
    ///
    /// `cache` must point to a live cache.
    pub(crate) unsafe fn name(cache: NonNull<Cache>) -> CacheName {
        addr_of!((*cache.as_ptr()).name).read()
    }

    /// # Safety
    ///
    /// `cache` must point to a live cache.
    pub(crate) unsafe fn ctor(cache: NonNull<Cache>) -> Option<ObjectCallback> {
        addr_of!((*cache.as_ptr()).ctor).read()
    }

    /// # Safety
    ///
    /// `cache` must point to a live cache.
    pub(crate) unsafe fn dtor(cache: NonNull<Cache>) -> Option<ObjectCallback> {
        addr_of!((*cache.as_ptr()).dtor).read()
    }
}

/// Everything behind the cache lock.
pub(crate) struct CacheState {
    /// Slabs with every slot free.
    pub(crate) empty: RawList<Slab>,
    /// Slabs with some slots allocated and some free.
    pub(crate) partial: RawList<Slab>,
    /// Slabs with every slot allocated.
    pub(crate) full: RawList<Slab>,
    /// One-shot shrink guard: cleared whenever a slab is created, and a
    /// shrink attempt that finds it cleared only re-arms it.
    pub(crate) can_shrink: bool,
    /// Generic-layer frees accepted since the last triggered shrink.
    pub(crate) dealloc_count: usize,
    /// Color offset the next slab will be created with.
    pub(crate) color: usize,
    /// Sticky record of the most recent failure, cleared by success.
    pub(crate) last_error: Option<CacheError>,
}

impl CacheState {
    /// Allocates one object. Prefers a partial slab, then an empty one,
    /// and otherwise creates a new slab from a chunk obtained through
    /// `grab`. Creating a slab clears the shrink guard and advances the
    /// color cursor.
    pub(crate) fn allocate(
        &mut self,
        geometry: &SlabGeometry,
        grab: impl FnOnce(usize) -> Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, CacheError> {
        let (slab, on_partial_list) = if let Some(slab) = self.partial.front() {
            (slab, true)
        } else if let Some(slab) = self.empty.pop_front() {
            (slab, false)
        } else {
            let chunk = match grab(geometry.slab_bytes()) {
                Some(chunk) => chunk,
                None => {
                    self.last_error = Some(CacheError::NoSpace);
                    return Err(CacheError::NoSpace);
                }
            };
            let color = self.advance_color(geometry);
            // SAFETY: the chunk spans slab_bytes() and is block-aligned.
            let slab = unsafe { Slab::initialize(chunk, geometry, color) };
            self.can_shrink = false;
            (slab, false)
        };

        // SAFETY: the slab belongs to this cache and we hold its lock.
        let obj = unsafe { (*slab.as_ptr()).take_object(geometry) }.ok_or(CacheError::NoSpace)?;
        let now_full = unsafe { (*slab.as_ptr()).free_left() } == 0;
        debug_assert!(
            unsafe { (*slab.as_ptr()).clear_bits(geometry) == (*slab.as_ptr()).free_left() },
            "slab bitmap out of sync with its free count"
        );
        // SAFETY: slabs popped or created above are on no list; a slab
        // from `partial` is on exactly that list.
        unsafe {
            match (on_partial_list, now_full) {
                (true, true) => {
                    self.partial.remove(slab);
                    self.full.push_front(slab);
                }
                (true, false) => {}
                (false, true) => self.full.push_front(slab),
                (false, false) => self.partial.push_front(slab),
            }
        }
        self.last_error = None;
        Ok(obj)
    }

    /// Frees `obj` if a partial or full slab owns an allocated object at
    /// that address, running `dtor` on it first. Returns `false`, with no
    /// state change, when no slab does.
    pub(crate) fn try_deallocate(
        &mut self,
        geometry: &SlabGeometry,
        obj: NonNull<u8>,
        dtor: Option<ObjectCallback>,
    ) -> bool {
        let Some((slab, was_full)) = self.find_owner(geometry, obj) else {
            return false;
        };
        if let Some(dtor) = dtor {
            dtor(obj);
        }
        // SAFETY: `find_owner` established that `slab` owns `obj` and we
        // hold the cache lock.
        unsafe {
            (*slab.as_ptr()).give_object(obj, geometry);
        }
        let free_left = unsafe { (*slab.as_ptr()).free_left() };
        debug_assert!(
            unsafe { (*slab.as_ptr()).clear_bits(geometry) } == free_left,
            "slab bitmap out of sync with its free count"
        );
        // SAFETY: `was_full` names the list the slab currently sits on.
        unsafe {
            if free_left == geometry.objects_per_slab {
                if was_full {
                    self.full.remove(slab);
                } else {
                    self.partial.remove(slab);
                }
                self.empty.push_front(slab);
            } else if was_full {
                self.full.remove(slab);
                self.partial.push_front(slab);
            }
        }
        self.last_error = None;
        true
    }

    /// Frees `obj`, recording and returning an invalid-object error if no
    /// slab owns an allocated object at that address.
    pub(crate) fn deallocate(
        &mut self,
        geometry: &SlabGeometry,
        obj: NonNull<u8>,
        dtor: Option<ObjectCallback>,
    ) -> Result<(), CacheError> {
        if self.try_deallocate(geometry, obj, dtor) {
            Ok(())
        } else {
            self.last_error = Some(CacheError::InvalidObject);
            Err(CacheError::InvalidObject)
        }
    }

    /// Releases every empty slab through `give` and returns the number of
    /// blocks freed. If the cache grew since the last attempt, only
    /// re-arms the guard and releases nothing.
    pub(crate) fn shrink(
        &mut self,
        geometry: &SlabGeometry,
        mut give: impl FnMut(NonNull<u8>, usize),
    ) -> usize {
        if !self.can_shrink {
            self.can_shrink = true;
            self.last_error = None;
            return 0;
        }
        let mut blocks = 0;
        // pop_front reads the successor link before the slab's memory is
        // handed back
        while let Some(slab) = self.empty.pop_front() {
            give(slab.cast::<u8>(), geometry.slab_bytes());
            blocks += geometry.slab_blocks;
        }
        self.last_error = None;
        blocks
    }

    /// Color offset for the next slab. Rotates by one cache line per slab
    /// within the slack budget; sticks to zero for uncolored geometries.
    fn advance_color(&mut self, geometry: &SlabGeometry) -> usize {
        let color = self.color;
        if geometry.colored() {
            self.color += CACHE_LINE_SIZE;
            if self.color > geometry.slack {
                self.color = 0;
            }
        }
        color
    }

    /// The partial or full slab owning an allocated object at `obj`, and
    /// whether it came from the full list.
    fn find_owner(
        &self,
        geometry: &SlabGeometry,
        obj: NonNull<u8>,
    ) -> Option<(NonNull<Slab>, bool)> {
        for slab in self.partial.iter() {
            // SAFETY: list members are live slabs of this cache.
            if unsafe { (*slab.as_ptr()).owns_allocated(obj, geometry) } {
                return Some((slab, false));
            }
        }
        for slab in self.full.iter() {
            // SAFETY: as above.
            if unsafe { (*slab.as_ptr()).owns_allocated(obj, geometry) } {
                return Some((slab, true));
            }
        }
        None
    }

    /// Point-in-time report over the slab lists.
    pub(crate) fn stats(
        &self,
        name: CacheName,
        geometry: &SlabGeometry,
        struct_blocks: usize,
    ) -> CacheStats {
        let slab_count = self.empty.len() + self.partial.len() + self.full.len();
        let mut used = self.full.len() * geometry.objects_per_slab;
        for slab in self.partial.iter() {
            // SAFETY: list members are live slabs of this cache.
            used += geometry.objects_per_slab - unsafe { (*slab.as_ptr()).free_left() };
        }
        CacheStats {
            name,
            object_size: geometry.object_size,
            slab_blocks: geometry.slab_blocks,
            objects_per_slab: geometry.objects_per_slab,
            slab_count,
            capacity: slab_count * geometry.objects_per_slab,
            used,
            footprint_blocks: slab_count * geometry.slab_blocks + struct_blocks,
        }
    }
}

/// A point-in-time utilization report for one cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheStats {
    name: CacheName,
    /// Object size the cache was created with, in bytes.
    pub object_size: usize,
    /// Blocks per slab.
    pub slab_blocks: usize,
    /// Object slots per slab.
    pub objects_per_slab: usize,
    /// Live slabs across the empty, partial, and full lists.
    pub slab_count: usize,
    /// Object slots across all live slabs.
    pub capacity: usize,
    /// Currently allocated objects.
    pub used: usize,
    /// Blocks the cache owns: its slabs plus its own struct.
    pub footprint_blocks: usize,
}

impl CacheStats {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Allocated slots as a percentage of capacity; zero for a cache with
    /// no slabs.
    pub fn utilization(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            self.used * 100 / self.capacity
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cache '{}': {} B objects, {} per {}-block slab, {} slabs, {}/{} used ({}%), {} blocks held",
            self.name.as_str(),
            self.object_size,
            self.objects_per_slab,
            self.slab_blocks,
            self.slab_count,
            self.used,
            self.capacity,
            self.utilization(),
            self.footprint_blocks,
        )
    }
}
