//! An object-caching slab allocator layered on a buddy allocator.
//!
//! [`SlabAllocator::init`] bootstraps the whole system inside one
//! caller-provided memory region: a [buddy allocator](buddy_allocator)
//! manages the region as 4 KiB blocks, and caches of same-sized objects
//! draw power-of-two slabs from it. Each cache keeps its slabs on
//! empty/partial/full lists, tracks slot occupancy in a per-slab bitmap,
//! threads free objects into a list through their own storage, and, when
//! its geometry leaves at least a cache line of slack, rotates slab start
//! offsets across cache lines so hot objects in different slabs do not
//! collide on the same lines.
//!
//! On top of the caches sits a size-classed generic layer
//! ([`allocate_bytes`](SlabAllocator::allocate_bytes)) serving arbitrary
//! requests from demand-created caches of power-of-two sizes.
//!
//! Locking is two-tier: one registry lock guards the buddy allocator, the
//! cache list, and the size-class table, while each cache guards its own
//! slab lists with its own lock, so traffic in different caches does not
//! contend. The only nested acquisition is cache lock first, registry
//! lock second, which keeps the order acyclic.

#![no_std]


mod cache;
mod list;
mod size_class;
mod slab;

use core::fmt;
use core::mem;
use core::ptr::{addr_of, NonNull};

use log::debug;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert;

use buddy_allocator::{chunk_size, BuddyAllocator};
pub use buddy_allocator::BLOCK_SIZE;
pub use cache::CacheStats;
pub use size_class::size_class;

use cache::{Cache, CacheName};
use list::RawList;
use slab::SlabGeometry;

/// Cache name capacity, including a reserved terminal byte.
pub const CACHE_NAME_LEN: usize = 32;

/// Smallest number of object slots any slab geometry may have.
pub const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Cache line granularity used for slab coloring.
pub const CACHE_LINE_SIZE: usize = 64;

/// log2 of the smallest generic size class (32 bytes).
pub const MIN_SIZE_CLASS_SHIFT: usize = 5;

/// log2 of the largest generic size class (128 KiB).
pub const MAX_SIZE_CLASS_SHIFT: usize = 17;

/// Number of generic size classes.
pub const SIZE_CLASS_COUNT: usize = MAX_SIZE_CLASS_SHIFT - MIN_SIZE_CLASS_SHIFT + 1;

const_assert!(CACHE_NAME_LEN > 1);
const_assert!(MIN_OBJECTS_PER_SLAB >= 1);
const_assert!(CACHE_LINE_SIZE.is_power_of_two());
const_assert!(MIN_SIZE_CLASS_SHIFT <= MAX_SIZE_CLASS_SHIFT);

/// Constructor or destructor run on individual objects of a cache.
pub type ObjectCallback = fn(NonNull<u8>);

/// Failures reported by allocator operations.
///
/// Apart from [`InvalidCache`](CacheError::InvalidCache), each is also
/// recorded in the owning cache's last-error slot, where it sticks until
/// the next successful operation on that cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheError {
    /// The buddy allocator had no chunk large enough.
    NoSpace,
    /// The pointer is not a currently allocated object of the cache.
    InvalidObject,
    /// The cache still has allocated objects.
    NotEmpty,
    /// The handle does not name a live cache.
    InvalidCache,
    /// Zero size, or a generic request outside the supported classes.
    UnsupportedSize,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            CacheError::NoSpace => "out of space",
            CacheError::InvalidObject => "invalid object pointer",
            CacheError::NotEmpty => "cache is not empty",
            CacheError::InvalidCache => "invalid cache handle",
            CacheError::UnsupportedSize => "unsupported size",
        };
        f.write_str(msg)
    }
}

/// Registry state: the buddy allocator, the live-cache list, and the
/// generic layer's size-class table.
struct RegistryState {
    buddy: NonNull<BuddyAllocator>,
    caches: RawList<Cache>,
    size_classes: [Option<NonNull<Cache>>; SIZE_CLASS_COUNT],
}

impl RegistryState {
    fn buddy_mut(&mut self) -> &mut BuddyAllocator {
        // SAFETY: the registry lock grants exclusive access to the buddy.
        unsafe { self.buddy.as_mut() }
    }

    /// Whether `cache` is currently linked in the live-cache list.
    fn contains(&self, cache: NonNull<Cache>) -> bool {
        self.caches.contains(cache)
    }
}

/// The allocator's root structure, carved from the buddy at [`init`]
/// time and never moved or freed afterwards.
///
/// [`init`]: SlabAllocator::init
#[repr(C)]
struct Registry {
    state: Mutex<RegistryState>,
}

/// Handle to an initialized allocator. Copyable and shareable across
/// threads; all the real state lives inside the managed region.
#[derive(Clone, Copy, Debug)]
pub struct SlabAllocator {
    registry: NonNull<Registry>,
}

// SAFETY: every access to the pointed-to registry goes through its lock,
// and cache state through the per-cache locks. The handle itself is just
// an address.
unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

/// Handle to one cache of a [`SlabAllocator`]. Copyable; operations on a
/// handle whose cache has been destroyed fail with
/// [`CacheError::InvalidCache`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CacheHandle {
    cache: NonNull<Cache>,
}

// SAFETY: the handle is just an address; the pointed-to cache is reached
// only under its own lock, after validation against the registry.
unsafe impl Send for CacheHandle {}
unsafe impl Sync for CacheHandle {}

impl SlabAllocator {
    /// Bootstraps an allocator over `region`, a span of `block_count`
    /// blocks of [`BLOCK_SIZE`] bytes. The buddy allocator's header and
    /// the registry are both carved out of the region itself, so the
    /// caller hands over the memory and keeps nothing to free.
    ///
    /// # Safety
    ///
    /// `region` must point to `block_count * BLOCK_SIZE` bytes of memory,
    /// word-aligned, unused by anything else, and valid for the lifetime
    /// of every handle derived from the returned allocator.
    pub unsafe fn init(region: *mut u8, block_count: usize) -> Result<SlabAllocator, &'static str> {
        let mut buddy = BuddyAllocator::init(region, block_count)
            .ok_or("region is null or too small for the buddy allocator")?;
        let storage = buddy
            .as_mut()
            .take(mem::size_of::<Registry>())
            .ok_or("region has no room for the allocator registry")?;
        let registry = storage.cast::<Registry>();
        registry.as_ptr().write(Registry {
            state: Mutex::new(RegistryState {
                buddy,
                caches: RawList::new(),
                size_classes: [None; SIZE_CLASS_COUNT],
            }),
        });
        let handle = SlabAllocator { registry };
        debug!(
            "slab allocator ready: {} of {} blocks free",
            handle.free_blocks(),
            block_count
        );
        Ok(handle)
    }

    /// Creates a cache of `object_size`-byte objects. `ctor` runs on each
    /// object as it is handed out and `dtor` as it is freed. The returned
    /// handle is valid until [`destroy_cache`](Self::destroy_cache).
    ///
    /// The cache is fully initialized before it becomes reachable, so a
    /// handle can never observe a half-built cache.
    pub fn create_cache(
        &self,
        name: &str,
        object_size: usize,
        ctor: Option<ObjectCallback>,
        dtor: Option<ObjectCallback>,
    ) -> Result<CacheHandle, CacheError> {
        if object_size == 0 {
            return Err(CacheError::UnsupportedSize);
        }
        let geometry = SlabGeometry::compute(object_size).ok_or(CacheError::NoSpace)?;
        let name = CacheName::new(name);
        let storage = self
            .state()
            .buddy_mut()
            .take(mem::size_of::<Cache>())
            .ok_or(CacheError::NoSpace)?;
        // SAFETY: the chunk covers a Cache and block alignment more than
        // satisfies its alignment.
        let cache = unsafe { Cache::initialize(storage, name, geometry, ctor, dtor) };
        // SAFETY: freshly initialized, on no list yet.
        unsafe { self.state().caches.push_front(cache) };
        debug!(
            "created cache '{}': {} B objects, {} per {}-block slab",
            name.as_str(),
            object_size,
            geometry.objects_per_slab,
            geometry.slab_blocks
        );
        Ok(CacheHandle { cache })
    }

    /// Allocates one object from `handle`'s cache. The constructor, if
    /// any, runs on the object before it is returned, outside the cache
    /// lock.
    pub fn allocate(&self, handle: CacheHandle) -> Result<NonNull<u8>, CacheError> {
        let mut state = self.lock_live_cache(handle)?;
        // SAFETY: validated live above, and its lock is held.
        let geometry = unsafe { Cache::geometry(handle.cache) };
        let ctor = unsafe { Cache::ctor(handle.cache) };
        let obj = state.allocate(&geometry, |bytes| self.state().buddy_mut().take(bytes))?;
        drop(state);
        if let Some(ctor) = ctor {
            ctor(obj);
        }
        Ok(obj)
    }

    /// Frees `obj` back to `handle`'s cache. The destructor, if any, runs
    /// on the object under the cache lock before the slot is released.
    /// Pointers the cache does not own, and double frees, are rejected
    /// with [`CacheError::InvalidObject`] and no state change.
    pub fn deallocate(&self, handle: CacheHandle, obj: NonNull<u8>) -> Result<(), CacheError> {
        let mut state = self.lock_live_cache(handle)?;
        // SAFETY: validated live above, and its lock is held.
        let geometry = unsafe { Cache::geometry(handle.cache) };
        let dtor = unsafe { Cache::dtor(handle.cache) };
        state.deallocate(&geometry, obj, dtor)
    }

    /// Returns every empty slab of `handle`'s cache to the buddy
    /// allocator and reports how many blocks that freed. If the cache
    /// grew a slab since the last attempt, this call only re-arms the
    /// shrink guard and frees nothing.
    pub fn shrink_cache(&self, handle: CacheHandle) -> Result<usize, CacheError> {
        let mut state = self.lock_live_cache(handle)?;
        // SAFETY: validated live above, and its lock is held.
        let geometry = unsafe { Cache::geometry(handle.cache) };
        let blocks = state.shrink(&geometry, |chunk, bytes| {
            // SAFETY: the chunk came out of this buddy with this size.
            unsafe { self.state().buddy_mut().give(chunk, bytes) }
        });
        if blocks > 0 {
            // SAFETY: still live, lock still held.
            let name = unsafe { Cache::name(handle.cache) };
            debug!("shrunk cache '{}' by {} blocks", name.as_str(), blocks);
        }
        Ok(blocks)
    }

    /// Destroys `handle`'s cache, returning its slabs and its struct to
    /// the buddy allocator. Fails with [`CacheError::NotEmpty`] while any
    /// object is still allocated, leaving the cache usable.
    pub fn destroy_cache(&self, handle: CacheHandle) -> Result<(), CacheError> {
        let mut state = self.lock_live_cache(handle)?;
        if !state.partial.is_empty() || !state.full.is_empty() {
            state.last_error = Some(CacheError::NotEmpty);
            return Err(CacheError::NotEmpty);
        }
        // SAFETY: validated live above, and its lock is held.
        let geometry = unsafe { Cache::geometry(handle.cache) };
        let name = unsafe { Cache::name(handle.cache) };
        {
            let mut registry = self.state();
            // Unpublish first: from here no lookup can validate the handle.
            // SAFETY: a live cache is a member of the registry list.
            unsafe { registry.caches.remove(handle.cache) };
            for slot in registry.size_classes.iter_mut() {
                if *slot == Some(handle.cache) {
                    *slot = None;
                }
            }
            while let Some(slab) = state.empty.pop_front() {
                // SAFETY: every slab chunk came out of this buddy with
                // this geometry's size.
                unsafe { registry.buddy_mut().give(slab.cast::<u8>(), geometry.slab_bytes()) };
            }
        }
        drop(state);
        // The struct goes back last, after its lock has been released.
        // SAFETY: the struct's chunk came out of this buddy with this size.
        unsafe {
            self.state()
                .buddy_mut()
                .give(handle.cache.cast::<u8>(), mem::size_of::<Cache>())
        };
        debug!("destroyed cache '{}'", name.as_str());
        Ok(())
    }

    /// Reports slab and object counts for `handle`'s cache.
    pub fn cache_stats(&self, handle: CacheHandle) -> Result<CacheStats, CacheError> {
        let state = self.lock_live_cache(handle)?;
        // SAFETY: validated live above, and its lock is held.
        let geometry = unsafe { Cache::geometry(handle.cache) };
        let name = unsafe { Cache::name(handle.cache) };
        let struct_blocks = chunk_size(mem::size_of::<Cache>()).map_or(0, |chunk| chunk.blocks);
        Ok(state.stats(name, &geometry, struct_blocks))
    }

    /// The last error recorded on `handle`'s cache, without clearing it;
    /// `None` after a successful operation, `Some(InvalidCache)` for a
    /// stale handle.
    pub fn last_error(&self, handle: CacheHandle) -> Option<CacheError> {
        match self.lock_live_cache(handle) {
            Ok(state) => state.last_error,
            Err(err) => Some(err),
        }
    }

    /// Current number of free blocks in the underlying buddy allocator.
    pub fn free_blocks(&self) -> usize {
        self.state().buddy_mut().free_block_count()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // SAFETY: the registry struct lives inside the managed region for
        // the allocator's whole lifetime.
        unsafe { &*addr_of!((*self.registry.as_ptr()).state) }.lock()
    }

    /// Validates `handle` against the live-cache list, locks the cache,
    /// then validates again: a cache destroyed while we waited for its
    /// lock unlinks itself under both locks, so the second check catches
    /// it.
    fn lock_live_cache(
        &self,
        handle: CacheHandle,
    ) -> Result<MutexGuard<'_, cache::CacheState>, CacheError> {
        if !self.state().contains(handle.cache) {
            return Err(CacheError::InvalidCache);
        }
        // SAFETY: just validated as live.
        let guard = unsafe { Cache::state(handle.cache) }.lock();
        if !self.state().contains(handle.cache) {
            return Err(CacheError::InvalidCache);
        }
        Ok(guard)
    }
}
