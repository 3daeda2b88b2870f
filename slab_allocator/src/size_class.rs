//! The size-classed generic allocation layer.
//!
//! Requests are rounded up to the next power of two between 32 bytes and
//! 128 KiB and served from per-class caches created on first use. A free
//! arrives as a bare pointer that does not say which class it came from,
//! so it probes every live class cache for ownership.

use core::mem;
use core::ptr::NonNull;

use log::debug;

use crate::cache::{Cache, CacheName};
use crate::slab::SlabGeometry;
use crate::{
    CacheError, SlabAllocator, CACHE_NAME_LEN, MAX_SIZE_CLASS_SHIFT, MIN_SIZE_CLASS_SHIFT,
};

/// The power-of-two class size serving a generic allocation of `size`
/// bytes, if any: `size_class(100) == Some(128)`. Rounding comes before
/// the range test, so a request the smallest class covers is served from
/// it; only sizes whose rounded value still falls below that class, or
/// lies above the largest one, are unsupported.
pub fn size_class(size: usize) -> Option<usize> {
    class_shift(size).map(|shift| 1 << shift)
}

fn class_shift(size: usize) -> Option<usize> {
    // Checked first so next_power_of_two cannot overflow.
    if size > 1 << MAX_SIZE_CLASS_SHIFT {
        return None;
    }
    let shift = size.next_power_of_two().trailing_zeros() as usize;
    // Zero rounds to shift 0 and falls out here with the rest.
    if shift < MIN_SIZE_CLASS_SHIFT {
        return None;
    }
    Some(shift)
}

/// Formats the conventional `size-N` name for a class cache.
fn class_name(class_size: usize) -> CacheName {
    let mut digits = [0u8; 8];
    let mut count = 0;
    let mut n = class_size;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        n /= 10;
        count += 1;
        if n == 0 {
            break;
        }
    }
    let mut buf = [0u8; CACHE_NAME_LEN];
    buf[..5].copy_from_slice(b"size-");
    for i in 0..count {
        buf[5 + i] = digits[count - 1 - i];
    }
    // all ASCII, so the fallback is unreachable
    CacheName::new(core::str::from_utf8(&buf[..5 + count]).unwrap_or("size-?"))
}

impl SlabAllocator {
    /// Allocates `size` bytes from the matching size class, creating that
    /// class's cache on first use. Class caches have no callbacks and no
    /// public handles, so they live as long as the allocator.
    pub fn allocate_bytes(&self, size: usize) -> Result<NonNull<u8>, CacheError> {
        let shift = class_shift(size).ok_or(CacheError::UnsupportedSize)?;
        let cache = self.class_cache(shift)?;
        // SAFETY: published class caches stay live, so no existence
        // check: lock and allocate directly.
        let mut state = unsafe { Cache::state(cache) }.lock();
        let geometry = unsafe { Cache::geometry(cache) };
        state.allocate(&geometry, |bytes| self.state().buddy_mut().take(bytes))
    }

    /// Frees a pointer obtained from
    /// [`allocate_bytes`](Self::allocate_bytes), probing every live class
    /// cache for ownership. Probe misses leave the probed caches'
    /// last-error slots alone. Roughly every `objects_per_slab` accepted
    /// frees on a class, that class gets shrunk.
    pub fn deallocate_bytes(&self, obj: NonNull<u8>) -> Result<(), CacheError> {
        let classes = self.state().size_classes;
        for cache in classes.into_iter().flatten() {
            // SAFETY: published class caches stay live.
            let mut state = unsafe { Cache::state(cache) }.lock();
            let geometry = unsafe { Cache::geometry(cache) };
            if !state.try_deallocate(&geometry, obj, None) {
                continue;
            }
            state.dealloc_count += 1;
            if state.dealloc_count >= geometry.objects_per_slab {
                state.dealloc_count = 0;
                let blocks = state.shrink(&geometry, |chunk, bytes| {
                    // SAFETY: the chunk came out of this buddy with this
                    // size.
                    unsafe { self.state().buddy_mut().give(chunk, bytes) }
                });
                if blocks > 0 {
                    debug!("size class shrink released {} blocks", blocks);
                }
            }
            return Ok(());
        }
        Err(CacheError::InvalidObject)
    }

    /// The class cache for `shift`, created under the registry lock on
    /// first use so two racing first allocations cannot both create it.
    fn class_cache(&self, shift: usize) -> Result<NonNull<Cache>, CacheError> {
        let slot = shift - MIN_SIZE_CLASS_SHIFT;
        let mut registry = self.state();
        if let Some(cache) = registry.size_classes[slot] {
            return Ok(cache);
        }
        let class_size = 1 << shift;
        let geometry = SlabGeometry::compute(class_size).ok_or(CacheError::NoSpace)?;
        let storage = registry
            .buddy_mut()
            .take(mem::size_of::<Cache>())
            .ok_or(CacheError::NoSpace)?;
        let name = class_name(class_size);
        // SAFETY: the chunk covers a Cache and block alignment more than
        // satisfies its alignment.
        let cache = unsafe { Cache::initialize(storage, name, geometry, None, None) };
        // SAFETY: freshly initialized, on no list yet.
        unsafe { registry.caches.push_front(cache) };
        registry.size_classes[slot] = Some(cache);
        debug!("created size class cache '{}'", name.as_str());
        Ok(cache)
    }
}
