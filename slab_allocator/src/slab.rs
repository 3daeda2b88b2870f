//! Slab layout and per-object bookkeeping.
//!
//! A slab occupies one power-of-two buddy chunk, carved into three areas:
//! the [`Slab`] header at the chunk's start, an occupancy bitmap with one
//! bit per object slot, and the object array, optionally pushed right by
//! the owning cache's current color offset. Free objects are threaded into
//! a singly-linked list through their own first bytes, so an empty slot
//! costs nothing beyond the bitmap bit.

use core::mem;
use core::ptr::{addr_of_mut, NonNull};

use bit_field::BitField;
use buddy_allocator::{BLOCK_SIZE, MAX_ORDER};

use crate::list::{Linked, Links};
use crate::MIN_OBJECTS_PER_SLAB;

/// Largest chunk the buddy allocator can hand out, in blocks.
const MAX_SLAB_BLOCKS: usize = 1 << (MAX_ORDER - 1);

/// Immutable slab layout for one cache, fixed at cache creation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SlabGeometry {
    /// Object size the cache was created with.
    pub(crate) object_size: usize,
    /// `object_size` rounded up to a machine word, so a free object can
    /// hold its free-list link.
    pub(crate) actual_size: usize,
    /// Power-of-two slab size, in blocks.
    pub(crate) slab_blocks: usize,
    /// Object slots per slab.
    pub(crate) objects_per_slab: usize,
    /// Occupancy bitmap size, in bytes.
    pub(crate) bitmap_bytes: usize,
    /// Bytes left over after header, bitmap, and objects. Doubles as the
    /// coloring budget.
    pub(crate) slack: usize,
}

impl SlabGeometry {
    /// Computes the layout for `object_size` objects: the smallest
    /// power-of-two slab that fits the header, a bitmap, and
    /// [`MIN_OBJECTS_PER_SLAB`] objects, with the object count then grown
    /// greedily into the remaining slack. Growth happens in two steps:
    /// bulk groups of eight objects (each charging one extra bitmap byte)
    /// followed by single objects, charging a bitmap byte whenever the
    /// count crosses into a fresh byte.
    ///
    /// Returns `None` for a zero size and for sizes too large for any
    /// buddy chunk.
    pub(crate) fn compute(object_size: usize) -> Option<SlabGeometry> {
        if object_size == 0 {
            return None;
        }
        let actual_size = object_size.max(mem::size_of::<usize>());
        let header = mem::size_of::<Slab>();

        let mut objects = MIN_OBJECTS_PER_SLAB;
        let mut bitmap_bytes = objects.div_ceil(8);
        let needed = header
            .checked_add(bitmap_bytes)?
            .checked_add(objects.checked_mul(actual_size)?)?;

        let mut slab_blocks = 1usize;
        while slab_blocks * BLOCK_SIZE < needed {
            if slab_blocks >= MAX_SLAB_BLOCKS {
                return None;
            }
            slab_blocks <<= 1;
        }
        let mut slack = slab_blocks * BLOCK_SIZE - needed;

        // Bulk step: eight objects cost one bitmap byte on top of their
        // own bytes.
        let group_cost = actual_size * 8 + 1;
        let groups = slack / group_cost;
        objects += groups * 8;
        bitmap_bytes += groups;
        slack %= group_cost;

        // Top up one object at a time.
        loop {
            let crosses_byte = objects % 8 == 0;
            let cost = actual_size + usize::from(crosses_byte);
            if slack < cost {
                break;
            }
            if crosses_byte {
                bitmap_bytes += 1;
            }
            slack -= cost;
            objects += 1;
        }

        Some(SlabGeometry {
            object_size,
            actual_size,
            slab_blocks,
            objects_per_slab: objects,
            bitmap_bytes,
            slack,
        })
    }

    /// Bytes one slab spans.
    pub(crate) fn slab_bytes(&self) -> usize {
        self.slab_blocks * BLOCK_SIZE
    }

    /// Whether slabs of this geometry rotate their object array's start
    /// across cache lines. Requires at least one line of slack.
    pub(crate) fn colored(&self) -> bool {
        self.slack >= crate::CACHE_LINE_SIZE
    }
}

/// Slab header, resident at the start of the slab's chunk.
#[repr(C)]
pub(crate) struct Slab {
    /// Unallocated object slots left in this slab.
    free_left: usize,
    /// Position in the owning cache's empty/partial/full list.
    links: Links<Slab>,
    /// The occupancy bitmap, immediately after this header.
    bitmap: NonNull<u8>,
    /// First object slot: after the bitmap, plus this slab's color offset.
    start: NonNull<u8>,
    /// Head of the free-object list threaded through the objects.
    free_head: Option<NonNull<u8>>,
}

impl Linked for Slab {
    unsafe fn links(node: NonNull<Slab>) -> *mut Links<Slab> {
        addr_of_mut!((*node.as_ptr()).links)
    }
}

impl Slab {
    /// Writes a fresh slab header at the start of `chunk`, zeroes the
    /// bitmap, and threads every object slot into the free list.
    ///
    /// # Safety
    ///
    /// `chunk` must point to `geometry.slab_bytes()` bytes of otherwise
    /// unused, word-aligned memory, and `color` must not exceed
    /// `geometry.slack`.
    pub(crate) unsafe fn initialize(
        chunk: NonNull<u8>,
        geometry: &SlabGeometry,
        color: usize,
    ) -> NonNull<Slab> {
        debug_assert!(color <= geometry.slack);
        let header = chunk.cast::<Slab>();
        let bitmap = NonNull::new_unchecked(chunk.as_ptr().add(mem::size_of::<Slab>()));
        let start = NonNull::new_unchecked(bitmap.as_ptr().add(geometry.bitmap_bytes + color));
        core::ptr::write_bytes(bitmap.as_ptr(), 0, geometry.bitmap_bytes);

        // Each free slot's first word holds the next free slot's address,
        // zero in the last one.
        for slot in 0..geometry.objects_per_slab {
            let obj = start.as_ptr().add(slot * geometry.actual_size);
            let next = if slot + 1 < geometry.objects_per_slab {
                obj.add(geometry.actual_size) as usize
            } else {
                0
            };
            obj.cast::<usize>().write_unaligned(next);
        }

        header.as_ptr().write(Slab {
            free_left: geometry.objects_per_slab,
            links: Links::new(),
            bitmap,
            start,
            free_head: Some(start),
        });
        header
    }

    pub(crate) fn free_left(&self) -> usize {
        self.free_left
    }

    #[cfg(test)]
    pub(crate) fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// Slot index holding `obj`, if `obj` lies on a slot boundary inside
    /// this slab's object array.
    fn slot_of(&self, obj: NonNull<u8>, geometry: &SlabGeometry) -> Option<usize> {
        let offset = (obj.as_ptr() as usize).checked_sub(self.start.as_ptr() as usize)?;
        if offset >= geometry.objects_per_slab * geometry.actual_size
            || offset % geometry.actual_size != 0
        {
            return None;
        }
        Some(offset / geometry.actual_size)
    }

    /// Whether `obj` is a currently allocated object of this slab.
    pub(crate) fn owns_allocated(&self, obj: NonNull<u8>, geometry: &SlabGeometry) -> bool {
        self.slot_of(obj, geometry).map_or(false, |slot| self.bit(slot))
    }

    fn bit(&self, slot: usize) -> bool {
        // SAFETY: the bitmap spans every slot index the geometry allows.
        unsafe { (*self.bitmap.as_ptr().add(slot / 8)).get_bit(slot % 8) }
    }

    fn set_bit(&mut self, slot: usize, value: bool) {
        // SAFETY: as in `bit`.
        unsafe {
            (*self.bitmap.as_ptr().add(slot / 8)).set_bit(slot % 8, value);
        }
    }

    /// Pops the next free object: unlinks it from the free list, marks its
    /// occupancy bit, and decrements the free count. `None` if the slab is
    /// full.
    pub(crate) fn take_object(&mut self, geometry: &SlabGeometry) -> Option<NonNull<u8>> {
        let obj = self.free_head?;
        // SAFETY: free slots hold the next slot's address in their first
        // word; the read may be unaligned for odd object sizes.
        let next = unsafe { obj.as_ptr().cast::<usize>().read_unaligned() };
        self.free_head = NonNull::new(next as *mut u8);
        let slot = match self.slot_of(obj, geometry) {
            Some(slot) => slot,
            None => {
                debug_assert!(false, "free list points outside the slab");
                return None;
            }
        };
        self.set_bit(slot, true);
        self.free_left -= 1;
        Some(obj)
    }

    /// Returns `obj` to the free list: clears its bit, links it in at the
    /// head, and increments the free count. The caller must have verified
    /// [`owns_allocated`](Self::owns_allocated).
    pub(crate) fn give_object(&mut self, obj: NonNull<u8>, geometry: &SlabGeometry) {
        let slot = match self.slot_of(obj, geometry) {
            Some(slot) => slot,
            None => {
                debug_assert!(false, "giving back an object the slab does not own");
                return;
            }
        };
        self.set_bit(slot, false);
        let next = self.free_head.map_or(0, |head| head.as_ptr() as usize);
        // SAFETY: the slot is inside the object array and now free.
        unsafe {
            obj.as_ptr().cast::<usize>().write_unaligned(next);
        }
        self.free_head = Some(obj);
        self.free_left += 1;
    }

    /// Clear bits in the occupancy bitmap; always equals `free_left` when
    /// the slab is consistent.
    pub(crate) fn clear_bits(&self, geometry: &SlabGeometry) -> usize {
        (0..geometry.objects_per_slab)
            .filter(|&slot| !self.bit(slot))
            .count()
    }
}
