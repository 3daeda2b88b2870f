//! A power-of-two buddy allocator over a single caller-provided region of
//! contiguous fixed-size blocks.
//!
//! The allocator's own bookkeeping is written into the leading block(s) of
//! the managed region, so no other source of memory is ever needed: free
//! chunks are threaded into per-order free lists through their own first
//! words, and all chunk arithmetic is done on [`BlockIndex`] offsets from
//! the first usable block rather than on raw addresses.
//!
//! [`BuddyAllocator::take`] rounds a byte size up to the smallest
//! power-of-two block count that can hold it and splits a larger free chunk
//! in half as many times as needed. [`BuddyAllocator::give`] walks the other
//! direction, repeatedly merging the returned chunk with its buddy while the
//! buddy is also free.

#![no_std]

#[cfg(test)]
mod test;

use core::{fmt, mem, ptr::addr_of_mut, ptr::NonNull};

use log::{debug, trace};
use static_assertions::const_assert;

/// The size in bytes of one block, the smallest unit the allocator hands out.
pub const BLOCK_SIZE: usize = 4096;

/// The number of order classes; a chunk of order `o` spans `2^o` blocks.
///
/// Block counts are bounded by a 31-bit signed count, so the largest chunk
/// the free lists can hold spans `2^(MAX_ORDER - 1)` blocks.
pub const MAX_ORDER: usize = 30;

const_assert!(BLOCK_SIZE.is_power_of_two());
const_assert!(MAX_ORDER >= 1 && MAX_ORDER < usize::BITS as usize);

/// The offset of a block from the first usable block, in whole blocks.
///
/// All buddy/partner computation happens on these indices; addresses are
/// only materialized at the edges, when a chunk is handed out or a free
/// link is written.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct BlockIndex(usize);

impl BlockIndex {
    /// The block offset from the base of the region.
    pub fn number(self) -> usize {
        self.0
    }

    /// The buddy of a chunk of `span` blocks starting at this index: the
    /// adjacent same-sized chunk it could merge with one order up. Which
    /// side the buddy lies on depends on whether this index is an even or
    /// odd multiple of `span`.
    fn partner(self, span: usize) -> BlockIndex {
        if self.0 % (span * 2) == 0 {
            BlockIndex(self.0 + span)
        } else {
            BlockIndex(self.0 - span)
        }
    }

    /// The base of the chunk formed by merging this chunk with `partner`.
    fn merged(self, partner: BlockIndex) -> BlockIndex {
        if self.0 < partner.0 {
            self
        } else {
            partner
        }
    }
}

/// The chunk a request of a given byte size maps to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkSize {
    /// log2 of the chunk's span in blocks.
    pub order: usize,
    /// The chunk's span in blocks, `2^order`.
    pub blocks: usize,
}

/// Computes the smallest power-of-two chunk able to hold `bytes`.
///
/// Returns `None` for a zero size, or for a size so large that its order
/// would not fit the free lists.
pub fn chunk_size(bytes: usize) -> Option<ChunkSize> {
    if bytes == 0 {
        return None;
    }
    let blocks = bytes.div_ceil(BLOCK_SIZE).next_power_of_two();
    let order = blocks.trailing_zeros() as usize;
    if order >= MAX_ORDER {
        return None;
    }
    Some(ChunkSize { order, blocks })
}

/// A free chunk's link to the next free chunk of the same order.
///
/// The link is stored in the free chunk's own first word; nothing else of
/// the chunk is meaningful while it sits on a free list.
#[repr(C)]
struct FreeChunk {
    next: Option<NonNull<FreeChunk>>,
}

/// The allocator's bookkeeping, resident in the leading block(s) of the
/// managed region.
#[repr(C)]
pub struct BuddyAllocator {
    /// Free-list heads indexed by order.
    free_lists: [Option<NonNull<FreeChunk>>; MAX_ORDER],
    /// Address of the first usable block, just past this header.
    base: NonNull<u8>,
    /// Number of usable blocks after the header.
    block_count: usize,
}

impl BuddyAllocator {
    /// The number of leading blocks reserved for the allocator's header.
    fn header_blocks() -> usize {
        mem::size_of::<BuddyAllocator>().div_ceil(BLOCK_SIZE)
    }

    /// Initializes a buddy allocator over `region`, writing its header into
    /// the region's leading block(s) and threading every remaining block
    /// into the free lists: one contiguous chunk per set bit of the
    /// available block count, largest first. The region is therefore fully
    /// covered using the fewest possible chunks.
    ///
    /// Returns `None` if `region` is null, `block_count` cannot hold even
    /// the header, or the available count is too large for the free lists.
    ///
    /// # Safety
    /// `region` must be valid for reads and writes for
    /// `block_count * BLOCK_SIZE` bytes, aligned to a machine word, and must
    /// only be accessed through the returned allocator from then on.
    pub unsafe fn init(region: *mut u8, block_count: usize) -> Option<NonNull<BuddyAllocator>> {
        let region = NonNull::new(region)?;
        let header = Self::header_blocks();
        let avail = block_count.checked_sub(header)?;
        if avail >= 1 << MAX_ORDER {
            return None;
        }

        let this = region.cast::<BuddyAllocator>();
        // SAFETY: `region` is non-null, so the offset past the header blocks
        // is too; the caller guarantees the region covers it.
        let base = NonNull::new_unchecked(region.as_ptr().add(header * BLOCK_SIZE));
        this.as_ptr().write(BuddyAllocator {
            free_lists: [None; MAX_ORDER],
            base,
            block_count: avail,
        });

        let buddy = &mut *this.as_ptr();
        let mut cursor = BlockIndex(0);
        for order in (0..MAX_ORDER).rev() {
            let span = 1usize << order;
            if avail & span != 0 {
                buddy.push(order, BlockIndex(cursor.0));
                cursor.0 += span;
            }
        }

        debug!(
            "buddy allocator: {} usable blocks of {} bytes ({} reserved for the header)",
            avail, BLOCK_SIZE, header
        );
        Some(this)
    }

    /// Takes the smallest power-of-two run of blocks able to hold `bytes`.
    ///
    /// Scans the free lists from the target order upward; the first chunk
    /// found is split in half until it reaches the target order, each upper
    /// half pushed one order down, and the lower half is returned.
    ///
    /// Returns `None` if `bytes` is zero, maps to no valid order, or no
    /// free chunk at or above the target order exists.
    pub fn take(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let ChunkSize { order: target, .. } = chunk_size(bytes)?;
        let source = (target..MAX_ORDER).find(|&o| self.free_lists[o].is_some())?;
        let index = self.pop(source)?;

        let mut order = source;
        while order > target {
            order -= 1;
            // Keep the lower half, push the upper half one order down.
            self.push(order, BlockIndex(index.0 + (1 << order)));
        }

        trace!(
            "buddy take: {} bytes -> order {} chunk at block {}",
            bytes,
            target,
            index.number()
        );
        NonNull::new(self.block_addr(index))
    }

    /// Returns a chunk previously obtained from [`take`](Self::take),
    /// coalescing it with its buddy repeatedly while the buddy is also free,
    /// then pushing the final chunk onto its order's free list.
    ///
    /// # Safety
    /// `chunk` must have been returned by `take(bytes)` on this allocator
    /// with the same `bytes`, and must not be used again after this call.
    pub unsafe fn give(&mut self, chunk: NonNull<u8>, bytes: usize) {
        let Some(ChunkSize {
            mut order,
            blocks: mut span,
        }) = chunk_size(bytes)
        else {
            debug_assert!(false, "buddy give: no order fits {} bytes", bytes);
            return;
        };

        let mut index = self.index_of(chunk.as_ptr());
        while order + 1 < MAX_ORDER {
            let partner = index.partner(span);
            if !self.remove(order, partner) {
                break;
            }
            index = index.merged(partner);
            order += 1;
            span <<= 1;
        }
        self.push(order, index);

        trace!(
            "buddy give: {} bytes -> order {} chunk at block {}",
            bytes,
            order,
            index.number()
        );
    }

    /// The total number of blocks currently sitting on the free lists.
    pub fn free_block_count(&self) -> usize {
        (0..MAX_ORDER).map(|o| self.chunks_at(o) << o).sum()
    }

    /// The number of usable blocks this allocator was initialized with.
    pub fn total_blocks(&self) -> usize {
        self.block_count
    }

    /// Address of the block at `index`.
    fn block_addr(&self, index: BlockIndex) -> *mut u8 {
        // SAFETY: free-list invariants keep every index inside the region.
        unsafe { self.base.as_ptr().add(index.0 * BLOCK_SIZE) }
    }

    /// Index of the block containing `addr`.
    fn index_of(&self, addr: *mut u8) -> BlockIndex {
        BlockIndex((addr as usize - self.base.as_ptr() as usize) / BLOCK_SIZE)
    }

    /// Pushes the chunk at `index` onto `order`'s free list, writing the
    /// list link into the chunk's first word.
    fn push(&mut self, order: usize, index: BlockIndex) {
        let chunk = self.block_addr(index).cast::<FreeChunk>();
        // SAFETY: the chunk is free, inside the region, and word-aligned
        // since every block start is.
        unsafe {
            chunk.write(FreeChunk {
                next: self.free_lists[order],
            });
            self.free_lists[order] = Some(NonNull::new_unchecked(chunk));
        }
    }

    /// Pops the head chunk of `order`'s free list.
    fn pop(&mut self, order: usize) -> Option<BlockIndex> {
        let head = self.free_lists[order]?;
        // SAFETY: chunks on a free list hold a valid link in their first word.
        self.free_lists[order] = unsafe { head.as_ref().next };
        Some(self.index_of(head.as_ptr().cast()))
    }

    /// Unlinks the chunk at `index` from `order`'s free list.
    /// Returns false if the chunk is not on that list.
    fn remove(&mut self, order: usize, index: BlockIndex) -> bool {
        let target = self.block_addr(index).cast::<FreeChunk>();
        let mut link: *mut Option<NonNull<FreeChunk>> = &mut self.free_lists[order];
        // SAFETY: `link` always points either at the list head stored in
        // this header or at the `next` word of a free chunk on the list.
        unsafe {
            while let Some(chunk) = *link {
                if chunk.as_ptr() == target {
                    *link = chunk.as_ref().next;
                    return true;
                }
                link = addr_of_mut!((*chunk.as_ptr()).next);
            }
        }
        false
    }

    /// The number of free chunks on `order`'s list.
    fn chunks_at(&self, order: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.free_lists[order];
        while let Some(chunk) = cursor {
            count += 1;
            // SAFETY: chunks on a free list hold a valid link in their first word.
            cursor = unsafe { chunk.as_ref().next };
        }
        count
    }
}

impl fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "BuddyAllocator: {} of {} blocks free",
            self.free_block_count(),
            self.block_count
        )?;
        for order in (0..MAX_ORDER).rev() {
            if self.free_lists[order].is_none() {
                continue;
            }
            write!(f, "  order {:2} ({:5} blocks):", order, 1usize << order)?;
            let mut cursor = self.free_lists[order];
            while let Some(chunk) = cursor {
                write!(f, " {}", self.index_of(chunk.as_ptr().cast()).number())?;
                // SAFETY: chunks on a free list hold a valid link in their first word.
                cursor = unsafe { chunk.as_ref().next };
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
