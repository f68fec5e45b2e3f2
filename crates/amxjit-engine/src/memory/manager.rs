//! Bitmap region allocator for generated code
//!
//! Serves variable-size executable allocations out of OS-reserved regions.
//! Each region is subdivided into fixed-size blocks tracked by a bitmap; a
//! set bit means the block belongs to exactly one live allocation. Regions
//! are created on demand with geometrically growing default sizes and handed
//! back to the OS when they empty out, keeping one empty region as a hot
//! spare.

use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::memory::os::{self, CodeMarker, NopMarker, Protection};

/// Allocation granularity. Every returned pointer is aligned to this.
pub const BLOCK_SIZE: usize = 64;

/// Default size of the first on-demand region.
const INITIAL_REGION_SIZE: usize = 64 * 1024;

/// Ceiling for the geometric region-size growth.
const MAX_REGION_SIZE: usize = 16 * 1024 * 1024;

const BITS: usize = u64::BITS as usize;

struct Region {
    id: u32,
    base: *mut u8,
    size: usize,
    protection: Protection,
    /// Set bit = allocated block.
    bitmap: Vec<u64>,
    used_blocks: usize,
    total_blocks: usize,
    /// Write phase is over; no further allocations may land here.
    sealed: bool,
    marked: bool,
}

impl Region {
    fn new(id: u32, base: *mut u8, size: usize, protection: Protection) -> Region {
        let total_blocks = size / BLOCK_SIZE;
        Region {
            id,
            base,
            size,
            protection,
            bitmap: vec![0; total_blocks.div_ceil(BITS)],
            used_blocks: 0,
            total_blocks,
            sealed: false,
            marked: false,
        }
    }

    fn bit(&self, block: usize) -> bool {
        self.bitmap[block / BITS] & (1 << (block % BITS)) != 0
    }

    /// Find a run of `blocks` free blocks, skipping fully used bitmap words.
    fn find_run(&self, blocks: usize) -> Option<usize> {
        let mut block = 0;
        while block + blocks <= self.total_blocks {
            let word = block / BITS;
            if block % BITS == 0 && self.bitmap[word] == u64::MAX {
                block += BITS;
                continue;
            }
            if self.bit(block) {
                block += 1;
                continue;
            }
            let mut run = 1;
            while run < blocks && !self.bit(block + run) {
                run += 1;
            }
            if run == blocks {
                return Some(block);
            }
            block += run + 1;
        }
        None
    }

    fn set_run(&mut self, first: usize, blocks: usize) {
        for b in first..first + blocks {
            self.bitmap[b / BITS] |= 1 << (b % BITS);
        }
        self.used_blocks += blocks;
    }

    fn clear_run(&mut self, first: usize, blocks: usize) {
        for b in first..first + blocks {
            debug_assert!(self.bit(b), "freeing a free block");
            self.bitmap[b / BITS] &= !(1 << (b % BITS));
        }
        self.used_blocks -= blocks;
    }

    fn contains(&self, ptr: usize) -> bool {
        let base = self.base as usize;
        ptr >= base && ptr < base + self.size
    }
}

#[derive(Clone, Copy)]
struct AllocRecord {
    region_id: u32,
    first_block: usize,
    blocks: usize,
}

/// Page-backed executable memory allocator.
pub struct VirtualMemoryManager {
    regions: Vec<Region>,
    records: FxHashMap<usize, AllocRecord>,
    used_bytes: usize,
    allocated_bytes: usize,
    next_region_size: usize,
    next_region_id: u32,
    marker: Box<dyn CodeMarker>,
}

impl VirtualMemoryManager {
    /// Manager with the default (no-op) code marker.
    pub fn new() -> VirtualMemoryManager {
        VirtualMemoryManager::with_marker(Box::new(NopMarker))
    }

    /// Manager that reports published regions through `marker`.
    pub fn with_marker(marker: Box<dyn CodeMarker>) -> VirtualMemoryManager {
        VirtualMemoryManager {
            regions: Vec::new(),
            records: FxHashMap::default(),
            used_bytes: 0,
            allocated_bytes: 0,
            next_region_size: INITIAL_REGION_SIZE,
            next_region_id: 0,
            marker,
        }
    }

    /// Bytes currently handed out, rounded to block granularity.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Bytes reserved from the OS across all regions.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Allocate `size` bytes of writable code memory.
    ///
    /// Returns a block-aligned pointer, or `None` when `size` is zero or the
    /// OS refuses a new region. No partial state survives a failure.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let blocks = size.div_ceil(BLOCK_SIZE);

        // Oldest regions first.
        for index in 0..self.regions.len() {
            if self.regions[index].sealed {
                continue;
            }
            if let Some(first) = self.regions[index].find_run(blocks) {
                return Some(self.take(index, first, blocks));
            }
        }

        let page = os::page_size();
        let wanted = (blocks * BLOCK_SIZE).div_ceil(page) * page;
        let region_size = wanted.max(self.next_region_size);
        self.next_region_size = (self.next_region_size * 2).min(MAX_REGION_SIZE);

        let (base, protection) = match os::reserve(region_size) {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("code region reservation of {region_size} bytes failed: {err}");
                return None;
            }
        };
        log::debug!("reserved {region_size} byte code region at {base:p}");
        let id = self.next_region_id;
        self.next_region_id += 1;
        self.regions.push(Region::new(id, base, region_size, protection));
        self.allocated_bytes += region_size;

        let index = self.regions.len() - 1;
        let first = self.regions[index]
            .find_run(blocks)
            .expect("fresh region must fit the request");
        Some(self.take(index, first, blocks))
    }

    fn take(&mut self, index: usize, first: usize, blocks: usize) -> NonNull<u8> {
        let region = &mut self.regions[index];
        region.set_run(first, blocks);
        let ptr = unsafe { region.base.add(first * BLOCK_SIZE) };
        self.records.insert(
            ptr as usize,
            AllocRecord { region_id: region.id, first_block: first, blocks },
        );
        self.used_bytes += blocks * BLOCK_SIZE;
        NonNull::new(ptr).expect("region base is never null")
    }

    /// Publish the allocation at `ptr` as executable code.
    ///
    /// On regions that could only be reserved writable, this flips the whole
    /// region to read-execute and seals it against further allocation. The
    /// code marker runs once per region either way.
    pub fn commit(&mut self, ptr: NonNull<u8>, _len: usize) -> bool {
        let record = match self.records.get(&(ptr.as_ptr() as usize)) {
            Some(r) => *r,
            None => return false,
        };
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.id == record.region_id)
            .expect("record without region");
        if region.protection == Protection::ReadWrite && !region.sealed {
            if let Err(err) = os::protect_rx(region.base, region.size) {
                log::error!("making code region executable failed: {err}");
                return false;
            }
            region.sealed = true;
        }
        if !region.marked {
            self.marker.mark(region.base, region.size);
            region.marked = true;
        }
        true
    }

    /// Release an allocation. Returns `false` for unknown or already freed
    /// pointers, leaving all state untouched.
    pub fn free(&mut self, ptr: NonNull<u8>) -> bool {
        let record = match self.records.remove(&(ptr.as_ptr() as usize)) {
            Some(r) => r,
            None => return false,
        };
        let index = self
            .regions
            .iter()
            .position(|r| r.id == record.region_id)
            .expect("record without region");
        let region = &mut self.regions[index];
        region.clear_run(record.first_block, record.blocks);
        self.used_bytes -= record.blocks * BLOCK_SIZE;

        if region.used_blocks == 0 {
            let spare_exists = self
                .regions
                .iter()
                .any(|r| r.used_blocks == 0 && r.id != record.region_id && !r.sealed);
            let emptied_sealed = self.regions[index].sealed;
            if spare_exists || emptied_sealed {
                let region = self.regions.remove(index);
                self.allocated_bytes -= region.size;
                os::release(region.base, region.size);
            }
        }
        true
    }

    /// Number of live regions, for diagnostics.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl Default for VirtualMemoryManager {
    fn default() -> Self {
        VirtualMemoryManager::new()
    }
}

impl Drop for VirtualMemoryManager {
    fn drop(&mut self) {
        for region in &self.regions {
            os::release(region.base, region.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_alignment_and_counters() {
        let mut mm = VirtualMemoryManager::new();
        let a = mm.alloc(10).unwrap();
        let b = mm.alloc(100).unwrap();
        assert_eq!(a.as_ptr() as usize % BLOCK_SIZE, 0);
        assert_eq!(b.as_ptr() as usize % BLOCK_SIZE, 0);
        // 10 → 1 block, 100 → 2 blocks.
        assert_eq!(mm.used_bytes(), 3 * BLOCK_SIZE);
        assert!(mm.used_bytes() <= mm.allocated_bytes());

        assert!(mm.free(a));
        assert!(mm.free(b));
        assert_eq!(mm.used_bytes(), 0);
    }

    #[test]
    fn test_alloc_zero_fails() {
        let mut mm = VirtualMemoryManager::new();
        assert!(mm.alloc(0).is_none());
    }

    #[test]
    fn test_allocations_disjoint() {
        let mut mm = VirtualMemoryManager::new();
        let sizes = [1usize, 64, 65, 128, 1000, 17, 4096];
        let ptrs: Vec<_> = sizes.iter().map(|&s| (mm.alloc(s).unwrap(), s)).collect();
        for (i, &(p, s)) in ptrs.iter().enumerate() {
            for &(q, t) in ptrs.iter().skip(i + 1) {
                let (p, q) = (p.as_ptr() as usize, q.as_ptr() as usize);
                assert!(p + s <= q || q + t <= p, "allocations overlap");
            }
        }
        for (p, _) in ptrs {
            assert!(mm.free(p));
        }
    }

    #[test]
    fn test_double_free_rejected() {
        let mut mm = VirtualMemoryManager::new();
        let a = mm.alloc(32).unwrap();
        assert!(mm.free(a));
        let used = mm.used_bytes();
        assert!(!mm.free(a));
        assert_eq!(mm.used_bytes(), used);
    }

    #[test]
    fn test_free_unknown_rejected() {
        let mut mm = VirtualMemoryManager::new();
        let a = mm.alloc(32).unwrap();
        let bogus = NonNull::new(unsafe { a.as_ptr().add(BLOCK_SIZE) }).unwrap();
        assert!(!mm.free(bogus));
        assert!(mm.free(a));
    }

    #[test]
    fn test_reuse_after_free() {
        let mut mm = VirtualMemoryManager::new();
        let a = mm.alloc(BLOCK_SIZE).unwrap();
        let b = mm.alloc(BLOCK_SIZE).unwrap();
        assert!(mm.free(a));
        let c = mm.alloc(BLOCK_SIZE).unwrap();
        // The freed run is the first fit.
        assert_eq!(a.as_ptr(), c.as_ptr());
        assert!(mm.free(b));
        assert!(mm.free(c));
    }

    #[test]
    fn test_region_growth_and_spare_policy() {
        let mut mm = VirtualMemoryManager::new();
        // Two allocations larger than one initial region each force
        // multiple regions.
        let a = mm.alloc(INITIAL_REGION_SIZE).unwrap();
        let b = mm.alloc(INITIAL_REGION_SIZE * 2).unwrap();
        assert!(mm.region_count() >= 2);
        let reserved = mm.allocated_bytes();

        assert!(mm.free(a));
        // First empty region is kept as a spare.
        assert_eq!(mm.allocated_bytes(), reserved);
        assert!(mm.free(b));
        // Second empty region goes back to the OS.
        assert!(mm.allocated_bytes() < reserved);
        assert_eq!(mm.used_bytes(), 0);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut mm = VirtualMemoryManager::new();
        let a = mm.alloc(128).unwrap();
        unsafe {
            a.as_ptr().write(0xC3);
        }
        assert!(mm.commit(a, 1));
        assert!(mm.commit(a, 1));
        assert!(mm.free(a));
    }

    #[test]
    fn test_word_skip_run_search() {
        let mut mm = VirtualMemoryManager::new();
        // Fill 64 consecutive blocks so the first bitmap word is all ones,
        // then check a multi-block run still lands after them.
        let fillers: Vec<_> = (0..64).map(|_| mm.alloc(BLOCK_SIZE).unwrap()).collect();
        let big = mm.alloc(BLOCK_SIZE * 4).unwrap();
        assert_eq!(
            big.as_ptr() as usize,
            fillers[0].as_ptr() as usize + 64 * BLOCK_SIZE
        );
        for f in fillers {
            assert!(mm.free(f));
        }
        assert!(mm.free(big));
        assert_eq!(mm.used_bytes(), 0);
    }
}
