//! Bitmap state, free-page cursor, and the virtual-to-physical mapper.
//!
//! The page manager is the sole owner of the bitmap, the mapper, and the
//! free-page cursor; no other component mutates them directly.

use tracing::{debug, warn};

use crate::bitmap::{Bitmap, PageState};
use crate::error::{Result, StoreError};
use crate::mapper::{MapCell, Mapper};

/// Result of looking up a virtual page's current backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingMapping {
    /// `vp >= N`, or the mapper cell is UNALLOCATED.
    NotMapped,
    /// The mapper cell is GARBAGE-RECLAIMED.
    Reclaimed,
    /// `vp` is bound to physical page `pp`, currently in `state`.
    Mapped { pp: u32, state: PageState },
}

pub struct PageManager {
    bitmap: Bitmap,
    mapper: Mapper,
    current_free_page: u32,
    read_only: bool,
    total_written_page: u32,
    n: u32,
}

impl PageManager {
    pub fn new(n: u32) -> Self {
        let mut pm = Self {
            bitmap: Bitmap::new_free(n),
            mapper: Mapper::new_unallocated(n),
            current_free_page: 0,
            read_only: false,
            total_written_page: 0,
            n,
        };
        pm.fix_free_page_pointer(0);
        pm
    }

    pub fn from_parts(bitmap: Bitmap, mapper: Mapper, total_written_page: u32) -> Self {
        let n = bitmap.len();
        let mut pm = Self {
            bitmap,
            mapper,
            current_free_page: 0,
            read_only: false,
            total_written_page,
            n,
        };
        pm.fix_free_page_pointer(0);
        pm
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn total_written_page(&self) -> u32 {
        self.total_written_page
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn total_pages(&self) -> u32 {
        self.n
    }

    /// Whether `current_free_page` currently refers to a FREE bitmap entry.
    /// Only meaningful when not read-only; see the design doc's §8 invariant.
    pub fn free_cursor_is_free(&self) -> bool {
        self.bitmap.get(self.current_free_page) == PageState::Free
    }

    pub fn get_ppage_state(&self, pp: u32) -> PageState {
        self.bitmap.get(pp)
    }

    pub fn set_ppage_state(&mut self, pp: u32, state: PageState) {
        self.bitmap.set(pp, state);
    }

    /// Scans from `start`, wrapping modulo `N`, for the first FREE entry.
    /// If the scan returns to `start` without finding one, flips the
    /// partition read-only.
    pub fn fix_free_page_pointer(&mut self, start: u32) {
        let start = start % self.n;
        let mut pp = start;
        loop {
            if self.bitmap.get(pp) == PageState::Free {
                self.current_free_page = pp;
                self.read_only = false;
                return;
            }
            pp = (pp + 1) % self.n;
            if pp == start {
                warn!("free-page scan wrapped with no FREE entry; flipping read-only");
                self.read_only = true;
                return;
            }
        }
    }

    /// Returns the current free page and advances the cursor past it.
    pub fn get_free_page(&mut self) -> Result<u32> {
        if self.read_only {
            return Err(StoreError::NoSpace);
        }
        let pp = self.current_free_page;
        self.fix_free_page_pointer((pp + 1) % self.n);
        Ok(pp)
    }

    /// Like [`Self::get_free_page`] but skips any page inside `forbidden_block`.
    fn get_free_page_avoiding_block(&mut self, forbidden_block: u32, ppb: u32) -> Result<u32> {
        let forbidden_start = forbidden_block * ppb;
        let forbidden_end = forbidden_start + ppb;
        let mut attempts = 0u32;
        loop {
            let pp = self.get_free_page()?;
            if pp < forbidden_start || pp >= forbidden_end {
                return Ok(pp);
            }
            // This free page lies in the block being reclaimed; put it back
            // and keep looking. It stays FREE (we never allocated it), so a
            // later pass (or ordinary allocation) can still use it once the
            // block is no longer forbidden.
            attempts += 1;
            if attempts >= self.n {
                return Err(StoreError::NoSpace);
            }
        }
    }

    pub fn get_existing_mapping(&self, vp: u32) -> ExistingMapping {
        if vp >= self.n {
            return ExistingMapping::NotMapped;
        }
        match self.mapper.get(vp) {
            MapCell::Unallocated => ExistingMapping::NotMapped,
            MapCell::Reclaimed => ExistingMapping::Reclaimed,
            MapCell::Mapped(pp) => ExistingMapping::Mapped {
                pp,
                state: self.bitmap.get(pp),
            },
        }
    }

    /// Must only be called when `mapper[vp]` is UNALLOCATED or RECLAIMED.
    pub fn create_mapping(&mut self, vp: u32) -> Result<u32> {
        let pp = self.get_free_page()?;
        self.bind(vp, pp);
        Ok(pp)
    }

    /// As [`Self::create_mapping`], but never binds a free page that lies in
    /// `forbidden_block`. Used by GC to avoid placing a migrated page back
    /// into the block it is being evacuated from.
    pub fn create_mapping_avoiding_block(&mut self, vp: u32, forbidden_block: u32, ppb: u32) -> Result<u32> {
        let pp = self.get_free_page_avoiding_block(forbidden_block, ppb)?;
        self.bind(vp, pp);
        Ok(pp)
    }

    fn bind(&mut self, vp: u32, pp: u32) {
        self.mapper.set(vp, MapCell::Mapped(pp));
        self.bitmap.set(pp, PageState::Valid);
        self.total_written_page += 1;
        debug!(vp, pp, "bound virtual page to physical page");
    }

    /// Pre-verifies that `mapper[vp..vp+num_pages)` are all UNALLOCATED or
    /// RECLAIMED, then allocates physical pages one by one. On a per-page
    /// allocation failure the already-bound pages are left in place; the
    /// caller is responsible for compensating (the `set` path abandons the
    /// whole record on `NoSpace`).
    pub fn create_mapping_multipage(&mut self, vp: u32, num_pages: u32) -> Result<Vec<u32>> {
        for offset in 0..num_pages {
            let v = (vp + offset) % self.n;
            match self.mapper.get(v) {
                MapCell::Unallocated | MapCell::Reclaimed => {}
                MapCell::Mapped(_) => {
                    return Err(StoreError::NotPermitted { vpage: v });
                }
            }
        }
        let mut bound = Vec::with_capacity(num_pages as usize);
        for offset in 0..num_pages {
            let v = (vp + offset) % self.n;
            let pp = self.create_mapping(v)?;
            bound.push(pp);
        }
        Ok(bound)
    }

    /// For each page in `[vp, vp+num_pages)`, requires current state VALID,
    /// then sets INVALID. Fails with `AlreadyInvalid` on any non-VALID entry
    /// (no partial effect: the range is checked before any bit is flipped).
    pub fn mark_vpage_invalid(&mut self, vp: u32, num_pages: u32) -> Result<()> {
        let mut pps = Vec::with_capacity(num_pages as usize);
        for offset in 0..num_pages {
            let v = (vp + offset) % self.n;
            match self.mapper.get(v) {
                MapCell::Mapped(pp) if self.bitmap.get(pp) == PageState::Valid => pps.push(pp),
                _ => return Err(StoreError::AlreadyInvalid { vpage: v }),
            }
        }
        for pp in pps {
            self.bitmap.set(pp, PageState::Invalid);
        }
        Ok(())
    }

    /// Reverse lookup used by GC: the `vp` currently bound to `pp`.
    pub fn find_vpage_for(&self, pp: u32) -> Option<u32> {
        self.mapper.find_vpage_for(pp)
    }

    pub fn set_mapper_cell(&mut self, vp: u32, cell: MapCell) {
        self.mapper.set(vp, cell);
    }

    pub fn dec_total_written_page(&mut self) {
        self.total_written_page = self.total_written_page.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pm(n: u32) -> PageManager {
        PageManager::new(n)
    }

    #[test]
    fn create_mapping_marks_valid_and_counts() {
        let mut pm = pm(8);
        let pp = pm.create_mapping(3).unwrap();
        assert_eq!(pm.get_ppage_state(pp), PageState::Valid);
        assert_eq!(pm.total_written_page(), 1);
        assert_eq!(
            pm.get_existing_mapping(3),
            ExistingMapping::Mapped {
                pp,
                state: PageState::Valid
            }
        );
    }

    #[test]
    fn multipage_not_permitted_when_later_page_mapped() {
        let mut pm = pm(8);
        pm.create_mapping(2).unwrap();
        let err = pm.create_mapping_multipage(1, 2).unwrap_err();
        assert!(matches!(err, StoreError::NotPermitted { vpage: 2 }));
    }

    #[test]
    fn mark_invalid_requires_valid() {
        let mut pm = pm(8);
        let err = pm.mark_vpage_invalid(0, 1).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyInvalid { vpage: 0 }));
    }

    #[test]
    fn mark_invalid_round_trip() {
        let mut pm = pm(8);
        pm.create_mapping_multipage(0, 3).unwrap();
        pm.mark_vpage_invalid(0, 3).unwrap();
        for vp in 0..3 {
            match pm.get_existing_mapping(vp) {
                ExistingMapping::Mapped { state, .. } => assert_eq!(state, PageState::Invalid),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn exhausting_free_pages_sets_read_only() {
        let mut pm = pm(2);
        pm.create_mapping(0).unwrap();
        pm.create_mapping(1).unwrap();
        assert!(pm.is_read_only());
        assert!(matches!(pm.get_free_page(), Err(StoreError::NoSpace)));
    }

    #[test]
    fn avoiding_block_skips_forbidden_range() {
        let mut pm = pm(4); // ppb=2 -> block0 = {0,1}, block1 = {2,3}
        let pp = pm.create_mapping_avoiding_block(0, 0, 2).unwrap();
        assert!(pp >= 2, "expected a page outside block 0, got {pp}");
    }
}
