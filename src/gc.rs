//! Block-granularity garbage collection: migrate still-valid pages out of a
//! block, erase it, then reclaim its now-free pages.

use tracing::info;

use crate::bitmap::PageState;
use crate::device::PartitionDevice;
use crate::error::Result;
use crate::mapper::MapCell;
use crate::page_manager::PageManager;

/// Summary of one [`collect`] invocation, useful for logging and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub blocks_reclaimed: u32,
    pub pages_migrated: u32,
}

/// Runs one GC pass at reclaim threshold `t`: a block is reclaimed when its
/// invalid-page count is at least `pages_per_block / t`.
///
/// Blocks are visited in order `0..num_blocks`. If migration runs out of
/// free pages partway through a block, GC stops immediately and surfaces
/// the error; blocks after the failing one are not attempted this
/// invocation (the spec explicitly allows leaving the rest for next time).
pub fn collect(pm: &mut PageManager, data: &mut dyn PartitionDevice, t: u32) -> Result<GcStats> {
    let geom = data.geometry();
    let ppb = geom.pages_per_block();
    let page_size = geom.page_size() as usize;
    let mut stats = GcStats::default();

    for block in 0..geom.num_blocks() {
        let base = block * ppb;
        let invalid_count = (0..ppb)
            .filter(|&i| pm.get_ppage_state(base + i) == PageState::Invalid)
            .count() as u32;

        if invalid_count < ppb / t.max(1) {
            continue;
        }

        reclaim_block(pm, data, block, ppb, page_size, &mut stats)?;
        stats.blocks_reclaimed += 1;
    }

    if stats.blocks_reclaimed > 0 {
        info!(
            blocks = stats.blocks_reclaimed,
            pages_migrated = stats.pages_migrated,
            "garbage collection pass complete"
        );
    }
    Ok(stats)
}

fn reclaim_block(
    pm: &mut PageManager,
    data: &mut dyn PartitionDevice,
    block: u32,
    ppb: u32,
    page_size: usize,
    stats: &mut GcStats,
) -> Result<()> {
    let base = block * ppb;

    // Step 1: migrate every VALID page out of the block before anything is
    // erased. A page's owning vpage keeps pointing at the old physical page
    // until this rebind, so in-flight readers never see a torn mapping.
    let mut scratch = vec![0u8; page_size];
    for pp in base..base + ppb {
        if pm.get_ppage_state(pp) != PageState::Valid {
            continue;
        }
        let vp = pm
            .find_vpage_for(pp)
            .expect("VALID physical page must have an owning vpage");

        data.read_page(pp, &mut scratch)?;
        let new_pp = pm.create_mapping_avoiding_block(vp, block, ppb)?;
        data.write_page(new_pp, &scratch)?;

        pm.set_ppage_state(pp, PageState::Invalid);
        // `create_mapping_avoiding_block` counted the new page as freshly
        // written, and the old page is still counted too (now INVALID
        // instead of VALID) -- both are real physical pages in
        // {VALID, INVALID} right now, so `total_written_page` is correct as
        // is. It is not compensated here: compensation happens in step 3,
        // once the old page actually turns FREE. Decrementing early would
        // leave the counter one-too-low per migrated page if a later
        // migration in this same block aborts before the erase runs.
        stats.pages_migrated += 1;
    }

    // Record which pages are INVALID going into the erase: these are the
    // ones step 3 must reclaim. Pages erased while FREE/RESERVED need no
    // further bookkeeping.
    let was_invalid: Vec<u32> = (base..base + ppb)
        .filter(|&pp| pm.get_ppage_state(pp) == PageState::Invalid)
        .collect();

    // Step 2: erase. Migration must fully precede this so no reverse lookup
    // ever races a half-migrated page.
    data.erase_blocking(block, 1)?;

    // Step 3: reclaim. Must run after the erase so a stale reverse lookup
    // can't collide with a page that is mid-migration. Every page in
    // `was_invalid` is about to turn FREE below, so each one decrements
    // `total_written_page` exactly once here -- whether or not a dangling
    // mapper cell still points at it. A migrated-out page's vp was already
    // rebound to its new location in step 1, so `find_vpage_for` finds
    // nothing for it; a pre-existing invalid page's vp is still dangling
    // and gets marked RECLAIMED so a later `set` can reuse that vpage.
    for pp in was_invalid {
        if let Some(vp) = pm.find_vpage_for(pp) {
            pm.set_mapper_cell(vp, MapCell::Reclaimed);
        }
        pm.dec_total_written_page();
    }
    for pp in base..base + ppb {
        pm.set_ppage_state(pp, PageState::Free);
    }
    pm.fix_free_page_pointer(base);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemPartition, PartitionGeometry};

    fn data_dev(blocks: u32, ppb: u32, page_size: u32) -> (MemPartition, u32) {
        let geom = PartitionGeometry::new(page_size * ppb, page_size, blocks).unwrap();
        (MemPartition::new(geom), geom.total_pages())
    }

    #[test]
    fn reclaims_block_over_threshold_and_migrates_live_pages() {
        let ppb = 4u32;
        let (mut data, n) = data_dev(2, ppb, 32);
        let mut pm = PageManager::new(n);

        // Fill block 0 entirely, then invalidate 3 of its 4 pages, leaving
        // one VALID page that must be migrated before the block is erased.
        for vp in 0..ppb {
            pm.create_mapping(vp).unwrap();
        }
        pm.mark_vpage_invalid(0, 1).unwrap();
        pm.mark_vpage_invalid(1, 1).unwrap();
        pm.mark_vpage_invalid(2, 1).unwrap();

        let before_total = pm.total_written_page();
        let stats = collect(&mut pm, &mut data, 2).unwrap(); // threshold: invalid_count(3) >= ppb/2(2)
        assert_eq!(stats.blocks_reclaimed, 1);
        assert_eq!(stats.pages_migrated, 1);

        // The migrated vpage (3) must now point outside block 0.
        match pm.get_existing_mapping(3) {
            crate::page_manager::ExistingMapping::Mapped { pp, state } => {
                assert!(pp >= ppb, "migrated page must land outside block 0");
                assert_eq!(state, PageState::Valid);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Reclaimed vpages must read back as RECLAIMED, not dangling.
        for vp in 0..3 {
            assert_eq!(
                pm.get_existing_mapping(vp),
                crate::page_manager::ExistingMapping::Reclaimed
            );
        }

        // total_written_page must equal count(VALID|INVALID) after GC settles.
        let live_count = (0..n)
            .filter(|&pp| {
                matches!(
                    pm.get_ppage_state(pp),
                    PageState::Valid | PageState::Invalid
                )
            })
            .count() as u32;
        assert_eq!(pm.total_written_page(), live_count);
        assert_eq!(pm.total_written_page(), before_total - 3);
    }

    #[test]
    fn block_below_threshold_is_left_alone() {
        let ppb = 4u32;
        let (mut data, n) = data_dev(2, ppb, 32);
        let mut pm = PageManager::new(n);
        for vp in 0..ppb {
            pm.create_mapping(vp).unwrap();
        }
        pm.mark_vpage_invalid(0, 1).unwrap();

        let stats = collect(&mut pm, &mut data, 2).unwrap(); // invalid_count(1) < ppb/2(2)
        assert_eq!(stats.blocks_reclaimed, 0);
        assert_eq!(pm.get_ppage_state(0), PageState::Invalid);
    }

    #[test]
    fn aborted_migration_does_not_undercount_total_written_page() {
        // One free page total, two VALID pages to migrate out of the
        // reclaimed block: the first migration consumes the last free page,
        // the second then hits NoSpace and reclaim_block must return early
        // without having decremented total_written_page for the first
        // (already-migrated) page.
        let ppb = 4u32;
        let (mut data, n) = data_dev(2, ppb, 32); // n=8: block0 = pp0..4, block1 = pp4..8

        let mut pm = PageManager::new(n);
        for vp in 0..7u32 {
            pm.create_mapping(vp).unwrap(); // binds pp0..7 in order, leaving pp7 FREE
        }
        pm.mark_vpage_invalid(0, 1).unwrap();
        pm.mark_vpage_invalid(1, 1).unwrap();
        // block0 now: pp0 INVALID, pp1 INVALID, pp2 VALID(vp2), pp3 VALID(vp3)

        let before_total = pm.total_written_page();
        let err = collect(&mut pm, &mut data, 2).unwrap_err(); // invalid_count(2) >= ppb/2(2)
        assert!(matches!(err, crate::error::StoreError::NoSpace));

        let live_count = (0..n)
            .filter(|&pp| {
                matches!(
                    pm.get_ppage_state(pp),
                    PageState::Valid | PageState::Invalid
                )
            })
            .count() as u32;
        assert_eq!(
            pm.total_written_page(),
            live_count,
            "total_written_page must still equal count(VALID|INVALID) after an aborted migration"
        );
        // One extra page (vp2's new home) is now counted on top of the
        // original 7, since its old slot stays INVALID rather than being
        // freed (the erase never ran).
        assert_eq!(pm.total_written_page(), before_total + 1);
    }
}
