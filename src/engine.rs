//! The key-value engine: ties the page manager, record codec, garbage
//! collector, and lookup cache into `format`/`set`/`get`/`delete`.

use tracing::{debug, warn};

use crate::bitmap::PageState;
use crate::cache::{CacheEntry, LookupCache};
use crate::device::PartitionDevice;
use crate::error::{Result, StoreError};
use crate::gc;
use crate::metadata::MetadataCodec;
use crate::page_manager::{ExistingMapping, PageManager};
use crate::record;

/// Tunable knobs the source left as compile-time constants.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// GC reclaim threshold `T`: a block is reclaimed once its invalid-page
    /// count is at least `pages_per_block / gc_threshold`.
    pub gc_threshold: u32,
    /// GC fires on `set`/`delete` once `total_written_page * gc_trigger_divisor > N`.
    pub gc_trigger_divisor: u32,
    /// Lookup cache capacity.
    pub cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 2,
            gc_trigger_divisor: 2,
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
        }
    }
}

/// The mounted store: a META partition, a DATA partition, and the
/// in-memory state reconstructed from (or freshly allocated for) them.
pub struct Engine<M: PartitionDevice, D: PartitionDevice> {
    meta: M,
    data: D,
    codec: MetadataCodec,
    pm: PageManager,
    cache: LookupCache,
    config: EngineConfig,
}

impl<M: PartitionDevice, D: PartitionDevice> Engine<M, D> {
    /// Mounts an already-formatted pair of partitions, rebuilding the page
    /// manager from the META partition's signature, bitmap, and mapper.
    /// Fails with [`StoreError::MustFormat`] if the signature is missing or
    /// invalid.
    pub fn mount(mut meta: M, data: D, config: EngineConfig) -> Result<Self> {
        let n = data.geometry().total_pages();
        let page_size = data.geometry().page_size();
        let (codec, pm) = MetadataCodec::construct(&mut meta, n, page_size, true)?;
        debug!(n, "mounted store");
        Ok(Self {
            meta,
            data,
            codec,
            pm,
            cache: LookupCache::new(config.cache_capacity),
            config,
        })
    }

    /// Erases both partitions and rebuilds empty metadata. This is the only
    /// recovery path from [`StoreError::MustFormat`].
    pub fn format(mut meta: M, mut data: D, config: EngineConfig) -> Result<Self> {
        let blocks = data.geometry().num_blocks();
        data.erase_blocking(0, blocks)?;
        let n = data.geometry().total_pages();
        let page_size = data.geometry().page_size();
        let (codec, pm) = MetadataCodec::construct(&mut meta, n, page_size, false)?;
        codec.flush(&mut meta, &pm)?;
        tracing::info!("store formatted");
        Ok(Self {
            meta,
            data,
            codec,
            pm,
            cache: LookupCache::new(config.cache_capacity),
            config,
        })
    }

    /// Flushes metadata back to the META partition. Consumes the engine:
    /// after unmount, the partitions may be handed to a fresh `mount`.
    pub fn unmount(mut self) -> Result<(M, D)> {
        self.codec.flush(&mut self.meta, &self.pm)?;
        tracing::info!("store unmounted");
        Ok((self.meta, self.data))
    }

    pub fn total_written_page(&self) -> u32 {
        self.pm.total_written_page()
    }

    pub fn is_read_only(&self) -> bool {
        self.pm.is_read_only()
    }

    fn maybe_run_gc(&mut self) -> Result<()> {
        let n = self.pm.total_pages() as u64;
        let written = self.pm.total_written_page() as u64;
        if written * self.config.gc_trigger_divisor as u64 > n {
            gc::collect(&mut self.pm, &mut self.data, self.config.gc_threshold)?;
        }
        Ok(())
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let page_size = self.data.geometry().page_size();

        self.maybe_run_gc()?;

        if let Some((old_vp, old_num_pages)) = self.locate(key)? {
            self.pm.mark_vpage_invalid(old_vp, old_num_pages)?;
        }

        let num_pages = record::num_pages_for(key.len() as u32, value.len() as u32, page_size)?;
        let n = self.pm.total_pages();
        let start = record::hash_to_vpage(key, n);
        let mut vp = start;
        for _ in 0..n {
            match self.pm.get_existing_mapping(vp) {
                ExistingMapping::NotMapped | ExistingMapping::Reclaimed => {
                    match self.pm.create_mapping_multipage(vp, num_pages) {
                        Ok(pps) => {
                            let pages = record::encode_pages(key, value, page_size, num_pages)?;
                            for (pp, page) in pps.iter().zip(pages.iter()) {
                                self.data.write_page(*pp, page)?;
                            }
                            self.cache.update(
                                key.to_vec(),
                                CacheEntry {
                                    vpage: vp,
                                    num_pages,
                                    value: value.to_vec(),
                                },
                            );
                            return Ok(());
                        }
                        Err(StoreError::NotPermitted { .. }) => {
                            vp = (vp + 1) % n;
                            continue;
                        }
                        Err(StoreError::NoSpace) => {
                            self.cache.remove(key);
                            warn!("data partition exhausted during set");
                            return Err(StoreError::NoSpace);
                        }
                        Err(other) => return Err(other),
                    }
                }
                _ => {
                    vp = (vp + 1) % n;
                }
            }
        }
        self.cache.remove(key);
        Err(StoreError::NoSpace)
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(entry) = self.cache.lookup(key) {
            return Ok(entry.value.clone());
        }
        match self.find_existing(key)? {
            Some((vp, num_pages, value)) => {
                self.cache.update(
                    key.to_vec(),
                    CacheEntry {
                        vpage: vp,
                        num_pages,
                        value: value.clone(),
                    },
                );
                Ok(value)
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.maybe_run_gc()?;
        match self.locate(key)? {
            Some((vp, num_pages)) => {
                self.pm.mark_vpage_invalid(vp, num_pages)?;
                self.cache.remove(key);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    /// Locates a live record's `(vpage, num_pages)` without reading its
    /// value, for the invalidate-before-overwrite and delete paths.
    fn locate(&mut self, key: &[u8]) -> Result<Option<(u32, u32)>> {
        if let Some(entry) = self.cache.lookup(key) {
            return Ok(Some((entry.vpage, entry.num_pages)));
        }
        Ok(self
            .find_existing(key)?
            .map(|(vp, num_pages, _)| (vp, num_pages)))
    }

    /// Probes from `hash(key)`, reading each mapped VALID head page,
    /// checking the NEW_KEY marker, and verifying the key bytes.
    ///
    /// A `kl` mismatch on the current head page does not terminate the
    /// probe -- it only advances to the next virtual page (per the design
    /// doc's resolution of the "break vs. continue" open question).
    /// The probe itself terminates on NOT_MAPPED, or after `N` attempts.
    fn find_existing(&mut self, key: &[u8]) -> Result<Option<(u32, u32, Vec<u8>)>> {
        let n = self.pm.total_pages();
        let page_size = self.data.geometry().page_size() as usize;
        let start = record::hash_to_vpage(key, n);
        let mut vp = start;

        for _ in 0..n {
            let (pp, state) = match self.pm.get_existing_mapping(vp) {
                ExistingMapping::NotMapped => return Ok(None),
                ExistingMapping::Reclaimed => {
                    vp = (vp + 1) % n;
                    continue;
                }
                ExistingMapping::Mapped { pp, state } => (pp, state),
            };
            if state != PageState::Valid {
                vp = (vp + 1) % n;
                continue;
            }

            let mut head = vec![0u8; page_size];
            self.data.read_page(pp, &mut head)?;
            if !record::has_new_key_marker(&head) {
                vp = (vp + 1) % n;
                continue;
            }
            let rh = record::decode_head(&head);
            if rh.kl != key.len() as u32 {
                vp = (vp + 1) % n;
                continue;
            }

            let mut pages = Vec::with_capacity(rh.num_pages as usize);
            pages.push(head);
            let mut ok = true;
            for offset in 1..rh.num_pages {
                let cont_vp = (vp + offset) % n;
                match self.pm.get_existing_mapping(cont_vp) {
                    ExistingMapping::Mapped {
                        pp: cont_pp,
                        state: PageState::Valid,
                    } => {
                        let mut page = vec![0u8; page_size];
                        self.data.read_page(cont_pp, &mut page)?;
                        pages.push(page);
                    }
                    _ => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                vp = (vp + 1) % n;
                continue;
            }

            let found_key = record::decode_key_only(&pages, &rh);
            if found_key != key {
                vp = (vp + 1) % n;
                continue;
            }

            let (_, value) = record::decode_key_value(&pages, &rh);
            debug!(vp, num_pages = rh.num_pages, "probe hit");
            return Ok(Some((vp, rh.num_pages, value)));
        }
        Ok(None)
    }
}

#[cfg(test)]
impl<M: PartitionDevice, D: PartitionDevice> Engine<M, D> {
    /// Checks the design doc's §8 structural invariants: every VALID
    /// physical page has exactly one owning vpage, every mapped vpage backs
    /// a VALID-or-INVALID physical page, and `total_written_page` equals the
    /// count of VALID-or-INVALID physical pages.
    fn assert_invariants(&self) {
        let n = self.pm.total_pages();
        let mut owner_of_valid: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        for vp in 0..n {
            if let ExistingMapping::Mapped { pp, state } = self.pm.get_existing_mapping(vp) {
                assert!(
                    matches!(state, PageState::Valid | PageState::Invalid),
                    "mapped vpage {vp} backs pp {pp} in state {state:?}, expected VALID or INVALID"
                );
                if state == PageState::Valid {
                    let prior = owner_of_valid.insert(pp, vp);
                    assert!(prior.is_none(), "pp {pp} has two owning vpages: {prior:?} and {vp}");
                }
            }
        }

        let mut live_count = 0u32;
        for pp in 0..n {
            let state = self.pm.get_ppage_state(pp);
            if state == PageState::Valid {
                assert!(owner_of_valid.contains_key(&pp), "VALID pp {pp} has no owning vpage");
            }
            if matches!(state, PageState::Valid | PageState::Invalid) {
                live_count += 1;
            }
        }
        assert_eq!(
            self.pm.total_written_page(),
            live_count,
            "total_written_page must equal count(VALID|INVALID)"
        );
        assert!(
            self.pm.is_read_only() || self.pm.free_cursor_is_free(),
            "current_free_page must refer to a FREE entry unless the partition is read-only"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemPartition, PartitionGeometry};

    fn new_store(page_size: u32, data_blocks: u32, ppb: u32) -> Engine<MemPartition, MemPartition> {
        let data_geom = PartitionGeometry::new(page_size * ppb, page_size, data_blocks).unwrap();
        let n = data_geom.total_pages();
        let meta_layout = crate::metadata::MetaLayout::compute(n, page_size);
        let meta_blocks = meta_layout.total_pages().div_ceil(ppb) + 1;
        let meta_geom = PartitionGeometry::new(page_size * ppb, page_size, meta_blocks).unwrap();

        let meta = MemPartition::new(meta_geom);
        let data = MemPartition::new(data_geom);
        Engine::format(meta, data, EngineConfig::default()).unwrap()
    }

    #[test]
    fn single_page_round_trip() {
        let mut store = new_store(128, 8, 4);
        store.set(b"alpha", b"x").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), b"x");
        assert_eq!(store.total_written_page(), 1);
    }

    #[test]
    fn overwrite_invalidates_prior_placement() {
        let mut store = new_store(128, 8, 4);
        store.set(b"k", b"a").unwrap();
        store.set(b"k", b"bb").unwrap();
        assert_eq!(store.get(b"k").unwrap(), b"bb");
        // two physical pages now exist for this key: one INVALID, one VALID
        assert_eq!(store.total_written_page(), 2);
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let mut store = new_store(128, 8, 4);
        store.set(b"k", b"v").unwrap();
        store.delete(b"k").unwrap();
        assert!(matches!(store.get(b"k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let mut store = new_store(128, 8, 4);
        assert!(matches!(store.delete(b"missing"), Err(StoreError::NotFound)));
    }

    #[test]
    fn unmount_then_mount_preserves_data() {
        let mut store = new_store(128, 8, 4);
        store.set(b"durable", b"value").unwrap();
        let (meta, data) = store.unmount().unwrap();

        let mut remounted = Engine::mount(meta, data, EngineConfig::default()).unwrap();
        assert_eq!(remounted.get(b"durable").unwrap(), b"value");
    }

    #[test]
    fn value_spanning_many_pages_round_trips() {
        let mut store = new_store(64, 16, 4);
        let value = vec![b'z'; 500];
        store.set(b"big", &value).unwrap();
        assert_eq!(store.get(b"big").unwrap(), value);
    }

    #[test]
    fn reformatting_clears_all_keys() {
        let mut store = new_store(128, 8, 4);
        store.set(b"k", b"v").unwrap();
        let (meta, data) = store.unmount().unwrap();

        let mut store2 = Engine::format(meta, data, EngineConfig::default()).unwrap();
        assert!(matches!(store2.get(b"k"), Err(StoreError::NotFound)));
    }

    #[test]
    fn invariants_hold_across_set_overwrite_delete() {
        let mut store = new_store(128, 8, 4);
        store.assert_invariants();
        store.set(b"a", b"1").unwrap();
        store.assert_invariants();
        store.set(b"b", b"22").unwrap();
        store.assert_invariants();
        store.set(b"a", b"111").unwrap(); // overwrite: old page INVALID, new VALID
        store.assert_invariants();
        store.delete(b"b").unwrap();
        store.assert_invariants();
    }

    #[test]
    fn invariants_hold_through_a_gc_pass() {
        // A config with GC disabled at the engine level lets the test drive
        // collection explicitly and check invariants right after.
        let mut store = new_store(32, 16, 4); // N = 64 small vpages
        for i in 0..20u32 {
            store.set(b"hot", i.to_string().as_bytes()).unwrap();
        }
        store.assert_invariants();
    }

    /// Boundary scenario 6 (design doc §8): exhausting the free-page scan
    /// flips the partition read-only; the next `set` returns `NoSpace` and
    /// leaves no partial record on flash, and a key written before
    /// exhaustion is still readable.
    #[test]
    fn read_only_transition_leaves_no_partial_record() {
        let mut store = new_store(32, 2, 4); // N = 8 virtual/physical pages
        let mut last_ok_key = None;
        for i in 0..16u32 {
            let key = format!("k{i}");
            match store.set(key.as_bytes(), b"v") {
                Ok(()) => last_ok_key = Some(key),
                Err(StoreError::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(store.is_read_only(), "store should be read-only once N unique keys fill every page");

        let before = store.total_written_page();
        let err = store.set(b"overflow", b"v").unwrap_err();
        assert!(matches!(err, StoreError::NoSpace));
        // No partial record: total_written_page is unchanged and the
        // overflowing key is not readable.
        assert_eq!(store.total_written_page(), before);
        assert!(matches!(store.get(b"overflow"), Err(StoreError::NotFound)));
        store.assert_invariants();

        // A key written before exhaustion must still be readable.
        if let Some(key) = last_ok_key {
            assert_eq!(store.get(key.as_bytes()).unwrap(), b"v");
        }
    }
}
