//! The META-partition layout: signature page, bitmap region, mapper region.
//!
//! ```text
//! page 0                              signature
//! page 1 .. 1+bm_pages-1               bitmap
//! page 1+bm_pages                      (skip page)
//! page 2+bm_pages .. 2+bm_pages+map_pages-1   mapper
//! ```

use tracing::info;

use crate::bitmap::Bitmap;
use crate::device::PartitionDevice;
use crate::error::{Result, StoreError};
use crate::mapper::Mapper;
use crate::page_manager::PageManager;

const MAGIC: u32 = 0xDEAD_BEEF;
const MAGIC_OFFSET: usize = 0;
const TOTAL_WRITTEN_OFFSET: usize = 16;

/// Computed layout of the META partition for a DATA partition of `n` pages.
#[derive(Debug, Clone, Copy)]
pub struct MetaLayout {
    pub bm_pages: u32,
    pub map_pages: u32,
    page_size: u32,
}

impl MetaLayout {
    pub fn compute(n: u32, page_size: u32) -> Self {
        let bm_bytes = n.div_ceil(4) as u64;
        let map_bytes = n as u64 * 8;
        let bm_pages = bm_bytes.div_ceil(page_size as u64) as u32;
        let map_pages = map_bytes.div_ceil(page_size as u64) as u32;
        Self {
            bm_pages,
            map_pages,
            page_size,
        }
    }

    pub fn bitmap_start(&self) -> u32 {
        1
    }

    pub fn mapper_start(&self) -> u32 {
        // one skip page after the bitmap region
        self.bitmap_start() + self.bm_pages + 1
    }

    pub fn total_pages(&self) -> u32 {
        self.mapper_start() + self.map_pages
    }
}

/// Reads/writes the signature page, bitmap region, and mapper region of the
/// META partition, and owns the in-memory [`PageManager`] they reconstruct.
pub struct MetadataCodec {
    layout: MetaLayout,
}

impl MetadataCodec {
    /// Writes a fresh signature page (magic + `total_written_page = 0`),
    /// leaving the rest of the page `0xFF`.
    pub fn create_signature(meta: &mut dyn PartitionDevice, total_written_page: u32) -> Result<()> {
        let page_size = meta.geometry().page_size() as usize;
        let mut buf = vec![0xFFu8; page_size];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[TOTAL_WRITTEN_OFFSET..TOTAL_WRITTEN_OFFSET + 4]
            .copy_from_slice(&total_written_page.to_le_bytes());
        meta.write_page(0, &buf)
    }

    /// Reconstructs (or freshly allocates) the page manager from the META
    /// partition. `read_from_disk = false` is used by `format()`.
    pub fn construct(
        meta: &mut dyn PartitionDevice,
        data_n: u32,
        data_page_size: u32,
        read_from_disk: bool,
    ) -> Result<(Self, PageManager)> {
        let layout = MetaLayout::compute(data_n, data_page_size);
        if layout.total_pages() > meta.geometry().total_pages() {
            return Err(StoreError::AllocFail(format!(
                "signature+bitmap+mapper need {} pages but META partition has {}",
                layout.total_pages(),
                meta.geometry().total_pages()
            )));
        }

        let codec = Self { layout };

        if read_from_disk {
            let page_size = meta.geometry().page_size() as usize;
            let mut sig = vec![0u8; page_size];
            meta.read_page(0, &mut sig)?;
            let magic = u32::from_le_bytes(sig[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap());
            if magic != MAGIC {
                return Err(StoreError::MustFormat);
            }
            let total_written_page = u32::from_le_bytes(
                sig[TOTAL_WRITTEN_OFFSET..TOTAL_WRITTEN_OFFSET + 4]
                    .try_into()
                    .unwrap(),
            );

            let bitmap_bytes_needed = data_n.div_ceil(4) as usize;
            let mut bitmap_raw = Vec::with_capacity(layout.bm_pages as usize * page_size);
            for i in 0..layout.bm_pages {
                let mut page = vec![0u8; page_size];
                meta.read_page(layout.bitmap_start() + i, &mut page)?;
                bitmap_raw.extend_from_slice(&page);
            }
            bitmap_raw.truncate(bitmap_bytes_needed);
            let bitmap = Bitmap::from_bytes(bitmap_raw, data_n);

            let mapper_bytes_needed = data_n as usize * 8;
            let mut mapper_raw = Vec::with_capacity(layout.map_pages as usize * page_size);
            for i in 0..layout.map_pages {
                let mut page = vec![0u8; page_size];
                meta.read_page(layout.mapper_start() + i, &mut page)?;
                mapper_raw.extend_from_slice(&page);
            }
            mapper_raw.truncate(mapper_bytes_needed);
            let mapper = Mapper::from_bytes(&mapper_raw, data_n);

            info!(total_written_page, "reconstructed metadata from flash");
            Ok((codec, PageManager::from_parts(bitmap, mapper, total_written_page)))
        } else {
            info!("constructing fresh metadata (format)");
            Ok((codec, PageManager::new(data_n)))
        }
    }

    /// Erases the covering META blocks, then rewrites signature, bitmap,
    /// and mapper pages.
    pub fn flush(&self, meta: &mut dyn PartitionDevice, pm: &PageManager) -> Result<()> {
        let ppb = meta.geometry().pages_per_block();
        let blocks_needed = self.layout.total_pages().div_ceil(ppb);
        meta.erase_blocking(0, blocks_needed)?;

        Self::create_signature(meta, pm.total_written_page())?;

        let page_size = meta.geometry().page_size() as usize;
        let bitmap_bytes = pm.bitmap().as_bytes();
        for i in 0..self.layout.bm_pages {
            let start = i as usize * page_size;
            let mut page = vec![0xFFu8; page_size];
            let end = (start + page_size).min(bitmap_bytes.len());
            if start < bitmap_bytes.len() {
                page[..end - start].copy_from_slice(&bitmap_bytes[start..end]);
            }
            meta.write_page(self.layout.bitmap_start() + i, &page)?;
        }

        let mapper_bytes = pm.mapper().to_bytes();
        for i in 0..self.layout.map_pages {
            let start = i as usize * page_size;
            let mut page = vec![0xFFu8; page_size];
            let end = (start + page_size).min(mapper_bytes.len());
            if start < mapper_bytes.len() {
                page[..end - start].copy_from_slice(&mapper_bytes[start..end]);
            }
            meta.write_page(self.layout.mapper_start() + i, &page)?;
        }

        info!(
            total_written_page = pm.total_written_page(),
            "flushed metadata to flash"
        );
        Ok(())
    }

    pub fn layout(&self) -> MetaLayout {
        self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemPartition, PartitionGeometry};

    fn meta_dev(pages: u32, page_size: u32) -> MemPartition {
        let blocks = pages.div_ceil(4);
        let geom = PartitionGeometry::new(page_size * 4, page_size, blocks).unwrap();
        MemPartition::new(geom)
    }

    #[test]
    fn fresh_format_then_flush_then_reconstruct() {
        let data_n = 64u32;
        let page_size = 128u32;
        let layout = MetaLayout::compute(data_n, page_size);
        let mut meta = meta_dev(layout.total_pages() + 4, page_size);

        let (codec, mut pm) = MetadataCodec::construct(&mut meta, data_n, page_size, false).unwrap();
        pm.create_mapping(5).unwrap();
        codec.flush(&mut meta, &pm).unwrap();

        let (_codec2, pm2) = MetadataCodec::construct(&mut meta, data_n, page_size, true).unwrap();
        assert_eq!(pm2.total_written_page(), 1);
        assert_eq!(pm.bitmap().as_bytes(), pm2.bitmap().as_bytes());
        assert_eq!(pm.mapper().to_bytes(), pm2.mapper().to_bytes());
    }

    #[test]
    fn bad_signature_requires_format() {
        let data_n = 64u32;
        let page_size = 128u32;
        let layout = MetaLayout::compute(data_n, page_size);
        let mut meta = meta_dev(layout.total_pages() + 4, page_size);
        let err = MetadataCodec::construct(&mut meta, data_n, page_size, true).unwrap_err();
        assert!(matches!(err, StoreError::MustFormat));
    }

    #[test]
    fn metadata_too_big_for_partition_fails() {
        let data_n = 100_000u32;
        let page_size = 128u32;
        let mut meta = meta_dev(4, page_size);
        let err = MetadataCodec::construct(&mut meta, data_n, page_size, false).unwrap_err();
        assert!(matches!(err, StoreError::AllocFail(_)));
    }
}
