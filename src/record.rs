//! Record framing: the DJB2 probe hash, page-count sizing, and the
//! head/continuation page codec.
//!
//! Encoding treats the key and value as one concatenated byte stream: the
//! head page's payload region (`page_size - 16` bytes) takes the first
//! bytes of that stream, and each continuation page's payload region
//! (`page_size - 4` bytes) takes the next chunk. This single linear fill is
//! the generalization of the three layouts in the design doc (single page,
//! value-spill, key-spill): which table row applies falls out of where `kl`
//! happens to land in the stream, rather than being branched on explicitly.

use crate::error::{Result, StoreError};

pub const NEW_KEY_MARKER: u32 = 0x2000_0000;
pub const PREVIOUS_KEY_MARKER: u32 = 0x1000_0000;

const HEAD_HEADER_LEN: usize = 16;
const CONT_HEADER_LEN: usize = 4;

/// DJB2-style hash, reduced mod `n` to a starting virtual page.
pub fn hash_to_vpage(key: &[u8], n: u32) -> u32 {
    let mut h: u64 = 5381;
    for &c in key {
        h = h.wrapping_mul(33).wrapping_add(c as u64);
    }
    (h % n as u64) as u32
}

/// Smallest `num_pages` such that `12 + kl + vl <= (page_size - 4) * num_pages`.
pub fn num_pages_for(kl: u32, vl: u32, page_size: u32) -> Result<u32> {
    let page_payload = page_size.checked_sub(4).ok_or_else(|| {
        StoreError::InvalidGeometry("page_size must be greater than 4".into())
    })?;
    if page_payload == 0 {
        return Err(StoreError::InvalidGeometry(
            "page_size must leave room for a continuation marker".into(),
        ));
    }
    let needed = 12u64 + kl as u64 + vl as u64;
    let pages = needed.div_ceil(page_payload as u64);
    u32::try_from(pages).map_err(|_| StoreError::RecordTooLarge {
        size: needed,
        capacity: u64::from(u32::MAX) * page_payload as u64,
    })
}

/// The decoded head page (offsets per the on-flash format).
#[derive(Debug, Clone, Copy)]
pub struct RecordHead {
    pub num_pages: u32,
    pub kl: u32,
    pub vl: u32,
}

/// Encodes `key`/`value` into `num_pages` page-sized buffers: page 0 is the
/// head, the rest are continuations. Returns an error if the capacity of
/// `num_pages` pages of this `page_size` cannot actually hold `key`+`value`
/// (the caller is expected to have sized `num_pages` via [`num_pages_for`]).
pub fn encode_pages(key: &[u8], value: &[u8], page_size: u32, num_pages: u32) -> Result<Vec<Vec<u8>>> {
    let page_size = page_size as usize;
    let head_payload_cap = page_size - HEAD_HEADER_LEN;
    let cont_payload_cap = page_size - CONT_HEADER_LEN;

    let mut payload = Vec::with_capacity(key.len() + value.len());
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let total_capacity = head_payload_cap + (num_pages as usize).saturating_sub(1) * cont_payload_cap;
    if payload.len() > total_capacity {
        return Err(StoreError::RecordTooLarge {
            size: payload.len() as u64,
            capacity: total_capacity as u64,
        });
    }

    let mut pages = Vec::with_capacity(num_pages as usize);
    let mut cursor = 0usize;

    let mut head = vec![0u8; page_size];
    head[0..4].copy_from_slice(&NEW_KEY_MARKER.to_le_bytes());
    head[4..8].copy_from_slice(&num_pages.to_le_bytes());
    head[8..12].copy_from_slice(&(key.len() as u32).to_le_bytes());
    head[12..16].copy_from_slice(&(value.len() as u32).to_le_bytes());
    let take = head_payload_cap.min(payload.len() - cursor);
    head[HEAD_HEADER_LEN..HEAD_HEADER_LEN + take].copy_from_slice(&payload[cursor..cursor + take]);
    cursor += take;
    pages.push(head);

    for _ in 1..num_pages {
        let mut page = vec![0u8; page_size];
        page[0..4].copy_from_slice(&PREVIOUS_KEY_MARKER.to_le_bytes());
        let take = cont_payload_cap.min(payload.len() - cursor);
        page[CONT_HEADER_LEN..CONT_HEADER_LEN + take].copy_from_slice(&payload[cursor..cursor + take]);
        cursor += take;
        pages.push(page);
    }

    debug_assert_eq!(cursor, payload.len());
    Ok(pages)
}

/// Parses the head page's fixed fields. Does not validate the marker; use
/// [`has_new_key_marker`] for that.
pub fn decode_head(page0: &[u8]) -> RecordHead {
    RecordHead {
        num_pages: u32::from_le_bytes(page0[4..8].try_into().unwrap()),
        kl: u32::from_le_bytes(page0[8..12].try_into().unwrap()),
        vl: u32::from_le_bytes(page0[12..16].try_into().unwrap()),
    }
}

pub fn marker_of(page: &[u8]) -> u32 {
    u32::from_le_bytes(page[0..4].try_into().unwrap())
}

pub fn has_new_key_marker(page: &[u8]) -> bool {
    marker_of(page) == NEW_KEY_MARKER
}

/// Reassembles `key ++ value` from an in-order `[head, continuation...]`
/// page slice, then splits it at `kl`.
pub fn decode_key_value(pages: &[Vec<u8>], head: &RecordHead) -> (Vec<u8>, Vec<u8>) {
    let page_size = pages[0].len();
    let head_payload_cap = page_size - HEAD_HEADER_LEN;
    let cont_payload_cap = page_size - CONT_HEADER_LEN;

    let total = head.kl as usize + head.vl as usize;
    let mut payload = Vec::with_capacity(total);

    let take = head_payload_cap.min(total - payload.len());
    payload.extend_from_slice(&pages[0][HEAD_HEADER_LEN..HEAD_HEADER_LEN + take]);

    for page in &pages[1..] {
        if payload.len() >= total {
            break;
        }
        let take = cont_payload_cap.min(total - payload.len());
        payload.extend_from_slice(&page[CONT_HEADER_LEN..CONT_HEADER_LEN + take]);
    }

    let (key, value) = payload.split_at(head.kl as usize);
    (key.to_vec(), value.to_vec())
}

/// Reads only the key bytes, for a probe that needs to compare the key
/// before bothering to reassemble the (possibly much larger) value.
pub fn decode_key_only(pages: &[Vec<u8>], head: &RecordHead) -> Vec<u8> {
    let page_size = pages[0].len();
    let head_payload_cap = page_size - HEAD_HEADER_LEN;
    let cont_payload_cap = page_size - CONT_HEADER_LEN;

    let kl = head.kl as usize;
    let mut key = Vec::with_capacity(kl);

    let take = head_payload_cap.min(kl - key.len());
    key.extend_from_slice(&pages[0][HEAD_HEADER_LEN..HEAD_HEADER_LEN + take]);

    for page in &pages[1..] {
        if key.len() >= kl {
            break;
        }
        let take = cont_payload_cap.min(kl - key.len());
        key.extend_from_slice(&page[CONT_HEADER_LEN..CONT_HEADER_LEN + take]);
    }
    key
}
