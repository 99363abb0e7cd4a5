//! The virtual-to-physical mapper: one `u64` cell per virtual page.

/// UNALLOCATED sentinel: this virtual page has never been used.
pub const UNALLOCATED: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// GARBAGE-RECLAIMED sentinel: was used, now free for reassignment.
///
/// Not `0x8000_0000_0000_0000` -- preserved verbatim per the design doc,
/// since the codec compares cells for equality rather than interpreting
/// individual bits.
pub const RECLAIMED: u64 = 0x8FFF_FFFF_FFFF_FFFF;

/// A decoded mapper cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapCell {
    Unallocated,
    Reclaimed,
    Mapped(u32),
}

impl MapCell {
    fn decode(raw: u64) -> Self {
        match raw {
            UNALLOCATED => MapCell::Unallocated,
            RECLAIMED => MapCell::Reclaimed,
            other => MapCell::Mapped(other as u32),
        }
    }

    fn encode(self) -> u64 {
        match self {
            MapCell::Unallocated => UNALLOCATED,
            MapCell::Reclaimed => RECLAIMED,
            MapCell::Mapped(pp) => pp as u64,
        }
    }
}

/// `N` cells, one per virtual page, little-endian on flash.
#[derive(Debug, Clone)]
pub struct Mapper {
    cells: Vec<u64>,
}

impl Mapper {
    pub fn new_unallocated(n: u32) -> Self {
        Self {
            cells: vec![UNALLOCATED; n as usize],
        }
    }

    pub fn from_cells(cells: Vec<u64>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> u32 {
        self.cells.len() as u32
    }

    pub fn get(&self, vp: u32) -> MapCell {
        MapCell::decode(self.cells[vp as usize])
    }

    pub fn set(&mut self, vp: u32, cell: MapCell) {
        self.cells[vp as usize] = cell.encode();
    }

    /// Serializes to the on-flash little-endian byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.cells.len() * 8);
        for cell in &self.cells {
            out.extend_from_slice(&cell.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], n: u32) -> Self {
        let mut cells = Vec::with_capacity(n as usize);
        for i in 0..n as usize {
            let chunk: [u8; 8] = bytes[i * 8..i * 8 + 8].try_into().unwrap();
            cells.push(u64::from_le_bytes(chunk));
        }
        Self { cells }
    }

    /// Linear scan for the virtual page currently mapped to `pp`.
    ///
    /// O(N); acceptable because migrations (the only caller) are rare and
    /// batch-local, per the design doc's note on reverse lookup.
    pub fn find_vpage_for(&self, pp: u32) -> Option<u32> {
        self.cells
            .iter()
            .position(|&c| c == pp as u64)
            .map(|i| i as u32)
    }
}
