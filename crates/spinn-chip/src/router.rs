// SPDX-License-Identifier: AGPL-3.0-only

//! Router entry record format.
//!
//! SC&MP stages router entries in SDRAM as 16-byte little-endian records
//! before a router `load` command copies them into the router. The same
//! layout is used by the monitor's copy of the live table:
//!
//! ```text
//! offset  size  field
//! 0       2     next   (index of this record in the batch)
//! 2       2     free   (app id in bits 7:0, core in bits 11:8)
//! 4       4     route  (24-bit route set; top byte 0xFF = unused slot)
//! 8       4     key
//! 12      4     mask
//! ```

/// Router entries per chip.
pub const RTR_ENTRIES: usize = 1024;

/// Size of one staged/copied router record.
pub const RECORD_SIZE: usize = 16;

/// Route-field marker for an unused slot.
const UNUSED_ROUTE_MARKER: u32 = 0xFF00_0000;

/// One router record as laid out in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterRecord {
    /// Link field (`next`).
    pub next: u16,
    /// Ownership field (`free`).
    pub free: u16,
    /// Raw route field.
    pub route: u32,
    /// Match key.
    pub key: u32,
    /// Match mask.
    pub mask: u32,
}

impl RouterRecord {
    /// An empty slot.
    pub const UNUSED: Self = Self { next: 0, free: 0, route: UNUSED_ROUTE_MARKER, key: 0, mask: 0 };

    /// Record staged for a router load.
    #[must_use]
    pub const fn staged(index: u16, route: u32, key: u32, mask: u32) -> Self {
        Self { next: index, free: 0, route, key, mask }
    }

    /// Encode to the 16-byte little-endian layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..2].copy_from_slice(&self.next.to_le_bytes());
        out[2..4].copy_from_slice(&self.free.to_le_bytes());
        out[4..8].copy_from_slice(&self.route.to_le_bytes());
        out[8..12].copy_from_slice(&self.key.to_le_bytes());
        out[12..16].copy_from_slice(&self.mask.to_le_bytes());
        out
    }

    /// Decode from the 16-byte little-endian layout.
    #[must_use]
    pub fn from_bytes(raw: &[u8; RECORD_SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([raw[o], raw[o + 1], raw[o + 2], raw[o + 3]]);
        Self {
            next: u16_at(0),
            free: u16_at(2),
            route: u32_at(4),
            key: u32_at(8),
            mask: u32_at(12),
        }
    }

    /// True when the slot holds no entry.
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.route & UNUSED_ROUTE_MARKER == UNUSED_ROUTE_MARKER
    }

    /// Application that owns the entry.
    #[must_use]
    pub const fn app_id(&self) -> u8 {
        (self.free & 0xFF) as u8
    }

    /// Core that allocated the entry.
    #[must_use]
    pub const fn core(&self) -> u8 {
        ((self.free >> 8) & 0x0F) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_little_endian() {
        let rec = RouterRecord::staged(3, 0x0000_0040, 0xDEAD_0000, 0xFFFF_0000);
        let raw = rec.to_bytes();
        assert_eq!(&raw[0..4], &[3, 0, 0, 0]);
        assert_eq!(&raw[4..8], &[0x40, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[0x00, 0x00, 0xAD, 0xDE]);
        assert_eq!(RouterRecord::from_bytes(&raw), rec);
    }

    #[test]
    fn unused_and_ownership() {
        let unused = RouterRecord { route: 0xFF00_0000, ..Default::default() };
        assert!(unused.is_unused());
        assert!(RouterRecord::UNUSED.is_unused());

        let owned = RouterRecord { free: 0x0530, route: 0x3F, ..Default::default() };
        assert!(!owned.is_unused());
        assert_eq!(owned.app_id(), 0x30);
        assert_eq!(owned.core(), 5);
    }
}
