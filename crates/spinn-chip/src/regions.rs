// SPDX-License-Identifier: AGPL-3.0-only

//! Flood-fill region words.
//!
//! Nearest-neighbour flood-fill addresses chips hierarchically. The machine
//! is divided into 4×4 blocks at four levels (level 0 covers 256×256 chips,
//! level 3 a single 4×4 block). A region word selects one block at a level
//! and a 16-bit mask of the sub-blocks (or chips, at level 3) within it:
//!
//! ```text
//! bits 31:24  block base x (low bits cleared for the level)
//! bits 23:16  block base y | level
//! bits 15:0   one bit per sub-block, index = sx + 4·sy
//! ```

use std::collections::BTreeMap;

/// Finest level; a level-3 region selects individual chips.
pub const CHIP_LEVEL: u8 = 3;

/// Region word selecting the block containing `(x, y)` at `level`, with
/// only that chip's sub-block bit set.
///
/// At [`CHIP_LEVEL`] the word selects exactly the one chip.
#[must_use]
pub fn region_for_chip(x: u8, y: u8, level: u8) -> u32 {
    let level = u32::from(level.min(CHIP_LEVEL));
    let shift = 6 - 2 * level;
    let mask = !((4u32 << shift) - 1);
    let (x, y) = (u32::from(x), u32::from(y));
    let bit = ((x >> shift) & 3) + 4 * ((y >> shift) & 3);
    let nx = x & mask;
    let ny = y & mask;
    (nx << 24) | ((ny + level) << 16) | (1 << bit)
}

/// Group chips into the smallest set of level-3 `(region, core_mask)` pairs.
///
/// Chips that share a 4×4 block and an identical core mask are covered by a
/// single region word. The output is ordered by region for determinism.
#[must_use]
pub fn compress_flood_fill_regions(targets: &BTreeMap<(u8, u8), u32>) -> Vec<(u32, u32)> {
    let mut grouped: BTreeMap<(u32, u32), u32> = BTreeMap::new();
    for (&(x, y), &cores) in targets {
        if cores == 0 {
            continue;
        }
        let region = region_for_chip(x, y, CHIP_LEVEL);
        *grouped.entry((region & 0xFFFF_0000, cores)).or_insert(0) |= region & 0xFFFF;
    }
    let mut out: Vec<(u32, u32)> =
        grouped.into_iter().map(|((high, cores), bits)| (high | bits, cores)).collect();
    out.sort_unstable();
    out
}
