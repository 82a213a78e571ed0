//! Zero-run trimming of object payloads.
//!
//! Disk objects are mostly sparse. Before a payload crosses the wire or is
//! hashed for the snapshot archive, leading and trailing all-zero 512-byte
//! sectors are dropped; what remains is the canonical `(offset, window)`
//! pair. Expansion is the exact inverse: the window is placed back at its
//! offset inside a zero-filled buffer of the original length.

/// Trim granularity; windows start and end on sector boundaries.
pub const SECTOR_SIZE: usize = 512;

/// Drop leading and trailing all-zero sectors.
///
/// Returns the byte offset of the retained window and the window itself.
/// An all-zero buffer trims to `(0, empty)`. A trailing partial sector is
/// treated as one sector.
#[must_use]
pub fn trim_zero_sectors(data: &[u8]) -> (u64, &[u8]) {
    let is_zero = |s: &[u8]| s.iter().all(|&b| b == 0);

    let mut start = 0;
    while start < data.len() {
        let end = (start + SECTOR_SIZE).min(data.len());
        if !is_zero(&data[start..end]) {
            break;
        }
        start = end;
    }
    if start == data.len() {
        return (0, &[]);
    }

    let mut end = data.len();
    while end > start {
        let sect_start = end.saturating_sub(1) / SECTOR_SIZE * SECTOR_SIZE;
        let sect_start = sect_start.max(start);
        if !is_zero(&data[sect_start..end]) {
            break;
        }
        end = sect_start;
    }

    (start as u64, &data[start..end])
}

/// Expand a trimmed window back to `full_len` bytes.
///
/// `buf` holds the window on entry and the full zero-padded payload on
/// return. The window must fit: `offset + buf.len() <= full_len`.
pub fn untrim_zero_sectors(buf: &mut Vec<u8>, offset: u64, full_len: usize) {
    let off = usize::try_from(offset).unwrap_or(usize::MAX);
    let win = buf.len();
    debug_assert!(off.saturating_add(win) <= full_len, "window escapes object");

    buf.resize(full_len, 0);
    if off > 0 {
        buf.copy_within(0..win, off);
        buf[..off.min(win)].fill(0);
        // When the window is shorter than the offset the gap between the
        // moved window and the old prefix keeps stale bytes.
        if off > win {
            buf[win..off].fill(0);
        }
    }
}
