//! Automatic bin size selection

use crate::types::Timestamp;

/// Standard bin sizes in seconds, smallest first
pub const BINSIZE_LADDER: [i64; 5] = [300, 600, 1200, 2400, 4800];

/// Bin size used once a window outgrows the ladder
pub const MAX_BINSIZE: i64 = 14400;

/// Pick a bin size giving roughly `target_points` bins over `[start, end)`
///
/// The exact quotient is snapped up to the next ladder step.
pub fn auto_binsize(start: Timestamp, end: Timestamp, target_points: i64) -> i64 {
    let minbin = (end - start) / target_points.max(1);
    BINSIZE_LADDER
        .iter()
        .copied()
        .find(|size| minbin <= *size)
        .unwrap_or(MAX_BINSIZE)
}
