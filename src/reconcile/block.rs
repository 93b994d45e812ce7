//! Per-block reconciliation of upstream rows into one point per bin

use std::collections::VecDeque;

use crate::types::{Block, DataPoint, Timestamp};

/// Fill one block from the front of `queried`
///
/// `queried` holds the label's upstream rows in ascending order; rows
/// assigned to this block are removed, rows for later blocks are left in
/// place. When the measurement frequency is coarser than the bin size,
/// rows are matched on their own `timestamp` and the walk advances by the
/// frequency; otherwise rows are matched on the upstream `binstart`.
///
/// At most one row is kept per bin: a row whose key falls before the
/// current position is discarded and the position re-anchored after it.
/// Bins with no row get a gap marker. The walk stops at the block end or
/// at `now`, whichever comes first.
pub fn reconcile_block<F>(
    block: &Block,
    queried: &mut VecDeque<DataPoint>,
    frequency: i64,
    now: Timestamp,
    format: F,
) -> Vec<DataPoint>
where
    F: Fn(DataPoint) -> DataPoint,
{
    let by_timestamp = frequency > block.binsize;
    let step = if by_timestamp { frequency } else { block.binsize };
    if step < 1 {
        return Vec::new();
    }

    let key_of = |point: &DataPoint| {
        if by_timestamp {
            point.timestamp
        } else {
            point.binstart
        }
    };

    let mut points = Vec::with_capacity(block.bin_count());
    let mut ts = block.start;

    while ts < block.end {
        if ts > now {
            break;
        }

        let next_key = match queried.front() {
            Some(point) => key_of(point),
            None => {
                // The first point is kept even for a partial bin so a
                // fully missing block still breaks the line
                if block.end - ts >= step || points.is_empty() {
                    points.push(DataPoint::gap(ts));
                }
                ts += step;
                continue;
            },
        };

        if next_key < ts {
            queried.pop_front();
            ts = ts.max(next_key + step);
            continue;
        }

        let bin_end = (ts + step).min(block.end);
        if next_key < bin_end {
            if let Some(point) = queried.pop_front() {
                let mut point = format(point);
                if by_timestamp {
                    point.binstart = ts;
                }
                points.push(point);
            }
        } else if ts + step <= next_key || points.is_empty() {
            points.push(DataPoint::gap(ts));
        }
        ts += step;
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn block(start: Timestamp, end: Timestamp, binsize: i64) -> Block {
        Block {
            start,
            end,
            binsize,
            ttl: Duration::from_secs(300),
        }
    }

    fn row(binstart: Timestamp, timestamp: Timestamp, median: f64) -> DataPoint {
        DataPoint::new(binstart, timestamp, Default::default()).with_value("median", json!(median))
    }

    fn identity(p: DataPoint) -> DataPoint {
        p
    }

    #[test]
    fn test_missing_bin_becomes_gap() {
        let b = block(0, 3600, 300);
        let mut queried: VecDeque<_> = (0..12)
            .map(|i| i * 300)
            .filter(|ts| *ts != 1800)
            .map(|ts| row(ts, ts + 7, ts as f64))
            .collect();

        let points = reconcile_block(&b, &mut queried, 300, 100_000, identity);

        assert_eq!(points.len(), 12);
        for (i, point) in points.iter().enumerate() {
            let ts = i as i64 * 300;
            assert_eq!(point.binstart, ts);
            if ts == 1800 {
                assert!(point.is_gap());
                assert_eq!(point.timestamp, 1800);
                assert_eq!(
                    serde_json::to_value(point).unwrap(),
                    json!({"binstart": 1800, "timestamp": 1800})
                );
            } else {
                assert_eq!(point.value_f64("median"), Some(ts as f64));
            }
        }
        assert!(queried.is_empty());
    }

    #[test]
    fn test_empty_block_is_all_gaps() {
        let b = block(3600, 7200, 300);
        let points = reconcile_block(&b, &mut VecDeque::new(), 300, 100_000, identity);
        assert_eq!(points.len(), 12);
        assert!(points.iter().all(DataPoint::is_gap));
    }

    #[test]
    fn test_stops_at_now() {
        let b = block(0, 3600, 300);
        let points = reconcile_block(&b, &mut VecDeque::new(), 300, 1000, identity);
        // Bins at 0, 300, 600 and 900 start on or before now
        assert_eq!(points.len(), 4);
    }

    #[test]
    fn test_leaves_later_rows_for_next_block() {
        let b = block(0, 600, 300);
        let mut queried: VecDeque<_> = [0, 300, 600, 900].iter().map(|ts| row(*ts, *ts, 1.0)).collect();

        let points = reconcile_block(&b, &mut queried, 300, 100_000, identity);
        assert_eq!(points.len(), 2);
        assert_eq!(queried.len(), 2);
        assert_eq!(queried[0].binstart, 600);
    }

    #[test]
    fn test_duplicate_bin_keeps_first() {
        let b = block(0, 900, 300);
        let mut queried: VecDeque<_> = vec![row(0, 0, 1.0), row(0, 5, 2.0), row(300, 300, 3.0)].into();

        let points = reconcile_block(&b, &mut queried, 300, 100_000, identity);
        let medians: Vec<_> = points.iter().map(|p| p.value_f64("median")).collect();
        assert_eq!(medians, vec![Some(1.0), Some(3.0), None]);
    }

    #[test]
    fn test_coarse_frequency_matches_timestamps() {
        // Measured every 600s but graphed at 300s bins
        let b = block(0, 3600, 300);
        let mut queried: VecDeque<_> = vec![row(0, 12, 1.0), row(600, 611, 2.0), row(1800, 1805, 3.0)].into();

        let points = reconcile_block(&b, &mut queried, 600, 100_000, identity);

        assert_eq!(points.len(), 6);
        assert_eq!(points[0].binstart, 0);
        assert_eq!(points[0].timestamp, 12);
        assert_eq!(points[1].binstart, 600);
        assert!(points[2].is_gap());
        assert_eq!(points[3].value_f64("median"), Some(3.0));
    }

    #[test]
    fn test_frequency_beyond_block_span_still_yields_a_point() {
        // Measured every two hours, the next row belongs to a later block
        let b = block(3600, 7200, 300);
        let mut queried: VecDeque<_> = vec![row(7200, 7210, 1.0)].into();
        let with_later_row = reconcile_block(&b, &mut queried, 7200, 100_000, identity);

        let mut empty = VecDeque::new();
        let without_rows = reconcile_block(&b, &mut empty, 7200, 100_000, identity);

        assert_eq!(with_later_row.len(), 1);
        assert_eq!(with_later_row, without_rows);
        assert!(with_later_row[0].is_gap());
        assert_eq!(with_later_row[0].binstart, 3600);
        assert_eq!(queried.len(), 1);
    }

    #[test]
    fn test_delayed_measurement_is_dropped() {
        let b = block(0, 3600, 300);
        // Second measurement lands in the bin already filled by the first
        let mut queried: VecDeque<_> = vec![row(0, 10, 1.0), row(0, 590, 2.0), row(1200, 1210, 3.0)].into();

        let points = reconcile_block(&b, &mut queried, 600, 100_000, identity);
        assert_eq!(points[0].value_f64("median"), Some(1.0));
        assert!(points.iter().all(|p| p.value_f64("median") != Some(2.0)));
        assert!(points.iter().any(|p| p.value_f64("median") == Some(3.0)));
    }

    #[test]
    fn test_formatter_applies_to_rows_only() {
        let b = block(0, 600, 300);
        let mut queried: VecDeque<_> = vec![row(0, 0, 1.0)].into();

        let points = reconcile_block(&b, &mut queried, 300, 100_000, |p| {
            p.with_value("formatted", json!(true))
        });
        assert!(points[0].values.contains_key("formatted"));
        assert!(points[1].is_gap());
    }

    #[test]
    fn test_invalid_step() {
        let b = block(0, 600, 0);
        assert!(reconcile_block(&b, &mut VecDeque::new(), 0, 100_000, identity).is_empty());
    }
}
