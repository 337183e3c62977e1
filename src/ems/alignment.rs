use chrono::{DateTime, Duration, FixedOffset};

use crate::domain::forecast::ForecastPoint;
use crate::ems::horizon::Horizon;
use crate::error::{EmsError, EmsResult};

// Third-party feeds sometimes offset interval boundaries by ~1s; tolerate
// small per-slot gaps.
const GAP_TOLERANCE_SECONDS: f64 = 2.0;

fn alignment_error() -> EmsError {
    EmsError::Alignment("forecast series does not cover the full horizon".to_string())
}

/// Resample forecast intervals onto horizon slots by time-weighted
/// averaging.
///
/// When `first_slot_override` is provided, a missing or partially missing
/// slot 0 is tolerated and the override value always replaces slot 0. This
/// lets realtime measurements stand in for the current period when the
/// forecast starts at the next bucket.
pub fn align_intervals<P: ForecastPoint>(
    horizon: &Horizon,
    intervals: &[P],
    first_slot_override: Option<f64>,
) -> EmsResult<Vec<f64>> {
    if intervals.is_empty() {
        return Err(alignment_error());
    }

    let mut ordered: Vec<&P> = intervals.iter().collect();
    ordered.sort_by_key(|interval| interval.start());

    let first_start = ordered[0].start();
    let last_end = ordered.last().expect("non-empty").end();
    if first_start == last_end {
        return Err(EmsError::Alignment("forecast series has zero duration".to_string()));
    }
    if last_end < first_start {
        return Err(EmsError::Alignment("forecast series has invalid duration".to_string()));
    }
    if horizon.end() > last_end {
        return Err(alignment_error());
    }

    let mut series = Vec::with_capacity(horizon.len());
    let mut idx = 0usize;
    for slot in &horizon.slots {
        let slot_seconds = slot.duration_s();
        while idx < ordered.len() && ordered[idx].end() <= slot.start {
            idx += 1;
        }
        let mut total_overlap = 0.0f64;
        let mut weighted_sum = 0.0f64;
        let mut scan = idx;
        while scan < ordered.len() && ordered[scan].start() < slot.end {
            let interval = ordered[scan];
            let overlap_start = slot.start.max(interval.start());
            let overlap_end = slot.end.min(interval.end());
            let overlap = (overlap_end - overlap_start).num_milliseconds() as f64 / 1000.0;
            if overlap > 0.0 {
                total_overlap += overlap;
                weighted_sum += interval.value() * overlap;
            }
            if interval.end() <= slot.end {
                scan += 1;
            } else {
                break;
            }
        }
        if total_overlap <= 0.0 {
            if first_slot_override.is_some() && slot.index == 0 {
                series.push(0.0);
                continue;
            }
            return Err(alignment_error());
        }
        let coverage_gap = slot_seconds - total_overlap;
        if coverage_gap > GAP_TOLERANCE_SECONDS {
            if first_slot_override.is_some() && slot.index == 0 {
                series.push(0.0);
                continue;
            }
            return Err(alignment_error());
        }
        series.push(weighted_sum / total_overlap);
    }

    if let Some(override_value) = first_slot_override {
        if let Some(first) = series.first_mut() {
            *first = override_value;
        }
    }
    Ok(series)
}

/// Count the contiguous horizon slots (of `interval_minutes` each, starting
/// at `start`) that the forecast can support.
///
/// With `allow_first_slot_missing`, an uncovered initial slot still counts
/// (a realtime override will fill it); later gaps stop the walk.
pub fn coverage_slots<P: ForecastPoint>(
    start: DateTime<FixedOffset>,
    interval_minutes: u32,
    intervals: &[P],
    allow_first_slot_missing: bool,
) -> usize {
    if intervals.is_empty() {
        return 0;
    }

    let mut ordered: Vec<&P> = intervals.iter().collect();
    ordered.sort_by_key(|interval| interval.start());
    let first_start = ordered[0].start();
    let last_end = ordered.last().expect("non-empty").end();
    if first_start >= last_end {
        return 0;
    }

    let delta = Duration::minutes(i64::from(interval_minutes));
    let mut slot_start = start;
    let mut count = 0usize;

    loop {
        let slot_end = slot_start + delta;
        // Last interval starting at or before the slot, plus its successor,
        // are the only overlap candidates.
        let upper = ordered.partition_point(|interval| interval.start() <= slot_start);
        let covered = [upper.wrapping_sub(1), upper].iter().any(|&candidate| {
            ordered
                .get(candidate)
                .is_some_and(|interval| interval.start() < slot_end && interval.end() > slot_start)
        });
        if !covered {
            if allow_first_slot_missing && count == 0 {
                count += 1;
                slot_start = slot_end;
                continue;
            }
            break;
        }
        count += 1;
        slot_start = slot_end;
    }

    count
}
