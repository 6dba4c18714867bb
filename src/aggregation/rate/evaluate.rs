use crate::aggregation::rate::state::RateState;
use crate::aggregation::{NumericType, TimeRange};

/// Oldest and newest retained points with every counter reset credited to the
/// newest value.
struct CorrectedSpan {
    first_ts: i64,
    last_ts: i64,
    first_value: f64,
    last_value: f64,
}

/// `to - from` in milliseconds, exact for any pair of `i64` timestamps.
#[inline]
fn millis_between(from: i64, to: i64) -> f64 {
    (i128::from(to) - i128::from(from)) as f64
}

fn corrected_span<T: NumericType>(state: &RateState<T>) -> Option<CorrectedSpan> {
    let len = state.entries();
    if state.sample_count() < 2 || len < 2 {
        return None;
    }
    let timestamps = state.timestamps();
    let values = state.values();
    let mut reset = state.reset();
    // values are newest first: a newer value below an older one is a reset
    for i in 1..len {
        if values[i - 1] < values[i] {
            reset += T::to_f64(values[i]);
        }
    }
    Some(CorrectedSpan {
        first_ts: timestamps[len - 1],
        last_ts: timestamps[0],
        first_value: T::to_f64(values[len - 1]),
        last_value: T::to_f64(values[0]) + reset,
    })
}

/// Per-second rate over the retained span, timestamps in milliseconds.
///
/// `None` for fewer than two samples or a zero-length span.
pub fn compute_rate_without_extrapolate<T: NumericType>(state: &RateState<T>) -> Option<f64> {
    let span = corrected_span(state)?;
    if span.last_ts == span.first_ts {
        return None;
    }
    Some((span.last_value - span.first_value) * 1000.0 / millis_between(span.first_ts, span.last_ts))
}

/// Per-second rate over `range`, extrapolating the sampled slope to its
/// boundaries.
///
/// A boundary is reached only when it lies within 110% of the average sample
/// interval; otherwise the series is assumed to start or end inside the range
/// and is extended by half an interval. The start side never extrapolates
/// below zero, the end side is not clamped.
pub fn extrapolate_rate<T: NumericType>(state: &RateState<T>, range: TimeRange) -> Option<f64> {
    let span = corrected_span(state)?;
    if span.last_ts == span.first_ts || range.end <= range.start {
        return None;
    }
    let mut first_value = span.first_value;
    let mut last_value = span.last_value;
    let sample_ts = millis_between(span.first_ts, span.last_ts);
    let average_sample_interval = sample_ts / state.sample_count() as f64;
    let slope = (last_value - first_value) / sample_ts;

    let mut start_gap = millis_between(range.start, span.first_ts);
    if start_gap > 0.0 {
        if start_gap > average_sample_interval * 1.1 {
            start_gap = average_sample_interval / 2.0;
        }
        first_value = f64::max(0.0, first_value - start_gap * slope);
    }
    let mut end_gap = millis_between(span.last_ts, range.end);
    if end_gap > 0.0 {
        if end_gap > average_sample_interval * 1.1 {
            end_gap = average_sample_interval / 2.0;
        }
        last_value += end_gap * slope;
    }
    Some((last_value - first_value) * 1000.0 / millis_between(range.start, range.end))
}
