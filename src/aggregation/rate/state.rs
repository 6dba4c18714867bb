use std::mem::size_of;

use itertools::Itertools;

use crate::aggregation::NumericType;

/// Samples of one group, newest first.
///
/// The buffer may hold fewer points than `sample_count`: interior samples are
/// folded into `reset` since a rate only needs the outermost points plus the
/// accumulated counter-reset correction.
#[derive(Debug)]
pub struct RateState<T: NumericType> {
    timestamps: Vec<i64>,
    values: Vec<T::Native>,
    sample_count: i32,
    reset: f64,
}

impl<T: NumericType> RateState<T> {
    pub(crate) fn single(timestamp: i64, value: T::Native) -> Self {
        Self {
            timestamps: vec![timestamp],
            values: vec![value],
            sample_count: 1,
            reset: 0.0,
        }
    }

    pub(crate) fn from_parts(
        timestamps: Vec<i64>,
        values: Vec<T::Native>,
        sample_count: i32,
        reset: f64,
    ) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        debug_assert!(is_descending(&timestamps), "timestamps must be descending");
        Self {
            timestamps,
            values,
            sample_count,
            reset,
        }
    }

    pub fn entries(&self) -> usize {
        self.timestamps.len()
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn values(&self) -> &[T::Native] {
        &self.values
    }

    pub fn sample_count(&self) -> i32 {
        self.sample_count
    }

    pub fn reset(&self) -> f64 {
        self.reset
    }

    /// Bytes charged for a state retaining `entries` samples.
    pub fn bytes_used(entries: usize) -> usize {
        size_of::<Self>() + entries * (size_of::<i64>() + size_of::<T::Native>())
    }

    /// Fast path: fold a sample lying strictly outside the retained span into
    /// the boundary point it replaces, without reallocating. The replaced
    /// point becomes interior and its contribution moves into `reset`.
    /// Returns `false` when the sample has to go through a merge instead.
    pub(crate) fn try_collapse(&mut self, timestamp: i64, value: T::Native) -> bool {
        let len = self.entries();
        if len < 2 {
            return false;
        }
        if timestamp > self.timestamps[0] {
            self.reset += fold_interior::<T>(self.values[1], self.values[0], value);
            self.timestamps[0] = timestamp;
            self.values[0] = value;
        } else if timestamp < self.timestamps[len - 1] {
            self.reset += fold_interior::<T>(value, self.values[len - 1], self.values[len - 2]);
            self.timestamps[len - 1] = timestamp;
            self.values[len - 1] = value;
        } else {
            return false;
        }
        self.sample_count = self.sample_count.saturating_add(1);
        true
    }

    /// Merge-sort this state with another descending run of samples.
    ///
    /// Counts and resets are summed; retained points are all kept so that a
    /// reset across the seam is still visible at evaluation. On equal
    /// timestamps the samples of `self` come first.
    pub(crate) fn merged_with(
        &self,
        timestamps: &[i64],
        values: &[T::Native],
        sample_count: i32,
        reset: f64,
    ) -> Self {
        debug_assert_eq!(timestamps.len(), values.len());
        debug_assert!(is_descending(timestamps), "merged run must be descending");
        let len = self.entries() + timestamps.len();
        let mut out_ts = Vec::with_capacity(len);
        let mut out_vs = Vec::with_capacity(len);
        let left = self.timestamps.iter().copied().zip(self.values.iter().copied());
        let right = timestamps.iter().copied().zip(values.iter().copied());
        for (t, v) in left.merge_by(right, |l, r| l.0 >= r.0) {
            out_ts.push(t);
            out_vs.push(v);
        }
        Self {
            timestamps: out_ts,
            values: out_vs,
            sample_count: self.sample_count.saturating_add(sample_count),
            reset: self.reset + reset,
        }
    }
}

/// Counter increase from `a` to `b`; a decrease is a reset to zero.
#[inline]
pub(crate) fn counter_delta<T: NumericType>(a: T::Native, b: T::Native) -> f64 {
    if b >= a {
        T::to_f64(b) - T::to_f64(a)
    } else {
        T::to_f64(b)
    }
}

/// Correction that keeps `older -> newer` exact once `interior` is dropped.
#[inline]
fn fold_interior<T: NumericType>(older: T::Native, interior: T::Native, newer: T::Native) -> f64 {
    counter_delta::<T>(older, interior) + counter_delta::<T>(interior, newer)
        - counter_delta::<T>(older, newer)
}

pub(crate) fn is_descending(timestamps: &[i64]) -> bool {
    timestamps.windows(2).all(|w| w[0] >= w[1])
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::{Float64Type, Int64Type};

    use super::*;

    fn two_point(newer: (i64, i64), older: (i64, i64)) -> RateState<Int64Type> {
        RateState::from_parts(vec![newer.0, older.0], vec![newer.1, older.1], 2, 0.0)
    }

    #[test]
    fn test_counter_delta_treats_drop_as_reset() {
        assert_eq!(counter_delta::<Int64Type>(10, 15), 5.0);
        assert_eq!(counter_delta::<Int64Type>(10, 2), 2.0);
        assert_eq!(counter_delta::<Float64Type>(1.5, 1.5), 0.0);
    }

    #[test]
    fn test_collapse_newer_sample_keeps_extremes() {
        let mut state = two_point((1000, 2), (0, 10));
        assert!(state.try_collapse(2000, 5));
        assert_eq!(state.timestamps(), &[2000, 0]);
        assert_eq!(state.values(), &[5, 10]);
        assert_eq!(state.sample_count(), 3);
        // 10 -> 2 -> 5 is an increase of 5; the pair 10 -> 5 alone reads as 5 too.
        assert_eq!(state.reset(), 0.0);
    }

    #[test]
    fn test_collapse_older_sample() {
        let mut state = two_point((2000, 30), (1000, 20));
        assert!(state.try_collapse(0, 25));
        assert_eq!(state.timestamps(), &[2000, 0]);
        assert_eq!(state.values(), &[30, 25]);
        // 25 -> 20 (reset, +20) -> 30 (+10) = 30; pair 25 -> 30 reads 5.
        assert_eq!(state.reset(), 25.0);
    }

    #[test]
    fn test_collapse_refuses_interior_and_ties() {
        let mut state = two_point((2000, 3), (1000, 1));
        assert!(!state.try_collapse(1500, 2));
        assert!(!state.try_collapse(2000, 2));
        assert!(!state.try_collapse(1000, 2));
        assert_eq!(state.sample_count(), 2);
    }

    #[test]
    fn test_collapse_at_the_ends_of_a_longer_buffer() {
        let mut state = RateState::<Int64Type>::from_parts(vec![3000, 2000, 1000], vec![4, 30, 20], 3, 0.0);
        // 20 -> 30 -> 4 (reset) -> 6 reads 10 + 4 + 2 = 16
        assert!(state.try_collapse(4000, 6));
        assert_eq!(state.timestamps(), &[4000, 2000, 1000]);
        assert_eq!(state.values(), &[6, 30, 20]);
        // 30 -> 6 alone reads 6, the dropped point contributes 4 + 2 - 6 = 0
        assert_eq!(state.reset(), 0.0);

        assert!(state.try_collapse(0, 25));
        assert_eq!(state.timestamps(), &[4000, 2000, 0]);
        assert_eq!(state.values(), &[6, 30, 25]);
        // 25 -> 20 (reset, +20) -> 30 (+10) = 30; pair 25 -> 30 reads 5
        assert_eq!(state.reset(), 25.0);
        assert_eq!(state.sample_count(), 5);

        assert!(!state.try_collapse(3000, 1));
        assert!(!state.try_collapse(4000, 1));
    }

    #[test]
    fn test_merge_is_descending_and_sums_counters() {
        let left = RateState::<Int64Type>::from_parts(vec![50, 30, 10], vec![5, 3, 1], 7, 1.5);
        let merged = left.merged_with(&[40, 30, 20], &[4, 33, 2], 4, 2.0);
        assert_eq!(merged.timestamps(), &[50, 40, 30, 30, 20, 10]);
        assert_eq!(merged.values(), &[5, 4, 3, 33, 2, 1]);
        assert_eq!(merged.sample_count(), 11);
        assert_eq!(merged.reset(), 3.5);
    }

    #[test]
    fn test_bytes_used_is_linear_in_entries() {
        let one = RateState::<Int64Type>::bytes_used(1);
        let two = RateState::<Int64Type>::bytes_used(2);
        assert_eq!(two - one, 16);
        assert_eq!(RateState::<Int64Type>::bytes_used(0), size_of::<RateState<Int64Type>>());
    }
}
