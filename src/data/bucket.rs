use super::Timestamp;
use serde::Serialize;

/// An aggregate of samples over one fixed-width time interval.
///
/// Buckets are merged with `update`, which is associative and commutative, so the order in which
/// samples arrive never changes the final aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Bucket {
    time: Timestamp,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
    empty: bool,
}

impl Bucket {
    /// Creates a bucket with no data in it.
    ///
    /// An empty bucket is distinct from a bucket whose value is exactly zero: it has never seen a
    /// sample, and merging it into another bucket is a no-op.
    pub fn empty() -> Bucket {
        Bucket {
            time: 0,
            sum: 0.0,
            count: 0,
            min: 0.0,
            max: 0.0,
            empty: true,
        }
    }

    /// Creates a bucket holding a single sample.
    pub fn new(value: f64, time: Timestamp) -> Bucket {
        Bucket {
            time,
            sum: value,
            count: 1,
            min: value,
            max: value,
            empty: false,
        }
    }

    pub(crate) fn from_parts(time: Timestamp, count: u64, sum: f64, min: f64, max: f64) -> Bucket {
        Bucket {
            time,
            sum,
            count,
            min,
            max,
            empty: count == 0,
        }
    }

    /// Returns a copy of this bucket anchored at `time`.
    pub fn with_time(&self, time: Timestamp) -> Bucket {
        Bucket { time, ..*self }
    }

    /// Merges `other` into this bucket.
    pub fn update(&mut self, other: &Bucket) {
        if other.empty {
            return;
        }

        if self.empty {
            *self = *other;
            return;
        }

        // A default bucket is non-empty but has no samples, so its extremes carry no information.
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else if other.count > 0 {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }

        self.sum += other.sum;
        self.count += other.count;
        self.time = self.time.min(other.time);
    }

    pub fn time(&self) -> Timestamp { self.time }

    pub fn sum(&self) -> f64 { self.sum }

    pub fn count(&self) -> u64 { self.count }

    pub fn min(&self) -> f64 { self.min }

    pub fn max(&self) -> f64 { self.max }

    pub fn is_empty(&self) -> bool { self.empty }

    /// Mean of the merged samples, or zero if there are none.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl Default for Bucket {
    /// A zero-valued bucket that is not marked empty.
    fn default() -> Bucket {
        Bucket {
            empty: false,
            ..Bucket::empty()
        }
    }
}
