use super::{Bucket, Timestamp};
use log::{debug, warn};
use std::fmt;

/// Number of in-memory buckets held by each `Bucketizer`.
pub const BUCKET_COUNT: usize = 5;

/// An update whose time fell outside of a `Bucketizer` window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfWindow {
    pub time: Timestamp,
    pub now: Timestamp,
    pub offset: i64,
}

impl fmt::Display for OutOfWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "time {} not close enough to {} (offset {}, delta {})",
            self.time,
            self.now,
            self.offset,
            i128::from(self.time) - i128::from(self.now)
        )
    }
}

/// Aligns `time` down to a multiple of `width`, or `None` if that lies before `i64::MIN`.
pub(crate) fn align(time: Timestamp, width: i64) -> Option<Timestamp> { time.checked_sub(time.rem_euclid(width)) }

/// A sliding window of the most recent `BUCKET_COUNT` buckets at one resolution.
///
/// `buckets[0]` is the oldest bucket and `buckets[BUCKET_COUNT - 1]` is the one containing `now`.
pub struct Bucketizer {
    buckets: [Bucket; BUCKET_COUNT],
    now: Timestamp,
    width: i64,
}

impl Bucketizer {
    /// Creates an empty window ending at the bucket containing `time`.
    ///
    /// Panics if `width` is not positive.
    pub fn new(time: Timestamp, width: i64) -> Bucketizer {
        assert!(width > 0, "bucket width must be positive, got {}", width);
        // The very first bucket of the timeline starts after i64::MIN, so round up there.
        let now = align(time, width).unwrap_or_else(|| time + (width - time.rem_euclid(width)));
        Bucketizer {
            buckets: [Bucket::empty(); BUCKET_COUNT],
            now,
            width,
        }
    }

    /// Creates a window ending at the bucket containing `time`, seeded with `bucket`.
    pub fn with_bucket(time: Timestamp, width: i64, bucket: &Bucket) -> Bucketizer {
        let mut bucketizer = Bucketizer::new(time, width);
        let _ = bucketizer.update(bucket);
        bucketizer
    }

    /// Merges `incoming` into the slot covering its time.
    ///
    /// Returns the slot index on success.  Updates too far in the past or the future leave every
    /// slot untouched.
    pub fn update(&mut self, incoming: &Bucket) -> Result<usize, OutOfWindow> {
        let aligned = align(incoming.time(), self.width);
        let offset = aligned
            .and_then(|time| time.checked_sub(self.now))
            .and_then(|delta| (delta / self.width).checked_add(BUCKET_COUNT as i64 - 1));

        let (time, offset) = match (aligned, offset) {
            (Some(time), Some(offset)) if offset >= 0 && offset < BUCKET_COUNT as i64 => (time, offset),
            _ => {
                let rejected = OutOfWindow {
                    time: aligned.unwrap_or_else(|| incoming.time()),
                    now: self.now,
                    offset: offset.unwrap_or(if incoming.time() < self.now { i64::MIN } else { i64::MAX }),
                };
                warn!("bucketizer update bad time: {}", rejected);
                return Err(rejected);
            },
        };

        debug!(
            "bucketizer updating time {} with value {} at offset {}",
            time,
            incoming.sum(),
            offset
        );
        let slot = offset as usize;
        self.buckets[slot].update(&incoming.with_time(time));
        Ok(slot)
    }

    /// Rolls the window forward until it ends at the bucket containing `new_now`.
    ///
    /// Returns the non-empty buckets that fell out of the window, oldest first.  Moving backwards
    /// is a no-op.
    pub fn advance(&mut self, new_now: Timestamp) -> Vec<Bucket> {
        let mut evicted = Vec::new();
        let target = match align(new_now, self.width) {
            Some(target) if target > self.now => target,
            _ => return evicted,
        };

        let steps = target.checked_sub(self.now).map_or(i64::MAX, |delta| delta / self.width);
        if steps >= BUCKET_COUNT as i64 {
            evicted.extend(self.buckets.iter().filter(|b| !b.is_empty()).copied());
            self.buckets = [Bucket::empty(); BUCKET_COUNT];
            self.now = target;
            return evicted;
        }

        for _ in 0..steps {
            let oldest = self.buckets[0];
            if !oldest.is_empty() {
                evicted.push(oldest);
            }
            self.buckets.rotate_left(1);
            self.buckets[BUCKET_COUNT - 1] = Bucket::empty();
            self.now += self.width;
        }

        evicted
    }

    /// Empties every slot without moving the window, returning the non-empty buckets oldest first.
    pub fn drain(&mut self) -> Vec<Bucket> {
        let drained = self.buckets.iter().filter(|b| !b.is_empty()).copied().collect();
        self.buckets = [Bucket::empty(); BUCKET_COUNT];
        drained
    }

    /// Gets the bucket in slot `i`.  Panics if `i >= BUCKET_COUNT`.
    pub fn get(&self, i: usize) -> &Bucket { &self.buckets[i] }

    pub fn buckets(&self) -> &[Bucket] { &self.buckets }

    pub fn now(&self) -> Timestamp { self.now }

    pub fn width(&self) -> i64 { self.width }
}
