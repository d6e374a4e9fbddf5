use crate::{clock::ClockSource, data::Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};

/// A manually driven clock for tests.
pub struct Mock {
    offset: AtomicI64,
}

impl Mock {
    pub fn new(offset: Timestamp) -> Self {
        Self {
            offset: AtomicI64::new(offset),
        }
    }

    pub fn increment(&self, amount: i64) { self.offset.fetch_add(amount, Ordering::Release); }

    pub fn set(&self, time: Timestamp) { self.offset.store(time, Ordering::Release); }
}

impl ClockSource for Mock {
    fn now(&self) -> Timestamp { self.offset.load(Ordering::Acquire) }
}
