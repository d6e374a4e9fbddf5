//! A persistent time-series counter store.
//!
//! Samples are aggregated into fixed-width buckets per counter, once per tier of a
//! `RetentionPolicy`.  Each tier keeps a short sliding window in memory and a memory-mapped ring of
//! buckets on disk; buckets are written out as they leave the window.  All disk access goes through
//! a `StorageIo`, and counters are only created while the volume has space to spare.
mod clock;
mod configuration;
mod control;
mod counter;
mod data;
mod error;
mod receiver;
mod sink;
mod storage;
mod store;

pub use self::{
    clock::{ClockSource, Mock, SystemClock},
    configuration::Configuration,
    control::Controller,
    counter::{CounterFactory, StatCounter, StatCounterFactory, RECORD_SIZE},
    data::{Bucket, Bucketizer, OutOfWindow, ParseError, RetentionPolicy, Tier, Timestamp, BUCKET_COUNT},
    error::StatError,
    receiver::Receiver,
    sink::{Sink, SinkError},
    storage::{FailingStorage, FileId, FileStorage, IoCounters, MappedRegion, OpenMode, StorageIo},
    store::{StatStore, StoreStats},
};
