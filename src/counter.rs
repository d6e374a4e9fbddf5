use crate::{
    data::{bucketizer::align, Bucket, Bucketizer, OutOfWindow, RetentionPolicy, Tier, Timestamp},
    error::{io_error, StatError},
    storage::{FileId, MappedRegion, OpenMode, StorageIo},
};
use log::{debug, error, warn};
use std::{
    convert::TryFrom,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use walkdir::WalkDir;

/// Size of one serialized bucket in a tier file.
///
/// Records are little-endian `time: i64, count: u64, sum: f64, min: f64, max: f64`; a zero count
/// marks an unused slot.
pub const RECORD_SIZE: usize = 40;

const TIER_EXTENSION: &str = "bkt";

/// Creates the storage behind a counter.
pub trait CounterFactory: Send + Sync {
    /// Opens or creates the backing files for `name`, one per tier of `policy`, with every
    /// in-memory window ending at `now`.
    fn create(
        &self, name: &str, policy: &RetentionPolicy, now: Timestamp, owner: Option<u32>,
    ) -> Result<StatCounter, StatError>;
}

/// `CounterFactory` laying counters out under a root directory.
///
/// A counter named `a.b.c` lives in `<root>/a/b/c/`, with one file per retention tier named
/// after the tier, e.g. `10s_1d.bkt`.
pub struct StatCounterFactory {
    root: PathBuf,
    io: Arc<dyn StorageIo>,
}

impl StatCounterFactory {
    pub fn new(root: impl Into<PathBuf>, io: Arc<dyn StorageIo>) -> StatCounterFactory {
        StatCounterFactory { root: root.into(), io }
    }

    pub fn root(&self) -> &Path { &self.root }

    fn open_tier(&self, dir: &Path, tier: &Tier, owner: Option<u32>) -> Result<TierFile, StatError> {
        let path = dir.join(tier_file_name(tier));
        let fd = self
            .io
            .open(&path, OpenMode::create().owner(owner))
            .map_err(|e| StatError::storage(&path, e))?;

        match self.size_and_map(fd, tier) {
            Ok(region) => Ok(TierFile {
                path,
                fd,
                region,
                slots: tier.bucket_count(),
            }),
            Err(e) => {
                let _ = self.io.close(fd);
                Err(StatError::storage(&path, e))
            },
        }
    }

    fn size_and_map(&self, fd: FileId, tier: &Tier) -> io::Result<MappedRegion> {
        let len = tier
            .bucket_count()
            .checked_mul(RECORD_SIZE)
            .filter(|len| u64::try_from(*len).is_ok())
            .ok_or_else(|| io_error("tier file would exceed the addressable size"))?;
        let size = self.io.seek(fd, SeekFrom::End(0))?;
        if size != len as u64 {
            if size != 0 {
                warn!("tier file has {} bytes but {} are expected, resetting it", size, len);
                self.io.truncate(fd, 0)?;
            }
            self.io.truncate(fd, len as u64)?;
        }
        self.io.map(fd, 0, len, true)
    }
}

impl CounterFactory for StatCounterFactory {
    fn create(
        &self, name: &str, policy: &RetentionPolicy, now: Timestamp, owner: Option<u32>,
    ) -> Result<StatCounter, StatError> {
        let dir = counter_dir(&self.root, name);
        let mut tiers: Vec<TierState> = Vec::with_capacity(policy.tier_count());

        for tier in policy.tiers() {
            match self.open_tier(&dir, tier, owner) {
                Ok(file) => tiers.push(TierState {
                    tier: *tier,
                    ring: Bucketizer::new(now, tier.width_secs()),
                    file,
                }),
                Err(e) => {
                    for state in tiers.drain(..) {
                        state.file.release(&*self.io);
                    }
                    return Err(e);
                },
            }
        }

        debug!("created counter {} with {} tiers", name, tiers.len());
        Ok(StatCounter {
            name: name.to_owned(),
            tiers,
            io: Arc::clone(&self.io),
            closed: false,
        })
    }
}

struct TierFile {
    path: PathBuf,
    fd: FileId,
    region: MappedRegion,
    slots: usize,
}

impl TierFile {
    fn slot(&self, time: Timestamp, width: i64) -> usize { (time / width).rem_euclid(self.slots as i64) as usize }

    fn read(&self, slot: usize) -> Bucket {
        let at = slot * RECORD_SIZE;
        decode(&self.region.as_slice()[at..at + RECORD_SIZE])
    }

    fn write(&mut self, slot: usize, bucket: &Bucket) -> io::Result<()> {
        let at = slot * RECORD_SIZE;
        let buf = self
            .region
            .as_mut_slice()
            .ok_or_else(|| io_error("tier file is mapped read-only"))?;
        encode(bucket, &mut buf[at..at + RECORD_SIZE]);
        Ok(())
    }

    fn release(self, io: &dyn StorageIo) {
        let fd = self.fd;
        if let Err(e) = io.unmap(self.region) {
            error!("failed to unmap tier file: {}", e);
        }
        if let Err(e) = io.close(fd) {
            error!("failed to close tier file: {}", e);
        }
    }
}

struct TierState {
    tier: Tier,
    ring: Bucketizer,
    file: TierFile,
}

impl TierState {
    fn persist(&mut self, bucket: &Bucket) -> io::Result<()> {
        let width = self.tier.width_secs();
        let time = align(bucket.time(), width).ok_or_else(|| io_error("bucket time out of range"))?;
        let slot = self.file.slot(time, width);

        let mut stored = self.file.read(slot);
        if stored.is_empty() || stored.time() != time {
            stored = Bucket::empty();
        }
        stored.update(&bucket.with_time(time));
        self.file.write(slot, &stored)
    }
}

/// A named counter: one sliding window and one backing file per retention tier.
pub struct StatCounter {
    name: String,
    tiers: Vec<TierState>,
    io: Arc<dyn StorageIo>,
    closed: bool,
}

impl StatCounter {
    pub fn name(&self) -> &str { &self.name }

    pub fn tier_count(&self) -> usize { self.tiers.len() }

    /// Whether `close` has run.  A closed counter has released its files and drops every update.
    pub fn is_closed(&self) -> bool { self.closed }

    /// The in-memory window of tier `i`.
    pub fn bucketizer(&self, i: usize) -> Option<&Bucketizer> { self.tiers.get(i).map(|t| &t.ring) }

    /// Path of the file backing tier `i`.
    pub fn tier_path(&self, i: usize) -> Option<&Path> { self.tiers.get(i).map(|t| t.file.path.as_path()) }

    /// Feeds `bucket` to every tier, returning the rejections of tiers whose window it missed.
    pub fn update(&mut self, bucket: &Bucket) -> Vec<OutOfWindow> {
        let mut rejected = Vec::new();
        for state in &mut self.tiers {
            if let Err(e) = state.ring.update(bucket) {
                rejected.push(e);
            }
        }
        rejected
    }

    /// Rolls every tier forward to `now`, persisting whatever falls out of the windows.
    ///
    /// Returns the number of buckets written to disk.
    pub fn advance(&mut self, now: Timestamp) -> usize {
        let mut persisted = 0;
        for state in &mut self.tiers {
            for bucket in state.ring.advance(now) {
                match state.persist(&bucket) {
                    Ok(()) => persisted += 1,
                    Err(e) => error!("failed to persist {} at {}: {}", self.name, bucket.time(), e),
                }
            }
        }
        persisted
    }

    /// Reads the persisted bucket of tier `i` covering `time`, if one has been written.
    pub fn stored(&self, i: usize, time: Timestamp) -> Option<Bucket> {
        let state = self.tiers.get(i)?;
        let width = state.tier.width_secs();
        let time = align(time, width)?;
        let bucket = state.file.read(state.file.slot(time, width));
        if bucket.is_empty() || bucket.time() != time {
            None
        } else {
            Some(bucket)
        }
    }

    /// Writes dirty pages back to the tier files.
    pub fn flush(&self, immediate: bool) -> io::Result<()> {
        for state in &self.tiers {
            self.io.flush(&state.file.region, immediate)?;
        }
        Ok(())
    }

    /// Persists everything still held in memory, then unmaps and closes the tier files.
    pub fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        let mut result = Ok(());
        for mut state in self.tiers.drain(..) {
            for bucket in state.ring.drain() {
                if let Err(e) = state.persist(&bucket) {
                    error!("failed to persist {} at {}: {}", self.name, bucket.time(), e);
                    result = Err(e);
                }
            }
            if let Err(e) = self.io.flush(&state.file.region, true) {
                error!("failed to flush {}: {}", self.name, e);
                result = Err(e);
            }
            state.file.release(&*self.io);
        }
        result
    }
}

impl Drop for StatCounter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// Directory holding the tier files of counter `name`.
pub(crate) fn counter_dir(root: &Path, name: &str) -> PathBuf {
    let mut dir = root.to_path_buf();
    for segment in name.split('.') {
        dir.push(segment);
    }
    dir
}

fn tier_file_name(tier: &Tier) -> String { format!("{}.{}", tier.to_string().replace(':', "_"), TIER_EXTENSION) }

/// Names of every counter with at least one tier file under `root`.
pub(crate) fn discover_counters(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = WalkDir::new(root)
        .min_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().map_or(false, |ext| ext == TIER_EXTENSION))
        .filter_map(|entry| {
            let dir = entry.path().parent()?.strip_prefix(root).ok()?;
            let segments: Option<Vec<&str>> = dir.components().map(|c| c.as_os_str().to_str()).collect();
            segments.map(|s| s.join("."))
        })
        .collect();

    names.sort();
    names.dedup();
    names
}

fn encode(bucket: &Bucket, out: &mut [u8]) {
    out[0..8].copy_from_slice(&bucket.time().to_le_bytes());
    out[8..16].copy_from_slice(&bucket.count().to_le_bytes());
    out[16..24].copy_from_slice(&bucket.sum().to_le_bytes());
    out[24..32].copy_from_slice(&bucket.min().to_le_bytes());
    out[32..40].copy_from_slice(&bucket.max().to_le_bytes());
}

fn decode(buf: &[u8]) -> Bucket {
    let word = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[at..at + 8]);
        raw
    };

    Bucket::from_parts(
        i64::from_le_bytes(word(0)),
        u64::from_le_bytes(word(8)),
        f64::from_le_bytes(word(16)),
        f64::from_le_bytes(word(24)),
        f64::from_le_bytes(word(32)),
    )
}

#[cfg(test)]
mod tests {
    use super::{counter_dir, discover_counters, CounterFactory, StatCounterFactory, RECORD_SIZE};
    use crate::{
        data::{Bucket, RetentionPolicy, BUCKET_COUNT},
        error::StatError,
        storage::{FailingStorage, FileStorage, StorageIo},
    };
    use std::{path::Path, sync::Arc};

    const NOW: i64 = 1_000_000;

    fn factory(root: &Path) -> (StatCounterFactory, Arc<FileStorage>) {
        let io = Arc::new(FileStorage::new());
        (StatCounterFactory::new(root, io.clone()), io)
    }

    #[test]
    fn test_counter_dir_layout() {
        let dir = counter_dir(Path::new("/var/stats"), "web.frontend.latency");
        assert_eq!(dir, Path::new("/var/stats/web/frontend/latency"));
    }

    #[test]
    fn test_factory_sizes_tier_files() {
        let root = tempfile::tempdir().unwrap();
        let (factory, io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1d,5m:1w").unwrap();

        let counter = factory.create("taco", &rp, NOW, None).unwrap();
        assert_eq!(counter.tier_count(), 2);

        let first = counter.tier_path(0).unwrap();
        assert_eq!(first, root.path().join("taco").join("10s_1d.bkt"));
        assert_eq!(
            std::fs::metadata(first).unwrap().len() as usize,
            rp.tier_bucket_count(0) * RECORD_SIZE
        );
        let second = counter.tier_path(1).unwrap();
        assert_eq!(
            std::fs::metadata(second).unwrap().len() as usize,
            rp.tier_bucket_count(1) * RECORD_SIZE
        );

        assert_eq!(io.counters().opens, 2);
        assert_eq!(io.counters().maps, 2);
    }

    #[test]
    fn test_factory_disabled_policy_has_no_tiers() {
        let root = tempfile::tempdir().unwrap();
        let (factory, io) = factory(root.path());

        let counter = factory.create("taco", &RetentionPolicy::default(), NOW, None).unwrap();
        assert_eq!(counter.tier_count(), 0);
        assert_eq!(io.counters().opens, 0);
    }

    #[test]
    fn test_factory_failing_storage() {
        let io: Arc<dyn StorageIo> = Arc::new(FailingStorage::new(1 << 30));
        let factory = StatCounterFactory::new("/nonexistent/root", io);
        let rp = RetentionPolicy::parse("10s:1d").unwrap();

        match factory.create("taco", &rp, NOW, None) {
            Err(StatError::Storage { path, .. }) => assert!(path.ends_with("taco/10s_1d.bkt")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("counter created on failing storage"),
        }
    }

    #[test]
    fn test_factory_oversized_tier() {
        let root = tempfile::tempdir().unwrap();
        let (factory, io) = factory(root.path());
        let rp = RetentionPolicy::parse("1s:100000000000y").unwrap();

        match factory.create("taco", &rp, NOW, None) {
            Err(StatError::Storage { path, .. }) => assert!(path.ends_with("taco/1s_100000000000y.bkt")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("counter created with an oversized tier"),
        }
        assert_eq!(io.counters().opens, io.counters().closes);
        assert_eq!(io.counters().maps, 0);
    }

    #[test]
    fn test_counter_extreme_times() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1h").unwrap();

        let mut counter = factory.create("taco", &rp, NOW, None).unwrap();
        assert_eq!(counter.update(&Bucket::new(1.0, i64::MIN)).len(), 1);
        assert_eq!(counter.update(&Bucket::new(1.0, i64::MAX)).len(), 1);
        assert!(counter.stored(0, i64::MIN).is_none());
        assert_eq!(counter.advance(i64::MAX), 0);
    }

    #[test]
    fn test_counter_close_marks_closed() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());

        let mut counter = factory.create("taco", &RetentionPolicy::default(), NOW, None).unwrap();
        assert!(!counter.is_closed());
        counter.close().unwrap();
        assert!(counter.is_closed());
    }

    #[test]
    fn test_counter_updates_every_tier() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1d,1m:1d").unwrap();

        let mut counter = factory.create("taco", &rp, NOW, None).unwrap();
        assert!(counter.update(&Bucket::new(2.0, NOW)).is_empty());
        assert!(counter.update(&Bucket::new(3.0, NOW - 30)).is_empty());

        let fine = counter.bucketizer(0).unwrap();
        assert_eq!(fine.get(BUCKET_COUNT - 1).sum(), 2.0);
        assert_eq!(fine.get(BUCKET_COUNT - 4).sum(), 3.0);

        let coarse = counter.bucketizer(1).unwrap();
        let total: f64 = coarse.buckets().iter().map(|b| b.sum()).sum();
        assert_eq!(total, 5.0);

        // Too old for the 10 second tier, still inside the 1 minute one.
        let rejected = counter.update(&Bucket::new(1.0, NOW - 120));
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_counter_advance_persists() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1h").unwrap();

        let mut counter = factory.create("taco", &rp, NOW, None).unwrap();
        counter.update(&Bucket::new(42.42, NOW));
        assert!(counter.stored(0, NOW).is_none());

        assert_eq!(counter.advance(NOW + 10 * BUCKET_COUNT as i64), 1);
        let stored = counter.stored(0, NOW).unwrap();
        assert_eq!(stored.sum(), 42.42);
        assert_eq!(stored.count(), 1);

        // Nothing left to evict.
        assert_eq!(counter.advance(NOW + 1000), 0);
        counter.flush(true).unwrap();
    }

    #[test]
    fn test_counter_close_and_reopen() {
        let root = tempfile::tempdir().unwrap();
        let (factory, io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1h").unwrap();

        let mut counter = factory.create("a.b", &rp, NOW, None).unwrap();
        counter.update(&Bucket::new(1.0, NOW));
        counter.update(&Bucket::new(2.0, NOW - 10));
        counter.close().unwrap();
        drop(counter);
        assert_eq!(io.counters().closes, 1);
        assert_eq!(io.counters().unmaps, 1);

        let mut counter = factory.create("a.b", &rp, NOW, None).unwrap();
        assert_eq!(counter.stored(0, NOW).unwrap().sum(), 1.0);
        assert_eq!(counter.stored(0, NOW - 10).unwrap().sum(), 2.0);

        // New samples for an already persisted time merge with what is on disk.
        counter.update(&Bucket::new(4.0, NOW));
        counter.close().unwrap();
        let counter = factory.create("a.b", &rp, NOW, None).unwrap();
        let merged = counter.stored(0, NOW).unwrap();
        assert_eq!(merged.sum(), 5.0);
        assert_eq!(merged.count(), 2);
    }

    #[test]
    fn test_counter_slot_reuse_overwrites_stale() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());
        // 6 slots, so NOW and NOW + 60 share a slot.
        let rp = RetentionPolicy::parse("10s:1m").unwrap();

        let mut counter = factory.create("taco", &rp, NOW, None).unwrap();
        counter.update(&Bucket::new(1.0, NOW));
        counter.advance(NOW + 60);
        counter.update(&Bucket::new(7.0, NOW + 60));
        counter.advance(NOW + 120);

        assert!(counter.stored(0, NOW).is_none());
        let fresh = counter.stored(0, NOW + 60).unwrap();
        assert_eq!(fresh.sum(), 7.0);
        assert_eq!(fresh.count(), 1);
    }

    #[test]
    fn test_discover_counters() {
        let root = tempfile::tempdir().unwrap();
        let (factory, _io) = factory(root.path());
        let rp = RetentionPolicy::parse("10s:1m").unwrap();

        for name in ["web.latency", "web.errors", "taco"].iter() {
            let mut counter = factory.create(name, &rp, NOW, None).unwrap();
            counter.close().unwrap();
        }
        std::fs::write(root.path().join("web").join("notes.txt"), b"ignored").unwrap();

        assert_eq!(discover_counters(root.path()), vec!["taco", "web.errors", "web.latency"]);
        assert!(discover_counters(&root.path().join("missing")).is_empty());
    }
}
