use crate::{
    clock::{ClockSource, SystemClock},
    configuration::Configuration,
    counter::{counter_dir, discover_counters, CounterFactory, StatCounter},
    data::{Bucket, RetentionPolicy, Timestamp},
    error::StatError,
    storage::{IoCounters, StorageIo},
};
use fnv::FnvBuildHasher;
use hashbrown::{hash_map::Entry, HashMap};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

type CounterMap = HashMap<String, Arc<Mutex<StatCounter>>, FnvBuildHasher>;

/// Point-in-time statistics about a `StatStore`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StoreStats {
    /// Counters currently open.
    pub counters: usize,
    /// Counters created since the store was constructed.
    pub created: u64,
    /// Samples accepted by `record`.
    pub recorded: u64,
    /// Tier updates dropped for falling outside of a window.
    pub rejected: u64,
    /// Buckets written to tier files.
    pub persisted: u64,
    /// Counter creations refused for lack of disk space.
    pub refused: u64,
    pub io: IoCounters,
}

/// Registry of every counter under a storage root.
///
/// Each counter sits behind its own lock, so updates to unrelated counters never serialize on
/// each other.  The name map is only write-locked long enough to insert a counter; creating its
/// files happens with no store-wide lock held.
pub struct StatStore {
    root: PathBuf,
    owner: Option<u32>,
    policy: Arc<RetentionPolicy>,
    min_free_space: u64,
    factory: Arc<dyn CounterFactory>,
    io: Arc<dyn StorageIo>,
    clock: Arc<dyn ClockSource>,
    counters: RwLock<CounterMap>,
    discovered: RwLock<BTreeSet<String>>,

    created: AtomicU64,
    recorded: AtomicU64,
    rejected: AtomicU64,
    persisted: AtomicU64,
    refused: AtomicU64,
}

impl StatStore {
    pub fn new(conf: Configuration, factory: Arc<dyn CounterFactory>, io: Arc<dyn StorageIo>) -> StatStore {
        StatStore::with_clock(conf, factory, io, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        conf: Configuration, factory: Arc<dyn CounterFactory>, io: Arc<dyn StorageIo>, clock: Arc<dyn ClockSource>,
    ) -> StatStore {
        let discovered: BTreeSet<String> = discover_counters(&conf.root).into_iter().collect();
        info!("found {} existing counters under {}", discovered.len(), conf.root.display());

        StatStore {
            root: conf.root,
            owner: conf.owner,
            policy: Arc::new(conf.retention),
            min_free_space: conf.min_free_space,
            factory,
            io,
            clock,
            counters: RwLock::new(HashMap::default()),
            discovered: RwLock::new(discovered),
            created: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn policy(&self) -> &RetentionPolicy { &self.policy }

    /// Records `value` against `name` at the current time.
    pub fn record(&self, name: &str, value: f64) -> Result<(), StatError> {
        self.record_at(name, value, self.clock.now())
    }

    /// Records `value` against `name` at `time`, creating the counter if it doesn't exist yet.
    ///
    /// A sample that falls outside of a tier's window is dropped for that tier and counted, but is
    /// not an error.
    pub fn record_at(&self, name: &str, value: f64, time: Timestamp) -> Result<(), StatError> {
        validate_name(name)?;
        let bucket = Bucket::new(value, time);
        loop {
            let counter = self.get_or_create(name)?;
            if self.record_into(&counter, &bucket) {
                self.recorded.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            // Closed by `close` after we looked it up; it is gone from the map, so this reopens it.
            debug!("counter {} closed while recording, reopening", name);
        }
    }

    /// Feeds `bucket` to `counter`, returning `false` if the counter was already closed.
    fn record_into(&self, counter: &Mutex<StatCounter>, bucket: &Bucket) -> bool {
        let now = self.clock.now();
        let mut counter = lock(counter);
        if counter.is_closed() {
            return false;
        }

        let persisted = counter.advance(now);
        let rejected = counter.update(bucket);
        drop(counter);

        self.persisted.fetch_add(persisted as u64, Ordering::Relaxed);
        self.rejected.fetch_add(rejected.len() as u64, Ordering::Relaxed);
        true
    }

    fn get_or_create(&self, name: &str) -> Result<Arc<Mutex<StatCounter>>, StatError> {
        if let Some(counter) = read(&self.counters).get(name) {
            return Ok(Arc::clone(counter));
        }

        let available = self.free_space();
        if !available.map_or(false, |free| free > self.min_free_space) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            warn!("refusing to create counter {}: not enough free space", name);
            return Err(StatError::InsufficientSpace {
                path: self.root.clone(),
                available,
                required: self.min_free_space,
            });
        }

        let counter = self
            .factory
            .create(name, &self.policy, self.clock.now(), self.owner)?;

        // Someone else may have created the same counter while we were opening its files.
        let (winner, loser) = {
            let mut counters = write(&self.counters);
            match counters.entry(name.to_owned()) {
                Entry::Occupied(e) => (Arc::clone(e.get()), Some(counter)),
                Entry::Vacant(e) => (Arc::clone(e.insert(Arc::new(Mutex::new(counter)))), None),
            }
        };

        if loser.is_none() {
            self.created.fetch_add(1, Ordering::Relaxed);
            write(&self.discovered).insert(name.to_owned());
            debug!("registered counter {}", name);
        }
        drop(loser);

        Ok(winner)
    }

    /// Appends `(name, is_directory)` for every counter or counter directory matching `pattern`.
    ///
    /// Names and patterns are split into `.`-separated segments.  Each pattern segment must match
    /// the name segment in the same position, either literally or through the `*` and `?`
    /// wildcards.  A counter with exactly as many segments as the pattern is reported as itself;
    /// a longer counter is reported as the directory formed by its first segments.
    pub fn list_matching_counters(&self, pattern: &str, out: &mut Vec<(String, bool)>) {
        let wanted: Vec<&str> = pattern.split('.').collect();
        let names = read(&self.discovered);

        let mut matches = BTreeSet::new();
        for name in names.iter() {
            let segments: Vec<&str> = name.split('.').collect();
            if segments.len() < wanted.len() {
                continue;
            }
            if !wanted.iter().zip(&segments).all(|(p, s)| glob_match(p, s)) {
                continue;
            }

            if segments.len() == wanted.len() {
                matches.insert((name.clone(), false));
            } else {
                matches.insert((segments[..wanted.len()].join("."), true));
            }
        }

        drop(names);
        out.extend(matches);
    }

    /// Whether the volume holding the store has more than the configured minimum free space.
    pub fn has_available_space(&self) -> bool {
        self.free_space().map_or(false, |free| free > self.min_free_space)
    }

    fn free_space(&self) -> Option<u64> {
        match self.io.available_space(&self.root) {
            Ok(free) => Some(free),
            Err(e) => {
                warn!("unable to query free space on {}: {}", self.root.display(), e);
                None
            },
        }
    }

    /// Rolls every open counter forward to `now`, persisting buckets that leave their windows.
    pub fn advance(&self, now: Timestamp) -> usize {
        let mut persisted = 0;
        for counter in self.snapshot_counters() {
            persisted += lock(&counter).advance(now);
        }
        self.persisted.fetch_add(persisted as u64, Ordering::Relaxed);
        persisted
    }

    /// Rolls every open counter forward to the clock's current time.
    pub fn upkeep(&self) -> usize { self.advance(self.clock.now()) }

    /// Writes the dirty pages of every open counter back to disk.
    pub fn flush(&self, immediate: bool) -> Result<(), StatError> {
        for counter in self.snapshot_counters() {
            let counter = lock(&counter);
            counter
                .flush(immediate)
                .map_err(|e| StatError::storage(counter_dir(&self.root, counter.name()), e))?;
        }
        Ok(())
    }

    /// Persists and closes every open counter.
    ///
    /// Counters recorded to afterwards are simply reopened.
    pub fn close(&self) -> Result<(), StatError> {
        let counters: Vec<_> = write(&self.counters).drain().collect();
        info!("closing {} counters", counters.len());

        let mut result = Ok(());
        for (name, counter) in counters {
            if let Err(e) = lock(&counter).close() {
                result = Err(StatError::storage(counter_dir(&self.root, &name), e));
            }
        }
        result
    }

    /// Number of open counters.
    pub fn counter_count(&self) -> usize { read(&self.counters).len() }

    /// Runs `f` against the open counter `name`, if there is one.
    pub fn with_counter<R>(&self, name: &str, f: impl FnOnce(&StatCounter) -> R) -> Option<R> {
        let counter = read(&self.counters).get(name).cloned()?;
        let guard = lock(&counter);
        Some(f(&guard))
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            counters: self.counter_count(),
            created: self.created.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            io: self.io.counters(),
        }
    }

    fn snapshot_counters(&self) -> Vec<Arc<Mutex<StatCounter>>> { read(&self.counters).values().cloned().collect() }
}

fn validate_name(name: &str) -> Result<(), StatError> {
    let bad_segment = |s: &str| s.is_empty() || s.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if name.split('.').any(bad_segment) {
        return Err(StatError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Matches `text` against `pattern`, where `*` matches any run of characters and `?` matches one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match l.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match l.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
