use crate::{data::RetentionPolicy, error::StatError, receiver::Receiver};
use std::{path::PathBuf, time::Duration};

const DEFAULT_RETENTION: &str = "10s:1d,5m:30d,1h:2y";

/// A configuration builder for `StatStore` and `Receiver`.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub(crate) root: PathBuf,
    pub(crate) retention: RetentionPolicy,
    pub(crate) owner: Option<u32>,
    pub(crate) min_free_space: u64,
    pub(crate) capacity: usize,
    pub(crate) poll_delay: Option<Duration>,
    pub(crate) upkeep_interval: Duration,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            root: PathBuf::from("/var/db/statstore"),
            retention: RetentionPolicy::parse(DEFAULT_RETENTION).unwrap_or_default(),
            owner: None,
            min_free_space: 100 * 1024 * 1024,
            capacity: 1024,
            poll_delay: Some(Duration::from_millis(100)),
            upkeep_interval: Duration::from_secs(1),
        }
    }
}

impl Configuration {
    /// Creates a new `Configuration` with default values.
    pub fn new() -> Configuration { Default::default() }

    /// Sets the directory counters are stored under.
    ///
    /// Defaults to `/var/db/statstore`.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the retention policy applied to every counter.
    ///
    /// Defaults to `10s:1d,5m:30d,1h:2y`: ten second buckets for a day, five minute buckets for a
    /// month and hourly buckets for two years.
    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the user that should own created directories and files.
    ///
    /// Defaults to `None`, which leaves ownership with the running user.
    pub fn owner(mut self, uid: Option<u32>) -> Self {
        self.owner = uid;
        self
    }

    /// Sets the free space threshold, in bytes.
    ///
    /// Defaults to 100 MiB.
    ///
    /// New counters are refused while the volume holding the root has this much free space or
    /// less, since creating a counter is the only operation that grows files on disk.
    pub fn min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    /// Sets the data channel capacity.
    ///
    /// Defaults to `1024`.
    ///
    /// This controls how many samples can be queued for the `Receiver` before a `Sink` blocks.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the poll delay.
    ///
    /// Defaults to `100ms`.
    ///
    /// This is how long the `Receiver` waits for a sample before checking its control channel
    /// and upkeep timer again.  `None` spins without waiting.
    pub fn poll_delay(mut self, poll_delay: Option<Duration>) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Sets how often the `Receiver` rolls every counter forward to the current time.
    ///
    /// Defaults to one second.
    pub fn upkeep_interval(mut self, interval: Duration) -> Self {
        self.upkeep_interval = interval;
        self
    }

    /// Create a `Receiver` over the local filesystem based on this configuration.
    pub fn build(self) -> Result<Receiver, StatError> { Receiver::from_config(self) }
}

#[cfg(test)]
mod tests {
    use super::Configuration;
    use crate::data::RetentionPolicy;
    use std::time::Duration;

    #[test]
    fn test_configuration_defaults() {
        let conf = Configuration::new();
        assert_eq!(conf.retention.tier_count(), 3);
        assert_eq!(conf.min_free_space, 100 * 1024 * 1024);
        assert_eq!(conf.poll_delay, Some(Duration::from_millis(100)));
        assert!(conf.owner.is_none());
    }

    #[test]
    fn test_configuration_setters() {
        let conf = Configuration::new()
            .root("/tmp/stats")
            .retention(RetentionPolicy::parse("10s:1h").unwrap())
            .owner(Some(1000))
            .min_free_space(1)
            .capacity(8)
            .poll_delay(None)
            .upkeep_interval(Duration::from_millis(50));

        assert_eq!(conf.root.to_str(), Some("/tmp/stats"));
        assert_eq!(conf.retention.to_string(), "10s:1h");
        assert_eq!(conf.owner, Some(1000));
        assert_eq!(conf.min_free_space, 1);
        assert_eq!(conf.capacity, 8);
        assert_eq!(conf.poll_delay, None);
        assert_eq!(conf.upkeep_interval, Duration::from_millis(50));
    }
}
