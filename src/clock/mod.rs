use crate::data::Timestamp;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

mod mock;
pub use self::mock::Mock;

/// A source of wall-clock time, in seconds since the Unix epoch.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

impl<T: ClockSource> ClockSource for Arc<T> {
    fn now(&self) -> Timestamp { (**self).now() }
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> SystemClock { SystemClock }
}

impl ClockSource for SystemClock {
    fn now(&self) -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as Timestamp,
            Err(e) => -(e.duration().as_secs() as Timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClockSource, Mock, SystemClock};
    use std::sync::Arc;

    #[test]
    fn test_system_clock_is_after_epoch() {
        // 2017-07-14, comfortably in the past.
        assert!(SystemClock::new().now() > 1_500_000_000);
    }

    #[test]
    fn test_mock_clock_through_arc() {
        let mock = Arc::new(Mock::new(100));
        let clock: Arc<dyn ClockSource> = mock.clone();
        assert_eq!(clock.now(), 100);

        mock.increment(25);
        assert_eq!(clock.now(), 125);

        mock.set(10);
        assert_eq!(clock.now(), 10);
    }
}
