pub mod bucket;
pub mod bucketizer;
pub mod retention;

pub use self::{
    bucket::Bucket,
    bucketizer::{Bucketizer, OutOfWindow, BUCKET_COUNT},
    retention::{ParseError, RetentionPolicy, Tier},
};

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// A measurement headed for a counter.
///
/// Samples are the decoupled way of submitting data into the receiver.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sample {
    pub name: String,
    pub value: f64,
    /// When the value was measured, or `None` to use the receiver's clock.
    pub time: Option<Timestamp>,
}

impl Sample {
    pub(crate) fn new(name: String, value: f64, time: Option<Timestamp>) -> Sample { Sample { name, value, time } }

    /// Prefixes the sample name with `scope`, joined by a `.`.
    pub(crate) fn into_scoped(self, scope: &str) -> Sample {
        if scope.is_empty() {
            return self;
        }

        Sample {
            name: format!("{}.{}", scope, self.name),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Sample;

    #[test]
    fn test_sample_scoping() {
        let sample = Sample::new("latency".to_owned(), 1.0, Some(10));
        assert_eq!(sample.clone().into_scoped("").name, "latency");

        let scoped = sample.into_scoped("listener.a");
        assert_eq!(scoped.name, "listener.a.latency");
        assert_eq!(scoped.value, 1.0);
        assert_eq!(scoped.time, Some(10));
    }
}
