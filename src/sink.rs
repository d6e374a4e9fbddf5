use crate::data::{Sample, Timestamp};
use crossbeam_channel::Sender;
use std::{error, fmt};

/// Errors during sink creation or sending.
#[derive(Debug, PartialEq)]
pub enum SinkError {
    /// The scope value given was invalid i.e. empty or containing the `.` separator.
    InvalidScope,

    /// The receiver is no longer running.
    Disconnected,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SinkError::InvalidScope => write!(f, "invalid scope"),
            SinkError::Disconnected => write!(f, "receiver disconnected"),
        }
    }
}

impl error::Error for SinkError {}

/// Handle for sending samples into the receiver.
///
/// `Sink` is cloneable and can be handed to as many producers as needed.
#[derive(Clone)]
pub struct Sink {
    data_tx: Sender<Sample>,
    scope: String,
}

impl Sink {
    pub(crate) fn new(data_tx: Sender<Sample>, scope: String) -> Sink { Sink { data_tx, scope } }

    /// Creates a scoped clone of this `Sink`.
    ///
    /// Scoping controls the resulting counter name for any samples sent by this `Sink`.  With a
    /// scoped `Sink` per listener, the same `messages_sent` sample ends up in independent counters:
    /// - `listener.a.messages_sent`
    /// - `listener.b.messages_sent`
    ///
    /// Scopes are inherited: scoping an already scoped `Sink` joins both scopes with a `.`, which
    /// also nests the counters one directory deeper on disk.
    pub fn scoped(&self, scope: &str) -> Result<Sink, SinkError> {
        if scope.is_empty() || scope.contains('.') {
            return Err(SinkError::InvalidScope);
        }

        let mut new_scope = self.scope.clone();
        if !new_scope.is_empty() {
            new_scope.push('.');
        }
        new_scope.push_str(scope);

        Ok(Sink::new(self.data_tx.clone(), new_scope))
    }

    /// The scope prefixed to every counter name, empty for the root sink.
    pub fn scope(&self) -> &str { &self.scope }

    /// Sends a sample measured now.
    pub fn send(&self, name: &str, value: f64) -> Result<(), SinkError> { self.send_sample(name, value, None) }

    /// Sends a sample measured at `time`.
    pub fn send_at(&self, name: &str, value: f64, time: Timestamp) -> Result<(), SinkError> {
        self.send_sample(name, value, Some(time))
    }

    fn send_sample(&self, name: &str, value: f64, time: Option<Timestamp>) -> Result<(), SinkError> {
        let sample = Sample::new(name.to_owned(), value, time).into_scoped(&self.scope);
        self.data_tx.send(sample).map_err(|_| SinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::{Sink, SinkError};
    use crossbeam_channel::bounded;

    #[test]
    fn test_sink_scoping() {
        let (tx, rx) = bounded(8);
        let sink = Sink::new(tx, String::new());

        assert_eq!(sink.scoped("").err(), Some(SinkError::InvalidScope));
        assert_eq!(sink.scoped("a.b").err(), Some(SinkError::InvalidScope));

        let listener = sink.scoped("listener").unwrap().scoped("a").unwrap();
        assert_eq!(listener.scope(), "listener.a");

        listener.send("messages_sent", 3.0).unwrap();
        sink.send_at("uptime", 1.0, 100).unwrap();

        let first = rx.recv().unwrap();
        assert_eq!(first.name, "listener.a.messages_sent");
        assert_eq!(first.time, None);

        let second = rx.recv().unwrap();
        assert_eq!(second.name, "uptime");
        assert_eq!(second.time, Some(100));
    }

    #[test]
    fn test_sink_disconnected() {
        let (tx, rx) = bounded(1);
        let sink = Sink::new(tx, String::new());
        drop(rx);

        assert_eq!(sink.send("taco", 1.0), Err(SinkError::Disconnected));
    }
}
