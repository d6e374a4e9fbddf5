use crate::{
    error::{io_error, StatError},
    store::StoreStats,
};
use crossbeam_channel::{bounded, Sender};
use std::io;

pub(crate) enum ControlMessage {
    ListMatching(String, Sender<Vec<(String, bool)>>),
    HasAvailableSpace(Sender<bool>),
    Stats(Sender<StoreStats>),
    Flush(Sender<Result<(), StatError>>),
    Shutdown,
}

/// Handle for querying and managing a running `Receiver`.
#[derive(Clone)]
pub struct Controller {
    control_tx: Sender<ControlMessage>,
}

impl Controller {
    pub(crate) fn new(control_tx: Sender<ControlMessage>) -> Controller { Controller { control_tx } }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> ControlMessage) -> Result<T, io::Error> {
        let (tx, rx) = bounded(1);
        self.control_tx
            .send(build(tx))
            .map_err(|_| io_error("failed to send control message"))?;
        rx.recv().map_err(|_| io_error("failed to receive control response"))
    }

    /// Lists counters and counter directories matching `pattern`.
    ///
    /// Samples sent before this call are processed before the listing is taken.
    pub fn list_matching_counters(&self, pattern: &str) -> Result<Vec<(String, bool)>, io::Error> {
        self.request(|tx| ControlMessage::ListMatching(pattern.to_owned(), tx))
    }

    pub fn has_available_space(&self) -> Result<bool, io::Error> { self.request(ControlMessage::HasAvailableSpace) }

    pub fn stats(&self) -> Result<StoreStats, io::Error> { self.request(ControlMessage::Stats) }

    /// Synchronously flushes every counter to disk.
    pub fn flush(&self) -> Result<(), io::Error> {
        self.request(ControlMessage::Flush)?
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// Asks the receiver to process what it has queued, close the store and return from `run`.
    pub fn shutdown(&self) -> Result<(), io::Error> {
        self.control_tx
            .send(ControlMessage::Shutdown)
            .map_err(|_| io_error("failed to send shutdown command"))
    }
}
