use crate::{
    configuration::Configuration,
    control::{ControlMessage, Controller},
    counter::StatCounterFactory,
    data::Sample,
    error::StatError,
    sink::Sink,
    storage::{FileStorage, StorageIo},
    store::StatStore,
};
use crossbeam_channel::{self, bounded, tick, RecvTimeoutError, TryRecvError};
use log::{error, info};
use std::{fs, sync::Arc, time::Duration};

/// Event loop feeding samples into a `StatStore`.
///
/// Samples arrive from any number of `Sink`s over a bounded channel and queries from any number of
/// `Controller`s.  The receiver also rolls every counter forward on a fixed upkeep interval, so
/// buckets of idle counters still reach disk.
pub struct Receiver {
    data_tx: crossbeam_channel::Sender<Sample>,
    data_rx: crossbeam_channel::Receiver<Sample>,
    control_tx: crossbeam_channel::Sender<ControlMessage>,
    control_rx: crossbeam_channel::Receiver<ControlMessage>,
    store: Arc<StatStore>,
    poll_delay: Option<Duration>,
    upkeep_interval: Duration,
}

impl Receiver {
    pub(crate) fn from_config(conf: Configuration) -> Result<Receiver, StatError> {
        fs::create_dir_all(&conf.root).map_err(|e| StatError::storage(&conf.root, e))?;

        let io: Arc<dyn StorageIo> = Arc::new(FileStorage::new());
        let factory = Arc::new(StatCounterFactory::new(conf.root.clone(), Arc::clone(&io)));
        let store = Arc::new(StatStore::new(conf.clone(), factory, io));
        Ok(Receiver::with_store(&conf, store))
    }

    /// Creates a receiver driving an existing store.
    pub fn with_store(conf: &Configuration, store: Arc<StatStore>) -> Receiver {
        let (data_tx, data_rx) = bounded(conf.capacity);
        let (control_tx, control_rx) = bounded(1024);

        Receiver {
            data_tx,
            data_rx,
            control_tx,
            control_rx,
            store,
            poll_delay: conf.poll_delay,
            upkeep_interval: conf.upkeep_interval,
        }
    }

    /// Gets a builder to configure a `Receiver` instance with.
    pub fn builder() -> Configuration { Configuration::default() }

    /// Creates a `Sink` bound to this receiver.
    pub fn get_sink(&self) -> Sink { Sink::new(self.data_tx.clone(), String::new()) }

    /// Creates a `Controller` bound to this receiver.
    pub fn get_controller(&self) -> Controller { Controller::new(self.control_tx.clone()) }

    /// The store samples are recorded into.
    pub fn store(&self) -> Arc<StatStore> { Arc::clone(&self.store) }

    fn process_sample(&self, sample: Sample) {
        let result = match sample.time {
            Some(time) => self.store.record_at(&sample.name, sample.value, time),
            None => self.store.record(&sample.name, sample.value),
        };
        if let Err(e) = result {
            error!("failed to record sample for {}: {}", sample.name, e);
        }
    }

    fn drain_data(&self) {
        while let Ok(sample) = self.data_rx.try_recv() {
            self.process_sample(sample);
        }
    }

    /// Handles a control message, returning `false` once the receiver should stop.
    fn process_control_msg(&self, msg: ControlMessage) -> bool {
        // Anything a caller sent before asking should be visible in the answer.
        self.drain_data();

        match msg {
            ControlMessage::ListMatching(pattern, tx) => {
                let mut out = Vec::new();
                self.store.list_matching_counters(&pattern, &mut out);
                let _ = tx.send(out);
            },
            ControlMessage::HasAvailableSpace(tx) => {
                let _ = tx.send(self.store.has_available_space());
            },
            ControlMessage::Stats(tx) => {
                let _ = tx.send(self.store.stats());
            },
            ControlMessage::Flush(tx) => {
                let _ = tx.send(self.store.flush(true));
            },
            ControlMessage::Shutdown => {
                info!("receiver shutting down");
                if let Err(e) = self.store.close() {
                    error!("error closing store: {}", e);
                }
                return false;
            },
        }

        true
    }

    /// Run the receiver until a `Controller` asks it to shut down.
    pub fn run(&mut self) {
        let upkeep_rx = tick(self.upkeep_interval);
        loop {
            if upkeep_rx.try_recv().is_ok() {
                self.store.upkeep();
            }

            while let Ok(msg) = self.control_rx.try_recv() {
                if !self.process_control_msg(msg) {
                    return;
                }
            }

            match self.poll_delay {
                Some(delay) => match self.data_rx.recv_timeout(delay) {
                    Ok(sample) => self.process_sample(sample),
                    Err(RecvTimeoutError::Timeout) => {},
                    Err(e) => error!("error receiving data message: {}", e),
                },
                None => match self.data_rx.try_recv() {
                    Ok(sample) => self.process_sample(sample),
                    Err(TryRecvError::Empty) => {},
                    Err(e) => error!("error receiving data message: {}", e),
                },
            }
        }
    }
}
