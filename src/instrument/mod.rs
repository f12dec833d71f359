//! The instrument aggregate root and its command processor.
//!
//! An [`Instrument`] owns exactly one bus-device handle, one FIFO command
//! queue with a dedicated worker task, one acquisition collector (dormant
//! unless started), the three cached snapshots, and a set of listeners. The
//! worker runs for the instrument's entire lifetime; [`Instrument::close`]
//! stops the collector, drains the queue, and joins the worker.
//!
//! # Command flow
//!
//! ```text
//! caller                         worker task
//! ------                         -----------
//! submit(cmd) ── mpsc ──────────▶ dequeue (strict FIFO)
//!   returns CommandHandle        driver.validate(cmd)
//!                                driver.execute(bus, cmd)
//!                                publish snapshots + fan-out
//! handle.wait(timeout) ◀─ oneshot ─ resolve submission
//! ```
//!
//! Only the worker mutates the cached snapshots; external code reads
//! snapshots or submits commands. There is no other mutation path, which is
//! what makes the atomic-sequence consistency check in the driver meaningful.

pub mod dmm;
pub mod driver;

use crate::bus::BusDevice;
use crate::collector::{AcquisitionCollector, AcquisitionConfig};
use crate::command::{Command, CommandHandle, CommandReply, Submission};
use crate::error::{DaqError, DaqResult};
use crate::instrument::driver::InstrumentDriver;
use crate::listener::{InstrumentListener, ListenerSet};
use crate::snapshot::{Reading, Settings, Status};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

struct InstrumentShared {
    name: String,
    settings: RwLock<Option<Arc<Settings>>>,
    status: RwLock<Option<Arc<Status>>>,
    reading: RwLock<Option<Arc<Reading>>>,
    listeners: ListenerSet,
}

impl InstrumentShared {
    fn read<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
        slot.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace<T>(slot: &RwLock<Option<T>>, value: T) {
        *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    /// Replace the cached snapshot, then notify listeners in order. Runs on
    /// the worker, so listeners are never invoked concurrently for the same
    /// instrument.
    fn publish(&self, reply: &CommandReply) {
        match reply {
            CommandReply::Settings(settings) => {
                Self::replace(&self.settings, Arc::clone(settings));
                self.listeners.notify_settings(&self.name, settings);
            }
            CommandReply::Status(status) => {
                Self::replace(&self.status, Arc::clone(status));
                self.listeners.notify_status(&self.name, status);
            }
            CommandReply::Reading(reading) => {
                Self::replace(&self.reading, Arc::clone(reading));
                self.listeners.notify_reading(&self.name, reading);
            }
            CommandReply::Done
            | CommandReply::CalibrationByte(_)
            | CommandReply::CalibrationBlock(_) => {}
        }
    }
}

/// A live instrument on the shared bus.
pub struct Instrument {
    shared: Arc<InstrumentShared>,
    submit_tx: mpsc::UnboundedSender<Submission>,
    worker: JoinHandle<()>,
    collector: AcquisitionCollector,
}

impl Instrument {
    /// Open an instrument with default acquisition timing.
    pub fn open(
        name: impl Into<String>,
        driver: Box<dyn InstrumentDriver>,
        bus: BusDevice,
    ) -> Self {
        Self::open_with(name, driver, bus, AcquisitionConfig::default())
    }

    /// Open an instrument, spawning its command-processor worker.
    pub fn open_with(
        name: impl Into<String>,
        driver: Box<dyn InstrumentDriver>,
        bus: BusDevice,
        acquisition: AcquisitionConfig,
    ) -> Self {
        let name = name.into();
        let shared = Arc::new(InstrumentShared {
            name: name.clone(),
            settings: RwLock::new(None),
            status: RwLock::new(None),
            reading: RwLock::new(None),
            listeners: ListenerSet::new(),
        });
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(Arc::clone(&shared), driver, bus, submit_rx);
        let collector = AcquisitionCollector::new(name, submit_tx.clone(), acquisition);
        debug!(instrument = %shared.name, "instrument opened");
        Self {
            shared,
            submit_tx,
            worker,
            collector,
        }
    }

    /// The instrument's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a command; returns immediately with a handle to its outcome.
    ///
    /// Commands execute strictly in submission order. Fails only once the
    /// instrument has been closed.
    pub fn submit(&self, command: Command) -> DaqResult<CommandHandle> {
        let (submission, handle) = Submission::new(command);
        trace!(
            instrument = %self.shared.name,
            id = %submission.id,
            kind = submission.command.kind(),
            "command submitted"
        );
        self.submit_tx
            .send(submission)
            .map_err(|_| DaqError::InstrumentClosed(self.shared.name.clone()))?;
        Ok(handle)
    }

    /// Submit a command and wait up to `timeout` for its outcome.
    ///
    /// On timeout the command is neither removed from the queue nor aborted
    /// on the bus; only the wait ends, and the late result is discarded.
    pub async fn submit_and_wait(
        &self,
        command: Command,
        timeout: Duration,
    ) -> DaqResult<CommandReply> {
        self.submit(command)?.wait(timeout).await
    }

    /// Last published settings snapshot, if any.
    pub fn settings(&self) -> Option<Arc<Settings>> {
        InstrumentShared::read(&self.shared.settings)
    }

    /// Last published status snapshot, if any.
    pub fn status(&self) -> Option<Arc<Status>> {
        InstrumentShared::read(&self.shared.status)
    }

    /// Last published reading, if any.
    pub fn reading(&self) -> Option<Arc<Reading>> {
        InstrumentShared::read(&self.shared.reading)
    }

    /// Register a snapshot listener; fan-out preserves registration order.
    pub fn register_listener(&self, listener: Arc<dyn InstrumentListener>) {
        self.shared.listeners.register(listener);
    }

    /// The instrument's acquisition collector.
    pub fn collector(&self) -> &AcquisitionCollector {
        &self.collector
    }

    /// Stop acquisition, drain already-queued commands, and join the worker.
    pub async fn close(self) {
        let Instrument {
            shared,
            submit_tx,
            worker,
            collector,
        } = self;
        collector.stop().await;
        // Dropping every sender closes the queue; the worker finishes the
        // commands already enqueued, then exits.
        drop(collector);
        drop(submit_tx);
        if let Err(err) = worker.await {
            warn!(instrument = %shared.name, error = %err, "worker task join failed");
        }
        debug!(instrument = %shared.name, "instrument closed");
    }
}

fn spawn_worker(
    shared: Arc<InstrumentShared>,
    mut driver: Box<dyn InstrumentDriver>,
    bus: BusDevice,
    mut queue: mpsc::UnboundedReceiver<Submission>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Submission {
            id,
            command,
            reply_tx,
        }) = queue.recv().await
        {
            let kind = command.kind();
            trace!(instrument = %shared.name, %id, kind, "processing command");
            let result = match driver.validate(&command) {
                Ok(()) => driver.execute(&bus, &command).await,
                Err(err) => Err(err),
            };
            match &result {
                Ok(reply) => shared.publish(reply),
                // One command's failure never kills the worker; log and move
                // on to the next queued command.
                Err(err) => {
                    warn!(instrument = %shared.name, %id, kind, error = %err, "command failed");
                }
            }
            if reply_tx.send(result).is_err() {
                debug!(
                    instrument = %shared.name,
                    %id,
                    kind,
                    "caller gone before completion; late result discarded"
                );
            }
        }
        debug!(instrument = %shared.name, "command queue closed; worker exiting");
    })
}
