//! Periodic acquisition collector.
//!
//! One collector per instrument, dormant until started. Each period it
//! submits a `get-reading` command through the same synchronous bridge an
//! external caller would use, with its own per-cycle timeout, and the
//! resulting reading is published through the ordinary snapshot fan-out.
//!
//! The collector holds no queue priority: its commands compete FIFO with
//! ad-hoc submissions, so a burst of manual commands can starve acquisition.
//! That is accepted — the queue is intentionally strict FIFO to guarantee
//! ordering.
//!
//! State machine: `Stopped` → [`AcquisitionCollector::start`] → `Running`.
//! In continuous mode, per-cycle timeout/bus/consistency failures are logged
//! and acquisition continues; in one-shot mode exactly one cycle runs,
//! success or failure, then the collector returns to `Stopped`. An explicit
//! [`AcquisitionCollector::stop`] or a fatal failure (instrument closed)
//! also returns it to `Stopped`.

use crate::command::{Command, CommandReply, Submission};
use crate::error::{DaqError, DaqResult};
use crate::snapshot::Reading;
use serde::Deserialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;

/// Collector lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorState {
    /// No periodic task is running.
    Stopped,
    /// The periodic task is acquiring.
    Running,
}

/// Acquisition timing configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AcquisitionConfig {
    /// Period between acquisition cycles.
    #[serde(with = "humantime_serde", default = "default_period")]
    pub period: Duration,
    /// Synchronous-bridge timeout for each cycle's `get-reading`.
    #[serde(with = "humantime_serde", default = "default_cycle_timeout")]
    pub cycle_timeout: Duration,
}

fn default_period() -> Duration {
    Duration::from_millis(500)
}

fn default_cycle_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            period: default_period(),
            cycle_timeout: default_cycle_timeout(),
        }
    }
}

struct Inner {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Periodic reading collector for one instrument.
pub struct AcquisitionCollector {
    name: String,
    queue: mpsc::UnboundedSender<Submission>,
    config: AcquisitionConfig,
    state: Arc<AtomicU8>,
    inner: Mutex<Inner>,
}

impl AcquisitionCollector {
    pub(crate) fn new(
        name: String,
        queue: mpsc::UnboundedSender<Submission>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            name,
            queue,
            config,
            state: Arc::new(AtomicU8::new(STOPPED)),
            inner: Mutex::new(Inner {
                stop_tx: None,
                task: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CollectorState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => CollectorState::Running,
            _ => CollectorState::Stopped,
        }
    }

    /// The configured timing.
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Start acquiring. `continuous = false` runs exactly one cycle.
    ///
    /// Rejects a start while already running.
    pub async fn start(&self, continuous: bool) -> DaqResult<()> {
        let mut inner = self.inner.lock().await;
        // Reap a one-shot task that already ran to completion.
        if inner.task.as_ref().is_some_and(JoinHandle::is_finished) {
            inner.task = None;
            inner.stop_tx = None;
        }
        if self
            .state
            .compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaqError::Validation(format!(
                "acquisition already running for '{}'",
                self.name
            )));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let queue = self.queue.clone();
        let name = self.name.clone();
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            info!(instrument = %name, period = ?config.period, continuous, "acquisition started");
            let mut ticker = tokio::time::interval(config.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match acquire_once(&queue, &name, config.cycle_timeout).await {
                            Ok(reading) => {
                                trace!(instrument = %name, value = reading.value(), "acquisition cycle complete");
                            }
                            Err(err) if err.is_recoverable() => {
                                warn!(instrument = %name, error = %err, "acquisition cycle failed");
                            }
                            Err(err) => {
                                error!(instrument = %name, error = %err, "fatal acquisition failure; stopping");
                                break;
                            }
                        }
                        if !continuous {
                            break;
                        }
                    }
                    changed = stop_rx.changed() => {
                        // Explicit stop, or the collector itself was dropped.
                        let _ = changed;
                        break;
                    }
                }
            }
            state.store(STOPPED, Ordering::SeqCst);
            debug!(instrument = %name, "acquisition stopped");
        });

        inner.stop_tx = Some(stop_tx);
        inner.task = Some(task);
        Ok(())
    }

    /// Stop acquiring and wait for the periodic task to exit.
    ///
    /// A cycle already in flight finishes first (bounded by its own
    /// timeout). Stopping a stopped collector is a no-op.
    pub async fn stop(&self) {
        let (stop_tx, task) = {
            let mut inner = self.inner.lock().await;
            (inner.stop_tx.take(), inner.task.take())
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(instrument = %self.name, error = %err, "acquisition task join failed");
            }
        }
        self.state.store(STOPPED, Ordering::SeqCst);
    }
}

async fn acquire_once(
    queue: &mpsc::UnboundedSender<Submission>,
    name: &str,
    timeout: Duration,
) -> DaqResult<Arc<Reading>> {
    let (submission, handle) = Submission::new(Command::GetReading);
    queue
        .send(submission)
        .map_err(|_| DaqError::InstrumentClosed(name.to_string()))?;
    match handle.wait(timeout).await? {
        CommandReply::Reading(reading) => Ok(reading),
        other => Err(DaqError::Bus(format!(
            "get-reading returned unexpected reply: {other:?}"
        ))),
    }
}
