//! Generic instrument commands and the synchronous bridge plumbing.
//!
//! A [`Command`] is an instrument-agnostic request submitted by any caller
//! and executed by the instrument's command processor. Command kinds form a
//! closed tagged union rather than a string-keyed argument map, so malformed
//! kinds are unrepresentable and argument lookup is typed.
//!
//! Each submission gets its own `oneshot` reply channel and a fresh id:
//! command identity is per-submission, never reused. That pairing is what
//! makes the synchronous bridge's timeout semantics safe — a result arriving
//! after the caller gave up finds its reply channel dead and is discarded; it
//! can never be delivered to a different waiter, even one awaiting an
//! identically-kinded command.

use crate::calibration::CalibrationBlock;
use crate::error::{DaqError, DaqResult};
use crate::snapshot::{Reading, Settings, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// A generic, instrument-agnostic request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Does nothing; never touches the bus and never mutates snapshots.
    Noop,
    /// Read the instrument's current configuration.
    GetSettings,
    /// Serial-poll the instrument's health/event byte.
    GetStatus,
    /// Take one measurement, consistent with the settings that produced it.
    GetReading,
    /// Read a single calibration RAM byte.
    ReadCalibrationByte {
        /// RAM offset; valid offsets are `0..256`.
        address: u16,
    },
    /// Read and validate the full 256-byte calibration RAM image.
    ReadCalibrationBlock,
}

impl Command {
    /// Stable string tag for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Noop => "noop",
            Command::GetSettings => "get-settings",
            Command::GetStatus => "get-status",
            Command::GetReading => "get-reading",
            Command::ReadCalibrationByte { .. } => "read-calibration-byte",
            Command::ReadCalibrationBlock => "read-calibration-block",
        }
    }
}

/// Successful result of an executed command.
#[derive(Clone, Debug)]
pub enum CommandReply {
    /// The command completed and produced no data.
    Done,
    /// A fresh settings snapshot.
    Settings(Arc<Settings>),
    /// A fresh status snapshot.
    Status(Arc<Status>),
    /// A fresh reading.
    Reading(Arc<Reading>),
    /// One calibration RAM byte.
    CalibrationByte(u8),
    /// A validated calibration RAM image.
    CalibrationBlock(CalibrationBlock),
}

impl CommandReply {
    /// The reading, if this reply carries one.
    pub fn reading(&self) -> Option<&Arc<Reading>> {
        match self {
            CommandReply::Reading(reading) => Some(reading),
            _ => None,
        }
    }

    /// The settings snapshot, if this reply carries one.
    pub fn settings(&self) -> Option<&Arc<Settings>> {
        match self {
            CommandReply::Settings(settings) => Some(settings),
            _ => None,
        }
    }

    /// The status snapshot, if this reply carries one.
    pub fn status(&self) -> Option<&Arc<Status>> {
        match self {
            CommandReply::Status(status) => Some(status),
            _ => None,
        }
    }
}

/// One enqueued command on its way through the processor.
pub(crate) struct Submission {
    pub(crate) id: Uuid,
    pub(crate) command: Command,
    pub(crate) reply_tx: oneshot::Sender<DaqResult<CommandReply>>,
}

impl Submission {
    pub(crate) fn new(command: Command) -> (Self, CommandHandle) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let kind = command.kind();
        (
            Self {
                id,
                command,
                reply_tx,
            },
            CommandHandle { id, kind, reply_rx },
        )
    }
}

/// Caller-side handle to a submitted command.
///
/// Dropping the handle abandons the wait; the command still executes and its
/// late result is discarded by the processor.
pub struct CommandHandle {
    id: Uuid,
    kind: &'static str,
    reply_rx: oneshot::Receiver<DaqResult<CommandReply>>,
}

impl CommandHandle {
    /// Per-submission identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kind tag of the submitted command.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Block (suspend) until the processor resolves this submission or the
    /// deadline elapses.
    ///
    /// On timeout the command is not aborted: it may still execute on the
    /// bus, and its late result dies with this handle.
    pub async fn wait(self, timeout: Duration) -> DaqResult<CommandReply> {
        match tokio::time::timeout(timeout, self.reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_closed)) => Err(DaqError::WorkerStopped),
            Err(_elapsed) => {
                debug!(
                    id = %self.id,
                    kind = self.kind,
                    "synchronous wait timed out; a late result will be discarded"
                );
                Err(DaqError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Command::Noop.kind(), "noop");
        assert_eq!(Command::GetReading.kind(), "get-reading");
        assert_eq!(
            Command::ReadCalibrationByte { address: 3 }.kind(),
            "read-calibration-byte"
        );
    }

    #[test]
    fn submissions_have_unique_ids() {
        let (a, handle_a) = Submission::new(Command::Noop);
        let (b, handle_b) = Submission::new(Command::Noop);
        assert_ne!(a.id, b.id);
        assert_eq!(handle_a.id(), a.id);
        assert_eq!(handle_b.kind(), "noop");
    }

    #[tokio::test]
    async fn wait_times_out_without_a_reply() {
        let (_submission, handle) = Submission::new(Command::GetStatus);
        let err = handle.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout(_)));
    }

    #[tokio::test]
    async fn wait_reports_a_stopped_worker() {
        let (submission, handle) = Submission::new(Command::GetStatus);
        drop(submission);
        let err = handle.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DaqError::WorkerStopped));
    }
}
