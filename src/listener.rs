//! Snapshot listeners and ordered fan-out.
//!
//! Observers register an [`InstrumentListener`] and are invoked synchronously,
//! in registration order, each time a new snapshot is published. The fan-out
//! runs on the publishing path (the command processor's worker), which is what
//! keeps the "no partial snapshot visible" invariant: the cached snapshot is
//! replaced first, then every listener sees the same complete `Arc`.
//!
//! Listener callbacks are never invoked concurrently for the same instrument.
//! A slow listener delays delivery to subsequent listeners and, transitively,
//! the next command; keeping callbacks short is the listener's job.

use crate::snapshot::{Reading, Settings, Status};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback interface for snapshot observers.
///
/// One consumer may observe several instruments; the `instrument` argument
/// carries the publishing instrument's name. Default implementations ignore
/// the event, so a listener only implements the callbacks it cares about.
pub trait InstrumentListener: Send + Sync {
    /// A new settings snapshot was published.
    fn on_new_settings(&self, instrument: &str, settings: &Arc<Settings>) {
        let _ = (instrument, settings);
    }

    /// A new status snapshot was published.
    fn on_new_status(&self, instrument: &str, status: &Arc<Status>) {
        let _ = (instrument, status);
    }

    /// A new reading was published.
    fn on_new_reading(&self, instrument: &str, reading: &Arc<Reading>) {
        let _ = (instrument, reading);
    }
}

/// Ordered listener registrations for one instrument.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn InstrumentListener>>>,
}

impl ListenerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; fan-out preserves registration order.
    pub fn register(&self, listener: Arc<dyn InstrumentListener>) {
        self.guard().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub(crate) fn notify_settings(&self, instrument: &str, settings: &Arc<Settings>) {
        for listener in self.snapshot() {
            listener.on_new_settings(instrument, settings);
        }
    }

    pub(crate) fn notify_status(&self, instrument: &str, status: &Arc<Status>) {
        for listener in self.snapshot() {
            listener.on_new_status(instrument, status);
        }
    }

    pub(crate) fn notify_reading(&self, instrument: &str, reading: &Arc<Reading>) {
        for listener in self.snapshot() {
            listener.on_new_reading(instrument, reading);
        }
    }

    // Invoke callbacks outside the registration lock so a listener may
    // register further listeners without deadlocking.
    fn snapshot(&self) -> Vec<Arc<dyn InstrumentListener>> {
        self.guard().clone()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn InstrumentListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
