//! Listener registration and event fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::report::TransferReport;
use crate::types::ErrorKind;

/// Receives transfer events.
///
/// Every transfer ends with exactly one `on_completion` (success or user
/// cancellation) or one `on_error`. Callbacks run synchronously on the task
/// that produced the event and should return quickly.
pub trait TransferListener: Send + Sync {
    fn on_progress(&self, percent: f64, report: &TransferReport) {
        let _ = (percent, report);
    }

    fn on_completion(&self, report: &TransferReport) {
        let _ = report;
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        let _ = (kind, message);
    }
}

/// Callback invoked with a report.
pub type ReportCallback = Box<dyn Fn(&TransferReport) + Send + Sync>;

/// Callback invoked with a failure.
pub type ErrorCallback = Box<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// A [`TransferListener`] assembled from closures.
#[derive(Default)]
pub struct CallbackListener {
    progress: Option<ReportCallback>,
    completion: Option<ReportCallback>,
    error: Option<ErrorCallback>,
}

impl CallbackListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&TransferReport) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_completion(mut self, f: impl Fn(&TransferReport) + Send + Sync + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ErrorKind, &str) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl TransferListener for CallbackListener {
    fn on_progress(&self, _percent: f64, report: &TransferReport) {
        if let Some(cb) = &self.progress {
            cb(report);
        }
    }

    fn on_completion(&self, report: &TransferReport) {
        if let Some(cb) = &self.completion {
            cb(report);
        }
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        if let Some(cb) = &self.error {
            cb(kind, message);
        }
    }
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners.
///
/// Dispatch iterates a snapshot, so listeners may add or remove listeners
/// (including themselves) from inside a callback.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn TransferListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener after all existing ones.
    pub fn add(&self, listener: Arc<dyn TransferListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransferListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    pub fn dispatch_progress(&self, report: &TransferReport) {
        for listener in self.snapshot() {
            listener.on_progress(report.progress_percent, report);
        }
    }

    /// Delivers a terminal report, successful or cancelled.
    pub fn dispatch_completion(&self, report: &TransferReport) {
        trace!(seq = report.request_seq, cancelled = report.cancelled, "dispatching completion");
        for listener in self.snapshot() {
            listener.on_completion(report);
        }
    }

    /// Delivers a failure.
    pub fn dispatch_error(&self, kind: ErrorKind, message: &str) {
        trace!(%kind, error = message, "dispatching error");
        for listener in self.snapshot() {
            listener.on_error(kind, message);
        }
    }
}
