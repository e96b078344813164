//! Live state of a single transfer attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::RatePrecision;
use crate::report::{TransferReport, WallClock, rates};
use crate::types::{ErrorKind, TransferMode};

/// How a transfer ended.
pub(crate) enum Outcome {
    Completed,
    Cancelled,
    Failed(ErrorKind, String),
}

/// Terminal report waiting to reach the listeners.
pub(crate) struct Terminal {
    pub(crate) outcome: Outcome,
    pub(crate) report: TransferReport,
}

/// Orders listener dispatch for one session. While a progress report is
/// being dispatched, a terminal report is parked here and delivered by the
/// progress dispatcher once it is done.
#[derive(Default)]
struct DispatchSlot {
    busy: bool,
    deferred: Option<Terminal>,
}

/// Counters and timing for one transfer, shared between the writing task,
/// the reader task and callers asking for a live report.
pub(crate) struct TransferSession {
    pub(crate) mode: TransferMode,
    pub(crate) seq: u64,
    pub(crate) precision: RatePrecision,
    /// Tripped when the transfer ends for any reason.
    pub(crate) cancel: CancellationToken,
    clock: WallClock,
    created: Instant,
    connecting: OnceLock<Instant>,
    started: OnceLock<Instant>,
    writes_done: OnceLock<Instant>,
    total_bytes: AtomicU64,
    transferred: AtomicU64,
    total_chunks: AtomicU64,
    chunks_written: AtomicU64,
    terminal: AtomicBool,
    dispatch: Mutex<DispatchSlot>,
}

impl TransferSession {
    pub(crate) fn new(mode: TransferMode, seq: u64, precision: RatePrecision) -> Self {
        let clock = WallClock::now();
        Self {
            mode,
            seq,
            precision,
            cancel: CancellationToken::new(),
            clock,
            created: Instant::now(),
            connecting: OnceLock::new(),
            started: OnceLock::new(),
            writes_done: OnceLock::new(),
            total_bytes: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            total_chunks: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            terminal: AtomicBool::new(false),
            dispatch: Mutex::new(DispatchSlot::default()),
        }
    }

    /// Starts the setup clock at the connection attempt, so payload
    /// preparation does not count as setup.
    pub(crate) fn mark_connecting(&self, at: Instant) {
        let _ = self.connecting.set(at);
    }

    /// Starts the rate clock. Only the first call counts.
    pub(crate) fn mark_started(&self, at: Instant) {
        let _ = self.started.set(at);
    }

    /// Records the moment the last body byte was handed to the socket.
    pub(crate) fn mark_writes_done(&self, at: Instant) {
        let _ = self.writes_done.set(at);
    }

    pub(crate) fn writes_done_at(&self) -> Option<Instant> {
        self.writes_done.get().copied()
    }

    pub(crate) fn setup_time(&self) -> Duration {
        let origin = self.connecting.get().copied().unwrap_or(self.created);
        self.started
            .get()
            .map(|s| s.saturating_duration_since(origin))
            .unwrap_or_default()
    }

    pub(crate) fn set_total(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_total_chunks(&self, chunks: u64) {
        self.total_chunks.store(chunks, Ordering::Release);
    }

    pub(crate) fn total(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// Adds received bytes and returns the new running total.
    pub(crate) fn add_bytes(&self, n: u64) -> u64 {
        self.transferred.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Records one written chunk of `len` bytes.
    pub(crate) fn add_chunk(&self, len: u64) {
        self.transferred.fetch_add(len, Ordering::AcqRel);
        self.chunks_written.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Acquire)
    }

    /// Integer-truncated completion percentage.
    ///
    /// Downloads count bytes against the content length, uploads count
    /// written chunks against the planned chunk count.
    pub(crate) fn percent(&self) -> f64 {
        let (done, total) = match self.mode {
            TransferMode::Upload => {
                let total = self.total_chunks.load(Ordering::Acquire);
                if total == 0 {
                    return 100.0;
                }
                (self.chunks_written(), total)
            }
            _ => (self.transferred(), self.total()),
        };
        if total == 0 {
            return 0.0;
        }
        let pct = (u128::from(done) * 100 / u128::from(total)).min(100);
        pct as f64
    }

    /// Marks the session terminal. Returns true for the first caller only.
    pub(crate) fn try_finish(&self) -> bool {
        !self.terminal.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    fn slot(&self) -> MutexGuard<'_, DispatchSlot> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the dispatch slot for a progress report. Fails once the
    /// session is terminal.
    pub(crate) fn begin_progress(&self) -> bool {
        let mut slot = self.slot();
        if slot.busy || self.is_terminal() {
            return false;
        }
        slot.busy = true;
        true
    }

    /// Releases the slot and returns a terminal report parked meanwhile.
    pub(crate) fn end_progress(&self) -> Option<Terminal> {
        let mut slot = self.slot();
        slot.busy = false;
        slot.deferred.take()
    }

    /// Offers the terminal report for dispatch after [`try_finish`] won.
    ///
    /// Returns it when it can be dispatched right away; otherwise the
    /// progress dispatch in flight delivers it from [`end_progress`].
    ///
    /// [`try_finish`]: Self::try_finish
    /// [`end_progress`]: Self::end_progress
    pub(crate) fn hand_off(&self, terminal: Terminal) -> Option<Terminal> {
        let mut slot = self.slot();
        if slot.busy {
            slot.deferred = Some(terminal);
            None
        } else {
            Some(terminal)
        }
    }

    /// Builds a report for the counters as they are at `at`.
    pub(crate) fn snapshot(&self, at: Instant) -> TransferReport {
        let started = self.started.get().copied();
        let elapsed = started
            .map(|s| at.saturating_duration_since(s))
            .unwrap_or_default();
        let bytes = self.transferred();
        let (rate_bytes_per_sec, rate_bits_per_sec) = rates(bytes, elapsed);

        TransferReport {
            mode: self.mode,
            progress_percent: self.percent(),
            rate_bytes_per_sec,
            rate_bits_per_sec,
            bytes_transferred: bytes,
            total_bytes: self.total(),
            start_time_millis: self.clock.millis_at(started.unwrap_or(at)),
            sample_time_millis: self.clock.millis_at(at),
            request_seq: self.seq,
            setup_time: self.setup_time(),
            elapsed,
            cancelled: false,
            precision: self.precision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(mode: TransferMode) -> TransferSession {
        TransferSession::new(mode, 1, RatePrecision::default())
    }

    #[test]
    fn new_session_reports_zero() {
        let s = session(TransferMode::Download);
        let report = s.snapshot(Instant::now());
        assert_eq!(report.progress_percent, 0.0);
        assert_eq!(report.bytes_transferred, 0);
        assert_eq!(report.rate_bytes_per_sec, 0.0);
        assert_eq!(report.setup_time, Duration::ZERO);
        assert_eq!(report.start_time_millis, report.sample_time_millis);
        assert!(!report.cancelled);
    }

    #[test]
    fn download_percent_truncates() {
        let s = session(TransferMode::Download);
        s.set_total(1_000_000);
        s.add_bytes(65_535);
        assert_eq!(s.percent(), 6.0);
        s.add_bytes(1_000_000 - 65_535 - 1);
        assert_eq!(s.percent(), 99.0);
        assert_eq!(s.add_bytes(1), 1_000_000);
        assert_eq!(s.percent(), 100.0);
    }

    #[test]
    fn upload_percent_counts_chunks() {
        let s = session(TransferMode::Upload);
        s.set_total(10);
        s.set_total_chunks(3);
        s.add_chunk(4);
        assert_eq!(s.percent(), 33.0);
        s.add_chunk(4);
        s.add_chunk(2);
        assert_eq!(s.percent(), 100.0);
        assert_eq!(s.transferred(), 10);
    }

    #[test]
    fn zero_chunk_upload_is_complete() {
        let s = session(TransferMode::Upload);
        assert_eq!(s.percent(), 100.0);
    }

    #[test]
    fn finish_is_exactly_once() {
        let s = session(TransferMode::Download);
        assert!(!s.is_terminal());
        assert!(s.try_finish());
        assert!(!s.try_finish());
        assert!(s.is_terminal());
    }

    #[test]
    fn snapshot_timing() {
        let s = session(TransferMode::Download);
        let start = Instant::now() + Duration::from_millis(20);
        s.mark_started(start);
        s.mark_started(start + Duration::from_secs(5));
        s.set_total(2_000);
        s.add_bytes(1_000);

        let report = s.snapshot(start + Duration::from_millis(500));
        assert_eq!(report.elapsed, Duration::from_millis(500));
        assert_eq!(report.rate_bytes_per_sec, 2_000.0);
        assert_eq!(report.rate_bits_per_sec, 16_000.0);
        assert_eq!(report.sample_time_millis - report.start_time_millis, 500);
        assert!(report.setup_time >= Duration::from_millis(20));
    }

    #[test]
    fn setup_time_starts_at_connect() {
        let s = session(TransferMode::Upload);
        let connect = Instant::now() + Duration::from_secs(3);
        s.mark_connecting(connect);
        s.mark_started(connect + Duration::from_millis(15));
        assert_eq!(s.setup_time(), Duration::from_millis(15));
    }

    fn terminal(outcome: Outcome) -> Terminal {
        Terminal {
            outcome,
            report: TransferReport::default(),
        }
    }

    #[test]
    fn terminal_waits_for_progress_dispatch() {
        let s = session(TransferMode::Download);
        assert!(s.begin_progress());
        assert!(!s.begin_progress());

        assert!(s.try_finish());
        assert!(s.hand_off(terminal(Outcome::Cancelled)).is_none());
        assert!(matches!(
            s.end_progress(),
            Some(Terminal {
                outcome: Outcome::Cancelled,
                ..
            })
        ));
        assert!(!s.begin_progress());
        assert!(s.end_progress().is_none());
    }

    #[test]
    fn terminal_passes_through_when_idle() {
        let s = session(TransferMode::Download);
        assert!(s.try_finish());
        assert!(s.hand_off(terminal(Outcome::Completed)).is_some());
        assert!(!s.begin_progress());
    }
}
