//! Back-to-back transfers over a time window.
//!
//! A scheduler task restarts the engine whenever an iteration ends and, on
//! every report tick, folds the finished iterations plus the in-flight one
//! into a cumulative report whose rate is total bytes over total transfer
//! time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::config::{ConfigError, RatePrecision};
use crate::engine::TransferEngine;
use crate::listener::{ReportCallback, TransferListener};
use crate::report::{TransferReport, WallClock, rates};
use crate::types::{ErrorKind, TransferMode};

/// Pause after a failed iteration before the next one starts.
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Transfer repeated by a [`RepeatController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepeatRequest {
    Download { uri: String },
    Upload { uri: String, size: u64 },
}

impl RepeatRequest {
    pub fn mode(&self) -> TransferMode {
        match self {
            Self::Download { .. } => TransferMode::Download,
            Self::Upload { .. } => TransferMode::Upload,
        }
    }

    async fn start(&self, engine: &TransferEngine) -> Result<(), TransferError> {
        match self {
            Self::Download { uri } => engine.start_download(uri).await,
            Self::Upload { uri, size } => engine.start_upload(uri, *size).await,
        }
    }
}

/// What happens to the running iteration when the window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPolicy {
    /// Let it run to its natural end.
    FinishInFlight,
    /// Cancel it and count its partial numbers.
    #[default]
    StopInFlight,
}

#[derive(Debug, Clone)]
pub struct RepeatConfig {
    /// Total time during which new iterations may start.
    pub window: Duration,
    /// Period of the cumulative `on_report` callback.
    pub report_interval: Duration,
    pub policy: WindowPolicy,
    /// End the run at the first failed iteration.
    pub stop_on_error: bool,
    pub error_backoff: Duration,
}

impl Default for RepeatConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            report_interval: Duration::from_secs(1),
            policy: WindowPolicy::default(),
            stop_on_error: false,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

impl RepeatConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroReportInterval);
        }
        Ok(())
    }
}

/// Runs a [`RepeatRequest`] repeatedly on one engine.
pub struct RepeatController {
    engine: TransferEngine,
    config: RepeatConfig,
}

impl RepeatController {
    pub fn new(engine: TransferEngine, config: RepeatConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// Starts the run on a background task.
    ///
    /// `on_report` fires every `report_interval` with the cumulative report;
    /// `on_finish` fires once with the final one. Iteration failures reach
    /// the engine's own listeners.
    pub fn start(
        &self,
        request: RepeatRequest,
        on_report: ReportCallback,
        on_finish: ReportCallback,
    ) -> Result<RepeatHandle, TransferError> {
        self.config.validate()?;
        if self.engine.is_active() {
            return Err(TransferError::AlreadyActive);
        }

        let stop = CancellationToken::new();
        let run = RepeatRun {
            engine: self.engine.clone(),
            request,
            config: self.config.clone(),
            on_report,
            on_finish,
            stop: stop.clone(),
        };
        Ok(RepeatHandle {
            stop,
            task: tokio::spawn(run.run()),
        })
    }
}

/// Handle to a running repeat.
pub struct RepeatHandle {
    stop: CancellationToken,
    task: JoinHandle<TransferReport>,
}

impl RepeatHandle {
    /// Closes the window now. The in-flight iteration is handled according
    /// to the configured [`WindowPolicy`].
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token that closes the window when cancelled, usable after the handle
    /// has been moved into [`wait`](Self::wait).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the run to end and returns the final report.
    pub async fn wait(self) -> TransferReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "repeat task ended abnormally");
                TransferReport::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum IterationEnd {
    Finished(TransferReport),
    Failed(ErrorKind),
    /// The iteration could not be started.
    Rejected(TransferError),
    /// The window closed before a pending start.
    Skipped,
}

/// Forwards terminal engine events to the scheduler.
struct IterationListener {
    tx: mpsc::UnboundedSender<IterationEnd>,
}

impl TransferListener for IterationListener {
    fn on_completion(&self, report: &TransferReport) {
        let _ = self.tx.send(IterationEnd::Finished(report.clone()));
    }

    fn on_error(&self, kind: ErrorKind, _message: &str) {
        let _ = self.tx.send(IterationEnd::Failed(kind));
    }
}

/// Running totals over finished iterations.
struct RepeatTotals {
    mode: TransferMode,
    precision: RatePrecision,
    clock: WallClock,
    started: Instant,
    window: Duration,
    /// Highest request sequence already folded in.
    last_seq: u64,
    bytes: u64,
    elapsed: Duration,
    setup: Duration,
    iterations: u32,
}

impl RepeatTotals {
    fn new(mode: TransferMode, precision: RatePrecision, window: Duration, baseline_seq: u64) -> Self {
        Self {
            mode,
            precision,
            clock: WallClock::now(),
            started: Instant::now(),
            window,
            last_seq: baseline_seq,
            bytes: 0,
            elapsed: Duration::ZERO,
            setup: Duration::ZERO,
            iterations: 0,
        }
    }

    /// Adds a finished iteration. Reports already folded are ignored.
    fn fold(&mut self, report: &TransferReport) {
        if report.request_seq <= self.last_seq {
            return;
        }
        self.last_seq = report.request_seq;
        self.bytes += report.bytes_transferred;
        self.elapsed += report.elapsed;
        self.setup += report.setup_time;
        self.iterations += 1;
    }

    fn window_percent(&self, at: Instant) -> f64 {
        if self.window.is_zero() {
            return 100.0;
        }
        let fraction = at.saturating_duration_since(self.started).as_secs_f64()
            / self.window.as_secs_f64();
        (fraction * 100.0).floor().min(100.0)
    }

    /// Cumulative report, optionally including an in-flight iteration.
    fn report(&self, partial: Option<&TransferReport>, percent: f64, at: Instant) -> TransferReport {
        let (mut bytes, mut elapsed, mut seq) = (self.bytes, self.elapsed, self.last_seq);
        if let Some(p) = partial.filter(|p| p.request_seq > self.last_seq) {
            bytes += p.bytes_transferred;
            elapsed += p.elapsed;
            seq = p.request_seq;
        }
        let (rate_bytes_per_sec, rate_bits_per_sec) = rates(bytes, elapsed);

        TransferReport {
            mode: self.mode,
            progress_percent: percent,
            rate_bytes_per_sec,
            rate_bits_per_sec,
            bytes_transferred: bytes,
            total_bytes: bytes,
            start_time_millis: self.clock.millis_at(self.started),
            sample_time_millis: self.clock.millis_at(at),
            request_seq: seq,
            setup_time: self.setup,
            elapsed,
            cancelled: false,
            precision: self.precision,
        }
    }
}

struct RepeatRun {
    engine: TransferEngine,
    request: RepeatRequest,
    config: RepeatConfig,
    on_report: ReportCallback,
    on_finish: ReportCallback,
    stop: CancellationToken,
}

impl RepeatRun {
    async fn run(self) -> TransferReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = self
            .engine
            .add_listener(Arc::new(IterationListener { tx: tx.clone() }));
        // Cancelled when the window closes so pending starts are dropped.
        let halt = CancellationToken::new();

        let mut totals = RepeatTotals::new(
            self.request.mode(),
            self.engine.config().precision,
            self.config.window,
            self.engine.live_report().request_seq,
        );
        let window = tokio::time::sleep(self.config.window);
        tokio::pin!(window);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.report_interval,
            self.config.report_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            mode = %self.request.mode(),
            window = ?self.config.window,
            policy = ?self.config.policy,
            "repeat started"
        );
        self.launch(Duration::ZERO, &tx, &halt);
        let mut closing = false;

        loop {
            tokio::select! {
                biased;
                Some(end) = rx.recv() => {
                    let failed = match end {
                        IterationEnd::Finished(report) => {
                            totals.fold(&report);
                            false
                        }
                        IterationEnd::Failed(kind) => {
                            totals.fold(&self.engine.live_report());
                            debug!(%kind, "repeat iteration failed");
                            true
                        }
                        IterationEnd::Rejected(e) => {
                            warn!(error = %e, "repeat iteration could not start");
                            break;
                        }
                        IterationEnd::Skipped => break,
                    };
                    if closing || (failed && self.config.stop_on_error) {
                        break;
                    }
                    let delay = if failed { self.config.error_backoff } else { Duration::ZERO };
                    self.launch(delay, &tx, &halt);
                }
                _ = &mut window, if !closing => {
                    debug!("repeat window elapsed");
                    closing = true;
                    self.close(&halt);
                }
                _ = self.stop.cancelled(), if !closing => {
                    debug!("repeat stopped early");
                    closing = true;
                    self.close(&halt);
                }
                _ = ticker.tick(), if !closing => {
                    let now = Instant::now();
                    let live = self.engine.live_report();
                    let report = totals.report(Some(&live), totals.window_percent(now), now);
                    (self.on_report)(&report);
                }
            }
        }

        self.engine.remove_listener(listener);
        halt.cancel();

        let report = totals.report(None, 100.0, Instant::now());
        debug!(
            iterations = totals.iterations,
            bytes = report.bytes_transferred,
            bits_per_sec = report.rate_bits_per_sec,
            "repeat finished"
        );
        (self.on_finish)(&report);
        report
    }

    /// Starts the next iteration on its own task after `delay`.
    fn launch(
        &self,
        delay: Duration,
        tx: &mpsc::UnboundedSender<IterationEnd>,
        halt: &CancellationToken,
    ) {
        let engine = self.engine.clone();
        let request = self.request.clone();
        let tx = tx.clone();
        let halt = halt.clone();
        let stop_in_flight = self.config.policy == WindowPolicy::StopInFlight;

        tokio::spawn(async move {
            tokio::select! {
                _ = halt.cancelled() => {
                    let _ = tx.send(IterationEnd::Skipped);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if halt.is_cancelled() {
                let _ = tx.send(IterationEnd::Skipped);
                return;
            }
            match request.start(&engine).await {
                Err(e) => {
                    let _ = tx.send(IterationEnd::Rejected(e));
                }
                // The window may have closed while the session was being set up.
                Ok(()) if halt.is_cancelled() && stop_in_flight => engine.cancel(),
                Ok(()) => {}
            }
        });
    }

    fn close(&self, halt: &CancellationToken) {
        halt.cancel();
        if self.config.policy == WindowPolicy::StopInFlight {
            self.engine.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{Event, Recorder, serve_download, serve_upload};
    use crate::types::TransferState;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    fn collector() -> (Arc<Mutex<Vec<TransferReport>>>, ReportCallback) {
        let reports: Arc<Mutex<Vec<TransferReport>>> = Arc::default();
        let sink = Arc::clone(&reports);
        let callback: ReportCallback = Box::new(move |r| sink.lock().unwrap().push(r.clone()));
        (reports, callback)
    }

    async fn refused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn periodic_reports_accumulate() {
        // About 500 ms per iteration.
        let peer = serve_download(250_000, 25_000, Duration::from_millis(50)).await;
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine.clone(),
            RepeatConfig {
                window: Duration::from_millis(5_000),
                report_interval: Duration::from_millis(1_000),
                ..Default::default()
            },
        );
        let (reports, on_report) = collector();
        let (finished, on_finish) = collector();

        let handle = controller
            .start(
                RepeatRequest::Download {
                    uri: peer.url("/250k"),
                },
                on_report,
                on_finish,
            )
            .unwrap();
        let last = handle.wait().await;

        let reports = reports.lock().unwrap().clone();
        assert!(reports.len() >= 4, "only {} reports", reports.len());
        assert!(
            reports
                .windows(2)
                .all(|w| w[0].bytes_transferred <= w[1].bytes_transferred)
        );
        assert!(
            reports
                .windows(2)
                .all(|w| w[0].request_seq <= w[1].request_seq)
        );
        for r in &reports {
            assert_eq!(r.rate_bits_per_sec, r.rate_bytes_per_sec * 8.0);
            assert_eq!(r.mode, TransferMode::Download);
        }

        let finished = finished.lock().unwrap().clone();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0], last);
        assert_eq!(last.progress_percent, 100.0);
        assert!(last.bytes_transferred >= reports.last().unwrap().bytes_transferred);
        assert!(last.rate_bytes_per_sec > 0.0);
        assert!(last.request_seq >= 5);
        assert!(!engine.is_active());
    }

    #[tokio::test]
    async fn failing_iterations_still_finish_with_zero_rate() {
        let engine = TransferEngine::new();
        let recorder = Recorder::new();
        engine.add_listener(recorder.clone());
        let controller = RepeatController::new(
            engine.clone(),
            RepeatConfig {
                window: Duration::from_millis(600),
                report_interval: Duration::from_millis(200),
                error_backoff: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let (finished, on_finish) = collector();

        let handle = controller
            .start(
                RepeatRequest::Download {
                    uri: refused_url().await,
                },
                Box::new(|_| {}),
                on_finish,
            )
            .unwrap();
        let last = handle.wait().await;

        assert_eq!(last.rate_bits_per_sec, 0.0);
        assert_eq!(last.bytes_transferred, 0);
        assert_eq!(finished.lock().unwrap().len(), 1);

        // Closing the window may cancel an attempt that is still connecting.
        let terminals = recorder.terminals();
        assert!(terminals.iter().all(|e| match e {
            Event::Failed(kind, _) => *kind == ErrorKind::ConnectionError,
            Event::Completed(report) => report.cancelled,
            Event::Progress(_) => false,
        }));
        let failures = terminals
            .iter()
            .filter(|e| matches!(e, Event::Failed(..)))
            .count();
        assert!(failures >= 2);
    }

    #[tokio::test]
    async fn stop_on_error_ends_the_run() {
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine,
            RepeatConfig {
                window: Duration::from_secs(30),
                stop_on_error: true,
                ..Default::default()
            },
        );

        let handle = controller
            .start(
                RepeatRequest::Upload {
                    uri: refused_url().await,
                    size: 1_000,
                },
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
            .unwrap();
        let last = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(last.mode, TransferMode::Upload);
        assert_eq!(last.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_iteration() {
        let peer = serve_download(10_000_000, 8_192, Duration::from_millis(10)).await;
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine.clone(),
            RepeatConfig {
                window: Duration::from_secs(60),
                report_interval: Duration::from_millis(100),
                policy: WindowPolicy::StopInFlight,
                ..Default::default()
            },
        );

        let handle = controller
            .start(
                RepeatRequest::Download {
                    uri: peer.url("/big"),
                },
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop();

        let last = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(last.bytes_transferred > 0);
        assert!(last.bytes_transferred < 10_000_000);
        assert_eq!(engine.state(), TransferState::Cancelled);
    }

    #[tokio::test]
    async fn finish_in_flight_waits_for_the_iteration() {
        // About 600 ms per iteration, longer than the window.
        let peer = serve_download(120_000, 10_000, Duration::from_millis(50)).await;
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine.clone(),
            RepeatConfig {
                window: Duration::from_millis(200),
                report_interval: Duration::from_millis(100),
                policy: WindowPolicy::FinishInFlight,
                ..Default::default()
            },
        );

        let handle = controller
            .start(
                RepeatRequest::Download {
                    uri: peer.url("/120k"),
                },
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
            .unwrap();
        let last = handle.wait().await;

        assert_eq!(last.bytes_transferred, 120_000);
        assert_eq!(engine.state(), TransferState::Completed);
    }

    #[tokio::test]
    async fn repeated_uploads() {
        let (peer, received) = serve_upload("200 OK").await;
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine,
            RepeatConfig {
                window: Duration::from_millis(500),
                report_interval: Duration::from_millis(100),
                policy: WindowPolicy::FinishInFlight,
                ..Default::default()
            },
        );

        let handle = controller
            .start(
                RepeatRequest::Upload {
                    uri: peer.url("/upload"),
                    size: 100_000,
                },
                Box::new(|_| {}),
                Box::new(|_| {}),
            )
            .unwrap();
        let last = handle.wait().await;

        assert_eq!(last.mode, TransferMode::Upload);
        assert!(last.bytes_transferred >= 100_000);
        assert_eq!(last.bytes_transferred % 100_000, 0);
        assert_eq!(
            received.load(std::sync::atomic::Ordering::SeqCst),
            last.bytes_transferred
        );
    }

    #[tokio::test]
    async fn start_validates() {
        let engine = TransferEngine::new();
        let controller = RepeatController::new(
            engine,
            RepeatConfig {
                report_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        let result = controller.start(
            RepeatRequest::Download {
                uri: "http://127.0.0.1/".into(),
            },
            Box::new(|_| {}),
            Box::new(|_| {}),
        );
        assert!(matches!(
            result,
            Err(TransferError::Config(ConfigError::ZeroReportInterval))
        ));
    }

    #[test]
    fn totals_ignore_stale_and_duplicate_reports() {
        let mut totals = RepeatTotals::new(
            TransferMode::Download,
            RatePrecision::default(),
            Duration::from_secs(5),
            3,
        );
        let iteration = |seq, bytes, millis| TransferReport {
            request_seq: seq,
            bytes_transferred: bytes,
            elapsed: Duration::from_millis(millis),
            ..Default::default()
        };

        // Belongs to a transfer run before the repeat started.
        totals.fold(&iteration(3, 999, 1));
        totals.fold(&iteration(4, 1_000, 500));
        totals.fold(&iteration(4, 1_000, 500));
        totals.fold(&iteration(5, 1_000, 500));

        let now = Instant::now();
        let report = totals.report(None, 50.0, now);
        assert_eq!(report.bytes_transferred, 2_000);
        assert_eq!(report.elapsed, Duration::from_secs(1));
        assert_eq!(report.rate_bytes_per_sec, 2_000.0);
        assert_eq!(report.rate_bits_per_sec, 16_000.0);
        assert_eq!(report.request_seq, 5);

        let live = iteration(6, 500, 500);
        let with_partial = totals.report(Some(&live), 60.0, now);
        assert_eq!(with_partial.bytes_transferred, 2_500);
        assert_eq!(with_partial.request_seq, 6);

        // A partial that was already folded is not counted twice.
        let stale = iteration(5, 1_000, 500);
        assert_eq!(totals.report(Some(&stale), 60.0, now).bytes_transferred, 2_000);
    }

    #[test]
    fn window_percent_is_bounded() {
        let totals = RepeatTotals::new(
            TransferMode::Upload,
            RatePrecision::default(),
            Duration::from_secs(10),
            0,
        );
        let start = totals.started;
        assert_eq!(totals.window_percent(start), 0.0);
        assert_eq!(totals.window_percent(start + Duration::from_millis(2_550)), 25.0);
        assert_eq!(totals.window_percent(start + Duration::from_secs(60)), 100.0);
    }
}
