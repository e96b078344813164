//! Download and upload driver.
//!
//! One transfer runs at a time. The task calling `start_*` connects and
//! writes; a spawned reader task owns the read half of the socket, decodes
//! the response and decides how the transfer ends. Every I/O wait selects
//! on the transfer's [`CancellationToken`](tokio_util::sync::CancellationToken)
//! so `cancel()` and terminal failures tear the socket down promptly.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use speedprobe_http::{CodecError, Target, encode_get, encode_post, read_response_head};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::TransferError;
use crate::config::{ConfigError, RatePrecision, TransferConfig, UploadStorage};
use crate::listener::{ListenerId, ListenerRegistry, TransferListener};
use crate::payload::{Payload, PayloadGenerator};
use crate::report::TransferReport;
use crate::session::{Outcome, Terminal, TransferSession};
use crate::types::{ErrorKind, TransferMode, TransferState};

/// Runs throughput transfers against an HTTP server.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Mutex<TransferConfig>,
    listeners: ListenerRegistry,
    generator: Mutex<PayloadGenerator>,
    state: Mutex<TransferState>,
    active: AtomicBool,
    session: Mutex<Option<Arc<TransferSession>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    last_report: Mutex<TransferReport>,
    next_seq: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `fut` under an optional deadline. `None` means it timed out.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn send_all(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn codec_error_kind(err: &CodecError) -> ErrorKind {
    if err.is_transport() {
        ErrorKind::SocketError
    } else {
        ErrorKind::InvalidServerResponse
    }
}

/// Clears the active flag if a start is abandoned before its session exists.
struct StartGuard<'a> {
    active: &'a AtomicBool,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.active.store(false, Ordering::Release);
        }
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    /// Creates an engine with default settings.
    pub fn new() -> Self {
        Self::build(TransferConfig::default(), PayloadGenerator::new())
    }

    /// Creates an engine with the given settings.
    pub fn with_config(config: TransferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, PayloadGenerator::new()))
    }

    /// Replaces the payload generator, e.g. with a seeded one.
    pub fn with_generator(self, generator: PayloadGenerator) -> Self {
        *lock(&self.inner.generator) = generator;
        self
    }

    fn build(config: TransferConfig, generator: PayloadGenerator) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Mutex::new(config),
                listeners: ListenerRegistry::new(),
                generator: Mutex::new(generator),
                state: Mutex::new(TransferState::Idle),
                active: AtomicBool::new(false),
                session: Mutex::new(None),
                reader: Mutex::new(None),
                last_report: Mutex::new(TransferReport::default()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Returns a copy of the current settings.
    pub fn config(&self) -> TransferConfig {
        lock(&self.inner.config).clone()
    }

    /// Replaces all settings. Takes effect on the next transfer.
    pub fn set_config(&self, config: TransferConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *lock(&self.inner.config) = config;
        Ok(())
    }

    pub fn set_socket_timeout(&self, timeout: Duration) {
        lock(&self.inner.config).set_socket_timeout(timeout);
    }

    pub fn set_upload_chunk_size(&self, size: usize) -> Result<(), ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        lock(&self.inner.config).upload_chunk_size = size;
        Ok(())
    }

    pub fn set_download_buffer_size(&self, size: usize) -> Result<(), ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        lock(&self.inner.config).download_buffer_size = size;
        Ok(())
    }

    pub fn set_upload_storage(&self, storage: UploadStorage) {
        lock(&self.inner.config).upload_storage = storage;
    }

    /// Routes subsequent transfers through an HTTP proxy.
    pub fn set_proxy(&self, address: &str) -> Result<(), ConfigError> {
        lock(&self.inner.config).set_proxy(address)
    }

    pub fn clear_proxy(&self) {
        lock(&self.inner.config).proxy = None;
    }

    pub fn set_rate_precision(&self, precision: RatePrecision) -> Result<(), ConfigError> {
        let mut config = lock(&self.inner.config);
        let candidate = TransferConfig {
            precision,
            ..config.clone()
        };
        candidate.validate()?;
        *config = candidate;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Listeners and status
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn state(&self) -> TransferState {
        *lock(&self.inner.state)
    }

    /// Returns true from a successful `start_*` until the terminal callback.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Returns the latest report.
    ///
    /// While a transfer runs the report is computed from its live counters;
    /// afterwards it is the terminal report. Before any transfer it is all
    /// zeroes with mode [`TransferMode::None`].
    pub fn live_report(&self) -> TransferReport {
        let session = lock(&self.inner.session).clone();
        match session {
            Some(session) if !session.is_terminal() => session.snapshot(Instant::now()),
            _ => lock(&self.inner.last_report).clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    /// Downloads `uri`, timing the body.
    ///
    /// Returns once the request is sent; the body is read on a background
    /// task. Dropping the returned future before it resolves leaves the
    /// transfer in place until [`cancel`](Self::cancel) is called.
    pub async fn start_download(&self, uri: &str) -> Result<(), TransferError> {
        self.download(uri, None).await
    }

    /// Like [`start_download`](Self::start_download), but completes normally
    /// with the partial numbers once `max_duration` has passed.
    pub async fn start_fixed_download(
        &self,
        uri: &str,
        max_duration: Duration,
    ) -> Result<(), TransferError> {
        self.download(uri, Some(max_duration)).await
    }

    /// Uploads `size` pseudorandom bytes to `uri`.
    ///
    /// Returns once the body has been written; the response is awaited on a
    /// background task.
    pub async fn start_upload(&self, uri: &str, size: u64) -> Result<(), TransferError> {
        self.upload(uri, size, None).await
    }

    /// Like [`start_upload`](Self::start_upload), but completes normally
    /// with the partial numbers once `max_duration` has passed.
    pub async fn start_fixed_upload(
        &self,
        uri: &str,
        size: u64,
        max_duration: Duration,
    ) -> Result<(), TransferError> {
        self.upload(uri, size, Some(max_duration)).await
    }

    /// Stops the running transfer.
    ///
    /// Listeners receive `on_completion` with `cancelled` set and the
    /// progress reached so far. Does nothing when no transfer is running.
    pub fn cancel(&self) {
        let session = lock(&self.inner.session).clone();
        if let Some(session) = session
            && self.finish(&session, Outcome::Cancelled, Instant::now())
        {
            debug!(seq = session.seq, "transfer cancelled");
        }
    }

    /// Cancels any running transfer and waits for the reader task to exit.
    pub async fn shutdown_and_wait(&self) {
        self.cancel();
        self.join_reader().await;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn begin(
        &self,
        uri: &str,
        mode: TransferMode,
    ) -> Result<(Target, TransferConfig, Arc<TransferSession>), TransferError> {
        let target = Target::parse(uri)?;
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransferError::AlreadyActive);
        }
        let mut guard = StartGuard {
            active: &self.inner.active,
            armed: true,
        };

        // The previous reader may still be delivering its terminal callback.
        self.join_reader().await;

        let config = self.config();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(TransferSession::new(mode, seq, config.precision));
        *lock(&self.inner.last_report) = session.snapshot(Instant::now());
        *lock(&self.inner.session) = Some(Arc::clone(&session));
        *lock(&self.inner.state) = TransferState::Connecting;
        guard.armed = false;

        debug!(seq, %mode, %target, proxy = ?config.proxy, "transfer starting");
        Ok((target, config, session))
    }

    /// Releases the engine without notifying listeners.
    fn abandon(&self, session: &TransferSession) {
        if session.try_finish() {
            session.cancel.cancel();
            *lock(&self.inner.state) = TransferState::Idle;
            self.inner.active.store(false, Ordering::Release);
        }
    }

    fn is_current(&self, session: &Arc<TransferSession>) -> bool {
        lock(&self.inner.session)
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    fn set_state(&self, session: &TransferSession, state: TransferState) {
        let mut current = lock(&self.inner.state);
        if !session.is_terminal() {
            *current = state;
        }
    }

    fn progress(&self, session: &Arc<TransferSession>, at: Instant) {
        if !session.begin_progress() {
            return;
        }
        let report = session.snapshot(at);
        trace!(
            seq = report.request_seq,
            percent = report.progress_percent,
            bytes = report.bytes_transferred,
            "progress"
        );
        *lock(&self.inner.last_report) = report.clone();
        self.inner.listeners.dispatch_progress(&report);

        if let Some(terminal) = session.end_progress() {
            self.deliver(session, terminal);
        }
    }

    fn fail(&self, session: &Arc<TransferSession>, kind: ErrorKind, message: String) {
        self.finish(session, Outcome::Failed(kind, message), Instant::now());
    }

    /// Ends the transfer. Only the first call per session has any effect.
    ///
    /// If a progress report is being dispatched, the terminal report is
    /// delivered right after it instead of from here.
    fn finish(&self, session: &Arc<TransferSession>, outcome: Outcome, at: Instant) -> bool {
        if !session.try_finish() {
            return false;
        }
        session.cancel.cancel();

        let mut report = session.snapshot(at);
        if matches!(outcome, Outcome::Cancelled) {
            report.cancelled = true;
        }
        if let Some(terminal) = session.hand_off(Terminal { outcome, report }) {
            self.deliver(session, terminal);
        }
        true
    }

    /// Publishes the terminal report and dispatches the terminal callback.
    fn deliver(&self, session: &Arc<TransferSession>, terminal: Terminal) {
        let Terminal { outcome, report } = terminal;
        let state = match &outcome {
            Outcome::Completed => TransferState::Completed,
            Outcome::Cancelled => TransferState::Cancelled,
            Outcome::Failed(..) => TransferState::Failed,
        };
        if self.is_current(session) {
            *lock(&self.inner.last_report) = report.clone();
            *lock(&self.inner.state) = state;
            self.inner.active.store(false, Ordering::Release);
        }

        match outcome {
            Outcome::Completed | Outcome::Cancelled => {
                debug!(
                    seq = report.request_seq,
                    bytes = report.bytes_transferred,
                    bits_per_sec = report.rate_bits_per_sec,
                    cancelled = report.cancelled,
                    "transfer finished"
                );
                self.inner.listeners.dispatch_completion(&report);
            }
            Outcome::Failed(kind, message) => {
                warn!(seq = report.request_seq, %kind, error = %message, "transfer failed");
                self.inner.listeners.dispatch_error(kind, &message);
            }
        }
    }

    fn spawn_reader<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.inner.reader);
        *slot = Some(tokio::spawn(task));
    }

    async fn join_reader(&self) {
        let handle = lock(&self.inner.reader).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "reader task ended abnormally");
        }
    }

    fn spawn_deadline(&self, session: &Arc<TransferSession>, max: Duration) {
        let engine = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(max) => {
                    if engine.finish(&session, Outcome::Completed, Instant::now()) {
                        debug!(seq = session.seq, ?max, "maximum duration reached");
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Socket helpers
    // -----------------------------------------------------------------------

    async fn connect(
        &self,
        target: &Target,
        config: &TransferConfig,
        session: &Arc<TransferSession>,
    ) -> Option<TcpStream> {
        let (host, port) = match &config.proxy {
            Some(proxy) => (proxy.host(), proxy.port()),
            None => (target.host(), target.port()),
        };
        session.mark_connecting(Instant::now());

        let result = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return None,
            r = within(config.socket_timeout(), TcpStream::connect((host, port))) => r,
        };

        match result {
            Some(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "failed to set TCP_NODELAY");
                }
                debug!(seq = session.seq, host, port, "connected");
                Some(stream)
            }
            Some(Err(e)) => {
                self.fail(
                    session,
                    ErrorKind::ConnectionError,
                    format!("failed to connect to {host}:{port}: {e}"),
                );
                None
            }
            None => {
                self.fail(
                    session,
                    ErrorKind::ConnectionError,
                    format!(
                        "connecting to {host}:{port} timed out after {} ms",
                        config.socket_timeout_ms
                    ),
                );
                None
            }
        }
    }

    /// Sends a request head. Returns false if the transfer ended instead.
    async fn write_head(
        &self,
        session: &Arc<TransferSession>,
        writer: &mut OwnedWriteHalf,
        head: &[u8],
        timeout: Option<Duration>,
    ) -> bool {
        let result = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return false,
            r = within(timeout, send_all(writer, head)) => r,
        };
        match result {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                self.fail(
                    session,
                    ErrorKind::SocketError,
                    format!("failed to send request: {e}"),
                );
                false
            }
            None => {
                self.fail(
                    session,
                    ErrorKind::SocketTimeout,
                    "timed out sending request".into(),
                );
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    async fn download(&self, uri: &str, max: Option<Duration>) -> Result<(), TransferError> {
        let (target, config, session) = self.begin(uri, TransferMode::Download).await?;
        if let Some(max) = max {
            self.spawn_deadline(&session, max);
        }

        let Some(stream) = self.connect(&target, &config, &session).await else {
            return Ok(());
        };
        let (read_half, mut write_half) = stream.into_split();

        let request = encode_get(&target, config.proxy.is_some());
        if !self
            .write_head(&session, &mut write_half, &request, config.socket_timeout())
            .await
        {
            return Ok(());
        }
        session.mark_started(Instant::now());
        self.set_state(&session, TransferState::Transferring);

        self.spawn_reader(
            self.clone()
                .read_download(session, read_half, write_half, config),
        );
        Ok(())
    }

    /// Reader task for a download. Holds the write half so the socket stays
    /// open until the transfer is over.
    async fn read_download(
        self,
        session: Arc<TransferSession>,
        read_half: OwnedReadHalf,
        _writer: OwnedWriteHalf,
        config: TransferConfig,
    ) {
        let timeout = config.socket_timeout();
        let mut reader = BufReader::with_capacity(config.download_buffer_size, read_half);

        let head = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return,
            r = within(timeout, read_response_head(&mut reader)) => r,
        };
        let head = match head {
            Some(Ok(head)) => head,
            Some(Err(e)) => {
                return self.fail(
                    &session,
                    codec_error_kind(&e),
                    format!("failed to read response head: {e}"),
                );
            }
            None => {
                return self.fail(
                    &session,
                    ErrorKind::SocketTimeout,
                    "no response head within the socket timeout".into(),
                );
            }
        };

        if !head.is_success() {
            return self.fail(
                &session,
                ErrorKind::InvalidServerResponse,
                format!("server answered {} {}", head.status, head.reason),
            );
        }
        let total = match head.content_length {
            Some(len) if len > 0 => len,
            _ => {
                return self.fail(
                    &session,
                    ErrorKind::InvalidServerResponse,
                    "response has no usable Content-Length".into(),
                );
            }
        };
        session.set_total(total);
        debug!(seq = session.seq, total, "download body started");

        let mut buf = vec![0u8; config.download_buffer_size];
        loop {
            let remaining = total - session.transferred();
            let want = remaining.min(buf.len() as u64) as usize;

            let read = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return,
                r = within(timeout, reader.read(&mut buf[..want])) => r,
            };
            let n = match read {
                Some(Ok(0)) => {
                    return self.fail(
                        &session,
                        ErrorKind::SocketError,
                        format!(
                            "connection closed after {} of {total} bytes",
                            session.transferred()
                        ),
                    );
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    return self.fail(
                        &session,
                        ErrorKind::SocketError,
                        format!("read failed: {e}"),
                    );
                }
                None => {
                    return self.fail(
                        &session,
                        ErrorKind::SocketTimeout,
                        format!(
                            "no data for {} ms after {} of {total} bytes",
                            config.socket_timeout_ms,
                            session.transferred()
                        ),
                    );
                }
            };

            let received = session.add_bytes(n as u64);
            let now = Instant::now();
            self.progress(&session, now);
            if received >= total {
                self.finish(&session, Outcome::Completed, now);
                return;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    async fn upload(&self, uri: &str, size: u64, max: Option<Duration>) -> Result<(), TransferError> {
        let (target, config, session) = self.begin(uri, TransferMode::Upload).await?;
        let chunk_size = config.upload_chunk_size as u64;
        session.set_total(size);
        session.set_total_chunks(size.div_ceil(chunk_size));

        if size == 0 {
            let now = Instant::now();
            session.mark_started(now);
            self.progress(&session, now);
            self.finish(&session, Outcome::Completed, now);
            return Ok(());
        }

        let payload = match self.prepare_payload(size, config.upload_storage).await {
            Ok(payload) => payload,
            Err(e) => {
                self.abandon(&session);
                return Err(e.into());
            }
        };
        if let Some(max) = max {
            self.spawn_deadline(&session, max);
        }

        self.drive_upload(&target, &config, &session, &payload)
            .await;
        payload.release();
        Ok(())
    }

    async fn prepare_payload(&self, size: u64, storage: UploadStorage) -> io::Result<Payload> {
        let mut generator = lock(&self.inner.generator).fork();
        match storage {
            UploadStorage::Ram => {
                let len = usize::try_from(size).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "payload too large for memory")
                })?;
                let data = tokio::task::spawn_blocking(move || generator.generate(len))
                    .await
                    .map_err(io::Error::other)?;
                Ok(Payload::Memory(data))
            }
            UploadStorage::TempFile => {
                let file =
                    tokio::task::spawn_blocking(move || generator.generate_to_temp_file(size))
                        .await
                        .map_err(io::Error::other)??;
                Ok(Payload::File(file))
            }
        }
    }

    async fn drive_upload(
        &self,
        target: &Target,
        config: &TransferConfig,
        session: &Arc<TransferSession>,
        payload: &Payload,
    ) {
        let Some(stream) = self.connect(target, config, session).await else {
            return;
        };
        let (read_half, mut write_half) = stream.into_split();

        // The reader starts first so an early response is never missed.
        let (writer_tx, writer_rx) = oneshot::channel();
        self.spawn_reader(self.clone().read_upload_response(
            Arc::clone(session),
            read_half,
            writer_rx,
            config.socket_timeout(),
        ));

        let head = encode_post(target, payload.len(), config.proxy.is_some());
        if !self
            .write_head(session, &mut write_half, &head, config.socket_timeout())
            .await
        {
            return;
        }
        session.mark_started(Instant::now());
        self.set_state(session, TransferState::Transferring);

        if self
            .write_body(session, &mut write_half, payload, config)
            .await
        {
            session.mark_writes_done(Instant::now());
            trace!(seq = session.seq, chunks = session.chunks_written(), "upload body written");
            let _ = writer_tx.send(write_half);
        }
    }

    /// Writes the body chunk by chunk. Returns false if the transfer ended.
    async fn write_body(
        &self,
        session: &Arc<TransferSession>,
        writer: &mut OwnedWriteHalf,
        payload: &Payload,
        config: &TransferConfig,
    ) -> bool {
        let total = payload.len();
        let chunk_size = config.upload_chunk_size;
        let timeout = config.socket_timeout();

        let mut source = match payload.open().await {
            Ok(source) => source,
            Err(e) => {
                self.fail(
                    session,
                    ErrorKind::SocketError,
                    format!("failed to open upload payload: {e}"),
                );
                return false;
            }
        };
        let mut scratch = match payload {
            Payload::File(_) => vec![0u8; chunk_size],
            Payload::Memory(_) => Vec::new(),
        };

        let mut offset = 0u64;
        while offset < total {
            let len = (total - offset).min(chunk_size as u64) as usize;
            let chunk = match source.next_chunk(&mut scratch, len).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.fail(
                        session,
                        ErrorKind::SocketError,
                        format!("failed to read upload payload: {e}"),
                    );
                    return false;
                }
            };

            let written = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return false,
                r = within(timeout, writer.write_all(chunk)) => r,
            };
            match written {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    self.fail(
                        session,
                        ErrorKind::SocketError,
                        format!("write failed after {offset} of {total} bytes: {e}"),
                    );
                    return false;
                }
                None => {
                    self.fail(
                        session,
                        ErrorKind::SocketTimeout,
                        format!("write stalled after {offset} of {total} bytes"),
                    );
                    return false;
                }
            }

            offset += len as u64;
            session.add_chunk(len as u64);
            self.progress(session, Instant::now());
        }

        let flushed = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return false,
            r = within(timeout, writer.flush()) => r,
        };
        match flushed {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                self.fail(session, ErrorKind::SocketError, format!("flush failed: {e}"));
                false
            }
            None => {
                self.fail(session, ErrorKind::SocketTimeout, "flush stalled".into());
                false
            }
        }
    }

    /// Reader task for an upload.
    ///
    /// Receives the write half once the body is written; the response
    /// timeout starts from that point.
    async fn read_upload_response(
        self,
        session: Arc<TransferSession>,
        read_half: OwnedReadHalf,
        writer_rx: oneshot::Receiver<OwnedWriteHalf>,
        timeout: Option<Duration>,
    ) {
        let mut reader = BufReader::new(read_half);
        let head = read_response_head(&mut reader);
        tokio::pin!(head);

        let (early, _writer) = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return,
            r = &mut head => (Some(r), None),
            w = writer_rx => match w {
                Ok(writer) => (None, Some(writer)),
                Err(_) => {
                    return self.fail(
                        &session,
                        ErrorKind::SocketError,
                        "upload aborted before the body was written".into(),
                    );
                }
            },
        };

        let result = match early {
            Some(r) => Some(r),
            None => tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return,
                r = within(timeout, &mut head) => r,
            },
        };

        match result {
            Some(Ok(head)) if head.is_ok() => {
                let end = session.writes_done_at().unwrap_or_else(Instant::now);
                self.finish(&session, Outcome::Completed, end);
            }
            Some(Ok(head)) => self.fail(
                &session,
                ErrorKind::InvalidServerResponse,
                format!("server answered {} {}", head.status, head.reason),
            ),
            Some(Err(e)) => self.fail(
                &session,
                codec_error_kind(&e),
                format!("failed to read upload response: {e}"),
            ),
            None => self.fail(
                &session,
                ErrorKind::SocketTimeout,
                "no response within the socket timeout".into(),
            ),
        }
    }
}
