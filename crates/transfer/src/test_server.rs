//! Loopback HTTP peers and a recording listener shared by the tests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::listener::TransferListener;
use crate::report::TransferReport;
use crate::types::ErrorKind;

/// A local server accepting any number of connections.
pub(crate) struct Peer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Peer {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawns a server running `handler` for every accepted connection.
pub(crate) async fn serve<F, Fut>(handler: F) -> Peer
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler(stream));
        }
    });
    Peer { addr, task }
}

/// Reads a request head and returns it without the trailing blank line.
pub(crate) async fn read_head(reader: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return head;
        }
        if line == "\r\n" {
            return head;
        }
        head.push_str(&line);
    }
}

pub(crate) fn content_length(head: &str) -> u64 {
    head.lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0)
}

/// Serves `body_len` bytes in `chunk`-sized writes with `delay` between them.
pub(crate) async fn serve_download(body_len: usize, chunk: usize, delay: Duration) -> Peer {
    serve_raw_download(
        move || format!("HTTP/1.1 200 OK\r\nContent-Length: {body_len}\r\n\r\n"),
        body_len,
        chunk,
        delay,
    )
    .await
}

/// Like [`serve_download`] but with a custom response head.
pub(crate) async fn serve_raw_download<H>(
    head: H,
    body_len: usize,
    chunk: usize,
    delay: Duration,
) -> Peer
where
    H: Fn() -> String + Send + Sync + Clone + 'static,
{
    serve(move |stream| {
        let head = head.clone();
        async move {
            let mut reader = BufReader::new(stream);
            read_head(&mut reader).await;
            let mut stream = reader.into_inner();
            if stream.write_all(head().as_bytes()).await.is_err() {
                return;
            }
            let body = vec![0x5a; chunk.max(1)];
            let mut sent = 0;
            while sent < body_len {
                let n = chunk.min(body_len - sent);
                if stream.write_all(&body[..n]).await.is_err() {
                    return;
                }
                sent += n;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            let _ = stream.shutdown().await;
        }
    })
    .await
}

/// Accepts uploads, drains the announced body and answers with `status`.
///
/// The returned counter holds the body bytes received across connections.
pub(crate) async fn serve_upload(status: &'static str) -> (Peer, Arc<AtomicU64>) {
    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);
    let peer = serve(move |stream| {
        let counter = Arc::clone(&counter);
        async move {
            let mut reader = BufReader::new(stream);
            let head = read_head(&mut reader).await;
            let len = content_length(&head);
            let n = tokio::io::copy(&mut (&mut reader).take(len), &mut tokio::io::sink())
                .await
                .unwrap_or(0);
            counter.fetch_add(n, Ordering::SeqCst);
            let mut stream = reader.into_inner();
            let reply = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\n\r\n");
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    })
    .await;
    (peer, received)
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Progress(TransferReport),
    Completed(TransferReport),
    Failed(ErrorKind, String),
}

impl Event {
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn progress(&self) -> Vec<TransferReport> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn terminals(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_terminal).collect()
    }

    /// Waits until `pred` holds for the recorded events.
    pub(crate) async fn wait_for(&self, pred: impl Fn(&[Event]) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if pred(&self.events()) {
                    return;
                }
                self.changed.notified().await;
            }
        })
        .await
        .expect("timed out waiting for transfer events");
    }

    /// Waits for the first terminal event and returns it.
    pub(crate) async fn wait_terminal(&self) -> Event {
        self.wait_for(|events| events.iter().any(Event::is_terminal))
            .await;
        self.terminals().remove(0)
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_one();
    }
}

impl TransferListener for Recorder {
    fn on_progress(&self, _percent: f64, report: &TransferReport) {
        self.push(Event::Progress(report.clone()));
    }

    fn on_completion(&self, report: &TransferReport) {
        self.push(Event::Completed(report.clone()));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.push(Event::Failed(kind, message.to_string()));
    }
}
