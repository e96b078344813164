//! Response-head decoding.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::trace;

use crate::MAX_HEAD_SIZE;
use crate::error::CodecError;

/// Status line and headers of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Protocol version, e.g. `HTTP/1.1`.
    pub version: String,
    /// Status code.
    pub status: u16,
    /// Reason phrase (may be empty).
    pub reason: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Parsed `Content-Length`, if present.
    pub content_length: Option<u64>,
}

impl ResponseHead {
    /// Returns the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` for any 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `true` for a 2xx status whose reason phrase is `OK` (any case).
    pub fn is_ok(&self) -> bool {
        self.is_success() && self.reason.eq_ignore_ascii_case("OK")
    }
}

/// Reads a response head from `reader`, leaving the body unread.
///
/// Accepts bare `\n` line endings and skips empty lines before the status
/// line. Fails with [`CodecError::HeadTooLarge`] once [`MAX_HEAD_SIZE`] bytes
/// have been consumed without reaching the blank line.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;
    let mut line = Vec::with_capacity(256);
    let mut status_line: Option<String> = None;
    let mut raw_headers: Vec<String> = Vec::new();

    loop {
        line.clear();
        let budget = (MAX_HEAD_SIZE - consumed) as u64;
        if budget == 0 {
            return Err(CodecError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(CodecError::UnexpectedEof);
        }
        consumed += n;
        if !line.ends_with(b"\n") {
            return Err(if consumed >= MAX_HEAD_SIZE {
                CodecError::HeadTooLarge(MAX_HEAD_SIZE)
            } else {
                CodecError::UnexpectedEof
            });
        }

        let text = std::str::from_utf8(strip_line_end(&line))
            .map_err(|_| CodecError::InvalidHeader("non UTF-8 bytes in response head".into()))?;

        match (&status_line, text.is_empty()) {
            (None, true) => continue,
            (None, false) => status_line = Some(text.to_string()),
            (Some(_), false) => raw_headers.push(text.to_string()),
            (Some(_), true) => break,
        }
    }

    let status_line = status_line.unwrap_or_default();
    let (version, status, reason) = parse_status_line(&status_line)?;

    let mut headers = Vec::with_capacity(raw_headers.len());
    let mut content_length: Option<u64> = None;
    for raw in raw_headers {
        let (name, value) = raw
            .split_once(':')
            .ok_or_else(|| CodecError::InvalidHeader(raw.clone()))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(CodecError::InvalidHeader(raw.clone()));
        }

        if name.eq_ignore_ascii_case("Content-Length") {
            let parsed: u64 = value
                .parse()
                .map_err(|_| CodecError::InvalidHeader(format!("Content-Length: {value}")))?;
            if content_length.is_some_and(|prev| prev != parsed) {
                return Err(CodecError::InvalidHeader(
                    "conflicting Content-Length headers".into(),
                ));
            }
            content_length = Some(parsed);
        }

        headers.push((name.to_string(), value.to_string()));
    }

    trace!(status, %reason, ?content_length, "response head decoded");

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        content_length,
    })
}

fn strip_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parses `HTTP/1.1 200 OK`.
fn parse_status_line(line: &str) -> Result<(String, u16, String), CodecError> {
    let invalid = || CodecError::InvalidStatusLine(line.to_string());

    let (version, rest) = line.split_once(' ').ok_or_else(invalid)?;
    if !version.starts_with("HTTP/") {
        return Err(invalid());
    }

    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let status: u16 = code.parse().map_err(|_| invalid())?;

    Ok((version.to_string(), status, reason.trim().to_string()))
}
