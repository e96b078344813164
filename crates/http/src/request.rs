//! Request heads sent by the probe.
//!
//! ```text
//! GET  <target> HTTP/1.1\r\n Host, User-Agent, Accept, Connection: close
//! POST <target> HTTP/1.1\r\n Host, User-Agent, Accept, Content-Type,
//!                             Content-Length, Connection: close
//! ```
//!
//! `<target>` is the origin form (`/path`) for direct connections and the
//! absolute form (`http://host/path`) when going through a proxy.

use crate::USER_AGENT;
use crate::target::Target;

/// Encodes a GET request head for a download.
pub fn encode_get(target: &Target, proxied: bool) -> Vec<u8> {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Connection: close\r\n\
         \r\n",
        target.request_target(proxied),
        target.authority(),
    )
    .into_bytes()
}

/// Encodes a POST request head announcing `content_length` body bytes.
pub fn encode_post(target: &Target, content_length: u64, proxied: bool) -> Vec<u8> {
    format!(
        "POST {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {content_length}\r\n\
         Connection: close\r\n\
         \r\n",
        target.request_target(proxied),
        target.authority(),
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .unwrap()
            .split("\r\n")
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn get_direct() {
        let target = Target::parse("http://example.com:8080/1M.bin").unwrap();
        let lines = head_lines(&encode_get(&target, false));
        assert_eq!(lines[0], "GET /1M.bin HTTP/1.1");
        assert!(lines.contains(&"Host: example.com:8080".to_string()));
        assert!(lines.contains(&"Connection: close".to_string()));
        // Head ends with an empty line.
        assert_eq!(&lines[lines.len() - 2..], &["", ""]);
    }

    #[test]
    fn get_through_proxy_uses_absolute_form() {
        let target = Target::parse("http://example.com/1M.bin").unwrap();
        let lines = head_lines(&encode_get(&target, true));
        assert_eq!(lines[0], "GET http://example.com/1M.bin HTTP/1.1");
        assert!(lines.contains(&"Host: example.com".to_string()));
    }

    #[test]
    fn post_announces_length() {
        let target = Target::parse("http://example.com/upload").unwrap();
        let bytes = encode_post(&target, 1_000_000, false);
        let lines = head_lines(&bytes);
        assert_eq!(lines[0], "POST /upload HTTP/1.1");
        assert!(lines.contains(&"Content-Length: 1000000".to_string()));
        assert!(lines.contains(&"Content-Type: application/octet-stream".to_string()));
        assert!(bytes.ends_with(b"\r\n\r\n"));
    }
}
