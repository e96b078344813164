//! HTTP/1.1 framing for throughput probes.
//!
//! Encodes the minimal GET/POST request heads the transfer engine sends and
//! decodes response heads (status line, headers, content-length). Bodies are
//! never interpreted here: once [`read_response_head`] returns, the caller
//! keeps reading the body from the same buffered reader.

pub mod error;
pub mod request;
pub mod response;
pub mod target;

pub use error::CodecError;
pub use request::{encode_get, encode_post};
pub use response::{ResponseHead, read_response_head};
pub use target::{ProxyAddress, Target};

/// Upper bound on the size of a response head (status line + headers).
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("speedprobe/", env!("CARGO_PKG_VERSION"));
