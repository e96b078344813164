//! Request targets and proxy addresses.

use std::fmt;

use url::{Host, Position, Url};

use crate::error::CodecError;

/// Port used when an `http://` URI does not name one.
const HTTP_DEFAULT_PORT: u16 = 80;

/// An `http://` endpoint to download from or upload to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host to connect to (IPv6 literals without brackets).
    host: String,
    port: u16,
    /// Value of the `Host` header.
    authority: String,
    /// Origin-form request target (`/path?query`).
    path: String,
    /// Absolute-form request target, used through a proxy.
    absolute: String,
}

impl Target {
    /// Parses an absolute `http://` URI.
    pub fn parse(uri: &str) -> Result<Self, CodecError> {
        let url = Url::parse(uri).map_err(|e| CodecError::InvalidUri(format!("{uri}: {e}")))?;
        if url.scheme() != "http" {
            return Err(CodecError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = connect_host(&url)
            .ok_or_else(|| CodecError::InvalidUri(format!("{uri}: missing host")))?;
        let port = url.port_or_known_default().unwrap_or(HTTP_DEFAULT_PORT);

        // `host_str` keeps IPv6 brackets, as the Host header requires.
        let host_str = url.host_str().unwrap_or(&host);
        let authority = match url.port() {
            Some(p) => format!("{host_str}:{p}"),
            None => host_str.to_string(),
        };

        let path = match &url[Position::BeforePath..Position::AfterQuery] {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let absolute = url[..Position::AfterQuery].to_string();

        Ok(Self {
            host,
            port,
            authority,
            path,
            absolute,
        })
    }

    /// Host to open the TCP connection to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `Host` header value.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Request target for the request line.
    ///
    /// Proxies expect the absolute form, origin servers the path form.
    pub fn request_target(&self, proxied: bool) -> &str {
        if proxied { &self.absolute } else { &self.path }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute)
    }
}

/// A validated HTTP proxy address.
///
/// Accepts `http://host[:port]` or a bare `host[:port]`. Anything carrying a
/// path, query or credentials is rejected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProxyAddress {
    host: String,
    port: u16,
}

impl ProxyAddress {
    /// Parses and validates a proxy address.
    pub fn parse(input: &str) -> Result<Self, CodecError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CodecError::InvalidUri("empty proxy address".into()));
        }

        let candidate = if input.contains("://") {
            input.to_string()
        } else {
            format!("http://{input}")
        };
        let url = Url::parse(&candidate)
            .map_err(|e| CodecError::InvalidUri(format!("{input}: {e}")))?;

        if url.scheme() != "http" {
            return Err(CodecError::UnsupportedScheme(url.scheme().to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(CodecError::InvalidUri(format!(
                "{input}: proxy credentials are not supported"
            )));
        }
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(CodecError::InvalidUri(format!(
                "{input}: proxy address must not carry a path"
            )));
        }

        let host = connect_host(&url)
            .ok_or_else(|| CodecError::InvalidUri(format!("{input}: missing host")))?;
        let port = url.port_or_known_default().unwrap_or(HTTP_DEFAULT_PORT);

        Ok(Self { host, port })
    }

    /// Proxy host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "http://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "http://{}:{}", self.host, self.port)
        }
    }
}

impl TryFrom<String> for ProxyAddress {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProxyAddress> for String {
    fn from(value: ProxyAddress) -> Self {
        value.to_string()
    }
}

/// Host suitable for `TcpStream::connect`.
fn connect_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain("") => None,
        Host::Domain(d) => Some(d.to_string()),
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}
