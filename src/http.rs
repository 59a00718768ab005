//! Embedded HTTP message views.
//!
//! ICAP transactions carry encapsulated HTTP request and response
//! headers. These types hold the parsed start line plus an ordered
//! header multimap; middleware mutates them in place and the encoder
//! serializes whatever is left when the response headers go out.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, IcapResult};
use crate::parser::wire::{MethodLine, StatusLine};

/// Components of a request URI, split out for routing.
///
/// Parsing is deliberately forgiving: proxies hand over both absolute
/// URIs (`http://host/path`) and bare authority or path forms, and a
/// routing miss is cheaper than a refused transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UriParts {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

impl UriParts {
    /// Split `raw` into scheme/host/port/path/query.
    ///
    /// A URI without `://` is assumed to be `http`, unless the authority
    /// carries an explicit `:443`, which implies `https`.
    pub fn parse(raw: &str) -> Self {
        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => {
                let implied = if raw.split(['/', '?']).next().is_some_and(|a| a.ends_with(":443")) {
                    "https"
                } else {
                    "http"
                };
                (implied.to_string(), raw)
            }
        };
        let (authority, tail) = match rest.find(['/', '?']) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (authority.to_string(), None),
            },
            None => (authority.to_string(), None),
        };
        let (path, query) = match tail.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (tail, None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path.to_string() };
        UriParts { scheme, host, port, path, query }
    }
}

/// Common surface of the two embedded HTTP message types.
pub trait Message {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    /// The raw start line as received, without its CRLF.
    fn start_line(&self) -> &str;
}

/// Encapsulated HTTP request headers of a transaction.
#[derive(Debug, Default, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub parsed_uri: UriParts,
    pub version: String,
    pub line: String,
    pub headers: HeaderMap,
}

impl HttpRequest {
    pub(crate) fn set_method(&mut self, line: MethodLine) {
        self.method = line.method;
        self.uri = line.uri;
        self.parsed_uri = line.parsed_uri;
        self.version = line.version;
        self.line = line.line;
    }

    pub(crate) fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }
}

impl Message for HttpRequest {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
    fn start_line(&self) -> &str {
        &self.line
    }
}

/// Encapsulated HTTP response headers of a transaction.
#[derive(Debug, Default, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub code: u16,
    pub message: String,
    pub line: String,
    pub headers: HeaderMap,
}

impl HttpResponse {
    pub(crate) fn set_status(&mut self, line: StatusLine) {
        self.version = line.version;
        self.code = line.code;
        self.message = line.message;
        self.line = line.line;
    }

    pub(crate) fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }
}

impl Message for HttpResponse {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
    fn start_line(&self) -> &str {
        &self.line
    }
}

/// Overlay `src` onto `dst`: every key present in `src` replaces the
/// whole value set for that key in `dst`, repeated values included.
/// Keys absent from `src` survive untouched.
pub(crate) fn merge_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Parse a header name/value pair into crate types.
pub(crate) fn header_pair(name: &str, value: &str) -> IcapResult<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::header(format!("invalid header name {name:?}: {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::header(format!("invalid header value for {name}: {e}")))?;
    Ok((name, value))
}
