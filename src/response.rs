//! Outbound ICAP response encoder.
//!
//! The encoder is sans-io: everything serializes into an internal byte
//! buffer that the connection driver drains after each parser step.
//! Body output uses chunked framing, optionally passed through a
//! per-chunk or whole-body content filter.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::OnceLock;

use http::header::{HeaderMap, HeaderValue};
use tracing::trace;

use crate::codes;
use crate::error::{Error, IcapResult};
use crate::http::{merge_headers, HttpRequest, HttpResponse};
use crate::{DEFAULT_CHUNK_SIZE, ICAP_VERSION, VERSION};

const CRLF: &str = "\r\n";

/// Content filter: maps a body chunk to replacement bytes, or `None` to
/// swallow the chunk (e.g. while buffering internally).
pub type FilterFn = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

fn istag() -> &'static str {
    static ISTAG: OnceLock<String> = OnceLock::new();
    ISTAG.get_or_init(|| format!("icap-adapt-{}", chrono::Utc::now().timestamp_millis()))
}

fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, Clone)]
enum HttpLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Status {
        version: String,
        code: u16,
        reason: String,
    },
}

/// The outbound half of an ICAP transaction.
///
/// Middleware sets the ICAP status, headers and encapsulated HTTP start
/// line, then either streams body chunks with [`write`](Self::write),
/// stages a single payload with [`send`](Self::send), or answers
/// `204 No Content` via [`allow_unchanged`](Self::allow_unchanged).
pub struct IcapResponse {
    pub id: String,
    icap_status: Option<(String, u16, Cow<'static, str>)>,
    pub icap_headers: HeaderMap,
    http_line: Option<HttpLine>,
    pub http_headers: HeaderMap,
    chunk_size: usize,
    filter: Option<FilterFn>,
    buffer: Option<Vec<u8>>,
    send_data: Option<Vec<u8>>,
    allow_unchanged_allowed: bool,
    done: bool,
    out: Vec<u8>,
}

impl IcapResponse {
    pub(crate) fn new(id: String, chunk_size: usize) -> Self {
        IcapResponse {
            id,
            icap_status: None,
            icap_headers: HeaderMap::new(),
            http_line: None,
            http_headers: HeaderMap::new(),
            chunk_size: if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size },
            filter: None,
            buffer: None,
            send_data: None,
            allow_unchanged_allowed: true,
            done: false,
            out: Vec::new(),
        }
    }

    /// Set the ICAP status line. The reason phrase comes from the
    /// status table.
    pub fn set_status(&mut self, code: u16) {
        self.icap_status = Some((
            ICAP_VERSION.to_string(),
            code,
            Cow::Borrowed(codes::reason_phrase(code)),
        ));
    }

    /// Overlay headers onto the ICAP header block.
    pub fn set_icap_headers(&mut self, headers: &HeaderMap) {
        merge_headers(&mut self.icap_headers, headers);
    }

    /// Append one ICAP header without disturbing existing values.
    pub fn add_icap_header(&mut self, name: http::header::HeaderName, value: HeaderValue) {
        self.icap_headers.append(name, value);
    }

    /// Set the encapsulated HTTP request line (REQMOD).
    pub fn set_http_request_line(&mut self, method: &str, uri: &str, version: &str) {
        let version = if version.is_empty() { "HTTP/1.1" } else { version };
        self.http_line = Some(HttpLine::Request {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
        });
    }

    /// Set the encapsulated HTTP status line (RESPMOD).
    pub fn set_http_status_line(&mut self, version: &str, code: u16, reason: &str) {
        let version = if version.is_empty() { "HTTP/1.1" } else { version };
        let reason = if reason.is_empty() {
            codes::reason_phrase(code).to_string()
        } else {
            reason.to_string()
        };
        self.http_line = Some(HttpLine::Status {
            version: version.to_string(),
            code,
            reason,
        });
    }

    /// Overlay headers onto the encapsulated HTTP header block.
    pub fn set_http_headers(&mut self, headers: &HeaderMap) {
        merge_headers(&mut self.http_headers, headers);
    }

    /// Echo an inbound HTTP request's start line and headers.
    pub fn relay_http_request(&mut self, req: &HttpRequest) {
        self.set_http_request_line(&req.method, &req.uri, &req.version);
        self.set_http_headers(&req.headers);
    }

    /// Echo an inbound HTTP response's start line and headers.
    pub fn relay_http_response(&mut self, res: &HttpResponse) {
        self.set_http_status_line(&res.version, res.code, &res.message);
        self.set_http_headers(&res.headers);
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Install a content filter over outbound body chunks.
    ///
    /// With `buffer_whole` the entire body is accumulated and the
    /// filter runs once over the whole payload at end-of-body;
    /// otherwise it runs per chunk.
    pub fn set_filter(&mut self, buffer_whole: bool, filter: FilterFn) {
        self.buffer = buffer_whole.then(Vec::new);
        self.filter = Some(filter);
    }

    /// Serialize the ICAP status line, ICAP headers and (if present)
    /// the encapsulated HTTP header block.
    ///
    /// `has_body` decides between `req-body`/`res-body` and `null-body`
    /// in the `Encapsulated` header. `Date`, `ISTag` and `Server` are
    /// stamped unless middleware already set them.
    pub fn write_headers(&mut self, has_body: bool) -> IcapResult<()> {
        let (version, code, reason) = self
            .icap_status
            .get_or_insert_with(|| {
                (
                    ICAP_VERSION.to_string(),
                    500,
                    Cow::Borrowed(codes::reason_phrase(500)),
                )
            })
            .clone();

        let mut http_block = String::new();
        if let Some(line) = &self.http_line {
            match line {
                HttpLine::Request { method, uri, version } => {
                    let _ = write!(&mut http_block, "{method} {uri} {version}{CRLF}");
                }
                HttpLine::Status { version, code, reason } => {
                    let _ = write!(&mut http_block, "{version} {code} {reason}{CRLF}");
                }
            }
            for (name, value) in self.http_headers.iter() {
                let _ = write!(
                    &mut http_block,
                    "{}: {}{CRLF}",
                    canon_header(name.as_str()),
                    value.to_str().unwrap_or_default()
                );
            }
            http_block.push_str(CRLF);

            let body_tag = match (&self.http_line, has_body) {
                (Some(HttpLine::Request { .. }), true) => "req-body",
                (Some(HttpLine::Status { .. }), true) => "res-body",
                _ => "null-body",
            };
            let hdr_tag = match &self.http_line {
                Some(HttpLine::Request { .. }) => "req-hdr",
                _ => "res-hdr",
            };
            let encapsulated = format!("{hdr_tag}=0, {body_tag}={}", http_block.len());
            self.icap_headers.insert(
                http::header::HeaderName::from_static("encapsulated"),
                HeaderValue::from_str(&encapsulated)
                    .map_err(|e| Error::header(format!("encapsulated value: {e}")))?,
            );
        }

        self.icap_headers.insert(
            http::header::DATE,
            HeaderValue::from_str(&http_date())
                .map_err(|e| Error::header(format!("date value: {e}")))?,
        );
        if !self.icap_headers.contains_key("istag") {
            self.icap_headers.insert(
                http::header::HeaderName::from_static("istag"),
                HeaderValue::from_str(istag())
                    .map_err(|e| Error::header(format!("istag value: {e}")))?,
            );
        }
        if !self.icap_headers.contains_key("server") {
            self.icap_headers.insert(
                http::header::SERVER,
                HeaderValue::from_str(&format!("icap-adapt/{VERSION}"))
                    .map_err(|e| Error::header(format!("server value: {e}")))?,
            );
        }

        let mut icap_block = String::new();
        let _ = write!(&mut icap_block, "{version} {code} {reason}{CRLF}");
        for (name, value) in self.icap_headers.iter() {
            let _ = write!(
                &mut icap_block,
                "{}: {}{CRLF}",
                canon_header(name.as_str()),
                value.to_str().unwrap_or_default()
            );
        }
        icap_block.push_str(CRLF);

        trace!(id = %self.id, code, has_body, "response headers serialized");
        self.out.extend_from_slice(icap_block.as_bytes());
        self.out.extend_from_slice(http_block.as_bytes());
        Ok(())
    }

    /// Answer `204 No Content`: the original message passes unchanged.
    pub fn allow_unchanged(&mut self) -> IcapResult<()> {
        if !self.allow_unchanged_allowed {
            return Err(Error::protocol("204 no longer allowed on this exchange"));
        }
        self.set_status(204);
        self.http_line = None;
        self.write_headers(false)?;
        self.end();
        Ok(())
    }

    /// Ask the client for the rest of the message after a preview.
    pub fn continue_preview(&mut self) {
        self.allow_unchanged_allowed = false;
        self.out
            .extend_from_slice(format!("{ICAP_VERSION} 100 Continue{CRLF}{CRLF}").as_bytes());
    }

    /// Stream one body chunk (`Some`) or terminate the body (`None`).
    pub fn write(&mut self, data: Option<&[u8]>) -> IcapResult<()> {
        match data {
            Some(chunk) => self.write_chunk(chunk),
            None => self.finish_body(),
        }
        Ok(())
    }

    /// Stage a single payload, flushed (through the filter path) when
    /// the response ends.
    pub fn send(&mut self, data: Vec<u8>) {
        self.send_data = Some(data);
    }

    /// Close the response. Idempotent; flushes any staged payload.
    pub fn end(&mut self) {
        if self.done {
            return;
        }
        if let Some(data) = self.send_data.take() {
            self.write_chunk(&data);
            self.finish_body();
        }
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Drain everything serialized so far.
    pub(crate) fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub(crate) fn mark_done(&mut self) {
        self.done = true;
    }

    /// Whether middleware (or the error path) already chose a status.
    pub(crate) fn status_set(&self) -> bool {
        self.icap_status.is_some()
    }

    fn write_chunk(&mut self, data: &[u8]) {
        if let Some(buffer) = &mut self.buffer {
            buffer.extend_from_slice(data);
            return;
        }
        for piece in data.chunks(self.chunk_size) {
            self.write_framed(piece);
        }
    }

    /// Frame one chunk, after the per-chunk filter. A filter returning
    /// `None` emits nothing for this piece.
    fn write_framed(&mut self, piece: &[u8]) {
        let owned;
        let payload: &[u8] = match &mut self.filter {
            Some(filter) => match filter(piece) {
                Some(replaced) => {
                    owned = replaced;
                    &owned
                }
                None => return,
            },
            None => piece,
        };
        frame_into(&mut self.out, payload);
    }

    fn finish_body(&mut self) {
        if let (Some(mut filter), Some(buffer)) = (self.filter.take(), self.buffer.take()) {
            if let Some(data) = filter(&buffer) {
                // filter already ran over the whole payload
                for piece in data.chunks(self.chunk_size) {
                    frame_into(&mut self.out, piece);
                }
            }
        }
        self.out.extend_from_slice(b"0\r\n\r\n");
    }
}

/// Emit one chunk frame: hex size line, payload, CRLF.
fn frame_into(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(format!("{:x}{CRLF}", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(CRLF.as_bytes());
}

/// Canonical wire casing for a lowercased header name.
fn canon_header(name: &str) -> Cow<'_, str> {
    match name {
        "istag" => Cow::Borrowed("ISTag"),
        "encapsulated" => Cow::Borrowed("Encapsulated"),
        "methods" => Cow::Borrowed("Methods"),
        "service" => Cow::Borrowed("Service"),
        "service-id" => Cow::Borrowed("Service-ID"),
        "max-connections" => Cow::Borrowed("Max-Connections"),
        "options-ttl" => Cow::Borrowed("Options-TTL"),
        "preview" => Cow::Borrowed("Preview"),
        "allow" => Cow::Borrowed("Allow"),
        "transfer-preview" => Cow::Borrowed("Transfer-Preview"),
        "transfer-ignore" => Cow::Borrowed("Transfer-Ignore"),
        "transfer-complete" => Cow::Borrowed("Transfer-Complete"),
        "date" => Cow::Borrowed("Date"),
        "server" => Cow::Borrowed("Server"),
        "connection" => Cow::Borrowed("Connection"),
        "content-length" => Cow::Borrowed("Content-Length"),
        "content-type" => Cow::Borrowed("Content-Type"),
        _ => {
            let mut out = String::with_capacity(name.len());
            for (i, seg) in name.split('-').enumerate() {
                if i > 0 {
                    out.push('-');
                }
                let mut chars = seg.chars();
                if let Some(c0) = chars.next() {
                    out.extend(c0.to_uppercase());
                    out.extend(chars.flat_map(|c| c.to_lowercase()));
                }
            }
            Cow::Owned(out)
        }
    }
}
