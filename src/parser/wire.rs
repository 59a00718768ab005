//! Incremental wire readers.
//!
//! Every reader takes a buffer plus a start offset and either consumes a
//! complete element (returning the offset just past it), reports that
//! more bytes are needed (`Ok(None)`), or rejects input that can never
//! become valid. Readers never consume partial elements, so the caller
//! can retry the same offset after appending more data.

use http::header::HeaderMap;
use memchr::memchr;

use crate::error::{Error, IcapResult};
use crate::http::{header_pair, UriParts};

/// A complete text line, CR/LF stripped.
pub(crate) struct Line<'a> {
    pub text: &'a str,
    pub next: usize,
}

/// Read one line terminated by `\n`, tolerating a bare `\n` where
/// `\r\n` is expected.
pub(crate) fn read_line<'a>(buf: &'a [u8], start: usize) -> IcapResult<Option<Line<'a>>> {
    let Some(rel) = memchr(b'\n', &buf[start.min(buf.len())..]) else {
        return Ok(None);
    };
    let nl = start + rel;
    let end = if nl > start && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
    let text = std::str::from_utf8(&buf[start..end])
        .map_err(|_| Error::protocol("non-utf8 bytes in protocol line"))?;
    Ok(Some(Line { text, next: nl + 1 }))
}

/// A parsed request line, ICAP or embedded HTTP.
#[derive(Debug, Clone)]
pub(crate) struct MethodLine {
    pub method: String,
    pub uri: String,
    pub parsed_uri: UriParts,
    pub version: String,
    pub line: String,
    pub next: usize,
}

pub(crate) fn read_method_line(buf: &[u8], start: usize) -> IcapResult<Option<MethodLine>> {
    let Some(line) = read_line(buf, start)? else {
        return Ok(None);
    };
    let mut tokens = line.text.splitn(3, ' ');
    let (Some(method), Some(uri), Some(version)) =
        (tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(Error::protocol(format!(
            "malformed method line {:?}",
            line.text
        )));
    };
    Ok(Some(MethodLine {
        method: method.to_string(),
        uri: uri.to_string(),
        parsed_uri: UriParts::parse(uri),
        version: version.to_string(),
        line: line.text.to_string(),
        next: line.next,
    }))
}

/// A parsed HTTP status line.
#[derive(Debug, Clone)]
pub(crate) struct StatusLine {
    pub version: String,
    pub code: u16,
    pub message: String,
    pub line: String,
    pub next: usize,
}

pub(crate) fn read_status_line(buf: &[u8], start: usize) -> IcapResult<Option<StatusLine>> {
    let Some(line) = read_line(buf, start)? else {
        return Ok(None);
    };
    let mut tokens = line.text.splitn(3, ' ');
    let (Some(version), Some(code), Some(message)) =
        (tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(Error::protocol(format!(
            "malformed status line {:?}",
            line.text
        )));
    };
    // Unparseable codes degrade to 503 rather than killing the
    // transaction; the origin already answered something.
    let code = code.parse().unwrap_or(503);
    Ok(Some(StatusLine {
        version: version.to_string(),
        code,
        message: message.to_string(),
        line: line.text.to_string(),
        next: line.next,
    }))
}

/// Outcome of probing for a `\r\n` (or bare `\n`) terminator.
pub(crate) enum Terminator {
    /// Terminator present; `next` is just past it.
    Blank { next: usize },
    /// Not enough bytes to decide.
    Incomplete,
    /// The bytes at `start` are something else.
    Absent,
}

pub(crate) fn read_terminator(buf: &[u8], start: usize) -> Terminator {
    match buf.get(start) {
        None => Terminator::Incomplete,
        Some(b'\n') => Terminator::Blank { next: start + 1 },
        Some(b'\r') => match buf.get(start + 1) {
            None => Terminator::Incomplete,
            Some(b'\n') => Terminator::Blank { next: start + 2 },
            Some(_) => Terminator::Absent,
        },
        Some(_) => Terminator::Absent,
    }
}

/// One chunked-transfer frame.
pub(crate) enum ChunkFrame<'a> {
    /// A data chunk; `payload` borrows the input buffer.
    Data { payload: &'a [u8], next: usize },
    /// The zero-size terminator chunk, possibly flagged `ieof`.
    End { ieof: bool, next: usize },
}

/// Read one complete chunk frame, all or nothing.
///
/// A data frame is complete only when its payload and trailing CRLF are
/// buffered; the terminator frame is complete only with the blank line
/// after it. `ieof` in the size-line extensions marks the end of a
/// preview that is also the end of the message.
pub(crate) fn read_chunk<'a>(buf: &'a [u8], start: usize) -> IcapResult<Option<ChunkFrame<'a>>> {
    let Some(line) = read_line(buf, start)? else {
        return Ok(None);
    };
    let (size_str, ext) = match line.text.split_once(';') {
        Some((size, ext)) => (size.trim(), ext),
        None => (line.text.trim(), ""),
    };
    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::protocol(format!("bad chunk size {:?}", line.text)))?;
    let ieof = ext.split(';').any(|e| e.trim() == "ieof");

    if size == 0 {
        return match read_terminator(buf, line.next) {
            Terminator::Blank { next } => Ok(Some(ChunkFrame::End { ieof, next })),
            Terminator::Incomplete => Ok(None),
            Terminator::Absent => Err(Error::protocol("expected blank line after final chunk")),
        };
    }

    let payload_end = line
        .next
        .checked_add(size)
        .ok_or_else(|| Error::protocol(format!("bad chunk size {:?}", line.text)))?;
    if payload_end > buf.len() {
        return Ok(None);
    }
    match read_terminator(buf, payload_end) {
        Terminator::Blank { next } => Ok(Some(ChunkFrame::Data {
            payload: &buf[line.next..payload_end],
            next,
        })),
        Terminator::Incomplete => Ok(None),
        Terminator::Absent => Err(Error::protocol("missing delimiter after chunk payload")),
    }
}

/// Read a header block up to and including its blank line.
///
/// Repeated header names accumulate in order; a non-blank line without a
/// colon can never become a header, so it is rejected outright.
pub(crate) fn read_headers(buf: &[u8], start: usize) -> IcapResult<Option<(HeaderMap, usize)>> {
    let mut headers = HeaderMap::new();
    let mut pos = start;
    loop {
        let Some(line) = read_line(buf, pos)? else {
            return Ok(None);
        };
        if line.text.is_empty() {
            return Ok(Some((headers, line.next)));
        }
        let Some((name, value)) = line.text.split_once(':') else {
            return Err(Error::protocol(format!(
                "malformed header line {:?}",
                line.text
            )));
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        let (name, value) = header_pair(name, value)?;
        headers.append(name, value);
        pos = line.next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"abc\r\ndef", "abc", 5)]
    #[case(b"abc\ndef", "abc", 4)]
    #[case(b"\r\n", "", 2)]
    fn lines(#[case] buf: &[u8], #[case] text: &str, #[case] next: usize) {
        let line = read_line(buf, 0).unwrap().unwrap();
        assert_eq!(line.text, text);
        assert_eq!(line.next, next);
    }

    #[test]
    fn line_without_newline_is_incomplete() {
        assert!(read_line(b"abc", 0).unwrap().is_none());
        assert!(read_line(b"abc\r", 0).unwrap().is_none());
    }

    #[test]
    fn method_line_parses_icap_request() {
        let m = read_method_line(b"REQMOD icap://icap.test/mod ICAP/1.0\r\n", 0)
            .unwrap()
            .unwrap();
        assert_eq!(m.method, "REQMOD");
        assert_eq!(m.uri, "icap://icap.test/mod");
        assert_eq!(m.parsed_uri.host, "icap.test");
        assert_eq!(m.parsed_uri.path, "/mod");
        assert_eq!(m.version, "ICAP/1.0");
    }

    #[test]
    fn method_line_needs_three_tokens() {
        assert!(read_method_line(b"GARBAGE\r\n", 0).is_err());
        assert!(read_method_line(b"GET /\r\n", 0).is_err());
    }

    #[test]
    fn status_line_bad_code_degrades_to_503() {
        let s = read_status_line(b"HTTP/1.1 xx OK\r\n", 0).unwrap().unwrap();
        assert_eq!(s.code, 503);
        let s = read_status_line(b"HTTP/1.1 200 OK\r\n", 0).unwrap().unwrap();
        assert_eq!(s.code, 200);
        assert_eq!(s.message, "OK");
    }

    #[test]
    fn chunk_data_frame_all_or_nothing() {
        let buf = b"5\r\nhello\r\n";
        // every strict prefix is incomplete
        for cut in 0..buf.len() {
            assert!(read_chunk(&buf[..cut], 0).unwrap().is_none(), "cut {cut}");
        }
        match read_chunk(buf, 0).unwrap().unwrap() {
            ChunkFrame::Data { payload, next } => {
                assert_eq!(payload, b"hello");
                assert_eq!(next, buf.len());
            }
            ChunkFrame::End { .. } => panic!("expected data frame"),
        }
    }

    #[test]
    fn chunk_terminator_requires_blank_line() {
        assert!(read_chunk(b"0\r\n", 0).unwrap().is_none());
        match read_chunk(b"0\r\n\r\n", 0).unwrap().unwrap() {
            ChunkFrame::End { ieof, next } => {
                assert!(!ieof);
                assert_eq!(next, 5);
            }
            ChunkFrame::Data { .. } => panic!("expected end frame"),
        }
    }

    #[test]
    fn chunk_ieof_extension() {
        match read_chunk(b"0; ieof\r\n\r\n", 0).unwrap().unwrap() {
            ChunkFrame::End { ieof, .. } => assert!(ieof),
            ChunkFrame::Data { .. } => panic!("expected end frame"),
        }
    }

    #[test]
    fn chunk_bad_size_is_fatal() {
        assert!(read_chunk(b"zz\r\n", 0).is_err());
    }

    #[test]
    fn chunk_size_near_usize_max_is_rejected() {
        // offset + size must not wrap
        assert!(read_chunk(b"ffffffffffffffff\r\npayload", 0).is_err());
    }

    #[test]
    fn header_block_accumulates_repeats() {
        let buf = b"Host: example.com\r\nX-Tag: a\r\nX-Tag: b\r\n\r\nrest";
        let (headers, next) = read_headers(buf, 0).unwrap().unwrap();
        assert_eq!(headers.get("host").unwrap(), "example.com");
        let tags: Vec<_> = headers.get_all("x-tag").iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(&buf[next..], b"rest");
    }

    #[test]
    fn header_block_incomplete_without_blank_line() {
        assert!(read_headers(b"Host: example.com\r\n", 0).unwrap().is_none());
    }

    #[test]
    fn garbage_header_line_is_fatal() {
        assert!(read_headers(b"not a header\r\n\r\n", 0).is_err());
    }
}
