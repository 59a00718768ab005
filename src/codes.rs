//! Static status-code lookup table.
//!
//! ICAP reuses the HTTP status-code space (RFC 3507 §4.3.3), plus the
//! ICAP-specific meanings of 100 (continue after preview) and 204 (no
//! modifications needed). Read-only after startup; responses take their
//! reason phrase from here.

/// Look up `(reason, description)` for a status code.
pub fn lookup(code: u16) -> Option<(&'static str, &'static str)> {
    let entry = match code {
        100 => ("Continue", "Request received, please continue"),
        101 => (
            "Switching Protocols",
            "Switching to new protocol; obey Upgrade header",
        ),

        200 => ("OK", "Request fulfilled, document follows"),
        201 => ("Created", "Document created, URL follows"),
        202 => ("Accepted", "Request accepted, processing continues off-line"),
        203 => ("Non-Authoritative Information", "Request fulfilled from cache"),
        204 => ("No Content", "Request fulfilled, nothing follows"),
        205 => ("Reset Content", "Clear input form for further input."),
        206 => ("Partial Content", "Partial content follows."),

        300 => ("Multiple Choices", "Object has several resources -- see URI list"),
        301 => ("Moved Permanently", "Object moved permanently -- see URI list"),
        302 => ("Found", "Object moved temporarily -- see URI list"),
        303 => ("See Other", "Object moved -- see Method and URL list"),
        304 => ("Not Modified", "Document has not changed since given time"),
        305 => (
            "Use Proxy",
            "You must use proxy specified in Location to access this resource.",
        ),
        307 => ("Temporary Redirect", "Object moved temporarily -- see URI list"),

        400 => ("Bad Request", "Bad request syntax or unsupported method"),
        401 => ("Unauthorized", "No permission -- see authorization schemes"),
        403 => ("Forbidden", "Request forbidden -- authorization will not help"),
        404 => ("Not Found", "Nothing matches the given URI"),
        405 => (
            "Method Not Allowed",
            "Specified method is invalid for this resource.",
        ),
        407 => (
            "Proxy Authentication Required",
            "You must authenticate with this proxy before proceeding.",
        ),
        408 => ("Request Timeout", "Request timed out; try again later."),
        409 => ("Conflict", "Request conflict."),
        411 => ("Length Required", "Client must specify Content-Length."),
        413 => ("Request Entity Too Large", "Entity is too large."),
        414 => ("Request-URI Too Long", "URI is too long."),
        418 => ("I'm a teapot", "The HTCPCP server is a teapot"),

        500 => ("Internal Server Error", "Server got itself in trouble"),
        501 => ("Not Implemented", "Server does not support this operation"),
        502 => ("Bad Gateway", "Invalid responses from another server/proxy."),
        503 => (
            "Service Unavailable",
            "The server cannot process the request due to a high load",
        ),
        504 => (
            "Gateway Timeout",
            "The gateway server did not receive a timely response",
        ),
        505 => ("HTTP Version Not Supported", "Cannot fulfill request."),

        _ => return None,
    };
    Some(entry)
}

/// Reason phrase for a status code, with a neutral fallback for codes
/// outside the table.
pub fn reason_phrase(code: u16) -> &'static str {
    lookup(code).map(|(reason, _)| reason).unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100, "Continue")]
    #[case(200, "OK")]
    #[case(204, "No Content")]
    #[case(405, "Method Not Allowed")]
    #[case(500, "Internal Server Error")]
    fn known_reason_phrases(#[case] code: u16, #[case] reason: &str) {
        assert_eq!(reason_phrase(code), reason);
    }

    #[test]
    fn unknown_code_falls_back() {
        assert!(lookup(299).is_none());
        assert_eq!(reason_phrase(299), "Unknown");
    }
}
