//! ICAP framing: the `Encapsulated` header and low-level wire readers.

use smallvec::SmallVec;

use crate::error::{Error, IcapResult};

pub(crate) mod wire;

/// One entry kind of an `Encapsulated` header (RFC 3507 §4.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Section {
    ReqHdr,
    ResHdr,
    ReqBody,
    ResBody,
    NullBody,
}

impl Section {
    fn from_token(token: &str) -> IcapResult<Self> {
        Ok(match token {
            "req-hdr" => Section::ReqHdr,
            "res-hdr" => Section::ResHdr,
            "req-body" => Section::ReqBody,
            "res-body" => Section::ResBody,
            "null-body" => Section::NullBody,
            other => {
                return Err(Error::protocol(format!(
                    "unsupported encapsulated entity {other:?}"
                )));
            }
        })
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Section::ReqHdr => "req-hdr",
            Section::ResHdr => "res-hdr",
            Section::ReqBody => "req-body",
            Section::ResBody => "res-body",
            Section::NullBody => "null-body",
        }
    }

    pub(crate) fn is_body(&self) -> bool {
        matches!(self, Section::ReqBody | Section::ResBody)
    }
}

/// Sections with their byte offsets, in header source order.
pub(crate) type SectionList = SmallVec<[(Section, usize); 4]>;

/// Parse an `Encapsulated` header value such as
/// `req-hdr=0, res-hdr=137, res-body=296`.
///
/// Offsets are relative to the start of the encapsulated payload, and
/// source order is preserved because the consumer walks the sections as
/// a queue.
pub(crate) fn parse_encapsulated(value: &str) -> IcapResult<SectionList> {
    let mut sections = SectionList::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (token, offset) = part
            .split_once('=')
            .ok_or_else(|| Error::protocol(format!("malformed encapsulated entry {part:?}")))?;
        let offset: usize = offset
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("bad encapsulated offset in {part:?}")))?;
        sections.push((Section::from_token(token.trim())?, offset));
    }
    if sections.is_empty() {
        return Err(Error::protocol("empty encapsulated header"));
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reqmod_preview_layout() {
        let sections = parse_encapsulated("req-hdr=0, req-body=412").unwrap();
        assert_eq!(
            sections.as_slice(),
            &[(Section::ReqHdr, 0), (Section::ReqBody, 412)]
        );
    }

    #[test]
    fn preserves_source_order() {
        let sections = parse_encapsulated("req-hdr=0, res-hdr=137, res-body=296").unwrap();
        assert_eq!(
            sections.as_slice(),
            &[
                (Section::ReqHdr, 0),
                (Section::ResHdr, 137),
                (Section::ResBody, 296)
            ]
        );
    }

    #[test]
    fn null_body_is_not_a_body() {
        let sections = parse_encapsulated("res-hdr=0, null-body=203").unwrap();
        assert!(!sections[1].0.is_body());
        assert!(Section::ResBody.is_body());
    }

    #[test]
    fn rejects_unknown_entity() {
        assert!(parse_encapsulated("opt-body=0").is_err());
    }

    #[test]
    fn rejects_missing_offset() {
        assert!(parse_encapsulated("req-hdr").is_err());
        assert!(parse_encapsulated("req-hdr=abc").is_err());
        assert!(parse_encapsulated("").is_err());
    }
}
