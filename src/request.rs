//! Inbound ICAP transaction state exposed to middleware.

use std::collections::VecDeque;
use std::sync::Arc;

use http::header::HeaderMap;
use tracing::trace;

use crate::error::{Error, IcapResult};
use crate::http::UriParts;
use crate::parser::{Section, SectionList};
use crate::parser::wire::MethodLine;
use crate::response::IcapResponse;

/// Optional content-type detector, fed the preview bytes.
pub type MimeSniffer = Arc<dyn Fn(&[u8]) -> IcapResult<String> + Send + Sync>;

/// Receives decoded body bytes as they arrive.
///
/// `data` is called once per decoded chunk, `end` exactly once when the
/// body terminator (or `ieof`) is seen. Both get the in-flight response
/// so a sink can stream adapted output as it consumes input. A sink
/// that owns the response body must close the response from `end`,
/// otherwise the connection cannot move on to the next transaction.
pub trait BodySink: Send {
    fn data(&mut self, chunk: &[u8], res: &mut IcapResponse) -> IcapResult<()>;
    fn end(&mut self, res: &mut IcapResponse) -> IcapResult<()>;
}

pub(crate) enum Sink {
    /// Body bytes are dropped (no consumer registered).
    None,
    /// Body bytes are relayed into the response as chunk frames.
    Response,
    Custom(Box<dyn BodySink>),
}

/// A single inbound ICAP transaction.
///
/// Built up incrementally by the connection driver and handed to
/// middleware once the relevant headers are parsed. `preview` holds the
/// decoded preview bytes when the client sent one.
pub struct IcapRequest {
    pub id: String,
    pub method: String,
    pub uri: String,
    pub parsed_uri: UriParts,
    pub version: String,
    pub line: String,
    pub headers: HeaderMap,
    /// Encapsulated sections not yet consumed, in wire order.
    pub(crate) encapsulated: VecDeque<(Section, usize)>,
    pub preview: Option<Vec<u8>>,
    /// Preview carried `ieof`: the preview is the whole body.
    pub ieof: bool,
    pub(crate) done: bool,
    pub(crate) sink: Sink,
    pub(crate) sniffer: Option<MimeSniffer>,
}

impl IcapRequest {
    pub(crate) fn new(id: String, sniffer: Option<MimeSniffer>) -> Self {
        IcapRequest {
            id,
            method: String::new(),
            uri: String::new(),
            parsed_uri: UriParts::default(),
            version: String::new(),
            line: String::new(),
            headers: HeaderMap::new(),
            encapsulated: VecDeque::new(),
            preview: None,
            ieof: false,
            done: false,
            sink: Sink::None,
            sniffer,
        }
    }

    pub(crate) fn set_method(&mut self, line: MethodLine) {
        self.method = line.method;
        self.uri = line.uri;
        self.parsed_uri = line.parsed_uri;
        self.version = line.version;
        self.line = line.line;
    }

    pub(crate) fn set_encapsulated(&mut self, sections: SectionList) {
        self.encapsulated = sections.into_iter().collect();
    }

    pub fn is_reqmod(&self) -> bool {
        self.method == "REQMOD"
    }

    pub fn is_respmod(&self) -> bool {
        self.method == "RESPMOD"
    }

    pub fn is_options(&self) -> bool {
        self.method == "OPTIONS"
    }

    /// Whether the encapsulated body has been fully delivered.
    pub fn body_done(&self) -> bool {
        self.done
    }

    /// Whether the client announced a preview.
    pub fn has_preview(&self) -> bool {
        self.headers.contains_key("preview")
    }

    /// Whether an encapsulated body section follows the headers.
    pub fn has_body(&self) -> bool {
        self.encapsulated
            .back()
            .is_some_and(|(section, _)| section.is_body())
    }

    pub fn has_preview_body(&self) -> bool {
        self.has_preview() && self.has_body()
    }

    /// Run the configured sniffer over the preview bytes.
    ///
    /// `Ok(None)` when there is no preview to inspect; an error when no
    /// sniffer was installed on the server.
    pub fn preview_mime(&self) -> IcapResult<Option<String>> {
        let Some(preview) = self.preview.as_deref() else {
            return Ok(None);
        };
        let sniffer = self
            .sniffer
            .as_ref()
            .ok_or(Error::CapabilityUnavailable("mime sniffer"))?;
        sniffer(preview).map(Some)
    }

    /// Relay body bytes straight into the response as chunk frames.
    pub fn pipe_to_response(&mut self) {
        self.sink = Sink::Response;
    }

    /// Deliver body bytes to a custom sink.
    pub fn pipe_to(&mut self, sink: Box<dyn BodySink>) {
        self.sink = Sink::Custom(sink);
    }

    /// Feed one decoded chunk (`Some`) or end-of-body (`None`) to the
    /// registered sink.
    pub(crate) fn push(
        &mut self,
        data: Option<&[u8]>,
        res: &mut IcapResponse,
    ) -> IcapResult<()> {
        match (&mut self.sink, data) {
            (Sink::None, Some(chunk)) => {
                trace!(id = %self.id, len = chunk.len(), "body chunk dropped, no sink");
            }
            (Sink::None, None) => {
                self.done = true;
            }
            (Sink::Response, Some(chunk)) => res.write(Some(chunk))?,
            (Sink::Response, None) => {
                res.write(None)?;
                res.end();
                self.done = true;
            }
            (Sink::Custom(sink), Some(chunk)) => sink.data(chunk, res)?,
            (Sink::Custom(sink), None) => {
                sink.end(res)?;
                self.done = true;
            }
        }
        Ok(())
    }
}
