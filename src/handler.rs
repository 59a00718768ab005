//! Per-connection protocol state machine.
//!
//! The handler is sans-io: the connection driver feeds it raw bytes and
//! drains serialized output after every step. Input accumulates in one
//! buffer with a read cursor; each state either consumes a complete
//! element and moves on, or leaves the cursor where it is and waits for
//! more bytes. Pipelined requests are handled by resetting transaction
//! state and re-entering the loop on the same buffer.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::{debug, error};

use crate::error::{Error, IcapResult};
use crate::http::{HttpRequest, HttpResponse};
use crate::parser::wire::{self, ChunkFrame};
use crate::parser::{parse_encapsulated, Section};
use crate::request::IcapRequest;
use crate::response::IcapResponse;
use crate::router::Router;
use crate::server::Config;
use crate::MAX_HDR_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    IcapMethod,
    IcapHeaders,
    RequestHeader,
    ResponseHeader,
    Preview,
    Body,
}

/// The four mutable objects middleware sees, reborrowed field-disjoint
/// so body payloads can keep borrowing the input buffer.
struct Transaction {
    icap_req: IcapRequest,
    icap_res: IcapResponse,
    http_req: HttpRequest,
    http_res: HttpResponse,
}

impl Transaction {
    fn new(id: String, config: &Config) -> Self {
        Transaction {
            icap_req: IcapRequest::new(id.clone(), config.sniffer.clone()),
            icap_res: IcapResponse::new(id, config.chunk_size),
            http_req: HttpRequest::default(),
            http_res: HttpResponse::default(),
        }
    }
}

pub(crate) struct Handler {
    router: Arc<Router>,
    config: Arc<Config>,
    buffer: BytesMut,
    /// Read cursor into `buffer`.
    pos: usize,
    /// Offset of the encapsulated payload, right after the ICAP headers.
    body_start: usize,
    /// Don't run the current state until the buffer reaches this length.
    wait_offset: usize,
    state: State,
    preview_buffer: Option<Vec<u8>>,
    parse_preview: bool,
    conn_id: u64,
    txn_seq: u64,
    txn: Transaction,
    /// Output from finished transactions not yet drained by the driver.
    out: Vec<u8>,
}

impl Handler {
    pub(crate) fn new(conn_id: u64, router: Arc<Router>, config: Arc<Config>) -> Self {
        let id = transaction_id(conn_id, 0);
        let txn = Transaction::new(id, &config);
        Handler {
            router,
            config,
            buffer: BytesMut::new(),
            pos: 0,
            body_start: 0,
            wait_offset: 0,
            state: State::IcapMethod,
            preview_buffer: None,
            parse_preview: false,
            conn_id,
            txn_seq: 0,
            txn,
            out: Vec::new(),
        }
    }

    /// Feed inbound bytes and run the state machine as far as it goes.
    pub(crate) async fn on_data(&mut self, data: &[u8]) -> IcapResult<()> {
        self.buffer.extend_from_slice(data);
        self.advance().await
    }

    async fn advance(&mut self) -> IcapResult<()> {
        loop {
            if self.txn.icap_res.is_done() {
                self.reset();
                continue;
            }
            if self.buffer.len() < self.wait_offset {
                return Ok(());
            }
            let progressed = match self.state {
                State::IcapMethod => self.st_icap_method()?,
                State::IcapHeaders => self.st_icap_headers().await?,
                State::RequestHeader => self.st_request_header().await?,
                State::ResponseHeader => self.st_response_header().await?,
                State::Preview => self.st_preview().await?,
                State::Body => self.st_body()?,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Run the error chain, then make sure something goes on the wire
    /// if middleware produced nothing.
    pub(crate) async fn on_error(&mut self, err: &Error) {
        error!(id = %self.txn.icap_req.id, error = %err, "transaction failed");
        let router = Arc::clone(&self.router);
        let Transaction { icap_req, icap_res, .. } = &mut self.txn;
        router.dispatch_error(err, icap_req, icap_res).await;
        if !icap_res.is_done() {
            if !icap_res.status_set() {
                icap_res.set_status(err.status().unwrap_or(500));
                if let Err(write_err) = icap_res.write_headers(false) {
                    error!(id = %icap_res.id, error = %write_err, "error response failed");
                }
            }
            icap_res.end();
        }
    }

    /// The peer is gone; stop error handlers from writing further.
    pub(crate) fn abort(&mut self) {
        self.txn.icap_res.mark_done();
    }

    /// Drain serialized output, both from finished transactions and the
    /// one in flight.
    pub(crate) fn take_output(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.out);
        out.extend(self.txn.icap_res.take_output());
        out
    }

    fn st_icap_method(&mut self) -> IcapResult<bool> {
        let Some(line) = wire::read_method_line(&self.buffer, self.pos)? else {
            if self.buffer.len() - self.pos > MAX_HDR_BYTES {
                return Err(Error::protocol_status(413, "icap request line too large"));
            }
            return Ok(false);
        };
        self.pos = line.next;
        debug!(id = %self.txn.icap_req.id, line = %line.line, "icap request line");
        self.txn.icap_req.set_method(line);
        self.state = State::IcapHeaders;
        Ok(true)
    }

    async fn st_icap_headers(&mut self) -> IcapResult<bool> {
        let Some((headers, next)) = wire::read_headers(&self.buffer, self.pos)? else {
            if self.buffer.len() - self.pos > MAX_HDR_BYTES {
                return Err(Error::protocol_status(413, "icap header block too large"));
            }
            return Ok(false);
        };
        self.pos = next;
        self.body_start = next;
        self.txn.icap_req.headers = headers;

        match self.txn.icap_req.method.as_str() {
            "OPTIONS" => {
                let router = Arc::clone(&self.router);
                let Transaction { icap_req, icap_res, .. } = &mut self.txn;
                router.dispatch_options(icap_req, icap_res).await?;
                self.reset();
                Ok(true)
            }
            "REQMOD" | "RESPMOD" => {
                let method = self.txn.icap_req.method.clone();
                let value = self
                    .txn
                    .icap_req
                    .headers
                    .get("encapsulated")
                    .ok_or_else(|| {
                        Error::protocol(format!("missing encapsulated header for {method}"))
                    })?
                    .to_str()
                    .map_err(|e| Error::header(format!("encapsulated header: {e}")))?;
                let sections = parse_encapsulated(value)?;
                self.txn.icap_req.set_encapsulated(sections);
                if self.txn.icap_req.has_preview_body() {
                    self.parse_preview = true;
                }
                self.dispatch_encapsulated()?;
                Ok(true)
            }
            other => Err(Error::protocol_status(
                405,
                format!("unsupported icap method {other:?}"),
            )),
        }
    }

    /// Consume the next encapsulated section and set up the state that
    /// parses it.
    fn dispatch_encapsulated(&mut self) -> IcapResult<()> {
        let Some((section, _)) = self.txn.icap_req.encapsulated.pop_front() else {
            return Err(Error::protocol("no encapsulated section to parse"));
        };
        match section {
            Section::ReqHdr | Section::ResHdr => {
                let Some(&(_, next_offset)) = self.txn.icap_req.encapsulated.front() else {
                    return Err(Error::protocol(format!(
                        "no body offset after {}",
                        section.as_str()
                    )));
                };
                self.state = if section == Section::ReqHdr {
                    State::RequestHeader
                } else {
                    State::ResponseHeader
                };
                // the whole header part is buffered once the following
                // section's offset is reachable
                self.wait_offset = self.body_start + next_offset;
            }
            Section::ReqBody | Section::ResBody => {
                if self.parse_preview {
                    // keep the section queued so has_body() stays true
                    // for middleware inspecting the request
                    self.txn.icap_req.encapsulated.push_front((section, 0));
                    self.state = State::Preview;
                } else {
                    self.state = State::Body;
                    self.wait_offset = self.body_start;
                }
            }
            Section::NullBody => {
                debug!(id = %self.txn.icap_req.id, "null body");
                let Transaction { icap_req, icap_res, .. } = &mut self.txn;
                icap_req.push(None, icap_res)?;
                self.reset();
            }
        }
        Ok(())
    }

    async fn st_request_header(&mut self) -> IcapResult<bool> {
        let Some(line) = wire::read_method_line(&self.buffer, self.pos)? else {
            return Err(Error::protocol("embedded request line not found"));
        };
        self.pos = line.next;
        let Some((headers, next)) = wire::read_headers(&self.buffer, self.pos)? else {
            return Err(Error::protocol("embedded request headers not found"));
        };
        self.pos = next;
        debug!(id = %self.txn.icap_req.id, line = %line.line, "embedded http request");
        self.txn.http_req.set_method(line);
        self.txn.http_req.set_headers(headers);

        if self.txn.icap_req.is_reqmod() && !self.parse_preview {
            let router = Arc::clone(&self.router);
            let Transaction { icap_req, icap_res, http_req, http_res } = &mut self.txn;
            router
                .dispatch_request(icap_req, icap_res, http_req, http_res)
                .await?;
        }
        self.dispatch_encapsulated()?;
        Ok(true)
    }

    async fn st_response_header(&mut self) -> IcapResult<bool> {
        let Some(line) = wire::read_status_line(&self.buffer, self.pos)? else {
            return Err(Error::protocol("embedded status line not found"));
        };
        self.pos = line.next;
        let Some((headers, next)) = wire::read_headers(&self.buffer, self.pos)? else {
            return Err(Error::protocol("embedded response headers not found"));
        };
        self.pos = next;
        debug!(id = %self.txn.icap_req.id, line = %line.line, "embedded http response");
        self.txn.http_res.set_status(line);
        self.txn.http_res.set_headers(headers);

        if self.txn.icap_req.is_respmod() && !self.parse_preview {
            let router = Arc::clone(&self.router);
            let Transaction { icap_req, icap_res, http_req, http_res } = &mut self.txn;
            router
                .dispatch_response(icap_req, icap_res, http_req, http_res)
                .await?;
        }
        self.dispatch_encapsulated()?;
        Ok(true)
    }

    /// Accumulate preview chunks; on the preview terminator, hand the
    /// transaction to middleware.
    async fn st_preview(&mut self) -> IcapResult<bool> {
        loop {
            match wire::read_chunk(&self.buffer, self.pos)? {
                None => return Ok(false),
                Some(ChunkFrame::Data { payload, next }) => {
                    self.preview_buffer
                        .get_or_insert_with(Vec::new)
                        .extend_from_slice(payload);
                    self.pos = next;
                }
                Some(ChunkFrame::End { ieof, next }) => {
                    self.pos = next;
                    let preview = self.preview_buffer.take().unwrap_or_default();
                    self.txn.icap_req.preview = Some(preview.clone());
                    self.txn.icap_req.ieof = ieof;
                    // body parsing re-delivers the preview bytes to the
                    // sink, so keep them unless the preview was empty
                    if !preview.is_empty() {
                        self.preview_buffer = Some(preview);
                    }
                    self.parse_preview = false;
                    self.state = State::Body;

                    let router = Arc::clone(&self.router);
                    let Transaction { icap_req, icap_res, http_req, http_res } = &mut self.txn;
                    if icap_req.is_reqmod() {
                        router
                            .dispatch_request(icap_req, icap_res, http_req, http_res)
                            .await?;
                    } else {
                        router
                            .dispatch_response(icap_req, icap_res, http_req, http_res)
                            .await?;
                    }
                    // with ieof no further client bytes arrive; the body
                    // state must run now to finish the transaction
                    return Ok(true);
                }
            }
        }
    }

    fn st_body(&mut self) -> IcapResult<bool> {
        if let Some(preview) = self.preview_buffer.take() {
            debug!(id = %self.txn.icap_req.id, len = preview.len(), "replaying preview to sink");
            let Transaction { icap_req, icap_res, .. } = &mut self.txn;
            icap_req.push(Some(&preview), icap_res)?;
        }
        if self.txn.icap_req.ieof {
            let Transaction { icap_req, icap_res, .. } = &mut self.txn;
            icap_req.push(None, icap_res)?;
            self.reset();
            return Ok(true);
        }
        loop {
            match wire::read_chunk(&self.buffer, self.pos)? {
                None => break,
                Some(ChunkFrame::Data { payload, next }) => {
                    let Transaction { icap_req, icap_res, .. } = &mut self.txn;
                    icap_req.push(Some(payload), icap_res)?;
                    self.pos = next;
                }
                Some(ChunkFrame::End { next, .. }) => {
                    self.pos = next;
                    let Transaction { icap_req, icap_res, .. } = &mut self.txn;
                    icap_req.push(None, icap_res)?;
                    self.reset();
                    return Ok(true);
                }
            }
        }
        // reclaim consumed bytes so a long body doesn't pin the buffer
        if self.pos != 0 {
            self.buffer.advance(self.pos);
            self.pos = 0;
            self.wait_offset = 0;
        }
        Ok(false)
    }

    /// Finish the current transaction and prepare for the next one on
    /// the same connection.
    fn reset(&mut self) {
        debug!(id = %self.txn.icap_req.id, "transaction complete");
        self.out.extend(self.txn.icap_res.take_output());
        self.buffer.advance(self.pos);
        self.pos = 0;
        self.body_start = 0;
        self.wait_offset = 0;
        self.state = State::IcapMethod;
        self.preview_buffer = None;
        self.parse_preview = false;
        self.txn_seq += 1;
        let id = transaction_id(self.conn_id, self.txn_seq);
        self.txn = Transaction::new(id, &self.config);
    }
}

fn transaction_id(conn_id: u64, seq: u64) -> String {
    format!("{}:{conn_id}:{seq}", std::process::id())
}
