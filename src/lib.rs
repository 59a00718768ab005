//! # Embeddable ICAP server in Rust.
//!
//! ICAP (RFC 3507) lets a proxy hand HTTP requests and responses to an
//! adaptation server for inspection or modification (`REQMOD`/`RESPMOD`),
//! including the Preview sub-protocol for early accept/reject decisions.
//! This crate provides the server side:
//!
//! - An incremental, pipelining-safe protocol parser that tolerates
//!   arbitrary TCP fragmentation;
//! - Preview handling (`Preview`, `Allow: 204`, `ieof`) and chunked body
//!   streaming to application-supplied sinks;
//! - A response encoder with chunked framing and per-chunk or
//!   whole-body content filters;
//! - Ordered middleware chains for `OPTIONS` (path-filtered),
//!   `REQMOD`/`RESPMOD` (domain-filtered) and errors.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use futures::future::BoxFuture;
//! use icap_adapt::error::IcapResult;
//! use icap_adapt::{Flow, HttpRequest, HttpResponse, IcapRequest, IcapResponse, Server};
//!
//! fn pass_through<'a>(
//!     icap_req: &'a mut IcapRequest,
//!     icap_res: &'a mut IcapResponse,
//!     _http_req: &'a mut HttpRequest,
//!     _http_res: &'a mut HttpResponse,
//! ) -> BoxFuture<'a, IcapResult<Flow>> {
//!     Box::pin(async move {
//!         if icap_req.has_preview() {
//!             icap_res.allow_unchanged()?;
//!         }
//!         Ok(Flow::Break)
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> IcapResult<()> {
//!     let server = Server::builder()
//!         .bind("127.0.0.1:1344")
//!         .request("*", pass_through)
//!         .build()
//!         .await?;
//!     server.run().await
//! }
//! ```

pub mod codes;
pub mod domain;
pub mod error;
mod handler;
pub mod http;
mod parser;
pub mod request;
pub mod response;
pub mod router;
pub mod server;

pub use domain::DomainList;
pub use error::{Error, IcapResult};
pub use http::{HttpRequest, HttpResponse, Message, UriParts};
pub use request::{BodySink, IcapRequest};
pub use response::IcapResponse;
pub use router::{DomainPattern, Flow, PathPattern};
pub use server::{Server, ServerBuilder};

/// Crate version, advertised in the default `Server` header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Supported ICAP protocol version.
pub const ICAP_VERSION: &str = "ICAP/1.0";
/// Default size of outbound HTTP chunk frames.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
/// Default ICAP port per RFC 3507.
pub const DEFAULT_PORT: u16 = 1344;
/// Upper bound on a buffered-but-unparsed header block.
pub const MAX_HDR_BYTES: usize = 64 * 1024;
