//! TCP server driving one protocol handler per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::error::IcapResult;
use crate::handler::Handler;
use crate::http::{HttpRequest, HttpResponse};
use crate::request::{IcapRequest, MimeSniffer};
use crate::response::IcapResponse;
use crate::router::{DomainPattern, Flow, PathPattern, Router};
use crate::{Error, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};

/// Per-connection knobs shared by every handler.
pub(crate) struct Config {
    pub(crate) chunk_size: usize,
    pub(crate) sniffer: Option<MimeSniffer>,
}

/// An ICAP server bound to a local address.
///
/// Configure routes through [`Server::builder`], then call
/// [`run`](Server::run) to accept connections until the task is
/// dropped or the listener fails.
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    config: Arc<Config>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn local_addr(&self) -> IcapResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each connection gets its own handler task.
    pub async fn run(self) -> IcapResult<()> {
        let mut conn_id: u64 = 0;
        loop {
            let (stream, addr) = self.listener.accept().await?;
            conn_id += 1;
            let router = Arc::clone(&self.router);
            let config = Arc::clone(&self.config);
            tokio::spawn(drive_connection(stream, addr, conn_id, router, config));
        }
    }
}

async fn drive_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    router: Arc<Router>,
    config: Arc<Config>,
) {
    debug!(client = %addr, conn = conn_id, "client connected");
    let mut handler = Handler::new(conn_id, router, config);
    let mut tmp = [0u8; 8192];
    loop {
        let n = match stream.read(&mut tmp).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                handler.abort();
                error!(client = %addr, error = %e, "socket read failed");
                break;
            }
        };
        if let Err(e) = handler.on_data(&tmp[..n]).await {
            handler.on_error(&e).await;
            let out = handler.take_output();
            if !out.is_empty() {
                let _ = stream.write_all(&out).await;
            }
            // framing is unreliable after a protocol error
            break;
        }
        let out = handler.take_output();
        if !out.is_empty() {
            if let Err(e) = stream.write_all(&out).await {
                handler.abort();
                error!(client = %addr, error = %e, "socket write failed");
                break;
            }
        }
    }
    debug!(client = %addr, conn = conn_id, "client disconnected");
}

/// Builder for [`Server`]: bind address, per-connection knobs and the
/// middleware chains.
pub struct ServerBuilder {
    addr: String,
    chunk_size: usize,
    sniffer: Option<MimeSniffer>,
    router: Router,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            sniffer: None,
            router: Router::default(),
        }
    }

    /// Address to listen on. Defaults to `127.0.0.1:1344`.
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Size at which outbound body writes are split into chunk frames.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Install a content-type detector for preview bytes, exposed to
    /// middleware through `IcapRequest::preview_mime`.
    pub fn mime_sniffer<F>(mut self, sniffer: F) -> Self
    where
        F: Fn(&[u8]) -> IcapResult<String> + Send + Sync + 'static,
    {
        self.sniffer = Some(Arc::new(sniffer));
        self
    }

    /// Register an `OPTIONS` handler for service paths matching
    /// `path` (`"*"` for all; otherwise an anchored regex).
    pub fn options<P, F>(mut self, path: P, handler: F) -> Self
    where
        P: Into<PathPattern>,
        F: for<'a> Fn(
                &'a mut IcapRequest,
                &'a mut IcapResponse,
            ) -> BoxFuture<'a, IcapResult<Flow>>
            + Send
            + Sync
            + 'static,
    {
        self.router.add_options(path.into(), Arc::new(handler));
        self
    }

    /// Register a `REQMOD` handler for hosts matching `domain`.
    pub fn request<D, F>(mut self, domain: D, handler: F) -> Self
    where
        D: Into<DomainPattern>,
        F: for<'a> Fn(
                &'a mut IcapRequest,
                &'a mut IcapResponse,
                &'a mut HttpRequest,
                &'a mut HttpResponse,
            ) -> BoxFuture<'a, IcapResult<Flow>>
            + Send
            + Sync
            + 'static,
    {
        self.router.add_request(domain.into(), Arc::new(handler));
        self
    }

    /// Register a `RESPMOD` handler for hosts matching `domain`.
    pub fn response<D, F>(mut self, domain: D, handler: F) -> Self
    where
        D: Into<DomainPattern>,
        F: for<'a> Fn(
                &'a mut IcapRequest,
                &'a mut IcapResponse,
                &'a mut HttpRequest,
                &'a mut HttpResponse,
            ) -> BoxFuture<'a, IcapResult<Flow>>
            + Send
            + Sync
            + 'static,
    {
        self.router.add_response(domain.into(), Arc::new(handler));
        self
    }

    /// Register an error handler, run when parsing or middleware fails.
    pub fn error<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(
                &'a Error,
                &'a mut IcapRequest,
                &'a mut IcapResponse,
            ) -> BoxFuture<'a, IcapResult<Flow>>
            + Send
            + Sync
            + 'static,
    {
        self.router.add_error(Arc::new(handler));
        self
    }

    /// Bind the listener.
    pub async fn build(self) -> IcapResult<Server> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %listener.local_addr()?, "icap server listening");
        Ok(Server {
            listener,
            router: Arc::new(self.router),
            config: Arc::new(Config {
                chunk_size: self.chunk_size,
                sniffer: self.sniffer,
            }),
        })
    }
}
