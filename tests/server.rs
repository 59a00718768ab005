use std::net::SocketAddr;
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue};
use icap_adapt::{
    Flow, HttpRequest, HttpResponse, IcapRequest, IcapResponse, IcapResult, Server,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn serve_options<'a>(
    _req: &'a mut IcapRequest,
    res: &'a mut IcapResponse,
) -> BoxFuture<'a, IcapResult<Flow>> {
    Box::pin(async move {
        res.set_status(200);
        res.add_icap_header(
            HeaderName::from_static("methods"),
            HeaderValue::from_static("REQMOD, RESPMOD"),
        );
        res.add_icap_header(
            HeaderName::from_static("preview"),
            HeaderValue::from_static("128"),
        );
        res.write_headers(false)?;
        res.end();
        Ok(Flow::Break)
    })
}

fn echo_request<'a>(
    icap_req: &'a mut IcapRequest,
    icap_res: &'a mut IcapResponse,
    http_req: &'a mut HttpRequest,
    _http_res: &'a mut HttpResponse,
) -> BoxFuture<'a, IcapResult<Flow>> {
    Box::pin(async move {
        if icap_req.has_preview() {
            icap_res.allow_unchanged()?;
            return Ok(Flow::Break);
        }
        icap_res.set_status(200);
        icap_res.relay_http_request(http_req);
        if icap_req.has_body() {
            icap_res.write_headers(true)?;
            icap_req.pipe_to_response();
        } else {
            icap_res.write_headers(false)?;
            icap_res.end();
        }
        Ok(Flow::Break)
    })
}

async fn start_server() -> SocketAddr {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = Server::builder()
        .bind("127.0.0.1:0")
        .options("*", serve_options)
        .request("*", echo_request)
        .build()
        .await
        .expect("server build");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Read until `stop` says the accumulated response is complete.
async fn read_response<F>(stream: &mut TcpStream, stop: F) -> Vec<u8>
where
    F: Fn(&[u8]) -> bool,
{
    let mut resp = Vec::new();
    let _ = tokio::time::timeout(Duration::from_millis(500), async {
        let mut tmp = [0u8; 8192];
        loop {
            match stream.read(&mut tmp).await {
                Ok(0) => break,
                Ok(n) => {
                    resp.extend_from_slice(&tmp[..n]);
                    if stop(&resp) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
    .await;
    resp
}

fn has_double_crlf(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn options_roundtrip_over_tcp() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let req = format!("OPTIONS icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\n\r\n");
    stream.write_all(req.as_bytes()).await.expect("write");

    let resp = read_response(&mut stream, has_double_crlf).await;
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("ICAP/1.0 200 OK\r\n"), "{text}");
    assert!(text.contains("Methods: REQMOD, RESPMOD"), "{text}");
    assert!(text.contains("Preview: 128"), "{text}");
    assert!(text.contains("ISTag: "), "{text}");
}

#[tokio::test]
async fn reqmod_echoes_headers_and_body() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let http_head = "POST /upload HTTP/1.1\r\nHost: www.origin.test\r\n\r\n";
    let req = format!(
        "REQMOD icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\n\
         Encapsulated: req-hdr=0, req-body={}\r\n\r\n\
         {http_head}7\r\nposting\r\n0\r\n\r\n",
        http_head.len()
    );
    stream.write_all(req.as_bytes()).await.expect("write");

    let resp = read_response(&mut stream, |buf| buf.ends_with(b"0\r\n\r\n")).await;
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("ICAP/1.0 200 OK\r\n"), "{text}");
    assert!(text.contains("POST /upload HTTP/1.1\r\n"), "{text}");
    assert!(text.ends_with("7\r\nposting\r\n0\r\n\r\n"), "{text}");
}

#[tokio::test]
async fn preview_gets_204_and_no_body_is_sent() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let http_head = "POST /upload HTTP/1.1\r\nHost: www.origin.test\r\n\r\n";
    let req = format!(
        "REQMOD icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\n\
         Encapsulated: req-hdr=0, req-body={}\r\n\
         Preview: 4\r\nAllow: 204\r\n\r\n\
         {http_head}4\r\npost\r\n0\r\n\r\n",
        http_head.len()
    );
    stream.write_all(req.as_bytes()).await.expect("write");

    let resp = read_response(&mut stream, has_double_crlf).await;
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("ICAP/1.0 204 No Content\r\n"), "{text}");
    assert!(!text.contains("Encapsulated"), "{text}");
}

#[tokio::test]
async fn pipelined_requests_on_one_connection() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.expect("connect");

    let one = format!("OPTIONS icap://{addr}/scan ICAP/1.0\r\nHost: {addr}\r\n\r\n");
    let both = format!("{one}{one}");
    stream.write_all(both.as_bytes()).await.expect("write");

    let resp = read_response(&mut stream, |buf| {
        buf.windows(4).filter(|w| w == b"\r\n\r\n").count() >= 2
    })
    .await;
    let text = String::from_utf8_lossy(&resp);
    assert_eq!(text.matches("ICAP/1.0 200 OK\r\n").count(), 2, "{text}");
}
