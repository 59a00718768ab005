//! Middleware registration and dispatch.
//!
//! Three ordered chains mirror the ICAP methods: `OPTIONS` handlers are
//! filtered by service path, `REQMOD`/`RESPMOD` handlers by the host of
//! the embedded HTTP request, and a separate chain handles errors.
//! Within a chain, handlers run in registration order until one returns
//! [`Flow::Break`] or closes the response.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use regex::Regex;
use tracing::{error, info};

use crate::domain::DomainList;
use crate::error::{Error, IcapResult};
use crate::http::{HttpRequest, HttpResponse};
use crate::request::IcapRequest;
use crate::response::IcapResponse;

/// What a handler wants done with the rest of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Try the next matching handler.
    Next,
    /// This handler owns the transaction; skip the rest of the chain.
    Break,
}

pub(crate) type OptionsHandler = Arc<
    dyn for<'a> Fn(
            &'a mut IcapRequest,
            &'a mut IcapResponse,
        ) -> BoxFuture<'a, IcapResult<Flow>>
        + Send
        + Sync,
>;

pub(crate) type ModHandler = Arc<
    dyn for<'a> Fn(
            &'a mut IcapRequest,
            &'a mut IcapResponse,
            &'a mut HttpRequest,
            &'a mut HttpResponse,
        ) -> BoxFuture<'a, IcapResult<Flow>>
        + Send
        + Sync,
>;

pub(crate) type ErrorHandler = Arc<
    dyn for<'a> Fn(
            &'a Error,
            &'a mut IcapRequest,
            &'a mut IcapResponse,
        ) -> BoxFuture<'a, IcapResult<Flow>>
        + Send
        + Sync,
>;

/// Host filter for a `REQMOD`/`RESPMOD` handler.
pub enum DomainPattern {
    /// Match every host.
    Any,
    /// Match one domain (or wildcard domain, with a leading dot).
    Single(String),
    /// Match against a prebuilt list.
    List(DomainList),
}

impl From<&str> for DomainPattern {
    fn from(domain: &str) -> Self {
        if domain.is_empty() || domain == "*" {
            DomainPattern::Any
        } else {
            DomainPattern::Single(domain.to_string())
        }
    }
}

impl From<String> for DomainPattern {
    fn from(domain: String) -> Self {
        DomainPattern::from(domain.as_str())
    }
}

impl From<DomainList> for DomainPattern {
    fn from(list: DomainList) -> Self {
        DomainPattern::List(list)
    }
}

impl DomainPattern {
    fn compile(self) -> Option<Mutex<DomainList>> {
        match self {
            DomainPattern::Any => None,
            DomainPattern::Single(domain) => {
                let mut list = DomainList::new();
                list.add(&domain);
                Some(Mutex::new(list))
            }
            DomainPattern::List(list) => Some(Mutex::new(list)),
        }
    }
}

/// Service-path filter for an `OPTIONS` handler.
pub enum PathPattern {
    /// Match every service path.
    Any,
    /// Anchored regular expression over the path.
    Regex(Regex),
}

impl From<&str> for PathPattern {
    /// Panics on an invalid pattern; route registration happens at
    /// startup where a bad pattern is a programming error.
    fn from(path: &str) -> Self {
        if path.is_empty() || path == "*" {
            PathPattern::Any
        } else {
            match Regex::new(&format!("^{path}$")) {
                Ok(re) => PathPattern::Regex(re),
                Err(e) => panic!("invalid options path pattern {path:?}: {e}"),
            }
        }
    }
}

impl From<Regex> for PathPattern {
    fn from(re: Regex) -> Self {
        PathPattern::Regex(re)
    }
}

impl PathPattern {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Regex(re) => re.is_match(path),
        }
    }
}

/// The registered handler chains, shared across connections.
#[derive(Default)]
pub(crate) struct Router {
    options: Vec<(PathPattern, OptionsHandler)>,
    requests: Vec<(Option<Mutex<DomainList>>, ModHandler)>,
    responses: Vec<(Option<Mutex<DomainList>>, ModHandler)>,
    errors: Vec<ErrorHandler>,
}

fn host_matches(filter: &Option<Mutex<DomainList>>, host: &str) -> bool {
    match filter {
        None => true,
        Some(list) => list
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(host),
    }
}

impl Router {
    pub(crate) fn add_options(&mut self, path: PathPattern, handler: OptionsHandler) {
        self.options.push((path, handler));
    }

    pub(crate) fn add_request(&mut self, domain: DomainPattern, handler: ModHandler) {
        self.requests.push((domain.compile(), handler));
    }

    pub(crate) fn add_response(&mut self, domain: DomainPattern, handler: ModHandler) {
        self.responses.push((domain.compile(), handler));
    }

    pub(crate) fn add_error(&mut self, handler: ErrorHandler) {
        self.errors.push(handler);
    }

    pub(crate) async fn dispatch_options(
        &self,
        req: &mut IcapRequest,
        res: &mut IcapResponse,
    ) -> IcapResult<()> {
        let path = req.parsed_uri.path.clone();
        for (pattern, handler) in &self.options {
            if res.is_done() {
                break;
            }
            if !pattern.matches(&path) {
                continue;
            }
            if handler(req, res).await? == Flow::Break {
                break;
            }
        }
        info!(id = %req.id, path = %path, "OPTIONS served");
        Ok(())
    }

    pub(crate) async fn dispatch_request(
        &self,
        req: &mut IcapRequest,
        res: &mut IcapResponse,
        http_req: &mut HttpRequest,
        http_res: &mut HttpResponse,
    ) -> IcapResult<()> {
        let host = http_req.parsed_uri.host.clone();
        for (filter, handler) in &self.requests {
            if res.is_done() {
                break;
            }
            if !host_matches(filter, &host) {
                continue;
            }
            if handler(req, res, http_req, http_res).await? == Flow::Break {
                break;
            }
        }
        info!(id = %req.id, line = %http_req.line, "REQMOD served");
        Ok(())
    }

    pub(crate) async fn dispatch_response(
        &self,
        req: &mut IcapRequest,
        res: &mut IcapResponse,
        http_req: &mut HttpRequest,
        http_res: &mut HttpResponse,
    ) -> IcapResult<()> {
        // RESPMOD routes on the request the response answers.
        let host = http_req.parsed_uri.host.clone();
        for (filter, handler) in &self.responses {
            if res.is_done() {
                break;
            }
            if !host_matches(filter, &host) {
                continue;
            }
            if handler(req, res, http_req, http_res).await? == Flow::Break {
                break;
            }
        }
        info!(id = %req.id, line = %http_req.line, status = http_res.code, "RESPMOD served");
        Ok(())
    }

    /// Run the error chain. Failures inside an error handler are logged
    /// and terminate the chain; the caller still closes the response.
    pub(crate) async fn dispatch_error(
        &self,
        err: &Error,
        req: &mut IcapRequest,
        res: &mut IcapResponse,
    ) {
        for handler in &self.errors {
            if res.is_done() {
                break;
            }
            match handler(err, req, res).await {
                Ok(Flow::Next) => {}
                Ok(Flow::Break) => break,
                Err(nested) => {
                    error!(id = %req.id, error = %nested, "error handler failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_CHUNK_SIZE;

    fn parts() -> (IcapRequest, IcapResponse, HttpRequest, HttpResponse) {
        (
            IcapRequest::new("test:1:1".into(), None),
            IcapResponse::new("test:1:1".into(), DEFAULT_CHUNK_SIZE),
            HttpRequest::default(),
            HttpResponse::default(),
        )
    }

    fn tag(res: &mut IcapResponse, value: &'static str) {
        res.add_icap_header(
            http::header::HeaderName::from_static("x-seen"),
            http::header::HeaderValue::from_static(value),
        );
    }

    fn tag_first<'a>(
        _req: &'a mut IcapRequest,
        res: &'a mut IcapResponse,
        _http_req: &'a mut HttpRequest,
        _http_res: &'a mut HttpResponse,
    ) -> BoxFuture<'a, IcapResult<Flow>> {
        Box::pin(async move {
            tag(res, "first");
            Ok(Flow::Next)
        })
    }

    fn tag_second<'a>(
        _req: &'a mut IcapRequest,
        res: &'a mut IcapResponse,
        _http_req: &'a mut HttpRequest,
        _http_res: &'a mut HttpResponse,
    ) -> BoxFuture<'a, IcapResult<Flow>> {
        Box::pin(async move {
            tag(res, "second");
            Ok(Flow::Next)
        })
    }

    fn break_now<'a>(
        _req: &'a mut IcapRequest,
        _res: &'a mut IcapResponse,
        _http_req: &'a mut HttpRequest,
        _http_res: &'a mut HttpResponse,
    ) -> BoxFuture<'a, IcapResult<Flow>> {
        Box::pin(async move { Ok(Flow::Break) })
    }

    fn close_response<'a>(
        _req: &'a mut IcapRequest,
        res: &'a mut IcapResponse,
        _http_req: &'a mut HttpRequest,
        _http_res: &'a mut HttpResponse,
    ) -> BoxFuture<'a, IcapResult<Flow>> {
        Box::pin(async move {
            res.allow_unchanged()?;
            Ok(Flow::Next)
        })
    }

    fn options_ok<'a>(
        _req: &'a mut IcapRequest,
        res: &'a mut IcapResponse,
    ) -> BoxFuture<'a, IcapResult<Flow>> {
        Box::pin(async move {
            res.set_status(200);
            Ok(Flow::Break)
        })
    }

    fn seen(res: &IcapResponse) -> Vec<&str> {
        res.icap_headers
            .get_all("x-seen")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn request_chain_runs_in_registration_order() {
        let mut router = Router::default();
        router.add_request(DomainPattern::Any, Arc::new(tag_first));
        router.add_request(DomainPattern::Any, Arc::new(tag_second));

        let (mut req, mut res, mut http_req, mut http_res) = parts();
        http_req.parsed_uri.host = "example.com".into();
        router
            .dispatch_request(&mut req, &mut res, &mut http_req, &mut http_res)
            .await
            .unwrap();
        assert_eq!(seen(&res), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn domain_filter_skips_non_matching_handlers() {
        let mut router = Router::default();
        router.add_request("other.net".into(), Arc::new(tag_first));
        router.add_request(".example.com".into(), Arc::new(tag_second));

        let (mut req, mut res, mut http_req, mut http_res) = parts();
        http_req.parsed_uri.host = "www.example.com".into();
        router
            .dispatch_request(&mut req, &mut res, &mut http_req, &mut http_res)
            .await
            .unwrap();
        assert_eq!(seen(&res), vec!["second"]);
    }

    #[tokio::test]
    async fn break_stops_the_chain() {
        let mut router = Router::default();
        router.add_request(DomainPattern::Any, Arc::new(break_now));
        router.add_request(DomainPattern::Any, Arc::new(tag_first));

        let (mut req, mut res, mut http_req, mut http_res) = parts();
        router
            .dispatch_request(&mut req, &mut res, &mut http_req, &mut http_res)
            .await
            .unwrap();
        assert!(seen(&res).is_empty());
    }

    #[tokio::test]
    async fn closed_response_stops_the_chain() {
        let mut router = Router::default();
        router.add_request(DomainPattern::Any, Arc::new(close_response));
        router.add_request(DomainPattern::Any, Arc::new(tag_first));

        let (mut req, mut res, mut http_req, mut http_res) = parts();
        router
            .dispatch_request(&mut req, &mut res, &mut http_req, &mut http_res)
            .await
            .unwrap();
        assert!(seen(&res).is_empty());
    }

    #[tokio::test]
    async fn options_path_filter() {
        let mut router = Router::default();
        router.add_options("/virus_scan".into(), Arc::new(options_ok));

        let (mut req, mut res, _, _) = parts();
        req.parsed_uri.path = "/other".into();
        router.dispatch_options(&mut req, &mut res).await.unwrap();
        let out = res.take_output();
        assert!(out.is_empty());

        req.parsed_uri.path = "/virus_scan".into();
        router.dispatch_options(&mut req, &mut res).await.unwrap();
        res.write_headers(false).unwrap();
        assert!(res.take_output().starts_with(b"ICAP/1.0 200 OK\r\n"));
    }
}
