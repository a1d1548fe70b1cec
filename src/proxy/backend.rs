// src/proxy/backend.rs
use super::proxy::ProxyError;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Body, Client, Request, Response, Uri};
use hyper_tls::HttpsConnector;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use url::Url;

/// Headers that are connection-scoped and must not be forwarded upstream.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// One upstream target: its address, a liveness flag, and the client used to
/// forward requests to it.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    alive: RwLock<bool>,
    client: Client<HttpsConnector<HttpConnector>, Body>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
}

impl Backend {
    pub fn new(url: Url) -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, Body>(https);

        Self {
            url,
            alive: RwLock::new(true),
            client,
            last_health_check: RwLock::new(None),
        }
    }

    /// Canonical string form of the target; the key `mark_backend_status`
    /// matches against.
    pub fn address(&self) -> &str {
        self.url.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn is_alive(&self) -> bool {
        *self.alive.read().await
    }

    pub async fn set_alive(&self, alive: bool) {
        *self.alive.write().await = alive;
    }

    /// Liveness update from a health probe; also stamps the probe time.
    pub async fn record_health_check(&self, alive: bool) {
        self.set_alive(alive).await;
        *self.last_health_check.write().await = Some(Utc::now());
    }

    pub async fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.read().await
    }

    /// Forward one request to this backend. Exactly one forward: retries and
    /// liveness demotion belong to the caller.
    pub async fn serve(
        &self,
        parts: &Parts,
        body: Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let request = self.upstream_request(parts, body, client_addr)?;

        self.client
            .request(request)
            .await
            .map_err(|source| ProxyError::Forward {
                backend: self.address().to_string(),
                source,
            })
    }

    fn upstream_request(
        &self,
        parts: &Parts,
        body: Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Result<Request<Body>, ProxyError> {
        let uri = self.upstream_uri(&parts.uri)?;

        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(Body::from(body))
            .map_err(|err| ProxyError::InvalidRequest(err.to_string()))?;

        let headers = request.headers_mut();
        for (name, value) in &parts.headers {
            if name == &hyper::header::HOST || is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(addr) = client_addr {
            let forwarded = match parts.headers.get(X_FORWARDED_FOR).map(HeaderValue::to_str) {
                Some(Ok(prior)) => format!("{}, {}", prior, addr.ip()),
                _ => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
            }
        }

        Ok(request)
    }

    /// Rebase the inbound path and query onto this backend's target.
    fn upstream_uri(&self, inbound: &Uri) -> Result<Uri, ProxyError> {
        let mut target = self.url.clone();
        target.set_path(inbound.path());
        target.set_query(inbound.query());

        target
            .as_str()
            .parse()
            .map_err(|err: hyper::http::uri::InvalidUri| ProxyError::InvalidRequest(err.to_string()))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}
