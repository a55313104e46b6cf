pub mod realip;

use crate::error::GatewayError;
use crate::rules::Rule;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Storage for a request or response body.
///
/// Bodies start out as the transport's stream and stay that way unless a
/// pipeline stage declares it needs the bytes. Expansion reads the stream
/// to completion and replaces it with an in-memory buffer, so every
/// downstream consumer (including the origin round-trip) still sees the
/// full body.
#[derive(Default, Debug)]
pub enum BodySlot {
    Stream(Incoming),
    Buffered(Bytes),
    #[default]
    Empty,
}

impl BodySlot {
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            BodySlot::Buffered(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self, BodySlot::Buffered(_))
    }

    /// Materialize the body. Idempotent: a buffered body stays as-is.
    /// When `gunzip` is set the buffered bytes are decompressed; if the
    /// gzip stream turns out to be broken the raw bytes are kept.
    pub async fn expand(&mut self, gunzip: bool) -> Result<(), GatewayError> {
        if let BodySlot::Stream(_) = self {
            let body = std::mem::take(self);
            let BodySlot::Stream(stream) = body else {
                unreachable!()
            };
            let bytes = stream
                .collect()
                .await
                .map_err(|e| GatewayError::Internal(format!("body read failed: {e}")))?
                .to_bytes();
            let bytes = if gunzip { try_gunzip(bytes) } else { bytes };
            *self = BodySlot::Buffered(bytes);
        }
        Ok(())
    }

    /// Copy for a sidecar clone: buffered bytes are shared cheaply, a
    /// stream cannot be duplicated and becomes empty.
    pub fn snapshot(&self) -> BodySlot {
        match self {
            BodySlot::Buffered(b) => BodySlot::Buffered(b.clone()),
            _ => BodySlot::Empty,
        }
    }

    pub fn into_box_body(self) -> BoxBody {
        match self {
            BodySlot::Stream(stream) => stream.boxed(),
            BodySlot::Buffered(bytes) => full_body(bytes),
            BodySlot::Empty => empty_body(),
        }
    }
}

fn try_gunzip(bytes: Bytes) -> Bytes {
    let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => Bytes::from(out),
        Err(e) => {
            warn!("wrapper: gzip decode failed, keeping raw body, error={}", e);
            bytes
        }
    }
}

fn indicates_gzip(headers: &HeaderMap) -> bool {
    for name in ["content-encoding", "transfer-encoding"] {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if v.contains("gzip") {
                return true;
            }
        }
    }
    false
}

/// The inbound request half of the wrapper.
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL. Starts as the downstream URL and is rewritten to the
    /// origin by the engine before the trip.
    pub url: Url,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BodySlot,
    /// JSON-decoded expanded body, populated by the parser transformer.
    pub parsed_body: Option<serde_json::Value>,
    /// Variables captured from `{var}` pattern segments.
    pub path_params: HashMap<String, String>,
    pub remote_addr: SocketAddr,
    /// Present while the connection can still be upgraded (websocket).
    pub on_upgrade: Option<hyper::upgrade::OnUpgrade>,
}

/// The upstream response half, attached after the trip.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodySlot,
    pub parsed_body: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: BodySlot) -> Self {
        Self {
            status,
            headers,
            body,
            parsed_body: None,
        }
    }
}

/// Per-request stopwatch: the transaction plus both transformation phases.
#[derive(Clone, Copy, Debug)]
pub struct ApiMetrics {
    pub transaction_start: Instant,
    pub transaction_end: Option<Instant>,
    pub req_trans_start: Option<Instant>,
    pub req_trans_end: Option<Instant>,
    pub res_trans_start: Option<Instant>,
    pub res_trans_end: Option<Instant>,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self {
            transaction_start: Instant::now(),
            transaction_end: None,
            req_trans_start: None,
            req_trans_end: None,
            res_trans_start: None,
            res_trans_end: None,
        }
    }

    pub fn transaction(&self) -> Duration {
        self.transaction_end
            .map(|end| end.duration_since(self.transaction_start))
            .unwrap_or_default()
    }

    pub fn req_transformation(&self) -> Duration {
        span(self.req_trans_start, self.req_trans_end)
    }

    pub fn res_transformation(&self) -> Duration {
        span(self.res_trans_start, self.res_trans_end)
    }
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn span(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(s), Some(e)) => e.duration_since(s),
        _ => Duration::ZERO,
    }
}

/// The per-request envelope carried through every pipeline stage.
///
/// Owned by the request task; sidecars receive read-only snapshots. The
/// bound rule is shared, everything mutable is copied into the snapshot.
pub struct ApiWrapper {
    pub id: Uuid,
    pub rule: Option<Arc<Rule>>,
    pub request: ApiRequest,
    pub response: Option<ApiResponse>,
    pub claims: Option<serde_json::Map<String, serde_json::Value>>,
    pub username: Option<String>,
    /// Ordered tags appended by tag transformers; request-pipeline tags
    /// gate later stages via `has_tag`.
    pub tags: Vec<String>,
    pub real_ip: String,
    /// Headers staged during request processing, applied to the response
    /// after the trip.
    pub apply_headers: HeaderMap,
    /// First non-retriable failure from the request pipeline; the
    /// transport propagates it instead of dialing the origin.
    pub err: Option<GatewayError>,
    /// A tripper took ownership of the underlying connection; no further
    /// response writes are permitted.
    pub hijacked: bool,
    pub metrics: ApiMetrics,
    pub variables: Arc<HashMap<String, String>>,
}

impl ApiWrapper {
    /// Build the envelope for an inbound request bound to `rule`.
    pub fn new(
        req: hyper::Request<Incoming>,
        rule: Arc<Rule>,
        remote_addr: SocketAddr,
        variables: Arc<HashMap<String, String>>,
        path_params: HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<hyper::upgrade::OnUpgrade>();

        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let url = Url::parse(&format!("http://{host}{path_and_query}"))
            .map_err(|e| GatewayError::Internal(format!("bad request url: {e}")))?;

        let username = parse_basic_auth_username(&parts.headers);
        let real_ip = realip::resolve(&parts.headers, remote_addr);

        Ok(Self {
            id: Uuid::new_v4(),
            rule: Some(rule),
            request: ApiRequest {
                method: parts.method,
                url,
                version: parts.version,
                headers: parts.headers,
                body: BodySlot::Stream(body),
                parsed_body: None,
                path_params,
                remote_addr,
                on_upgrade,
            },
            response: None,
            claims: None,
            username,
            tags: Vec::new(),
            real_ip,
            apply_headers: HeaderMap::new(),
            err: None,
            hijacked: false,
            metrics: ApiMetrics::new(),
            variables,
        })
    }

    /// `has_tag(∅)` is true — an empty activation set means "always".
    pub fn has_tag(&self, set: &[String]) -> bool {
        set.is_empty() || set.iter().any(|t| self.tags.contains(t))
    }

    /// Materialize the request body. Idempotent.
    pub async fn expand_request(&mut self) -> Result<(), GatewayError> {
        let gunzip = indicates_gzip(&self.request.headers);
        self.request.body.expand(gunzip).await
    }

    /// Materialize the response body. Idempotent. A gzip decode failure
    /// falls back to the raw bytes.
    pub async fn expand_response(&mut self) -> Result<(), GatewayError> {
        if let Some(response) = self.response.as_mut() {
            let gunzip = indicates_gzip(&response.headers);
            response.body.expand(gunzip).await?;
        }
        Ok(())
    }

    /// Read-only copy handed to sidecars. Shares the rule and variables,
    /// deep-copies headers and tag/claim state, and snapshots bodies
    /// (streams cannot be duplicated and come through empty — sidecars
    /// that need bodies declare it so expansion happens first).
    pub fn snapshot(&self) -> ApiWrapper {
        ApiWrapper {
            id: self.id,
            rule: self.rule.clone(),
            request: ApiRequest {
                method: self.request.method.clone(),
                url: self.request.url.clone(),
                version: self.request.version,
                headers: self.request.headers.clone(),
                body: self.request.body.snapshot(),
                parsed_body: self.request.parsed_body.clone(),
                path_params: self.request.path_params.clone(),
                remote_addr: self.request.remote_addr,
                on_upgrade: None,
            },
            response: self.response.as_ref().map(|r| ApiResponse {
                status: r.status,
                headers: r.headers.clone(),
                body: r.body.snapshot(),
                parsed_body: r.parsed_body.clone(),
            }),
            claims: self.claims.clone(),
            username: self.username.clone(),
            tags: self.tags.clone(),
            real_ip: self.real_ip.clone(),
            apply_headers: self.apply_headers.clone(),
            err: None,
            hijacked: self.hijacked,
            metrics: self.metrics,
            variables: self.variables.clone(),
        }
    }

    /// Template scope over the wrapper surface, used by every transformer
    /// that renders config strings at request time.
    pub fn scope(&self) -> minijinja::value::Value {
        let request_body = self
            .request
            .body
            .bytes()
            .map(|b| String::from_utf8_lossy(b).to_string());
        let response = self.response.as_ref().map(|r| {
            serde_json::json!({
                "status": r.status.as_u16(),
                "headers": headers_to_json(&r.headers),
                "body": r.body.bytes().map(|b| String::from_utf8_lossy(b).to_string()),
            })
        });
        minijinja::value::Value::from_serialize(&serde_json::json!({
            "id": self.id.to_string(),
            "username": self.username,
            "claims": self.claims,
            "tags": self.tags,
            "realIP": self.real_ip,
            "variables": self.variables.as_ref(),
            "request": {
                "method": self.request.method.as_str(),
                "url": self.request.url.as_str(),
                "path": self.request.url.path(),
                "query": self.request.url.query(),
                "headers": headers_to_json(&self.request.headers),
                "params": self.request.path_params,
                "body": request_body,
            },
            "response": response,
        }))
    }
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).to_string()),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

/// Pull the username out of a `Basic` authorization header, if present.
pub fn parse_basic_auth(headers: &HeaderMap, header_name: &str) -> Option<(String, String)> {
    let value = headers.get(header_name)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn parse_basic_auth_username(headers: &HeaderMap) -> Option<String> {
    parse_basic_auth(headers, "authorization").map(|(user, _)| user)
}

/// Bare wrapper for unit tests across the crate.
#[cfg(test)]
pub fn test_wrapper() -> ApiWrapper {
    ApiWrapper {
        id: Uuid::new_v4(),
        rule: None,
        request: ApiRequest {
            method: Method::GET,
            url: Url::parse("http://localhost:9001/todo/1").unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: BodySlot::Empty,
            parsed_body: None,
            path_params: HashMap::new(),
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
            on_upgrade: None,
        },
        response: None,
        claims: None,
        username: None,
        tags: Vec::new(),
        real_ip: "127.0.0.1".to_string(),
        apply_headers: HeaderMap::new(),
        err: None,
        hijacked: false,
        metrics: ApiMetrics::new(),
        variables: Arc::new(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_tag_empty_set_always_matches() {
        let wrapper = test_wrapper();
        assert!(wrapper.has_tag(&[]));
    }

    #[test]
    fn test_has_tag_intersection() {
        let mut wrapper = test_wrapper();
        wrapper.tags.push("beta".to_string());
        assert!(wrapper.has_tag(&["beta".to_string(), "other".to_string()]));
        assert!(!wrapper.has_tag(&["gamma".to_string()]));
    }

    #[test]
    fn test_metrics_durations_non_negative() {
        let mut m = ApiMetrics::new();
        m.req_trans_start = Some(Instant::now());
        m.req_trans_end = Some(Instant::now());
        m.transaction_end = Some(Instant::now());
        assert!(m.transaction() >= Duration::ZERO);
        assert!(m.req_transformation() >= Duration::ZERO);
        assert_eq!(m.res_transformation(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_body_expand_idempotent() {
        let mut slot = BodySlot::Buffered(Bytes::from_static(b"payload"));
        slot.expand(false).await.unwrap();
        slot.expand(false).await.unwrap();
        assert_eq!(slot.bytes().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn test_gunzip_round_trip_and_fallback() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());
        assert_eq!(try_gunzip(compressed).as_ref(), b"hello gzip");

        // Broken stream keeps the raw bytes.
        let raw = Bytes::from_static(b"definitely not gzip");
        assert_eq!(try_gunzip(raw.clone()), raw);
    }

    #[test]
    fn test_parse_basic_auth() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
        let (user, pass) = parse_basic_auth(&headers, "authorization").unwrap();
        assert_eq!(user, "foo");
        assert_eq!(pass, "bar");
    }

    #[test]
    fn test_snapshot_shares_rule_and_copies_tags() {
        let mut wrapper = test_wrapper();
        wrapper.tags.push("keep".to_string());
        let snap = wrapper.snapshot();
        assert_eq!(snap.tags, vec!["keep".to_string()]);
        assert_eq!(snap.id, wrapper.id);
    }
}
