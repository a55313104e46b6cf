pub mod db;
pub mod file;
pub mod ws;

use crate::config::{self, UpstreamConfig};
use crate::error::GatewayError;
use crate::wrapper::{ApiResponse, ApiWrapper, BodySlot, BoxBody};
use anyhow::Result;
use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING};
use http::HeaderMap;
use hyper::Request;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// The shared upstream side of the gateway: one pooled HTTP client for
/// every route, plus the knobs non-HTTP trippers need.
#[derive(Clone)]
pub struct Transport {
    client: HttpClient,
    pub upstream_timeout: Duration,
}

/// What a trip produced: an upstream response to run the response
/// pipeline over, or a protocol-switch response for a connection the
/// tripper now owns.
#[derive(Debug)]
pub enum TripOutcome {
    Response(ApiResponse),
    Hijacked(hyper::Response<BoxBody>),
}

/// Build the single shared transport from `network.upstream`.
///
/// Plain `http://` goes through the inner connector, `https://` is
/// terminated with rustls (webpki roots, ALPN http1/http2). The connect
/// timeout bounds dial plus TLS handshake.
pub fn build_transport(cfg: &UpstreamConfig) -> Result<Transport> {
    let timeout = config::parse_duration(&cfg.timeout)?;
    let keep_alive = config::parse_duration(&cfg.keep_alive)?;
    let idle_timeout = config::parse_duration(&cfg.idle_connection_timeout)?;
    // Parsed for config validation; hyper's client handles 100-continue
    // negotiation on its own.
    let _expect_continue = config::parse_duration(&cfg.expect_continue_timeout)?;

    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(keep_alive));
    http.set_connect_timeout(Some(timeout));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(idle_timeout)
        .pool_max_idle_per_host(cfg.max_idle_connections)
        .build(https);

    Ok(Transport {
        client,
        upstream_timeout: timeout,
    })
}

/// Deliver the wrapped request to its origin.
///
/// Order of business: a pipeline failure stored on the wrapper
/// propagates before anything is dialed; a request with no bound rule is
/// `no_mapping`; otherwise the origin scheme selects the tripper.
pub async fn trip(transport: &Transport, wrapper: &mut ApiWrapper) -> Result<TripOutcome, GatewayError> {
    if let Some(err) = wrapper.err.take() {
        return Err(err);
    }
    if wrapper.rule.is_none() {
        return Err(GatewayError::NoMapping);
    }

    match wrapper.request.url.scheme() {
        "http" | "https" => http_trip(transport, wrapper).await.map(TripOutcome::Response),
        "file" => file::trip(wrapper).map(TripOutcome::Response),
        "postgres" | "mysql" => db::trip(wrapper).await.map(TripOutcome::Response),
        "ws" | "wss" => ws::trip(transport, wrapper).await.map(TripOutcome::Hijacked),
        "none" => Ok(TripOutcome::Response(ApiResponse::from_parts(
            http::StatusCode::OK,
            HeaderMap::new(),
            BodySlot::Empty,
        ))),
        other => Err(GatewayError::Upstream(format!(
            "unsupported origin scheme {other}"
        ))),
    }
}

async fn http_trip(
    transport: &Transport,
    wrapper: &mut ApiWrapper,
) -> Result<ApiResponse, GatewayError> {
    let uri: http::Uri = wrapper
        .request
        .url
        .as_str()
        .parse()
        .map_err(|e| GatewayError::Internal(format!("rewritten url is not a uri: {e}")))?;

    let mut headers = wrapper.request.headers.clone();
    remove_hop_headers(&mut headers);
    // The client derives Host from the rewritten URI.
    headers.remove(HOST);

    let body = std::mem::take(&mut wrapper.request.body);
    let mut builder = Request::builder()
        .method(wrapper.request.method.clone())
        .uri(uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(body.into_box_body())
        .map_err(|e| GatewayError::Internal(format!("could not build upstream request: {e}")))?;

    let response = transport
        .client
        .request(request)
        .await
        .map_err(|e| GatewayError::Upstream(e.to_string()))?;

    let (parts, body) = response.into_parts();
    Ok(ApiResponse::from_parts(
        parts.status,
        parts.headers,
        BodySlot::Stream(body),
    ))
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in hop_headers {
        headers.remove(h);
    }
}
