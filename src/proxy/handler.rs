use crate::error::GatewayError;
use crate::rules::Rule;
use crate::server::GatewayState;
use crate::transform::status_response;
use crate::tripper::{self, TripOutcome};
use crate::wrapper::{ApiWrapper, BoxBody};
use http::header::HOST;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use url::Url;

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH      — bind a rule by host + method + path
/// 2. DIRECTOR         — method gate, body expansion, request transformer
///                       chain, request sidecar fan-out, URL rewrite
/// 3. TRIP             — scheme-dispatched origin round-trip
/// 4. MODIFY_RESPONSE  — response transformer chain, staged headers,
///                       response sidecar fan-out
/// 5. LOG              — finalize metrics, access line
///
/// Any failure lands in the error handler, which lets the pipelines claim
/// the error before the built-in status table answers.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let started = Instant::now();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    // Route match
    let Some((rule, path_params)) = state.table.match_rule(&host, &method, &path) else {
        debug!("proxy: no rule bound, host={}, path={}", host, path);
        finalize(&host, &method, StatusCode::NOT_FOUND, started);
        return Ok(status_response(StatusCode::NOT_FOUND));
    };

    metrics::gauge!("gateway_http_requests_in_flight", "host" => host.clone()).increment(1.0);

    let mut wrapper = match ApiWrapper::new(
        req,
        rule.clone(),
        peer_addr,
        state.variables.clone(),
        path_params,
    ) {
        Ok(wrapper) => wrapper,
        Err(e) => {
            error!("proxy: could not build wrapper, error={}", e);
            metrics::gauge!("gateway_http_requests_in_flight", "host" => host.clone())
                .decrement(1.0);
            finalize(&host, &method, StatusCode::INTERNAL_SERVER_ERROR, started);
            return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    // Director
    phase_director(&rule, &mut wrapper).await;

    // Trip
    let outcome = tripper::trip(&state.transport, &mut wrapper).await;
    let response = match outcome {
        Ok(TripOutcome::Hijacked(response)) => {
            // The connection belongs to the tripper now; the response
            // pipeline must not touch it.
            metrics::gauge!("gateway_http_requests_in_flight", "host" => host.clone())
                .decrement(1.0);
            finalize(&host, &method, response.status(), started);
            return Ok(response);
        }
        Ok(TripOutcome::Response(api_response)) => {
            wrapper.response = Some(api_response);
            match phase_modify_response(&rule, &mut wrapper).await {
                Ok(()) => build_client_response(&mut wrapper),
                Err(e) => phase_handle_error(&wrapper, &e),
            }
        }
        Err(e) => phase_handle_error(&wrapper, &e),
    };

    metrics::gauge!("gateway_http_requests_in_flight", "host" => host.clone()).decrement(1.0);
    finalize(&host, &method, response.status(), started);
    phase_log(&wrapper, &host, response.status(), started);
    Ok(response)
}

/// Method gate, expansion, request chain, request sidecars, URL rewrite.
/// Failures are parked on `wrapper.err` for the transport to propagate,
/// so the tripper contract stays uniform.
async fn phase_director(rule: &Arc<Rule>, wrapper: &mut ApiWrapper) {
    if !rule.allowed_methods.is_empty() {
        let method = wrapper.request.method.as_str().to_ascii_uppercase();
        if !rule.allowed_methods.iter().any(|m| *m == method) {
            wrapper.err = Some(GatewayError::MethodNotAllowed);
            return;
        }
    }

    // Expand once if anything downstream — either chain, either sidecar
    // set — declares it needs the request bytes.
    let needs_request_body = rule.request.transformers.should_expand_request()
        || rule.request.sidecars.should_expand_request()
        || rule.response.transformers.should_expand_request()
        || rule.response.sidecars.should_expand_request();
    if needs_request_body {
        if let Err(e) = wrapper.expand_request().await {
            wrapper.err = Some(e);
            return;
        }
    }

    wrapper.metrics.req_trans_start = Some(Instant::now());
    let result = rule.request.transformers.transform(wrapper).await;
    wrapper.metrics.req_trans_end = Some(Instant::now());

    // Sidecars observe the transformed request — a consistent snapshot
    // taken before the wrapper moves on to the tripper.
    rule.request.sidecars.dispatch(wrapper).await;

    match result {
        Ok(()) => {
            if let Err(e) = rewrite_url(rule, wrapper) {
                wrapper.err = Some(e);
            }
        }
        Err(e) => wrapper.err = Some(e),
    }
}

/// Rewrite the wrapper URL to the origin: origin scheme/authority, origin
/// path joined with the request path minus the strip prefix. Origins that
/// are targets in themselves (file, database, null sink) are taken as-is.
fn rewrite_url(rule: &Rule, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
    let origin = Url::parse(&rule.origin)
        .map_err(|e| GatewayError::Internal(format!("rule origin is not a url: {e}")))?;
    if !matches!(origin.scheme(), "http" | "https" | "ws" | "wss") {
        wrapper.request.url = origin;
        return Ok(());
    }
    let path = wrapper.request.url.path().to_string();
    let path = if !rule.strip_prefix.is_empty() {
        path.strip_prefix(rule.strip_prefix.as_str())
            .unwrap_or(&path)
            .to_string()
    } else {
        path
    };
    let joined = join_single_slash(origin.path(), &path);

    let mut rewritten = origin;
    rewritten.set_path(&joined);
    rewritten.set_query(wrapper.request.url.query());
    wrapper.request.url = rewritten;
    Ok(())
}

fn join_single_slash(base: &str, rest: &str) -> String {
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{}{}", base, &rest[1..]),
        (false, false) if !rest.is_empty() => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, rest),
    }
}

/// Attach staged headers, run the response chain, close the stopwatch,
/// fan out the response sidecars.
async fn phase_modify_response(
    rule: &Arc<Rule>,
    wrapper: &mut ApiWrapper,
) -> Result<(), GatewayError> {
    if wrapper.hijacked {
        return Err(GatewayError::ConnectionHijacked);
    }

    let staged = std::mem::take(&mut wrapper.apply_headers);
    if let Some(response) = wrapper.response.as_mut() {
        for (name, value) in staged.iter() {
            response.headers.insert(name, value.clone());
        }
    }

    let needs_response_body = rule.response.transformers.should_expand_response()
        || rule.response.sidecars.should_expand_response();
    if needs_response_body {
        wrapper.expand_response().await?;
    }

    wrapper.metrics.res_trans_start = Some(Instant::now());
    rule.response.transformers.transform(wrapper).await?;
    wrapper.metrics.res_trans_end = Some(Instant::now());
    wrapper.metrics.transaction_end = Some(Instant::now());

    rule.response.sidecars.dispatch(wrapper).await;
    Ok(())
}

/// Error phase: the request chain gets first claim, then the response
/// chain, then the built-in sentinel table. A hijack is swallowed; an
/// unmapped failure is a 500 and counts as an internal error.
fn phase_handle_error(wrapper: &ApiWrapper, err: &GatewayError) -> Response<BoxBody> {
    if let Some(rule) = &wrapper.rule {
        if let Some(response) = rule.request.transformers.handle_error(err) {
            return response;
        }
        if let Some(response) = rule.response.transformers.handle_error(err) {
            return response;
        }
    }

    if err.is_hijack() {
        return status_response(StatusCode::OK);
    }

    match err.status() {
        Some(status) => status_response(status),
        None => {
            error!(
                "proxy: unhandled error, url={}, error={}",
                wrapper.request.url, err
            );
            crate::metrics::registry::internal_error();
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn build_client_response(wrapper: &mut ApiWrapper) -> Response<BoxBody> {
    let Some(response) = wrapper.response.take() else {
        return status_response(StatusCode::BAD_GATEWAY);
    };
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(response.body.into_box_body())
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn finalize(host: &str, method: &str, status: StatusCode, started: Instant) {
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status.as_u16());

    metrics::counter!(
        "gateway_http_requests_total",
        "host" => host.to_string(),
        "method" => method.to_string(),
        "status_code" => status_str.to_owned(),
    )
    .increment(1);

    metrics::histogram!(
        "gateway_http_request_duration_seconds",
        "host" => host.to_string(),
    )
    .record(started.elapsed().as_secs_f64());
}

/// One structured access line per request at info level.
fn phase_log(wrapper: &ApiWrapper, host: &str, status: StatusCode, started: Instant) {
    tracing::info!(
        id = %wrapper.id,
        client_ip = %wrapper.real_ip,
        method = %wrapper.request.method,
        host = %host,
        url = %wrapper.request.url,
        status = status.as_u16(),
        latency_ms = %started.elapsed().as_millis(),
        tags = ?wrapper.tags,
        "access"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_single_slash() {
        assert_eq!(join_single_slash("/base/", "/path"), "/base/path");
        assert_eq!(join_single_slash("/base", "/path"), "/base/path");
        assert_eq!(join_single_slash("/base", "path"), "/base/path");
        assert_eq!(join_single_slash("/", "/path"), "/path");
        assert_eq!(join_single_slash("/base", ""), "/base");
    }

    #[test]
    fn test_rewrite_url_strip_prefix() {
        let rule = Rule {
            host: "h".to_string(),
            pattern_source: "/foo/.*".to_string(),
            pattern: crate::rules::compile_pattern("/foo/.*").unwrap(),
            pattern_method: None,
            is_static: true,
            origin: "https://origin.example.com/base".to_string(),
            strip_prefix: "/foo".to_string(),
            allowed_methods: vec![],
            request: crate::rules::Pipeline::default(),
            response: crate::rules::Pipeline::default(),
            openapi: None,
            sql: None,
        };
        let mut wrapper = crate::wrapper::test_wrapper();
        wrapper.request.url = Url::parse("http://localhost:9001/foo/widget?x=1").unwrap();
        rewrite_url(&rule, &mut wrapper).unwrap();
        assert_eq!(
            wrapper.request.url.as_str(),
            "https://origin.example.com/base/widget?x=1"
        );
    }

    #[test]
    fn test_rewrite_url_self_contained_origin() {
        let rule = Rule {
            host: "h".to_string(),
            pattern_source: "/data".to_string(),
            pattern: crate::rules::compile_pattern("/data").unwrap(),
            pattern_method: None,
            is_static: true,
            origin: "file://etc/files/data.json".to_string(),
            strip_prefix: String::new(),
            allowed_methods: vec![],
            request: crate::rules::Pipeline::default(),
            response: crate::rules::Pipeline::default(),
            openapi: None,
            sql: None,
        };
        let mut wrapper = crate::wrapper::test_wrapper();
        wrapper.request.url = Url::parse("http://localhost:9001/data").unwrap();
        rewrite_url(&rule, &mut wrapper).unwrap();
        assert_eq!(wrapper.request.url.as_str(), "file://etc/files/data.json");
    }

    #[test]
    fn test_rewrite_url_plain_origin() {
        let rule = Rule {
            host: "h".to_string(),
            pattern_source: "/todo/.*".to_string(),
            pattern: crate::rules::compile_pattern("/todo/.*").unwrap(),
            pattern_method: None,
            is_static: true,
            origin: "http://origin.example.com".to_string(),
            strip_prefix: String::new(),
            allowed_methods: vec![],
            request: crate::rules::Pipeline::default(),
            response: crate::rules::Pipeline::default(),
            openapi: None,
            sql: None,
        };
        let mut wrapper = crate::wrapper::test_wrapper();
        wrapper.request.url = Url::parse("http://localhost:9001/todo/1").unwrap();
        rewrite_url(&rule, &mut wrapper).unwrap();
        assert_eq!(wrapper.request.url.as_str(), "http://origin.example.com/todo/1");
    }
}
