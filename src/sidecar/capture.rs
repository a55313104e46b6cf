use super::{decode_params, spawn_workers, LogSink, Sidecar};
use crate::config::SidecarConfig;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// Serializes whole API conversations — request, response, rule binding —
/// and ships them to an HTTP collector or a log sink. Content-type
/// regexes on both sides gate what gets captured.
pub struct CaptureSidecar {
    tx: mpsc::Sender<Arc<ApiWrapper>>,
    block: bool,
    drop_on_overflow: bool,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    uri: String,
    request_content_type_regexp: String,
    response_content_type_regexp: String,
    headers: HashMap<String, String>,
    timeout: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            uri: String::new(),
            request_content_type_regexp: String::new(),
            response_content_type_regexp: String::new(),
            headers: HashMap::new(),
            timeout: "5s".to_string(),
        }
    }
}

fn compile_gate(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .with_context(|| format!("invalid capture content-type regex {pattern:?}"))
}

fn content_type_matches(gate: &Option<Regex>, content_type: &str) -> bool {
    gate.as_ref()
        .map(|rx| rx.is_match(content_type))
        .unwrap_or(true)
}

/// The `{request, response, definition, meta}` conversation record.
fn capture_message(wrapper: &ApiWrapper) -> serde_json::Value {
    let request_body = wrapper
        .request
        .body
        .bytes()
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default();
    let response = wrapper.response.as_ref();
    let response_body = response
        .and_then(|r| r.body.bytes())
        .map(|b| String::from_utf8_lossy(b).to_string())
        .unwrap_or_default();
    let definition = wrapper
        .rule
        .as_ref()
        .map(|rule| {
            serde_json::json!({
                "origin": rule.origin,
                "pattern": rule.pattern_source,
            })
        })
        .unwrap_or_else(|| serde_json::json!({}));

    serde_json::json!({
        "request": {
            "ip": wrapper.real_ip,
            "body": request_body,
            "url": wrapper.request.url.as_str(),
            "size": request_body.len(),
            "method": wrapper.request.method.as_str(),
            "headers": headers_map(&wrapper.request.headers),
        },
        "response": {
            "body": response_body,
            "status": response.map(|r| r.status.as_u16()).unwrap_or_default(),
            "size": response_body.len(),
            "headers": response
                .map(|r| headers_map(&r.headers))
                .unwrap_or_default(),
        },
        "definition": definition,
        "meta": {},
    })
}

fn headers_map(headers: &http::HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::json!([String::from_utf8_lossy(value.as_bytes())]),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

fn is_http(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}

impl CaptureSidecar {
    pub fn from_config(
        config: &SidecarConfig,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: Params = decode_params(&config.params)?;
        let scope = template::config_scope(variables);
        let uri = template::render(&params.uri, &scope)?;
        let request_gate = compile_gate(&params.request_content_type_regexp)?;
        let response_gate = compile_gate(&params.response_content_type_regexp)?;
        let timeout = humantime::parse_duration(&params.timeout).unwrap_or_else(|_| {
            error!(
                "capture: invalid timeout {:?}, defaulting to 5s",
                params.timeout
            );
            Duration::from_secs(5)
        });

        let destination = if is_http(&uri) {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("could not build capture HTTP client")?;
            Destination::Http {
                client,
                uri: uri.clone(),
                headers: params.headers.clone(),
            }
        } else {
            Destination::Log(LogSink::from_path(&uri)?)
        };

        let (tx, rx) = mpsc::channel(config.queue.max(1));
        spawn_workers(rx, config.workers, move |wrapper| {
            let destination = destination.clone();
            let request_gate = request_gate.clone();
            let response_gate = response_gate.clone();
            async move {
                let request_ct = wrapper
                    .request
                    .headers
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                let response_ct = wrapper
                    .response
                    .as_ref()
                    .and_then(|r| r.headers.get(http::header::CONTENT_TYPE))
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if !content_type_matches(&request_gate, request_ct)
                    || !content_type_matches(&response_gate, response_ct)
                {
                    return;
                }
                destination.ship(capture_message(&wrapper)).await;
            }
        });

        Ok(Self {
            tx,
            block: config.block,
            drop_on_overflow: config.drop_on_overflow,
            activate_on_tags: config.activate_on_tags.clone(),
        })
    }
}

#[derive(Clone)]
enum Destination {
    Http {
        client: reqwest::Client,
        uri: String,
        headers: HashMap<String, String>,
    },
    Log(LogSink),
}

impl Destination {
    async fn ship(&self, message: serde_json::Value) {
        match self {
            Destination::Http {
                client,
                uri,
                headers,
            } => {
                let mut request = client.post(uri).json(&message);
                for (name, value) in headers {
                    request = request.header(name, value);
                }
                match request.send().await {
                    Ok(response) if response.status().as_u16() >= 400 => {
                        error!(
                            "capture: collector answered {}, uri={}",
                            response.status(),
                            uri
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("capture: delivery failed, uri={}, error={}", uri, e);
                    }
                }
            }
            Destination::Log(sink) => {
                sink.write("capture", message);
            }
        }
    }
}

impl Sidecar for CaptureSidecar {
    fn channel(&self) -> &mpsc::Sender<Arc<ApiWrapper>> {
        &self.tx
    }

    fn should_block(&self) -> bool {
        self.block
    }

    fn should_drop_on_overflow(&self) -> bool {
        self.drop_on_overflow
    }

    fn should_expand_request(&self) -> bool {
        true
    }

    fn should_expand_response(&self) -> bool {
        true
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::{test_wrapper, ApiResponse, BodySlot};
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    #[test]
    fn test_content_type_gates() {
        let gate = compile_gate("application/json").unwrap();
        assert!(content_type_matches(&gate, "application/json; charset=utf-8"));
        assert!(!content_type_matches(&gate, "text/html"));
        assert!(content_type_matches(&None, "anything"));
    }

    #[test]
    fn test_capture_message_shape() {
        let mut wrapper = test_wrapper();
        wrapper.request.body = BodySlot::Buffered(Bytes::from_static(b"ping"));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let mut response = ApiResponse::from_parts(
            StatusCode::OK,
            headers,
            BodySlot::Buffered(Bytes::from_static(b"pong")),
        );
        response.parsed_body = None;
        wrapper.response = Some(response);

        let message = capture_message(&wrapper);
        assert_eq!(message["request"]["body"], "ping");
        assert_eq!(message["request"]["size"], 4);
        assert_eq!(message["response"]["status"], 200);
        assert_eq!(message["response"]["body"], "pong");
        assert!(message["meta"].as_object().unwrap().is_empty());
    }
}
