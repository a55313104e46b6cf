use super::{decode_params, status_response, PipelineKind, Transformer};
use crate::error::GatewayError;
use crate::wrapper::{ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{HeaderMap, StatusCode};
use regex::Regex;
use serde::Deserialize;

/// Policy-based denial: the request (or response) is rejected when any
/// configured regex matches a header name, a header value, a full
/// `name:value` header, or the expanded body.
pub struct BarrageTransformer {
    kind: PipelineKind,
    header_name: Option<Regex>,
    header_value: Option<Regex>,
    header: Option<Regex>,
    body: Option<Regex>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    header_name_regexp: String,
    header_value_regexp: String,
    header_regexp: String,
    body_regexp: String,
}

fn compile(pattern: &str, what: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .with_context(|| format!("invalid barrage {what} regex {pattern:?}"))
}

impl BarrageTransformer {
    pub fn from_params(
        kind: PipelineKind,
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        Ok(Self {
            kind,
            header_name: compile(&params.header_name_regexp, "header name")?,
            header_value: compile(&params.header_value_regexp, "header value")?,
            header: compile(&params.header_regexp, "header")?,
            body: compile(&params.body_regexp, "body")?,
            activate_on_tags,
        })
    }

    fn inspect(&self, headers: &HeaderMap, body: Option<&[u8]>) -> Result<(), GatewayError> {
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes());
            if let Some(rx) = &self.header {
                if rx.is_match(&format!("{}:{}", name.as_str(), value)) {
                    return Err(GatewayError::Barraged);
                }
            }
            if let Some(rx) = &self.header_name {
                if rx.is_match(name.as_str()) {
                    return Err(GatewayError::Barraged);
                }
            }
            if let Some(rx) = &self.header_value {
                if rx.is_match(&value) {
                    return Err(GatewayError::Barraged);
                }
            }
        }
        if let (Some(rx), Some(body)) = (&self.body, body) {
            if rx.is_match(&String::from_utf8_lossy(body)) {
                return Err(GatewayError::Barraged);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transformer for BarrageTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        match self.kind {
            PipelineKind::Request => self.inspect(
                &wrapper.request.headers,
                wrapper.request.body.bytes().map(|b| b.as_ref()),
            ),
            PipelineKind::Response => match wrapper.response.as_ref() {
                Some(response) => self.inspect(
                    &response.headers,
                    response.body.bytes().map(|b| b.as_ref()),
                ),
                None => Ok(()),
            },
        }
    }

    fn should_expand_request(&self) -> bool {
        self.kind == PipelineKind::Request && self.body.is_some()
    }

    fn should_expand_response(&self) -> bool {
        self.kind == PipelineKind::Response && self.body.is_some()
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::Barraged)
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::FORBIDDEN)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
