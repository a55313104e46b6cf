use super::{status_response, Transformer};
use crate::error::GatewayError;
use crate::openapi::ParamLocation;
use crate::wrapper::{ApiWrapper, BoxBody};
use async_trait::async_trait;
use http::StatusCode;

/// Validates a request against the rule's bound OpenAPI document: the
/// operation must exist and its required parameters and body must be
/// present. Any failure surfaces as `validation_error: <detail>`.
pub struct OpenApiValidatorTransformer {
    activate_on_tags: Vec<String>,
}

impl OpenApiValidatorTransformer {
    pub fn new(activate_on_tags: Vec<String>) -> Self {
        Self { activate_on_tags }
    }
}

#[async_trait]
impl Transformer for OpenApiValidatorTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let router = wrapper
            .rule
            .as_ref()
            .and_then(|rule| rule.openapi.clone())
            .ok_or_else(|| {
                GatewayError::Validation("rule has no OpenAPI binding".to_string())
            })?;

        let path = wrapper.request.url.path().to_string();
        let method = wrapper.request.method.as_str();
        let operation = router.find(method, &path).ok_or_else(|| {
            GatewayError::Validation(format!("no operation for {method} {path}"))
        })?;

        for param in &operation.required_params {
            let present = match param.location {
                // Path params are guaranteed by the operation regex.
                ParamLocation::Path => true,
                ParamLocation::Query => wrapper
                    .request
                    .url
                    .query_pairs()
                    .any(|(k, _)| k == param.name.as_str()),
                ParamLocation::Header => wrapper.request.headers.contains_key(&param.name),
            };
            if !present {
                return Err(GatewayError::Validation(format!(
                    "missing required parameter {}",
                    param.name
                )));
            }
        }

        if operation.body_required {
            let has_body = wrapper
                .request
                .body
                .bytes()
                .map(|b| !b.is_empty())
                .unwrap_or(false)
                || wrapper
                    .request
                    .headers
                    .get(http::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|len| len > 0)
                    .unwrap_or(false);
            if !has_body {
                return Err(GatewayError::Validation(
                    "missing required request body".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::Validation(_))
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::BAD_REQUEST)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
