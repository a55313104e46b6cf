use super::{PipelineKind, Transformer};
use crate::error::GatewayError;
use crate::wrapper::ApiWrapper;
use async_trait::async_trait;

/// Decodes the expanded body as JSON into `parsed_body` so later stages
/// (scripts, templates) can address fields instead of raw bytes.
pub struct ParserTransformer {
    kind: PipelineKind,
    activate_on_tags: Vec<String>,
}

impl ParserTransformer {
    pub fn new(kind: PipelineKind, activate_on_tags: Vec<String>) -> Self {
        Self {
            kind,
            activate_on_tags,
        }
    }
}

#[async_trait]
impl Transformer for ParserTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        match self.kind {
            PipelineKind::Request => {
                let bytes = wrapper
                    .request
                    .body
                    .bytes()
                    .ok_or_else(|| GatewayError::Internal("request body not expanded".into()))?;
                let parsed = serde_json::from_slice(bytes)
                    .map_err(|e| GatewayError::Internal(format!("body is not JSON: {e}")))?;
                wrapper.request.parsed_body = Some(parsed);
            }
            PipelineKind::Response => {
                let Some(response) = wrapper.response.as_mut() else {
                    return Ok(());
                };
                let bytes = response
                    .body
                    .bytes()
                    .ok_or_else(|| GatewayError::Internal("response body not expanded".into()))?;
                let parsed = serde_json::from_slice(bytes)
                    .map_err(|e| GatewayError::Internal(format!("body is not JSON: {e}")))?;
                response.parsed_body = Some(parsed);
            }
        }
        Ok(())
    }

    fn should_expand_request(&self) -> bool {
        self.kind == PipelineKind::Request
    }

    fn should_expand_response(&self) -> bool {
        self.kind == PipelineKind::Response
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::{test_wrapper, BodySlot};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_parses_request_json() {
        let t = ParserTransformer::new(PipelineKind::Request, vec![]);
        let mut wrapper = test_wrapper();
        wrapper.request.body = BodySlot::Buffered(Bytes::from_static(b"{\"id\": 7}"));
        t.transform(&mut wrapper).await.unwrap();
        assert_eq!(wrapper.request.parsed_body.as_ref().unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn test_invalid_json_fails() {
        let t = ParserTransformer::new(PipelineKind::Request, vec![]);
        let mut wrapper = test_wrapper();
        wrapper.request.body = BodySlot::Buffered(Bytes::from_static(b"not json"));
        assert!(t.transform(&mut wrapper).await.is_err());
    }
}
