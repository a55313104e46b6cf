use super::{decode_params, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// Appends templated strings to the wrapper's tag list. Tags gate later
/// stages (`activateOnTags`), so this is the branching primitive of a
/// pipeline. Empty renderings and the legacy `<no value>` sentinel are
/// skipped rather than recorded.
pub struct TagTransformer {
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    tags: Vec<String>,
}

impl TagTransformer {
    pub fn from_params(params: &serde_yaml::Value) -> Result<Self> {
        let params: Params = decode_params(params)?;
        Ok(Self { tags: params.tags })
    }
}

#[async_trait]
impl Transformer for TagTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let scope = wrapper.scope();
        for tag in &self.tags {
            let value = template::render(tag, &scope)
                .map_err(|e| GatewayError::Internal(format!("tag template failed: {e}")))?;
            if !value.is_empty() && value != "<no value>" {
                wrapper.tags.push(value);
            }
        }
        Ok(())
    }

    fn is_active(&self, _wrapper: &ApiWrapper) -> bool {
        true
    }
}
