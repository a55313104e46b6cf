use super::{decode_params, PipelineKind, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Sets and removes headers on the request or the response. `set` values
/// are templates over the wrapper; a value that fails to render is used
/// literally.
pub struct HeaderTransformer {
    kind: PipelineKind,
    set: HashMap<String, String>,
    remove: Vec<String>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    set: HashMap<String, String>,
    remove: Vec<String>,
}

impl HeaderTransformer {
    pub fn from_params(
        kind: PipelineKind,
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        Ok(Self {
            kind,
            set: params.set,
            remove: params.remove,
            activate_on_tags,
        })
    }
}

#[async_trait]
impl Transformer for HeaderTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let scope = wrapper.scope();
        let mut rendered: Vec<(String, String)> = Vec::with_capacity(self.set.len());
        for (name, value) in &self.set {
            let value = template::render(value, &scope).unwrap_or_else(|e| {
                warn!(
                    "headers transformer: template failed, header={}, error={}",
                    name, e
                );
                value.clone()
            });
            rendered.push((name.clone(), value));
        }

        let headers = match self.kind {
            PipelineKind::Request => &mut wrapper.request.headers,
            PipelineKind::Response => match wrapper.response.as_mut() {
                Some(r) => &mut r.headers,
                None => return Ok(()),
            },
        };

        for (name, value) in rendered {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) else {
                warn!("headers transformer: invalid header, name={}", name);
                continue;
            };
            headers.insert(name, value);
        }
        for name in &self.remove {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.remove(name);
            }
        }
        Ok(())
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
