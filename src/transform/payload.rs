use super::{decode_params, PipelineKind, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::{ApiWrapper, BodySlot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Replaces the request (or response) body with a rendered template. Any
/// sibling file of the primary template is loaded as a named sub-template
/// for `{% include %}`. Responses lose their framing headers since the
/// body they described is gone.
pub struct PayloadTransformer {
    kind: PipelineKind,
    template: String,
    sub_templates: HashMap<String, String>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    template: String,
}

impl PayloadTransformer {
    pub fn from_params(
        kind: PipelineKind,
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        if params.template.is_empty() {
            anyhow::bail!("payload needs a template path");
        }
        let template_path = Path::new(&params.template);
        let template = std::fs::read_to_string(template_path)
            .with_context(|| format!("could not read template {}", params.template))?;

        let mut sub_templates = HashMap::new();
        let dir = template_path.parent().unwrap_or_else(|| Path::new("."));
        let root_name = template_path.file_name();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("could not list template dir {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || name.starts_with('.') || path.file_name() == root_name {
                continue;
            }
            let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read sub-template {}", path.display()))?;
            sub_templates.insert(stem.to_string(), data);
        }

        Ok(Self {
            kind,
            template,
            sub_templates,
            activate_on_tags,
        })
    }
}

#[async_trait]
impl Transformer for PayloadTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let scope = wrapper.scope();
        let rendered = template::render_with_subs(&self.template, &self.sub_templates, &scope)
            .map_err(|e| GatewayError::Internal(format!("payload template failed: {e}")))?;

        match self.kind {
            PipelineKind::Request => {
                wrapper.request.body = BodySlot::Buffered(Bytes::from(rendered));
            }
            PipelineKind::Response => {
                let Some(response) = wrapper.response.as_mut() else {
                    return Ok(());
                };
                response.headers.remove(http::header::CONTENT_LENGTH);
                response.headers.remove(http::header::TRANSFER_ENCODING);
                response.headers.remove(http::header::CONTENT_ENCODING);
                response.body = BodySlot::Buffered(Bytes::from(rendered));
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
