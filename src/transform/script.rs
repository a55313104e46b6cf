use super::{decode_params, status_response, Transformer};
use crate::error::GatewayError;
use crate::wrapper::{ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use rhai::{Dynamic, Engine, Scope, AST};
use serde::Deserialize;

/// Runs a script with the wrapper surface bound as `wrapper`. The script
/// must evaluate to a boolean verdict: `true` lets the request continue,
/// `false` rejects it. Anything else is a script bug and fails the
/// request outright.
pub struct ScriptableTransformer {
    engine: Engine,
    ast: AST,
    expand_request: bool,
    expand_response: bool,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    /// Inline script source.
    script: String,
    /// Or a path to the script file.
    path: String,
    expand_request: bool,
    expand_response: bool,
}

impl ScriptableTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let source = if !params.script.is_empty() {
            params.script
        } else if !params.path.is_empty() {
            std::fs::read_to_string(&params.path)
                .with_context(|| format!("could not read script {}", params.path))?
        } else {
            anyhow::bail!("scriptable needs either script or path");
        };

        let engine = Engine::new();
        let ast = engine
            .compile(&source)
            .map_err(|e| anyhow::anyhow!("script does not compile: {e}"))?;

        Ok(Self {
            engine,
            ast,
            expand_request: params.expand_request,
            expand_response: params.expand_response,
            activate_on_tags,
        })
    }
}

#[async_trait]
impl Transformer for ScriptableTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let bound = rhai::serde::to_dynamic(wrapper.scope())
            .map_err(|e| GatewayError::Internal(format!("script scope bind failed: {e}")))?;
        let mut scope = Scope::new();
        scope.push_dynamic("wrapper", bound);

        let verdict = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| GatewayError::Internal(format!("script failed: {e}")))?;
        match verdict.as_bool() {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::ScriptRejected),
            Err(_) => Err(GatewayError::Internal(
                "script did not return a boolean".into(),
            )),
        }
    }

    fn should_expand_request(&self) -> bool {
        self.expand_request
    }

    fn should_expand_response(&self) -> bool {
        self.expand_response
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::ScriptRejected)
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::FORBIDDEN)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
