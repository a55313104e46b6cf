pub mod auth_basic;
pub mod auth_cookie;
pub mod auth_jwt;
pub mod barrage;
pub mod delay;
pub mod headers;
pub mod openapi_validate;
pub mod parser;
pub mod payload;
pub mod rate_limit;
pub mod script;
pub mod status;
pub mod tag;
pub mod url;

use crate::config::TransformerConfig;
use crate::error::GatewayError;
use crate::wrapper::{empty_body, ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// A synchronous pipeline stage that may modify, annotate, or reject the
/// wrapper. The capability set is deliberately small: the engine never
/// needs to know which concrete stage it is driving, and error handling is
/// extensible because claiming an error (`error_matches`) is part of the
/// contract rather than a central switch.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError>;

    /// Whether this stage needs the request body materialized.
    fn should_expand_request(&self) -> bool {
        false
    }

    /// Whether this stage needs the response body materialized.
    fn should_expand_response(&self) -> bool {
        false
    }

    /// True if this stage knows how to render a response for `err`.
    fn error_matches(&self, err: &GatewayError) -> bool {
        let _ = err;
        false
    }

    /// Render the response for an error this stage claimed.
    fn handle_error(&self, err: &GatewayError) -> hyper::Response<BoxBody> {
        let _ = err;
        status_response(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Per-request activation, usually tag gating.
    fn is_active(&self, wrapper: &ApiWrapper) -> bool;
}

pub fn status_response(status: StatusCode) -> hyper::Response<BoxBody> {
    hyper::Response::builder()
        .status(status)
        .body(empty_body())
        .expect("status-only response")
}

/// An ordered transformer pipeline bound to one side (request or
/// response) of a rule.
#[derive(Clone, Default)]
pub struct TransformerChain {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    pub fn new(transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self { transformers }
    }

    /// Run every active stage in declared order. The first error stops
    /// the chain and propagates.
    pub async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        for transformer in &self.transformers {
            if transformer.is_active(wrapper) {
                transformer.transform(wrapper).await?;
            }
        }
        Ok(())
    }

    pub fn should_expand_request(&self) -> bool {
        self.transformers.iter().any(|t| t.should_expand_request())
    }

    pub fn should_expand_response(&self) -> bool {
        self.transformers.iter().any(|t| t.should_expand_response())
    }

    /// Walk the chain for a stage claiming `err` and let it render the
    /// response. `None` means unhandled — the engine falls back to the
    /// built-in status table.
    pub fn handle_error(&self, err: &GatewayError) -> Option<hyper::Response<BoxBody>> {
        self.transformers
            .iter()
            .find(|t| t.error_matches(err))
            .map(|t| t.handle_error(err))
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

/// Which side of a rule a chain is being built for. Several families only
/// make sense on one side (auth on requests, status on responses).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipelineKind {
    Request,
    Response,
}

/// Decode a transformer's `params` block into its typed config. A missing
/// block means all-defaults.
pub fn decode_params<T: DeserializeOwned + Default>(params: &serde_yaml::Value) -> Result<T> {
    match params {
        serde_yaml::Value::Null => Ok(T::default()),
        value => serde_yaml::from_value(value.clone()).context("invalid transformer params"),
    }
}

/// Build a chain from config, in declared order. Constructors that talk to
/// external services (Redis) connect here, at startup, so a misconfigured
/// pipeline fails the boot instead of the first request.
pub async fn build_transformers(
    kind: PipelineKind,
    configs: &[TransformerConfig],
    variables: &Arc<HashMap<String, String>>,
) -> Result<TransformerChain> {
    let mut transformers: Vec<Arc<dyn Transformer>> = Vec::new();
    for config in configs {
        let tags = config.activate_on_tags.clone();
        let built: Option<Arc<dyn Transformer>> = match (config.id.as_str(), kind) {
            ("url", PipelineKind::Request) => Some(Arc::new(url::UrlTransformer::from_params(
                tags,
                &config.params,
            )?)),
            ("headers", _) => Some(Arc::new(headers::HeaderTransformer::from_params(
                kind,
                tags,
                &config.params,
            )?)),
            ("basic-auth", PipelineKind::Request) => Some(Arc::new(
                auth_basic::BasicAuthTransformer::from_params(tags, &config.params, variables)?,
            )),
            ("jwt-auth", PipelineKind::Request) => Some(Arc::new(
                auth_jwt::JwtAuthTransformer::from_params(tags, &config.params, variables)?,
            )),
            ("jwt-sign", PipelineKind::Request) => Some(Arc::new(
                auth_jwt::JwtSignTransformer::from_params(tags, &config.params, variables)?,
            )),
            ("cookie-to-token-auth", PipelineKind::Request) => Some(Arc::new(
                auth_cookie::CookieToTokenTransformer::from_params(tags, &config.params, variables)
                    .await?,
            )),
            ("rate-limiter", PipelineKind::Request) => Some(Arc::new(
                rate_limit::RateLimiterTransformer::from_params(tags, &config.params, variables)
                    .await?,
            )),
            ("scriptable", _) => Some(Arc::new(script::ScriptableTransformer::from_params(
                tags,
                &config.params,
            )?)),
            ("delay", _) => Some(Arc::new(delay::DelayTransformer::from_params(
                tags,
                &config.params,
            )?)),
            ("barrage", _) => Some(Arc::new(barrage::BarrageTransformer::from_params(
                kind,
                tags,
                &config.params,
            )?)),
            ("tag", _) => Some(Arc::new(tag::TagTransformer::from_params(&config.params)?)),
            ("parser", _) => Some(Arc::new(parser::ParserTransformer::new(kind, tags))),
            ("openapi-validator", PipelineKind::Request) => Some(Arc::new(
                openapi_validate::OpenApiValidatorTransformer::new(tags),
            )),
            ("payload", _) => Some(Arc::new(payload::PayloadTransformer::from_params(
                kind,
                tags,
                &config.params,
            )?)),
            ("status", PipelineKind::Response) => Some(Arc::new(
                status::StatusTransformer::from_params(tags, &config.params)?,
            )),
            (other, _) => {
                warn!(
                    "transform: unsupported transformer for {:?} pipeline, id={}",
                    kind, other
                );
                None
            }
        };
        if let Some(t) = built {
            transformers.push(t);
        }
    }
    Ok(TransformerChain::new(transformers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;

    struct Tagger(&'static str);

    #[async_trait]
    impl Transformer for Tagger {
        async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
            wrapper.tags.push(self.0.to_string());
            Ok(())
        }

        fn is_active(&self, _wrapper: &ApiWrapper) -> bool {
            true
        }
    }

    struct Failing;

    #[async_trait]
    impl Transformer for Failing {
        async fn transform(&self, _wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
            Err(GatewayError::Barraged)
        }

        fn error_matches(&self, err: &GatewayError) -> bool {
            matches!(err, GatewayError::Barraged)
        }

        fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
            status_response(StatusCode::FORBIDDEN)
        }

        fn is_active(&self, _wrapper: &ApiWrapper) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_declared_order() {
        let chain = TransformerChain::new(vec![Arc::new(Tagger("one")), Arc::new(Tagger("two"))]);
        let mut wrapper = test_wrapper();
        chain.transform(&mut wrapper).await.unwrap();
        assert_eq!(wrapper.tags, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_error() {
        let chain = TransformerChain::new(vec![
            Arc::new(Tagger("before")),
            Arc::new(Failing),
            Arc::new(Tagger("after")),
        ]);
        let mut wrapper = test_wrapper();
        let err = chain.transform(&mut wrapper).await.unwrap_err();
        assert_eq!(err.to_string(), "barraged");
        assert_eq!(wrapper.tags, vec!["before".to_string()]);
    }

    #[tokio::test]
    async fn test_chain_error_handler_lookup() {
        let chain = TransformerChain::new(vec![Arc::new(Tagger("x")), Arc::new(Failing)]);
        let resp = chain.handle_error(&GatewayError::Barraged).unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(chain.handle_error(&GatewayError::NoAuth).is_none());
    }
}
