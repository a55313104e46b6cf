use super::{decode_params, status_response, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::{ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Sliding-window rate limiter backed by an external counter. The window
/// is a Redis list keyed by the rendered `vary` template: its length is
/// the current count, its TTL the window. A counter read failure fails
/// open — the request passes.
pub struct RateLimiterTransformer {
    vary: String,
    limit: i64,
    range: Duration,
    prometheus_prefix: String,
    redis: redis::aio::ConnectionManager,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    redis_uri: String,
    /// Per-request key template, e.g. `{{ realIP }}` or `{{ username }}`.
    vary: String,
    limit: i64,
    /// Window length, humantime format.
    range: String,
    prometheus_prefix: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            redis_uri: String::new(),
            vary: String::new(),
            limit: 0,
            range: "1m".to_string(),
            prometheus_prefix: String::new(),
        }
    }
}

impl RateLimiterTransformer {
    pub async fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let scope = template::config_scope(variables);
        let redis_uri = template::render(&params.redis_uri, &scope)?;
        let range = humantime::parse_duration(&params.range)
            .with_context(|| format!("invalid rate-limiter range {:?}", params.range))?;

        let client = redis::Client::open(redis_uri.as_str())
            .with_context(|| format!("invalid redis uri {redis_uri}"))?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .context("could not connect to redis")?;

        Ok(Self {
            vary: params.vary,
            limit: params.limit,
            range,
            prometheus_prefix: params.prometheus_prefix,
            redis,
            activate_on_tags,
        })
    }

    fn rejection_counter(&self) -> String {
        if self.prometheus_prefix.is_empty() {
            "rate_rejections".to_string()
        } else {
            format!("rate_rejections_{}", self.prometheus_prefix)
        }
    }
}

#[async_trait]
impl Transformer for RateLimiterTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let scope = wrapper.scope();
        let key = template::render(&self.vary, &scope)
            .map_err(|e| GatewayError::Internal(format!("vary template failed: {e}")))?;

        // Advertised on every pass so clients can pace themselves.
        let advertised = format!(
            "{} {};window={}",
            self.limit,
            self.limit,
            self.range.as_secs()
        );
        if let Ok(value) = HeaderValue::from_str(&advertised) {
            wrapper.apply_headers.insert("ratelimit-limit", value);
        }

        let mut conn = self.redis.clone();
        let current: i64 = match conn.llen(&key).await {
            Ok(v) => v,
            Err(e) => {
                error!("rate limiter: counter read failed, error={}", e);
                return Ok(());
            }
        };

        if current > self.limit {
            crate::metrics::custom_counter(&self.rejection_counter()).increment(1);
            return Err(GatewayError::RateLimit);
        }

        let exists: bool = conn.exists(&key).await.unwrap_or(false);
        if !exists {
            // First hit of the window: push and arm the TTL atomically.
            if let Err(e) = redis::pipe()
                .atomic()
                .rpush(&key, &key)
                .expire(&key, self.range.as_secs() as i64)
                .query_async::<()>(&mut conn)
                .await
            {
                error!("rate limiter: window init failed, error={}", e);
            }
        } else if let Err(e) = conn.rpush_exists::<_, _, i64>(&key, &key).await {
            error!("rate limiter: counter push failed, error={}", e);
        }
        Ok(())
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::RateLimit)
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::TOO_MANY_REQUESTS)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
