use super::{decode_params, status_response, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::{ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Exchanges a session cookie for a bearer token held in a key-value
/// cache: the cookie's value is the cache key, the cached value becomes
/// `Authorization: Bearer <token>`. Missing cookie or missing key both
/// read as unauthenticated.
pub struct CookieToTokenTransformer {
    cookie_name: String,
    redis: redis::aio::ConnectionManager,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    redis_uri: String,
    cookie_name: String,
}

impl CookieToTokenTransformer {
    pub async fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let scope = template::config_scope(variables);
        let redis_uri = template::render(&params.redis_uri, &scope)?;
        let cookie_name = template::render(&params.cookie_name, &scope)?;
        if cookie_name.is_empty() {
            anyhow::bail!("cookie-to-token-auth needs cookieName");
        }

        let client = redis::Client::open(redis_uri.as_str())
            .with_context(|| format!("invalid redis uri {redis_uri}"))?;
        let redis = redis::aio::ConnectionManager::new(client)
            .await
            .context("could not connect to redis")?;

        Ok(Self {
            cookie_name,
            redis,
            activate_on_tags,
        })
    }
}

/// Find a cookie value in the Cookie header(s).
pub fn cookie_value(wrapper: &ApiWrapper, name: &str) -> Option<String> {
    for header in wrapper.request.headers.get_all(http::header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

#[async_trait]
impl Transformer for CookieToTokenTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let Some(key) = cookie_value(wrapper, &self.cookie_name) else {
            return Err(GatewayError::NoAuth);
        };
        let mut conn = self.redis.clone();
        let token: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| GatewayError::Internal(format!("redis get failed: {e}")))?;
        let Some(token) = token else {
            return Err(GatewayError::NoAuth);
        };
        let value = format!("Bearer {token}");
        wrapper.request.headers.insert(
            http::header::AUTHORIZATION,
            value
                .parse()
                .map_err(|_| GatewayError::Internal("token not header-safe".into()))?,
        );
        Ok(())
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(err, GatewayError::NoAuth)
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::UNAUTHORIZED)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;

    #[test]
    fn test_cookie_value_lookup() {
        let mut wrapper = test_wrapper();
        wrapper
            .request
            .headers
            .insert("cookie", "a=1; session=abc123; b=2".parse().unwrap());
        assert_eq!(cookie_value(&wrapper, "session").unwrap(), "abc123");
        assert!(cookie_value(&wrapper, "missing").is_none());
    }
}
