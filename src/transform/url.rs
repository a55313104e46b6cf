use super::{decode_params, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::warn;

/// Rewrites the request path and query string before the trip: strips
/// `oldPrefix`, prepends `newPrefix`, applies templated query `set`
/// entries and a `remove` list.
pub struct UrlTransformer {
    old_prefix: String,
    new_prefix: String,
    query_set: HashMap<String, String>,
    query_remove: Vec<String>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    old_prefix: String,
    new_prefix: String,
    query: QueryParams,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct QueryParams {
    set: HashMap<String, String>,
    remove: Vec<String>,
}

impl UrlTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        Ok(Self {
            old_prefix: params.old_prefix,
            new_prefix: params.new_prefix,
            query_set: params.query.set,
            query_remove: params.query.remove,
            activate_on_tags,
        })
    }
}

/// Join a base path and a remainder keeping exactly one slash between
/// them, whatever combination of trailing/leading slashes they carry.
fn join_paths(base: &str, rest: &str) -> String {
    match (base.ends_with('/'), rest.starts_with('/')) {
        (true, true) => format!("{}{}", base, &rest[1..]),
        (false, false) if !base.is_empty() && !rest.is_empty() => format!("{}/{}", base, rest),
        _ => format!("{}{}", base, rest),
    }
}

#[async_trait]
impl Transformer for UrlTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let path = wrapper.request.url.path().to_string();
        if !self.old_prefix.is_empty() {
            if let Some(rest) = path.strip_prefix(&self.old_prefix) {
                let new_path = join_paths(&self.new_prefix, rest);
                wrapper.request.url.set_path(&new_path);
            }
        }

        if !self.query_set.is_empty() || !self.query_remove.is_empty() {
            let scope = wrapper.scope();
            let mut pairs: Vec<(String, String)> = wrapper
                .request
                .url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.retain(|(k, _)| !self.query_remove.contains(k) && !self.query_set.contains_key(k));
            for (key, value) in &self.query_set {
                let rendered = template::render(value, &scope).unwrap_or_else(|e| {
                    warn!("url transformer: query template failed, error={}", e);
                    value.clone()
                });
                pairs.push((key.clone(), rendered));
            }
            if pairs.is_empty() {
                wrapper.request.url.set_query(None);
            } else {
                wrapper
                    .request
                    .url
                    .query_pairs_mut()
                    .clear()
                    .extend_pairs(pairs);
            }
        }
        Ok(())
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;

    fn transformer(params: serde_yaml::Value) -> UrlTransformer {
        UrlTransformer::from_params(vec![], &params).unwrap()
    }

    #[tokio::test]
    async fn test_prefix_rewrite() {
        let t = transformer(serde_yaml::from_str("{oldPrefix: /foo, newPrefix: /bar}").unwrap());
        let mut wrapper = test_wrapper();
        wrapper.request.url = url::Url::parse("https://example.com/foo").unwrap();
        t.transform(&mut wrapper).await.unwrap();
        assert_eq!(wrapper.request.url.path(), "/bar");
    }

    #[tokio::test]
    async fn test_prefix_rewrite_keeps_single_slash() {
        let t = transformer(serde_yaml::from_str("{oldPrefix: /foo, newPrefix: /bar/}").unwrap());
        let mut wrapper = test_wrapper();
        wrapper.request.url = url::Url::parse("https://example.com/foo/baz").unwrap();
        t.transform(&mut wrapper).await.unwrap();
        assert_eq!(wrapper.request.url.path(), "/bar/baz");
    }

    #[tokio::test]
    async fn test_query_set_and_remove() {
        let t = transformer(
            serde_yaml::from_str("{query: {set: {page: '1'}, remove: [debug]}}").unwrap(),
        );
        let mut wrapper = test_wrapper();
        wrapper.request.url = url::Url::parse("https://example.com/x?debug=true&keep=y").unwrap();
        t.transform(&mut wrapper).await.unwrap();
        let query = wrapper.request.url.query().unwrap();
        assert!(query.contains("page=1"));
        assert!(query.contains("keep=y"));
        assert!(!query.contains("debug"));
    }

    #[tokio::test]
    async fn test_untouched_path_without_prefix() {
        let t = transformer(serde_yaml::from_str("{oldPrefix: /foo, newPrefix: /bar}").unwrap());
        let mut wrapper = test_wrapper();
        wrapper.request.url = url::Url::parse("https://example.com/other").unwrap();
        t.transform(&mut wrapper).await.unwrap();
        assert_eq!(wrapper.request.url.path(), "/other");
    }
}
