use super::{decode_params, status_response, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::{parse_basic_auth, ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::StatusCode;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::Arc;

/// Verifies basic credentials against a literal user/password pair or an
/// htpasswd file. The `proxy` flag switches to the Proxy-Authorization
/// header; `retain: false` strips the credential after a successful
/// check so it never reaches the origin.
pub struct BasicAuthTransformer {
    username: String,
    password: String,
    proxy: bool,
    retain: bool,
    htpasswd_entries: HashMap<String, String>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    username: String,
    password: String,
    htpasswd: String,
    proxy: bool,
    retain: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            htpasswd: String::new(),
            proxy: false,
            retain: true,
        }
    }
}

impl BasicAuthTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let scope = template::config_scope(variables);
        let username = template::render(&params.username, &scope)?;
        let password = template::render(&params.password, &scope)?;
        let htpasswd = template::render(&params.htpasswd, &scope)?;

        let htpasswd_entries = if htpasswd.is_empty() {
            HashMap::new()
        } else {
            let data = std::fs::read_to_string(&htpasswd)
                .with_context(|| format!("could not read htpasswd file {htpasswd}"))?;
            parse_htpasswd(&data)
        };

        Ok(Self {
            username,
            password,
            proxy: params.proxy,
            retain: params.retain,
            htpasswd_entries,
            activate_on_tags,
        })
    }

    fn header_name(&self) -> &'static str {
        if self.proxy {
            "proxy-authorization"
        } else {
            "authorization"
        }
    }

    fn credentials_match(&self, user: &str, pass: &str) -> bool {
        if !self.htpasswd_entries.is_empty() {
            return self
                .htpasswd_entries
                .get(user)
                .map(|hash| verify_htpasswd_entry(hash, pass))
                .unwrap_or(false);
        }
        !self.username.is_empty() && self.username == user && self.password == pass
    }
}

fn parse_htpasswd(data: &str) -> HashMap<String, String> {
    data.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            line.split_once(':')
                .map(|(user, hash)| (user.to_string(), hash.to_string()))
        })
        .collect()
}

/// Verify one htpasswd hash. Supported schemes: bcrypt (`$2*$`),
/// `{SHA}` and plaintext. apr1-md5 entries fail verification.
fn verify_htpasswd_entry(hash: &str, password: &str) -> bool {
    if hash.starts_with("$2") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }
    if let Some(digest) = hash.strip_prefix("{SHA}") {
        let mut hasher = Sha1::new();
        hasher.update(password.as_bytes());
        return BASE64.encode(hasher.finalize()) == digest;
    }
    if hash.starts_with("$apr1$") {
        return false;
    }
    hash == password
}

#[async_trait]
impl Transformer for BasicAuthTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let credentials = parse_basic_auth(&wrapper.request.headers, self.header_name());
        match credentials {
            Some((user, pass)) if self.credentials_match(&user, &pass) => {
                wrapper.username = Some(user);
                if !self.retain {
                    wrapper.request.headers.remove(self.header_name());
                }
                Ok(())
            }
            _ => {
                crate::metrics::custom_counter("basic_auth_denied").increment(1);
                Err(GatewayError::NoAuth)
            }
        }
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

    fn transformer(yaml: &str) -> BasicAuthTransformer {
        BasicAuthTransformer::from_params(
            vec![],
            &serde_yaml::from_str(yaml).unwrap(),
            &Arc::new(HashMap::new()),
        )
        .unwrap()
    }

    fn authorized_wrapper(user: &str, pass: &str) -> crate::wrapper::ApiWrapper {
        let mut wrapper = test_wrapper();
        let value = format!("Basic {}", BASE64.encode(format!("{user}:{pass}")));
        wrapper
            .request
            .headers
            .insert("authorization", value.parse().unwrap());
        wrapper
    }

    #[tokio::test]
    async fn test_literal_pair_accepts_and_denies() {
        let t = transformer("{username: foo, password: bar}");
        let mut ok = authorized_wrapper("foo", "bar");
        t.transform(&mut ok).await.unwrap();
        assert_eq!(ok.username.as_deref(), Some("foo"));

        let mut bad = authorized_wrapper("foo", "wrong");
        let err = t.transform(&mut bad).await.unwrap_err();
        assert_eq!(err.to_string(), "no_auth");

        let mut missing = test_wrapper();
        assert!(t.transform(&mut missing).await.is_err());
    }

    #[tokio::test]
    async fn test_retain_false_strips_credential() {
        let t = transformer("{username: foo, password: bar, retain: false}");
        let mut wrapper = authorized_wrapper("foo", "bar");
        t.transform(&mut wrapper).await.unwrap();
        assert!(wrapper.request.headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_retain_default_keeps_credential() {
        let t = transformer("{username: foo, password: bar}");
        let mut wrapper = authorized_wrapper("foo", "bar");
        t.transform(&mut wrapper).await.unwrap();
        assert!(wrapper.request.headers.get("authorization").is_some());
    }

    #[test]
    fn test_htpasswd_entry_schemes() {
        // {SHA} of "bar"
        let mut hasher = Sha1::new();
        hasher.update(b"bar");
        let sha_entry = format!("{{SHA}}{}", BASE64.encode(hasher.finalize()));
        assert!(verify_htpasswd_entry(&sha_entry, "bar"));
        assert!(!verify_htpasswd_entry(&sha_entry, "baz"));

        let bcrypt_entry = bcrypt::hash("secret", 4).unwrap();
        assert!(verify_htpasswd_entry(&bcrypt_entry, "secret"));
        assert!(!verify_htpasswd_entry(&bcrypt_entry, "other"));

        assert!(verify_htpasswd_entry("plain", "plain"));
        assert!(!verify_htpasswd_entry("$apr1$abcdefgh$xxxxxxxx", "plain"));
    }

    #[test]
    fn test_parse_htpasswd_lines() {
        let entries = parse_htpasswd("alice:secret\n# comment\n\nbob:{SHA}abc\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("alice").unwrap(), "secret");
    }

    #[test]
    fn test_error_mapping() {
        let t = transformer("{username: foo, password: bar}");
        assert!(t.error_matches(&GatewayError::NoAuth));
        assert!(!t.error_matches(&GatewayError::Barraged));
        let resp = t.handle_error(&GatewayError::NoAuth);
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
