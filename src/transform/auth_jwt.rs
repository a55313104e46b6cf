use super::{decode_params, status_response, Transformer};
use crate::error::GatewayError;
use crate::template;
use crate::wrapper::{ApiWrapper, BoxBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

type ClaimMap = serde_json::Map<String, serde_json::Value>;

/// Requires `Authorization: Bearer <token>` and verifies the signature
/// with either an RSA public key (`pem`, RS256) or a shared secret
/// (`key`, HS256). Decoded claims are stored in the wrapper for later
/// stages and templates.
pub struct JwtAuthTransformer {
    decoding_key: DecodingKey,
    validation: Validation,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthParams {
    /// Path to a PEM public key.
    pem: String,
    /// Shared secret bytes.
    key: String,
}

fn claims_validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    // Claim semantics are the pipeline's business; only the signature is
    // checked here.
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

impl JwtAuthTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: AuthParams = decode_params(params)?;
        let scope = template::config_scope(variables);
        let pem = template::render(&params.pem, &scope)?;
        let key = template::render(&params.key, &scope)?;

        let (decoding_key, algorithm) = if !pem.is_empty() {
            let data = std::fs::read(&pem)
                .with_context(|| format!("could not read public key {pem}"))?;
            (
                DecodingKey::from_rsa_pem(&data).context("invalid RSA public key")?,
                Algorithm::RS256,
            )
        } else if !key.is_empty() {
            (DecodingKey::from_secret(key.as_bytes()), Algorithm::HS256)
        } else {
            anyhow::bail!("jwt-auth needs either pem or key");
        };

        Ok(Self {
            decoding_key,
            validation: claims_validation(algorithm),
            activate_on_tags,
        })
    }
}

fn bearer_token(wrapper: &ApiWrapper) -> Result<String, GatewayError> {
    let header = wrapper
        .request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !header.starts_with("Bearer") {
        return Err(GatewayError::NoAuth);
    }
    Ok(header[6..].trim().to_string())
}

#[async_trait]
impl Transformer for JwtAuthTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let token = bearer_token(wrapper)?;
        match decode::<ClaimMap>(&token, &self.decoding_key, &self.validation) {
            Ok(data) => {
                wrapper.claims = Some(data.claims);
                Ok(())
            }
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Err(GatewayError::SignatureInvalid)
                }
                _ => Err(GatewayError::Internal(format!("jwt decode failed: {e}"))),
            },
        }
    }

    fn error_matches(&self, err: &GatewayError) -> bool {
        matches!(
            err,
            GatewayError::SignatureInvalid | GatewayError::NoAuth
        )
    }

    fn handle_error(&self, _err: &GatewayError) -> hyper::Response<BoxBody> {
        status_response(StatusCode::UNAUTHORIZED)
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

/// Builds and signs a token for the outgoing request. Claims come either
/// from the wrapper (`existingClaims: true`, e.g. after jwt-auth) or from
/// a static map whose string values are templated per request.
pub struct JwtSignTransformer {
    encoding_key: EncodingKey,
    algorithm: Algorithm,
    existing_claims: bool,
    claims: HashMap<String, serde_json::Value>,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SignParams {
    /// Path to a PEM private key.
    pem: String,
    /// Shared secret bytes.
    key: String,
    existing_claims: bool,
    claims: HashMap<String, serde_yaml::Value>,
}

impl JwtSignTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: SignParams = decode_params(params)?;
        let scope = template::config_scope(variables);
        let pem = template::render(&params.pem, &scope)?;
        let key = template::render(&params.key, &scope)?;

        let (encoding_key, algorithm) = if !pem.is_empty() {
            let data = std::fs::read(&pem)
                .with_context(|| format!("could not read private key {pem}"))?;
            (
                EncodingKey::from_rsa_pem(&data).context("invalid RSA private key")?,
                Algorithm::RS256,
            )
        } else if !key.is_empty() {
            (EncodingKey::from_secret(key.as_bytes()), Algorithm::HS256)
        } else {
            anyhow::bail!("jwt-sign needs either pem or key");
        };

        let claims = params
            .claims
            .into_iter()
            .map(|(k, v)| {
                serde_json::to_value(&v)
                    .map(|json| (k, json))
                    .context("claim value is not serializable")
            })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            encoding_key,
            algorithm,
            existing_claims: params.existing_claims,
            claims,
            activate_on_tags,
        })
    }

    fn build_claims(&self, wrapper: &ApiWrapper) -> Result<ClaimMap, GatewayError> {
        if self.existing_claims {
            return Ok(wrapper.claims.clone().unwrap_or_default());
        }
        let scope = wrapper.scope();
        let mut claims = ClaimMap::new();
        for (name, value) in &self.claims {
            let value = match value {
                serde_json::Value::String(s) => {
                    let rendered = template::render(s, &scope).map_err(|e| {
                        GatewayError::Internal(format!("claim template failed: {e}"))
                    })?;
                    serde_json::Value::String(rendered)
                }
                other => other.clone(),
            };
            claims.insert(name.clone(), value);
        }
        Ok(claims)
    }
}

#[async_trait]
impl Transformer for JwtSignTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        let claims = self.build_claims(wrapper)?;
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("jwt sign failed: {e}")))?;
        let value = format!("Bearer {token}");
        wrapper.request.headers.insert(
            http::header::AUTHORIZATION,
            value
                .parse()
                .map_err(|_| GatewayError::Internal("jwt token not header-safe".into()))?,
        );
        Ok(())
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}
