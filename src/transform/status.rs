use super::{decode_params, Transformer};
use crate::error::GatewayError;
use crate::wrapper::ApiWrapper;
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;

/// Overwrites the response status code.
pub struct StatusTransformer {
    status: StatusCode,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    status: u16,
}

impl StatusTransformer {
    pub fn from_params(
        activate_on_tags: Vec<String>,
        params: &serde_yaml::Value,
    ) -> Result<Self> {
        let params: Params = decode_params(params)?;
        let status = StatusCode::from_u16(params.status)
            .with_context(|| format!("{} is not a valid status code", params.status))?;
        Ok(Self {
            status,
            activate_on_tags,
        })
    }
}

#[async_trait]
impl Transformer for StatusTransformer {
    async fn transform(&self, wrapper: &mut ApiWrapper) -> Result<(), GatewayError> {
        if let Some(response) = wrapper.response.as_mut() {
            response.status = self.status;
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
    use crate::wrapper::{test_wrapper, ApiResponse, BodySlot};
    use http::HeaderMap;

    #[tokio::test]
    async fn test_overwrites_status() {
        let t =
            StatusTransformer::from_params(vec![], &serde_yaml::from_str("{status: 418}").unwrap())
                .unwrap();
        let mut wrapper = test_wrapper();
        wrapper.response = Some(ApiResponse::from_parts(
            StatusCode::OK,
            HeaderMap::new(),
            BodySlot::Empty,
        ));
        t.transform(&mut wrapper).await.unwrap();
        assert_eq!(
            wrapper.response.as_ref().unwrap().status,
            StatusCode::IM_A_TEAPOT
        );
    }

    #[test]
    fn test_invalid_status_rejected() {
        assert!(
            StatusTransformer::from_params(vec![], &serde_yaml::from_str("{status: 99}").unwrap())
                .is_err()
        );
    }
}
