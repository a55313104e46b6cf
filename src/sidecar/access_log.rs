use super::{decode_params, spawn_workers, LogSink, Sidecar};
use crate::config::SidecarConfig;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Access logging, one record per observed wrapper. The request flavor
/// fires before the trip, the upstream flavor after the response pipeline
/// and therefore carries the status.
pub struct AccessLogSidecar {
    tx: mpsc::Sender<Arc<ApiWrapper>>,
    block: bool,
    drop_on_overflow: bool,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    path: String,
}

fn record(wrapper: &ApiWrapper, upstream: bool) -> serde_json::Value {
    let mut record = serde_json::json!({
        "remote_addr": wrapper.request.remote_addr.to_string(),
        "real_ip": wrapper.real_ip,
        "method": wrapper.request.method.as_str(),
        "url": wrapper.request.url.as_str(),
        "tags": wrapper.tags,
    });
    if upstream {
        if let Some(response) = wrapper.response.as_ref() {
            record["status"] = serde_json::json!(response.status.as_u16());
        }
    }
    record
}

impl AccessLogSidecar {
    pub fn request(
        config: &SidecarConfig,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        Self::build(config, variables, false)
    }

    pub fn upstream(
        config: &SidecarConfig,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        Self::build(config, variables, true)
    }

    fn build(
        config: &SidecarConfig,
        variables: &Arc<HashMap<String, String>>,
        upstream: bool,
    ) -> Result<Self> {
        let params: Params = decode_params(&config.params)?;
        let scope = template::config_scope(variables);
        let path = template::render(&params.path, &scope)?;
        let sink = LogSink::from_path(&path)?;

        let (tx, rx) = mpsc::channel(config.queue.max(1));
        let message = if upstream {
            "upstream access"
        } else {
            "request access"
        };
        spawn_workers(rx, config.workers, move |wrapper| {
            let sink = sink.clone();
            async move {
                sink.write(message, record(&wrapper, upstream));
            }
        });

        Ok(Self {
            tx,
            block: config.block,
            drop_on_overflow: config.drop_on_overflow,
            activate_on_tags: config.activate_on_tags.clone(),
        })
    }
}

impl Sidecar for AccessLogSidecar {
    fn channel(&self) -> &mpsc::Sender<Arc<ApiWrapper>> {
        &self.tx
    }

    fn should_block(&self) -> bool {
        self.block
    }

    fn should_drop_on_overflow(&self) -> bool {
        self.drop_on_overflow
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool {
        wrapper.has_tag(&self.activate_on_tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::{test_wrapper, ApiResponse, BodySlot};
    use http::{HeaderMap, StatusCode};

    #[test]
    fn test_record_shape() {
        let mut wrapper = test_wrapper();
        wrapper.tags.push("beta".to_string());
        let r = record(&wrapper, false);
        assert_eq!(r["method"], "GET");
        assert_eq!(r["tags"][0], "beta");
        assert!(r.get("status").is_none());

        wrapper.response = Some(ApiResponse::from_parts(
            StatusCode::BAD_GATEWAY,
            HeaderMap::new(),
            BodySlot::Empty,
        ));
        let r = record(&wrapper, true);
        assert_eq!(r["status"], 502);
    }
}
