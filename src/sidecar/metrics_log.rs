use super::{decode_params, spawn_workers, LogSink, Sidecar};
use crate::config::SidecarConfig;
use crate::template;
use crate::wrapper::ApiWrapper;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Publishes the wrapper's stopwatch — transaction, request-transform and
/// response-transform durations — to custom Prometheus summaries and/or
/// the log, per the `mode` switch (`prometheus`, `text`, empty = both).
pub struct MetricsLogSidecar {
    tx: mpsc::Sender<Arc<ApiWrapper>>,
    block: bool,
    drop_on_overflow: bool,
    activate_on_tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Params {
    path: String,
    prometheus_prefix: String,
    mode: String,
}

fn summary_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        "metrics".to_string()
    } else {
        format!("metrics_{prefix}")
    }
}

impl MetricsLogSidecar {
    pub fn from_config(
        config: &SidecarConfig,
        variables: &Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let params: Params = decode_params(&config.params)?;
        let scope = template::config_scope(variables);
        let path = template::render(&params.path, &scope)?;
        let sink = LogSink::from_path(&path)?;
        let prefix = summary_prefix(&params.prometheus_prefix);
        let prometheus_enabled = params.mode == "prometheus" || params.mode.is_empty();
        let text_enabled = params.mode == "text" || params.mode.is_empty();

        let (tx, rx) = mpsc::channel(config.queue.max(1));
        spawn_workers(rx, config.workers, move |wrapper| {
            let sink = sink.clone();
            let prefix = prefix.clone();
            async move {
                let transaction_ms = wrapper.metrics.transaction().as_millis() as f64;
                let req_ms = wrapper.metrics.req_transformation().as_millis() as f64;
                let res_ms = wrapper.metrics.res_transformation().as_millis() as f64;
                if prometheus_enabled {
                    crate::metrics::custom_summary(&format!("{prefix}_transaction"))
                        .record(transaction_ms);
                    crate::metrics::custom_summary(&format!("{prefix}_req_transformation"))
                        .record(req_ms);
                    crate::metrics::custom_summary(&format!("{prefix}_res_transformation"))
                        .record(res_ms);
                }
                if text_enabled {
                    sink.write(
                        "metrics",
                        serde_json::json!({
                            "transaction": transaction_ms,
                            "req_transformation": req_ms,
                            "res_transformation": res_ms,
                            "tags": wrapper.tags,
                        }),
                    );
                }
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

impl Sidecar for MetricsLogSidecar {
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
