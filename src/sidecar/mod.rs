pub mod access_log;
pub mod capture;
pub mod metrics_log;

use crate::config::SidecarConfig;
use crate::wrapper::ApiWrapper;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// An asynchronous observer of wrappers. Sidecars never affect the main
/// request outcome: delivery failures are dropped or absorbed, and the
/// worker pool consumes at its own pace behind a bounded queue.
pub trait Sidecar: Send + Sync {
    fn channel(&self) -> &mpsc::Sender<Arc<ApiWrapper>>;

    /// Deliver inline from the request task instead of a spawned task.
    fn should_block(&self) -> bool;

    /// On a full queue, drop the message instead of applying backpressure.
    fn should_drop_on_overflow(&self) -> bool;

    fn should_expand_request(&self) -> bool {
        false
    }

    fn should_expand_response(&self) -> bool {
        false
    }

    fn is_active(&self, wrapper: &ApiWrapper) -> bool;
}

/// The sidecars bound to one side of a rule, with the fan-out policy.
#[derive(Clone, Default)]
pub struct SidecarSet {
    sidecars: Vec<Arc<dyn Sidecar>>,
}

impl SidecarSet {
    pub fn new(sidecars: Vec<Arc<dyn Sidecar>>) -> Self {
        Self { sidecars }
    }

    pub fn should_expand_request(&self) -> bool {
        self.sidecars.iter().any(|s| s.should_expand_request())
    }

    pub fn should_expand_response(&self) -> bool {
        self.sidecars.iter().any(|s| s.should_expand_response())
    }

    pub fn is_empty(&self) -> bool {
        self.sidecars.is_empty()
    }

    /// Fan a snapshot of the wrapper out to every active sidecar.
    ///
    /// Per sidecar: blocking delivery happens inline (backpressure reaches
    /// the request task), non-blocking delivery is spawned. Within a
    /// delivery, `drop_on_overflow` turns a full queue into a silent drop.
    pub async fn dispatch(&self, wrapper: &ApiWrapper) {
        if self.sidecars.is_empty() {
            return;
        }
        let shared = Arc::new(wrapper.snapshot());
        for sidecar in &self.sidecars {
            if !sidecar.is_active(&shared) {
                continue;
            }
            if sidecar.should_block() {
                deliver(sidecar, shared.clone()).await;
            } else {
                let sidecar = sidecar.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    deliver(&sidecar, shared).await;
                });
            }
        }
    }
}

async fn deliver(sidecar: &Arc<dyn Sidecar>, wrapper: Arc<ApiWrapper>) {
    if sidecar.should_drop_on_overflow() {
        if let Err(mpsc::error::TrySendError::Full(_)) = sidecar.channel().try_send(wrapper) {
            metrics::counter!("gateway_sidecar_dropped_total").increment(1);
        }
    } else {
        // A closed channel means shutdown; nothing to do.
        let _ = sidecar.channel().send(wrapper).await;
    }
}

/// Start `workers` consumers over one queue. Workers share the receiver
/// and exit when the channel closes at shutdown.
pub fn spawn_workers<F, Fut>(receiver: mpsc::Receiver<Arc<ApiWrapper>>, workers: usize, handler: F)
where
    F: Fn(Arc<ApiWrapper>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
    for _ in 0..workers.max(1) {
        let receiver = receiver.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let message = { receiver.lock().await.recv().await };
                match message {
                    Some(wrapper) => handler(wrapper).await,
                    None => break,
                }
            }
        });
    }
}

/// Which side of a rule a sidecar set observes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SidecarKind {
    Request,
    Response,
}

pub fn decode_params<T: DeserializeOwned + Default>(params: &serde_yaml::Value) -> Result<T> {
    match params {
        serde_yaml::Value::Null => Ok(T::default()),
        value => serde_yaml::from_value(value.clone()).context("invalid sidecar params"),
    }
}

pub fn build_sidecars(
    kind: SidecarKind,
    configs: &[SidecarConfig],
    variables: &Arc<HashMap<String, String>>,
) -> Result<SidecarSet> {
    let mut sidecars: Vec<Arc<dyn Sidecar>> = Vec::new();
    for config in configs {
        let built: Option<Arc<dyn Sidecar>> = match (config.id.as_str(), kind) {
            ("accessLog", SidecarKind::Request) => Some(Arc::new(
                access_log::AccessLogSidecar::request(config, variables)?,
            )),
            ("accessLog", SidecarKind::Response) => Some(Arc::new(
                access_log::AccessLogSidecar::upstream(config, variables)?,
            )),
            ("metricsLog", SidecarKind::Response) => Some(Arc::new(
                metrics_log::MetricsLogSidecar::from_config(config, variables)?,
            )),
            ("capture", SidecarKind::Response) => Some(Arc::new(
                capture::CaptureSidecar::from_config(config, variables)?,
            )),
            (other, _) => {
                warn!(
                    "sidecar: unsupported sidecar for {:?} pipeline, id={}",
                    kind, other
                );
                None
            }
        };
        if let Some(s) = built {
            sidecars.push(s);
        }
    }
    Ok(SidecarSet::new(sidecars))
}

/// Shared destination for sidecar records: the process log, or a private
/// append-only file when the sidecar configures its own `path`.
#[derive(Clone)]
pub enum LogSink {
    Tracing,
    File(Arc<std::sync::Mutex<std::fs::File>>),
}

impl LogSink {
    pub fn from_path(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Ok(LogSink::Tracing);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open sidecar log file {path}"))?;
        Ok(LogSink::File(Arc::new(std::sync::Mutex::new(file))))
    }

    pub fn write(&self, message: &str, record: serde_json::Value) {
        match self {
            LogSink::Tracing => {
                tracing::info!(record = %record, "{}", message);
            }
            LogSink::File(file) => {
                use std::io::Write;
                let line = serde_json::json!({ "message": message, "record": record });
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::test_wrapper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        tx: mpsc::Sender<Arc<ApiWrapper>>,
        block: bool,
        drop_on_overflow: bool,
    }

    impl Sidecar for Probe {
        fn channel(&self) -> &mpsc::Sender<Arc<ApiWrapper>> {
            &self.tx
        }

        fn should_block(&self) -> bool {
            self.block
        }

        fn should_drop_on_overflow(&self) -> bool {
            self.drop_on_overflow
        }

        fn is_active(&self, _wrapper: &ApiWrapper) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_blocking_delivery_arrives() {
        let (tx, mut rx) = mpsc::channel(4);
        let set = SidecarSet::new(vec![Arc::new(Probe {
            tx,
            block: true,
            drop_on_overflow: false,
        })]);
        let wrapper = test_wrapper();
        set.dispatch(&wrapper).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, wrapper.id);
    }

    #[tokio::test]
    async fn test_drop_on_overflow_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let set = SidecarSet::new(vec![Arc::new(Probe {
            tx,
            block: true,
            drop_on_overflow: true,
        })]);
        let wrapper = test_wrapper();
        // Second dispatch finds the queue full and must return immediately.
        set.dispatch(&wrapper).await;
        set.dispatch(&wrapper).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_workers_consume_and_stop_on_close() {
        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        spawn_workers(rx, 2, move |_wrapper| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        for _ in 0..5 {
            tx.send(Arc::new(test_wrapper())).await.unwrap();
        }
        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
