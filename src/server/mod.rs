pub mod bootstrap;
pub mod tls;

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy;
use crate::routing::RouteTable;
use crate::tripper::Transport;
use crate::wrapper::full_body;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared gateway state, cheaply cloneable. Everything in here is built
/// once at bootstrap and immutable afterwards.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub variables: Arc<HashMap<String, String>>,
    pub table: Arc<RouteTable>,
    pub transport: Transport,
    pub metrics: Metrics,
}

/// Run the main proxy server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete
/// before giving up on them.
pub async fn run_proxy_server(state: GatewayState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.network.downstream.port));
    let listener = TcpListener::bind(addr).await?;
    let tls_acceptor = tls::build_acceptor(&state.config.network.downstream.tls)?;
    info!(
        "server: proxy listening, addr={}, tls={}",
        addr,
        tls_acceptor.is_some()
    );

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted")
                    .increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let tls_acceptor = tls_acceptor.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, state, peer_addr).await,
                    Err(e) => {
                        error!(
                            "server: proxy: TLS handshake failed, peer={}, error={}",
                            peer_addr, e
                        );
                    }
                },
                None => serve_connection(stream, state, peer_addr).await,
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: proxy: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout ({}s), {} connections still active",
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

async fn serve_connection<S>(stream: S, state: GatewayState, peer_addr: SocketAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let state_inner = state.clone();
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state_inner.clone();
        async move { proxy::handle_request(req, state, peer_addr).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            error!(
                "server: proxy: connection error, peer={}, error={}",
                peer_addr, e
            );
        }
    }
}

/// Serve the Prometheus exposition on its own listener at the configured
/// path. Disabled when no port is configured.
pub async fn run_metrics_server(state: GatewayState) -> Result<()> {
    let port = state.config.prometheus.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(
        "server: metrics listening, addr={}, path={}",
        addr, state.config.prometheus.path
    );

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { handle_metrics(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: metrics: connection error, error={}", e);
                }
            }
        });
    }
}

fn handle_metrics(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<hyper::Response<crate::wrapper::BoxBody>, hyper::Error> {
    if req.uri().path() == state.config.prometheus.path {
        let body = state.metrics.render();
        Ok(hyper::Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(body))
            .expect("metrics response"))
    } else {
        Ok(hyper::Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .expect("metrics 404"))
    }
}
