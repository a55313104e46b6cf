//! End-to-end scenarios: a real listener in front of a real (in-process)
//! upstream, exercised over the loopback with a plain HTTP client.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use relay_gateway::config::GatewayConfig;
use relay_gateway::metrics::Metrics;
use relay_gateway::routing::RouteTable;
use relay_gateway::server::{run_proxy_server, GatewayState};
use relay_gateway::{rules, tripper};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Upstream double: answers `/todo/1` with a JSON record and echoes the
/// path everywhere else.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    let (body, content_type) = if path == "/todo/1" {
                        (
                            r#"{"id":1,"title":"buy milk"}"#.to_string(),
                            "application/json",
                        )
                    } else {
                        (format!("path={path}"), "text/plain")
                    };
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(200)
                            .header("content-type", content_type)
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });
    addr
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Compile the config and start a gateway on the port it names.
async fn spawn_gateway(yaml: &str) -> u16 {
    let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
    let port = config.network.downstream.port;
    let config = Arc::new(config);
    let variables = Arc::new(config.variables.clone());
    let compiled = rules::compile(&config, &variables).await.unwrap();
    let state = GatewayState {
        config: config.clone(),
        variables,
        table: Arc::new(RouteTable::new(compiled)),
        transport: tripper::build_transport(&config.network.upstream).unwrap(),
        metrics: Metrics::install(&config.prometheus.namespace),
    };
    let shutdown = Arc::new(Notify::new());
    tokio::spawn(async move {
        let _ = run_proxy_server(state, shutdown).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    port
}

#[tokio::test]
async fn test_basic_auth_success_then_denial() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/todo/.*":
      origin: "http://{upstream}"
      request:
        transformers:
          - id: basic-auth
            params: {{username: foo, password: bar}}
"#
    );
    let port = spawn_gateway(&yaml).await;
    let client = reqwest::Client::new();

    let ok = client
        .get(format!("http://127.0.0.1:{port}/todo/1"))
        .basic_auth("foo", Some("bar"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    assert!(ok
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("application/json"));
    assert_eq!(ok.text().await.unwrap(), r#"{"id":1,"title":"buy milk"}"#);

    let denied = client
        .get(format!("http://127.0.0.1:{port}/todo/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);
}

#[tokio::test]
async fn test_barrage_blocks_matching_body() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/echo/.*":
      origin: "http://{upstream}"
      request:
        transformers:
          - id: barrage
            params: {{bodyRegexp: ".*bar.*"}}
"#
    );
    let port = spawn_gateway(&yaml).await;
    let client = reqwest::Client::new();

    let blocked = client
        .post(format!("http://127.0.0.1:{port}/echo/x"))
        .body("foo bar foo")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), 403);
    // Nothing from the origin leaks into the denial.
    assert!(blocked.text().await.unwrap().is_empty());

    let passed = client
        .post(format!("http://127.0.0.1:{port}/echo/x"))
        .body("all clear")
        .send()
        .await
        .unwrap();
    assert_eq!(passed.status(), 200);
    assert_eq!(passed.text().await.unwrap(), "path=/echo/x");
}

#[tokio::test]
async fn test_url_rewrite_prefix() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/foo.*":
      origin: "http://{upstream}"
      request:
        transformers:
          - id: url
            params: {{oldPrefix: /foo, newPrefix: /bar}}
"#
    );
    let port = spawn_gateway(&yaml).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/foo"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "path=/bar");
}

#[tokio::test]
async fn test_file_tripper_serves_local_file() {
    let dir = std::env::temp_dir().join(format!("relay-files-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let file = dir.join("data.json");
    std::fs::write(&file, br#"{"source":"disk"}"#).unwrap();

    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/data":
      origin: "file://{}"
"#,
        file.display()
    );
    let port = spawn_gateway(&yaml).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/data"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert_eq!(response.text().await.unwrap(), r#"{"source":"disk"}"#);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_none_tripper_answers_empty_200() {
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/void":
      origin: "none://null"
"#
    );
    let port = spawn_gateway(&yaml).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/void"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_method_not_allowed() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/todo/.*":
      origin: "http://{upstream}"
      allowedMethods: [get, delete]
"#
    );
    let port = spawn_gateway(&yaml).await;
    let client = reqwest::Client::new();

    let allowed = client
        .get(format!("http://127.0.0.1:{port}/todo/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    // Any listed method passes, not just the first.
    let also_allowed = client
        .delete(format!("http://127.0.0.1:{port}/todo/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(also_allowed.status(), 200);

    let refused = client
        .post(format!("http://127.0.0.1:{port}/todo/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), 405);
}

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/todo/.*":
      origin: "http://{upstream}"
"#
    );
    let port = spawn_gateway(&yaml).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/nothing/here"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_method_pattern_and_tag_gating() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    // The GET variant tags the request; the barrage only activates on
    // that tag, so a POST to the untagged variant is unaffected.
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "[get] /bananas":
      origin: "http://{upstream}"
      request:
        transformers:
          - id: tag
            params: {{tags: [fruit]}}
          - id: barrage
            activateOnTags: [fruit]
            params: {{headerNameRegexp: "^x-deny$"}}
    "/bananas":
      origin: "http://{upstream}"
"#
    );
    let port = spawn_gateway(&yaml).await;
    let client = reqwest::Client::new();

    let tagged = client
        .get(format!("http://127.0.0.1:{port}/bananas"))
        .header("x-deny", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(tagged.status(), 403);

    let untagged = client
        .post(format!("http://127.0.0.1:{port}/bananas"))
        .header("x-deny", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(untagged.status(), 200);
}

#[tokio::test]
async fn test_response_headers_transformer() {
    let upstream = spawn_upstream().await;
    let port = free_port();
    let yaml = format!(
        r#"
network:
  downstream:
    port: {port}
rules:
  "127.0.0.1:{port}":
    "/todo/.*":
      origin: "http://{upstream}"
      response:
        transformers:
          - id: headers
            params: {{set: {{x-served-by: relay}}}}
"#
    );
    let port = spawn_gateway(&yaml).await;

    let response = reqwest::get(format!("http://127.0.0.1:{port}/todo/1"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-served-by").unwrap(), "relay");
}
