use super::*;

const SAMPLE: &str = r#"
variables:
  origin: "http://localhost:9999"
  secret: "{{ env.CONFIG_TEST_SECRET }}"
network:
  downstream:
    port: 9001
  upstream:
    timeout: 10s
    keepAlive: 15s
    maxIdleConnections: 50
    idleConnectionTimeout: 60s
    expectContinueTimeout: 1s
before:
  request:
    transformers:
      - id: tag
        params: {tags: [edge]}
rules:
  "localhost:9001":
    "/todo/.*":
      origin: http://localhost:9999
      request:
        transformers:
          - id: basic-auth
            params: {username: foo, password: bar}
    "[get] /bananas":
      origin: http://localhost:9999
prometheus:
  port: 9252
  path: /metrics
  namespace: relay
"#;

fn write_temp(content: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("relay-config-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_full_config() {
    std::env::set_var("CONFIG_TEST_SECRET", "hunter2");
    let path = write_temp(SAMPLE);
    let config = GatewayConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.network.downstream.port, 9001);
    assert_eq!(config.network.upstream.timeout, "10s");
    assert_eq!(config.network.upstream.max_idle_connections, 50);
    assert_eq!(config.before.request.transformers.len(), 1);
    assert_eq!(config.before.request.transformers[0].id, "tag");

    let host = config.rules.get("localhost:9001").unwrap();
    assert_eq!(host.len(), 2);
    let todo = host.get("/todo/.*").unwrap();
    assert_eq!(todo.origin, "http://localhost:9999");
    assert_eq!(todo.request.transformers[0].id, "basic-auth");

    assert_eq!(config.prometheus.port, 9252);
    assert_eq!(config.prometheus.namespace, "relay");

    // Variables are expanded against the environment at load time.
    assert_eq!(config.variables.get("secret").unwrap(), "hunter2");
    assert_eq!(
        config.variables.get("origin").unwrap(),
        "http://localhost:9999"
    );
}

#[test]
fn test_defaults_applied() {
    let path = write_temp("network:\n  downstream:\n    port: 8081\n");
    let config = GatewayConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.network.upstream.timeout, "30s");
    assert_eq!(config.network.upstream.max_idle_connections, 100);
    assert_eq!(config.prometheus.path, "/metrics");
    assert_eq!(config.prometheus.port, 0);
    assert!(config.rules.is_empty());
    assert!(config.network.downstream.tls.is_empty());
}

#[test]
fn test_rule_without_origin_rejected() {
    let path = write_temp(
        "network:\n  downstream:\n    port: 8081\nrules:\n  \"h\":\n    \"/x\": {}\n",
    );
    assert!(GatewayConfig::load(&path).is_err());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_invalid_duration_rejected() {
    let path = write_temp(
        "network:\n  downstream:\n    port: 8081\n  upstream:\n    timeout: soon\n",
    );
    assert!(GatewayConfig::load(&path).is_err());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_sidecar_config_defaults() {
    let yaml = "id: accessLog\nblock: true\n";
    let sidecar: SidecarConfig = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(sidecar.workers, 1);
    assert_eq!(sidecar.queue, 16);
    assert!(sidecar.block);
    assert!(!sidecar.drop_on_overflow);
}

#[test]
fn test_logger_config_defaults() {
    let config = LoggerConfig::load(None).unwrap();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, "JSON");
    assert!(config.path.is_empty());
}

#[test]
fn test_logger_config_from_file() {
    let path = write_temp("level: debug\nformat: simple\npath: /var/log/relay.log\n");
    let config = LoggerConfig::load(Some(&path)).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(config.level, "debug");
    assert_eq!(config.format, "simple");
    assert_eq!(config.path, "/var/log/relay.log");
}
