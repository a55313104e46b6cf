pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::template;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

impl GatewayConfig {
    /// Load the main configuration from a YAML file and expand the
    /// `variables` block against the process environment. The result is
    /// treated as immutable for the lifetime of the process.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("could not parse config file {}", path.display()))?;

        // Variable values are templates over environment variables,
        // expanded once here. A value that fails to render keeps its
        // literal form.
        let env_scope = template::env_scope();
        for value in config.variables.values_mut() {
            if let Ok(rendered) = template::render(value, &env_scope) {
                *value = rendered;
            }
        }

        config.validate()?;
        tracing::info!(
            "config: loaded, hosts={}, openapi_hosts={}",
            config.rules.len(),
            config.open_api.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.downstream.port == 0 {
            anyhow::bail!("network.downstream.port must be set");
        }
        for (host, routes) in &self.rules {
            for (pattern, rule) in routes {
                if rule.origin.is_empty() {
                    anyhow::bail!("rule {}{} has no origin", host, pattern);
                }
            }
        }
        for field in [
            &self.network.upstream.timeout,
            &self.network.upstream.keep_alive,
            &self.network.upstream.idle_connection_timeout,
            &self.network.upstream.expect_continue_timeout,
        ] {
            parse_duration(field)?;
        }
        for tls in &self.network.downstream.tls {
            if tls.host.is_empty() || tls.cert.is_empty() || tls.key.is_empty() {
                anyhow::bail!("network.downstream.tls entries need host, cert and key");
            }
        }
        Ok(())
    }
}

impl LoggerConfig {
    /// Load the optional logger configuration (`-l`). A missing flag means
    /// built-in defaults: info level, JSON format, stdout.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("could not read logger config {}", p.display()))?;
                let config = serde_yaml::from_str(&content)
                    .with_context(|| format!("could not parse logger config {}", p.display()))?;
                Ok(config)
            }
            None => Ok(LoggerConfig::default()),
        }
    }
}

/// Parse a humantime duration string (`30s`, `1500ms`).
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("{value:?} is not a valid duration"))
}
