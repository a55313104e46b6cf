use crate::config::{GatewayConfig, PipelineConfig, RuleConfig};
use crate::openapi::{self, OperationRouter};
use crate::sidecar::{self, SidecarKind, SidecarSet};
use crate::template;
use crate::transform::{self, PipelineKind, TransformerChain};
use anyhow::{Context, Result};
use regex::Regex;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// One side of a rule: its transformer chain plus its sidecars.
#[derive(Clone, Default)]
pub struct Pipeline {
    pub transformers: TransformerChain,
    pub sidecars: SidecarSet,
}

/// The connection pool owned by a rule with a database origin, created at
/// init and shared by every request the rule serves.
#[derive(Clone)]
pub enum SqlHandle {
    Postgres(sqlx::PgPool),
    MySql(sqlx::MySqlPool),
}

/// A compiled host+pattern binding: the origin, the merged pipelines, and
/// everything the router needs to order and match it. Immutable after
/// `compile`.
pub struct Rule {
    pub host: String,
    /// The configured path pattern, `[method]` prefix removed.
    pub pattern_source: String,
    pub pattern: Regex,
    /// Method slot extracted from a `[method]` pattern prefix.
    pub pattern_method: Option<String>,
    /// Patterns without `{var}` templates order before dynamic ones.
    pub is_static: bool,
    pub origin: String,
    pub strip_prefix: String,
    /// Methods accepted by the director. Empty means all; the whole list
    /// is scanned.
    pub allowed_methods: Vec<String>,
    pub request: Pipeline,
    pub response: Pipeline,
    pub openapi: Option<Arc<OperationRouter>>,
    pub sql: Option<SqlHandle>,
}

/// Split an optional `[method]` prefix off a pattern.
/// `"[get] /bananas"` → (`Some("get")`, `"/bananas"`); `"/bananas"` →
/// (`None`, `"/bananas"`).
pub fn split_method_prefix(pattern: &str) -> (Option<String>, String) {
    let trimmed = pattern.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let method = rest[..close].trim().to_ascii_lowercase();
            let residue = rest[close + 1..].trim_start().to_string();
            if !method.is_empty() {
                return (Some(method), residue);
            }
        }
    }
    (None, pattern.to_string())
}

/// Compile a path pattern to a regex, turning `{var}` segments into named
/// capture groups so matches can populate the wrapper's path params.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    let mut converted = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        converted.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => {
                let name = &rest[open + 1..open + close];
                let valid_group = name
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic() || c == '_')
                    .unwrap_or(false)
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if valid_group {
                    converted.push_str(&format!("(?P<{name}>[^/]+)"));
                } else {
                    converted.push_str("[^/]+");
                }
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    converted.push_str(rest);
    Regex::new(&converted).with_context(|| format!("pattern {pattern:?} is not a valid regex"))
}

async fn build_pipeline(
    before: &PipelineConfig,
    own: &PipelineConfig,
    after: &PipelineConfig,
    kind: PipelineKind,
    variables: &Arc<HashMap<String, String>>,
) -> Result<Pipeline> {
    let mut transformer_configs = before.transformers.clone();
    transformer_configs.extend(own.transformers.iter().cloned());
    transformer_configs.extend(after.transformers.iter().cloned());

    let mut sidecar_configs = before.sidecars.clone();
    sidecar_configs.extend(own.sidecars.iter().cloned());
    sidecar_configs.extend(after.sidecars.iter().cloned());

    let sidecar_kind = match kind {
        PipelineKind::Request => SidecarKind::Request,
        PipelineKind::Response => SidecarKind::Response,
    };

    Ok(Pipeline {
        transformers: transform::build_transformers(kind, &transformer_configs, variables).await?,
        sidecars: sidecar::build_sidecars(sidecar_kind, &sidecar_configs, variables)?,
    })
}

fn open_sql_pool(origin: &str) -> Result<Option<SqlHandle>> {
    if origin.starts_with("postgres://") {
        let pool = PgPoolOptions::new()
            .connect_lazy(origin)
            .with_context(|| format!("invalid postgres origin {origin}"))?;
        return Ok(Some(SqlHandle::Postgres(pool)));
    }
    if origin.starts_with("mysql://") {
        let pool = MySqlPoolOptions::new()
            .connect_lazy(origin)
            .with_context(|| format!("invalid mysql origin {origin}"))?;
        return Ok(Some(SqlHandle::MySql(pool)));
    }
    Ok(None)
}

async fn compile_rule(
    config: &GatewayConfig,
    host: &str,
    pattern: &str,
    rule: &RuleConfig,
    openapi_router: Option<Arc<OperationRouter>>,
    variables: &Arc<HashMap<String, String>>,
) -> Result<Arc<Rule>> {
    let (pattern_method, residue) = split_method_prefix(pattern);
    let compiled = compile_pattern(&residue)?;

    let scope = template::config_scope(variables);
    let origin = template::render(&rule.origin, &scope)
        .with_context(|| format!("could not render origin {:?}", rule.origin))?;

    let request = build_pipeline(
        &config.before.request,
        &rule.request,
        &config.after.request,
        PipelineKind::Request,
        variables,
    )
    .await?;
    let response = build_pipeline(
        &config.before.response,
        &rule.response,
        &config.after.response,
        PipelineKind::Response,
        variables,
    )
    .await?;

    let sql = open_sql_pool(&origin)?;

    Ok(Arc::new(Rule {
        host: host.to_string(),
        is_static: !residue.contains('{'),
        pattern_source: residue,
        pattern: compiled,
        pattern_method,
        origin,
        strip_prefix: rule.strip_prefix.clone(),
        allowed_methods: rule
            .allowed_methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect(),
        request,
        response,
        openapi: openapi_router,
        sql,
    }))
}

/// Compile every configured rule — explicit `rules` entries plus the ones
/// translated from bound OpenAPI documents. Explicit rules win on a
/// host+pattern collision.
pub async fn compile(
    config: &GatewayConfig,
    variables: &Arc<HashMap<String, String>>,
) -> Result<Vec<Arc<Rule>>> {
    let mut rules = Vec::new();

    for (host, patterns) in &config.rules {
        for (pattern, rule_config) in patterns {
            rules.push(compile_rule(config, host, pattern, rule_config, None, variables).await?);
        }
    }

    for (host, binding) in &config.open_api {
        let doc = openapi::load_document(Path::new(&binding.file))?;
        let translation = openapi::translate(&doc, binding.server_index)?;
        info!(
            "openapi: translated, host={}, rules={}, operations={}",
            host,
            translation.rules.len(),
            translation.router.len()
        );
        for translated in &translation.rules {
            let collides = config
                .rules
                .get(host)
                .map(|patterns| patterns.contains_key(&translated.pattern))
                .unwrap_or(false);
            if collides {
                continue;
            }
            let rule_config = RuleConfig {
                origin: translated.origin.clone(),
                strip_prefix: translated.strip_prefix.clone(),
                allowed_methods: translated.allowed_methods.clone(),
                ..RuleConfig::default()
            };
            rules.push(
                compile_rule(
                    config,
                    host,
                    &translated.pattern,
                    &rule_config,
                    Some(translation.router.clone()),
                    variables,
                )
                .await?,
            );
        }
    }

    info!("rules: compiled, count={}", rules.len());
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_method_prefix() {
        let (method, residue) = split_method_prefix("[get] /bananas");
        assert_eq!(method.as_deref(), Some("get"));
        assert_eq!(residue, "/bananas");

        let (method, residue) = split_method_prefix("/bananas");
        assert!(method.is_none());
        assert_eq!(residue, "/bananas");

        let (method, residue) = split_method_prefix("[post]/submit");
        assert_eq!(method.as_deref(), Some("post"));
        assert_eq!(residue, "/submit");
    }

    #[test]
    fn test_compile_pattern_with_vars() {
        let rx = compile_pattern("/users/{id}/posts").unwrap();
        let caps = rx.captures("/users/42/posts").unwrap();
        assert_eq!(&caps["id"], "42");
        assert!(!rx.is_match("/users//posts"));
    }

    #[test]
    fn test_compile_pattern_plain_regex() {
        let rx = compile_pattern("/v2/pets/.*").unwrap();
        assert!(rx.is_match("/v2/pets/42"));
    }

    #[tokio::test]
    async fn test_compile_merges_before_and_after() {
        let yaml = r#"
before:
  request:
    transformers:
      - id: tag
        params: {tags: [pre]}
after:
  request:
    transformers:
      - id: tag
        params: {tags: [post]}
rules:
  "localhost:9001":
    "/todo/.*":
      origin: http://localhost:9999
      request:
        transformers:
          - id: tag
            params: {tags: [own]}
"#;
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        let variables = Arc::new(HashMap::new());
        let rules = compile(&config, &variables).await.unwrap();
        assert_eq!(rules.len(), 1);
        // before + rule + after
        assert_eq!(rules[0].request.transformers.len(), 3);

        let mut wrapper = crate::wrapper::test_wrapper();
        wrapper.rule = Some(rules[0].clone());
        rules[0]
            .request
            .transformers
            .transform(&mut wrapper)
            .await
            .unwrap();
        assert_eq!(
            wrapper.tags,
            vec!["pre".to_string(), "own".to_string(), "post".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sql_pool_only_for_database_origins() {
        assert!(open_sql_pool("http://example.com").unwrap().is_none());
        assert!(open_sql_pool("postgres://u:p@localhost/db").unwrap().is_some());
        assert!(open_sql_pool("mysql://u:p@localhost/db").unwrap().is_some());
    }
}
