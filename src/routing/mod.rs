use crate::rules::Rule;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Host-partitioned route table with deterministic pattern ordering.
///
/// Rules are keyed by the configured host (port included) and ordered
/// once at build time:
/// 1. static patterns (no `{var}` templates) before dynamic ones,
/// 2. longer patterns before shorter within the same class,
/// 3. method-constrained entries before unconstrained for the same
///    pattern, so a `[get]` variant wins for GET,
/// 4. lexicographic as the final tie-break, so overlapping patterns
///    always resolve the same way.
///
/// Matching scans the host's ordered list and binds the first rule whose
/// method slot accepts the request and whose regex matches the path.
pub struct RouteTable {
    hosts: HashMap<String, Vec<Arc<Rule>>>,
    rule_count: usize,
}

impl RouteTable {
    pub fn new(rules: Vec<Arc<Rule>>) -> Self {
        let rule_count = rules.len();
        let mut hosts: HashMap<String, Vec<Arc<Rule>>> = HashMap::new();
        for rule in rules {
            hosts.entry(rule.host.clone()).or_default().push(rule);
        }
        for group in hosts.values_mut() {
            group.sort_by(|a, b| {
                b.is_static
                    .cmp(&a.is_static)
                    .then(b.pattern_source.len().cmp(&a.pattern_source.len()))
                    .then(b.pattern_method.is_some().cmp(&a.pattern_method.is_some()))
                    .then(a.pattern_source.cmp(&b.pattern_source))
            });
        }
        info!(
            "routing: table built, hosts={}, rules={}",
            hosts.len(),
            rule_count
        );
        Self { hosts, rule_count }
    }

    /// Bind a rule to the request, returning path variables captured from
    /// `{var}` pattern segments.
    pub fn match_rule(
        &self,
        host: &str,
        method: &str,
        path: &str,
    ) -> Option<(Arc<Rule>, HashMap<String, String>)> {
        let group = self.hosts.get(host)?;
        let method = method.to_ascii_lowercase();
        for rule in group {
            if let Some(slot) = &rule.pattern_method {
                if *slot != method {
                    continue;
                }
            }
            if let Some(captures) = rule.pattern.captures(path) {
                let params: HashMap<String, String> = rule
                    .pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), m.as_str().to_string()))
                    })
                    .collect();
                return Some((rule.clone(), params));
            }
        }
        None
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }
}
