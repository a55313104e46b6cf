use minijinja::value::Value;
use minijinja::Environment;
use std::collections::HashMap;

/// Template rendering used everywhere a config string may reference
/// runtime data: config loading (environment variables), transformer
/// params (the wrapper surface) and payload bodies.
///
/// The engine is treated as a pure `(template, scope) → string` function.
/// A string without template markers renders to itself, so every config
/// field can be fed through unconditionally.
pub fn render(template: &str, scope: &Value) -> Result<String, minijinja::Error> {
    // Fast path: nothing to expand.
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }
    let env = Environment::new();
    env.render_str(template, scope)
}

/// Render a primary template with named sibling sub-templates available
/// to `{% include %}` — the payload transformer's contract.
pub fn render_with_subs(
    template: &str,
    subs: &HashMap<String, String>,
    scope: &Value,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    for (name, source) in subs {
        env.add_template_owned(name.clone(), source.clone())?;
    }
    env.render_str(template, scope)
}

/// Scope for config-load time: just the process environment.
pub fn env_scope() -> Value {
    let env: HashMap<String, String> = std::env::vars().collect();
    Value::from_serialize(&serde_json::json!({ "env": env }))
}

/// Scope for transformer-construction time: configured variables plus the
/// process environment.
pub fn config_scope(variables: &HashMap<String, String>) -> Value {
    let env: HashMap<String, String> = std::env::vars().collect();
    Value::from_serialize(&serde_json::json!({
        "variables": variables,
        "env": env,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plain_string_passthrough() {
        let scope = env_scope();
        assert_eq!(render("no markers here", &scope).unwrap(), "no markers here");
    }

    #[test]
    fn test_render_env_variable() {
        std::env::set_var("RELAY_TEMPLATE_TEST", "hello");
        let scope = env_scope();
        assert_eq!(
            render("{{ env.RELAY_TEMPLATE_TEST }}!", &scope).unwrap(),
            "hello!"
        );
    }

    #[test]
    fn test_render_config_variables() {
        let mut vars = HashMap::new();
        vars.insert("origin".to_string(), "http://example.com".to_string());
        let scope = config_scope(&vars);
        assert_eq!(
            render("{{ variables.origin }}/v1", &scope).unwrap(),
            "http://example.com/v1"
        );
    }

    #[test]
    fn test_render_undefined_is_empty() {
        let scope = env_scope();
        assert_eq!(render("[{{ nothing.here }}]", &scope).unwrap(), "[]");
    }

    #[test]
    fn test_render_with_subs() {
        let mut subs = HashMap::new();
        subs.insert("inner".to_string(), "sub({{ x }})".to_string());
        let scope = Value::from_serialize(&serde_json::json!({ "x": 7 }));
        assert_eq!(
            render_with_subs("a {% include 'inner' %} b", &subs, &scope).unwrap(),
            "a sub(7) b"
        );
    }
}
