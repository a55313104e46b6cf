use anyhow::{Context, Result};
use openapiv3::{OpenAPI, Operation, Parameter, PathItem, ReferenceOr};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

/// Where a required parameter is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Query,
    Header,
    Path,
}

#[derive(Debug, Clone)]
pub struct RequiredParam {
    pub name: String,
    pub location: ParamLocation,
}

/// One operation of the bound document, compiled for request-time lookup.
pub struct CompiledOperation {
    pub method: String,
    pub path_template: String,
    regex: Regex,
    pub required_params: Vec<RequiredParam>,
    pub body_required: bool,
}

/// Request-time index over a document's operations, owned by the rules
/// translated from it and consulted by the validator transformer.
pub struct OperationRouter {
    operations: Vec<CompiledOperation>,
}

impl OperationRouter {
    pub fn find(&self, method: &str, path: &str) -> Option<&CompiledOperation> {
        let method = method.to_ascii_lowercase();
        self.operations
            .iter()
            .find(|op| op.method == method && op.regex.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A rule produced from one documented path.
pub struct TranslatedRule {
    pub pattern: String,
    pub origin: String,
    pub strip_prefix: String,
    pub allowed_methods: Vec<String>,
}

pub struct Translation {
    pub rules: Vec<TranslatedRule>,
    pub router: Arc<OperationRouter>,
}

pub fn load_document(path: &Path) -> Result<OpenAPI> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("could not read OpenAPI document {}", path.display()))?;
    let doc = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&data)?,
        _ => serde_yaml::from_str(&data)?,
    };
    Ok(doc)
}

/// Turn a document into routing rules: the selected server supplies the
/// origin and the strip prefix, each documented path becomes a pattern
/// with its `{var}` segments widened, and the method set comes from the
/// operations present on the path.
pub fn translate(doc: &OpenAPI, server_index: usize) -> Result<Translation> {
    let server = doc
        .servers
        .get(server_index)
        .with_context(|| format!("OpenAPI document has no server index {server_index}"))?;
    let server_url = url::Url::parse(&server.url)
        .with_context(|| format!("invalid OpenAPI server url {}", server.url))?;
    let base_path = server_url.path().trim_end_matches('/').to_string();

    let mut rules = Vec::new();
    let mut operations = Vec::new();

    for (path, item) in doc.paths.paths.iter() {
        let ReferenceOr::Item(item) = item else {
            continue;
        };
        let full_template = format!("{base_path}{path}");
        let pattern = widen_template(&full_template);
        let methods: Vec<String> = path_operations(item)
            .map(|(method, _)| method.to_string())
            .collect();
        if methods.is_empty() {
            continue;
        }

        rules.push(TranslatedRule {
            pattern,
            origin: server.url.clone(),
            strip_prefix: base_path.clone(),
            allowed_methods: methods,
        });

        for (method, op) in path_operations(item) {
            operations.push(compile_operation(method, &full_template, item, op)?);
        }
    }

    Ok(Translation {
        rules,
        router: Arc::new(OperationRouter { operations }),
    })
}

fn path_operations(item: &PathItem) -> impl Iterator<Item = (&'static str, &Operation)> {
    [
        ("get", item.get.as_ref()),
        ("post", item.post.as_ref()),
        ("put", item.put.as_ref()),
        ("patch", item.patch.as_ref()),
        ("delete", item.delete.as_ref()),
        ("options", item.options.as_ref()),
    ]
    .into_iter()
    .filter_map(|(m, op)| op.map(|op| (m, op)))
}

/// Replace `{var}` template segments with a wildcard. The result is a
/// routing pattern, not an anchor-exact matcher.
fn widen_template(template: &str) -> String {
    let repl = Regex::new(r"\{.*?\}").expect("static regex");
    repl.replace_all(template, ".*").into_owned()
}

/// Exact-match regex for an operation path: literal segments escaped,
/// `{var}` segments matching one path element.
fn template_regex(template: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        pattern.push_str(&regex::escape(&rest[..open]));
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        pattern.push_str("[^/]+");
        rest = &rest[open + close + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');
    Regex::new(&pattern).context("operation path does not compile")
}

fn compile_operation(
    method: &str,
    template: &str,
    item: &PathItem,
    op: &Operation,
) -> Result<CompiledOperation> {
    let mut required_params = Vec::new();
    for parameter in item.parameters.iter().chain(op.parameters.iter()) {
        let ReferenceOr::Item(parameter) = parameter else {
            continue;
        };
        let (location, data) = match parameter {
            Parameter::Query { parameter_data, .. } => (ParamLocation::Query, parameter_data),
            Parameter::Header { parameter_data, .. } => (ParamLocation::Header, parameter_data),
            Parameter::Path { parameter_data, .. } => (ParamLocation::Path, parameter_data),
            Parameter::Cookie { .. } => continue,
        };
        if data.required || location == ParamLocation::Path {
            required_params.push(RequiredParam {
                name: data.name.clone(),
                location,
            });
        }
    }

    let body_required = match &op.request_body {
        Some(ReferenceOr::Item(body)) => body.required,
        _ => false,
    };

    Ok(CompiledOperation {
        method: method.to_string(),
        path_template: template.to_string(),
        regex: template_regex(template)?,
        required_params,
        body_required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
openapi: 3.0.0
info: {title: pets, version: "1.0"}
servers:
  - url: https://api.example.com/v2
paths:
  /pets:
    get: {responses: {}}
    post:
      requestBody:
        required: true
        content: {application/json: {schema: {type: object}}}
      responses: {}
  /pets/{petId}:
    get:
      parameters:
        - name: petId
          in: path
          required: true
          schema: {type: string}
        - name: verbose
          in: query
          required: true
          schema: {type: boolean}
      responses: {}
"#;

    fn translation() -> Translation {
        let doc: OpenAPI = serde_yaml::from_str(DOC).unwrap();
        translate(&doc, 0).unwrap()
    }

    #[test]
    fn test_translate_patterns_and_methods() {
        let t = translation();
        assert_eq!(t.rules.len(), 2);
        let pets = t.rules.iter().find(|r| r.pattern == "/v2/pets").unwrap();
        assert_eq!(pets.origin, "https://api.example.com/v2");
        assert_eq!(pets.strip_prefix, "/v2");
        assert!(pets.allowed_methods.contains(&"get".to_string()));
        assert!(pets.allowed_methods.contains(&"post".to_string()));

        let by_id = t.rules.iter().find(|r| r.pattern == "/v2/pets/.*").unwrap();
        assert_eq!(by_id.allowed_methods, vec!["get".to_string()]);
    }

    #[test]
    fn test_router_finds_operation() {
        let t = translation();
        let op = t.router.find("GET", "/v2/pets/42").unwrap();
        assert_eq!(op.method, "get");
        assert!(op
            .required_params
            .iter()
            .any(|p| p.name == "verbose" && p.location == ParamLocation::Query));
        assert!(t.router.find("get", "/v2/unknown").is_none());
    }

    #[test]
    fn test_body_requirement_compiled() {
        let t = translation();
        let post = t.router.find("post", "/v2/pets").unwrap();
        assert!(post.body_required);
        let get = t.router.find("get", "/v2/pets").unwrap();
        assert!(!get.body_required);
    }
}
