use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("static regex"))
}

/// Resolve a dotted path with numeric indexing against a JSON root.
///
/// `trigger.message.body`, `chunks.0.text` and similar. Returns `None` when
/// any segment is missing.
pub fn resolve_path(root: &Value, path: &str) -> Option<Value> {
    let mut current = root;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Evaluate one `{{...}}` expression: a path with an optional chain of
/// `||` fallbacks. A fallback arm in quotes is a literal.
fn eval_expression(root: &Value, expression: &str) -> Option<Value> {
    for arm in expression.split("||") {
        let arm = arm.trim();
        if arm.is_empty() {
            continue;
        }
        if (arm.starts_with('"') && arm.ends_with('"') && arm.len() >= 2)
            || (arm.starts_with('\'') && arm.ends_with('\'') && arm.len() >= 2)
        {
            return Some(Value::String(arm[1..arm.len() - 1].to_string()));
        }
        if let Some(value) = resolve_path(root, arm) {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

/// Render a template, replacing every `{{path}}` reference from the context.
///
/// Unresolved references become the empty string and the originating
/// template is recorded for debugging.
pub fn render(template: &str, root: &Value, unresolved: &mut Vec<String>) -> String {
    template_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let expression = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            match eval_expression(root, expression) {
                Some(value) => value_to_string(&value),
                None => {
                    unresolved.push(template.to_string());
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Render a template and return the resolved JSON value when the template is
/// a single reference; falls back to the rendered string otherwise. Keeps
/// structured values structured when a node config is exactly `{{path}}`.
pub fn render_value(template: &str, root: &Value, unresolved: &mut Vec<String>) -> Value {
    let trimmed = template.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") {
            return match eval_expression(root, inner) {
                Some(value) => value,
                None => {
                    unresolved.push(template.to_string());
                    Value::String(String::new())
                }
            };
        }
    }
    Value::String(render(template, root, unresolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "trigger": {
                "message": {"body": "hello world", "senderName": "Alice"},
            },
            "vars": {"count": 3, "flag": true},
            "chunks": [{"text": "first"}, {"text": "second"}],
        })
    }

    #[test]
    fn dotted_paths_resolve() {
        let mut unresolved = Vec::new();
        assert_eq!(
            render("hi {{trigger.message.senderName}}", &ctx(), &mut unresolved),
            "hi Alice"
        );
        assert!(unresolved.is_empty());
    }

    #[test]
    fn numeric_indexing() {
        let mut unresolved = Vec::new();
        assert_eq!(render("{{chunks.1.text}}", &ctx(), &mut unresolved), "second");
    }

    #[test]
    fn missing_reference_becomes_empty_and_is_recorded() {
        let mut unresolved = Vec::new();
        assert_eq!(render("x={{vars.absent}}", &ctx(), &mut unresolved), "x=");
        assert_eq!(unresolved, vec!["x={{vars.absent}}".to_string()]);
    }

    #[test]
    fn fallback_operator() {
        let mut unresolved = Vec::new();
        assert_eq!(
            render("{{vars.absent || trigger.message.body}}", &ctx(), &mut unresolved),
            "hello world"
        );
        assert_eq!(
            render("{{vars.absent || \"n/a\"}}", &ctx(), &mut unresolved),
            "n/a"
        );
        assert!(unresolved.is_empty());
    }

    #[test]
    fn numbers_and_bools_render_bare() {
        let mut unresolved = Vec::new();
        assert_eq!(
            render("{{vars.count}}/{{vars.flag}}", &ctx(), &mut unresolved),
            "3/true"
        );
    }

    #[test]
    fn single_reference_keeps_structure() {
        let mut unresolved = Vec::new();
        let value = render_value("{{chunks}}", &ctx(), &mut unresolved);
        assert!(value.is_array());
        let value = render_value("n={{vars.count}}", &ctx(), &mut unresolved);
        assert_eq!(value, json!("n=3"));
    }

    #[test]
    fn rendering_is_idempotent_for_same_input() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        let first = render("{{trigger.message.body}}!", &ctx(), &mut a);
        let second = render("{{trigger.message.body}}!", &ctx(), &mut b);
        assert_eq!(first, second);
    }
}
