use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+?)\}\}").expect("placeholder pattern is valid"))
}

/// Substitute `{{key}}` and `{{key.output}}` placeholders from `state`.
///
/// Strings are inserted verbatim, every other value as compact JSON.
/// Placeholders naming an absent key are left untouched.
pub fn render(template: &str, state: &HashMap<String, Value>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let key = caps[1].trim();
            match lookup(key, state) {
                Some(value) => to_text(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn lookup<'a>(key: &str, state: &'a HashMap<String, Value>) -> Option<&'a Value> {
    state
        .get(key)
        .or_else(|| key.strip_suffix(".output").and_then(|stem| state.get(stem)))
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> HashMap<String, Value> {
        HashMap::from([
            ("input".to_string(), json!("hello")),
            ("summary".to_string(), json!("short")),
            ("data".to_string(), json!({"n": 1})),
        ])
    }

    #[test]
    fn test_plain_and_output_suffix() {
        let out = render("echo: {{input}} / {{summary.output}}", &state());
        assert_eq!(out, "echo: hello / short");
    }

    #[test]
    fn test_non_string_values_render_as_json() {
        assert_eq!(render("{{ data }}", &state()), r#"{"n":1}"#);
    }

    #[test]
    fn test_unknown_keys_left_verbatim() {
        assert_eq!(render("{{missing}} {{input}}", &state()), "{{missing}} hello");
    }

    #[test]
    fn test_no_placeholders() {
        assert_eq!(render("nothing here", &state()), "nothing here");
    }
}
