use std::path::Path;

use langdag_core::error::{LangdagError, Result};
use langdag_core::workflow::Workflow;

pub fn parse_yaml(text: &str) -> Result<Workflow> {
    serde_yaml::from_str(text).map_err(|e| LangdagError::Parse(format!("invalid workflow YAML: {e}")))
}

pub fn parse_json(text: &str) -> Result<Workflow> {
    serde_json::from_str(text).map_err(|e| LangdagError::Parse(format!("invalid workflow JSON: {e}")))
}

/// Read a workflow definition, picking the format from the extension.
/// Anything that is not `.json` is read as YAML.
pub fn parse_file(path: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => parse_json(&text),
        _ => parse_yaml(&text),
    }
}

/// Serialise a workflow as a YAML definition, without storage identity or
/// timestamps.
pub fn to_yaml(workflow: &Workflow) -> Result<String> {
    let mut value = serde_json::to_value(workflow)?;
    if let Some(obj) = value.as_object_mut() {
        for key in ["id", "created_at", "updated_at"] {
            obj.remove(key);
        }
    }
    serde_yaml::to_string(&value).map_err(|e| LangdagError::Parse(format!("cannot render YAML: {e}")))
}
