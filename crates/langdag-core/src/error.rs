use thiserror::Error;

use crate::workflow::ValidationError;

#[derive(Debug, Error)]
pub enum LangdagError {
    // Store errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ambiguous prefix '{prefix}' matches {matches} nodes")]
    AmbiguousPrefix { prefix: String, matches: usize },

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Database error: {0}")]
    Database(String),

    // Workflow errors
    #[error("Workflow validation failed:\n{}", format_validation_errors(.0))]
    ValidationFailed(Vec<ValidationError>),

    #[error("Workflow contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Workflow run {root_id} failed: {error}")]
    RunFailed { root_id: String, error: String },

    // Provider errors
    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Provider stream error: {0}")]
    ProviderStream(String),

    #[error("Cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LangdagError {
    /// Whether this error maps to a 404-equivalent for callers.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound(format!("{what} {id}"))
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, LangdagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failed_lists_every_error() {
        let err = LangdagError::ValidationFailed(vec![
            ValidationError::new("name", "name is required"),
            ValidationError::new("nodes", "at least one node is required"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("name: name is required"));
        assert!(msg.contains("nodes: at least one node is required"));
    }

    #[test]
    fn test_not_found_helper() {
        let err = LangdagError::not_found("node", "abc");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Not found: node abc");
        assert!(!LangdagError::Cancelled.is_not_found());
    }
}
