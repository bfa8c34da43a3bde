pub mod conversation;
mod stream;
pub mod workflow;

pub use conversation::{auto_title, ConversationEngine};
pub use workflow::{
    parse_file, parse_json, parse_yaml, to_yaml, topological_sort, validate, RunOptions, RunResult,
    ValidationResult, WorkflowExecutor, WorkflowManager,
};
