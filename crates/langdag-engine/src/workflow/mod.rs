//! Workflow DAG engine.
//!
//! A workflow is a declared list of typed nodes joined by edges. Definitions
//! are parsed from YAML or JSON, checked by the validator, ordered with
//! Kahn's algorithm and run one node at a time. Each node's output is kept
//! in a state map that later prompt templates can reference as `{{id}}`.

pub mod dag;
pub mod executor;
pub mod manager;
pub mod parser;
pub mod template;
pub mod validator;

pub use dag::topological_sort;
pub use executor::{RunOptions, RunResult, WorkflowExecutor};
pub use manager::WorkflowManager;
pub use parser::{parse_file, parse_json, parse_yaml, to_yaml};
pub use validator::{validate, ValidationResult, INPUT_KEY};
