pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{LangdagError, Result};
pub use event::{ConversationEvent, EventSender, EventStream, ExecutionEvent};
pub use traits::{NodeStore, Provider, WorkflowStore};
pub use types::*;
pub use workflow::*;
