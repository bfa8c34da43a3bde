//! SQLite substrate for the node tree and workflow templates.

mod schema;
pub mod store;
mod workflows;

pub use store::SqliteStore;
