//! Sub-question routing
//!
//! - `QueryClassifier`: structured vs unstructured, by nearest exemplar
//! - `TableRouter`: closest table schema for structured sub-questions

mod classifier;
mod table_router;

pub use classifier::QueryClassifier;
pub use table_router::{TableRoute, TableRouter};
