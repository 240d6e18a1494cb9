//! Batch mode: one isolated execution per content item, run concurrently and
//! joined before aggregation.

pub mod processor;
pub mod types;

pub use processor::BatchProcessor;
pub use types::{BatchItemResult, BatchItemStatus, BatchSettings, expand_items};
