pub mod history;
pub mod incremental;

pub use history::{HistoryReport, HistorySync, MAX_CONSECUTIVE_PAGE_FAILURES};
pub use incremental::{IncrementalReport, IncrementalSync};
