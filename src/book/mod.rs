//! Order book aggregation
//!
//! Materializes quote and snapshot streams into per-instrument books that
//! merge every origin quoting the instrument.

mod aggregated;
mod level;
mod registry;

pub use aggregated::{AggregatedBook, LevelTwoView, TopOfBook};
pub use level::{AggregatedBookLevel, UNKNOWN_ORIGIN};
pub use registry::{BookRegistry, SharedBook};
