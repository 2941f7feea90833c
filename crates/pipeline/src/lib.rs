//! Rate-limited update pipeline for bulk field-update jobs.
//!
//! - [`UpdatePipeline`] walks a job's rows in order, converts mapped cells
//!   into typed field writes and applies them through the shared
//!   [`RateLimiter`].
//! - Collaborators are traits: [`RowSource`], [`FieldResolver`],
//!   [`RecordUpdater`], [`JobStore`] and [`ProgressSink`].
//! - [`PgJobStore`] and [`HttpRecordUpdater`] are the production
//!   implementations; `MemoryJobStore` (feature `test-support`) backs tests.

pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod progress;
pub mod rate_limit;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod source;
pub mod store;
pub mod updater;

pub use config::PipelineConfig;
pub use error::{PipelineError, StoreError, UpdateError};
pub use progress::{ProgressSink, ProgressUpdate};
pub use rate_limit::RateLimiter;
pub use resolver::{FieldResolver, MappingResolver};
pub use runner::{PipelineRun, RunOutcome, UpdatePipeline};
pub use source::{RowSource, SourceRow};
pub use store::{JobStore, PgJobStore};
pub use updater::{FieldWrite, HttpRecordUpdater, RecordUpdater};
