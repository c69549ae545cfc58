//! Domain model (IDs, task descriptor, windows, items, writes, reports).
//!
//! ここにはキューやストアの実装詳細を持ち込みません。

pub mod decision;
pub mod document;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod task;
pub mod window;

pub use decision::{DefaultRetryDecider, RetryDecider, SweepDecision};
pub use document::{BulkWriteSummary, IndexAction, WriteResult, WriteStatus};
pub use envelope::QueueEnvelope;
pub use errors::{
    ErrorKind, GenerateError, HarvestError, QueueError, SourceError, StoreError, TaskDecodeError,
};
pub use ids::{IdParseError, MessageId, RunId, TaskId};
pub use item::CandidateItem;
pub use outcome::{BatchReport, BatchStatus, TaskReport, TaskStatus};
pub use task::{CrawlMode, GroupKey, HarvestTask, Priority};
pub use window::TimeWindow;
