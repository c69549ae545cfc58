//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（キュー、ドキュメントストア、コンテンツソース）への
//! インターフェースです。コンポーネントは起動時に実装を受け取り（注入）、
//! グローバルなクライアントは持ちません。テストでは impls の InMemory 実装や
//! フェイクに差し替えます。

pub mod clock;
pub mod content_source;
pub mod document_store;
pub mod id_generator;
pub mod work_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::content_source::{ContentSource, SearchQuery, SortOrder, TimeFilter};
pub use self::document_store::DocumentStore;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::work_queue::{
    DEFAULT_RECLAIM_IDLE, Delivery, GroupInfo, PendingEntry, StreamInfo, WorkQueue,
};
