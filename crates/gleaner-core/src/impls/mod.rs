//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryWorkQueue**: consumer group 付きのプロセス内キュー
//! - **InMemoryDocumentStore**: create-if-absent なプロセス内ストア
//! - **ScriptedContentSource**: 登録済みアイテムを返すソース
//!
//! # 本番用実装
//! Redis / 検索エンジン / 外部 API のクライアントは別クレートに置き、
//! 同じ port を実装します。

pub mod inmem_queue;
pub mod inmem_store;
pub mod scripted_source;

pub use self::inmem_queue::InMemoryWorkQueue;
pub use self::inmem_store::InMemoryDocumentStore;
pub use self::scripted_source::ScriptedContentSource;
