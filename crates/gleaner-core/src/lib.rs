//! gleaner-core
//!
//! Core of a distributed harvest task queue: time-windowed task generation,
//! consumer-group dispatch with crash recovery, idempotent harvesting and
//! backpressure control.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, window, item, document, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（WorkQueue, DocumentStore, ContentSource, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（generator, worker, controller, control, backpressure, sweeper）
//! - **impls**: 実装（InMemory キュー・ストア、スクリプト化したソース）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use config::{ConfigError, HarvestConfig};
