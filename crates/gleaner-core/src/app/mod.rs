//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて収集のロジックを実装します。
//! コンポーネントは起動時に collaborator（Arc<dyn …>）を受け取り、グローバルな
//! クライアントは持ちません。
//!
//! # 主要コンポーネント
//! - **TaskGenerator**: 窓の計算、backpressure、retry sweep、タスク投入
//! - **HarvestWorker**: 1 タスクの収集（watermark → 検索 → 重複排除 → 書き込み）
//! - **HarvestController**: 1 回の起動で最大 N タスクを処理して集計
//! - **ControlState**: watermark と last generation の永続化

pub mod backpressure;
pub mod control;
pub mod controller;
pub mod generator;
pub mod retry;
pub mod sweeper;
pub mod worker;

// 主要な型を再エクスポート
pub use self::backpressure::{Backpressure, Gate, QueueHealth, TrimReport};
pub use self::control::{ControlState, WatermarkWrite};
pub use self::controller::HarvestController;
pub use self::generator::{
    GenerationReport, GenerationStatus, TaskGenerator, build_batch, compute_window, priority_for,
};
pub use self::retry::RetryPolicy;
pub use self::sweeper::{RetrySweeper, SweepReport};
pub use self::worker::{HarvestWorker, effective_window};
