//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + Phantom type
//! 実行（run）は ULID で識別します。
//! `Id<T>` というジェネリック型で共通実装を提供し、`T` はマーカー型として
//! コンパイル時に別種の ID との混同を防ぎます。
//!
//! # TaskId
//! タスク記述子の `task_id` はワイヤ上ただの string です。ここで生成する ID は
//! `task-<ULID>` ですが、decode 時は空でない任意の文字列を受け付けます。
//!
//! # MessageId
//! キューが割り当てる配送 ID。`<millis>-<seq>` 形式で、append 順に単調増加します。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "task-"）
    fn prefix() -> &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdParseError {
    #[error("expected prefix {expected:?} in {value:?}")]
    MissingPrefix { expected: &'static str, value: String },

    #[error("invalid ulid in {value:?}: {reason}")]
    InvalidUlid { value: String, reason: String },

    #[error("task id is empty")]
    EmptyTaskId,

    #[error("invalid message id {0:?}, expected <millis>-<seq>")]
    InvalidMessageId(String),
}

/// ジェネリック ID 型
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(T::prefix())
            .ok_or_else(|| IdParseError::MissingPrefix {
                expected: T::prefix(),
                value: s.to_string(),
            })?;
        let ulid = Ulid::from_string(raw).map_err(|e| IdParseError::InvalidUlid {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Run（controller / generator の 1 回の起動）のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

/// Identifier of a harvest task (unique per generation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub const PREFIX: &'static str = "task-";

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{}{}", Self::PREFIX, ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ULID part, for ids minted by this crate.
    pub fn as_ulid(&self) -> Option<Ulid> {
        self.0
            .strip_prefix(Self::PREFIX)
            .and_then(|raw| Ulid::from_string(raw).ok())
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(IdParseError::EmptyTaskId);
        }
        Ok(Self(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of one generator or controller invocation.
pub type RunId = Id<Run>;

/// Queue-assigned delivery id, ordered by `(millis, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MessageId {
    millis: u64,
    seq: u64,
}

impl MessageId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The smallest id strictly greater than `self` for an append at `now_millis`.
    ///
    /// A clock that went backwards keeps the previous millis and bumps the sequence.
    pub fn successor(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdParseError::InvalidMessageId(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self::new(
            millis.parse().map_err(|_| invalid())?,
            seq.parse().map_err(|_| invalid())?,
        ))
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_display_with_prefix_and_parse_back() {
        let run = RunId::from_ulid(Ulid::new());
        assert!(run.to_string().starts_with("run-"));

        let parsed: RunId = run.to_string().parse().unwrap();
        assert_eq!(parsed, run);

        assert!(matches!(
            "task-01HV5Z8K6X4M2Q7A9B3C5D7E9F".parse::<RunId>(),
            Err(IdParseError::MissingPrefix { .. })
        ));
    }

    #[test]
    fn minted_task_ids_carry_their_ulid() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);
        assert_eq!(task.to_string(), format!("task-{ulid}"));
        assert_eq!(task.as_ulid(), Some(ulid));

        let json = serde_json::to_string(&task).unwrap();
        assert_eq!(json, format!("\"{task}\""));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn task_ids_from_other_producers_are_kept_verbatim() {
        let back: TaskId = serde_json::from_str("\"historical_housing_rent_1717200000\"").unwrap();
        assert_eq!(back.as_str(), "historical_housing_rent_1717200000");
        assert_eq!(back.as_ulid(), None);

        assert!(serde_json::from_str::<TaskId>("\"  \"").is_err());
        assert_eq!("".parse::<TaskId>(), Err(IdParseError::EmptyTaskId));
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<RunId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn message_ids_order_by_millis_then_seq() {
        let a = MessageId::new(1_000, 0);
        let b = a.successor(1_000);
        let c = b.successor(999);
        let d = c.successor(2_000);

        assert_eq!(b, MessageId::new(1_000, 1));
        assert_eq!(c, MessageId::new(1_000, 2));
        assert_eq!(d, MessageId::new(2_000, 0));
        assert!(a < b && b < c && c < d);
    }

    #[test]
    fn message_id_parses_redis_style() {
        let id: MessageId = "1717200000000-3".parse().unwrap();
        assert_eq!(id, MessageId::new(1_717_200_000_000, 3));
        assert_eq!(id.to_string(), "1717200000000-3");
        assert!("17172".parse::<MessageId>().is_err());
        assert!("a-b".parse::<MessageId>().is_err());
    }
}
