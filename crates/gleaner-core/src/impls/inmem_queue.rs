//! In-memory work queue (開発・テスト用)
//!
//! Redis Streams の consumer group と同じ振る舞いをプロセス内で再現します。
//!
//! # 設計原則
//! - 状態は 1 つの Mutex の中にまとめ、すべての操作はロック内で完結する
//! - idle time は注入された Clock から計算する（テストで FixedClock を進められる）
//! - blocking consume は Notify で append を待つ。待ち時間は tokio の実時間
//! - `set_outage` で障害を模擬でき、その間はすべての操作が `Unavailable`

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::{MessageId, QueueEnvelope, QueueError};
use crate::ports::{Clock, Delivery, GroupInfo, PendingEntry, StreamInfo, WorkQueue};

/// One row of a group's pending list.
#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Everything at or below this id has been handed out once.
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, PendingState>,
    consumers: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    entries: BTreeMap<MessageId, QueueEnvelope>,
    last_id: MessageId,
    groups: BTreeMap<String, GroupState>,
    outage: Option<String>,
}

impl InMemoryQueueState {
    fn check_available(&self) -> Result<(), QueueError> {
        match &self.outage {
            Some(reason) => Err(QueueError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn group_mut(&mut self, group: &str) -> Result<&mut GroupState, QueueError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))
    }

    /// Hands out entries after the group's cursor and records them as pending.
    fn deliver_new(
        &mut self,
        group: &str,
        consumer: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, QueueError> {
        let Self { entries, groups, .. } = self;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;
        state.consumers.insert(consumer.to_string());

        let fresh: Vec<(MessageId, QueueEnvelope)> = entries
            .range((Bound::Excluded(state.last_delivered), Bound::Unbounded))
            .take(count)
            .map(|(id, env)| (*id, env.clone()))
            .collect();

        let mut deliveries = Vec::with_capacity(fresh.len());
        for (message_id, envelope) in fresh {
            state.last_delivered = message_id;
            state.pending.insert(
                message_id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            deliveries.push(Delivery {
                message_id,
                consumer: consumer.to_string(),
                delivery_count: 1,
                envelope,
            });
        }
        Ok(deliveries)
    }
}

/// In-memory [`WorkQueue`] with a single stream.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<InMemoryQueueState>>,
    appended: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

impl InMemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryQueueState::default())),
            appended: Arc::new(Notify::new()),
            clock,
        }
    }

    /// Simulates the queue going away (`Some(reason)`) or coming back (`None`).
    pub async fn set_outage(&self, reason: Option<&str>) {
        self.state.lock().await.outage = reason.map(str::to_string);
    }

    /// Number of entries currently in the stream, ignoring outages.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Decoded payloads of every entry, oldest first.
    pub async fn snapshot(&self) -> Vec<(MessageId, QueueEnvelope)> {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .map(|(id, env)| (*id, env.clone()))
            .collect()
    }

    fn idle_since(&self, delivered_at: DateTime<Utc>) -> Duration {
        (self.clock.now() - delivered_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, envelope: QueueEnvelope) -> Result<MessageId, QueueError> {
        let message_id = {
            let mut state = self.state.lock().await;
            state.check_available()?;
            let now_millis = self.clock.now().timestamp_millis().max(0) as u64;
            let message_id = state.last_id.successor(now_millis);
            state.last_id = message_id;
            state.entries.insert(message_id, envelope);
            message_id
        };
        self.appended.notify_waiters();
        Ok(message_id)
    }

    async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // 取りこぼしを防ぐため、状態を見る前に通知の待ち受けを登録する
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                state.check_available()?;
                let now = self.clock.now();
                let deliveries = state.deliver_new(group, consumer, count, now)?;
                if !deliveries.is_empty() {
                    return Ok(deliveries);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, group: &str, message_id: MessageId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(state.group_mut(group)?.pending.remove(&message_id).is_some())
    }

    async fn pending_range(
        &self,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let group_state = state.group_mut(group)?;
        Ok(group_state
            .pending
            .iter()
            .take(count)
            .map(|(id, p)| PendingEntry {
                message_id: *id,
                consumer: p.consumer.clone(),
                idle: self.idle_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let now = self.clock.now();
        let InMemoryQueueState {
            entries, groups, ..
        } = &mut *state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::NoSuchGroup(group.to_string()))?;
        group_state.consumers.insert(consumer.to_string());

        let mut claimed = Vec::new();
        for id in ids {
            let Some(envelope) = entries.get(id) else {
                // エントリが trim 済みなら pending からも落とす
                group_state.pending.remove(id);
                continue;
            };
            let Some(pending) = group_state.pending.get_mut(id) else {
                continue;
            };
            if self.idle_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(Delivery {
                message_id: *id,
                consumer: consumer.to_string(),
                delivery_count: pending.delivery_count,
                envelope: envelope.clone(),
            });
        }
        Ok(claimed)
    }

    async fn read(&self, message_id: MessageId) -> Result<Option<QueueEnvelope>, QueueError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.entries.get(&message_id).cloned())
    }

    async fn trim(&self, max_len: usize) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut removed = 0;
        while state.entries.len() > max_len {
            if state.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    async fn info(&self) -> Result<StreamInfo, QueueError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let groups = state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len(),
                pending: g.pending.len(),
                lag: state
                    .entries
                    .range((Bound::Excluded(g.last_delivered), Bound::Unbounded))
                    .count(),
            })
            .collect();
        Ok(StreamInfo {
            length: state.entries.len(),
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    const GROUP: &str = "harvesters";

    fn setup() -> (Arc<FixedClock>, InMemoryWorkQueue) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let queue = InMemoryWorkQueue::new(clock.clone());
        (clock, queue)
    }

    #[tokio::test]
    async fn ids_increase_under_a_frozen_clock() {
        let (_clock, queue) = setup();
        let a = queue.append(QueueEnvelope::new("a")).await.unwrap();
        let b = queue.append(QueueEnvelope::new("b")).await.unwrap();
        assert!(b > a);
        assert_eq!(a.millis(), b.millis());
        assert_eq!(b.seq(), a.seq() + 1);
    }

    #[tokio::test]
    async fn consume_is_fifo_and_leaves_entries_pending() {
        let (_clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();
        let first = queue.append(QueueEnvelope::new("1")).await.unwrap();
        queue.append(QueueEnvelope::new("2")).await.unwrap();

        let got = queue
            .consume(GROUP, "w1", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_id, first);
        assert_eq!(got[0].envelope.task_data, "1");

        let info = queue.info().await.unwrap();
        assert_eq!(info.length, 2);
        assert_eq!(info.groups[0].pending, 1);
        assert_eq!(info.groups[0].lag, 1);

        assert!(queue.ack(GROUP, first).await.unwrap());
        assert!(!queue.ack(GROUP, first).await.unwrap());
        assert_eq!(queue.info().await.unwrap().groups[0].pending, 0);
    }

    #[tokio::test]
    async fn empty_consume_returns_after_block() {
        let (_clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();
        let got = queue
            .consume(GROUP, "w1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn blocking_consume_wakes_on_append() {
        let (_clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();

        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            consumer
                .consume(GROUP, "w1", 1, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.append(QueueEnvelope::new("late")).await.unwrap();

        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].envelope.task_data, "late");
    }

    #[tokio::test]
    async fn claim_requires_idle_time() {
        let (clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();
        let id = queue.append(QueueEnvelope::new("x")).await.unwrap();
        queue.consume(GROUP, "w1", 1, Duration::ZERO).await.unwrap();

        let early = queue
            .claim(GROUP, "w2", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert!(early.is_empty());

        clock.advance(chrono::Duration::seconds(61));
        let claimed = queue
            .claim(GROUP, "w2", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].consumer, "w2");
        assert_eq!(claimed[0].delivery_count, 2);

        let pending = queue.pending_range(GROUP, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "w2");
        assert_eq!(pending[0].idle, Duration::ZERO);
    }

    #[tokio::test]
    async fn claiming_a_trimmed_entry_drops_it_from_pending() {
        let (clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();
        let id = queue.append(QueueEnvelope::new("x")).await.unwrap();
        queue.consume(GROUP, "w1", 1, Duration::ZERO).await.unwrap();
        assert_eq!(queue.trim(0).await.unwrap(), 1);

        clock.advance(chrono::Duration::minutes(5));
        let claimed = queue
            .claim(GROUP, "w2", Duration::from_secs(60), &[id])
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert!(queue.pending_range(GROUP, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trim_keeps_the_newest() {
        let (_clock, queue) = setup();
        for i in 0..5 {
            queue.append(QueueEnvelope::new(i.to_string())).await.unwrap();
        }
        assert_eq!(queue.trim(2).await.unwrap(), 3);
        let left: Vec<String> = queue
            .snapshot()
            .await
            .into_iter()
            .map(|(_, e)| e.task_data)
            .collect();
        assert_eq!(left, vec!["3", "4"]);
        assert_eq!(queue.trim(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outage_fails_every_operation() {
        let (_clock, queue) = setup();
        queue.ensure_group(GROUP).await.unwrap();
        queue.set_outage(Some("connection refused")).await;

        assert!(matches!(
            queue.append(QueueEnvelope::new("x")).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(queue.info().await.is_err());
        assert!(queue.consume(GROUP, "w1", 1, Duration::ZERO).await.is_err());

        queue.set_outage(None).await;
        assert!(queue.append(QueueEnvelope::new("x")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_group_is_an_error() {
        let (_clock, queue) = setup();
        let err = queue
            .consume("nobody", "w1", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoSuchGroup(_)));
    }
}
