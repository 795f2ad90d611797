//! # In-Memory Queue Store
//!
//! Thread-safe in-memory implementation of [`QueueStore`] for tests and
//! local development.
//!
//! ## Features
//!
//! - **Consumer groups**: per-group cursor and pending entries list, with
//!   idle-time based reclaim
//! - **Wakeups**: blocked consumers are woken on push/append/promote instead
//!   of polling
//! - **Paused-time friendly**: idle and due times use `tokio::time::Instant`,
//!   so tests can drive reclaim and retry timing with `tokio::time::advance`
//! - **Fault injection**: `fail_next_appends` makes the next appends to a
//!   log fail, for exercising dead-letter escalation

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::messaging::errors::QueueError;
use crate::messaging::store::QueueStore;
use crate::messaging::types::{
    ClaimInfo, DeliveryMode, MessageId, QueueName, QueueStats, StoredMessage,
};

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    payload: Vec<u8>,
    enqueued_at: DateTime<Utc>,
}

impl Entry {
    fn to_message(&self, delivery_count: u32, claim: Option<ClaimInfo>) -> StoredMessage {
        StoredMessage {
            id: MessageId::from(self.id),
            payload: self.payload.clone(),
            enqueued_at: self.enqueued_at,
            delivery_count,
            claim,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    claimed_at: Instant,
    claimed_at_wall: DateTime<Utc>,
    delivery_count: u32,
}

impl PendingEntry {
    fn claim_info(&self) -> ClaimInfo {
        ClaimInfo {
            consumer: self.consumer.clone(),
            claimed_at: self.claimed_at_wall,
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    /// Highest entry id handed out by `read_group`
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct Log {
    entries: BTreeMap<u64, Entry>,
    groups: HashMap<String, ConsumerGroup>,
    failures_to_inject: u32,
}

impl Log {
    /// Drop entries every group has delivered and acknowledged
    ///
    /// Logs without groups (dead-letter logs) keep everything.
    fn trim(&mut self) {
        if self.groups.is_empty() {
            return;
        }
        let floor = self
            .groups
            .values()
            .map(|g| {
                let oldest_pending = g.pending.keys().next().copied().unwrap_or(u64::MAX);
                oldest_pending.min(g.last_delivered.saturating_add(1))
            })
            .min()
            .unwrap_or(0);
        self.entries = self.entries.split_off(&floor);
    }
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: u64,
    lists: HashMap<String, VecDeque<Entry>>,
    logs: HashMap<String, Log>,
    /// Deferred sets keyed by live queue name, ordered by (due, sequence)
    deferred: HashMap<String, BTreeMap<(Instant, u64), Vec<u8>>>,
    notifiers: HashMap<String, Arc<Notify>>,
}

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notifier(&mut self, queue: &str) -> Arc<Notify> {
        self.notifiers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn push_list(&mut self, queue: &str, payload: Vec<u8>) -> u64 {
        let id = self.allocate_id();
        self.lists.entry(queue.to_string()).or_default().push_back(Entry {
            id,
            payload,
            enqueued_at: Utc::now(),
        });
        id
    }

    fn append_log(&mut self, queue: &str, payload: Vec<u8>) -> Result<u64, QueueError> {
        let id = self.allocate_id();
        let log = self.logs.entry(queue.to_string()).or_default();
        if log.failures_to_inject > 0 {
            log.failures_to_inject -= 1;
            return Err(QueueError::backend("append", format!("injected failure on {queue}")));
        }
        log.entries.insert(
            id,
            Entry {
                id,
                payload,
                enqueued_at: Utc::now(),
            },
        );
        Ok(id)
    }
}

/// In-memory queue store
///
/// All state sits behind one mutex; no lock is held across an await point.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    state: Mutex<StoreState>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends to `queue` fail with a backend error
    pub fn fail_next_appends(&self, queue: &QueueName, count: u32) {
        let mut state = self.state.lock();
        state
            .logs
            .entry(queue.to_string())
            .or_default()
            .failures_to_inject = count;
    }

    /// Number of live entries in a list or log (for testing)
    pub fn len(&self, queue: &QueueName) -> usize {
        let state = self.state.lock();
        let key = queue.to_string();
        match queue.mode() {
            DeliveryMode::List => state.lists.get(&key).map_or(0, VecDeque::len),
            DeliveryMode::Stream => state.logs.get(&key).map_or(0, |l| l.entries.len()),
        }
    }

    /// Number of payloads waiting in the deferred set (for testing)
    pub fn deferred_len(&self, queue: &QueueName) -> usize {
        let state = self.state.lock();
        state
            .deferred
            .get(&queue.to_string())
            .map_or(0, BTreeMap::len)
    }

    /// Earliest due time in the deferred set, relative to now (for testing)
    pub fn next_due_in(&self, queue: &QueueName) -> Option<Duration> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .deferred
            .get(&queue.to_string())
            .and_then(|set| set.keys().next())
            .map(|(due, _)| due.saturating_duration_since(now))
    }

    fn wake(&self, queue: &str) {
        let notify = self.state.lock().notifier(queue);
        notify.notify_waiters();
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn message_notifier(&self, queue: &QueueName) -> Option<Arc<Notify>> {
        Some(self.state.lock().notifier(&queue.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "in_memory"
    }

    async fn ensure_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let key = queue.to_string();
        match queue.mode() {
            DeliveryMode::List => {
                state.lists.entry(key).or_default();
            }
            DeliveryMode::Stream => {
                state.logs.entry(key).or_default();
            }
        }
        Ok(())
    }

    async fn ensure_group(&self, queue: &QueueName, group: &str) -> Result<(), QueueError> {
        if queue.mode() != DeliveryMode::Stream {
            return Err(QueueError::unsupported("ensure_group", queue.mode().as_str()));
        }
        let mut state = self.state.lock();
        state
            .logs
            .entry(queue.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn push(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        let key = queue.to_string();
        let id = self.state.lock().push_list(&key, payload);
        self.wake(&key);
        Ok(MessageId::from(id))
    }

    async fn pop(&self, queue: &QueueName, count: usize) -> Result<Vec<StoredMessage>, QueueError> {
        let mut state = self.state.lock();
        let Some(list) = state.lists.get_mut(&queue.to_string()) else {
            return Ok(Vec::new());
        };
        let take = count.min(list.len());
        Ok(list
            .drain(..take)
            .map(|entry| entry.to_message(1, None))
            .collect())
    }

    async fn append(&self, queue: &QueueName, payload: Vec<u8>) -> Result<MessageId, QueueError> {
        let key = queue.to_string();
        let id = self.state.lock().append_log(&key, payload)?;
        self.wake(&key);
        Ok(MessageId::from(id))
    }

    async fn read_group(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let key = queue.to_string();
        let mut state = self.state.lock();
        let log = state
            .logs
            .get_mut(&key)
            .ok_or_else(|| QueueError::queue_not_found(&key))?;
        let Log {
            entries, groups, ..
        } = log;
        let cg = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::group_not_found(&key, group))?;

        let now = Instant::now();
        let now_wall = Utc::now();
        let mut delivered = Vec::new();
        for (id, entry) in entries.range(cg.last_delivered.saturating_add(1)..).take(count) {
            let pending = PendingEntry {
                consumer: consumer.to_string(),
                claimed_at: now,
                claimed_at_wall: now_wall,
                delivery_count: 1,
            };
            delivered.push(entry.to_message(1, Some(pending.claim_info())));
            cg.pending.insert(*id, pending);
            cg.last_delivered = *id;
        }
        Ok(delivered)
    }

    async fn ack(
        &self,
        queue: &QueueName,
        group: &str,
        id: &MessageId,
    ) -> Result<bool, QueueError> {
        let key = queue.to_string();
        let numeric = id
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| QueueError::invalid_message_id(&key, id.as_str()))?;

        let mut state = self.state.lock();
        let log = state
            .logs
            .get_mut(&key)
            .ok_or_else(|| QueueError::queue_not_found(&key))?;
        let cg = log
            .groups
            .get_mut(group)
            .ok_or_else(|| QueueError::group_not_found(&key, group))?;
        let removed = cg.pending.remove(&numeric).is_some();
        if removed {
            log.trim();
        }
        Ok(removed)
    }

    async fn claim_idle(
        &self,
        queue: &QueueName,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let key = queue.to_string();
        let mut state = self.state.lock();
        let log = state
            .logs
            .get_mut(&key)
            .ok_or_else(|| QueueError::queue_not_found(&key))?;
        let Log {
            entries, groups, ..
        } = log;
        let cg = groups
            .get_mut(group)
            .ok_or_else(|| QueueError::group_not_found(&key, group))?;

        let now = Instant::now();
        let now_wall = Utc::now();
        let mut claimed = Vec::new();
        for (id, pending) in cg.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.saturating_duration_since(pending.claimed_at) < min_idle {
                continue;
            }
            let Some(entry) = entries.get(id) else {
                continue;
            };
            pending.consumer = consumer.to_string();
            pending.claimed_at = now;
            pending.claimed_at_wall = now_wall;
            pending.delivery_count = pending.delivery_count.saturating_add(1);
            claimed.push(entry.to_message(pending.delivery_count, Some(pending.claim_info())));
        }
        Ok(claimed)
    }

    async fn stats(
        &self,
        queue: &QueueName,
        group: Option<&str>,
    ) -> Result<QueueStats, QueueError> {
        let key = queue.to_string();
        let state = self.state.lock();
        let deferred = state.deferred.get(&key).map_or(0, BTreeMap::len) as u64;
        let stats = match queue.mode() {
            DeliveryMode::List => QueueStats {
                depth: state.lists.get(&key).map_or(0, VecDeque::len) as u64,
                pending: 0,
                deferred,
            },
            DeliveryMode::Stream => {
                let (depth, pending) = state.logs.get(&key).map_or((0, 0), |log| {
                    let pending: usize = match group {
                        Some(g) => log.groups.get(g).map_or(0, |cg| cg.pending.len()),
                        None => log.groups.values().map(|cg| cg.pending.len()).sum(),
                    };
                    (log.entries.len(), pending)
                });
                QueueStats {
                    depth: depth as u64,
                    pending: pending as u64,
                    deferred,
                }
            }
        };
        Ok(stats)
    }

    async fn defer(
        &self,
        queue: &QueueName,
        payload: Vec<u8>,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let seq = state.allocate_id();
        state
            .deferred
            .entry(queue.to_string())
            .or_default()
            .insert((Instant::now() + delay, seq), payload);
        Ok(())
    }

    async fn promote_due(&self, queue: &QueueName, limit: usize) -> Result<usize, QueueError> {
        let key = queue.to_string();
        let mut promoted = 0;
        let mut failure = None;
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let due: Vec<(Instant, u64)> = state.deferred.get(&key).map_or_else(Vec::new, |set| {
                set.keys()
                    .take_while(|(due, _)| *due <= now)
                    .take(limit)
                    .copied()
                    .collect()
            });
            for slot in due {
                let Some(payload) = state.deferred.get(&key).and_then(|set| set.get(&slot)).cloned() else {
                    continue;
                };
                match queue.mode() {
                    DeliveryMode::List => {
                        state.push_list(&key, payload);
                    }
                    DeliveryMode::Stream => {
                        if let Err(e) = state.append_log(&key, payload) {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                // leaves the deferred set only once it is live
                if let Some(set) = state.deferred.get_mut(&key) {
                    set.remove(&slot);
                }
                promoted += 1;
            }
        }
        if promoted > 0 {
            self.wake(&key);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(promoted),
        }
    }

    async fn peek(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, QueueError> {
        let key = queue.to_string();
        let state = self.state.lock();
        let messages = match queue.mode() {
            DeliveryMode::List => state.lists.get(&key).map_or_else(Vec::new, |list| {
                list.iter().take(limit).map(|e| e.to_message(0, None)).collect()
            }),
            DeliveryMode::Stream => state.logs.get(&key).map_or_else(Vec::new, |log| {
                log.entries
                    .values()
                    .take(limit)
                    .map(|e| e.to_message(0, None))
                    .collect()
            }),
        };
        Ok(messages)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> QueueName {
        QueueName::new("test", "dev", DeliveryMode::Stream, "jobs.browser")
    }

    fn list() -> QueueName {
        QueueName::new("test", "dev", DeliveryMode::List, "jobs.generic")
    }

    #[tokio::test]
    async fn test_list_pop_removes_messages() {
        let store = InMemoryQueueStore::new();
        let queue = list();
        store.ensure_queue(&queue).await.unwrap();

        store.push(&queue, b"a".to_vec()).await.unwrap();
        store.push(&queue, b"b".to_vec()).await.unwrap();

        let popped = store.pop(&queue, 10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].payload, b"a");
        assert!(store.pop(&queue, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_delivery_and_ack() {
        let store = InMemoryQueueStore::new();
        let queue = stream();
        store.ensure_queue(&queue).await.unwrap();
        store.append(&queue, b"early".to_vec()).await.unwrap();
        store.ensure_group(&queue, "workers").await.unwrap();

        let first = store.read_group(&queue, "workers", "c1", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, b"early");
        assert_eq!(first[0].claim.as_ref().unwrap().consumer, "c1");

        // delivered entries are not handed out again by read_group
        assert!(store
            .read_group(&queue, "workers", "c2", 10)
            .await
            .unwrap()
            .is_empty());

        let stats = store.stats(&queue, Some("workers")).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.depth, 1);

        assert!(store.ack(&queue, "workers", &first[0].id).await.unwrap());
        assert!(!store.ack(&queue, "workers", &first[0].id).await.unwrap());
        assert_eq!(store.len(&queue), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_idle_respects_threshold() {
        let store = InMemoryQueueStore::new();
        let queue = stream();
        store.ensure_group(&queue, "workers").await.unwrap();
        store.append(&queue, b"job".to_vec()).await.unwrap();
        store.read_group(&queue, "workers", "crashed", 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store
            .claim_idle(&queue, "workers", "rescuer", Duration::from_secs(30), 10)
            .await
            .unwrap()
            .is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        let reclaimed = store
            .claim_idle(&queue, "workers", "rescuer", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].delivery_count, 2);
        assert_eq!(reclaimed[0].claim.as_ref().unwrap().consumer, "rescuer");

        // freshly claimed, so not idle any more
        assert!(store
            .claim_idle(&queue, "workers", "other", Duration::from_secs(30), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_promotion_by_due_time() {
        let store = InMemoryQueueStore::new();
        let queue = list();
        store.defer(&queue, b"later".to_vec(), Duration::from_secs(4)).await.unwrap();
        store.defer(&queue, b"sooner".to_vec(), Duration::from_secs(2)).await.unwrap();

        assert_eq!(store.promote_due(&queue, 10).await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.promote_due(&queue, 10).await.unwrap(), 1);
        assert_eq!(store.pop(&queue, 1).await.unwrap()[0].payload, b"sooner");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.promote_due(&queue, 10).await.unwrap(), 1);
        assert_eq!(store.deferred_len(&queue), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_promotion_keeps_deferred_payload() {
        let store = InMemoryQueueStore::new();
        let queue = stream();
        store.ensure_queue(&queue).await.unwrap();
        store.defer(&queue, b"first".to_vec(), Duration::from_secs(1)).await.unwrap();
        store.defer(&queue, b"second".to_vec(), Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        store.fail_next_appends(&queue, 1);
        assert!(store.promote_due(&queue, 10).await.is_err());
        assert_eq!(store.deferred_len(&queue), 2);
        assert_eq!(store.len(&queue), 0);

        assert_eq!(store.promote_due(&queue, 10).await.unwrap(), 2);
        assert_eq!(store.deferred_len(&queue), 0);
        let live = store.peek(&queue, 10).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].payload, b"first");
        assert_eq!(live[1].payload, b"second");
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let store = InMemoryQueueStore::new();
        let dlq = stream().dead_letter();
        store.fail_next_appends(&dlq, 2);

        assert!(store.append(&dlq, b"x".to_vec()).await.is_err());
        assert!(store.append(&dlq, b"x".to_vec()).await.is_err());
        assert!(store.append(&dlq, b"x".to_vec()).await.is_ok());
        assert_eq!(store.peek(&dlq, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_group_requires_group() {
        let store = InMemoryQueueStore::new();
        let queue = stream();
        store.ensure_queue(&queue).await.unwrap();
        assert!(matches!(
            store.read_group(&queue, "missing", "c1", 1).await,
            Err(QueueError::GroupNotFound { .. })
        ));
    }
}
