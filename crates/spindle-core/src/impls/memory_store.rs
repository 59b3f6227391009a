//! In-memory task store.
//!
//! Suitable for tests and single-process deployments. All operations take one
//! async mutex, which makes the claim trivially atomic.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::app::status::QueueCounts;
use crate::domain::{LeaseId, SpindleError, TaskId, TaskRecord, TaskStatus};
use crate::ports::TaskStore;

/// Claim-order key for pending tasks: earliest `scheduled_for` first, then
/// creation time, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DueEntry {
    scheduled_for: DateTime<Utc>,
    created_at: DateTime<Utc>,
    task_id: TaskId,
}

impl DueEntry {
    fn of(record: &TaskRecord) -> Self {
        Self {
            scheduled_for: record.scheduled_for,
            created_at: record.created_at,
            task_id: record.id,
        }
    }
}

#[derive(Default)]
struct InMemoryState {
    /// All records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Every `Pending` record, in claim order.
    due: BTreeSet<DueEntry>,
}

impl InMemoryState {
    fn held_mut(&mut self, id: TaskId, lease: LeaseId) -> Result<&mut TaskRecord, SpindleError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| SpindleError::Persistence(format!("no task record for {id}")))?;
        if !record.is_held_by(lease) {
            return Err(SpindleError::LeaseLost { task_id: id });
        }
        Ok(record)
    }

    fn next_due(&self, now: DateTime<Utc>) -> Option<DueEntry> {
        self.due.first().copied().filter(|entry| {
            self.records
                .get(&entry.task_id)
                .is_some_and(|record| record.is_due(now))
        })
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, oldest first. Mostly for inspection in tests.
    pub async fn all(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<TaskRecord> = state.records.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.id) {
            return Err(SpindleError::Persistence(format!(
                "duplicate task id {}",
                record.id
            )));
        }
        if record.status == TaskStatus::Pending {
            state.due.insert(DueEntry::of(&record));
        }
        state.records.insert(record.id, record);
        Ok(())
    }

    async fn claim_next_due(
        &self,
        now: DateTime<Utc>,
        lease: LeaseId,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Option<TaskRecord>, SpindleError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.next_due(now) else {
            return Ok(None);
        };
        state.due.remove(&entry);

        let Some(record) = state.records.get_mut(&entry.task_id) else {
            return Ok(None);
        };
        record.claim(lease, lease_expires_at, now);
        Ok(Some(record.clone()))
    }

    async fn mark_done(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        state.held_mut(id, lease)?.mark_done(now);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: TaskId,
        lease: LeaseId,
        next_run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        let record = state.held_mut(id, lease)?;
        record.schedule_retry(next_run_at, error.to_string(), now);
        let entry = DueEntry::of(record);
        state.due.insert(entry);
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: TaskId,
        lease: LeaseId,
        reason: &str,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SpindleError> {
        let mut state = self.state.lock().await;
        state
            .held_mut(id, lease)?
            .mark_dead(reason.to_string(), count_attempt, now);
        Ok(())
    }

    async fn refresh_heartbeat(
        &self,
        id: TaskId,
        lease: LeaseId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool, SpindleError> {
        let mut state = self.state.lock().await;
        match state.records.get_mut(&id) {
            Some(record) if record.is_held_by(lease) => {
                record.heartbeat_at = now;
                record.lease_expires_at = Some(lease_expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64, SpindleError> {
        let mut state = self.state.lock().await;
        let mut released = Vec::new();
        for record in state.records.values_mut() {
            if record.status == TaskStatus::Running && record.heartbeat_at < older_than {
                record.release_stalled();
                released.push(DueEntry::of(record));
            }
        }
        let count = released.len() as u64;
        state.due.extend(released);
        Ok(count)
    }

    async fn has_pending(&self, now: DateTime<Utc>) -> Result<bool, SpindleError> {
        let state = self.state.lock().await;
        Ok(state.next_due(now).is_some())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, SpindleError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, SpindleError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::TaskType;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn lease() -> LeaseId {
        LeaseId::from_ulid(Ulid::new())
    }

    fn pending(task_type: &str, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new_pending(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new(task_type),
            serde_json::json!({ "k": task_type }),
            scheduled_for,
            now,
        )
    }

    #[tokio::test]
    async fn insert_and_counts() {
        let store = InMemoryTaskStore::new();
        store.insert(pending("a", t0(), t0())).await.unwrap();

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_persistence_error() {
        let store = InMemoryTaskStore::new();
        let record = pending("a", t0(), t0());
        store.insert(record.clone()).await.unwrap();

        let err = store.insert(record).await.unwrap_err();
        assert!(matches!(err, SpindleError::Persistence(_)));
    }

    #[tokio::test]
    async fn claim_is_oldest_scheduled_first() {
        let store = InMemoryTaskStore::new();
        let late = pending("late", t0() - Duration::seconds(10), t0());
        let early = pending("early", t0() - Duration::seconds(60), t0());
        store.insert(late).await.unwrap();
        store.insert(early).await.unwrap();

        let lease_id = lease();
        let claimed = store
            .claim_next_due(t0(), lease_id, t0() + Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(claimed.task_type.as_str(), "early");
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.lease_owner, Some(lease_id));
        assert_eq!(claimed.lease_expires_at, Some(t0() + Duration::minutes(5)));
    }

    #[tokio::test]
    async fn future_task_is_claimed_exactly_at_its_time() {
        let store = InMemoryTaskStore::new();
        let at = t0() + Duration::seconds(30);
        store.insert(pending("later", at, t0())).await.unwrap();

        let before = at - Duration::milliseconds(1);
        assert!(!store.has_pending(before).await.unwrap());
        assert!(
            store
                .claim_next_due(before, lease(), before + Duration::minutes(1))
                .await
                .unwrap()
                .is_none()
        );

        assert!(store.has_pending(at).await.unwrap());
        assert!(
            store
                .claim_next_due(at, lease(), at + Duration::minutes(1))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn only_pending_records_count_as_due() {
        let store = InMemoryTaskStore::new();
        let record = pending("a", t0(), t0());
        let id = record.id;
        store.insert(record).await.unwrap();
        assert!(store.has_pending(t0()).await.unwrap());

        let lease_id = lease();
        store
            .claim_next_due(t0(), lease_id, t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        assert!(!store.has_pending(t0()).await.unwrap());

        store.mark_done(id, lease_id, t0()).await.unwrap();
        assert!(!store.has_pending(t0() + Duration::days(1)).await.unwrap());
        assert!(
            store
                .claim_next_due(t0() + Duration::days(1), lease(), t0() + Duration::days(2))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn concurrent_claims_on_single_task_yield_one_winner() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.insert(pending("only", t0(), t0())).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .claim_next_due(t0(), lease(), t0() + Duration::minutes(1))
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .claim_next_due(t0(), lease(), t0() + Duration::minutes(1))
                    .await
            })
        };

        let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn retry_increments_attempts_and_requeues() {
        let store = InMemoryTaskStore::new();
        let record = pending("flaky", t0(), t0());
        let id = record.id;
        store.insert(record).await.unwrap();

        let lease_id = lease();
        store
            .claim_next_due(t0(), lease_id, t0() + Duration::minutes(1))
            .await
            .unwrap();
        let next = t0() + Duration::seconds(2);
        store
            .mark_retry(id, lease_id, next, "boom", t0())
            .await
            .unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.scheduled_for, next);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.lease_owner.is_none());

        assert!(!store.has_pending(t0()).await.unwrap());
        assert!(store.has_pending(next).await.unwrap());
    }

    #[tokio::test]
    async fn writes_with_a_foreign_lease_are_rejected() {
        let store = InMemoryTaskStore::new();
        let record = pending("a", t0(), t0());
        let id = record.id;
        store.insert(record).await.unwrap();
        store
            .claim_next_due(t0(), lease(), t0() + Duration::minutes(1))
            .await
            .unwrap();

        let err = store.mark_done(id, lease(), t0()).await.unwrap_err();
        assert!(matches!(err, SpindleError::LeaseLost { task_id } if task_id == id));
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn done_and_dead_are_terminal() {
        let store = InMemoryTaskStore::new();
        let record = pending("a", t0(), t0());
        let id = record.id;
        store.insert(record).await.unwrap();
        let lease_id = lease();
        store
            .claim_next_due(t0(), lease_id, t0() + Duration::minutes(1))
            .await
            .unwrap();
        store.mark_done(id, lease_id, t0()).await.unwrap();

        assert!(store.mark_dead(id, lease_id, "late", true, t0()).await.is_err());
        assert!(
            store
                .mark_retry(id, lease_id, t0(), "late", t0())
                .await
                .is_err()
        );
        assert!(store.reclaim_stale(t0() + Duration::days(1)).await.unwrap() == 0);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn heartbeat_extends_only_the_held_lease() {
        let store = InMemoryTaskStore::new();
        let record = pending("long", t0(), t0());
        let id = record.id;
        store.insert(record).await.unwrap();
        let lease_id = lease();
        store
            .claim_next_due(t0(), lease_id, t0() + Duration::minutes(1))
            .await
            .unwrap();

        let later = t0() + Duration::seconds(45);
        assert!(
            store
                .refresh_heartbeat(id, lease_id, later, later + Duration::minutes(1))
                .await
                .unwrap()
        );
        assert!(
            !store
                .refresh_heartbeat(id, lease(), later, later + Duration::minutes(1))
                .await
                .unwrap()
        );

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.heartbeat_at, later);
        assert_eq!(stored.lease_expires_at, Some(later + Duration::minutes(1)));
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn reclaim_stale_resets_only_silent_leases() {
        let store = InMemoryTaskStore::new();
        let stale = pending("stale", t0(), t0());
        let fresh = pending("fresh", t0(), t0());
        let (stale_id, fresh_id) = (stale.id, fresh.id);
        store.insert(stale).await.unwrap();
        store.insert(fresh).await.unwrap();

        let stale_lease = lease();
        let fresh_lease = lease();
        let first = store
            .claim_next_due(t0(), stale_lease, t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        store
            .claim_next_due(t0(), fresh_lease, t0() + Duration::minutes(1))
            .await
            .unwrap()
            .unwrap();
        // whichever was claimed first, make "fresh" the one with a recent heartbeat
        let (stale_lease, fresh_lease) = if first.id == stale_id {
            (stale_lease, fresh_lease)
        } else {
            (fresh_lease, stale_lease)
        };
        let later = t0() + Duration::minutes(20);
        assert!(
            store
                .refresh_heartbeat(fresh_id, fresh_lease, later, later + Duration::minutes(15))
                .await
                .unwrap()
        );

        let reclaimed = store
            .reclaim_stale(later - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let stale = store.get(stale_id).await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Pending);
        assert_eq!(stale.attempts, 0);
        assert!(stale.lease_owner.is_none());
        assert!(stale.lease_expires_at.is_none());
        assert!(
            store
                .mark_done(stale_id, stale_lease, later)
                .await
                .is_err()
        );

        let fresh = store.get(fresh_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Running);
    }
}
