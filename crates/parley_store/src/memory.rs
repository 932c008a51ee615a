use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::lock::{ExclusiveLock, MemoryLock};
use super::restart::{ApprovalRecord, DoneRecord, RestartLedger};
use super::store::now_unix_millis;
use super::{RunMutation, RunRecord, RunStore, StoreErr};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Process-local run store with the same terminal and atomicity rules as `FsRunStore`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    records: Mutex<HashMap<String, RunRecord>>,
    artifacts: Mutex<HashMap<(String, String), String>>,
    worker_locks: Mutex<HashMap<String, MemoryLock>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    fn create(&self, record: &RunRecord) -> Result<(), StoreErr> {
        let mut records = lock_or_recover(&self.records);
        if records.contains_key(&record.run_id) {
            return Err(StoreErr::AlreadyExists(record.run_id.clone()));
        }
        records.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, run_id: &str) -> Result<RunRecord, StoreErr> {
        lock_or_recover(&self.records)
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreErr::NotFound(run_id.to_owned()))
    }

    fn put(&self, record: &RunRecord) -> Result<(), StoreErr> {
        let mut records = lock_or_recover(&self.records);
        let Some(current) = records.get(&record.run_id) else {
            return Err(StoreErr::NotFound(record.run_id.clone()));
        };
        if current.is_terminal() {
            return Err(StoreErr::Terminal {
                run_id: current.run_id.clone(),
                state: current.state,
            });
        }
        records.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    fn update(&self, run_id: &str, mutate: RunMutation<'_>) -> Result<RunRecord, StoreErr> {
        let mut records = lock_or_recover(&self.records);
        let Some(current) = records.get(run_id) else {
            return Err(StoreErr::NotFound(run_id.to_owned()));
        };
        if current.is_terminal() {
            return Err(StoreErr::Terminal {
                run_id: current.run_id.clone(),
                state: current.state,
            });
        }
        let mut next = current.clone();
        mutate(&mut next)?;
        next.updated_at = now_unix_millis().max(next.updated_at);
        records.insert(run_id.to_owned(), next.clone());
        Ok(next)
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreErr> {
        let mut records: Vec<RunRecord> =
            lock_or_recover(&self.records).values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    fn delete(&self, run_id: &str) -> Result<(), StoreErr> {
        if lock_or_recover(&self.records).remove(run_id).is_none() {
            return Err(StoreErr::NotFound(run_id.to_owned()));
        }
        lock_or_recover(&self.artifacts).retain(|(owner, _), _| owner != run_id);
        lock_or_recover(&self.worker_locks).remove(run_id);
        Ok(())
    }

    fn write_artifact(&self, run_id: &str, name: &str, text: &str) -> Result<(), StoreErr> {
        if !lock_or_recover(&self.records).contains_key(run_id) {
            return Err(StoreErr::NotFound(run_id.to_owned()));
        }
        lock_or_recover(&self.artifacts)
            .insert((run_id.to_owned(), name.to_owned()), text.to_owned());
        Ok(())
    }

    fn read_artifact(&self, run_id: &str, name: &str) -> Result<String, StoreErr> {
        lock_or_recover(&self.artifacts)
            .get(&(run_id.to_owned(), name.to_owned()))
            .cloned()
            .ok_or_else(|| StoreErr::NotFound(format!("{run_id}/{name}")))
    }

    fn worker_lock(&self, run_id: &str, _stale_after: Duration) -> Arc<dyn ExclusiveLock> {
        let mut locks = lock_or_recover(&self.worker_locks);
        let lock = locks.entry(run_id.to_owned()).or_default();
        Arc::new(lock.share())
    }
}

#[derive(Debug, Default)]
struct LedgerRecords {
    approval: Option<ApprovalRecord>,
    done: Option<DoneRecord>,
}

/// In-memory restart ledger. `share` hands out a second participant view; the lock
/// templates here are never acquired themselves.
#[derive(Debug, Default)]
pub struct MemoryRestartLedger {
    records: Arc<Mutex<LedgerRecords>>,
    performer: MemoryLock,
    notify: MemoryLock,
}

impl MemoryRestartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            performer: self.performer.share(),
            notify: self.notify.share(),
        }
    }

    pub fn performer_taken(&self) -> bool {
        self.performer.is_taken()
    }

    pub fn notify_taken(&self) -> bool {
        self.notify.is_taken()
    }
}

impl RestartLedger for MemoryRestartLedger {
    fn read_approval(&self) -> Result<Option<ApprovalRecord>, StoreErr> {
        Ok(lock_or_recover(&self.records).approval.clone())
    }

    fn write_approval(&self, record: &ApprovalRecord) -> Result<(), StoreErr> {
        lock_or_recover(&self.records).approval = Some(record.clone());
        Ok(())
    }

    fn clear_approval(&self) -> Result<(), StoreErr> {
        lock_or_recover(&self.records).approval = None;
        Ok(())
    }

    fn read_done(&self) -> Result<Option<DoneRecord>, StoreErr> {
        Ok(lock_or_recover(&self.records).done.clone())
    }

    fn write_done(&self, record: &DoneRecord) -> Result<(), StoreErr> {
        lock_or_recover(&self.records).done = Some(record.clone());
        Ok(())
    }

    fn performer_lock(&self) -> Arc<dyn ExclusiveLock> {
        Arc::new(self.performer.share())
    }

    fn notify_lock(&self) -> Arc<dyn ExclusiveLock> {
        Arc::new(self.notify.share())
    }
}
