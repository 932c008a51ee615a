use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lock::{ExclusiveLock, FsExclusiveLock};
use super::store::{hashed_key, read_json_opt, write_atomic_bytes};
use super::StoreErr;

const APPROVAL_FILE: &str = "approval.json";
const DONE_FILE: &str = "done.json";
const PERFORMER_LOCK_FILE: &str = "restart.lock";
const NOTIFY_LOCK_FILE: &str = "notify.lock";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalRecord {
    pub approved_at: i64,
    #[serde(default)]
    pub approved_by: Option<String>,
}

impl ApprovalRecord {
    /// Only approvals granted at or after the current wait began count.
    pub fn is_fresh(&self, wait_since: i64) -> bool {
        self.approved_at >= wait_since
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DoneRecord {
    pub done_at: i64,
    #[serde(default)]
    pub approved_at: Option<i64>,
}

impl DoneRecord {
    pub fn is_fresh(&self, wait_since: i64) -> bool {
        self.done_at >= wait_since
    }
}

/// Restart coordination artifacts for one physical browser profile.
/// Shared by every run using that profile.
pub trait RestartLedger: Send + Sync {
    fn read_approval(&self) -> Result<Option<ApprovalRecord>, StoreErr>;
    fn write_approval(&self, record: &ApprovalRecord) -> Result<(), StoreErr>;
    fn clear_approval(&self) -> Result<(), StoreErr>;
    fn read_done(&self) -> Result<Option<DoneRecord>, StoreErr>;
    fn write_done(&self, record: &DoneRecord) -> Result<(), StoreErr>;
    /// Held by the one waiter allowed to kill and relaunch the browser.
    /// Every call returns a new handle contending for the same lock.
    fn performer_lock(&self) -> Arc<dyn ExclusiveLock>;
    /// Held by the one waiter allowed to post the human approval request.
    fn notify_lock(&self) -> Arc<dyn ExclusiveLock>;
}

#[derive(Debug)]
pub struct FsRestartLedger {
    dir: PathBuf,
    stale_after: Duration,
}

impl FsRestartLedger {
    /// `stale_after` bounds how long a crashed holder can keep either lock.
    pub fn new(root: impl AsRef<Path>, profile: &str, stale_after: Duration) -> Self {
        Self {
            dir: root.as_ref().join("restart").join(profile_key(profile)),
            stale_after,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl RestartLedger for FsRestartLedger {
    fn read_approval(&self) -> Result<Option<ApprovalRecord>, StoreErr> {
        read_json_opt(&self.dir.join(APPROVAL_FILE))
    }

    fn write_approval(&self, record: &ApprovalRecord) -> Result<(), StoreErr> {
        let bytes = serde_json::to_vec(record)
            .map_err(|err| StoreErr::Serialize(format!("serialize approval failed: {err}")))?;
        write_atomic_bytes(&self.dir.join(APPROVAL_FILE), &bytes)
    }

    fn clear_approval(&self) -> Result<(), StoreErr> {
        match fs::remove_file(self.dir.join(APPROVAL_FILE)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreErr::Io(format!("clear approval failed: {err}"))),
        }
    }

    fn read_done(&self) -> Result<Option<DoneRecord>, StoreErr> {
        read_json_opt(&self.dir.join(DONE_FILE))
    }

    fn write_done(&self, record: &DoneRecord) -> Result<(), StoreErr> {
        let bytes = serde_json::to_vec(record)
            .map_err(|err| StoreErr::Serialize(format!("serialize done failed: {err}")))?;
        write_atomic_bytes(&self.dir.join(DONE_FILE), &bytes)
    }

    fn performer_lock(&self) -> Arc<dyn ExclusiveLock> {
        Arc::new(FsExclusiveLock::new(
            self.dir.join(PERFORMER_LOCK_FILE),
            self.stale_after,
        ))
    }

    fn notify_lock(&self) -> Arc<dyn ExclusiveLock> {
        Arc::new(FsExclusiveLock::new(
            self.dir.join(NOTIFY_LOCK_FILE),
            self.stale_after,
        ))
    }
}

/// Coordination scope key for a browser profile path.
/// Allocation: one String. Complexity: O(n), n=profile length.
pub fn profile_key(profile: &str) -> String {
    hashed_key(profile, "profile")
}
