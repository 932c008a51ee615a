use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use super::lock::{acquire_blocking, ExclusiveLock, FsExclusiveLock};
use super::{FsRunStore, RunMutation, RunRecord, RunStore, StoreErr};

const RECORD_FILE: &str = "run.json";
const MUTATION_LOCK_FILE: &str = ".run.lock";
const WORKER_LOCK_FILE: &str = "worker.lock";

impl FsRunStore {
    const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
    const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);
    const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_key(run_id))
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(RECORD_FILE)
    }

    fn artifact_path(&self, run_id: &str, name: &str) -> Result<PathBuf, StoreErr> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
            && !name.starts_with('.')
            && name != RECORD_FILE;
        if !valid {
            return Err(StoreErr::Io(format!("invalid artifact name: {name}")));
        }
        Ok(self.run_dir(run_id).join(name))
    }

    fn with_run_lock<T>(
        &self,
        run_id: &str,
        f: impl FnOnce() -> Result<T, StoreErr>,
    ) -> Result<T, StoreErr> {
        let lock = FsExclusiveLock::new(
            self.run_dir(run_id).join(MUTATION_LOCK_FILE),
            Self::LOCK_STALE_AFTER,
        );
        acquire_blocking(
            &lock,
            Self::LOCK_WAIT_TIMEOUT,
            Self::LOCK_RETRY_DELAY,
            "run record",
        )?;
        let result = f();
        lock.release()?;
        result
    }

    fn read_record(&self, run_id: &str) -> Result<RunRecord, StoreErr> {
        let path = self.record_path(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreErr::NotFound(run_id.to_owned()))
            }
            Err(err) => return Err(StoreErr::Io(format!("read run record failed: {err}"))),
        };
        serde_json::from_slice::<RunRecord>(&bytes)
            .map_err(|err| StoreErr::Serialize(format!("parse run record failed: {err}")))
    }

    fn write_record(&self, record: &RunRecord) -> Result<(), StoreErr> {
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| StoreErr::Serialize(format!("serialize run record failed: {err}")))?;
        write_atomic_bytes(&self.record_path(&record.run_id), &bytes)
    }
}

impl RunStore for FsRunStore {
    fn create(&self, record: &RunRecord) -> Result<(), StoreErr> {
        let dir = self.run_dir(&record.run_id);
        fs::create_dir_all(&dir)
            .map_err(|err| StoreErr::Io(format!("create run dir failed: {err}")))?;
        self.with_run_lock(&record.run_id, || {
            if self.record_path(&record.run_id).exists() {
                return Err(StoreErr::AlreadyExists(record.run_id.clone()));
            }
            self.write_record(record)
        })
    }

    fn get(&self, run_id: &str) -> Result<RunRecord, StoreErr> {
        self.read_record(run_id)
    }

    fn put(&self, record: &RunRecord) -> Result<(), StoreErr> {
        if !self.run_dir(&record.run_id).exists() {
            return Err(StoreErr::NotFound(record.run_id.clone()));
        }
        self.with_run_lock(&record.run_id, || {
            let current = self.read_record(&record.run_id)?;
            if current.is_terminal() {
                return Err(StoreErr::Terminal {
                    run_id: current.run_id,
                    state: current.state,
                });
            }
            self.write_record(record)
        })
    }

    fn update(&self, run_id: &str, mutate: RunMutation<'_>) -> Result<RunRecord, StoreErr> {
        if !self.run_dir(run_id).exists() {
            return Err(StoreErr::NotFound(run_id.to_owned()));
        }
        self.with_run_lock(run_id, || {
            let mut record = self.read_record(run_id)?;
            if record.is_terminal() {
                return Err(StoreErr::Terminal {
                    run_id: record.run_id,
                    state: record.state,
                });
            }
            mutate(&mut record)?;
            record.updated_at = now_unix_millis().max(record.updated_at);
            self.write_record(&record)?;
            Ok(record)
        })
    }

    fn list(&self) -> Result<Vec<RunRecord>, StoreErr> {
        let entries = match fs::read_dir(self.runs_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreErr::Io(format!("list runs failed: {err}"))),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreErr::Io(format!("list runs failed: {err}")))?;
            let path = entry.path().join(RECORD_FILE);
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                // Directory created but record not written yet, or removed concurrently.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreErr::Io(format!("read run record failed: {err}"))),
            };
            match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %path.to_string_lossy(),
                        "skipping unreadable run record: {err}"
                    );
                }
            }
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }

    fn delete(&self, run_id: &str) -> Result<(), StoreErr> {
        match fs::remove_dir_all(self.run_dir(run_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreErr::NotFound(run_id.to_owned()))
            }
            Err(err) => Err(StoreErr::Io(format!("delete run failed: {err}"))),
        }
    }

    fn write_artifact(&self, run_id: &str, name: &str, text: &str) -> Result<(), StoreErr> {
        let path = self.artifact_path(run_id, name)?;
        if !self.run_dir(run_id).exists() {
            return Err(StoreErr::NotFound(run_id.to_owned()));
        }
        write_atomic_bytes(&path, text.as_bytes())
    }

    fn read_artifact(&self, run_id: &str, name: &str) -> Result<String, StoreErr> {
        let path = self.artifact_path(run_id, name)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreErr::NotFound(format!("{run_id}/{name}")))
            }
            Err(err) => Err(StoreErr::Io(format!("read artifact failed: {err}"))),
        }
    }

    fn worker_lock(&self, run_id: &str, stale_after: Duration) -> Arc<dyn ExclusiveLock> {
        Arc::new(FsExclusiveLock::new(
            self.run_dir(run_id).join(WORKER_LOCK_FILE),
            stale_after,
        ))
    }
}

/// Stable run directory key: visible prefix + hash suffix.
/// Allocation: one String. Complexity: O(n), n=run_id length.
pub fn run_key(run_id: &str) -> String {
    hashed_key(run_id, "run")
}

pub(crate) fn hashed_key(raw: &str, fallback: &str) -> String {
    let mut prefix = String::with_capacity(raw.len().min(48));
    for ch in raw.chars().take(48) {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
            prefix.push(ch);
        } else {
            prefix.push('_');
        }
    }
    if prefix.is_empty() {
        prefix.push_str(fallback);
    }

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let short = &digest[..12];
    format!("{prefix}_{short}")
}

pub fn now_unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Write-temp-then-rename so concurrent readers never observe a partial document.
pub(crate) fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreErr> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| StoreErr::Io(format!("create parent dir failed: {err}")))?;
    }
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes).map_err(|err| {
        StoreErr::Io(format!(
            "write temp file failed at {}: {err}",
            temp_path.to_string_lossy()
        ))
    })?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreErr::Io(format!(
            "atomic rename failed {} -> {}: {err}",
            temp_path.to_string_lossy(),
            path.to_string_lossy()
        )));
    }
    Ok(())
}

pub(crate) fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreErr> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreErr::Io(format!(
                "read {} failed: {err}",
                path.to_string_lossy()
            )))
        }
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|err| {
        StoreErr::Serialize(format!("parse {} failed: {err}", path.to_string_lossy()))
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    path.with_file_name(format!(".{name}.tmp-{}-{nanos}", std::process::id()))
}
