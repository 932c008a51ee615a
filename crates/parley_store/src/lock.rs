use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::store::{now_unix_millis, write_atomic_bytes};
use super::StoreErr;

/// Cross-process mutual exclusion primitive.
/// Implementations must never block: waiting is the caller's polling loop.
pub trait ExclusiveLock: Send + Sync {
    /// Try to take the lock. `Ok(false)` means another holder owns it.
    fn try_acquire(&self) -> Result<bool, StoreErr>;
    /// Give the lock up. No-op when this handle does not hold it.
    fn release(&self) -> Result<(), StoreErr>;
    /// Renew the holder heartbeat so peers do not reclaim the lock as stale.
    fn refresh(&self) -> Result<(), StoreErr> {
        Ok(())
    }
    fn is_held(&self) -> bool;
}

/// Create-exclusive lock file carrying `pid:heartbeat_unix_ms:owner` metadata.
/// A lock whose heartbeat is older than `stale_after` is reclaimed by the next acquirer.
/// `owner` is unique per handle; refresh and release only touch a file this handle owns.
#[derive(Debug)]
pub struct FsExclusiveLock {
    path: PathBuf,
    stale_after: Duration,
    owner: String,
    held: AtomicBool,
}

impl FsExclusiveLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
            owner: next_owner_token(),
            held: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn owns_file(&self) -> bool {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| parse_lock_owner(&raw).map(|owner| owner == self.owner))
            .unwrap_or(false)
    }

    /// Remove the stale file under a short-lived reclaim guard, after re-checking that it
    /// is still the file judged stale. Returns whether a fresh create should be attempted.
    fn reclaim(&self, observed: &str) -> Result<bool, StoreErr> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_owned());
        let guard = self.path.with_file_name(format!("{file_name}.reclaim"));
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&guard)
        {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // A reclaimer that died mid-way leaves its guard behind.
                if stale_contents(&guard, self.stale_after).is_some() {
                    let _ = fs::remove_file(&guard);
                }
                return Ok(false);
            }
            Err(err) => {
                return Err(StoreErr::Io(format!(
                    "reclaim guard failed at {}: {err}",
                    guard.to_string_lossy()
                )))
            }
        }

        let reclaimable = match fs::read_to_string(&self.path) {
            Ok(current) if current == observed => match fs::remove_file(&self.path) {
                Ok(()) => {
                    tracing::warn!(path = %self.path.to_string_lossy(), "reclaimed stale lock");
                    true
                }
                Err(err) => err.kind() == ErrorKind::NotFound,
            },
            Ok(_) => false,
            Err(err) => err.kind() == ErrorKind::NotFound,
        };
        let _ = fs::remove_file(&guard);
        Ok(reclaimable)
    }
}

impl ExclusiveLock for FsExclusiveLock {
    fn try_acquire(&self) -> Result<bool, StoreErr> {
        if self.held.load(Ordering::Acquire) {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreErr::Io(format!("create lock dir failed: {err}")))?;
        }

        // Second attempt only happens after reclaiming a stale holder.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    write_lock_metadata(&mut file, &self.owner)?;
                    self.held.store(true, Ordering::Release);
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let Some(observed) = stale_contents(&self.path, self.stale_after) else {
                        return Ok(false);
                    };
                    if !self.reclaim(&observed)? {
                        return Ok(false);
                    }
                }
                Err(err) => {
                    return Err(StoreErr::Io(format!(
                        "lock failed at {}: {err}",
                        self.path.to_string_lossy()
                    )))
                }
            }
        }
        Ok(false)
    }

    fn release(&self) -> Result<(), StoreErr> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.owns_file() {
            tracing::warn!(path = %self.path.to_string_lossy(), "lock was taken over before release");
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreErr::Io(format!(
                "release lock failed at {}: {err}",
                self.path.to_string_lossy()
            ))),
        }
    }

    fn refresh(&self) -> Result<(), StoreErr> {
        if !self.held.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.owns_file() {
            self.held.store(false, Ordering::Release);
            return Err(StoreErr::Io(format!(
                "lock at {} was taken over by another holder",
                self.path.to_string_lossy()
            )));
        }
        write_atomic_bytes(&self.path, lock_metadata(&self.owner).as_bytes())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Drop for FsExclusiveLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// In-process lock sharing one flag between handles; stands in for a lock file in tests.
#[derive(Debug, Default)]
pub struct MemoryLock {
    taken: Arc<AtomicBool>,
    held: AtomicBool,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// New handle contending for the same lock, as a second process would.
    pub fn share(&self) -> Self {
        Self {
            taken: Arc::clone(&self.taken),
            held: AtomicBool::new(false),
        }
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

impl ExclusiveLock for MemoryLock {
    fn try_acquire(&self) -> Result<bool, StoreErr> {
        if self.held.load(Ordering::Acquire) {
            return Ok(true);
        }
        let acquired = self
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.held.store(true, Ordering::Release);
        }
        Ok(acquired)
    }

    fn release(&self) -> Result<(), StoreErr> {
        if self.held.swap(false, Ordering::AcqRel) {
            self.taken.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Spin on `try_acquire` for short critical sections (run record mutation).
/// Side effects: sleeps the current thread between attempts.
pub(crate) fn acquire_blocking(
    lock: &dyn ExclusiveLock,
    wait_timeout: Duration,
    retry_delay: Duration,
    label: &str,
) -> Result<(), StoreErr> {
    let started = Instant::now();
    loop {
        if lock.try_acquire()? {
            return Ok(());
        }
        if started.elapsed() >= wait_timeout {
            return Err(StoreErr::Io(format!("{label} lock timed out")));
        }
        thread::sleep(retry_delay);
    }
}

fn next_owner_token() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos())
        .unwrap_or_default();
    format!(
        "{}-{nanos:08x}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

fn lock_metadata(owner: &str) -> String {
    format!("{}:{}:{owner}\n", std::process::id(), now_unix_millis())
}

fn write_lock_metadata(file: &mut fs::File, owner: &str) -> Result<(), StoreErr> {
    file.write_all(lock_metadata(owner).as_bytes())
        .map_err(|err| StoreErr::Io(format!("write lock metadata failed: {err}")))?;
    file.sync_all()
        .map_err(|err| StoreErr::Io(format!("sync lock metadata failed: {err}")))?;
    Ok(())
}

/// Contents of the lock file when its holder is stale, `None` while it is live.
fn stale_contents(path: &Path, stale_after: Duration) -> Option<String> {
    let stale_window_ms = stale_after.as_millis() as i64;
    let raw = fs::read_to_string(path).ok()?;

    if let Some(heartbeat_unix_ms) = parse_lock_created_unix_ms(&raw) {
        let stale = now_unix_millis().saturating_sub(heartbeat_unix_ms) >= stale_window_ms;
        return stale.then_some(raw);
    }

    // Metadata not written yet or unreadable: fall back to the file clock.
    let elapsed = fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()?;
    (elapsed >= stale_after).then_some(raw)
}

fn parse_lock_created_unix_ms(raw: &str) -> Option<i64> {
    let mut fields = raw.trim().split(':');
    fields.next()?;
    fields.next()?.parse::<i64>().ok()
}

fn parse_lock_owner(raw: &str) -> Option<&str> {
    raw.trim().splitn(3, ':').nth(2)
}

#[cfg(test)]
pub(crate) fn parse_lock_created_for_test(raw: &str) -> Option<i64> {
    parse_lock_created_unix_ms(raw)
}
