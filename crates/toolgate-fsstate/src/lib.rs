//! Process-wide read/write timestamps per path, and the stale-write check
//! built on them.
//!
//! The registry models the one real filesystem, so it is not session
//! scoped. It is an explicitly constructed service injected into every
//! pipeline run, never ambient global state.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, Default)]
struct Stamp {
    last_read: Option<DateTime<Utc>>,
    last_write: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct FileTimes {
    inner: RwLock<HashMap<PathBuf, Stamp>>,
}

impl FileTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, path: &Path) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entry(path.to_path_buf()).or_default().last_read = Some(Utc::now());
    }

    pub fn record_write(&self, path: &Path) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.entry(path.to_path_buf()).or_default().last_write = Some(Utc::now());
    }

    /// Epoch when the path was never read: an existing file the agent has
    /// not observed is always stale relative to it.
    pub fn last_read(&self, path: &Path) -> DateTime<Utc> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(path)
            .and_then(|stamp| stamp.last_read)
            .unwrap_or_else(epoch)
    }

    pub fn last_write(&self, path: &Path) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(path).and_then(|stamp| stamp.last_write)
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCheck {
    Writable,
    Stale {
        modified: DateTime<Utc>,
        last_read: DateTime<Utc>,
    },
}

/// Read-only decision: does writing `path` risk clobbering a change the
/// agent has not seen? Compares the on-disk mtime against the last *read*
/// (never the last write), so a rewrite without an intervening read is not
/// flagged merely because of the agent's own previous write.
#[derive(Clone)]
pub struct ConsistencyGuard {
    times: Arc<FileTimes>,
}

impl ConsistencyGuard {
    pub fn new(times: Arc<FileTimes>) -> Self {
        Self { times }
    }

    pub fn check_writable(&self, path: &Path) -> Result<WriteCheck> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            // Nothing on disk, nothing to be stale relative to.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(WriteCheck::Writable),
            Err(err) => return Err(err.into()),
        };

        let modified: DateTime<Utc> = metadata.modified()?.into();
        let last_read = self.times.last_read(path);
        if modified > last_read {
            return Ok(WriteCheck::Stale {
                modified,
                last_read,
            });
        }
        Ok(WriteCheck::Writable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread::sleep;
    use std::time::Duration;
    use uuid::Uuid;

    fn temp_file(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("toolgate-fsstate-{tag}-{}", Uuid::now_v7()));
        fs::create_dir_all(&dir).expect("dir");
        dir.join("file.txt")
    }

    #[test]
    fn missing_path_is_always_writable() {
        let guard = ConsistencyGuard::new(Arc::new(FileTimes::new()));
        let check = guard
            .check_writable(Path::new("/nonexistent/toolgate/file.txt"))
            .expect("check");
        assert_eq!(check, WriteCheck::Writable);
    }

    #[test]
    fn existing_unread_file_is_stale() {
        let path = temp_file("unread");
        fs::write(&path, "content").expect("seed");

        let guard = ConsistencyGuard::new(Arc::new(FileTimes::new()));
        assert!(matches!(
            guard.check_writable(&path).expect("check"),
            WriteCheck::Stale { .. }
        ));
    }

    #[test]
    fn reading_makes_the_file_writable() {
        let path = temp_file("read");
        fs::write(&path, "content").expect("seed");

        let times = Arc::new(FileTimes::new());
        times.record_read(&path);
        let guard = ConsistencyGuard::new(Arc::clone(&times));
        assert_eq!(guard.check_writable(&path).expect("check"), WriteCheck::Writable);
    }

    #[test]
    fn external_modification_after_read_is_stale() {
        let path = temp_file("external");
        fs::write(&path, "v1").expect("seed");

        let times = Arc::new(FileTimes::new());
        times.record_read(&path);
        sleep(Duration::from_millis(20));
        fs::write(&path, "v2").expect("external edit");

        let guard = ConsistencyGuard::new(Arc::clone(&times));
        match guard.check_writable(&path).expect("check") {
            WriteCheck::Stale {
                modified,
                last_read,
            } => assert!(modified > last_read),
            WriteCheck::Writable => panic!("external edit not detected"),
        }
    }

    #[test]
    fn rewrite_without_reread_stays_writable_when_read_is_refreshed() {
        let path = temp_file("rewrite");
        fs::write(&path, "v1").expect("seed");

        let times = Arc::new(FileTimes::new());
        times.record_read(&path);
        // The pipeline's own write refreshes both stamps; a second write
        // without a fresh read must not be rejected.
        fs::write(&path, "v2").expect("agent write");
        times.record_write(&path);
        times.record_read(&path);

        let guard = ConsistencyGuard::new(Arc::clone(&times));
        assert_eq!(guard.check_writable(&path).expect("check"), WriteCheck::Writable);
    }

    #[test]
    fn write_stamp_is_tracked_separately_from_the_read_stamp() {
        let path = temp_file("write-stamp");
        fs::write(&path, "content").expect("seed");

        let times = FileTimes::new();
        assert!(times.last_write(&path).is_none());

        times.record_write(&path);
        let written = times.last_write(&path).expect("write stamp");
        // A write alone does not count as having observed the content:
        // the read stamp stays at the epoch and the guard stays armed.
        assert_eq!(times.last_read(&path), epoch());

        times.record_read(&path);
        assert!(times.last_read(&path) >= written);
        assert_eq!(times.last_write(&path), Some(written));
    }

    #[test]
    fn stamps_are_tracked_per_path() {
        let read_path = temp_file("per-path-a");
        let other = temp_file("per-path-b");
        fs::write(&read_path, "a").expect("seed");
        fs::write(&other, "b").expect("seed");

        let times = Arc::new(FileTimes::new());
        times.record_read(&read_path);

        let guard = ConsistencyGuard::new(Arc::clone(&times));
        assert_eq!(
            guard.check_writable(&read_path).expect("check"),
            WriteCheck::Writable
        );
        assert!(matches!(
            guard.check_writable(&other).expect("check"),
            WriteCheck::Stale { .. }
        ));
    }
}
