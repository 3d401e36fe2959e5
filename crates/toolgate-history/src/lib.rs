//! Per-(session, path) immutable content snapshots.
//!
//! Full content at every version; diffs are recomputed on demand for
//! display. The first version for a pair is always the pre-image (the
//! content on disk before the session's first mutation), and an external
//! edit observed between two agent writes is captured as its own version,
//! so a file's lineage within a session has no gaps.

use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use toolgate_core::runtime_dir;
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS file_versions (
        id INTEGER PRIMARY KEY,
        session_id TEXT NOT NULL,
        path TEXT NOT NULL,
        version INTEGER NOT NULL,
        content TEXT NOT NULL,
        content_sha256 TEXT NOT NULL,
        origin TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (session_id, path, version)
     );
     CREATE INDEX IF NOT EXISTS idx_file_versions_lookup
        ON file_versions (session_id, path, version);",
)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOrigin {
    /// Pre-image captured before the session's first mutation.
    Initial,
    /// Out-of-band change observed between agent writes.
    External,
    /// Content the agent wrote.
    Agent,
}

impl VersionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::External => "external",
            Self::Agent => "agent",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "initial" => Ok(Self::Initial),
            "external" => Ok(Self::External),
            "agent" => Ok(Self::Agent),
            other => Err(anyhow!("unknown version origin: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub session_id: Uuid,
    pub path: String,
    pub version: i64,
    pub content: String,
    pub origin: VersionOrigin,
    pub created_at: String,
}

/// Outcome of one mutating call's bookkeeping: every version row the call
/// appended, in append order.
#[derive(Debug, Clone, Default)]
pub struct MutationVersions {
    pub created: Vec<FileVersion>,
}

impl MutationVersions {
    pub fn drift_captured(&self) -> bool {
        self.created
            .iter()
            .any(|v| v.origin == VersionOrigin::External)
    }
}

pub struct HistoryStore {
    // Append order per (session, path) is a correctness guarantee, so all
    // writers share one serialized connection.
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn new(workspace: &Path) -> Result<Self> {
        let root = runtime_dir(workspace);
        fs::create_dir_all(&root)?;
        let conn = Connection::open(root.join("history.sqlite"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn latest(&self, session_id: Uuid, path: &str) -> Result<Option<FileVersion>> {
        let conn = self.lock()?;
        Self::latest_in(&conn, session_id, path)
    }

    /// Records the pre-image for a pair; fails if any version already exists.
    pub fn create_initial(
        &self,
        session_id: Uuid,
        path: &str,
        content: &str,
    ) -> Result<FileVersion> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if Self::latest_in(&tx, session_id, path)?.is_some() {
            return Err(anyhow!(
                "initial version already exists for session {session_id} path {path}"
            ));
        }
        let version = Self::insert(&tx, session_id, path, content, VersionOrigin::Initial)?;
        tx.commit()?;
        Ok(version)
    }

    pub fn append(
        &self,
        session_id: Uuid,
        path: &str,
        content: &str,
        origin: VersionOrigin,
    ) -> Result<FileVersion> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let version = Self::insert(&tx, session_id, path, content, origin)?;
        tx.commit()?;
        Ok(version)
    }

    /// All bookkeeping for one agent mutation, atomically: pre-image if the
    /// pair is new, an external version if the on-disk content drifted from
    /// the last recorded version, then the agent's new content.
    pub fn record_mutation(
        &self,
        session_id: Uuid,
        path: &str,
        on_disk_before: &str,
        new_content: &str,
    ) -> Result<MutationVersions> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut created = Vec::new();

        match Self::latest_in(&tx, session_id, path)? {
            None => {
                created.push(Self::insert(
                    &tx,
                    session_id,
                    path,
                    on_disk_before,
                    VersionOrigin::Initial,
                )?);
            }
            Some(latest) if latest.content != on_disk_before => {
                created.push(Self::insert(
                    &tx,
                    session_id,
                    path,
                    on_disk_before,
                    VersionOrigin::External,
                )?);
            }
            Some(_) => {}
        }

        created.push(Self::insert(
            &tx,
            session_id,
            path,
            new_content,
            VersionOrigin::Agent,
        )?);
        tx.commit()?;
        Ok(MutationVersions { created })
    }

    pub fn list_versions(&self, session_id: Uuid, path: &str) -> Result<Vec<FileVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, path, version, content, origin, created_at
             FROM file_versions WHERE session_id = ?1 AND path = ?2
             ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string(), path], Self::row_to_version)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn version_content(
        &self,
        session_id: Uuid,
        path: &str,
        version: i64,
    ) -> Result<Option<String>> {
        let conn = self.lock()?;
        let content = conn
            .query_row(
                "SELECT content FROM file_versions
                 WHERE session_id = ?1 AND path = ?2 AND version = ?3",
                params![session_id.to_string(), path, version],
                |r| r.get(0),
            )
            .optional()?;
        Ok(content)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history store lock poisoned"))
    }

    fn latest_in(
        conn: &Connection,
        session_id: Uuid,
        path: &str,
    ) -> Result<Option<FileVersion>> {
        let version = conn
            .query_row(
                "SELECT session_id, path, version, content, origin, created_at
                 FROM file_versions WHERE session_id = ?1 AND path = ?2
                 ORDER BY version DESC LIMIT 1",
                params![session_id.to_string(), path],
                Self::row_to_version,
            )
            .optional()?;
        version.transpose()
    }

    fn insert(
        tx: &Transaction<'_>,
        session_id: Uuid,
        path: &str,
        content: &str,
        origin: VersionOrigin,
    ) -> Result<FileVersion> {
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM file_versions
             WHERE session_id = ?1 AND path = ?2",
            params![session_id.to_string(), path],
            |r| r.get(0),
        )?;
        let created_at = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO file_versions (session_id, path, version, content, content_sha256, origin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id.to_string(),
                path,
                next,
                content,
                sha256_hex(content.as_bytes()),
                origin.as_str(),
                created_at,
            ],
        )?;
        Ok(FileVersion {
            session_id,
            path: path.to_string(),
            version: next,
            content: content.to_string(),
            origin,
            created_at,
        })
    }

    fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FileVersion>> {
        let session_id: String = row.get(0)?;
        let path: String = row.get(1)?;
        let version: i64 = row.get(2)?;
        let content: String = row.get(3)?;
        let origin: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        Ok(build_version(
            session_id, path, version, content, origin, created_at,
        ))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;
        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

fn build_version(
    session_id: String,
    path: String,
    version: i64,
    content: String,
    origin: String,
    created_at: String,
) -> Result<FileVersion> {
    Ok(FileVersion {
        session_id: Uuid::parse_str(&session_id)?,
        path,
        version,
        content,
        origin: VersionOrigin::parse(&origin)?,
        created_at,
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn temp_store(tag: &str) -> (PathBuf, HistoryStore) {
        let workspace =
            std::env::temp_dir().join(format!("toolgate-history-{tag}-{}", Uuid::now_v7()));
        fs::create_dir_all(&workspace).expect("workspace");
        let store = HistoryStore::new(&workspace).expect("store");
        (workspace, store)
    }

    #[test]
    fn first_mutation_records_pre_image_then_agent_content() {
        let (_ws, store) = temp_store("preimage");
        let session = Uuid::now_v7();

        let result = store
            .record_mutation(session, "/tmp/notes.txt", "", "hello\n")
            .expect("record");
        assert_eq!(result.created.len(), 2);
        assert_eq!(result.created[0].origin, VersionOrigin::Initial);
        assert_eq!(result.created[0].content, "");
        assert_eq!(result.created[1].origin, VersionOrigin::Agent);
        assert_eq!(result.created[1].content, "hello\n");
        assert!(!result.drift_captured());

        let versions = store
            .list_versions(session, "/tmp/notes.txt")
            .expect("list");
        assert_eq!(
            versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn out_of_band_drift_gets_its_own_version() {
        let (_ws, store) = temp_store("drift");
        let session = Uuid::now_v7();
        let path = "/tmp/drift.txt";

        store
            .record_mutation(session, path, "one\n", "two\n")
            .expect("first");
        // A human edited the file to "three" behind the agent's back; the
        // next mutation sees "three" on disk, not the recorded "two".
        let result = store
            .record_mutation(session, path, "three\n", "four\n")
            .expect("second");
        assert!(result.drift_captured());

        let contents: Vec<_> = store
            .list_versions(session, path)
            .expect("list")
            .into_iter()
            .map(|v| (v.origin, v.content))
            .collect();
        assert_eq!(
            contents,
            vec![
                (VersionOrigin::Initial, "one\n".to_string()),
                (VersionOrigin::Agent, "two\n".to_string()),
                (VersionOrigin::External, "three\n".to_string()),
                (VersionOrigin::Agent, "four\n".to_string()),
            ]
        );
    }

    #[test]
    fn unchanged_disk_content_appends_only_the_agent_version() {
        let (_ws, store) = temp_store("clean");
        let session = Uuid::now_v7();
        let path = "/tmp/clean.txt";

        store
            .record_mutation(session, path, "a\n", "b\n")
            .expect("first");
        let result = store
            .record_mutation(session, path, "b\n", "c\n")
            .expect("second");
        assert_eq!(result.created.len(), 1);
        assert_eq!(result.created[0].origin, VersionOrigin::Agent);
        assert_eq!(store.list_versions(session, path).expect("list").len(), 3);
    }

    #[test]
    fn create_initial_rejects_a_second_call() {
        let (_ws, store) = temp_store("initial");
        let session = Uuid::now_v7();
        store
            .create_initial(session, "/tmp/x.txt", "seed")
            .expect("first");
        assert!(store.create_initial(session, "/tmp/x.txt", "seed").is_err());
    }

    #[test]
    fn histories_are_scoped_per_session_and_path() {
        let (_ws, store) = temp_store("scope");
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        store.record_mutation(a, "/p1", "", "x").expect("a/p1");
        store.record_mutation(b, "/p1", "", "y").expect("b/p1");
        store.record_mutation(a, "/p2", "", "z").expect("a/p2");

        assert_eq!(store.list_versions(a, "/p1").expect("list").len(), 2);
        assert_eq!(store.list_versions(b, "/p1").expect("list").len(), 2);
        assert_eq!(store.list_versions(a, "/p2").expect("list").len(), 2);
        assert!(store.list_versions(b, "/p2").expect("list").is_empty());
    }

    #[test]
    fn concurrent_appends_keep_versions_strictly_increasing() {
        let (_ws, store) = temp_store("concurrent");
        let store = Arc::new(store);
        let session = Uuid::now_v7();
        let path = "/tmp/shared.txt";

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    store
                        .append(
                            session,
                            path,
                            &format!("w{worker}-{i}"),
                            VersionOrigin::Agent,
                        )
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let versions = store.list_versions(session, path).expect("list");
        assert_eq!(versions.len(), 40);
        for (idx, version) in versions.iter().enumerate() {
            assert_eq!(version.version, idx as i64 + 1);
        }
    }

    #[test]
    fn version_content_fetches_exact_snapshots() {
        let (_ws, store) = temp_store("content");
        let session = Uuid::now_v7();
        store
            .record_mutation(session, "/tmp/c.txt", "old\n", "new\n")
            .expect("record");

        assert_eq!(
            store
                .version_content(session, "/tmp/c.txt", 1)
                .expect("fetch"),
            Some("old\n".to_string())
        );
        assert_eq!(
            store
                .version_content(session, "/tmp/c.txt", 2)
                .expect("fetch"),
            Some("new\n".to_string())
        );
        assert_eq!(
            store
                .version_content(session, "/tmp/c.txt", 9)
                .expect("fetch"),
            None
        );
    }
}
