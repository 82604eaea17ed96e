//! On-disk session store: `<root>/.eclia/sessions/<id>/{meta.json,transcript.ndjson}`.
//!
//! Grounded on sblanchard's `sessions/store.rs` (per-entry metadata) and
//! `sessions/transcript.rs` (append-only JSONL with tolerant reads), but
//! restructured into one subdirectory per session — matching the teacher's
//! `ctx_file.rs` one-file-per-session layout — with true atomic temp-write +
//! rename for `meta.json`, since transcript.rs's `flush()` is a direct
//! overwrite and spec requires crash-safety here.

use std::path::{Path, PathBuf};

use chrono::Utc;
use eclia_core::{Error, Result, SessionMeta, TranscriptRecord};

pub struct StoredTranscript {
    pub meta: SessionMeta,
    pub records: Vec<TranscriptRecord>,
}

/// Crash-safe, single-writer-per-session filesystem store. The Session Lock
/// (see [`crate::lock::SessionLock`]) is responsible for serializing
/// concurrent `append*`/`updateMeta` calls on the same session id; this type
/// assumes that discipline is already held by its caller.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// `root` is the workspace root; sessions live under
    /// `<root>/.eclia/sessions/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join(".eclia").join("sessions")
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("meta.json")
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("transcript.ndjson")
    }

    pub fn artifacts_dir(&self, id: &str) -> PathBuf {
        self.root
            .join(".eclia")
            .join("artifacts")
            .join(id)
    }

    /// Writes `value` to `path` via a temp file in the same directory,
    /// followed by a rename — the rename is atomic on the same filesystem,
    /// so readers never observe a half-written file.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            Error::Internal("write_atomic: path has no parent".to_string())
        })?;
        std::fs::create_dir_all(parent)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Creates the session directory and `meta.json` atomically if absent.
    /// Idempotent: calling twice is equivalent to calling once.
    pub fn ensure_session(
        &self,
        id: &str,
        seed_title: Option<String>,
        seed_origin: Option<eclia_core::Origin>,
    ) -> Result<SessionMeta> {
        if !eclia_core::is_valid_session_id(id) {
            return Err(Error::invalid_request(format!("invalid session id: {id}")));
        }

        let meta_path = self.meta_path(id);
        if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)?;
            return Ok(serde_json::from_str(&raw)?);
        }

        let now = Utc::now();
        let mut meta = SessionMeta::new(id, now);
        meta.title = seed_title;
        meta.origin = seed_origin;

        let transcript_path = self.transcript_path(id);
        std::fs::create_dir_all(self.session_dir(id))?;
        if !transcript_path.exists() {
            std::fs::File::create(&transcript_path)?;
        }

        let json = serde_json::to_vec_pretty(&meta)?;
        self.write_atomic(&meta_path, &json)?;

        tracing::info!(session_id = id, "session created");
        Ok(meta)
    }

    /// Returns all transcript records plus the session meta. Tolerates
    /// trailing partial lines by skipping them, matching spec §4.1.
    pub fn read_transcript(&self, id: &str) -> Result<StoredTranscript> {
        let meta_path = self.meta_path(id);
        if !meta_path.exists() {
            return Err(Error::session_not_found(id));
        }
        let raw_meta = std::fs::read_to_string(&meta_path)?;
        let meta: SessionMeta = serde_json::from_str(&raw_meta)?;

        let transcript_path = self.transcript_path(id);
        let mut records = Vec::new();
        if transcript_path.exists() {
            let raw = std::fs::read_to_string(&transcript_path)?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TranscriptRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(
                            session_id = id,
                            error = %e,
                            "ignoring malformed/partial transcript line"
                        );
                    }
                }
            }
        }

        Ok(StoredTranscript { meta, records })
    }

    /// Appends one transcript record. Fails with `SessionNotFound` if the
    /// session directory is absent.
    pub fn append_transcript(&self, id: &str, record: &TranscriptRecord) -> Result<()> {
        let transcript_path = self.transcript_path(id);
        if !transcript_path.exists() {
            return Err(Error::session_not_found(id));
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&transcript_path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Appends a turn-close marker.
    pub fn append_turn(
        &self,
        id: &str,
        turn_id: impl Into<String>,
        upstream_model: impl Into<String>,
        token_budget: usize,
        used_tokens: usize,
    ) -> Result<()> {
        let record = TranscriptRecord::Turn {
            turn_id: turn_id.into(),
            upstream_model: upstream_model.into(),
            token_budget,
            used_tokens,
            git_commit: None,
            runtime_overrides: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        self.append_transcript(id, &record)
    }

    /// Read-modify-write of `meta.json` with atomic rename.
    pub fn update_meta(&self, id: &str, patch: impl FnOnce(&mut SessionMeta)) -> Result<SessionMeta> {
        let meta_path = self.meta_path(id);
        if !meta_path.exists() {
            return Err(Error::session_not_found(id));
        }
        let raw = std::fs::read_to_string(&meta_path)?;
        let mut meta: SessionMeta = serde_json::from_str(&raw)?;
        patch(&mut meta);
        meta.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&meta)?;
        self.write_atomic(&meta_path, &json)?;
        Ok(meta)
    }

    /// Truncates the transcript to empty, keeping meta (used by
    /// `POST /api/sessions/{id}/reset`).
    pub fn reset_transcript(&self, id: &str) -> Result<()> {
        let transcript_path = self.transcript_path(id);
        if !transcript_path.exists() {
            return Err(Error::session_not_found(id));
        }
        std::fs::File::create(&transcript_path)?;
        Ok(())
    }

    /// Removes the session directory and its artifact subtree. Callers must
    /// hold the session lock to avoid racing an in-flight turn; the lock
    /// itself enforces `SessionInUse` at a higher layer.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        let artifacts = self.artifacts_dir(id);
        if artifacts.exists() {
            std::fs::remove_dir_all(&artifacts)?;
        }
        tracing::info!(session_id = id, "session deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<SessionMeta>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join("meta.json");
            if !meta_path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&meta_path)?;
            if let Ok(meta) = serde_json::from_str::<SessionMeta>(&raw) {
                out.push(meta);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SessionStore::new(dir.path()), dir)
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let (store, _dir) = store();
        let m1 = store.ensure_session("s1", None, None).unwrap();
        let m2 = store.ensure_session("s1", Some("ignored".into()), None).unwrap();
        assert_eq!(m1.created_at, m2.created_at);
        assert!(m2.title.is_none());
    }

    #[test]
    fn ensure_session_rejects_bad_id() {
        let (store, _dir) = store();
        assert!(store.ensure_session("bad id", None, None).is_err());
    }

    #[test]
    fn append_before_ensure_fails() {
        let (store, _dir) = store();
        let rec = TranscriptRecord::message(eclia_core::Role::User, "hi", Utc::now());
        let err = store.append_transcript("nope", &rec).unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (store, _dir) = store();
        store.ensure_session("s1", None, None).unwrap();
        let rec = TranscriptRecord::message(eclia_core::Role::User, "hello", Utc::now());
        store.append_transcript("s1", &rec).unwrap();
        let stored = store.read_transcript("s1").unwrap();
        assert_eq!(stored.records.len(), 1);
    }

    #[test]
    fn read_transcript_tolerates_trailing_garbage() {
        let (store, dir) = store();
        store.ensure_session("s1", None, None).unwrap();
        let rec = TranscriptRecord::message(eclia_core::Role::User, "hello", Utc::now());
        store.append_transcript("s1", &rec).unwrap();

        let path = dir.path().join(".eclia/sessions/s1/transcript.ndjson");
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not valid json\n");
        std::fs::write(&path, contents).unwrap();

        let stored = store.read_transcript("s1").unwrap();
        assert_eq!(stored.records.len(), 1);
    }

    #[test]
    fn update_meta_read_modify_write() {
        let (store, _dir) = store();
        store.ensure_session("s1", None, None).unwrap();
        let updated = store
            .update_meta("s1", |m| m.title = Some("My Session".into()))
            .unwrap();
        assert_eq!(updated.title.as_deref(), Some("My Session"));

        let reloaded = store.read_transcript("s1").unwrap();
        assert_eq!(reloaded.meta.title.as_deref(), Some("My Session"));
    }

    #[test]
    fn delete_session_removes_directory() {
        let (store, dir) = store();
        store.ensure_session("s1", None, None).unwrap();
        store.delete_session("s1").unwrap();
        assert!(!dir.path().join(".eclia/sessions/s1").exists());
        assert!(store.read_transcript("s1").is_err());
    }

    #[test]
    fn reset_keeps_meta_but_clears_transcript() {
        let (store, _dir) = store();
        store.ensure_session("s1", None, None).unwrap();
        let rec = TranscriptRecord::message(eclia_core::Role::User, "hi", Utc::now());
        store.append_transcript("s1", &rec).unwrap();
        store.reset_transcript("s1").unwrap();
        let stored = store.read_transcript("s1").unwrap();
        assert!(stored.records.is_empty());
        assert_eq!(stored.meta.id, "s1");
    }
}
