//! On-disk session layout (`SPEC_FULL.md` §4.7, §6):
//!
//! ```text
//! fuzz_sessions/<prefix><timestamp>/
//!     testcases/<name>/<name>.<src-ext>
//!     bugs/<bucket_id>/{bucket_meta,cases,<name>/<name>_info.txt, hs_err_*.log}
//!     bugs/bugs_index.json
//!     failed/<name>/<name>_info.txt
//!     fuzzer.log
//! ```
//!
//! All cross-thread writes are serialized behind one lock, mirroring the
//! teacher's `JsonlWriter` (`Arc<Mutex<BufWriter<File>>>`); a single case
//! directory is otherwise owned by whichever pipeline stage currently holds
//! the `TestCase`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io { path: path.to_path_buf(), source }
}

fn now_ts_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugIndexEntry {
    pub bucket_id: String,
    pub reason: String,
    pub first_case: String,
    pub case_count: u64,
}

pub struct Workspace {
    root: PathBuf,
    src_ext: String,
    write_lock: Mutex<()>,
}

impl Workspace {
    /// Create a fresh, timestamped session directory under `base_dir`.
    pub fn create_session(
        base_dir: &Path,
        prefix: &str,
        src_ext: &str,
    ) -> Result<Self, WorkspaceError> {
        let session_name = format!("{prefix}{}", now_ts_secs());
        let root = base_dir.join(session_name);
        for sub in ["testcases", "bugs", "failed"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(Workspace { root, src_ext: src_ext.to_string(), write_lock: Mutex::new(()) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn case_dir(&self, name: &str) -> PathBuf {
        self.root.join("testcases").join(name)
    }

    pub fn case_source_path(&self, name: &str) -> PathBuf {
        self.case_dir(name).join(format!("{name}.{}", self.src_ext))
    }

    /// Atomically create `testcases/<name>/<name>.<ext>` with `source`.
    /// Fails if the case already exists (names are globally unique; a
    /// second create for the same name indicates a bug upstream).
    pub fn write_case(&self, name: &str, source: &str) -> Result<PathBuf, WorkspaceError> {
        let _guard = self.write_lock.lock();
        let dir = self.case_dir(name);
        if dir.exists() {
            return Err(WorkspaceError::AlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = self.case_source_path(name);
        fs::write(&path, source).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Delete a case's directory. Idempotent: deleting an already-absent
    /// case is not an error (bug/archive operations must be safe to retry
    /// per `SPEC_FULL.md` §7).
    pub fn delete_case(&self, name: &str) -> Result<(), WorkspaceError> {
        let _guard = self.write_lock.lock();
        let dir = self.case_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    /// Move a case's directory to `failed/<name>/` with an info file
    /// summarizing why it was archived. Never a bug.
    pub fn archive_failed(&self, name: &str, reason: &str) -> Result<(), WorkspaceError> {
        let _guard = self.write_lock.lock();
        let failed_dir = self.root.join("failed").join(name);
        fs::create_dir_all(&failed_dir).map_err(|e| io_err(&failed_dir, e))?;
        let info_path = failed_dir.join(format!("{name}_info.txt"));
        fs::write(&info_path, reason).map_err(|e| io_err(&info_path, e))?;

        let case_dir = self.case_dir(name);
        if case_dir.exists() {
            move_dir(&case_dir, &failed_dir.join("source")).map_err(|e| io_err(&case_dir, e))?;
        }
        Ok(())
    }

    pub fn bucket_dir(&self, bucket_id: &str) -> PathBuf {
        self.root.join("bugs").join(bucket_id)
    }

    /// Write `bucket_meta` the first time a bucket is observed, copy the
    /// diagnostic log if one was referenced, and append the case name to
    /// the bucket's `cases` manifest. Safe to call repeatedly for the same
    /// bucket (idempotent create + append).
    pub fn record_bug_case(
        &self,
        bucket_id: &str,
        case_name: &str,
        meta_json: &str,
        diagnostic_log: Option<&Path>,
    ) -> Result<(), WorkspaceError> {
        let _guard = self.write_lock.lock();
        let bucket_dir = self.bucket_dir(bucket_id);
        let is_new = !bucket_dir.exists();
        fs::create_dir_all(&bucket_dir).map_err(|e| io_err(&bucket_dir, e))?;

        if is_new {
            let meta_path = bucket_dir.join("bucket_meta");
            fs::write(&meta_path, meta_json).map_err(|e| io_err(&meta_path, e))?;
            if let Some(log_path) = diagnostic_log {
                if log_path.exists() {
                    let dest = bucket_dir.join(
                        log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("hs_err.log")),
                    );
                    fs::copy(log_path, &dest).map_err(|e| io_err(&dest, e))?;
                }
            }
        }

        let case_src = self.case_dir(case_name);
        let case_dest = bucket_dir.join(case_name);
        if case_src.exists() && !case_dest.exists() {
            let _ = fs::create_dir_all(&case_dest);
            for entry in fs::read_dir(&case_src).map_err(|e| io_err(&case_src, e))? {
                let entry = entry.map_err(|e| io_err(&case_src, e))?;
                let dest = case_dest.join(entry.file_name());
                let _ = fs::copy(entry.path(), &dest);
            }
        }

        let cases_path = bucket_dir.join("cases");
        append_line(&cases_path, case_name)?;
        Ok(())
    }

    /// Append-only rewrite of the bugs index, kept sorted by bucket id.
    pub fn upsert_bugs_index(&self, entry: BugIndexEntry) -> Result<(), WorkspaceError> {
        let _guard = self.write_lock.lock();
        let index_path = self.root.join("bugs").join("bugs_index.json");
        let mut entries: Vec<BugIndexEntry> = if index_path.exists() {
            let text = fs::read_to_string(&index_path).map_err(|e| io_err(&index_path, e))?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            Vec::new()
        };

        match entries.iter_mut().find(|e| e.bucket_id == entry.bucket_id) {
            Some(existing) => existing.case_count += 1,
            None => entries.push(entry),
        }
        entries.sort_by(|a, b| a.bucket_id.cmp(&b.bucket_id));

        let text = serde_json::to_string_pretty(&entries)
            .map_err(|e| WorkspaceError::Io { path: index_path.clone(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
        fs::write(&index_path, text).map_err(|e| io_err(&index_path, e))?;
        Ok(())
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), WorkspaceError> {
    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))?;
    writeln!(f, "{line}").map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Atomic move when source and destination share a filesystem (the common
/// case inside one session directory); falls back to copy+delete across
/// filesystems.
fn move_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(from, to)?;
            fs::remove_dir_all(from)
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_case_source() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::create_session(tmp.path(), "sess-", "src").unwrap();
        ws.write_case("c1", "hello world").unwrap();
        let path = ws.case_source_path("c1");
        assert_eq!(fs::read_to_string(path).unwrap(), "hello world");
    }

    #[test]
    fn duplicate_case_name_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::create_session(tmp.path(), "sess-", "src").unwrap();
        ws.write_case("c1", "a").unwrap();
        assert!(ws.write_case("c1", "b").is_err());
    }

    #[test]
    fn delete_case_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::create_session(tmp.path(), "sess-", "src").unwrap();
        ws.write_case("c1", "a").unwrap();
        ws.delete_case("c1").unwrap();
        ws.delete_case("c1").unwrap();
    }

    #[test]
    fn bug_index_tracks_counts_sorted_by_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::create_session(tmp.path(), "sess-", "src").unwrap();
        ws.upsert_bugs_index(BugIndexEntry {
            bucket_id: "b_222".into(),
            reason: "x".into(),
            first_case: "c1".into(),
            case_count: 1,
        })
        .unwrap();
        ws.upsert_bugs_index(BugIndexEntry {
            bucket_id: "b_111".into(),
            reason: "y".into(),
            first_case: "c2".into(),
            case_count: 1,
        })
        .unwrap();
        ws.upsert_bugs_index(BugIndexEntry {
            bucket_id: "b_222".into(),
            reason: "x".into(),
            first_case: "c3".into(),
            case_count: 1,
        })
        .unwrap();

        let text = fs::read_to_string(ws.root().join("bugs").join("bugs_index.json")).unwrap();
        let entries: Vec<BugIndexEntry> = serde_json::from_str(&text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bucket_id, "b_111");
        assert_eq!(entries[1].bucket_id, "b_222");
        assert_eq!(entries[1].case_count, 2);
    }
}
