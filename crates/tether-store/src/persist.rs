//! On-disk layout and atomic JSON writes.
//!
//! ```text
//! <root>/
//!   active/<session_id>.json
//!   completed/<session_id>.json
//!   completed/refinements/<session_id>.<role>.<fingerprint>.json
//!   refinements/<session_id>.<role>.<fingerprint>.json
//! ```
//!
//! Name parts are escaped with [`encode_name`], so distinct ids, roles and
//! fingerprints never share a file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::StoreError;

#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.root.join("completed")
    }

    pub fn refinements_dir(&self) -> PathBuf {
        self.root.join("refinements")
    }

    /// Lineages of sessions that have left the active set.
    pub fn archived_refinements_dir(&self) -> PathBuf {
        self.completed_dir().join("refinements")
    }

    pub fn create_dirs(&self) -> Result<(), StoreError> {
        for dir in [
            self.active_dir(),
            self.completed_dir(),
            self.refinements_dir(),
            self.archived_refinements_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn active_path(&self, session_id: &str) -> PathBuf {
        self.active_dir().join(format!("{}.json", encode_name(session_id)))
    }

    pub fn completed_path(&self, session_id: &str) -> PathBuf {
        self.completed_dir().join(format!("{}.json", encode_name(session_id)))
    }

    pub fn lineage_path(&self, session_id: &str, role: &str, fingerprint: &str) -> PathBuf {
        self.refinements_dir().join(lineage_file_name(session_id, role, fingerprint))
    }

    pub fn archived_lineage_path(&self, session_id: &str, role: &str, fingerprint: &str) -> PathBuf {
        self.archived_refinements_dir()
            .join(lineage_file_name(session_id, role, fingerprint))
    }
}

fn lineage_file_name(session_id: &str, role: &str, fingerprint: &str) -> String {
    format!(
        "{}.{}.{}.json",
        encode_name(session_id),
        encode_name(role),
        encode_name(fingerprint)
    )
}

/// Reversible file-name escaping: `[A-Za-z0-9_-]` is kept and every other
/// byte becomes `%XX`. An encoded part never contains `.`, which separates
/// the parts of a lineage file name.
pub fn encode_name(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Serialize `value` to a sibling temp file, fsync, then rename over `path`.
/// A crash at any point leaves either the old file or the new one.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", tmp.display())))?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| StoreError::Io(format!("rename {}: {e}", path.display())))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path)
        .map_err(|e| StoreError::Io(format!("read {}: {e}", path.display())))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io(format!("remove {}: {e}", path.display()))),
    }
}

/// Load every `*.json` file in `dir`. Unreadable files are skipped with a
/// warning; leftover `.json.tmp` files from an interrupted write are removed.
pub fn load_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StoreError::Io(format!("read dir {}: {e}", dir.display()))),
    };

    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.ends_with(".json.tmp") {
            let _ = fs::remove_file(&path);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path) {
            Ok(value) => out.push(value),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_replaces_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");

        write_atomic(&path, &json!({"n": 1})).unwrap();
        write_atomic(&path, &json!({"n": 2})).unwrap();

        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["n"], 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_dir_skips_garbage_and_tmp() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(&dir.path().join("a.json"), &json!({"n": 1})).unwrap();
        fs::write(dir.path().join("b.json"), "{ not json").unwrap();
        fs::write(dir.path().join("c.json.tmp"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let values: Vec<serde_json::Value> = load_dir(dir.path()).unwrap();
        assert_eq!(values.len(), 1);
        assert!(!dir.path().join("c.json.tmp").exists());
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<serde_json::Value> = load_dir(&dir.path().join("nope")).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn lineage_names_are_escaped() {
        let layout = StoreLayout::new("/tmp/x");
        let p = layout.lineage_path("sess_1", "code/reviewer", "abc");
        assert_eq!(p.file_name().unwrap(), "sess_1.code%2Freviewer.abc.json");
    }

    #[test]
    fn similar_roles_get_distinct_lineage_files() {
        let layout = StoreLayout::new("/tmp/x");
        let roles = ["a.b", "a_b", "a/b", "a b", "a%2Eb", "a%b", "ab"];
        let paths: std::collections::HashSet<PathBuf> = roles
            .iter()
            .map(|role| layout.lineage_path("s1", role, "fp"))
            .collect();
        assert_eq!(paths.len(), roles.len());

        // part boundaries stay unambiguous
        assert_ne!(
            layout.lineage_path("a", "b.c", "d"),
            layout.lineage_path("a.b", "c", "d")
        );
    }

    #[test]
    fn session_ids_are_kept_readable() {
        assert_eq!(
            encode_name("sess_0192f3c4-7a1b-7c3d-9e2f-0a1b2c3d4e5f"),
            "sess_0192f3c4-7a1b-7c3d-9e2f-0a1b2c3d4e5f"
        );
        assert_eq!(encode_name("é"), "%C3%A9");
    }
}
