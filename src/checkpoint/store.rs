//! Durable checkpoint persistence.
//!
//! - Checkpoints are plain JSON documents, one file per phase
//! - Writes go to a uniquely named temp file in the target directory, are
//!   fsynced, then renamed over the target (atomic on POSIX)
//! - A missing file is `Ok(None)`; an unparseable file is `CorruptCheckpoint`
//!
//! Single writer only. Two runs sharing a checkpoint path is undefined.

use crate::models::{MailsiftError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Load a checkpoint document from `path`.
pub fn load_checkpoint<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MailsiftError::io("opening checkpoint", e)),
    };

    let state = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        MailsiftError::CorruptCheckpoint {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    Ok(Some(state))
}

/// Save a checkpoint document to `path` atomically.
pub fn save_checkpoint<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let temp_path = write_temp(value, path)?;

    if let Err(e) = fs::rename(&temp_path, path) {
        discard_temp(&temp_path);
        return Err(MailsiftError::io("renaming checkpoint", e));
    }

    sync_parent_dir(path);
    debug!(path = %path.display(), "Checkpoint saved");
    Ok(())
}

/// Serialize `value` into a fresh temp file beside `path`, fsynced.
///
/// Returns the temp path. The temp file is removed on any failure.
pub(crate) fn write_temp<T: Serialize>(value: &T, path: &Path) -> Result<PathBuf> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| MailsiftError::io("creating checkpoint dir", e))?;

    let temp_path = dir.join(temp_name(path));
    let result = (|| -> Result<()> {
        let file = File::create(&temp_path)
            .map_err(|e| MailsiftError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| MailsiftError::Internal(format!("Serializing checkpoint: {e}")))?;
        writer
            .flush()
            .map_err(|e| MailsiftError::io("writing temp checkpoint", e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| MailsiftError::io("syncing temp checkpoint", e))
    })();

    match result {
        Ok(()) => Ok(temp_path),
        Err(e) => {
            discard_temp(&temp_path);
            Err(e)
        }
    }
}

fn temp_name(path: &Path) -> String {
    format!(
        ".{}.{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("checkpoint"),
        uuid::Uuid::new_v4()
    )
}

fn discard_temp(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path)
        && e.kind() != ErrorKind::NotFound
    {
        warn!(path = %temp_path.display(), error = %e, "Failed to remove temp checkpoint");
    }
}

/// Best effort: make the rename itself durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        done: Vec<String>,
        total: usize,
    }

    fn doc(n: usize) -> Doc {
        Doc {
            done: (0..n).map(|i| format!("unit-{i}")).collect(),
            total: 10,
        }
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("checkpoint.json");

        save_checkpoint(&doc(3), &path).unwrap();
        let loaded: Doc = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded, doc(3));
    }

    #[test]
    fn test_missing_file_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let loaded: Option<Doc> = load_checkpoint(&temp_dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        fs::write(&path, "{\"done\": [\"a\",").unwrap();

        let result: Result<Option<Doc>> = load_checkpoint(&path);
        assert!(matches!(result, Err(MailsiftError::CorruptCheckpoint { .. })));
    }

    #[test]
    fn test_crash_before_rename_keeps_previous_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        save_checkpoint(&doc(2), &path).unwrap();
        let before = fs::read(&path).unwrap();

        // Temp write completes, process dies before the rename.
        let orphan = write_temp(&doc(5), &path).unwrap();
        assert!(orphan.exists());

        assert_eq!(fs::read(&path).unwrap(), before);
        let loaded: Doc = load_checkpoint(&path).unwrap().unwrap();
        assert_eq!(loaded, doc(2));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        save_checkpoint(&doc(1), &path).unwrap();
        save_checkpoint(&doc(2), &path).unwrap();

        let entries: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["checkpoint.json".to_string()]);
    }

    #[test]
    fn test_failed_rename_leaves_target_untouched() {
        let temp_dir = TempDir::new().unwrap();
        // A directory at the target path makes the rename fail.
        let path = temp_dir.path().join("checkpoint.json");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        assert!(save_checkpoint(&doc(1), &path).is_err());
        assert!(path.join("keep").exists());

        let leftovers = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
