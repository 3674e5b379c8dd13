//! Managed session directories under the sessions root

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize)]
pub struct SessionDirEntry {
    pub session_id: String,
    pub path: PathBuf,
    pub mtime_epoch: f64,
    pub age_seconds: f64,
    pub size_bytes: u64,
    pub has_active: bool,
    pub has_scratch: bool,
    pub has_checkpoints: bool,
    pub is_current: bool,
    pub is_stale: bool,
    pub is_orphaned: bool,
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Latest mtime over the directory and everything in it, plus the total file size.
fn dir_stats(dir: &Path) -> (f64, u64) {
    let mut latest = 0.0_f64;
    let mut size = 0_u64;
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if let Ok(modified) = meta.modified() {
            latest = latest.max(epoch_secs(modified));
        }
        if meta.is_file() {
            size += meta.len();
        }
    }
    (latest, size)
}

/// List session directories, newest first.
///
/// A directory is orphaned when none of `live_commands` mentions its path.
pub fn scan_session_dirs(
    sessions_root: &Path,
    current_session: &str,
    stale_secs: u64,
    live_commands: &[String],
    now_epoch: f64,
) -> Vec<SessionDirEntry> {
    let Ok(read_dir) = std::fs::read_dir(sessions_root) else {
        return Vec::new();
    };

    let mut entries: Vec<SessionDirEntry> = read_dir
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| {
            let path = e.path();
            let session_id = e.file_name().to_string_lossy().to_string();
            let (mtime_epoch, size_bytes) = dir_stats(&path);
            let age_seconds = (now_epoch - mtime_epoch).max(0.0);
            let is_current = session_id == current_session;
            let marker = path.to_string_lossy().to_string();
            SessionDirEntry {
                has_active: path.join("active.maxpat").exists(),
                has_scratch: path.join("scratch.maxpat").exists(),
                has_checkpoints: path.join("checkpoints.json").exists(),
                is_stale: !is_current && age_seconds >= stale_secs as f64,
                is_orphaned: !live_commands.iter().any(|c| c.contains(&marker)),
                session_id,
                path,
                mtime_epoch,
                age_seconds,
                size_bytes,
                is_current,
            }
        })
        .collect();

    entries.sort_by(|a, b| b.mtime_epoch.total_cmp(&a.mtime_epoch));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_orders_and_flags() {
        let root = tempfile::tempdir().unwrap();
        for id in ["old", "mine"] {
            let dir = root.path().join(id);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("active.maxpat"), b"{}").unwrap();
        }
        std::fs::write(root.path().join("stray.txt"), b"x").unwrap();

        let live = vec![format!("max {}", root.path().join("mine").join("active.maxpat").display())];
        let now = crate::utils::now_epoch_secs() + 100.0;
        let entries = scan_session_dirs(root.path(), "mine", 50, &live, now);

        assert_eq!(entries.len(), 2);
        let mine = entries.iter().find(|e| e.session_id == "mine").unwrap();
        let old = entries.iter().find(|e| e.session_id == "old").unwrap();
        assert!(mine.is_current);
        assert!(!mine.is_stale);
        assert!(!mine.is_orphaned);
        assert!(old.is_stale);
        assert!(old.is_orphaned);
        assert!(old.has_active);
        assert!(!old.has_checkpoints);
        assert_eq!(old.size_bytes, 2);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        assert!(scan_session_dirs(&root.path().join("nope"), "x", 1, &[], 0.0).is_empty());
    }
}
