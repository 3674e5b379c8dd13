//! Utility functions for maxpatch-bridge

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::Result;

/// Keys whose values never reach a log line
const SENSITIVE_KEYS: &[&str] = &["auth_token", "token", "authorization"];

/// Expand a leading `~` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(trimmed));
    }
    if let Some(rest) = trimmed.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(trimmed)
}

/// Make a path absolute and canonical where possible.
///
/// Existing paths are canonicalized to resolve symlinks and `..` segments. For a path
/// that does not exist yet, the parent is canonicalized and the file name re-attached.
pub fn absolutize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if let Ok(canonical) = absolute.canonicalize() {
        return canonical;
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(absolute.clone()),
        _ => absolute,
    }
}

/// True when `path` is `root` or lies beneath it. Both sides are absolutized first.
pub fn path_within_root(path: &Path, root: &Path) -> bool {
    absolutize(path).starts_with(absolutize(root))
}

/// Current wall-clock time as fractional seconds since the epoch
pub fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Current wall-clock time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
///
/// Writes `<path>.tmp`, fsyncs it, then renames over the destination so a crash
/// leaves either the old or the new document, never a torn one.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let bytes = serde_json::to_vec_pretty(value)?;
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Read and parse a JSON document.
pub fn read_json(path: &Path) -> Result<JsonValue> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Copy of `value` with secrets masked, for logging.
pub fn redact_sensitive(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_KEYS.contains(&lowered.as_str()) {
                    out.insert(key.clone(), JsonValue::String("***".to_string()));
                } else {
                    out.insert(key.clone(), redact_sensitive(inner));
                }
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(redact_sensitive).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_write_json_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        write_json_atomic(&path, &json!({"v": 2})).unwrap();

        assert_eq!(read_json(&path).unwrap()["v"], 2);
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn test_path_within_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        let inside = dir.path().join("a").join("b.maxpat");
        let outside = dir.path().join("..").join("elsewhere.maxpat");

        assert!(path_within_root(&inside, dir.path()));
        assert!(!path_within_root(&outside, dir.path()));
    }

    #[test]
    fn test_redact_sensitive_nested() {
        let redacted = redact_sensitive(&json!({
            "action": "add_object",
            "auth_token": "abc",
            "data": {"auth": {"token": "xyz"}, "Authorization": "Bearer q"}
        }));
        assert_eq!(redacted["action"], "add_object");
        assert_eq!(redacted["auth_token"], "***");
        assert_eq!(redacted["data"]["auth"]["token"], "***");
        assert_eq!(redacted["data"]["Authorization"], "***");
    }

    #[test]
    fn test_expand_home_passthrough() {
        assert_eq!(expand_home("/tmp/x.maxpat"), PathBuf::from("/tmp/x.maxpat"));
    }
}
