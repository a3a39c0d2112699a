//! Storage-path resolution: maps `{storage_id, path}` references to
//! absolute filesystem paths for the agent, via the `STORAGE_MAP` config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use transcast_db::models::StorageRef;

/// `storage_id -> absolute path prefix`, parsed from the `STORAGE_MAP`
/// environment variable (a JSON object). Defaults to `{"shared": "/storage"}`.
#[derive(Debug, Clone)]
pub struct StorageMap {
    prefixes: HashMap<String, PathBuf>,
}

/// Error returned when a task references a `storage_id` with no configured
/// prefix. Terminal: the task fails before any processing begins.
#[derive(Debug, thiserror::Error)]
#[error("unknown storage_id: {0:?}")]
pub struct UnknownStorageError(pub String);

impl StorageMap {
    pub fn new(prefixes: HashMap<String, PathBuf>) -> Self {
        Self { prefixes }
    }

    pub fn default_map() -> Self {
        let mut prefixes = HashMap::new();
        prefixes.insert("shared".to_string(), PathBuf::from("/storage"));
        Self::new(prefixes)
    }

    /// Parse from the `STORAGE_MAP` JSON object string.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, String> = serde_json::from_str(json)?;
        Ok(Self::new(
            raw.into_iter().map(|(k, v)| (k, PathBuf::from(v))).collect(),
        ))
    }

    /// Rewrite a `{storage_id, path}` reference to an absolute path:
    /// `prefix + path`.
    pub fn resolve(&self, reference: &StorageRef) -> Result<PathBuf, UnknownStorageError> {
        let prefix = self
            .prefixes
            .get(&reference.storage_id)
            .ok_or_else(|| UnknownStorageError(reference.storage_id.clone()))?;
        Ok(join_prefix(prefix, &reference.path))
    }
}

/// Join a configured prefix with a task-supplied relative path. The path is
/// always treated as relative to the prefix, even if it begins with `/`,
/// so a task can never escape its configured storage root.
fn join_prefix(prefix: &Path, path: &str) -> PathBuf {
    prefix.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sref(storage_id: &str, path: &str) -> StorageRef {
        StorageRef {
            storage_id: storage_id.to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn resolves_known_storage_id() {
        let map = StorageMap::default_map();
        let resolved = map.resolve(&sref("shared", "inputs/a.mp4")).unwrap();
        assert_eq!(resolved, PathBuf::from("/storage/inputs/a.mp4"));
    }

    #[test]
    fn unknown_storage_id_errors() {
        let map = StorageMap::default_map();
        let err = map.resolve(&sref("nope", "a.mp4")).unwrap_err();
        assert_eq!(err.0, "nope");
    }

    #[test]
    fn leading_slash_in_path_does_not_escape_prefix() {
        let map = StorageMap::default_map();
        let resolved = map.resolve(&sref("shared", "/etc/passwd")).unwrap();
        assert_eq!(resolved, PathBuf::from("/storage/etc/passwd"));
    }

    #[test]
    fn parse_from_json() {
        let map = StorageMap::parse(r#"{"shared": "/mnt/media", "scratch": "/tmp/work"}"#).unwrap();
        assert_eq!(
            map.resolve(&sref("scratch", "out.mp4")).unwrap(),
            PathBuf::from("/tmp/work/out.mp4")
        );
    }
}
