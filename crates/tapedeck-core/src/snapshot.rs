//! Snapshot store
//!
//! Snapshots are YAML files checked into the repository and reviewed like
//! code, so the output is stable: fields in declaration order, headers and
//! JSON object keys sorted, chunks in arrival order, nothing time-dependent.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::SnapshotError;
use crate::exchange::Exchange;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Where and for what a snapshot was recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
}

/// A snapshot file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub context: SnapshotContext,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
}

impl Snapshot {
    pub fn new(context: SnapshotContext, exchanges: Vec<Exchange>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            context,
            exchanges,
        }
    }

    pub fn empty() -> Self {
        Self::new(SnapshotContext::default(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

/// Identity of a snapshot: one file per (suite, test) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    pub suite: String,
    pub test: String,
}

impl SnapshotId {
    pub fn new(suite: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            test: test.into(),
        }
    }

    /// `<root>/<suite>/<sanitized test>.yaml`
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(sanitize(&self.suite))
            .join(format!("{}.yaml", sanitize(&self.test)))
    }

    pub fn context(&self) -> SnapshotContext {
        SnapshotContext {
            suite: Some(self.suite.clone()),
            test: Some(self.test.clone()),
        }
    }
}

/// Lowercase, with every non-alphanumeric character mapped to `_`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Load a snapshot
///
/// An absent file is [`SnapshotError::NotFound`]; a blank file is an empty
/// snapshot; anything that does not parse, carries an unknown format version
/// or has out-of-sequence exchanges is [`SnapshotError::Corrupt`].
pub fn load(path: &Path) -> Result<Snapshot, SnapshotError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::NotFound(path.to_path_buf()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            return Err(corrupt(path, format!("not valid UTF-8: {e}")))
        }
        Err(e) => return Err(SnapshotError::Io(e)),
    };

    if content.trim().is_empty() {
        return Ok(Snapshot::empty());
    }

    let snapshot: Snapshot =
        serde_yaml::from_str(&content).map_err(|e| corrupt(path, e.to_string()))?;

    if snapshot.version != SNAPSHOT_FORMAT_VERSION {
        return Err(corrupt(
            path,
            format!(
                "unsupported format version {} (expected {})",
                snapshot.version, SNAPSHOT_FORMAT_VERSION
            ),
        ));
    }

    for (position, exchange) in snapshot.exchanges.iter().enumerate() {
        if exchange.sequence_index != position {
            return Err(corrupt(
                path,
                format!(
                    "exchange at position {position} has sequence_index {}",
                    exchange.sequence_index
                ),
            ));
        }
    }

    tracing::debug!(
        "Loaded snapshot {} ({} exchanges)",
        path.display(),
        snapshot.exchanges.len()
    );
    Ok(snapshot)
}

/// Write a snapshot atomically (temp file in the same directory + rename)
///
/// Returns `false` without touching the disk when the snapshot has no
/// exchanges and no file exists yet.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<bool, SnapshotError> {
    if snapshot.is_empty() && !path.exists() {
        tracing::debug!("Skipping empty snapshot {}", path.display());
        return Ok(false);
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let yaml =
        serde_yaml::to_string(snapshot).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(yaml.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| SnapshotError::Io(e.error))?;

    tracing::info!(
        "Saved snapshot {} ({} exchanges)",
        path.display(),
        snapshot.exchanges.len()
    );
    Ok(true)
}

fn corrupt(path: &Path, reason: String) -> SnapshotError {
    SnapshotError::Corrupt {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeRequest, ExchangeResponse, Payload, ResponseBody};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_exchange(idx: usize) -> Exchange {
        Exchange {
            sequence_index: idx,
            request: ExchangeRequest {
                method: "POST".to_string(),
                path: "/chat/completions".to_string(),
                headers: BTreeMap::from([(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]),
                body: Some(Payload::Json(json!({"cwd": "${workdir}", "turn": idx}))),
            },
            response: ExchangeResponse {
                status: 200,
                headers: BTreeMap::from([(
                    "content-type".to_string(),
                    "text/event-stream".to_string(),
                )]),
                body: ResponseBody::Chunked(vec![
                    Payload::Text("data: {\"delta\":\"he\"}\n\n".to_string()),
                    Payload::Text("data: {\"delta\":\"llo\"}\n\n".to_string()),
                    Payload::Text("data: [DONE]\n\n".to_string()),
                ]),
            },
        }
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let result = load(&temp_dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(SnapshotError::NotFound(_))));
    }

    #[test]
    fn test_load_garbage_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        std::fs::write(&path, "version: 1\nexchanges: [unterminated\n").unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::Corrupt { .. })));
    }

    #[test]
    fn test_load_unknown_version_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("future.yaml");
        std::fs::write(&path, "version: 99\nexchanges: []\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 99"));
    }

    #[test]
    fn test_load_blank_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blank.yaml");
        std::fs::write(&path, "\n  \n").unwrap();
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_rejects_reordered_exchanges() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reordered.yaml");
        let snapshot = Snapshot::new(
            SnapshotContext::default(),
            vec![create_test_exchange(1), create_test_exchange(0)],
        );
        std::fs::write(&path, serde_yaml::to_string(&snapshot).unwrap()).unwrap();
        assert!(matches!(load(&path), Err(SnapshotError::Corrupt { .. })));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session").join("stateful_conversation.yaml");
        let snapshot = Snapshot::new(
            SnapshotId::new("session", "stateful conversation").context(),
            vec![create_test_exchange(0), create_test_exchange(1)],
        );

        assert!(save(&path, &snapshot).unwrap());
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, snapshot);

        // no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_save_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stable.yaml");
        let snapshot = Snapshot::new(SnapshotContext::default(), vec![create_test_exchange(0)]);

        save(&path, &snapshot).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        save(&path, &load(&path).unwrap()).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_save_empty_without_existing_file_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("empty.yaml");
        assert!(!save(&path, &Snapshot::empty()).unwrap());
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_snapshot_id_path() {
        let id = SnapshotId::new("ask_user", "Should handle freeform user-input response");
        assert_eq!(
            id.path_in(Path::new("/repo/test/snapshots")),
            PathBuf::from(
                "/repo/test/snapshots/ask_user/should_handle_freeform_user_input_response.yaml"
            )
        );
    }
}
