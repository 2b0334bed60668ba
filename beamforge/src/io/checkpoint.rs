//! Checkpoint storage (`.beamforge/state/checkpoint.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Load a checkpoint from disk.
pub fn load_checkpoint<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(path = %path.display(), "loading checkpoint");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse checkpoint {}", path.display()))
}

/// Atomically write a checkpoint to disk (temp file + rename).
pub fn write_checkpoint<T: Serialize>(path: &Path, state: &T) -> Result<()> {
    debug!(path = %path.display(), "writing checkpoint");
    let mut buf = serde_json::to_string_pretty(state).context("serialize checkpoint")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Verifies no temp file is left behind and nested directories are created.
    #[test]
    fn write_creates_parent_and_cleans_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/nested/checkpoint.json");
        let state = BTreeMap::from([("stage".to_string(), "review".to_string())]);

        write_checkpoint(&path, &state).expect("write");
        assert!(!path.with_extension("json.tmp").exists());
        let loaded: BTreeMap<String, String> = load_checkpoint(&path).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_checkpoint_names_the_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        let err = load_checkpoint::<BTreeMap<String, String>>(&path).expect_err("missing");
        assert!(err.to_string().contains("checkpoint.json"));
    }
}
