//! On-disk project trees: reading a directory into a [`FileMap`] and writing one back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

use crate::tree::FileMap;

/// `path` relative to `root`, `/`-separated. `None` for non-UTF-8 names.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// Read every UTF-8 file under `root`, skipping directories named in `ignore`.
pub fn read_tree(root: &Path, ignore: &[String]) -> Result<FileMap> {
    let mut files = FileMap::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || entry
                .file_name()
                .to_str()
                .is_none_or(|name| !ignore.iter().any(|ignored| ignored == name))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(path) = relative_path(root, entry.path()) else {
            continue;
        };
        let bytes =
            fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
        match String::from_utf8(bytes) {
            Ok(content) => {
                files.insert(path, content);
            }
            Err(_) => debug!(%path, "skipping binary file"),
        }
    }
    Ok(files)
}

/// Bring `root` from `before` to `after`: write new or changed files, remove dropped ones.
pub fn write_tree(root: &Path, before: &FileMap, after: &FileMap) -> Result<usize> {
    let mut touched = 0;
    for (path, content) in after {
        if before.get(path) == Some(content) && root.join(path).exists() {
            continue;
        }
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, content).with_context(|| format!("write {}", target.display()))?;
        touched += 1;
    }
    for path in before.keys().filter(|path| !after.contains_key(*path)) {
        let target = root.join(path);
        if target.exists() {
            fs::remove_file(&target).with_context(|| format!("remove {}", target.display()))?;
            touched += 1;
        }
    }
    Ok(touched)
}
