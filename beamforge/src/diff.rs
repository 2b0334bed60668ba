//! Unified diffs between file-state snapshots, diff-stats, and patch application.
//!
//! Hunks are produced by `similar` with three lines of context. Application is
//! strict: every context and removed line must match the baseline exactly,
//! otherwise the patch is rejected. A patch whose effect is already present in
//! the baseline is a no-op, so re-applying a diff never changes the result.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

use crate::tree::FileMap;

const CONTEXT_RADIUS: usize = 3;
const DEV_NULL: &str = "/dev/null";
const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file";

/// Per-file inserted/deleted line counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: String,
    pub insertions: usize,
    pub deletions: usize,
}

/// Unified diff of every file that differs between `before` and `after`, in path order.
pub fn unified_diff(before: &FileMap, after: &FileMap) -> String {
    let mut out = String::new();
    for path in changed_paths(before, after) {
        let old = before.get(path);
        let new = after.get(path);
        let old_label = old.map_or_else(|| DEV_NULL.to_string(), |_| format!("a/{path}"));
        let new_label = new.map_or_else(|| DEV_NULL.to_string(), |_| format!("b/{path}"));
        let old_text = old.map_or("", String::as_str);
        let new_text = new.map_or("", String::as_str);

        if old_text.is_empty() && new_text.is_empty() {
            // Empty file created or removed: headers alone carry the change.
            out.push_str(&format!("--- {old_label}\n+++ {new_label}\n"));
            continue;
        }
        let diff = TextDiff::from_lines(old_text, new_text);
        out.push_str(
            &diff
                .unified_diff()
                .context_radius(CONTEXT_RADIUS)
                .missing_newline_hint(true)
                .header(&old_label, &new_label)
                .to_string(),
        );
    }
    out
}

/// Line-level insert/delete counts for every changed file.
pub fn diff_stat(before: &FileMap, after: &FileMap) -> Vec<FileStat> {
    changed_paths(before, after)
        .into_iter()
        .map(|path| {
            let old_text = before.get(path).map_or("", String::as_str);
            let new_text = after.get(path).map_or("", String::as_str);
            let diff = TextDiff::from_lines(old_text, new_text);
            let mut stat = FileStat {
                path: path.clone(),
                insertions: 0,
                deletions: 0,
            };
            for change in diff.iter_all_changes() {
                match change.tag() {
                    ChangeTag::Insert => stat.insertions += 1,
                    ChangeTag::Delete => stat.deletions += 1,
                    ChangeTag::Equal => {}
                }
            }
            stat
        })
        .collect()
}

fn changed_paths<'a>(before: &'a FileMap, after: &'a FileMap) -> Vec<&'a String> {
    let mut paths: Vec<&String> = before
        .iter()
        .filter(|(path, content)| after.get(*path) != Some(*content))
        .map(|(path, _)| path)
        .collect();
    paths.extend(after.keys().filter(|path| !before.contains_key(*path)));
    paths.sort();
    paths
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Context,
    Remove,
    Add,
}

#[derive(Debug, Clone)]
struct HunkLine {
    kind: LineKind,
    /// Line text including its terminator, if the file has one there.
    text: String,
}

#[derive(Debug, Clone)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    new_start: usize,
    new_len: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    /// Zero-based index of the first old-side line this hunk touches.
    fn old_index(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    fn reversed(&self) -> Self {
        Self {
            old_start: self.new_start,
            old_len: self.new_len,
            new_start: self.old_start,
            new_len: self.old_len,
            lines: self
                .lines
                .iter()
                .map(|line| HunkLine {
                    kind: match line.kind {
                        LineKind::Context => LineKind::Context,
                        LineKind::Remove => LineKind::Add,
                        LineKind::Add => LineKind::Remove,
                    },
                    text: line.text.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct FilePatch {
    old_path: Option<String>,
    new_path: Option<String>,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

/// Apply a unified diff (as produced by [`unified_diff`]) to `baseline`.
pub fn apply_diff(baseline: &FileMap, patch: &str) -> Result<FileMap> {
    let mut files = baseline.clone();
    for file_patch in parse_patch(patch)? {
        let path = file_patch.path().to_string();
        match (&file_patch.old_path, &file_patch.new_path) {
            (None, Some(_)) => {
                let created = apply_hunks("", &file_patch.hunks)
                    .with_context(|| format!("create {path}"))?;
                match files.get(&path) {
                    Some(existing) if *existing == created => {}
                    Some(_) => bail!("cannot create {path}: file already exists"),
                    None => {
                        files.insert(path, created);
                    }
                }
            }
            (Some(_), None) => {
                let Some(existing) = files.get(&path) else {
                    continue;
                };
                let remaining = apply_hunks(existing, &file_patch.hunks)
                    .with_context(|| format!("delete {path}"))?;
                if !remaining.is_empty() {
                    bail!("cannot delete {path}: content does not match patch");
                }
                files.remove(&path);
            }
            (Some(_), Some(_)) => {
                let existing = files
                    .get(&path)
                    .ok_or_else(|| anyhow!("cannot patch {path}: file not found"))?;
                // Checked first: a pure insertion also applies forward to its own result.
                let reversed: Vec<Hunk> = file_patch.hunks.iter().map(Hunk::reversed).collect();
                if apply_hunks(existing, &reversed).is_ok() {
                    continue;
                }
                let patched = apply_hunks(existing, &file_patch.hunks)
                    .with_context(|| format!("patch {path}"))?;
                files.insert(path, patched);
            }
            (None, None) => bail!("patch entry has neither an old nor a new path"),
        }
    }
    Ok(files)
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String> {
    let old: Vec<&str> = content.split_inclusive('\n').collect();
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;

    for hunk in hunks {
        let start = hunk.old_index();
        if start < cursor || start > old.len() {
            bail!("hunk at line {} is out of range", hunk.old_start);
        }
        for line in &old[cursor..start] {
            out.push_str(line);
        }
        let mut pos = start;
        for line in &hunk.lines {
            match line.kind {
                LineKind::Context | LineKind::Remove => {
                    let actual = old.get(pos).copied().unwrap_or_default();
                    if actual != line.text {
                        bail!(
                            "hunk at line {} does not match: expected {:?}, found {:?}",
                            hunk.old_start,
                            line.text,
                            actual
                        );
                    }
                    if line.kind == LineKind::Context {
                        out.push_str(actual);
                    }
                    pos += 1;
                }
                LineKind::Add => out.push_str(&line.text),
            }
        }
        cursor = pos;
    }
    for line in old.iter().skip(cursor) {
        out.push_str(line);
    }
    Ok(out)
}

fn parse_patch(patch: &str) -> Result<Vec<FilePatch>> {
    let lines: Vec<&str> = patch.split_inclusive('\n').collect();
    let mut patches = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        if !line.starts_with("--- ") {
            i += 1;
            continue;
        }
        let old_path = parse_label(strip_newline(&line[4..]), "a/");
        let next = lines
            .get(i + 1)
            .filter(|l| l.starts_with("+++ "))
            .ok_or_else(|| anyhow!("line {}: '---' header without '+++'", i + 1))?;
        let new_path = parse_label(strip_newline(&next[4..]), "b/");
        i += 2;

        let mut hunks = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@") {
            let (hunk, consumed) = parse_hunk(&lines[i..])
                .with_context(|| format!("parse hunk at patch line {}", i + 1))?;
            hunks.push(hunk);
            i += consumed;
        }
        patches.push(FilePatch {
            old_path,
            new_path,
            hunks,
        });
    }
    Ok(patches)
}

fn parse_label(label: &str, prefix: &str) -> Option<String> {
    let label = label.split('\t').next().unwrap_or(label);
    if label == DEV_NULL {
        return None;
    }
    Some(label.strip_prefix(prefix).unwrap_or(label).to_string())
}

fn strip_newline(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

/// Parse one hunk starting at its `@@` header. Returns the hunk and lines consumed.
fn parse_hunk(lines: &[&str]) -> Result<(Hunk, usize)> {
    let header = strip_newline(lines[0]);
    let ranges = header
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(|| anyhow!("malformed hunk header {header:?}"))?;
    let (old_range, new_range) = ranges
        .split_once(" +")
        .ok_or_else(|| anyhow!("malformed hunk header {header:?}"))?;
    let (old_start, old_len) = parse_range(old_range)?;
    let (new_start, new_len) = parse_range(new_range)?;

    let mut hunk = Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    };
    let mut old_seen = 0usize;
    let mut new_seen = 0usize;
    let mut i = 1usize;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with('\\') {
            if strip_newline(line) != NO_NEWLINE_MARKER {
                bail!("unexpected marker line {line:?}");
            }
            let last = hunk
                .lines
                .last_mut()
                .ok_or_else(|| anyhow!("newline marker before any hunk line"))?;
            if last.text.ends_with('\n') {
                last.text.pop();
            }
            i += 1;
            continue;
        }
        if old_seen == old_len && new_seen == new_len {
            break;
        }
        let (kind, text) = match line.as_bytes().first() {
            Some(b' ') => (LineKind::Context, &line[1..]),
            Some(b'-') => (LineKind::Remove, &line[1..]),
            Some(b'+') => (LineKind::Add, &line[1..]),
            // Some writers drop the lone space on empty context lines.
            Some(b'\n') => (LineKind::Context, line),
            _ => bail!("unexpected hunk line {line:?}"),
        };
        match kind {
            LineKind::Context => {
                old_seen += 1;
                new_seen += 1;
            }
            LineKind::Remove => old_seen += 1,
            LineKind::Add => new_seen += 1,
        }
        if old_seen > old_len || new_seen > new_len {
            bail!("hunk body longer than its header {header:?}");
        }
        hunk.lines.push(HunkLine {
            kind,
            text: text.to_string(),
        });
        i += 1;
    }
    if old_seen != old_len || new_seen != new_len {
        bail!("hunk body shorter than its header {header:?}");
    }
    Ok((hunk, i))
}

fn parse_range(range: &str) -> Result<(usize, usize)> {
    let (start, len) = match range.split_once(',') {
        Some((start, len)) => (start, len),
        None => (range, "1"),
    };
    let start = start
        .parse()
        .with_context(|| format!("invalid range start {start:?}"))?;
    let len = len
        .parse()
        .with_context(|| format!("invalid range length {len:?}"))?;
    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> FileMap {
        entries
            .iter()
            .map(|(path, content)| ((*path).to_string(), (*content).to_string()))
            .collect()
    }

    /// Verifies a diff from the empty snapshot rebuilds the full file set.
    ///
    /// Covers files without a trailing newline, empty files, and CRLF content.
    #[test]
    fn diff_from_empty_reproduces_snapshot() {
        let snapshot = files(&[
            ("src/main.ts", "import x from 'y';\n\nconsole.log(x);\n"),
            ("src/no_newline.ts", "export const a = 1;\nexport const b = 2;"),
            ("empty.txt", ""),
            ("win.txt", "one\r\ntwo\r\n"),
        ]);
        let patch = unified_diff(&FileMap::new(), &snapshot);
        assert!(patch.contains("--- /dev/null\n+++ b/src/main.ts\n"));
        assert!(patch.contains(NO_NEWLINE_MARKER));

        let rebuilt = apply_diff(&FileMap::new(), &patch).expect("apply");
        assert_eq!(rebuilt, snapshot);
    }

    #[test]
    fn modification_and_deletion_apply_against_baseline() {
        let before = files(&[
            ("a.ts", "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n"),
            ("gone.ts", "bye\n"),
        ]);
        let after = files(&[
            ("a.ts", "1\n2\nthree\n4\n5\n6\n7\n8\n9\n10\neleven\n"),
            ("new.ts", "hi"),
        ]);
        let patch = unified_diff(&before, &after);
        assert!(patch.contains("+++ /dev/null"));
        assert_eq!(apply_diff(&before, &patch).expect("apply"), after);
    }

    #[test]
    fn reapplying_a_diff_is_a_no_op() {
        let before = files(&[("a.ts", "one\ntwo\n"), ("old.ts", "x\n")]);
        let after = files(&[("a.ts", "one\n2\n"), ("b.ts", "new\n")]);
        let patch = unified_diff(&before, &after);

        let once = apply_diff(&before, &patch).expect("once");
        let again = apply_diff(&before, &patch).expect("again");
        let twice = apply_diff(&once, &patch).expect("twice");
        assert_eq!(once, after);
        assert_eq!(again, once);
        assert_eq!(twice, once);
    }

    /// A pure insertion still applies forward to its own output, so the
    /// already-applied check has to win.
    #[test]
    fn reapplying_an_insertion_does_not_duplicate_lines() {
        let before = files(&[("a.ts", "x\n")]);
        let patch = "--- a/a.ts\n+++ b/a.ts\n@@ -1 +1,2 @@\n x\n+y\n";

        let once = apply_diff(&before, patch).expect("once");
        let twice = apply_diff(&once, patch).expect("twice");
        assert_eq!(once["a.ts"], "x\ny\n");
        assert_eq!(twice, once);

        let generated = unified_diff(&before, &files(&[("a.ts", "x\ny\n")]));
        assert_eq!(apply_diff(&once, &generated).expect("generated"), once);
    }

    #[test]
    fn mismatched_context_is_rejected() {
        let before = files(&[("a.ts", "one\ntwo\n")]);
        let after = files(&[("a.ts", "one\nTWO\n")]);
        let patch = unified_diff(&before, &after);
        let drifted = files(&[("a.ts", "uno\ndos\n")]);
        let err = apply_diff(&drifted, &patch).expect_err("conflict");
        assert!(format!("{err:#}").contains("patch a.ts"), "{err:#}");
    }

    #[test]
    fn diff_stat_counts_lines() {
        let before = files(&[("a.ts", "1\n2\n3\n")]);
        let after = files(&[("a.ts", "1\nb\n3\n4\n"), ("c.ts", "x\ny\n")]);
        assert_eq!(
            diff_stat(&before, &after),
            vec![
                FileStat {
                    path: "a.ts".to_string(),
                    insertions: 2,
                    deletions: 1,
                },
                FileStat {
                    path: "c.ts".to_string(),
                    insertions: 2,
                    deletions: 0,
                },
            ]
        );
    }

    #[test]
    fn identical_snapshots_produce_empty_diff() {
        let snapshot = files(&[("a.ts", "same\n")]);
        assert!(unified_diff(&snapshot, &snapshot).is_empty());
        assert!(diff_stat(&snapshot, &snapshot).is_empty());
    }
}
