//! Unified diff parsing.
//!
//! Splits a `git diff` style patch into per-file sections. Parsing is total:
//! lines before the first `diff --git` header are ignored and malformed
//! headers simply start no section.

use serde::{Deserialize, Serialize};

/// One file section of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Path before the change (`a/` side).
    pub old_path: String,
    /// Path after the change (`b/` side).
    pub new_path: String,
    /// Raw section text, header included.
    pub content: String,
    pub added_lines: usize,
    pub removed_lines: usize,
    pub is_binary: bool,
    pub is_deleted: bool,
    pub is_new: bool,
}

impl FileDiff {
    fn start(old_path: &str, new_path: &str) -> Self {
        Self {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            content: String::new(),
            added_lines: 0,
            removed_lines: 0,
            is_binary: false,
            is_deleted: false,
            is_new: false,
        }
    }

    /// The path a reviewer cares about: the new path unless the file was deleted.
    pub fn path(&self) -> &str {
        if self.is_deleted || self.new_path.is_empty() {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    /// Short status label used in file summaries.
    pub fn status(&self) -> &'static str {
        if self.is_deleted {
            "deleted"
        } else if self.is_binary {
            "binary"
        } else if self.is_new {
            "new"
        } else if self.old_path != self.new_path {
            "renamed"
        } else {
            "modified"
        }
    }
}

/// Parses `diff --git a/<old> b/<new>` into its two paths.
fn parse_header(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("diff --git a/")?;
    // Paths may contain spaces; the last " b/" separates the two sides.
    let split = rest.rfind(" b/")?;
    Some((&rest[..split], &rest[split + 3..]))
}

/// Parses a unified diff into file sections.
///
/// Only `+`/`-` body lines are counted; the `+++`/`---` file markers are not.
pub fn parse_diff(diff_text: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<(FileDiff, Vec<&str>)> = None;

    for line in diff_text.lines() {
        if line.starts_with("diff --git ") {
            if let Some((file, lines)) = current.take() {
                files.push(finish(file, lines));
            }
            current = parse_header(line).map(|(old, new)| (FileDiff::start(old, new), vec![line]));
            continue;
        }

        let Some((file, lines)) = current.as_mut() else {
            continue;
        };
        lines.push(line);

        if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
            file.is_binary = true;
        } else if line.starts_with("new file mode") {
            file.is_new = true;
        } else if line.starts_with("deleted file mode") {
            file.is_deleted = true;
        } else if line.starts_with("+++") || line.starts_with("---") {
            // File markers, not content.
        } else if line.starts_with('+') {
            file.added_lines += 1;
        } else if line.starts_with('-') {
            file.removed_lines += 1;
        }
    }

    if let Some((file, lines)) = current.take() {
        files.push(finish(file, lines));
    }
    files
}

fn finish(mut file: FileDiff, lines: Vec<&str>) -> FileDiff {
    file.content = lines.join("\n");
    file
}
