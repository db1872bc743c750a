//! Noise filtering, size limits and the [`FilteredDiff`] handed to analysis stages.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parser::{parse_diff, FileDiff};

/// Paths that never deserve review: lock files, minified or built assets,
/// caches, logs, images and fonts.
const NOISE_PATTERNS: &[&str] = &[
    r"\.lock$",
    r"package-lock\.json$",
    r"yarn\.lock$",
    r"pnpm-lock\.yaml$",
    r"\.min\.(js|css)$",
    r"(^|/)node_modules/",
    r"(^|/)\.git/",
    r"\.DS_Store$",
    r"\.log$",
    r"(^|/)dist/",
    r"(^|/)build/",
    r"(^|/)target/",
    r"\.pyc$",
    r"(^|/)__pycache__/",
    r"\.(png|jpe?g|gif|svg|ico|webp|bmp)$",
    r"\.(woff2?|ttf|eot|otf)$",
];

/// Extension to language name, used to pick the dominant language of a change.
const LANGUAGES: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("java", "java"),
    ("go", "go"),
    ("rs", "rust"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("hpp", "cpp"),
    ("c", "c"),
    ("h", "c"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("kt", "kotlin"),
];

/// Size limits applied while building a [`FilteredDiff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLimits {
    /// Maximum size of the whole filtered diff text, in bytes.
    pub max_diff_chars: usize,
    /// Maximum size of a single file section before it is cut down to its
    /// first chunk.
    pub max_file_chars: usize,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_diff_chars: 100_000,
            max_file_chars: 50_000,
        }
    }
}

/// The diff after noise removal and truncation.
///
/// An empty `FilteredDiff` means the change has nothing worth analyzing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredDiff {
    pub text: String,
    pub files: Vec<FileDiff>,
    pub dropped_files: Vec<String>,
    pub truncated: bool,
    pub language: String,
}

impl FilteredDiff {
    /// True when no reviewable file survived filtering.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() || self.text.trim().is_empty()
    }

    /// One `status: path (+added/-removed)` line per kept file.
    pub fn summary(&self) -> String {
        self.files
            .iter()
            .map(|f| {
                format!(
                    "{}: {} (+{}/-{})",
                    f.status(),
                    f.path(),
                    f.added_lines,
                    f.removed_lines
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn total_added(&self) -> usize {
        self.files.iter().map(|f| f.added_lines).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.files.iter().map(|f| f.removed_lines).sum()
    }
}

/// Case-insensitive path filter for files that should not be reviewed.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseFilter {
    /// Creates a filter with the built-in noise patterns.
    pub fn new() -> Self {
        Self::with_patterns(std::iter::empty::<&str>())
    }

    /// Creates a filter with the built-in patterns plus `extra`.
    /// Patterns that fail to compile are skipped.
    pub fn with_patterns<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        for pattern in NOISE_PATTERNS.iter().copied() {
            if let Ok(regex) = RegexBuilder::new(pattern).case_insensitive(true).build() {
                patterns.push(regex);
            }
        }
        for pattern in extra {
            match RegexBuilder::new(pattern.as_ref())
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => patterns.push(regex),
                Err(e) => debug!(
                    pattern = pattern.as_ref(),
                    error = %e,
                    "Skipping invalid noise pattern"
                ),
            }
        }
        Self { patterns }
    }

    pub fn is_noise(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(path))
    }

    /// Parses, filters and truncates a raw diff.
    ///
    /// Binary sections are dropped along with noise paths. Each kept file
    /// larger than `max_file_chars` is reduced to its first chunk, and the
    /// joined text is cut at `max_diff_chars` with a visible marker.
    pub fn process(&self, raw: &str, limits: &DiffLimits) -> FilteredDiff {
        let mut files = Vec::new();
        let mut dropped_files = Vec::new();

        for mut file in parse_diff(raw) {
            if file.is_binary || self.is_noise(file.path()) {
                dropped_files.push(file.path().to_string());
                continue;
            }
            if file.content.len() > limits.max_file_chars {
                let chunks = chunk_text(&file.content, limits.max_file_chars);
                let omitted = chunks.len().saturating_sub(1);
                let mut first = chunks.into_iter().next().unwrap_or_default();
                first.push_str(&format!(
                    "\n[FILE TRUNCATED: {} more chunk(s) omitted]",
                    omitted
                ));
                file.content = first;
            }
            files.push(file);
        }

        let joined = files
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let (text, truncated) = if joined.len() > limits.max_diff_chars {
            let cut = floor_char_boundary(&joined, limits.max_diff_chars);
            let text = format!(
                "{}\n\n[DIFF TRUNCATED: original size {} chars, max {} chars]",
                &joined[..cut],
                joined.len(),
                limits.max_diff_chars
            );
            (text, true)
        } else {
            (joined, false)
        };

        let language = detect_language(&files);

        debug!(
            kept = files.len(),
            dropped = dropped_files.len(),
            truncated = truncated,
            language = %language,
            "Filtered diff"
        );

        FilteredDiff {
            text,
            files,
            dropped_files,
            truncated,
            language,
        }
    }
}

/// Filters `raw` with the built-in noise patterns.
pub fn process_diff(raw: &str, limits: &DiffLimits) -> FilteredDiff {
    NoiseFilter::new().process(raw, limits)
}

/// Splits text into line-aligned chunks of at most `max_size` bytes.
///
/// A single line longer than `max_size` becomes its own chunk.
pub fn chunk_text(text: &str, max_size: usize) -> Vec<String> {
    if text.len() <= max_size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split('\n') {
        let needed = if current.is_empty() {
            line.len()
        } else {
            line.len() + 1
        };
        if !current.is_empty() && current.len() + needed > max_size {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Most common language among the files, by extension.
pub fn detect_language(files: &[FileDiff]) -> String {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for file in files {
        let Some((_, ext)) = file.path().rsplit_once('.') else {
            continue;
        };
        let ext = ext.to_ascii_lowercase();
        if let Some((_, language)) = LANGUAGES.iter().find(|(e, _)| *e == ext) {
            *counts.entry(language).or_default() += 1;
        }
    }

    counts
        .into_iter()
        // Ties resolve alphabetically so the result is stable.
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(language, _)| language.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(path: &str, body: &str) -> String {
        format!(
            "diff --git a/{p} b/{p}\nindex 1..2 100644\n--- a/{p}\n+++ b/{p}\n@@ -1 +1 @@\n{b}\n",
            p = path,
            b = body
        )
    }

    #[test]
    fn test_noise_patterns() {
        let filter = NoiseFilter::new();
        for path in [
            "Cargo.lock",
            "web/package-lock.json",
            "yarn.lock",
            "pnpm-lock.yaml",
            "static/app.min.js",
            "static/APP.MIN.CSS",
            "node_modules/left-pad/index.js",
            "dist/bundle.js",
            "server.log",
            "pkg/__pycache__/mod.cpython-311.pyc",
            "assets/logo.PNG",
            "fonts/inter.woff2",
        ] {
            assert!(filter.is_noise(path), "{} should be noise", path);
        }
        for path in ["src/lib.rs", "src/build.rs", "docs/distribution.md", "app/main.py"] {
            assert!(!filter.is_noise(path), "{} should be kept", path);
        }
    }

    #[test]
    fn test_lock_only_diff_is_empty() {
        let raw = section("Cargo.lock", "+checksum = \"abc\"") + &section("yarn.lock", "-foo@1");
        let filtered = process_diff(&raw, &DiffLimits::default());

        assert!(filtered.is_empty());
        assert_eq!(filtered.dropped_files, vec!["Cargo.lock", "yarn.lock"]);
        assert_eq!(filtered.language, "unknown");
    }

    #[test]
    fn test_keeps_source_and_summarizes() {
        let raw = section("src/main.rs", "-old\n+new\n+more") + &section("package-lock.json", "+x");
        let filtered = process_diff(&raw, &DiffLimits::default());

        assert!(!filtered.is_empty());
        assert!(!filtered.truncated);
        assert_eq!(filtered.files.len(), 1);
        assert_eq!(filtered.language, "rust");
        assert_eq!(filtered.summary(), "modified: src/main.rs (+2/-1)");
        assert!(filtered.text.contains("+new"));
        assert!(!filtered.text.contains("package-lock"));
    }

    #[test]
    fn test_extra_patterns() {
        let filter = NoiseFilter::with_patterns(["^vendor/", "(invalid"]);
        assert!(filter.is_noise("vendor/lib.go"));
        assert!(filter.is_noise("Gemfile.lock"));
        assert!(!filter.is_noise("src/vendor.go"));
    }

    #[test]
    fn test_diff_truncation() {
        let body: String = (0..200).map(|i| format!("+line {}\n", i)).collect();
        let raw = section("src/big.py", body.trim_end());
        let limits = DiffLimits {
            max_diff_chars: 500,
            max_file_chars: 1_000_000,
        };
        let filtered = process_diff(&raw, &limits);

        assert!(filtered.truncated);
        assert!(filtered.text.contains("[DIFF TRUNCATED"));
        assert!(filtered.text.len() < 600);
        assert_eq!(filtered.language, "python");
    }

    #[test]
    fn test_large_file_keeps_first_chunk() {
        let body: String = (0..100).map(|i| format!("+row {}\n", i)).collect();
        let raw = section("src/data.ts", body.trim_end());
        let limits = DiffLimits {
            max_diff_chars: 1_000_000,
            max_file_chars: 200,
        };
        let filtered = process_diff(&raw, &limits);

        assert!(!filtered.truncated);
        assert!(filtered.text.contains("[FILE TRUNCATED"));
        // Line counts still describe the whole file.
        assert_eq!(filtered.files[0].added_lines, 100);
    }

    #[test]
    fn test_chunk_text() {
        assert_eq!(chunk_text("short", 100), vec!["short"]);

        let chunks = chunk_text("aaaa\nbbbb\ncccc", 9);
        assert_eq!(chunks, vec!["aaaa\nbbbb", "cccc"]);

        let chunks = chunk_text("0123456789\nab", 4);
        assert_eq!(chunks, vec!["0123456789", "ab"]);
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "héllo";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 100), s.len());
    }

    #[test]
    fn test_detect_language_majority() {
        let raw = section("a.py", "+1") + &section("b.py", "+2") + &section("c.go", "+3");
        let filtered = process_diff(&raw, &DiffLimits::default());
        assert_eq!(filtered.language, "python");
    }
}
