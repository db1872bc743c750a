//! Diff preparation for the Scout stage.
//!
//! Turns a raw pull-request patch into a [`FilteredDiff`]: parsed per file,
//! stripped of noise (lock files, generated assets, binaries), size-limited,
//! and tagged with its dominant language.

mod filter;
mod parser;

pub use filter::{chunk_text, detect_language, process_diff, DiffLimits, FilteredDiff, NoiseFilter};
pub use parser::{parse_diff, FileDiff};
