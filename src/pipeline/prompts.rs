//! Prompt templates and rendering.
//!
//! Templates use `{placeholder}` slots filled from a [`PromptInput`].
//! Rendering is single-pass, so text substituted into a slot is never
//! rescanned for further placeholders.

use super::stage::StageName;

pub const SCOUT_SYSTEM: &str =
    "You are a code review assistant that reduces Git diffs to the changes worth reviewing.";

pub const SCOUT_TEMPLATE: &str = "\
Repository: {repository} (PR #{pr_number}: {title})
Primary language: {language}

Changed files:
{files}

Return the diff below reduced to functional changes: logic, new features, bug fixes and \
significant refactoring. Drop whitespace-only and comment-only hunks. Answer with a unified diff.

{diff}";

pub const GUARDIAN_SYSTEM: &str =
    "You are a security reviewer. Report vulnerabilities, unsafe input handling and leaked secrets.";

pub const GUARDIAN_TEMPLATE: &str = "\
Review this {language} change in {repository} for security issues.
List each finding with file, severity and a concrete fix. Say so plainly if there are none.

{diff}";

pub const ARCHITECT_SYSTEM: &str =
    "You are a software architect reviewing design, coupling, error handling and performance.";

pub const ARCHITECT_TEMPLATE: &str = "\
Review the design of this {language} change in {repository}.
Changed files:
{files}

Point out structural problems, missing error handling and performance risks.

{diff}";

pub const STYLIST_SYSTEM: &str =
    "You are a reviewer focused on readability, naming and idiomatic {language}.";

pub const STYLIST_TEMPLATE: &str = "\
Review this change in {repository} for readability, naming and idiomatic usage.
Keep the list short and actionable.

{diff}";

pub const SYNTHESIZER_SYSTEM: &str =
    "You are a senior developer who writes clear, constructive and actionable review comments.";

pub const SYNTHESIZER_TEMPLATE: &str = "\
Combine the reviews below into one GitHub markdown comment for PR #{pr_number} \
({title}) in {repository}. Start with a short summary, group findings by category, put \
critical issues first. Where a review is marked unavailable, say that the analysis could not \
be completed instead of inventing findings.

Changed files:
{files}

{analyses}";

/// Values available to prompt templates.
#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    pub repository: String,
    pub pr_number: u64,
    pub title: String,
    pub language: String,
    /// One line per changed file.
    pub files: String,
    pub diff: String,
    /// Rendered analysis sections, for the Synthesizer.
    pub analyses: String,
}

impl PromptInput {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "repository" => Some(self.repository.clone()),
            "pr_number" => Some(self.pr_number.to_string()),
            "title" => Some(if self.title.is_empty() {
                "untitled".to_string()
            } else {
                self.title.clone()
            }),
            "language" => Some(self.language.clone()),
            "files" => Some(self.files.clone()),
            "diff" => Some(self.diff.clone()),
            "analyses" => Some(self.analyses.clone()),
            _ => None,
        }
    }
}

/// Fills `{placeholder}` slots. Unknown placeholders are left as written.
pub fn render(template: &str, input: &PromptInput) -> String {
    let mut out = String::with_capacity(template.len() + input.diff.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match input.lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Default `(system prompt, template)` for a stage.
pub fn default_prompts(stage: StageName) -> (&'static str, &'static str) {
    match stage {
        StageName::Scout => (SCOUT_SYSTEM, SCOUT_TEMPLATE),
        StageName::Guardian => (GUARDIAN_SYSTEM, GUARDIAN_TEMPLATE),
        StageName::Architect => (ARCHITECT_SYSTEM, ARCHITECT_TEMPLATE),
        StageName::Stylist => (STYLIST_SYSTEM, STYLIST_TEMPLATE),
        StageName::Synthesizer => (SYNTHESIZER_SYSTEM, SYNTHESIZER_TEMPLATE),
    }
}
