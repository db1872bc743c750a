//! Stage descriptors and the review plan.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::prompts::default_prompts;
use super::stage::StageName;
use crate::ratelimit::{ANTHROPIC_SERVICE, OPENAI_SERVICE};

/// Errors in a stage plan.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("Stage '{0}' is missing from the plan")]
    MissingStage(StageName),

    #[error("Stage '{0}' appears more than once")]
    DuplicateStage(StageName),

    #[error("Stage '{stage}' depends on '{dependency}', which does not run before it")]
    InvalidDependency {
        stage: StageName,
        dependency: StageName,
    },

    #[error("Stage '{0}' has an empty model or service")]
    Incomplete(StageName),
}

/// Everything the executor needs to run one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: StageName,
    /// Rate-limit budget and capability the stage is charged to.
    pub service: String,
    pub model: String,
    pub system_prompt: String,
    pub prompt_template: String,
    pub depends_on: Vec<StageName>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl StageDescriptor {
    /// Descriptor with the default prompts for `name`.
    pub fn new(name: StageName, service: impl Into<String>, model: impl Into<String>) -> Self {
        let (system_prompt, prompt_template) = default_prompts(name);
        Self {
            name,
            service: service.into(),
            model: model.into(),
            system_prompt: system_prompt.to_string(),
            prompt_template: prompt_template.to_string(),
            depends_on: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_depends_on(mut self, depends_on: impl IntoIterator<Item = StageName>) -> Self {
        self.depends_on = depends_on.into_iter().collect();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Ordered set of stage descriptors, one per [`StageName`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    stages: Vec<StageDescriptor>,
}

impl Default for StagePlan {
    fn default() -> Self {
        Self::default_plan()
    }
}

impl StagePlan {
    /// Scout and Synthesizer on OpenAI, Guardian on Anthropic, the other
    /// analyses on OpenAI.
    pub fn default_plan() -> Self {
        let analyses = StageName::ANALYSES;
        Self {
            stages: vec![
                StageDescriptor::new(StageName::Scout, OPENAI_SERVICE, "gpt-4o-mini")
                    .with_temperature(0.1)
                    .with_max_tokens(8000),
                StageDescriptor::new(
                    StageName::Guardian,
                    ANTHROPIC_SERVICE,
                    "claude-3-5-sonnet-20241022",
                )
                .with_depends_on([StageName::Scout])
                .with_temperature(0.2)
                .with_max_tokens(4000),
                StageDescriptor::new(StageName::Architect, OPENAI_SERVICE, "gpt-4o")
                    .with_depends_on([StageName::Scout])
                    .with_temperature(0.2)
                    .with_max_tokens(4000),
                StageDescriptor::new(StageName::Stylist, OPENAI_SERVICE, "gpt-4o-mini")
                    .with_depends_on([StageName::Scout])
                    .with_temperature(0.2)
                    .with_max_tokens(3000),
                StageDescriptor::new(StageName::Synthesizer, OPENAI_SERVICE, "gpt-4o")
                    .with_depends_on(analyses)
                    .with_temperature(0.3)
                    .with_max_tokens(4000),
            ],
        }
    }

    /// Default plan with per-stage model overrides.
    pub fn from_models(models: &BTreeMap<StageName, String>) -> Self {
        let mut plan = Self::default_plan();
        for (stage, model) in models {
            plan = plan.with_model(*stage, model.clone());
        }
        plan
    }

    pub fn with_model(mut self, stage: StageName, model: impl Into<String>) -> Self {
        if let Some(descriptor) = self.stages.iter_mut().find(|d| d.name == stage) {
            descriptor.model = model.into();
        }
        self
    }

    pub fn with_service(mut self, stage: StageName, service: impl Into<String>) -> Self {
        if let Some(descriptor) = self.stages.iter_mut().find(|d| d.name == stage) {
            descriptor.service = service.into();
        }
        self
    }

    /// Replaces the descriptor with the same name.
    pub fn with_descriptor(mut self, descriptor: StageDescriptor) -> Self {
        if let Some(slot) = self.stages.iter_mut().find(|d| d.name == descriptor.name) {
            *slot = descriptor;
        }
        self
    }

    pub fn get(&self, stage: StageName) -> Option<&StageDescriptor> {
        self.stages.iter().find(|d| d.name == stage)
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Services any stage is charged to.
    pub fn services(&self) -> HashSet<&str> {
        self.stages.iter().map(|d| d.service.as_str()).collect()
    }

    /// Checks every stage is present once, complete, and only depends on
    /// stages listed before it.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for descriptor in &self.stages {
            if !seen.insert(descriptor.name) {
                return Err(PlanError::DuplicateStage(descriptor.name));
            }
            if descriptor.model.trim().is_empty() || descriptor.service.trim().is_empty() {
                return Err(PlanError::Incomplete(descriptor.name));
            }
            for dependency in &descriptor.depends_on {
                if !seen.contains(dependency) || *dependency == descriptor.name {
                    return Err(PlanError::InvalidDependency {
                        stage: descriptor.name,
                        dependency: *dependency,
                    });
                }
            }
        }
        for stage in StageName::ALL {
            if !seen.contains(&stage) {
                return Err(PlanError::MissingStage(stage));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_valid() {
        let plan = StagePlan::default_plan();
        assert_eq!(plan.validate(), Ok(()));
        assert_eq!(
            plan.get(StageName::Guardian).map(|d| d.service.as_str()),
            Some(ANTHROPIC_SERVICE)
        );
        assert_eq!(
            plan.get(StageName::Synthesizer).map(|d| d.depends_on.len()),
            Some(3)
        );
        assert_eq!(plan.services().len(), 2);
    }

    #[test]
    fn test_model_overrides() {
        let mut models = BTreeMap::new();
        models.insert(StageName::Stylist, "gpt-4.1-mini".to_string());
        let plan = StagePlan::from_models(&models);
        assert_eq!(
            plan.get(StageName::Stylist).map(|d| d.model.as_str()),
            Some("gpt-4.1-mini")
        );
        assert_eq!(
            plan.get(StageName::Scout).map(|d| d.model.as_str()),
            Some("gpt-4o-mini")
        );
    }

    #[test]
    fn test_validate_rejects_forward_dependency() {
        let plan = StagePlan::default_plan().with_descriptor(
            StageDescriptor::new(StageName::Scout, OPENAI_SERVICE, "gpt-4o-mini")
                .with_depends_on([StageName::Synthesizer]),
        );
        assert_eq!(
            plan.validate(),
            Err(PlanError::InvalidDependency {
                stage: StageName::Scout,
                dependency: StageName::Synthesizer,
            })
        );
    }

    #[test]
    fn test_validate_rejects_empty_model() {
        let plan = StagePlan::default_plan().with_model(StageName::Architect, " ");
        assert_eq!(plan.validate(), Err(PlanError::Incomplete(StageName::Architect)));
    }
}
