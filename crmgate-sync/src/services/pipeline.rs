//! Field transformation pipeline
//!
//! Replaces implicit hook dispatch with an explicit chain of named,
//! ordered steps. Each step sees the full field map and either passes a
//! (possibly modified) map onward or aborts the whole operation with a
//! reason.

use std::collections::HashMap;

/// Field map flowing through the pipeline
pub type FieldMap = HashMap<String, String>;

/// Result of one pipeline step
pub enum StepOutcome {
    /// Continue with this (possibly modified) field map
    Continue(FieldMap),
    /// Stop the operation; the reason is logged and surfaced to the caller
    Abort(String),
}

type StepFn = Box<dyn Fn(FieldMap) -> StepOutcome + Send + Sync>;

struct Step {
    name: String,
    func: StepFn,
}

/// Ordered chain of transformation steps
#[derive(Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

/// Where the pipeline stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aborted {
    pub step: String,
    pub reason: String,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named step; steps run in insertion order
    pub fn step(
        mut self,
        name: impl Into<String>,
        func: impl Fn(FieldMap) -> StepOutcome + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Step {
            name: name.into(),
            func: Box::new(func),
        });
        self
    }

    /// Run all steps over the field map
    pub fn run(&self, mut data: FieldMap) -> Result<FieldMap, Aborted> {
        for step in &self.steps {
            match (step.func)(data) {
                StepOutcome::Continue(next) => data = next,
                StepOutcome::Abort(reason) => {
                    tracing::info!(step = %step.name, reason = %reason, "Pipeline aborted");
                    return Err(Aborted {
                        step: step.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(data)
    }

    /// Default push pipeline: drop empty values, trim whitespace
    pub fn default_push() -> Self {
        Self::new()
            .step("strip_empty", |mut data: FieldMap| {
                data.retain(|_, v| !v.is_empty());
                StepOutcome::Continue(data)
            })
            .step("trim", |data: FieldMap| {
                StepOutcome::Continue(
                    data.into_iter()
                        .map(|(k, v)| (k, v.trim().to_string()))
                        .collect(),
                )
            })
    }

    /// Default pull pipeline: trim whitespace only
    pub fn default_pull() -> Self {
        Self::new().step("trim", |data: FieldMap| {
            StepOutcome::Continue(
                data.into_iter()
                    .map(|(k, v)| (k, v.trim().to_string()))
                    .collect(),
            )
        })
    }
}
