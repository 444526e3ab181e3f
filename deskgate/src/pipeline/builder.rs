//! Pipeline builder with validation.

use super::dag::topological_order;
use super::stage::{ResolvedStage, Stage, StageDefaults};
use super::template::referenced_stages;
use super::StageSpec;
use crate::core::StageOutput;
use crate::errors::{CycleDetectedError, DeskgateError, ErrorInfo, PipelineStartError, PipelineValidationError};
use std::collections::BTreeMap;

/// Builder for creating validated pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageSpec>,
    endpoint_stage: Option<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            endpoint_stage: None,
        }
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Adds several stages.
    #[must_use]
    pub fn stages(mut self, specs: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(specs);
        self
    }

    /// Names the stage whose outputs define the stream endpoint.
    ///
    /// Defaults to the last stage in start order.
    #[must_use]
    pub fn endpoint_stage(mut self, name: impl Into<String>) -> Self {
        self.endpoint_stage = Some(name.into());
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the pipeline.
    ///
    /// Dependency cycles are not checked here; they surface when the start
    /// order is computed, before anything is spawned.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no stages, a name is duplicated, a
    /// stage is invalid on its own, a dependency is unknown, or a template
    /// references a stage that is not a dependency.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ErrorInfo::new("DESK-CONFIG-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        let mut stages = BTreeMap::new();
        let mut insertion_order = Vec::with_capacity(self.stages.len());

        for spec in self.stages {
            spec.validate()?;
            if stages.contains_key(&spec.name) {
                return Err(PipelineValidationError::new(format!(
                    "Duplicate stage name '{}'",
                    spec.name
                ))
                .with_stages(vec![spec.name.clone()])
                .with_error_info(ErrorInfo::new(
                    "DESK-CONFIG-DUPLICATE",
                    format!("Stage '{}' is defined more than once", spec.name),
                )));
            }
            insertion_order.push(spec.name.clone());
            stages.insert(spec.name.clone(), spec);
        }

        for spec in stages.values() {
            for dep in &spec.dependencies {
                if !stages.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' depends on unknown stage '{}'",
                        spec.name, dep
                    ))
                    .with_stages(vec![spec.name.clone(), dep.clone()])
                    .with_error_info(
                        ErrorInfo::new("DESK-CONFIG-MISSING-DEP", format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Define the dependency or remove it from depends_on."),
                    ));
                }
            }
            check_template_references(spec)?;
        }

        if let Some(endpoint) = &self.endpoint_stage {
            if !stages.contains_key(endpoint) {
                return Err(PipelineValidationError::new(format!(
                    "Endpoint stage '{endpoint}' is not part of the pipeline"
                ))
                .with_stages(vec![endpoint.clone()]));
            }
        }

        Ok(Pipeline {
            name: self.name,
            stages,
            insertion_order,
            endpoint_stage: self.endpoint_stage,
        })
    }
}

fn check_template_references(spec: &StageSpec) -> Result<(), PipelineValidationError> {
    let templates = spec
        .command
        .iter()
        .chain(spec.env.values())
        .chain(spec.outputs.values())
        .chain(spec.credential.iter().flat_map(|c| c.unauthenticated_args.iter().flatten()));

    for template in templates {
        if let Some(undeclared) = referenced_stages(template)
            .into_iter()
            .find(|r| !spec.dependencies.contains(*r))
        {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' references '{}' which is not one of its dependencies",
                spec.name, undeclared
            ))
            .with_stages(vec![spec.name.clone(), undeclared.to_string()])
            .with_error_info(
                ErrorInfo::new("DESK-TEMPLATE", format!("Undeclared dependency '{undeclared}'"))
                    .with_fix_hint("Add the referenced stage to depends_on."),
            ));
        }
    }
    Ok(())
}

/// A validated, immutable set of stages.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    stages: BTreeMap<String, StageSpec>,
    insertion_order: Vec<String>,
    endpoint_stage: Option<String>,
}

impl Pipeline {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Looks up a stage spec.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Stage specs in the order they were added.
    pub fn specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.insertion_order.iter().filter_map(|n| self.stages.get(n))
    }

    /// Computes the start order.
    ///
    /// # Errors
    ///
    /// Returns [`CycleDetectedError`] if the dependencies form a cycle.
    pub fn start_order(&self) -> Result<Vec<String>, CycleDetectedError> {
        topological_order(&self.stages, &self.insertion_order)
    }

    /// The stage whose outputs define the stream endpoint.
    #[must_use]
    pub fn endpoint_stage(&self, start_order: &[String]) -> Option<String> {
        self.endpoint_stage
            .clone()
            .or_else(|| start_order.last().cloned())
    }

    /// Resolves every stage in start order without spawning anything.
    ///
    /// # Errors
    ///
    /// Returns an error on cycles or unresolvable templates.
    pub fn plan(&self, defaults: StageDefaults) -> Result<Vec<(String, ResolvedStage)>, DeskgateError> {
        let order = self.start_order()?;
        let mut upstream: BTreeMap<String, StageOutput> = BTreeMap::new();
        let mut planned = Vec::with_capacity(order.len());

        for name in order {
            let Some(spec) = self.stages.get(&name) else {
                continue;
            };
            let resolved = Stage::new(spec.clone())
                .plan(&upstream, defaults)
                .map_err(|e| PipelineStartError {
                    failed_stage: name.clone(),
                    cause: e.into(),
                })?;
            upstream.insert(name.clone(), resolved.output.clone());
            planned.push((name, resolved));
        }

        Ok(planned)
    }
}
