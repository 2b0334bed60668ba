//! Stage sequencing: `Draft → Build (handlers ∥ frontend) → Review → Complete`,
//! plus `Complete → Edit → Complete` when the caller sends feedback.
//!
//! Each stage runs one or more [`GenerationActor`] searches over sandboxes
//! seeded from the stage state. [`StageState`] is plain serializable data, so
//! a caller can checkpoint after any stage and resume later without replaying
//! the stages already done.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use minijinja::context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::actor::{ActorConfig, GenerationActor};
use crate::core::merge::{MergeConflict, merge_disjoint};
use crate::diff::{diff_stat, unified_diff};
use crate::io::config::{EngineConfig, LayoutConfig};
use crate::io::events::{EventStatus, ProgressEvent, ProgressSink};
use crate::io::model::ModelClient;
use crate::io::prompt::{Prompt, PromptFile, PromptRegistry};
use crate::io::sandbox::{Sandbox, SandboxRuntime};
use crate::tree::{FileChange, FileMap, SearchTree};
use crate::validation::{ValidationPipeline, VisionModel, build_pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    Draft,
    Build,
    Review,
    Complete,
    Edit,
}

impl StageTag {
    pub fn name(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Build => "build",
            Self::Review => "review",
            Self::Complete => "complete",
            Self::Edit => "edit",
        }
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error(transparent)]
    MergeConflict(#[from] MergeConflict),
    #[error("gave up after {limit} consecutive clarification rounds")]
    RefinementLimit { limit: u32 },
    #[error("stage '{stage}' has no solution: {reason}")]
    MissingSolution { stage: StageTag, reason: String },
}

/// Checkpointable state of the stage machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: StageTag,
    pub request: String,
    /// Files the session started from; diffs are reported against these.
    pub baseline: FileMap,
    /// Accumulated merged files.
    pub files: FileMap,
    /// Build units that already produced a validated solution, keyed by unit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub units: BTreeMap<String, BTreeMap<String, FileChange>>,
    /// Search tree of the last single-actor stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<SearchTree>,
    /// Caller feedback for the next stage (edit request or retry hint).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl StageState {
    pub fn new(request: impl Into<String>, files: FileMap) -> Self {
        Self {
            stage: StageTag::Draft,
            request: request.into(),
            baseline: files.clone(),
            files,
            units: BTreeMap::new(),
            trajectory: None,
            feedback: None,
        }
    }

    /// Reopen a finished project with an edit request.
    pub fn request_edit(&mut self, feedback: impl Into<String>) -> Result<(), StageError> {
        if self.stage != StageTag::Complete {
            return Err(StageError::MissingSolution {
                stage: self.stage,
                reason: "edits can only be requested once the project is complete".to_string(),
            });
        }
        self.feedback = Some(feedback.into());
        self.stage = StageTag::Edit;
        Ok(())
    }

    /// Progress event carrying the merged diff against the baseline.
    pub fn event(&self, status: EventStatus, message: impl Into<String>) -> ProgressEvent {
        let mut event = ProgressEvent::new(status, message).with_stage(self.stage.name());
        if self.files != self.baseline {
            event.diff = Some(unified_diff(&self.baseline, &self.files));
            event.diff_stat = diff_stat(&self.baseline, &self.files);
        }
        event
    }

    fn apply(&mut self, changes: &BTreeMap<String, FileChange>) {
        for (path, change) in changes {
            match change {
                FileChange::Write(content) => {
                    self.files.insert(path.clone(), content.clone());
                }
                FileChange::Delete => {
                    self.files.remove(path);
                }
            }
        }
    }
}

/// True if any configured schema file is already present.
pub fn has_schema(layout: &LayoutConfig, files: &FileMap) -> bool {
    layout.schema_paths.iter().any(|path| files.contains_key(path))
}

/// Handler units: files directly under the handler directory with the handler extension.
pub fn discover_units(layout: &LayoutConfig, files: &FileMap) -> Vec<String> {
    let dir = format!("{}/", layout.handler_dir.trim_end_matches('/'));
    let suffix = format!(".{}", layout.handler_ext);
    files
        .keys()
        .filter_map(|path| path.strip_prefix(&dir))
        .filter(|rest| !rest.contains('/'))
        .filter_map(|name| name.strip_suffix(&suffix))
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .collect()
}

fn schema_files(layout: &LayoutConfig, files: &FileMap) -> FileMap {
    layout
        .schema_paths
        .iter()
        .filter_map(|path| files.get(path).map(|content| (path.clone(), content.clone())))
        .collect()
}

fn prompt_files(files: &FileMap) -> Vec<PromptFile<'_>> {
    files
        .iter()
        .map(|(path, content)| PromptFile { path, content })
        .collect()
}

/// One independent search inside the build stage.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Unit {
    Handler(String),
    Frontend,
}

impl Unit {
    fn key(&self) -> String {
        match self {
            Self::Handler(name) => format!("handler:{name}"),
            Self::Frontend => "frontend".to_string(),
        }
    }
}

struct ActorSpec<'a> {
    label: String,
    stage: &'static str,
    seed: FileMap,
    allowed: &'a [String],
    protected: &'a [String],
    install: &'a [String],
    checks: &'a [String],
    unit: Option<&'a str>,
}

pub struct StageMachine {
    config: Arc<EngineConfig>,
    prompts: Arc<PromptRegistry>,
    model: Arc<dyn ModelClient>,
    vision: VisionModel,
    runtime: Arc<SandboxRuntime>,
    events: ProgressSink,
}

impl StageMachine {
    pub fn new(
        config: Arc<EngineConfig>,
        prompts: Arc<PromptRegistry>,
        model: Arc<dyn ModelClient>,
        vision: Arc<dyn ModelClient>,
        runtime: Arc<SandboxRuntime>,
    ) -> Self {
        let vision = VisionModel {
            client: vision,
            prompts: Arc::clone(&prompts),
            max_tokens: config.search.max_tokens,
        };
        Self {
            config,
            prompts,
            model,
            vision,
            runtime,
            events: ProgressSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: ProgressSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    pub fn events(&self) -> &ProgressSink {
        &self.events
    }

    /// Run the current stage and move to the next one.
    ///
    /// On error the stage tag is unchanged; completed build units stay recorded.
    #[instrument(skip_all, fields(stage = %state.stage))]
    pub async fn advance(&self, state: &mut StageState) -> Result<()> {
        let stage = state.stage;
        match stage {
            StageTag::Draft => self.draft(state).await?,
            StageTag::Build => self.build(state).await?,
            StageTag::Review => self.review(state).await?,
            StageTag::Edit => self.edit(state).await?,
            StageTag::Complete => return Ok(()),
        }
        info!(from = %stage, to = %state.stage, files = state.files.len(), "stage finished");
        self.events.emit(
            state.event(EventStatus::InProgress, format!("{stage} finished")),
        );
        Ok(())
    }

    pub async fn run_until_complete(&self, state: &mut StageState) -> Result<()> {
        while state.stage != StageTag::Complete {
            self.advance(state).await?;
        }
        Ok(())
    }

    fn actor(&self, spec: ActorSpec<'_>) -> Result<GenerationActor> {
        let validation = &self.config.validation;
        let pipeline = build_pipeline(validation, spec.checks, spec.unit, &self.vision)
            .with_context(|| format!("build {} checks", spec.stage))?;
        let system_prompt = self.prompts.render(
            Prompt::System,
            context! {
                stage => spec.stage,
                allowed => spec.allowed,
                protected => spec.protected,
            },
        )?;
        let continue_prompt = self.prompts.render(Prompt::Continue, context! {})?;

        let mut seed = Sandbox::new(spec.seed, Arc::clone(&self.runtime));
        seed.configure_permissions(spec.protected.to_vec(), spec.allowed.to_vec());
        seed.configure_install_paths(spec.install.to_vec());
        Ok(GenerationActor::new(
            spec.label,
            Arc::clone(&self.model),
            pipeline,
            seed,
            ActorConfig::from(&self.config.search),
        )
        .with_system_prompt(system_prompt)
        .with_continue_prompt(continue_prompt)
        .with_install_command(self.config.sandbox.install_command.clone()))
    }

    async fn draft(&self, state: &mut StageState) -> Result<()> {
        let layout = &self.config.layout;
        if has_schema(layout, &state.files) {
            info!("schema already present, skipping draft");
            state.stage = StageTag::Build;
            return Ok(());
        }
        let prompt = self.prompts.render(
            Prompt::Draft,
            context! {
                request => state.request,
                feedback => state.feedback,
                handler_dir => layout.handler_dir,
            },
        )?;
        let actor = self.actor(ActorSpec {
            label: "draft".to_string(),
            stage: "draft",
            seed: state.files.clone(),
            allowed: &layout.draft_allowed,
            protected: &layout.protected,
            install: &layout.install_allowed,
            checks: &self.config.validation.draft,
            unit: None,
        })?;
        let (result, tree) = actor.run(prompt).await;
        state.trajectory = Some(tree);
        let solution = result.context("draft stage")?;
        state.files = solution.files;
        state.feedback = None;
        state.stage = StageTag::Build;
        Ok(())
    }

    async fn build(&self, state: &mut StageState) -> Result<()> {
        let layout = &self.config.layout;
        let mut units: Vec<Unit> = discover_units(layout, &state.files)
            .into_iter()
            .map(Unit::Handler)
            .collect();
        if layout.frontend_enabled {
            units.push(Unit::Frontend);
        }
        if units.is_empty() {
            return Err(StageError::MissingSolution {
                stage: StageTag::Build,
                reason: format!(
                    "no handlers under {} and the frontend is disabled",
                    layout.handler_dir
                ),
            }
            .into());
        }
        let pending: Vec<&Unit> = units
            .iter()
            .filter(|unit| !state.units.contains_key(&unit.key()))
            .collect();
        info!(
            units = units.len(),
            pending = pending.len(),
            "building units concurrently"
        );

        let snapshot: &StageState = state;
        let results = join_all(pending.iter().map(|unit| async move {
            (unit.key(), self.run_unit(snapshot, unit).await)
        }))
        .await;

        let mut first_error = None;
        for (key, result) in results {
            match result {
                Ok(changes) => {
                    info!(unit = %key, files = changes.len(), "unit validated");
                    state.units.insert(key, changes);
                }
                Err(err) => {
                    warn!(unit = %key, err = %format!("{err:#}"), "unit failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let merged = merge_disjoint(&state.units).map_err(StageError::from)?;
        state.apply(&merged);
        state.units.clear();
        state.trajectory = None;
        state.feedback = None;
        state.stage = StageTag::Review;
        Ok(())
    }

    /// Search one build unit; returns the changes it made relative to its seed.
    async fn run_unit(
        &self,
        state: &StageState,
        unit: &Unit,
    ) -> Result<BTreeMap<String, FileChange>> {
        let layout = &self.config.layout;
        let validation = &self.config.validation;
        let (actor, prompt) = match unit {
            Unit::Handler(name) => {
                let ext = &layout.handler_ext;
                let handler_path = format!("{}/{name}.{ext}", layout.handler_dir.trim_end_matches('/'));
                let test_path = format!(
                    "{}/{name}.test.{ext}",
                    layout.handler_test_dir.trim_end_matches('/')
                );
                let schema = schema_files(layout, &state.files);
                let mut seed = schema.clone();
                if let Some(stub) = state.files.get(&handler_path) {
                    seed.insert(handler_path.clone(), stub.clone());
                }
                let prompt = self.prompts.render(
                    Prompt::Handler,
                    context! {
                        request => state.request,
                        unit => name,
                        handler_path => &handler_path,
                        test_path => &test_path,
                        schema_files => prompt_files(&schema),
                        feedback => state.feedback,
                    },
                )?;
                let allowed = [handler_path, test_path];
                let actor = self.actor(ActorSpec {
                    label: unit.key(),
                    stage: "handler",
                    seed,
                    allowed: &allowed,
                    protected: &layout.protected,
                    install: &[],
                    checks: &validation.handler,
                    unit: Some(name),
                })?;
                (actor, prompt)
            }
            Unit::Frontend => {
                let prompt = self.prompts.render(
                    Prompt::Frontend,
                    context! {
                        request => state.request,
                        files => prompt_files(&state.files),
                        feedback => state.feedback,
                    },
                )?;
                let actor = self.actor(ActorSpec {
                    label: unit.key(),
                    stage: "frontend",
                    seed: state.files.clone(),
                    allowed: &layout.frontend_allowed,
                    protected: &layout.protected,
                    install: &[],
                    checks: &validation.frontend,
                    unit: None,
                })?;
                (actor, prompt)
            }
        };
        let (result, _tree) = actor.run(prompt).await;
        let solution = result.with_context(|| format!("build unit '{}'", unit.key()))?;
        self.events.emit(
            ProgressEvent::new(
                EventStatus::InProgress,
                format!("{} validated", unit.key()),
            )
            .with_stage(StageTag::Build.name()),
        );
        Ok(solution.changes)
    }

    async fn review(&self, state: &mut StageState) -> Result<()> {
        let validation = &self.config.validation;
        let layout = &self.config.layout;
        let pipeline: ValidationPipeline =
            build_pipeline(validation, &validation.review, None, &self.vision)
                .context("build review checks")?;
        let sandbox = Sandbox::new(state.files.clone(), Arc::clone(&self.runtime));
        let result = pipeline.run(&sandbox).await;
        let Some(diagnostic) = result.failure() else {
            info!("merged project passes review");
            state.feedback = None;
            state.stage = StageTag::Complete;
            return Ok(());
        };

        info!("merged project fails review, starting repair search");
        let prompt = self.prompts.render(
            Prompt::Review,
            context! {
                request => state.request,
                diagnostic => diagnostic,
                feedback => state.feedback,
            },
        )?;
        let actor = self.actor(ActorSpec {
            label: "review".to_string(),
            stage: "review",
            seed: state.files.clone(),
            allowed: &layout.review_allowed,
            protected: &layout.protected,
            install: &layout.install_allowed,
            checks: &validation.review,
            unit: None,
        })?;
        let (result, tree) = actor.run(prompt).await;
        state.trajectory = Some(tree);
        state.files = result.context("review stage")?.files;
        state.feedback = None;
        state.stage = StageTag::Complete;
        Ok(())
    }

    async fn edit(&self, state: &mut StageState) -> Result<()> {
        let layout = &self.config.layout;
        let feedback = state.feedback.clone().ok_or_else(|| StageError::MissingSolution {
            stage: StageTag::Edit,
            reason: "no edit request was given".to_string(),
        })?;
        let prompt = self.prompts.render(
            Prompt::Edit,
            context! {
                request => state.request,
                feedback => feedback,
                files => prompt_files(&state.files),
            },
        )?;
        let actor = self.actor(ActorSpec {
            label: "edit".to_string(),
            stage: "edit",
            seed: state.files.clone(),
            allowed: &layout.edit_allowed,
            protected: &layout.edit_protected,
            install: &layout.install_allowed,
            checks: &self.config.validation.edit,
            unit: None,
        })?;
        let (result, tree) = actor.run(prompt).await;
        state.trajectory = Some(tree);
        state.files = result.context("edit stage")?.files;
        state.feedback = None;
        state.stage = StageTag::Complete;
        Ok(())
    }
}
