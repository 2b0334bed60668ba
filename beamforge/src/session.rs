//! Multi-turn flow around the stage machine.
//!
//! A session starts with an intake turn that either accepts the request or
//! asks the caller a clarifying question. Once accepted, stages run until the
//! project is complete, with a checkpoint written after every stage and a
//! progress event for every milestone. Feedback on a complete project opens
//! an edit stage.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use minijinja::context;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::invariants::validate_invariants;
use crate::core::tags::extract_tag;
use crate::core::types::{CompletionRequest, Message};
use crate::diff::diff_stat;
use crate::io::checkpoint::{load_checkpoint, write_checkpoint};
use crate::io::events::EventStatus;
use crate::io::prompt::Prompt;
use crate::stage::{StageError, StageMachine, StageState, StageTag};
use crate::tree::FileMap;

/// Checkpointed session: stage state plus intake bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub stage: StageState,
    /// The intake turn accepted the request.
    #[serde(default)]
    pub ready: bool,
    /// Caller answers to clarifying questions, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<String>,
    /// Consecutive clarification rounds since the request was last accepted.
    #[serde(default)]
    pub refinements: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl SessionState {
    pub fn new(request: impl Into<String>, files: FileMap) -> Self {
        Self {
            stage: StageState::new(request, files),
            ready: false,
            answers: Vec::new(),
            refinements: 0,
            question: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Complete { files: FileMap, summary: String },
    NeedsInput { question: String },
}

/// Parsed intake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    Ready(String),
    Clarify(String),
}

/// `<ready>` wins; otherwise `<clarify>`, otherwise the whole reply is the question.
pub fn parse_intake(text: &str) -> Intake {
    if let Some(ready) = extract_tag(text, "ready") {
        return Intake::Ready(ready);
    }
    match extract_tag(text, "clarify") {
        Some(question) => Intake::Clarify(question),
        None => Intake::Clarify(text.trim().to_string()),
    }
}

pub struct Session {
    machine: StageMachine,
    checkpoint: Option<PathBuf>,
}

impl Session {
    pub fn new(machine: StageMachine) -> Self {
        Self {
            machine,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Load a checkpoint, rejecting a search tree whose links are inconsistent.
    pub fn load(path: &Path) -> Result<SessionState> {
        let state: SessionState = load_checkpoint(path)?;
        if let Some(tree) = &state.stage.trajectory {
            let errors = validate_invariants(tree);
            if !errors.is_empty() {
                bail!(
                    "checkpoint {} has an invalid search tree:\n- {}",
                    path.display(),
                    errors.join("\n- ")
                );
            }
        }
        Ok(state)
    }

    /// Continue a session with caller input.
    ///
    /// Before intake accepts the request the input answers the pending question;
    /// on a complete project it is an edit request; otherwise it is a retry hint
    /// for the stage that failed.
    pub async fn resume(
        &self,
        state: &mut SessionState,
        input: impl Into<String>,
    ) -> Result<SessionOutcome> {
        let input = input.into();
        if !state.ready {
            state.answers.push(input);
            state.question = None;
        } else if state.stage.stage == StageTag::Complete {
            state.stage.request_edit(input)?;
        } else {
            state.stage.feedback = Some(input);
        }
        self.run(state).await
    }

    /// Drive the session until it completes or needs caller input.
    ///
    /// Failures emit an error event and are checkpointed before being returned.
    #[instrument(skip_all, fields(stage = %state.stage.stage))]
    pub async fn run(&self, state: &mut SessionState) -> Result<SessionOutcome> {
        let result = self.drive(state).await;
        if let Err(err) = &result {
            self.machine
                .events()
                .emit(state.stage.event(EventStatus::Error, format!("{err:#}")));
            if let Err(save_err) = self.save(state) {
                warn!(err = %format!("{save_err:#}"), "checkpoint after failure not written");
            }
        }
        result
    }

    async fn drive(&self, state: &mut SessionState) -> Result<SessionOutcome> {
        if !state.ready
            && let Some(question) = self.intake(state).await?
        {
            self.machine.events().emit(
                state
                    .stage
                    .event(EventStatus::ClarificationNeeded, question.clone()),
            );
            self.save(state)?;
            return Ok(SessionOutcome::NeedsInput { question });
        }

        while state.stage.stage != StageTag::Complete {
            self.machine.advance(&mut state.stage).await?;
            self.save(state)?;
        }

        let summary = self.summarize(&state.stage).await?;
        let mut event = state.stage.event(EventStatus::Final, "project complete");
        event.summary = Some(summary.clone());
        self.machine.events().emit(event);
        self.save(state)?;
        Ok(SessionOutcome::Complete {
            files: state.stage.files.clone(),
            summary,
        })
    }

    /// Returns the clarifying question, or `None` once the request is accepted.
    async fn intake(&self, state: &mut SessionState) -> Result<Option<String>> {
        let prompt = self.machine.prompts().render(
            Prompt::Intake,
            context! { request => state.stage.request, answers => state.answers },
        )?;
        let reply = self
            .machine
            .model()
            .complete(&self.request(prompt))
            .await
            .context("intake request")?
            .into_message();

        match parse_intake(&reply.text()) {
            Intake::Ready(refined) => {
                info!("request accepted");
                if !refined.is_empty() {
                    state.stage.request = refined;
                }
                state.ready = true;
                state.refinements = 0;
                state.question = None;
                Ok(None)
            }
            Intake::Clarify(question) => {
                let limit = self.machine.config().session.max_refinements;
                state.refinements += 1;
                if state.refinements > limit {
                    return Err(StageError::RefinementLimit { limit }.into());
                }
                info!(round = state.refinements, "clarification needed");
                state.question = Some(question.clone());
                Ok(Some(question))
            }
        }
    }

    async fn summarize(&self, stage: &StageState) -> Result<String> {
        let stats = diff_stat(&stage.baseline, &stage.files);
        let prompt = self.machine.prompts().render(
            Prompt::Summary,
            context! { request => stage.request, stats => stats },
        )?;
        let reply = self
            .machine
            .model()
            .complete(&self.request(prompt))
            .await
            .context("summary request")?
            .into_message();
        let text = reply.text();
        let summary = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("Update project");
        Ok(summary.to_string())
    }

    fn request(&self, prompt: String) -> CompletionRequest {
        let search = &self.machine.config().search;
        CompletionRequest {
            messages: vec![Message::user_text(prompt)],
            max_tokens: search.max_tokens,
            system_prompt: None,
            tools: Vec::new(),
            temperature: search.temperature,
        }
    }

    fn save(&self, state: &SessionState) -> Result<()> {
        match &self.checkpoint {
            Some(path) => write_checkpoint(path, state),
            None => Ok(()),
        }
    }
}
