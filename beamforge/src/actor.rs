//! Beam search for one stage (or one unit of a stage).
//!
//! Each round selects expandable leaves, asks the model for one continuation
//! per candidate (concurrently), then evaluates the new nodes concurrently:
//! tool calls are applied in order to the node's own sandbox clone, and a
//! `complete` call runs the validation pipeline. The first node whose
//! `complete` passes wins; pending sibling evaluations are dropped, which
//! cancels them at their next await point and kills their child processes.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::core::edit::replace_once;
use crate::core::selector::select;
use crate::core::tools::{Tool, ToolError, tool_definitions};
use crate::core::types::{CompletionRequest, ContentBlock, Message, ToolResult};
use crate::io::config::SearchConfig;
use crate::io::model::ModelClient;
use crate::io::sandbox::{Sandbox, SandboxError};
use crate::tree::{FileChange, FileMap, NodeId, SearchTree, file_delta};
use crate::validation::ValidationPipeline;

#[derive(Debug, Clone, PartialEq)]
pub struct ActorConfig {
    pub beam_width: usize,
    pub max_depth: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl From<&SearchConfig> for ActorConfig {
    fn from(config: &SearchConfig) -> Self {
        Self {
            beam_width: config.beam_width,
            max_depth: config.max_depth,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("search for '{label}' exhausted after {nodes} nodes without a validated solution")]
    Exhausted { label: String, nodes: usize },
}

impl From<SandboxError> for ToolError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(path) => ToolError::NotFound(path),
            SandboxError::Permission(path) => ToolError::Permission(path),
            SandboxError::InvalidPath(path) => ToolError::InvalidPath(path),
            other => ToolError::CommandFailed(other.to_string()),
        }
    }
}

/// Outcome of applying one assistant turn's tool calls.
#[derive(Debug, Clone, Default)]
pub struct ToolRun {
    pub results: Vec<ToolResult>,
    /// True iff a `complete` call passed validation.
    pub completed: bool,
}

/// What evaluating a freshly created node produced.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub node: NodeId,
    /// Next user turn: tool results, or a nudge when the model called no tools.
    pub reply: Message,
    /// Files written or deleted during this turn.
    pub changes: BTreeMap<String, FileChange>,
    pub solved: bool,
}

/// A validated solution.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub node: NodeId,
    /// Full effective file state (seed files plus every change on the path).
    pub files: FileMap,
    /// Net changes along the path, relative to the seed.
    pub changes: BTreeMap<String, FileChange>,
}

pub struct GenerationActor {
    label: String,
    model: Arc<dyn ModelClient>,
    pipeline: ValidationPipeline,
    seed: Sandbox,
    system_prompt: String,
    continue_prompt: String,
    install_command: Vec<String>,
    config: ActorConfig,
}

impl GenerationActor {
    pub fn new(
        label: impl Into<String>,
        model: Arc<dyn ModelClient>,
        pipeline: ValidationPipeline,
        seed: Sandbox,
        config: ActorConfig,
    ) -> Self {
        Self {
            label: label.into(),
            model,
            pipeline,
            seed,
            system_prompt: String::new(),
            continue_prompt: "Continue working, or call `complete` if the task is done.".to_string(),
            install_command: Vec::new(),
            config,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_continue_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.continue_prompt = prompt.into();
        self
    }

    pub fn with_install_command(mut self, command: Vec<String>) -> Self {
        self.install_command = command;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Candidates for the next round.
    pub fn select(&self, tree: &SearchTree) -> Result<Vec<NodeId>> {
        Ok(select(
            tree,
            tree.root(),
            self.config.beam_width,
            self.config.max_depth,
        )?)
    }

    /// Request one completion per candidate concurrently; each reply becomes a child node.
    #[instrument(skip_all, fields(label = %self.label, candidates = candidates.len()))]
    pub async fn run_llm(
        &self,
        tree: &mut SearchTree,
        candidates: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        let mut requests = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            requests.push(CompletionRequest {
                messages: tree.conversation(*candidate)?,
                max_tokens: self.config.max_tokens,
                system_prompt: (!self.system_prompt.is_empty()).then(|| self.system_prompt.clone()),
                tools: tool_definitions(),
                temperature: self.config.temperature,
            });
        }
        let replies = join_all(requests.iter().map(|request| self.model.complete(request))).await;

        let mut children = Vec::with_capacity(candidates.len());
        for (candidate, reply) in candidates.iter().zip(replies) {
            let completion = reply.with_context(|| format!("model request for '{}'", self.label))?;
            let child = tree.add_child(*candidate, completion.into_message())?;
            debug!(parent = %candidate, %child, "candidate created");
            children.push(child);
        }
        Ok(children)
    }

    /// Sandbox holding the effective file state at `node`.
    pub fn sandbox_at(&self, tree: &SearchTree, node: NodeId) -> Result<Sandbox> {
        let mut sandbox = self.seed.clone();
        sandbox.apply_changes(&tree.effective_changes(node)?);
        Ok(sandbox)
    }

    /// Apply every tool call of `message`, in order, to `sandbox`.
    ///
    /// Failures become error results; nothing here aborts the search.
    /// `complete` is rejected while neither the ancestor chain
    /// (`modified_upstream`) nor this turn has changed a file.
    pub async fn run_tools(
        &self,
        sandbox: &mut Sandbox,
        message: &Message,
        modified_upstream: bool,
    ) -> ToolRun {
        let turn_start = sandbox.files();
        let mut run = ToolRun::default();

        for tool_use in message.tool_uses() {
            if run.completed {
                run.results.push(ToolResult::error(
                    &tool_use.id,
                    "ignored: the task was already completed in this turn",
                ));
                continue;
            }
            let tool = match Tool::parse(tool_use) {
                Ok(tool) => tool,
                Err(err) => {
                    run.results.push(ToolResult::error(&tool_use.id, err.to_string()));
                    continue;
                }
            };
            debug!(tool = tool.name(), "applying tool");
            let outcome = match tool {
                Tool::Complete {} => {
                    let modified = modified_upstream || sandbox.files() != turn_start;
                    if !modified {
                        Err(ToolError::NoModifications)
                    } else {
                        let result = self.pipeline.run(sandbox).await;
                        match result.failure() {
                            None => {
                                run.completed = true;
                                Ok("All validation checks passed.".to_string())
                            }
                            Some(diagnostic) => {
                                run.results.push(ToolResult::error(&tool_use.id, diagnostic));
                                continue;
                            }
                        }
                    }
                }
                other => self.apply_tool(sandbox, other).await,
            };
            run.results.push(match outcome {
                Ok(content) => ToolResult::ok(&tool_use.id, content),
                Err(err) => ToolResult::error(&tool_use.id, err.to_string()),
            });
        }
        run
    }

    async fn apply_tool(&self, sandbox: &mut Sandbox, tool: Tool) -> Result<String, ToolError> {
        match tool {
            Tool::ReadFile { path } => Ok(sandbox.read_file(&path)?),
            Tool::WriteFile { path, content } => {
                sandbox.write_file(&path, &content)?;
                Ok(format!("wrote {path}"))
            }
            Tool::EditFile {
                path,
                search,
                replace,
            } => {
                let current = sandbox.read_file(&path)?;
                let updated = replace_once(&current, &search, &replace)
                    .map_err(|count| ToolError::OccurrenceMismatch {
                        path: path.clone(),
                        count,
                    })?;
                sandbox.write_file(&path, &updated)?;
                Ok(format!("edited {path}"))
            }
            Tool::DeleteFile { path } => {
                sandbox.delete(&path)?;
                Ok(format!("deleted {path}"))
            }
            Tool::InstallDependency { packages } => {
                if self.install_command.is_empty() {
                    return Err(ToolError::CommandFailed(
                        "dependency installation is not available".to_string(),
                    ));
                }
                let mut argv = self.install_command.clone();
                argv.extend(packages);
                let output = sandbox.exec_and_sync(&argv, None).await.map_err(|err| {
                    match err.downcast_ref::<SandboxError>() {
                        Some(sandbox_err) => ToolError::from(sandbox_err.clone()),
                        None => ToolError::CommandFailed(format!("{err:#}")),
                    }
                })?;
                if !output.success() {
                    return Err(ToolError::CommandFailed(output.report("install")));
                }
                Ok(format!("installed {}", argv[self.install_command.len()..].join(" ")))
            }
            Tool::Complete {} => Err(ToolError::CommandFailed(
                "complete must be handled by the actor".to_string(),
            )),
        }
    }

    /// Evaluate a freshly created node against a snapshot of the tree.
    #[instrument(skip_all, fields(label = %self.label, %node))]
    pub async fn eval_node(&self, tree: &SearchTree, node: NodeId) -> Result<Evaluation> {
        let mut sandbox = self.sandbox_at(tree, node)?;
        let before = sandbox.files();
        let modified_upstream = tree.has_modifications(node)?;
        let message = tree
            .get(node)?
            .messages
            .last()
            .cloned()
            .context("node has no messages")?;

        let run = self.run_tools(&mut sandbox, &message, modified_upstream).await;
        let reply = if run.results.is_empty() {
            Message::user_text(self.continue_prompt.clone())
        } else {
            Message::user(
                run.results
                    .into_iter()
                    .map(ContentBlock::ToolResult)
                    .collect(),
            )
        };
        Ok(Evaluation {
            node,
            reply,
            changes: file_delta(&before, &sandbox.files()),
            solved: run.completed,
        })
    }

    /// Record an evaluation in the tree. A solved node becomes a branch point.
    pub fn apply(&self, tree: &mut SearchTree, evaluation: Evaluation) -> Result<()> {
        tree.push_message(evaluation.node, evaluation.reply)?;
        tree.record_files(evaluation.node, evaluation.changes)?;
        if evaluation.solved {
            tree.mark_branch_point(evaluation.node)?;
        }
        Ok(())
    }

    /// Run the search until a node validates or no candidates remain.
    #[instrument(skip_all, fields(label = %self.label))]
    pub async fn search(&self, tree: &mut SearchTree) -> Result<Solution> {
        let mut round = 0u32;
        loop {
            let candidates = self.select(tree)?;
            if candidates.is_empty() {
                info!(nodes = tree.len(), "search exhausted");
                return Err(ActorError::Exhausted {
                    label: self.label.clone(),
                    nodes: tree.len(),
                }
                .into());
            }
            round += 1;
            debug!(round, candidates = candidates.len(), "search round");
            let children = self.run_llm(tree, &candidates).await?;

            let snapshot = tree.clone();
            let mut pending: FuturesUnordered<_> = children
                .iter()
                .map(|child| self.eval_node(&snapshot, *child))
                .collect();
            let mut solved = None;
            while let Some(evaluation) = pending.next().await {
                let evaluation = evaluation?;
                let node = evaluation.node;
                let is_solution = evaluation.solved;
                self.apply(tree, evaluation)?;
                if is_solution {
                    solved = Some(node);
                    break;
                }
            }
            drop(pending);

            if let Some(node) = solved {
                info!(%node, round, "solution validated");
                return Ok(Solution {
                    node,
                    files: self.sandbox_at(tree, node)?.files(),
                    changes: tree.effective_changes(node)?,
                });
            }
        }
    }

    /// Start a fresh search from `prompt`, returning the solution and the explored tree.
    pub async fn run(&self, prompt: impl Into<String>) -> (Result<Solution>, SearchTree) {
        let mut tree = SearchTree::new(Message::user_text(prompt));
        let result = self.search(&mut tree).await;
        (result, tree)
    }
}
