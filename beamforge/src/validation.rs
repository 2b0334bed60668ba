//! Concurrent, fail-soft validation of a candidate's sandbox.
//!
//! Every configured check runs to completion, concurrently. Results keep the
//! configured order, and all failing diagnostics are concatenated into one
//! message the actor feeds back to the model. Nothing here short-circuits:
//! a check that cannot even run is reported as a failure with its error chain.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use minijinja::context;
use tracing::{debug, instrument, warn};

use crate::core::tags::extract_tag;
use crate::core::types::{CompletionRequest, ContentBlock, Message};
use crate::io::config::{CheckSpec, ValidationConfig};
use crate::io::model::ModelClient;
use crate::io::prompt::{Prompt, PromptRegistry};
use crate::io::sandbox::{Artifact, Sandbox};

/// One automated check. `Ok(None)` is a pass, `Ok(Some(text))` a failure diagnostic.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, sandbox: &Sandbox) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub diagnostic: Option<String>,
}

/// Per-check results in configured order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    pub outcomes: Vec<CheckOutcome>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn get(&self, name: &str) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Concatenation of every failing check's diagnostic, or `None` when all passed.
    pub fn failure(&self) -> Option<String> {
        let sections: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| !o.passed)
            .map(|o| {
                format!(
                    "## {} failed\n{}",
                    o.name,
                    o.diagnostic.as_deref().unwrap_or("").trim_end()
                )
            })
            .collect();
        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }
}

#[derive(Clone, Default)]
pub struct ValidationPipeline {
    checks: Vec<Arc<dyn Check>>,
}

impl std::fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("checks", &self.names())
            .finish()
    }
}

impl ValidationPipeline {
    pub fn new(checks: Vec<Arc<dyn Check>>) -> Self {
        Self { checks }
    }

    pub fn names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    #[instrument(skip_all, fields(checks = self.checks.len()))]
    pub async fn run(&self, sandbox: &Sandbox) -> ValidationResult {
        let runs = self.checks.iter().map(|check| async move {
            let result = check.run(sandbox).await;
            (check.name().to_string(), result)
        });
        let outcomes = join_all(runs)
            .await
            .into_iter()
            .map(|(name, result)| match result {
                Ok(None) => CheckOutcome {
                    name,
                    passed: true,
                    diagnostic: None,
                },
                Ok(Some(diagnostic)) => CheckOutcome {
                    name,
                    passed: false,
                    diagnostic: Some(diagnostic),
                },
                Err(err) => {
                    warn!(check = %name, err = %format!("{err:#}"), "check could not run");
                    CheckOutcome {
                        diagnostic: Some(format!("{name} could not run: {err:#}")),
                        name,
                        passed: false,
                    }
                }
            })
            .collect();
        let result = ValidationResult { outcomes };
        debug!(passed = result.passed(), "validation finished");
        result
    }
}

/// Passes iff the command exits 0.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    argv: Vec<String>,
    service: bool,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, argv: Vec<String>, service: bool) -> Self {
        Self {
            name: name.into(),
            argv,
            service,
        }
    }
}

#[async_trait]
impl Check for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, sandbox: &Sandbox) -> Result<Option<String>> {
        let output = if self.service {
            sandbox.exec_with_ephemeral_service(&self.argv, None).await?
        } else {
            sandbox.exec(&self.argv, None).await?
        };
        if output.success() {
            return Ok(None);
        }
        Ok(Some(output.report(&self.name)))
    }
}

/// Model and prompts used by visual checks.
#[derive(Clone)]
pub struct VisionModel {
    pub client: Arc<dyn ModelClient>,
    pub prompts: Arc<PromptRegistry>,
    pub max_tokens: u32,
}

/// Renders screenshots and asks a vision model whether they meet an expectation.
pub struct VisualCheck {
    name: String,
    render: Vec<String>,
    artifacts_dir: String,
    expectation: String,
    service: bool,
    vision: VisionModel,
}

impl VisualCheck {
    pub fn new(
        name: impl Into<String>,
        render: Vec<String>,
        artifacts_dir: impl Into<String>,
        expectation: impl Into<String>,
        service: bool,
        vision: VisionModel,
    ) -> Self {
        Self {
            name: name.into(),
            render,
            artifacts_dir: artifacts_dir.into(),
            expectation: expectation.into(),
            service,
            vision,
        }
    }

    fn request(&self, artifacts: &[Artifact]) -> Result<CompletionRequest> {
        let mut content: Vec<ContentBlock> = artifacts
            .iter()
            .filter_map(|artifact| {
                media_type(&artifact.path).map(|media_type| ContentBlock::Image {
                    media_type: media_type.to_string(),
                    data: STANDARD.encode(&artifact.bytes),
                })
            })
            .collect();
        if content.is_empty() {
            return Err(anyhow!("no images under {}", self.artifacts_dir));
        }
        let prompt = self
            .vision
            .prompts
            .render(Prompt::Visual, context! { expectation => self.expectation })?;
        content.push(ContentBlock::text(prompt));
        Ok(CompletionRequest {
            messages: vec![Message::user(content)],
            max_tokens: self.vision.max_tokens,
            system_prompt: None,
            tools: Vec::new(),
            temperature: 0.0,
        })
    }
}

#[async_trait]
impl Check for VisualCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, sandbox: &Sandbox) -> Result<Option<String>> {
        let (output, artifacts) = sandbox
            .exec_with_artifacts(&self.render, &self.artifacts_dir, self.service)
            .await?;
        if !output.success() {
            return Ok(Some(output.report(&self.name)));
        }
        let request = match self.request(&artifacts) {
            Ok(request) => request,
            Err(err) => return Ok(Some(format!("{}: {err}", self.name))),
        };
        let reply = self.vision.client.complete(&request).await?.into_message();
        Ok(parse_verdict(&reply.text()))
    }
}

/// `None` iff the verdict tag says "yes"; otherwise the rationale (or the raw reply).
pub fn parse_verdict(text: &str) -> Option<String> {
    let verdict = extract_tag(text, "verdict");
    if verdict
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("yes"))
    {
        return None;
    }
    let reason = extract_tag(text, "reason").filter(|r| !r.is_empty());
    Some(match (verdict, reason) {
        (Some(_), Some(reason)) => reason,
        (Some(verdict), None) => format!("visual verdict was '{verdict}' without a reason"),
        (None, _) => format!("could not parse a visual verdict from: {}", text.trim()),
    })
}

fn media_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Build the pipeline for one stage's check set, substituting `{unit}` when given.
pub fn build_pipeline(
    config: &ValidationConfig,
    set: &[String],
    unit: Option<&str>,
    vision: &VisionModel,
) -> Result<ValidationPipeline> {
    let substitute = |argv: &[String]| -> Vec<String> {
        argv.iter()
            .map(|arg| match unit {
                Some(unit) => arg.replace("{unit}", unit),
                None => arg.clone(),
            })
            .collect()
    };
    let mut checks: Vec<Arc<dyn Check>> = Vec::with_capacity(set.len());
    for name in set {
        let spec = config
            .checks
            .get(name)
            .ok_or_else(|| anyhow!("unknown check '{name}'"))?;
        let check: Arc<dyn Check> = match spec {
            CheckSpec::Command { command, service } => {
                Arc::new(CommandCheck::new(name.clone(), substitute(command), *service))
            }
            CheckSpec::Visual {
                render,
                artifacts_dir,
                expectation,
                service,
            } => Arc::new(VisualCheck::new(
                name.clone(),
                substitute(render),
                artifacts_dir.clone(),
                expectation.clone(),
                *service,
                vision.clone(),
            )),
        };
        checks.push(check);
    }
    Ok(ValidationPipeline::new(checks))
}
