//! Test-only helpers: scripted model clients and message builders.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::types::{Completion, CompletionRequest, ContentBlock, StopReason, ToolUse};
use crate::io::config::{CheckSpec, EngineConfig, SearchConfig, ValidationConfig};
use crate::io::model::{ModelClient, ModelError};
use crate::io::prompt::PromptRegistry;
use crate::io::sandbox::{Sandbox, SandboxRuntime};
use crate::stage::StageMachine;
use crate::tree::FileMap;

/// Replays queued completions in call order and records every request.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Completion>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .replies
            .lock()
            .map_err(|_| ModelError::Fatal("script lock poisoned".to_string()))?
            .pop_front();
        next.ok_or_else(|| ModelError::Fatal("scripted model has no replies left".to_string()))
    }
}

type Responder = dyn Fn(&CompletionRequest) -> Result<Completion, ModelError> + Send + Sync;

/// Routes each request through a closure, for concurrent callers whose order is not fixed.
pub struct FnModel {
    respond: Box<Responder>,
    calls: Mutex<usize>,
}

impl FnModel {
    pub fn new(
        respond: impl Fn(&CompletionRequest) -> Result<Completion, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for FnModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ModelError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        (self.respond)(request)
    }
}

/// First user-visible text of a request: the initial prompt of the conversation.
pub fn first_prompt(request: &CompletionRequest) -> String {
    request
        .messages
        .first()
        .map(|m| m.text())
        .unwrap_or_default()
}

/// True once the conversation contains a tool result (the model already acted).
pub fn has_tool_results(request: &CompletionRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.tool_results().next().is_some())
}

pub fn text_reply(text: &str) -> Completion {
    Completion {
        content: vec![ContentBlock::text(text)],
        input_tokens: 10,
        output_tokens: 10,
        stop_reason: StopReason::EndTurn,
    }
}

pub fn tool_reply(calls: Vec<ContentBlock>) -> Completion {
    Completion {
        content: calls,
        input_tokens: 10,
        output_tokens: 10,
        stop_reason: StopReason::ToolUse,
    }
}

pub fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
    ContentBlock::ToolUse(ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}

pub fn write_call(id: &str, path: &str, content: &str) -> ContentBlock {
    tool_use(id, "write_file", json!({ "path": path, "content": content }))
}

pub fn complete_call(id: &str) -> ContentBlock {
    tool_use(id, "complete", json!({}))
}

/// Build a file map from `(path, content)` pairs.
pub fn files(entries: &[(&str, &str)]) -> FileMap {
    entries
        .iter()
        .map(|(path, content)| ((*path).to_string(), (*content).to_string()))
        .collect()
}

/// Host-runtime sandbox over `entries`, with permissive write rules.
pub fn sandbox(entries: &[(&str, &str)]) -> Sandbox {
    Sandbox::new(files(entries), Arc::new(SandboxRuntime::host()))
}

/// Check spec running `sh -c <script>` on the host.
pub fn shell_check(script: &str) -> CheckSpec {
    CheckSpec::Command {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        service: false,
    }
}

/// Config for scripted runs: beam of one, frontend off, and a single passing
/// `ok` check for every stage.
pub fn test_config() -> EngineConfig {
    let ok = vec!["ok".to_string()];
    let mut config = EngineConfig {
        search: SearchConfig {
            beam_width: 1,
            max_depth: 6,
            max_tokens: 512,
            temperature: 0.0,
        },
        validation: ValidationConfig {
            checks: BTreeMap::from([("ok".to_string(), shell_check("true"))]),
            draft: ok.clone(),
            handler: ok.clone(),
            frontend: ok.clone(),
            review: ok.clone(),
            edit: ok,
        },
        ..EngineConfig::default()
    };
    config.layout.frontend_enabled = false;
    config
}

/// Stage machine over host sandboxes with embedded prompts; `model` also serves vision.
pub fn machine(config: EngineConfig, model: Arc<dyn ModelClient>) -> StageMachine {
    StageMachine::new(
        Arc::new(config),
        Arc::new(PromptRegistry::embedded()),
        Arc::clone(&model),
        model,
        Arc::new(SandboxRuntime::host()),
    )
}
