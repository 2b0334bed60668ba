//! Prompt registry: embedded minijinja templates with optional on-disk overrides.
//!
//! Built once at startup and passed down explicitly; nothing here is global.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;
use tracing::debug;

/// Every prompt the engine renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Prompt {
    System,
    Draft,
    Handler,
    Frontend,
    Review,
    Edit,
    Intake,
    Summary,
    Visual,
    Continue,
}

impl Prompt {
    pub const ALL: [Prompt; 10] = [
        Prompt::System,
        Prompt::Draft,
        Prompt::Handler,
        Prompt::Frontend,
        Prompt::Review,
        Prompt::Edit,
        Prompt::Intake,
        Prompt::Summary,
        Prompt::Visual,
        Prompt::Continue,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Prompt::System => "system",
            Prompt::Draft => "draft",
            Prompt::Handler => "handler",
            Prompt::Frontend => "frontend",
            Prompt::Review => "review",
            Prompt::Edit => "edit",
            Prompt::Intake => "intake",
            Prompt::Summary => "summary",
            Prompt::Visual => "visual",
            Prompt::Continue => "continue",
        }
    }

    fn embedded(self) -> &'static str {
        match self {
            Prompt::System => include_str!("prompts/system.md"),
            Prompt::Draft => include_str!("prompts/draft.md"),
            Prompt::Handler => include_str!("prompts/handler.md"),
            Prompt::Frontend => include_str!("prompts/frontend.md"),
            Prompt::Review => include_str!("prompts/review.md"),
            Prompt::Edit => include_str!("prompts/edit.md"),
            Prompt::Intake => include_str!("prompts/intake.md"),
            Prompt::Summary => include_str!("prompts/summary.md"),
            Prompt::Visual => include_str!("prompts/visual.md"),
            Prompt::Continue => include_str!("prompts/continue.md"),
        }
    }
}

/// A file listed inside a prompt.
#[derive(Debug, Clone, Serialize)]
pub struct PromptFile<'a> {
    pub path: &'a str,
    pub content: &'a str,
}

pub struct PromptRegistry {
    env: Environment<'static>,
    sources: BTreeMap<Prompt, String>,
}

impl std::fmt::Debug for PromptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRegistry")
            .field("prompts", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PromptRegistry {
    /// Registry of the built-in templates.
    pub fn embedded() -> Self {
        Self {
            env: new_environment(),
            sources: Prompt::ALL
                .iter()
                .map(|prompt| (*prompt, prompt.embedded().to_string()))
                .collect(),
        }
    }

    /// Built-in templates, with `<dir>/<name>.md` files taking precedence.
    ///
    /// Every template is compiled up front so syntax errors surface at startup.
    pub fn load(overrides: Option<&Path>) -> Result<Self> {
        let mut registry = Self::embedded();
        if let Some(dir) = overrides {
            for prompt in Prompt::ALL {
                let path = dir.join(format!("{}.md", prompt.name()));
                if !path.exists() {
                    continue;
                }
                let source = fs::read_to_string(&path)
                    .with_context(|| format!("read prompt {}", path.display()))?;
                debug!(prompt = prompt.name(), path = %path.display(), "prompt override loaded");
                registry.sources.insert(prompt, source);
            }
        }
        let checker = new_environment();
        for (prompt, source) in &registry.sources {
            checker
                .template_from_str(source)
                .with_context(|| format!("compile prompt '{}'", prompt.name()))?;
        }
        Ok(registry)
    }

    pub fn render<S: Serialize>(&self, prompt: Prompt, ctx: S) -> Result<String> {
        let source = self
            .sources
            .get(&prompt)
            .map_or_else(|| prompt.embedded(), String::as_str);
        let rendered = self
            .env
            .render_str(source, ctx)
            .with_context(|| format!("render prompt '{}'", prompt.name()))?;
        Ok(rendered.trim().to_string())
    }
}

fn new_environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env
}
