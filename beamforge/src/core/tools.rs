//! The closed set of tools the model may invoke.
//!
//! Tool calls arrive as name + JSON input. They are validated against the same
//! JSON Schema advertised to the model, then decoded into [`Tool`] so dispatch
//! is an exhaustive `match` rather than string lookup.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::core::types::{ToolDefinition, ToolUse};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "input", rename_all = "snake_case")]
pub enum Tool {
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    EditFile {
        path: String,
        search: String,
        replace: String,
    },
    DeleteFile { path: String },
    InstallDependency { packages: Vec<String> },
    Complete {},
}

/// Recoverable tool failure, reported back to the model as an error result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid input for '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0} is not writable")]
    Permission(String),
    #[error("invalid path {0:?}: paths must be relative and stay inside the workspace")]
    InvalidPath(String),
    #[error("search text must occur exactly once in {path}, found {count} occurrences")]
    OccurrenceMismatch { path: String, count: usize },
    #[error("cannot complete: no files have been modified")]
    NoModifications,
    #[error("command failed: {0}")]
    CommandFailed(String),
}

const TOOL_NAMES: [&str; 6] = [
    "read_file",
    "write_file",
    "edit_file",
    "delete_file",
    "install_dependency",
    "complete",
];

impl Tool {
    /// Validate and decode a tool invocation.
    pub fn parse(tool_use: &ToolUse) -> Result<Self, ToolError> {
        let schema = input_schema(&tool_use.name)
            .ok_or_else(|| ToolError::UnknownTool(tool_use.name.clone()))?;
        let input = if tool_use.input.is_null() {
            json!({})
        } else {
            tool_use.input.clone()
        };
        validate_input(&schema, &input).map_err(|err| ToolError::InvalidInput {
            tool: tool_use.name.clone(),
            reason: err.to_string(),
        })?;
        serde_json::from_value(json!({ "name": tool_use.name, "input": input })).map_err(|err| {
            ToolError::InvalidInput {
                tool: tool_use.name.clone(),
                reason: err.to_string(),
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::EditFile { .. } => "edit_file",
            Self::DeleteFile { .. } => "delete_file",
            Self::InstallDependency { .. } => "install_dependency",
            Self::Complete {} => "complete",
        }
    }
}

fn validate_input(schema: &Value, input: &Value) -> Result<()> {
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid tool schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(input)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(messages.join("; ")));
    }
    Ok(())
}

fn input_schema(name: &str) -> Option<Value> {
    let string = json!({ "type": "string" });
    let schema = match name {
        "read_file" | "delete_file" => json!({
            "type": "object",
            "properties": { "path": string },
            "required": ["path"],
        }),
        "write_file" => json!({
            "type": "object",
            "properties": { "path": string, "content": string },
            "required": ["path", "content"],
        }),
        "edit_file" => json!({
            "type": "object",
            "properties": { "path": string, "search": string, "replace": string },
            "required": ["path", "search", "replace"],
        }),
        "install_dependency" => json!({
            "type": "object",
            "properties": {
                "packages": { "type": "array", "items": string, "minItems": 1 }
            },
            "required": ["packages"],
        }),
        "complete" => json!({ "type": "object", "properties": {} }),
        _ => return None,
    };
    Some(schema)
}

fn description(name: &str) -> &'static str {
    match name {
        "read_file" => "Read a file from the workspace.",
        "write_file" => "Create or overwrite a file with the given content.",
        "edit_file" => {
            "Replace `search` with `replace` in a file. `search` must occur exactly once."
        }
        "delete_file" => "Delete a file from the workspace.",
        "install_dependency" => "Install one or more packages with the project's package manager.",
        "complete" => "Finish the task. Runs all validation checks on the current workspace.",
        _ => "",
    }
}

/// Tool definitions advertised to the model, in stable order.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    TOOL_NAMES
        .iter()
        .filter_map(|name| {
            input_schema(name).map(|input_schema| ToolDefinition {
                name: (*name).to_string(),
                description: description(name).to_string(),
                input_schema,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, input: Value) -> ToolUse {
        ToolUse {
            id: "t1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn parses_known_tools() {
        let tool = Tool::parse(&call(
            "edit_file",
            json!({"path": "a.ts", "search": "x", "replace": "y"}),
        ))
        .expect("parse");
        assert_eq!(
            tool,
            Tool::EditFile {
                path: "a.ts".to_string(),
                search: "x".to_string(),
                replace: "y".to_string(),
            }
        );
        assert_eq!(
            Tool::parse(&call("complete", Value::Null)).expect("complete"),
            Tool::Complete {}
        );
    }

    #[test]
    fn unknown_tool_is_rejected() {
        assert_eq!(
            Tool::parse(&call("run_shell", json!({}))),
            Err(ToolError::UnknownTool("run_shell".to_string()))
        );
    }

    #[test]
    fn schema_violation_names_the_tool() {
        let err = Tool::parse(&call("write_file", json!({"path": "a.ts"}))).expect_err("invalid");
        match err {
            ToolError::InvalidInput { tool, reason } => {
                assert_eq!(tool, "write_file");
                assert!(reason.contains("content"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn definitions_cover_every_tool() {
        let names: Vec<_> = tool_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, TOOL_NAMES.to_vec());
    }

    #[test]
    fn permission_error_mentions_permission() {
        assert!(
            ToolError::Permission("protected/x".to_string())
                .to_string()
                .contains("permission")
        );
    }
}
