//! Tool registry, invocation validation, and structured results.
//!
//! Tools are advertised to the model via JSON Schema and executed locally by
//! the exchange loop. Each execution produces a [`StructuredToolResult`]: a
//! tagged, renderer-independent payload that is fed back to the model as
//! text and persisted in the conversation record keyed by call id.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::model::{ContentBlock, TextContent, now_millis};
use crate::provider::ToolDef;
use async_trait::async_trait;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Maximum description length providers accept for tool advertisement.
pub const MAX_TOOL_DESCRIPTION_LEN: usize = 1024;

// ============================================================================
// Tool Trait
// ============================================================================

/// A single tool call as requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub input: Value,
}

/// A tool that can be executed by the exchange loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Provider-safe identifier.
    fn name(&self) -> &str;

    /// Description advertised to the model.
    fn description(&self) -> &str;

    /// JSON Schema fragment for the tool input.
    fn input_schema(&self) -> Value;

    /// Tag used on tracing spans for this tool's executions.
    fn tracing_tag(&self) -> &str {
        self.name()
    }

    /// Whether this tool may run concurrently with other tool calls from
    /// the same assistant turn.
    fn concurrency_safe(&self) -> bool {
        false
    }

    /// Whether this tool spawns a background process that outlives the call.
    fn spawns_background(&self) -> bool {
        false
    }

    /// Validate an invocation's input against the declared schema.
    ///
    /// Implementations typically deserialize their typed input struct here
    /// so errors carry field-level detail. The default only requires a JSON
    /// object.
    fn validate(&self, input: &Value) -> Result<()> {
        if input.is_object() {
            Ok(())
        } else {
            Err(Error::invalid_tool_input(
                self.name(),
                "input must be a JSON object",
            ))
        }
    }

    /// Execute the tool. Long-running tools must observe `cancel` between
    /// I/O suspension points.
    async fn execute(
        &self,
        invocation: &ToolInvocation,
        state: &ToolState,
        cancel: &CancelToken,
    ) -> StructuredToolResult;
}

// ============================================================================
// Structured Results
// ============================================================================

/// A tool's execution result with structured, tool-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ToolResultData>,
}

/// Tool-specific structured payload, tagged by tool kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultData {
    FileRead {
        path: String,
        #[serde(default)]
        offset: usize,
        lines: Vec<String>,
        truncated: bool,
        total_lines: usize,
    },
    FileWrite {
        path: String,
        bytes: u64,
    },
    FileEdit {
        path: String,
        replacements: usize,
    },
    Shell {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
        #[serde(default)]
        cancelled: bool,
    },
    Grep {
        pattern: String,
        matches: Vec<GrepMatch>,
        truncated: bool,
    },
    Glob {
        pattern: String,
        paths: Vec<String>,
        truncated: bool,
    },
    Subagent {
        prompt: String,
        response: String,
        usage: crate::model::Usage,
    },
    WebFetch {
        url: String,
        status: u16,
        content_type: String,
        bytes: u64,
    },
    Todo {
        items: Vec<TodoItem>,
    },
    Background {
        pid: u32,
        command: String,
        log_path: String,
    },
    /// A lifecycle hook refused the call.
    Blocked {
        reason: String,
    },
    /// Forward-compatible payload for tool kinds this build does not know.
    Other {
        #[serde(default)]
        value: Value,
    },
}

/// One grep match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrepMatch {
    pub path: String,
    pub line: usize,
    pub column: usize,
    pub text: String,
}

/// One todo-list item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub text: String,
    pub done: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStructuredToolResult {
    tool_name: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
    timestamp: i64,
    #[serde(default)]
    data: Option<Value>,
}

// Unknown data tags degrade to `Other` instead of failing the record load,
// so records written by newer builds stay readable.
impl<'de> Deserialize<'de> for StructuredToolResult {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawStructuredToolResult::deserialize(deserializer)?;
        let data = match raw.data {
            None => None,
            Some(Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<ToolResultData>(value.clone())
                    .unwrap_or(ToolResultData::Other { value }),
            ),
        };
        if raw.tool_name.is_empty() {
            return Err(D::Error::custom("toolName must not be empty"));
        }
        Ok(Self {
            tool_name: raw.tool_name,
            success: raw.success,
            error: raw.error,
            timestamp: raw.timestamp,
            data,
        })
    }
}

impl StructuredToolResult {
    pub fn success(tool_name: impl Into<String>, data: ToolResultData) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: true,
            error: None,
            timestamp: now_millis(),
            data: Some(data),
        }
    }

    pub fn failure(tool_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            success: false,
            error: Some(error.into()),
            timestamp: now_millis(),
            data: None,
        }
    }

    pub fn blocked(tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            tool_name: tool_name.into(),
            success: false,
            error: Some(format!("blocked by hook: {reason}")),
            timestamp: now_millis(),
            data: Some(ToolResultData::Blocked { reason }),
        }
    }

    pub fn cancelled(tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        Self {
            tool_name: tool_name.clone(),
            success: false,
            error: Some("tool execution cancelled".to_string()),
            timestamp: now_millis(),
            data: Some(ToolResultData::Shell {
                command: String::new(),
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
                cancelled: true,
            }),
        }
    }

    /// Whether this result marks a cancelled execution.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            &self.data,
            Some(ToolResultData::Shell { cancelled: true, .. })
        )
    }

    /// Model-facing text rendering of the result.
    pub fn assistant_facing(&self) -> String {
        let mut out = String::new();
        if let Some(error) = &self.error {
            out.push_str(&format!("<error>\n{error}\n</error>\n"));
        }
        let body = self.render_body();
        if !body.is_empty() || self.error.is_none() {
            let body = if body.is_empty() {
                "(No output)".to_string()
            } else {
                body
            };
            out.push_str(&format!("<result>\n{body}\n</result>\n"));
        }
        out
    }

    fn render_body(&self) -> String {
        match &self.data {
            Some(ToolResultData::FileRead {
                path,
                offset,
                lines,
                truncated,
                total_lines,
            }) => {
                let mut body = format!("{path} ({total_lines} lines");
                if *truncated {
                    body.push_str(", truncated");
                }
                body.push_str(")\n");
                for (i, line) in lines.iter().enumerate() {
                    body.push_str(&format!("{:>6}\t{line}\n", offset + i + 1));
                }
                body
            }
            Some(ToolResultData::FileWrite { path, bytes }) => {
                format!("Wrote {bytes} bytes to {path}")
            }
            Some(ToolResultData::FileEdit { path, replacements }) => {
                format!("Applied {replacements} replacement(s) to {path}")
            }
            Some(ToolResultData::Shell {
                exit_code,
                stdout,
                stderr,
                cancelled,
                ..
            }) => {
                if *cancelled {
                    return "command cancelled".to_string();
                }
                let mut body = String::new();
                if !stdout.is_empty() {
                    body.push_str(stdout);
                }
                if !stderr.is_empty() {
                    body.push_str(&format!("\nstderr:\n{stderr}"));
                }
                if *exit_code != 0 {
                    body.push_str(&format!("\nexit code: {exit_code}"));
                }
                body
            }
            Some(ToolResultData::Grep {
                matches, truncated, ..
            }) => {
                let mut body = matches
                    .iter()
                    .map(|m| format!("{}:{}:{}: {}", m.path, m.line, m.column, m.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                if *truncated {
                    body.push_str("\n(truncated)");
                }
                body
            }
            Some(ToolResultData::Glob {
                paths, truncated, ..
            }) => {
                let mut body = paths.join("\n");
                if *truncated {
                    body.push_str("\n(truncated)");
                }
                body
            }
            Some(ToolResultData::Subagent { response, .. }) => response.clone(),
            Some(ToolResultData::WebFetch {
                url,
                status,
                content_type,
                bytes,
            }) => format!("{url} -> {status} ({content_type}, {bytes} bytes)"),
            Some(ToolResultData::Todo { items }) => items
                .iter()
                .map(|item| format!("[{}] {}", if item.done { "x" } else { " " }, item.text))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(ToolResultData::Background {
                pid,
                command,
                log_path,
            }) => format!("Started background process {pid} ({command}), log: {log_path}"),
            Some(ToolResultData::Blocked { reason }) => {
                format!("Tool execution was blocked: {reason}")
            }
            Some(ToolResultData::Other { value }) => value.to_string(),
            None => String::new(),
        }
    }

    /// Result rendered as message content blocks.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        vec![ContentBlock::Text(TextContent::new(self.assistant_facing()))]
    }
}

// ============================================================================
// Tool Registry
// ============================================================================

/// Registry of tools available to a thread.
///
/// Immutable after thread construction; per-send allow-lists narrow the
/// advertised set via [`ToolRegistry::filtered`].
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Rejects duplicate names, names that are not
    /// provider-safe, and overlong descriptions.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if name.is_empty() || crate::provider::normalize_tool_name(&name) != name {
            return Err(Error::validation(format!(
                "tool name '{name}' is not provider-safe"
            )));
        }
        if self.get(&name).is_some() {
            return Err(Error::validation(format!(
                "tool '{name}' is already registered"
            )));
        }
        if tool.description().len() > MAX_TOOL_DESCRIPTION_LEN {
            return Err(Error::validation(format!(
                "tool '{name}' description exceeds {MAX_TOOL_DESCRIPTION_LEN} characters"
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    /// Find a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// All registered tool names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for provider advertisement.
    pub fn describe_all(&self) -> Vec<ToolDef> {
        self.tools
            .iter()
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.input_schema(),
            })
            .collect()
    }

    /// A registry narrowed to the given allow-list, preserving order.
    pub fn filtered(&self, allowed: &[String]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|tool| allowed.iter().any(|name| name == tool.name()))
                .map(Arc::clone)
                .collect(),
        }
    }

    /// Validate an invocation: the tool must exist and its input must pass
    /// the tool's schema check.
    pub fn validate(&self, name: &str, input: &Value) -> Result<()> {
        let Some(tool) = self.get(name) else {
            return Err(Error::invalid_tool_input(name, "unknown tool"));
        };
        tool.validate(input)
    }
}

// ============================================================================
// Tool State
// ============================================================================

/// A background process recorded by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundProcess {
    pub pid: u32,
    pub command: String,
    pub log_path: String,
    pub started_at: i64,
}

/// Ambient state shared by all tools of a thread.
///
/// Parallel tool calls share one `ToolState`; every mutation goes through a
/// fine-grained lock, so all methods here are safe to call concurrently.
#[derive(Debug, Default)]
pub struct ToolState {
    file_access: Mutex<HashMap<String, i64>>,
    background: Mutex<Vec<BackgroundProcess>>,
    todo_path: Mutex<Option<PathBuf>>,
}

impl ToolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `path` was accessed now.
    pub fn touch_file(&self, path: impl Into<String>) {
        self.file_access
            .lock()
            .expect("file access lock poisoned")
            .insert(path.into(), now_millis());
    }

    pub fn file_last_accessed(&self, path: &str) -> Option<i64> {
        self.file_access
            .lock()
            .expect("file access lock poisoned")
            .get(path)
            .copied()
    }

    /// Snapshot of the file-access table for persistence.
    pub fn file_access_snapshot(&self) -> HashMap<String, i64> {
        self.file_access
            .lock()
            .expect("file access lock poisoned")
            .clone()
    }

    /// Restore the file-access table from a persisted record.
    pub fn restore_file_access(&self, table: HashMap<String, i64>) {
        *self.file_access.lock().expect("file access lock poisoned") = table;
    }

    pub fn add_background_process(&self, process: BackgroundProcess) {
        self.background
            .lock()
            .expect("background lock poisoned")
            .push(process);
    }

    pub fn background_processes(&self) -> Vec<BackgroundProcess> {
        self.background
            .lock()
            .expect("background lock poisoned")
            .clone()
    }

    pub fn remove_background_process(&self, pid: u32) -> bool {
        let mut processes = self.background.lock().expect("background lock poisoned");
        let before = processes.len();
        processes.retain(|p| p.pid != pid);
        processes.len() != before
    }

    pub fn restore_background_processes(&self, processes: Vec<BackgroundProcess>) {
        *self.background.lock().expect("background lock poisoned") = processes;
    }

    pub fn set_todo_path(&self, path: PathBuf) {
        *self.todo_path.lock().expect("todo path lock poisoned") = Some(path);
    }

    pub fn todo_path(&self) -> Option<PathBuf> {
        self.todo_path
            .lock()
            .expect("todo path lock poisoned")
            .clone()
    }
}
