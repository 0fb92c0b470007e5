//! Tool dispatch. Each tool owns the schema of its arguments; the registry
//! only routes calls by name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::models::ToolCall;
use crate::models::ToolOutput;
use crate::protocol::SandboxPolicy;
use crate::tool_spec::ToolSpec;

mod read_file;
mod shell;

pub use read_file::ReadFileTool;
pub use shell::ShellTool;

/// Per-turn state a tool may consult.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Relative paths and commands are resolved against this directory.
    pub cwd: PathBuf,
    pub sandbox_policy: SandboxPolicy,
    /// Fires when the turn is cancelled. Long-running tools must observe it.
    pub cancel: CancellationToken,
    /// Used by tools that take a timeout when the call does not give one.
    pub default_timeout: Duration,
}

/// A single named tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;
}

/// Anything that can run a tool call by name, e.g. a bridge to remote tools.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError>;

    /// Tools this executor answers for, as shown to the model.
    fn specs(&self) -> Vec<ToolSpec> {
        Vec::new()
    }
}

/// Name to handler map, plus an optional executor for every other name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
    fallback: Option<Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `shell` and `read_file` tools.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTool));
        registry.register(Arc::new(ReadFileTool));
        registry
    }

    /// Replaces any handler previously registered under the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.spec().name;
        self.handlers.insert(name, handler);
    }

    pub fn set_fallback(&mut self, executor: Arc<dyn ToolExecutor>) {
        self.fallback = Some(executor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        if let Some(handler) = self.handlers.get(&call.tool_name) {
            return handler.handle(call, ctx).await;
        }
        match &self.fallback {
            Some(fallback) => fallback.execute(call, ctx).await,
            None => Err(ToolError::Unsupported(call.tool_name.clone())),
        }
    }

    fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.handlers.values().map(|h| h.spec()).collect();
        if let Some(fallback) = &self.fallback {
            specs.extend(fallback.specs());
        }
        specs
    }
}

/// Deserializes the call's arguments into a tool's own parameter type.
/// Models sometimes send the arguments object as a JSON-encoded string;
/// both forms are accepted.
pub fn parse_arguments<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolError> {
    let result = match &call.arguments {
        serde_json::Value::String(raw) => serde_json::from_str(raw),
        value => serde_json::from_value(value.clone()),
    };
    result.map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::models::ReadFileParams;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext {
            cwd: std::env::temp_dir(),
            sandbox_policy: SandboxPolicy::default(),
            cancel: CancellationToken::new(),
            default_timeout: Duration::from_secs(1),
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            tool_name: name.to_string(),
            arguments,
            call_id: "1-0".to_string(),
        }
    }

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(
            &self,
            call: &ToolCall,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput {
                content: format!("remote {}", call.tool_name),
                success: true,
            })
        }
    }

    #[tokio::test]
    async fn unknown_tool_without_fallback_is_unsupported() {
        let registry = ToolRegistry::with_builtin_tools();
        let err = registry
            .execute(&call("frobnicate", json!({})), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported call: frobnicate");
    }

    #[tokio::test]
    async fn unknown_tool_goes_to_fallback() {
        let mut registry = ToolRegistry::with_builtin_tools();
        registry.set_fallback(Arc::new(Echo));
        let out = registry
            .execute(&call("mcp__search", json!({})), &ctx())
            .await
            .unwrap();
        assert_eq!(out.content, "remote mcp__search");
    }

    #[test]
    fn builtin_specs_are_listed_by_name() {
        let registry = ToolRegistry::with_builtin_tools();
        let names: Vec<String> = registry.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["read_file".to_string(), "shell".to_string()]);
        assert!(registry.contains("shell"));
    }

    #[test]
    fn arguments_may_be_an_encoded_string() {
        let params: ReadFileParams =
            parse_arguments(&call("read_file", json!("{\"path\": \"a.txt\"}"))).unwrap();
        assert_eq!(params.path, "a.txt");

        let err = parse_arguments::<ReadFileParams>(&call("read_file", json!({"nope": 1})))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
