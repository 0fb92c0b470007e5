use std::path::Path;

use async_trait::async_trait;
use stepwise_apply_patch::resolve_path;

use super::ToolContext;
use super::ToolHandler;
use super::parse_arguments;
use crate::error::ToolError;
use crate::models::ReadFileParams;
use crate::models::ToolCall;
use crate::models::ToolOutput;
use crate::tool_spec::ToolSpec;
use crate::tool_spec::create_read_file_tool;

const DEFAULT_LIMIT: usize = 2000;

/// Reads a text file under the working directory. Paths follow the same
/// rules as patch paths: relative, and never above the working directory.
pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        create_read_file_tool()
    }

    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let params: ReadFileParams = parse_arguments(call)?;
        let offset = params.offset.unwrap_or(1);
        if offset == 0 {
            return Err(ToolError::InvalidArguments(
                "offset is a 1-based line number".to_string(),
            ));
        }
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);

        let path = resolve_path(&ctx.cwd, Path::new(&params.path))
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Execution(format!("failed to read {}: {e}", params.path)))?;

        let total = contents.lines().count();
        if total > 0 && offset > total {
            return Err(ToolError::Execution(format!(
                "offset {offset} is past the end of {} ({total} lines)",
                params.path
            )));
        }

        let numbered: Vec<String> = contents
            .lines()
            .enumerate()
            .skip(offset - 1)
            .take(limit)
            .map(|(idx, line)| format!("{:>6}\t{line}", idx + 1))
            .collect();
        Ok(ToolOutput {
            content: numbered.join("\n"),
            success: true,
        })
    }
}
