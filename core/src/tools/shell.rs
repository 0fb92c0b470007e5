use std::io;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::debug;

use super::ToolContext;
use super::ToolHandler;
use super::parse_arguments;
use crate::error::ToolError;
use crate::models::ShellToolCallParams;
use crate::models::ToolCall;
use crate::models::ToolOutput;
use crate::tool_spec::ToolSpec;
use crate::tool_spec::create_shell_tool;

// Maximum we keep for each stream, which is either:
// - 10KiB OR
// - 256 lines
const MAX_STREAM_OUTPUT: usize = 10 * 1024;
const MAX_STREAM_OUTPUT_LINES: usize = 256;

/// Name of the variable carrying the sandbox policy label to the child.
pub const STEPWISE_SANDBOX_ENV_VAR: &str = "STEPWISE_SANDBOX";

/// Runs `command[0]` with `command[1..]` as arguments. There is no shell
/// involved unless the model asks for one explicitly (`bash -lc ...`).
pub struct ShellTool;

#[async_trait]
impl ToolHandler for ShellTool {
    fn spec(&self) -> ToolSpec {
        create_shell_tool()
    }

    async fn handle(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let params: ShellToolCallParams = parse_arguments(call)?;
        let (program, args) = params
            .command
            .split_first()
            .ok_or_else(|| ToolError::InvalidArguments("command args are empty".to_string()))?;
        let cwd = match &params.workdir {
            Some(workdir) => ctx.cwd.join(workdir),
            None => ctx.cwd.clone(),
        };
        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(ctx.default_timeout);

        debug!(command = ?params.command, cwd = %cwd.display(), "exec");
        let start = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .env(STEPWISE_SANDBOX_ENV_VAR, ctx.sandbox_policy.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Execution(format!("failed to spawn {program}: {e}")))?;

        let stdout_reader = child.stdout.take().ok_or_else(|| {
            ToolError::Execution("stdout pipe was unexpectedly not available".to_string())
        })?;
        let stderr_reader = child.stderr.take().ok_or_else(|| {
            ToolError::Execution("stderr pipe was unexpectedly not available".to_string())
        })?;
        let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_reader)));
        let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_reader)));

        let exit_status = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                let _ = child.start_kill();
                return Err(ToolError::Cancelled);
            }
            result = tokio::time::timeout(timeout, child.wait()) => match result {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => return Err(ToolError::Execution(format!("failed to wait for {program}: {e}"))),
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(ToolError::Execution(format!(
                        "command timed out after {} ms",
                        timeout.as_millis()
                    )));
                }
            },
        };
        let duration = start.elapsed();

        let stdout = join_output(stdout_handle.await)?;
        let stderr = join_output(stderr_handle.await)?;
        let exit_code = exit_status.code().unwrap_or(-1);
        let success = exit_code == 0;
        let output = if success || stderr.is_empty() {
            &stdout
        } else {
            &stderr
        };

        Ok(ToolOutput {
            content: format_exec_output(output, exit_code, duration)?,
            success,
        })
    }
}

fn join_output(
    joined: Result<io::Result<Vec<u8>>, tokio::task::JoinError>,
) -> Result<String, ToolError> {
    let bytes = joined
        .map_err(|e| ToolError::Execution(e.to_string()))?
        .map_err(|e| ToolError::Execution(format!("failed to read output: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads to EOF, keeping at most `MAX_STREAM_OUTPUT` bytes and
/// `MAX_STREAM_OUTPUT_LINES` lines.
async fn read_capped<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = MAX_STREAM_OUTPUT;
    let mut remaining_lines = MAX_STREAM_OUTPUT_LINES;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        if remaining_bytes > 0 && remaining_lines > 0 {
            let mut copy_len = 0;
            for &b in &tmp[..n] {
                if remaining_bytes == 0 || remaining_lines == 0 {
                    break;
                }
                copy_len += 1;
                remaining_bytes -= 1;
                if b == b'\n' {
                    remaining_lines -= 1;
                }
            }
            buf.extend_from_slice(&tmp[..copy_len]);
        }
        // Keep draining so the child never blocks on a full pipe.
    }

    Ok(buf)
}

/// Exec output is a pre-serialized JSON payload
fn format_exec_output(output: &str, exit_code: i32, duration: Duration) -> Result<String, ToolError> {
    #[derive(Serialize)]
    struct ExecMetadata {
        exit_code: i32,
        duration_seconds: f32,
    }

    #[derive(Serialize)]
    struct ExecOutput<'a> {
        output: &'a str,
        metadata: ExecMetadata,
    }

    // round to 1 decimal place
    let duration_seconds = ((duration.as_secs_f32()) * 10.0).round() / 10.0;

    let payload = ExecOutput {
        output,
        metadata: ExecMetadata {
            exit_code,
            duration_seconds,
        },
    };

    serde_json::to_string(&payload).map_err(|e| ToolError::Execution(e.to_string()))
}
