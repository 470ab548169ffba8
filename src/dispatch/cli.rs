use std::io::Write;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::LocalScript;
use crate::dispatch::{Adapter, AdapterResult, GENERATION_TIMEOUT, InvocationRequest};
use crate::error::LlmError;
use crate::sink::OutputSink;
use crate::text::{ensure_trailing_newline, escape_shell};

pub const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024; // 8MB

/// Runs the local model script, one child process per invocation.
pub struct CliDispatch<'a> {
    script: &'a LocalScript,
}

impl<'a> CliDispatch<'a> {
    pub fn new(script: &'a LocalScript) -> Self {
        Self { script }
    }

    /// Shell command line for `req`. Model and prompt are separate
    /// double-quoted arguments with their shell metacharacters escaped.
    pub fn command_line(&self, req: &InvocationRequest) -> String {
        format!(
            "\"{}\" \"{}\" --model \"{}\" --prompt \"{}\" 2>&1",
            escape_shell(&self.script.interpreter),
            escape_shell(&self.script.script.to_string_lossy()),
            escape_shell(&req.model),
            escape_shell(&req.prompt),
        )
    }
}

impl Adapter for CliDispatch<'_> {
    /// Output is captured, echoed verbatim to stdout, then returned.
    ///
    /// - kill_on_drop(true) so an abandoned child does not outlive us
    /// - stderr folded into stdout by the command line itself
    /// - output capped at MAX_OUTPUT_BYTES
    async fn invoke(
        &self,
        req: &InvocationRequest,
        sink: &mut dyn OutputSink,
    ) -> Result<AdapterResult, LlmError> {
        if !req.quiet {
            sink.frame(&ensure_trailing_newline(&req.prompt));
        }

        let command_line = self.command_line(req);
        tracing::debug!(
            model = %req.model,
            script = %self.script.script.display(),
            "spawning local model"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::Spawn(format!("sh: {e}")))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::Spawn("stdout was not captured".to_string()))?;

        let read_future = async {
            let mut buf = Vec::with_capacity(64 * 1024);
            let mut capped = stdout_pipe.take(MAX_OUTPUT_BYTES as u64);
            capped.read_to_end(&mut buf).await?;
            // Drop the pipe so a child still writing gets SIGPIPE instead of blocking.
            drop(capped);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((buf, status))
        };

        let (output, status) = tokio::time::timeout(GENERATION_TIMEOUT, read_future)
            .await
            .map_err(|_| {
                LlmError::Spawn(format!("no result after {}s", GENERATION_TIMEOUT.as_secs()))
            })?
            .map_err(|e| LlmError::Spawn(format!("failed to read local model output: {e}")))?;

        let text = String::from_utf8_lossy(&output).to_string();

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            tracing::warn!(code, "local model failed");
            return Err(LlmError::ProcessExit { code, output: text });
        }

        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(&output).and_then(|_| stdout.flush()) {
            tracing::warn!("stdout write failed: {e}");
        }
        drop(stdout);

        if !sink.mirrors_stdout() {
            sink.write(&ensure_trailing_newline(&text));
        }

        Ok(AdapterResult {
            raw: serde_json::Value::String(text.clone()),
            text,
        })
    }
}
