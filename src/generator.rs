//! The opaque code-generation step and its subprocess-backed implementation.
//!
//! The worker depends only on the `GeneratorStep` capability: hand over an
//! input payload, get back free-text output. The real implementation spawns
//! an agent command and services its pull-request tool protocol, so branch
//! creation, patch application, and PR opening happen as internal side
//! effects of the one blocking call.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use std::collections::VecDeque;

use crate::github::{RepoHost, parse_owner_repo_from_url};
use crate::models::{GeneratorInput, PullRequestSpec};
use crate::patch;

const STDERR_TAIL_LINES: usize = 5;

/// Capability interface for the natural-language-to-code step.
/// Deterministic fakes implement this in tests.
#[async_trait]
pub trait GeneratorStep: Send + Sync {
    /// Run the generation step to completion and return its free-text output.
    /// May take arbitrarily long; the worker imposes no timeout.
    async fn run(&self, input: &GeneratorInput) -> Result<String>;
}

/// Generation step backed by an external agent process.
///
/// The input payload is written to the agent's stdin as JSON. Stdout is read
/// line by line: a JSON line tagged `"type": "pull_request"` is a tool call
/// executed through the patch module, and its outcome is appended to the
/// transcript as a `PR created:` (or failure) line; every other line is
/// transcript text.
pub struct AgentGenerator {
    command: Vec<String>,
    host: Arc<dyn RepoHost>,
}

#[derive(serde::Deserialize)]
struct ToolLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    rest: serde_json::Value,
}

impl AgentGenerator {
    /// `command` is split on whitespace into program and arguments; shell
    /// quoting is not interpreted. Invocations that need quoting or shell
    /// syntax belong in a script the command points at.
    pub fn new(command: &str, host: Arc<dyn RepoHost>) -> Self {
        Self {
            command: command.split_whitespace().map(str::to_string).collect(),
            host,
        }
    }

    fn parse_tool_line(line: &str) -> Option<PullRequestSpec> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let tool: ToolLine = serde_json::from_str(trimmed).ok()?;
        if tool.kind != "pull_request" {
            return None;
        }
        serde_json::from_value(tool.rest).ok()
    }

    async fn handle_tool_call(&self, input: &GeneratorInput, spec: &PullRequestSpec) -> String {
        let Some(owner_repo) = parse_owner_repo_from_url(&input.repository_reference) else {
            return format!(
                "Failed to create PR: no usable repository reference in '{}'",
                input.repository_reference
            );
        };
        match patch::publish_pull_request(self.host.as_ref(), &owner_repo, spec).await {
            Ok(url) => format!("PR created: {}", url),
            Err(e) => format!("Failed to create PR: {}", e),
        }
    }
}

#[async_trait]
impl GeneratorStep for AgentGenerator {
    async fn run(&self, input: &GeneratorInput) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .context("Agent command is empty")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{}'", program))?;

        let payload =
            serde_json::to_vec(input).context("Failed to encode generation-step input")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write input to agent stdin")?;
            // Closing stdin signals end of input to the agent.
            drop(stdin);
        }

        let stdout = child
            .stdout
            .take()
            .context("Agent process has no stdout")?;
        let stderr = child
            .stderr
            .take()
            .context("Agent process has no stderr")?;

        // Drain stderr concurrently so a chatty agent cannot fill the pipe
        // and stall the stdout stream; keep only the tail for diagnostics.
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join(" | ")
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut transcript: Vec<String> = Vec::new();

        while let Some(line) = lines.next_line().await.context("Failed to read agent output")? {
            match Self::parse_tool_line(&line) {
                Some(spec) => {
                    debug!(title = %spec.title, "agent requested pull-request publication");
                    transcript.push(self.handle_tool_call(input, &spec).await);
                }
                None => transcript.push(line),
            }
        }

        let status = child
            .wait()
            .await
            .context("Failed to wait for agent process")?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            warn!(status = ?status.code(), "agent process failed");
            anyhow::bail!("Agent process exited with {}: {}", status, stderr_tail.trim());
        }

        Ok(transcript.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRepoHost;
    use std::path::PathBuf;
    use std::time::Duration;

    fn input() -> GeneratorInput {
        GeneratorInput {
            title: "Update navbar CTA label".to_string(),
            description: "Update navbar CTA label".to_string(),
            user_requirements: String::new(),
            priority: "medium".to_string(),
            additional_context: String::new(),
            repository_reference: "https://github.com/acme/site".to_string(),
        }
    }

    fn script_generator(script: &str) -> (AgentGenerator, PathBuf) {
        let path = std::env::temp_dir().join(format!("agent-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&path, script).unwrap();
        let generator = AgentGenerator::new(
            &format!("sh {}", path.display()),
            Arc::new(MemoryRepoHost::new("main")),
        );
        (generator, path)
    }

    #[tokio::test]
    async fn test_run_is_not_stalled_by_heavy_stderr_output() {
        // Well over the pipe buffer on stderr before anything lands on
        // stdout; the run must still drain stdout to completion.
        let (generator, path) = script_generator(
            "cat > /dev/null\n\
             i=0\n\
             while [ $i -lt 3000 ]; do echo \"diagnostic noise line $i\" 1>&2; i=$((i+1)); done\n\
             echo \"PR created: https://github.com/acme/site/pull/7\"\n",
        );

        let result = tokio::time::timeout(Duration::from_secs(10), generator.run(&input())).await;
        let _ = std::fs::remove_file(&path);

        let transcript = result.expect("agent output was not drained").unwrap();
        assert!(transcript.contains("PR created: https://github.com/acme/site/pull/7"));
    }

    #[tokio::test]
    async fn test_run_reports_exit_status_with_stderr_tail() {
        let (generator, path) = script_generator(
            "cat > /dev/null\n\
             echo \"first diagnostic\" 1>&2\n\
             echo \"agent gave up\" 1>&2\n\
             exit 3\n",
        );

        let result = generator.run(&input()).await;
        let _ = std::fs::remove_file(&path);

        let err = result.unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("exited"));
        assert!(text.contains("agent gave up"));
    }

    #[test]
    fn test_parse_tool_line_accepts_pull_request_tag() {
        let line = r#"{"type": "pull_request", "title": "Fix footer", "replacements": [
            {"path": "app.tsx", "find_text": "Foo", "replace_text": "Bar"}
        ]}"#;
        let spec = AgentGenerator::parse_tool_line(&line.replace('\n', " ")).unwrap();
        assert_eq!(spec.title, "Fix footer");
        assert_eq!(spec.replacements.len(), 1);
        assert!(spec.changes.is_empty());
    }

    #[test]
    fn test_parse_tool_line_ignores_other_shapes() {
        assert!(AgentGenerator::parse_tool_line("plain text").is_none());
        assert!(AgentGenerator::parse_tool_line(r#"{"type": "thinking"}"#).is_none());
        assert!(AgentGenerator::parse_tool_line(r#"{"no_type": true}"#).is_none());
        assert!(AgentGenerator::parse_tool_line("{not json").is_none());
    }
}
