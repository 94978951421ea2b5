//! Contract with the external processing pipeline.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use common::config::PipelineConfig;
use tokio::process::Command;

use crate::error::ProcessingFailure;
use crate::owner::OwnerRecord;

/// Characters of stderr kept in a failure message.
const STDERR_TAIL_CHARS: usize = 500;

/// Speech-to-text, diarization and summarization for one uploaded object.
///
/// On success the pipeline has written the downstream job record for `path`.
/// Failures are returned, never raised: they feed the retry ledger.
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    async fn process(&self, path: &str, owner: &OwnerRecord) -> Result<(), ProcessingFailure>;
}

/// Runs `command [args..] <path> <owner identity>` and waits for it.
///
/// Exit status 0 is success. The owner's numeric id is exported as
/// `INTAKE_OWNER_ID`. The child is killed when the timeout expires.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl ProcessingPipeline for CommandPipeline {
    async fn process(&self, path: &str, owner: &OwnerRecord) -> Result<(), ProcessingFailure> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(path)
            .arg(&owner.identity)
            .env("INTAKE_OWNER_ID", owner.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessingFailure::pipeline("spawn", format!("{}: {e}", self.command))
            })?;

        tracing::debug!(path = %path, command = %self.command, "Pipeline started");

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProcessingFailure::pipeline("wait", e.to_string())),
            Err(_) => return Err(ProcessingFailure::Timeout(self.timeout)),
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_chars(stderr.trim(), STDERR_TAIL_CHARS);
        let message = if tail.is_empty() {
            format!("exited with {}", output.status)
        } else {
            format!("exited with {}: {tail}", output.status)
        };
        Err(ProcessingFailure::pipeline("command", message))
    }
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn owner() -> OwnerRecord {
        OwnerRecord {
            id: 7,
            identity: "alice".to_string(),
        }
    }

    fn shell(script: &str, timeout: Duration) -> CommandPipeline {
        CommandPipeline::new(&PipelineConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "pipeline".to_string()],
            timeout,
        })
    }

    #[tokio::test]
    async fn test_zero_exit_is_success_and_receives_arguments() {
        let pipeline = shell(
            r#"[ "$1" = "uploads/alice/1.wav" ] && [ "$2" = "alice" ] && [ "$INTAKE_OWNER_ID" = "7" ]"#,
            Duration::from_secs(10),
        );
        pipeline
            .process("uploads/alice/1.wav", &owner())
            .await
            .expect("pipeline should succeed");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let pipeline = shell("echo 'diarization model missing' >&2; exit 3", Duration::from_secs(10));

        let failure = pipeline
            .process("uploads/alice/1.wav", &owner())
            .await
            .unwrap_err();
        match failure {
            ProcessingFailure::Pipeline { stage, message } => {
                assert_eq!(stage, "command");
                assert!(message.contains("diarization model missing"), "{message}");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let pipeline = shell("sleep 5", Duration::from_millis(100));

        let failure = pipeline
            .process("uploads/alice/1.wav", &owner())
            .await
            .unwrap_err();
        assert_eq!(failure, ProcessingFailure::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_spawn_failure() {
        let pipeline = CommandPipeline::new(&PipelineConfig {
            command: "/nonexistent/intake-pipeline".to_string(),
            args: vec![],
            timeout: Duration::from_secs(1),
        });

        let failure = pipeline
            .process("uploads/alice/1.wav", &owner())
            .await
            .unwrap_err();
        assert!(matches!(failure, ProcessingFailure::Pipeline { ref stage, .. } if stage == "spawn"));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 3), "abc");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }
}
