//! Subprocess handlers: execute tasks by spawning configured commands.
//!
//! Keeps handler code out of the worker binary. Each entry in the handlers
//! file names an executable; the worker spawns it once per task, writes the
//! task as JSON to its stdin, and maps the exit status to an outcome:
//! 0 is success, [`PERMANENT_FAILURE_EXIT`] is a failure retries cannot
//! fix, anything else counts as retryable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Task;
use crate::registry::{Handler, HandlerRegistry, TaskFailure};

/// Exit code a command uses to signal a permanent failure.
pub const PERMANENT_FAILURE_EXIT: i32 = 100;

#[derive(Debug, Deserialize)]
struct HandlersConfig {
    #[serde(default)]
    handlers: HashMap<String, CommandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Runs one subprocess per task.
pub struct CommandHandler {
    name: String,
    config: CommandConfig,
}

impl CommandHandler {
    pub fn new(name: impl Into<String>, config: CommandConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn run(&self, task: Task) -> std::result::Result<(), TaskFailure> {
        let payload = serde_json::to_vec(&task)
            .map_err(|e| TaskFailure::permanent(format!("serialize task: {e}")))?;

        // Relative command paths resolve against the process CWD.
        let command = if self.config.command.is_relative() {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(&self.config.command),
                Err(e) => {
                    return Err(TaskFailure::permanent(format!("no working directory: {e}")));
                }
            }
        } else {
            self.config.command.clone()
        };

        debug!(
            handler = self.name,
            command = %command.display(),
            task = %task.id,
            "spawning command"
        );

        let mut child = Command::new(&command)
            .args(&self.config.args)
            .env("TASKGATE_TASK_ID", task.id.0.to_string())
            .env("TASKGATE_QUEUE", &task.queue)
            .env("TASKGATE_HANDLER", &task.handler)
            .env("TASKGATE_RETRY_COUNT", task.retry_count.to_string())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| TaskFailure::permanent(format!("spawn {}: {e}", command.display())))?;

        // A command may exit without reading stdin; the exit status still
        // decides the outcome.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(handler = self.name, "stdin write failed: {e}");
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| TaskFailure::retryable(format!("wait for command: {e}")))?;

        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(PERMANENT_FAILURE_EXIT) => Err(TaskFailure::permanent(format!(
                "command exited with status {PERMANENT_FAILURE_EXIT}"
            ))),
            Some(code) => Err(TaskFailure::retryable(format!(
                "command exited with status {code}"
            ))),
            None => Err(TaskFailure::retryable("command killed by signal")),
        }
    }
}

/// Load the handlers file into a registry of [`CommandHandler`]s.
pub fn load_handlers(path: &Path) -> Result<HandlerRegistry> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read handlers file {}: {e}", path.display()))
    })?;
    let entries = parse_handlers(&content)
        .map_err(|e| Error::Config(format!("bad handlers file {}: {e}", path.display())))?;

    let mut registry = HandlerRegistry::new();
    for (name, config) in entries {
        registry.register(name.clone(), Arc::new(CommandHandler::new(name, config)));
    }
    Ok(registry)
}

fn parse_handlers(content: &str) -> std::result::Result<HashMap<String, CommandConfig>, toml::de::Error> {
    let config: HandlersConfig = toml::from_str(content)?;
    Ok(config.handlers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use chrono::Utc;

    fn shell_handler(script: &str) -> CommandHandler {
        CommandHandler::new(
            "test",
            CommandConfig {
                command: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
            },
        )
    }

    fn probe_task() -> Task {
        Task::for_test(NewTask::new("default", "test"), Utc::now())
    }

    #[tokio::test]
    async fn exit_zero_is_success() {
        let handler = shell_handler("cat > /dev/null; exit 0");
        assert!(handler.run(probe_task()).await.is_ok());
    }

    #[tokio::test]
    async fn exit_one_hundred_is_permanent() {
        let handler = shell_handler("exit 100");
        let err = handler.run(probe_task()).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn other_exit_codes_are_retryable() {
        let handler = shell_handler("exit 7");
        let err = handler.run(probe_task()).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn missing_executable_is_permanent() {
        let handler = CommandHandler::new(
            "test",
            CommandConfig {
                command: PathBuf::from("/nonexistent/taskgate-handler"),
                args: vec![],
            },
        );
        let err = handler.run(probe_task()).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn parses_handler_entries() {
        let entries = parse_handlers(
            r#"
            [handlers.send_email]
            command = "bin/send-email"

            [handlers.resize]
            command = "/usr/local/bin/resize"
            args = ["--format", "webp"]
            "#,
        )
        .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries["resize"].args, vec!["--format", "webp"]);
        assert!(parse_handlers("handlers = 3").is_err());
    }
}
