//! Client for the external lab scheduler.
//!
//! The runner never talks to Beaker directly; it shells out to the `bkr`
//! command-line tool. [`LabClient`] is the seam: [`BkrClient`] runs the real
//! tool, tests substitute a scripted implementation.
//!
//! # Protocol
//!
//! | Operation | Command | Output |
//! |-----------|---------|--------|
//! | submit | `bkr job-submit [--job-owner=<owner>] -` (job XML on stdin) | `Submitted: ['J:1']` |
//! | query | `bkr job-results [--no-logs] <taskspec>` | result XML |
//! | cancel | `bkr job-cancel <job>` | ignored |

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BkrConfig;
use crate::model::{JobId, TaskSpec};

/// Result type for lab tool invocations.
pub type LabResult<T> = Result<T, LabError>;

/// Errors raised by the external tool.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    /// The tool could not be started or its pipes failed.
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and reported failure.
    #[error("{command} exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The configured tool command is empty or cannot be split.
    #[error("Invalid lab tool command: {0}")]
    InvalidCommand(String),
}

/// Operations the runner needs from the lab scheduler.
#[async_trait]
pub trait LabClient: Send + Sync {
    /// Submits a job document and returns the tool's raw acknowledgment.
    async fn submit(&self, document: &str) -> LabResult<String>;

    /// Returns the raw XML result tree for a job or recipe set.
    async fn results(&self, taskspec: &TaskSpec) -> LabResult<String>;

    /// Cancels a job.
    async fn cancel(&self, job: &JobId) -> LabResult<()>;
}

/// [`LabClient`] backed by the `bkr` command-line tool.
pub struct BkrClient {
    command: Vec<String>,
    job_owner: Option<String>,
    retries: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl BkrClient {
    /// Creates a client from the `[bkr]` configuration section.
    pub fn new(config: &BkrConfig) -> LabResult<Self> {
        let command = shell_words::split(&config.command)
            .map_err(|e| LabError::InvalidCommand(format!("{}: {}", config.command, e)))?;
        if command.is_empty() {
            return Err(LabError::InvalidCommand(config.command.clone()));
        }

        Ok(Self {
            command,
            job_owner: None,
            retries: config.retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            cancel: CancellationToken::new(),
        })
    }

    /// Submits jobs on behalf of another Beaker user.
    pub fn with_job_owner(mut self, owner: Option<String>) -> Self {
        self.job_owner = owner;
        self
    }

    /// Stops waiting between query retries once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn build(&self, args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    fn describe(&self, args: &[String]) -> String {
        self.command
            .iter()
            .chain(args.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn run(&self, args: &[String], stdin: Option<&str>) -> LabResult<String> {
        let description = self.describe(args);
        debug!("Running {}", description);

        let mut cmd = self.build(args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let spawn_err = |source| LabError::Spawn {
            command: description.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
            // Dropping the pipe closes stdin so the tool sees EOF.
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_err)?;
        if !output.status.success() {
            return Err(LabError::Failed {
                command: description,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl LabClient for BkrClient {
    async fn submit(&self, document: &str) -> LabResult<String> {
        let mut args = vec!["job-submit".to_string()];
        if let Some(owner) = &self.job_owner {
            args.push(format!("--job-owner={}", owner));
        }
        args.push("-".to_string());

        self.run(&args, Some(document)).await
    }

    async fn results(&self, taskspec: &TaskSpec) -> LabResult<String> {
        let args = vec![
            "job-results".to_string(),
            "--no-logs".to_string(),
            taskspec.to_string(),
        ];

        let mut delay = Duration::ZERO;
        let mut attempt = 1;
        loop {
            match self.run(&args, None).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < self.retries => {
                    delay += self.retry_delay;
                    warn!(
                        "Query for {} failed ({}), retrying in {:?}",
                        taskspec, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            warn!("Query for {} abandoned on interrupt", taskspec);
                            return Err(e);
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Giving up on query for {} after {} attempts", taskspec, attempt);
                    return Err(e);
                }
            }
        }
    }

    async fn cancel(&self, job: &JobId) -> LabResult<()> {
        let args = vec!["job-cancel".to_string(), job.to_string()];
        self.run(&args, None).await.map(|_| ())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn client(command: &str) -> BkrClient {
        BkrClient::new(&BkrConfig {
            command: command.to_string(),
            retries: 2,
            retry_delay_secs: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_command() {
        let config = BkrConfig {
            command: "  ".to_string(),
            retries: 1,
            retry_delay_secs: 0,
        };
        assert!(matches!(
            BkrClient::new(&config),
            Err(LabError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_describe_includes_owner_args() {
        let client = client("bkr --insecure").with_job_owner(Some("beaker-gods".into()));
        let description = client.describe(&[
            "job-submit".to_string(),
            "--job-owner=beaker-gods".to_string(),
            "-".to_string(),
        ]);
        assert_eq!(
            description,
            "bkr --insecure job-submit --job-owner=beaker-gods -"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_submit_pipes_document_to_stdin() {
        // Arguments after the script become positional parameters and are ignored.
        let client = BkrClient {
            command: vec!["sh".to_string(), "-c".to_string(), "cat".to_string()],
            job_owner: None,
            retries: 1,
            retry_delay: Duration::ZERO,
            cancel: CancellationToken::new(),
        };
        let output = client.submit("Submitted: ['J:1']").await.unwrap();
        assert_eq!(output, "Submitted: ['J:1']");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_results_reports_failure_after_retries() {
        let client = client("false");
        let spec: TaskSpec = "RS:1".parse().unwrap();
        let err = client.results(&spec).await.unwrap_err();
        assert!(matches!(err, LabError::Failed { status: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_results_retry_wait_stops_on_cancellation() {
        let token = CancellationToken::new();
        let client = BkrClient::new(&BkrConfig {
            command: "false".to_string(),
            retries: 5,
            retry_delay_secs: 30,
        })
        .unwrap()
        .with_cancellation(token.clone());
        token.cancel();

        let spec: TaskSpec = "RS:1".parse().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), client.results(&spec))
            .await
            .expect("retry delay was not interrupted");
        assert!(matches!(result, Err(LabError::Failed { status: 1, .. })));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let client = client("definitely-not-a-real-bkr-binary");
        let err = client.cancel(&JobId::from_number("1")).await.unwrap_err();
        assert!(matches!(err, LabError::Spawn { .. }));
    }
}
