//! External process execution.
//!
//! A [`CommandRunner`] runs one program to completion, honouring a timeout
//! and a cancellation token. [`ProcessRunner`] (behind the `native` feature)
//! spawns real processes in their own process group so that a timeout or
//! cancellation kills every descendant, not just the direct child.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CouncilResult;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program plus arguments, for logs and error messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text handed back to the model
    pub fn render(&self) -> String {
        if self.success() {
            return self.stdout.clone();
        }
        if self.stderr.is_empty() {
            format!("Exit code: {}\n{}", self.exit_code, self.stdout)
        } else {
            format!(
                "Exit code: {}\nstderr: {}\nstdout: {}",
                self.exit_code, self.stderr, self.stdout
            )
        }
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Timeouts and cancellation kill the process tree
    /// and surface as errors.
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> CouncilResult<ExecOutput>;
}

// ─── MockRunner for testing ─────────────────────────────────────────────────

/// Runner with canned outputs that records every request it sees
#[derive(Default)]
pub struct MockRunner {
    responses: Mutex<Vec<ExecOutput>>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl MockRunner {
    pub fn new(responses: Vec<ExecOutput>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::new(vec![ExecOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }])
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        request: &CommandRequest,
        _cancel: &CancellationToken,
    ) -> CouncilResult<ExecOutput> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| (!r.is_empty()).then(|| r.remove(0)));
        Ok(next.unwrap_or_else(|| ExecOutput {
            stdout: String::new(),
            stderr: "No more mock responses".into(),
            exit_code: 1,
        }))
    }
}

// ─── ProcessRunner (behind `native` feature) ───────────────────────────────

#[cfg(feature = "native")]
mod native;

#[cfg(feature = "native")]
pub use native::ProcessRunner;
