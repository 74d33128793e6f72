//! Native OS command runner using `tokio::process`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CouncilError, CouncilResult};

use super::{CommandRequest, CommandRunner, ExecOutput};

/// Runs commands as real OS processes, each in a fresh process group
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Kill the whole group led by `pid`
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    // SAFETY: plain syscall; a negative pid addresses the process group
    let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        request: &CommandRequest,
        cancel: &CancellationToken,
    ) -> CouncilResult<ExecOutput> {
        let mut cmd = tokio::process::Command::new(&request.program);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id();
        tracing::debug!(command = %request.display(), pid, "process started");

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                kill_group(pid);
                tracing::warn!(command = %request.display(), "process cancelled");
                return Err(CouncilError::Interrupted);
            }
            _ = tokio::time::sleep(request.timeout) => {
                kill_group(pid);
                tracing::warn!(command = %request.display(), timeout = ?request.timeout, "process timed out");
                return Err(anyhow::anyhow!(
                    "command '{}' timed out after {}s",
                    request.display(),
                    request.timeout.as_secs()
                )
                .into());
            }
            output = child.wait_with_output() => output?,
        };

        #[cfg(unix)]
        let exit_code = {
            use std::os::unix::process::ExitStatusExt;
            output
                .status
                .code()
                .unwrap_or_else(|| output.status.signal().map(|s| 128 + s).unwrap_or(1))
        };
        #[cfg(not(unix))]
        let exit_code = output.status.code().unwrap_or(1);

        tracing::debug!(command = %request.display(), exit_code, "process finished");
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = ProcessRunner::new()
            .run(
                &CommandRequest::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_descendants() {
        let started = Instant::now();
        let err = ProcessRunner::new()
            .run(
                &CommandRequest::new("sh")
                    .args(["-c", "sleep 30 & sleep 30; wait"])
                    .timeout(Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_interrupts() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = ProcessRunner::new()
            .run(&CommandRequest::new("sleep").args(["30"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Interrupted));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let err = ProcessRunner::new()
            .run(
                &CommandRequest::new("definitely-not-a-real-program-xyz"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::Io(_)));
    }
}
