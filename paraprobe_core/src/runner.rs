use crate::work::WorkItem;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval for the child-process wait loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Terminal outcome of one work item after all attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// At least one attempt exited zero.
    Success,
    /// Every attempt completed but exited non-zero.
    Failure,
    /// Every attempt hit the per-attempt timeout.
    Timeout,
    /// The tool could not be spawned at all.
    ToolMissing,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Success => "success",
            InvocationStatus::Failure => "failure",
            InvocationStatus::Timeout => "timeout",
            InvocationStatus::ToolMissing => "tool-missing",
        }
    }
}

/// Captured outcome of running the substitution tool for one work item.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub work_item_id: String,
    pub attempt_count: u32,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    /// False when no process was spawned (dry-run, or spawn failure).
    pub spawned: bool,
    pub status: InvocationStatus,
}

/// Executes one external-tool call for one work item.
///
/// The trait seam exists so the scheduler can be driven by a stub in tests
/// without spawning processes.
pub trait Invoker: Send + Sync {
    fn invoke(&self, item: &WorkItem) -> InvocationResult;
}

/// Configuration for [`ToolInvoker`].
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Resolved path of the substitution tool.
    pub tool: PathBuf,
    /// Per-attempt timeout; each attempt is independently timed.
    pub timeout: Duration,
    /// Additional attempts after the first, so `retries + 1` attempts total.
    pub retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// When set, never spawn; return a synthetic success instead.
    pub dry_run: bool,
}

/// Real `Invoker`: pipes the target URL to the substitution tool's stdin and
/// passes the payload as the tool's argument, enforcing the per-attempt
/// timeout by killing the child.
pub struct ToolInvoker {
    config: InvokerConfig,
}

/// What a single attempt produced, before retry policy is applied.
enum AttemptOutcome {
    Completed {
        exit: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(String),
}

impl ToolInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    fn run_once(&self, item: &WorkItem) -> AttemptOutcome {
        let mut cmd = Command::new(&self.config.tool);
        cmd.arg(&item.payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::SpawnFailed(format!(
                    "failed to spawn {:?}: {e}",
                    self.config.tool
                ));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            // A write error here usually means the tool exited early; the
            // exit status below is the authoritative outcome.
            if let Err(e) = writeln!(stdin, "{}", item.url) {
                debug!(error = %e, "writing target URL to tool stdin failed");
            }
        }

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let waited = wait_with_timeout(&mut child, self.config.timeout);

        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);

        match waited {
            Ok(Some(exit)) => AttemptOutcome::Completed {
                exit,
                stdout,
                stderr,
            },
            Ok(None) => AttemptOutcome::TimedOut,
            Err(e) => AttemptOutcome::SpawnFailed(format!("error waiting for child: {e}")),
        }
    }
}

impl Invoker for ToolInvoker {
    fn invoke(&self, item: &WorkItem) -> InvocationResult {
        let started = Instant::now();

        if self.config.dry_run {
            debug!(url = %item.url, payload = %item.payload, "[dry-run] would invoke tool");
            return InvocationResult {
                work_item_id: item.identity.clone(),
                attempt_count: 0,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                duration: started.elapsed(),
                timed_out: false,
                spawned: false,
                status: InvocationStatus::Success,
            };
        }

        let max_attempts = self.config.retries + 1;
        let mut timeouts = 0u32;
        let mut last_exit: Option<i32> = None;
        let mut last_stdout = String::new();
        let mut last_stderr = String::new();

        for attempt in 1..=max_attempts {
            match self.run_once(item) {
                AttemptOutcome::Completed {
                    exit,
                    stdout,
                    stderr,
                } => {
                    if exit.success() {
                        return InvocationResult {
                            work_item_id: item.identity.clone(),
                            attempt_count: attempt,
                            exit_code: exit.code(),
                            stdout,
                            stderr,
                            duration: started.elapsed(),
                            timed_out: false,
                            spawned: true,
                            status: InvocationStatus::Success,
                        };
                    }
                    warn!(
                        url = %item.url,
                        attempt,
                        max_attempts,
                        exit = ?exit.code(),
                        "tool exited non-zero"
                    );
                    last_exit = exit.code();
                    last_stdout = stdout;
                    last_stderr = stderr;
                }
                AttemptOutcome::TimedOut => {
                    warn!(
                        url = %item.url,
                        attempt,
                        max_attempts,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "tool invocation timed out"
                    );
                    timeouts += 1;
                }
                AttemptOutcome::SpawnFailed(reason) => {
                    warn!(url = %item.url, reason, "tool could not be spawned");
                    return InvocationResult {
                        work_item_id: item.identity.clone(),
                        attempt_count: attempt,
                        exit_code: None,
                        stdout: String::new(),
                        stderr: reason,
                        duration: started.elapsed(),
                        timed_out: false,
                        spawned: false,
                        status: InvocationStatus::ToolMissing,
                    };
                }
            }
            if attempt < max_attempts {
                std::thread::sleep(self.config.retry_delay);
            }
        }

        let all_timed_out = timeouts == max_attempts;
        InvocationResult {
            work_item_id: item.identity.clone(),
            attempt_count: max_attempts,
            exit_code: last_exit,
            stdout: last_stdout,
            stderr: last_stderr,
            duration: started.elapsed(),
            timed_out: all_timed_out,
            spawned: true,
            status: if all_timed_out {
                InvocationStatus::Timeout
            } else {
                InvocationStatus::Failure
            },
        }
    }
}

/// Polls `try_wait` until the child exits or the timeout elapses, killing
/// the child in the latter case. `Ok(None)` means the timeout fired.
pub(crate) fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start.elapsed() > timeout {
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "failed to kill timed-out child");
                    }
                    // Reap so the pipe readers see EOF and we leave no zombie.
                    let _ = child.wait();
                    return Ok(None);
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
        }
    }
}

pub(crate) fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> Option<std::thread::JoinHandle<String>> {
    pipe.map(|mut reader| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

pub(crate) fn join_pipe_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(tool: PathBuf, retries: u32, timeout: Duration) -> InvokerConfig {
        InvokerConfig {
            tool,
            timeout,
            retries,
            retry_delay: Duration::from_millis(10),
            dry_run: false,
        }
    }

    fn item() -> WorkItem {
        WorkItem::new("http://example.com/a?id=1", ";id;")
    }

    #[test]
    fn successful_run_captures_stdout_and_short_circuits() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "echoer.sh", "cat\necho extra-$1");
        let invoker = ToolInvoker::new(config(tool, 2, Duration::from_secs(5)));

        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(result.attempt_count, 1, "first success must short-circuit");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.spawned);
        assert!(result.stdout.contains("http://example.com/a?id=1"));
        assert!(result.stdout.contains("extra-;id;"));
    }

    #[test]
    fn persistent_failure_exhausts_all_attempts() {
        let dir = tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let tool = write_script(
            dir.path(),
            "failer.sh",
            &format!("cat >/dev/null\necho . >> {}\nexit 3", counter.display()),
        );
        let invoker = ToolInvoker::new(config(tool, 2, Duration::from_secs(5)));

        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::Failure);
        assert_eq!(result.attempt_count, 3);
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
        let attempts = fs::read_to_string(&counter).unwrap();
        assert_eq!(attempts.lines().count(), 3, "tool must run retries + 1 times");
    }

    #[test]
    fn always_timing_out_yields_terminal_timeout_after_retries() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "sleeper.sh", "sleep 30");
        let invoker = ToolInvoker::new(config(tool, 2, Duration::from_millis(100)));

        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::Timeout);
        assert_eq!(result.attempt_count, 3);
        assert!(result.timed_out);
        assert!(result.spawned);
    }

    #[test]
    fn missing_tool_reports_tool_missing_without_retries() {
        let invoker = ToolInvoker::new(config(
            PathBuf::from("/no/such/tool_2468"),
            2,
            Duration::from_secs(1),
        ));
        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::ToolMissing);
        assert_eq!(result.attempt_count, 1);
        assert!(!result.spawned);
    }

    #[test]
    fn dry_run_never_spawns_and_returns_synthetic_success() {
        let mut cfg = config(
            PathBuf::from("/no/such/tool_2468"),
            2,
            Duration::from_secs(1),
        );
        cfg.dry_run = true;
        let invoker = ToolInvoker::new(cfg);

        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::Success);
        assert!(!result.spawned);
        assert_eq!(result.attempt_count, 0);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn failure_then_success_recovers_within_retry_budget() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("seen");
        // Fails on the first attempt, succeeds once the marker exists.
        let tool = write_script(
            dir.path(),
            "flaky.sh",
            &format!(
                "cat >/dev/null\nif [ -f {m} ]; then echo recovered; exit 0; fi\ntouch {m}\nexit 1",
                m = marker.display()
            ),
        );
        let invoker = ToolInvoker::new(config(tool, 2, Duration::from_secs(5)));

        let result = invoker.invoke(&item());
        assert_eq!(result.status, InvocationStatus::Success);
        assert_eq!(result.attempt_count, 2);
        assert!(result.stdout.contains("recovered"));
    }
}
