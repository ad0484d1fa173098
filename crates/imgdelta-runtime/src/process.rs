use crate::RuntimeError;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Signal used to force a stuck rsync to terminate. rsync treats SIGUSR1 as
/// "exit now" without the cleanup it does on SIGTERM.
pub const FORCE_KILL_SIGNAL: libc::c_int = libc::SIGUSR1;

/// How one subprocess ended. Computed once, immutable afterwards.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub exited_cleanly: bool,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub spawn_error: Option<Arc<std::io::Error>>,
}

impl ProcessOutcome {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            exited_cleanly: status.success(),
            code: status.code(),
            signal: status.signal().map(signal_name),
            spawn_error: None,
        }
    }

    fn from_error(error: std::io::Error) -> Self {
        Self {
            spawn_error: Some(Arc::new(error)),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exited_cleanly
    }

    /// `Ok(())` on a clean exit, otherwise the error describing the failure.
    pub fn into_result(self, program: &str) -> Result<(), RuntimeError> {
        if let Some(source) = self.spawn_error {
            return Err(RuntimeError::Spawn {
                program: program.to_owned(),
                source,
            });
        }
        if self.exited_cleanly {
            return Ok(());
        }
        Err(RuntimeError::ProcessFailed {
            program: program.to_owned(),
            code: self.code,
            signal: self.signal,
        })
    }
}

/// A spawned external program whose exit outcome is captured at spawn time.
///
/// The child is moved into a waiter task as soon as it starts, and the waiter
/// publishes the outcome on a watch channel. Calling [`wait`](Self::wait)
/// after the process has already exited observes the recorded outcome. A
/// program that fails to spawn yields a handle whose outcome is already
/// resolved with `spawn_error` set.
pub struct SupervisedProcess {
    program: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
}

impl SupervisedProcess {
    /// Spawn `command`. Must be called from within a tokio runtime.
    pub fn spawn(command: &mut Command) -> Self {
        let std_cmd = command.as_std();
        let program = std_cmd.get_program().to_string_lossy().into_owned();
        debug!(
            "spawning {program} {}",
            std_cmd
                .get_args()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        match command.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                let stdin = child.stdin.take();
                let (tx, rx) = watch::channel(None);
                let label = program.clone();
                tokio::spawn(async move {
                    let outcome = match child.wait().await {
                        Ok(status) => ProcessOutcome::from_status(status),
                        Err(e) => {
                            warn!("failed to wait for {label}: {e}");
                            ProcessOutcome::from_error(e)
                        }
                    };
                    debug!("{label} exited: {}", describe_exit(&outcome.code, &outcome.signal));
                    let _ = tx.send(Some(outcome));
                });
                Self {
                    program,
                    pid,
                    stdin,
                    outcome: rx,
                }
            }
            Err(e) => {
                warn!("failed to spawn {program}: {e}");
                let (_tx, rx) = watch::channel(Some(ProcessOutcome::from_error(e)));
                Self {
                    program,
                    pid: None,
                    stdin: None,
                    outcome: rx,
                }
            }
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the child's stdin, if it was configured as piped.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn has_exited(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the recorded outcome.
    pub async fn outcome(&self) -> ProcessOutcome {
        let mut rx = self.outcome.clone();
        let recorded = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        // The waiter task only goes away without sending if the runtime is
        // shutting down.
        recorded.unwrap_or_else(|| {
            ProcessOutcome::from_error(std::io::Error::other("process waiter was dropped"))
        })
    }

    /// Wait for exit; any outcome other than a clean exit is an error.
    pub async fn wait(&self) -> Result<(), RuntimeError> {
        self.outcome().await.into_result(&self.program)
    }

    /// Like [`wait`](Self::wait), but gives up after `limit`. `None` means
    /// the process was still running when the limit elapsed.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<Result<(), RuntimeError>> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Deliver `signal` to the process. Returns `false` if the process had
    /// already exited (or never started), in which case nothing is sent.
    pub fn kill(&self, signal: libc::c_int) -> Result<bool, RuntimeError> {
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        if self.has_exited() {
            return Ok(false);
        }
        let pid_i32 = i32::try_from(pid).map_err(|_| RuntimeError::Signal {
            program: self.program.clone(),
            pid,
            signal: signal_name(signal),
            source: std::io::Error::other("pid exceeds i32 range"),
        })?;

        debug!("sending {} to {} (pid {pid})", signal_name(signal), self.program);
        // SAFETY: kill() with a valid pid and signal is safe; the pid belongs to
        // our own child, which has not been reaped yet (no outcome recorded).
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid_i32, signal) };
        if ret != 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ESRCH) {
                debug!("pid {pid} already exited before {}", signal_name(signal));
                return Ok(false);
            }
            return Err(RuntimeError::Signal {
                program: self.program.clone(),
                pid,
                signal: signal_name(signal),
                source: errno,
            });
        }
        Ok(true)
    }
}

/// Spawn `command` and wait for it to exit cleanly.
pub async fn run_to_completion(command: &mut Command) -> Result<(), RuntimeError> {
    SupervisedProcess::spawn(command).wait().await
}

pub fn signal_name(signal: libc::c_int) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        other => return format!("signal {other}"),
    };
    name.to_owned()
}

pub(crate) fn describe_exit(code: &Option<i32>, signal: &Option<String>) -> String {
    format!(
        "code: {} signal: {}",
        code.map_or_else(|| "none".to_owned(), |c| c.to_string()),
        signal.as_deref().unwrap_or("none")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    #[tokio::test]
    async fn clean_exit_is_success() {
        let process = SupervisedProcess::spawn(&mut sh("exit 0"));
        process.wait().await.unwrap();
        let outcome = process.outcome().await;
        assert!(outcome.success());
        assert_eq!(outcome.code, Some(0));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code() {
        let process = SupervisedProcess::spawn(&mut sh("exit 23"));
        let err = process.wait().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(23));
        assert_eq!(process.program(), "sh");
    }

    #[tokio::test]
    async fn outcome_is_recorded_before_wait_is_called() {
        let process = SupervisedProcess::spawn(&mut sh("exit 3"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(process.has_exited());
        assert_eq!(process.wait().await.unwrap_err().exit_code(), Some(3));
        // A second wait observes the same outcome.
        assert_eq!(process.wait().await.unwrap_err().exit_code(), Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_resolved_outcome() {
        let mut cmd = Command::new("/nonexistent/imgdelta-test-program");
        let process = SupervisedProcess::spawn(&mut cmd);
        assert!(process.pid().is_none());
        assert!(process.has_exited());
        let outcome = process.outcome().await;
        assert!(outcome.spawn_error.is_some());
        assert!(matches!(
            process.wait().await,
            Err(RuntimeError::Spawn { .. })
        ));
        assert!(!process.kill(FORCE_KILL_SIGNAL).unwrap());
    }

    #[tokio::test]
    async fn kill_reports_signal() {
        let process = SupervisedProcess::spawn(&mut sh("sleep 30"));
        assert!(process.kill(FORCE_KILL_SIGNAL).unwrap());
        let outcome = process.outcome().await;
        assert!(!outcome.success());
        assert_eq!(outcome.code, None);
        assert_eq!(outcome.signal.as_deref(), Some("SIGUSR1"));
    }

    #[tokio::test]
    async fn kill_after_exit_sends_nothing() {
        let process = SupervisedProcess::spawn(&mut sh("exit 0"));
        process.wait().await.unwrap();
        assert!(!process.kill(libc::SIGTERM).unwrap());
    }

    #[tokio::test]
    async fn wait_timeout_expires_on_running_process() {
        let process = SupervisedProcess::spawn(&mut sh("sleep 30"));
        assert!(process
            .wait_timeout(Duration::from_millis(100))
            .await
            .is_none());
        process.kill(libc::SIGKILL).unwrap();
        assert!(process
            .wait_timeout(Duration::from_secs(10))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn piped_stdin_is_available() {
        use tokio::io::AsyncWriteExt;

        let mut cmd = sh("cat > /dev/null");
        cmd.stdin(Stdio::piped());
        let mut process = SupervisedProcess::spawn(&mut cmd);
        let mut stdin = process.take_stdin().unwrap();
        stdin.write_all(b"hello").await.unwrap();
        drop(stdin);
        process.wait().await.unwrap();
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(libc::SIGUSR1), "SIGUSR1");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(64), "signal 64");
    }
}
