//! Process Host (§4.3): spawns the child, wires stdout/stderr capture and
//! stdin forwarding, and registers the exit observer.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::ProcessError;
use crate::process::isolation::{ResourceGroup, ResourceLimits};
use crate::protocol::Message;

/// Identity and accounting for one managed child (§3).
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub process_id: Uuid,
    pub server_id: String,
    pub os_pid: Option<u32>,
    pub started_at: SystemTime,
    pub exited_at: Option<SystemTime>,
    pub exit_code: Option<i32>,
    pub restart_count: u32,
}

impl ManagedProcess {
    pub fn new(server_id: String, restart_count: u32) -> ManagedProcess {
        ManagedProcess {
            process_id: Uuid::new_v4(),
            server_id,
            os_pid: None,
            started_at: SystemTime::now(),
            exited_at: None,
            exit_code: None,
            restart_count,
        }
    }
}

/// Delivered exactly once when the child exits, on whichever task the OS
/// delivers the wait() result to; consumed by the lifecycle task (§9).
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    pub exit_code: Option<i32>,
}

/// Everything a freshly spawned child hands back to the lifecycle task.
/// `exit_rx` is a watch channel rather than a oneshot so the stop algorithm
/// can re-await it across the graceful-then-forced wait windows (§4.5
/// steps 3-4) without losing the notice to a timed-out future.
pub struct SpawnedProcess {
    pub pid: u32,
    pub output_rx: mpsc::UnboundedReceiver<Message>,
    pub exit_rx: watch::Receiver<Option<ExitNotice>>,
}

struct ProcessHostInner {
    resource_group: ResourceGroup,
    stdin: Mutex<Option<ChildStdin>>,
    stdin_redirected: bool,
    disposed: AtomicBool,
}

/// Owns the live OS resources for one child: the `Child` handle, the
/// isolation group, and (if redirected) its stdin. Exclusively owned by
/// the Process Host that created it (§5 "Shared-resource policy"); the
/// exit observer only reads, never releases.
pub struct ProcessHost {
    inner: Arc<ProcessHostInner>,
}

impl ProcessHost {
    /// Construct the launch descriptor from `config` and spawn the child
    /// (§4.3). The resource group is created and the child assigned to it
    /// before any stdout/stderr reads begin, satisfying §4.4's "assigned to
    /// the group immediately after spawn and before it may create
    /// children".
    pub async fn spawn(config: &ServerConfig) -> Result<(ProcessHost, SpawnedProcess), ProcessError> {
        let mut cmd = Command::new(&config.executable_path);
        cmd.args(config.argv());

        if let Some(wd) = config.effective_working_directory() {
            cmd.current_dir(wd);
        }
        for (key, value) in &config.environment_variables {
            cmd.env(key, value);
        }

        cmd.stdin(if config.redirect_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(if config.capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if config.capture_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
        let pid = child.id().ok_or(ProcessError::SpawnFailed(std::io::Error::other(
            "child exited before pid was observable",
        )))?;

        let resource_group = match ResourceGroup::create(ResourceLimits::from_config(config)) {
            Ok(group) => group,
            Err(e) => {
                kill_and_wait(&mut child).await;
                return Err(e);
            }
        };
        if let Err(e) = resource_group.assign(pid) {
            kill_and_wait(&mut child).await;
            return Err(e);
        }

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = stdout {
            spawn_capture(stdout, false, output_tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_capture(stderr, true, output_tx);
        }

        // Register the exit observer before returning, per §4.3.
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let result = child.wait().await;
            let exit_code = result.ok().and_then(|status| status.code());
            // Fire-and-forget: if nobody is listening anymore the error is
            // dropped (§5, §7).
            let _ = exit_tx.send(Some(ExitNotice { exit_code }));
        });

        let inner = Arc::new(ProcessHostInner {
            resource_group,
            stdin: Mutex::new(stdin),
            stdin_redirected: config.redirect_stdin,
            disposed: AtomicBool::new(false),
        });

        Ok((
            ProcessHost { inner },
            SpawnedProcess {
                pid,
                output_rx,
                exit_rx,
            },
        ))
    }

    /// Append `text` + newline to the child's stdin, if redirected (§4.2,
    /// §4.3). Refuses (logs a warning, does not fail the connection) when
    /// stdin was not redirected.
    pub async fn write_stdin(&self, text: &str) -> Result<(), ProcessError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ProcessError::Disposed);
        }
        if !self.inner.stdin_redirected {
            tracing::warn!("input message dropped: stdin is not redirected");
            return Err(ProcessError::StdinNotRedirected);
        }

        let mut guard = self.inner.stdin.lock().await;
        match guard.as_mut() {
            Some(stdin) => {
                stdin.write_all(text.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await?;
                Ok(())
            }
            None => Err(ProcessError::StdinNotRedirected),
        }
    }

    /// Force-terminate the entire resource group (§4.5 step 4).
    pub fn kill_all(&self) {
        self.inner.resource_group.kill_all();
    }

    /// Ask the resource group to terminate politely (§4.5 step 2).
    pub fn terminate_group(&self) {
        self.inner.resource_group.terminate_group();
    }

    /// Centralized, idempotent release of every OS resource this host
    /// owns: the stdin handle and the isolation group (§4.4, §5, §9).
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stdin.lock().await.take();
        self.inner.resource_group.kill_all();
    }
}

async fn kill_and_wait(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Capture one stdio stream line-by-line, truncating and forwarding each
/// line as an `output` message. Fire-and-forget: a failed send (nobody
/// reading output_rx anymore) is dropped, never propagated to the child
/// (§4.2, §5).
fn spawn_capture<R>(stream: R, is_error: bool, tx: mpsc::UnboundedSender<Message>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(Message::output_line(line, is_error)).is_err() {
                        tracing::debug!("output receiver dropped, stopping capture");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("stdio capture read error: {e}");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(executable: &str, args: Option<&str>) -> ServerConfig {
        ServerConfig {
            executable_path: executable.to_string(),
            arguments: args.map(str::to_string),
            capture_stdout: true,
            capture_stderr: true,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn spawns_and_captures_stdout() {
        let config = test_config("/bin/echo", Some("hello from the child"));
        let (host, mut spawned) = ProcessHost::spawn(&config).await.unwrap();
        assert!(spawned.pid > 0);

        let mut saw_hello = false;
        while let Some(msg) = spawned.output_rx.recv().await {
            if let Message::Output { data, .. } = msg
                && data.contains("hello from the child")
            {
                saw_hello = true;
            }
        }
        assert!(saw_hello);

        spawned.exit_rx.changed().await.unwrap();
        let notice = spawned.exit_rx.borrow().unwrap();
        assert_eq!(notice.exit_code, Some(0));
        host.dispose().await;
    }

    #[tokio::test]
    async fn stdin_forwarding_requires_redirect() {
        let config = test_config("/bin/cat", None);
        let (host, _spawned) = ProcessHost::spawn(&config).await.unwrap();
        let err = host.write_stdin("hi").await.unwrap_err();
        assert!(matches!(err, ProcessError::StdinNotRedirected));
        host.dispose().await;
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let config = test_config("/bin/false", None);
        let (host, mut spawned) = ProcessHost::spawn(&config).await.unwrap();
        spawned.exit_rx.changed().await.unwrap();
        let notice = spawned.exit_rx.borrow().unwrap();
        assert_eq!(notice.exit_code, Some(1));
        host.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let config = test_config("/bin/true", None);
        let (host, _spawned) = ProcessHost::spawn(&config).await.unwrap();
        host.dispose().await;
        host.dispose().await;
    }
}
