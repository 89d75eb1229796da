//! Factorio child process lifecycle.
//!
//! A spawned Factorio instance has its stdout piped; once the owner has
//! attached its subscriptions it starts the line stream, so no output can be
//! published while nobody is listening. Stdin and stderr are inherited from
//! the parent. The process moves through exactly one `Running -> Exited`
//! transition, whether it exits naturally or is killed.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use parking_lot::Mutex;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ReplayError;
use crate::instance::CONFIG_FILE_NAME;
use crate::process::lines::{LineFanout, LineSplitter};

/// Termination signals understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Graceful termination (SIGTERM on Unix).
    Term,
    /// Forced termination (SIGKILL on Unix).
    Kill,
}

/// Log line Factorio emits when the active scenario is deleted, i.e. the
/// replay has finished.
pub fn scenario_finished_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r" *\d+\.\d+ +Info AppManager\.cpp:\d+: Deleting active scenario\.")
            .expect("scenario pattern is valid")
    })
}

/// Cloneable kill handle, usable from tasks that outlive a borrow of the
/// owning [`FactorioProcess`].
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    kill_tx: mpsc::UnboundedSender<Signal>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ProcessKiller {
    /// Request termination. A no-op once the process has exited.
    pub fn kill(&self, signal: Signal) {
        if self.exit_rx.borrow().is_none() {
            let _ = self.kill_tx.send(signal);
        }
    }
}

/// A running (or exited) Factorio instance.
pub struct FactorioProcess {
    pid: u32,
    lines: LineFanout,
    stdout: Mutex<Option<ChildStdout>>,
    kill_tx: mpsc::UnboundedSender<Signal>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl FactorioProcess {
    /// Wrap a spawned child whose stdout has been piped.
    ///
    /// Stdout is held back until [`FactorioProcess::stream_output`] is called;
    /// the pipe buffers anything the child prints in the meantime, so
    /// subscribers attached before that call see every line.
    pub fn new(mut child: Child) -> Result<Self, ReplayError> {
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("child process was spawned without piped stdout")
        })?;
        let pid = child.id().unwrap_or(0);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        spawn_exit_monitor(child, exit_tx, kill_rx);

        Ok(Self {
            pid,
            lines: LineFanout::new(),
            stdout: Mutex::new(Some(stdout)),
            kill_tx,
            exit_rx,
        })
    }

    /// Start pumping stdout into the line fan-out. Idempotent; callers attach
    /// their subscriptions first, then start the stream.
    pub fn stream_output(&self) {
        if let Some(stdout) = self.stdout.lock().take() {
            spawn_stdout_reader(stdout, self.lines.clone());
        }
    }

    /// OS process id, 0 if the child exited before it could be observed.
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Subscribe to the line stream. Every subscriber independently sees all
    /// lines published after it subscribed, in arrival order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        self.lines.subscribe()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait until the process has exited and return its exit code.
    ///
    /// Any number of concurrent waiters resolve with the same code. A process
    /// terminated by a signal reports code 0.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut exit_rx = self.exit_rx.clone();
        let code = match exit_rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(0),
            // Monitor task gone; the watch still holds the last value.
            Err(_) => (*self.exit_rx.borrow()).unwrap_or(0),
        };
        code
    }

    /// Request termination without waiting. Idempotent: a kill after exit
    /// changes nothing and does not fail.
    pub fn kill(&self, signal: Signal) {
        self.killer().kill(signal);
    }

    pub fn killer(&self) -> ProcessKiller {
        ProcessKiller {
            kill_tx: self.kill_tx.clone(),
            exit_rx: self.exit_rx.clone(),
        }
    }

    /// Gracefully terminate the process on the first line matching `pattern`.
    ///
    /// The watcher fires at most once and then unsubscribes itself.
    pub fn terminate_on_match(&self, pattern: Regex) -> JoinHandle<()> {
        let rx = self.subscribe();
        let killer = self.killer();
        tokio::spawn(async move { terminate_on_first_match(rx, killer, &pattern).await })
    }

    /// Terminate the process once Factorio reports the scenario as deleted.
    pub fn terminate_on_scenario_finished(&self) -> JoinHandle<()> {
        self.terminate_on_match(scenario_finished_pattern().clone())
    }

    /// Scoped teardown: if still running, kill and wait for the exit
    /// transition so no child outlives its logical owner.
    pub async fn shutdown(&self) {
        if !self.has_exited() {
            self.kill(Signal::Term);
            self.wait_for_exit().await;
        }
    }
}

impl Drop for FactorioProcess {
    fn drop(&mut self) {
        // Last-resort guard for owners that bypassed shutdown(). The exit
        // monitor keeps running detached until the child is gone.
        if self.exit_rx.borrow().is_none() {
            let _ = self.kill_tx.send(Signal::Kill);
        }
    }
}

/// Kill the process on the first line matching `pattern`, then stop watching.
pub async fn terminate_on_first_match(
    mut rx: mpsc::UnboundedReceiver<String>,
    killer: ProcessKiller,
    pattern: &Regex,
) {
    while let Some(line) = rx.recv().await {
        if pattern.is_match(&line) {
            killer.kill(Signal::Term);
            break;
        }
    }
}

fn spawn_stdout_reader(mut stdout: ChildStdout, fanout: LineFanout) {
    tokio::spawn(async move {
        let mut splitter = LineSplitter::new();
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in splitter.push(&buf[..n]) {
                        fanout.publish(line);
                    }
                }
            }
        }
        if let Some(last) = splitter.finish() {
            fanout.publish(last);
        }
        fanout.close();
    });
}

fn spawn_exit_monitor(
    mut child: Child,
    exit_tx: watch::Sender<Option<i32>>,
    mut kill_rx: mpsc::UnboundedReceiver<Signal>,
) {
    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                signal = kill_rx.recv() => match signal {
                    Some(signal) => deliver_signal(&mut child, signal),
                    // All handles dropped; just wait the child out.
                    None => break child.wait().await,
                },
            }
        };
        let code = status.ok().and_then(|s| s.code()).unwrap_or(0);
        // Single assignment: the monitor is the only writer, so the
        // Running -> Exited transition happens exactly once even when a kill
        // races with natural termination.
        let _ = exit_tx.send(Some(code));
    });
}

fn deliver_signal(child: &mut Child, signal: Signal) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let signum = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            unsafe {
                libc::kill(pid as libc::pid_t, signum);
            }
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = signal;
    let _ = child.start_kill();
}

/// Spawn Factorio with the data directory's config file appended as the final
/// `-c <path>` arguments.
///
/// Stdout is piped for line splitting; stdin and stderr are inherited. When
/// `shell` is set the launch goes through the platform shell, which some
/// installations (e.g. Steam wrappers) require.
pub fn launch_factorio(
    executable: &Path,
    data_dir: &Path,
    launch_args: &[String],
    shell: bool,
) -> Result<FactorioProcess, ReplayError> {
    let config_path = data_dir.join(CONFIG_FILE_NAME);
    let mut args: Vec<OsString> = launch_args.iter().map(OsString::from).collect();
    args.push(OsString::from("-c"));
    args.push(config_path.into_os_string());

    tracing::info!(
        executable = %executable.display(),
        args = ?args,
        shell,
        "launching factorio"
    );

    let mut cmd = if shell {
        shell_command(executable, &args)
    } else {
        let mut cmd = Command::new(executable);
        cmd.args(&args);
        cmd
    };
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = cmd.spawn()?;
    FactorioProcess::new(child)
}

#[cfg(unix)]
fn shell_command(executable: &Path, args: &[OsString]) -> Command {
    let mut line = shell_quote(&executable.to_string_lossy());
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(&arg.to_string_lossy()));
    }
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(unix)]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(not(unix))]
fn shell_command(executable: &Path, args: &[OsString]) -> Command {
    let mut line = format!("\"{}\"", executable.to_string_lossy());
    for arg in args {
        line.push(' ');
        line.push_str(&format!("\"{}\"", arg.to_string_lossy()));
    }
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fake_factorio(dir: &TempDir, name: &str, script: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, script.trim_start()).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn collect_lines(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn captures_lines_and_appends_config_args() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(
            &dir,
            "fake-factorio",
            r#"#!/bin/sh
echo "$1"
echo one
echo two
"#,
        );

        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        let rx = process.subscribe();
        process.stream_output();
        let code = process.wait_for_exit().await;
        let lines = collect_lines(rx).await;

        assert_eq!(code, 0);
        assert_eq!(lines, ["-c", "one", "two"]);
    }

    #[tokio::test]
    async fn reports_nonzero_exit_code() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(&dir, "fake-factorio", "#!/bin/sh\nexit 3\n");

        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        assert_eq!(process.wait_for_exit().await, 3);
    }

    #[tokio::test]
    async fn kill_after_natural_exit_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(&dir, "fake-factorio", "#!/bin/sh\nexit 7\n");

        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        let code = process.wait_for_exit().await;
        assert_eq!(code, 7);

        process.kill(Signal::Term);
        process.kill(Signal::Kill);
        assert_eq!(process.wait_for_exit().await, 7);
    }

    #[tokio::test]
    async fn concurrent_waiters_see_the_same_code() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(&dir, "fake-factorio", "#!/bin/sh\nexit 5\n");

        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        let (a, b) = tokio::join!(process.wait_for_exit(), process.wait_for_exit());
        assert_eq!((a, b), (5, 5));
    }

    #[tokio::test]
    async fn terminate_on_match_fires_once_and_kills() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(
            &dir,
            "fake-factorio",
            r#"#!/bin/sh
echo HI
echo "  27.832 Info AppManager.cpp:352: Deleting active scenario."
echo "  28.832 Info AppManager.cpp:352: Deleting active scenario."
sleep 30 </dev/null >/dev/null 2>&1
echo BAD
"#,
        );

        let started = Instant::now();
        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        let rx = process.subscribe();
        let watcher = process.terminate_on_scenario_finished();
        process.stream_output();

        process.wait_for_exit().await;
        watcher.await.unwrap();
        let lines = collect_lines(rx).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!lines.contains(&"BAD".to_string()));
        assert_eq!(lines[0], "HI");
    }

    #[tokio::test]
    async fn shutdown_kills_a_running_child() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(
            &dir,
            "fake-factorio",
            "#!/bin/sh\nsleep 30 </dev/null >/dev/null 2>&1\necho BAD\n",
        );

        let started = Instant::now();
        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        let rx = process.subscribe();
        process.stream_output();
        process.shutdown().await;

        assert!(process.has_exited());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(collect_lines(rx).await.is_empty());
    }

    #[tokio::test]
    async fn shell_launch_captures_lines() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(&dir, "fake-factorio", "#!/bin/sh\necho shell-mode\n");

        let process = launch_factorio(&exe, dir.path(), &[], true).unwrap();
        let rx = process.subscribe();
        process.stream_output();
        process.wait_for_exit().await;
        let lines = collect_lines(rx).await;
        assert_eq!(lines, ["shell-mode"]);
    }

    #[tokio::test]
    async fn output_printed_before_streaming_starts_is_not_lost() {
        let dir = TempDir::new().unwrap();
        let exe = fake_factorio(&dir, "fake-factorio", "#!/bin/sh\necho early\necho bird\n");

        let process = launch_factorio(&exe, dir.path(), &[], false).unwrap();
        // Let the child run to completion before anyone is listening; the
        // pipe holds its output until the stream starts.
        process.wait_for_exit().await;

        let rx = process.subscribe();
        process.stream_output();
        let lines = collect_lines(rx).await;
        assert_eq!(lines, ["early", "bird"]);
    }

    #[test]
    fn scenario_pattern_matches_engine_line() {
        let line = "  27.832 Info AppManager.cpp:352: Deleting active scenario.";
        assert!(scenario_finished_pattern().is_match(line));
        assert!(!scenario_finished_pattern().is_match("REPLAY_SCRIPT:Deleting"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
