/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod output_buffer;

use crate::error::OrchestratorError;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use output_buffer::{Cursor, OutputBuffer};
use regex::Regex;
use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Upper bound on waiting for a killed process and its readers to wind down.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Time left to group members that outlived the leader between SIGTERM and SIGKILL.
const ORPHAN_GRACE: Duration = Duration::from_millis(500);

const PATTERN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to launch a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub ready_pattern: Option<String>,
    pub timeout: Duration,
}

impl ProcessSpec {
    pub fn new<S: Into<String>>(name: &str, program: &str, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
            ready_pattern: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Splits `command` into POSIX words, or hands it to `sh -c` when `shell` is set.
    pub fn from_command_line(name: &str, command: &str, shell: bool) -> anyhow::Result<Self> {
        if shell {
            return Ok(Self::new(name, "sh", ["-c", command]));
        }

        let words = shlex::split(command).ok_or_else(|| {
            OrchestratorError::configuration(format!("command is not POSIX compliant: {command}"))
        })?;
        match &words[..] {
            [program, args @ ..] => Ok(Self::new(name, program, args.iter().cloned())),
            _ => Err(OrchestratorError::configuration(format!(
                "empty command for process {name}"
            ))),
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs<K: Into<String>, V: Into<String>>(
        mut self,
        vars: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn ready_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ready_pattern = Some(pattern.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Option<i32>),
}

/// Cheap, cloneable view onto a supervised process. Reading output or liveness through a handle
/// never touches the supervisor's process map.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    liveness: watch::Receiver<Liveness>,
}

impl ProcessHandle {
    pub fn is_running(&self) -> bool {
        *self.liveness.borrow() == Liveness::Running
    }

    pub fn exit_code(&self) -> Option<i32> {
        match *self.liveness.borrow() {
            Liveness::Exited(code) => code,
            Liveness::Running => None,
        }
    }

    pub fn drain_stdout(&self) -> Vec<String> {
        self.stdout.drain()
    }

    pub fn drain_stderr(&self) -> Vec<String> {
        self.stderr.drain()
    }

    /// Blocks until a line on stdout or stderr matches `pattern`. Fails with a readiness timeout
    /// when `timeout` elapses and with a process crash if the process exits first.
    pub async fn wait_for_pattern(&self, pattern: &Regex, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut out_cursor = Cursor::default();
        let mut err_cursor = Cursor::default();

        loop {
            let matched = self
                .stdout
                .scan_from(&mut out_cursor)
                .iter()
                .chain(self.stderr.scan_from(&mut err_cursor).iter())
                .any(|line| pattern.is_match(line));
            if matched {
                return Ok(());
            }

            if !self.is_running() {
                return Err(OrchestratorError::ProcessCrash {
                    name: self.name.clone(),
                    code: self.exit_code(),
                }
                .into());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::readiness_timeout(
                    format!("pattern '{}' in {} output", pattern, self.name),
                    timeout,
                ));
            }

            let nap = PATTERN_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.stdout.changed() => {}
                _ = self.stderr.changed() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Waits at most `timeout` for the process to exit.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<Option<i32>> {
        let mut liveness = self.liveness.clone();
        let exited = tokio::time::timeout(
            timeout,
            liveness.wait_for(|state| *state != Liveness::Running),
        )
        .await;

        match exited {
            Ok(Ok(state)) => match *state {
                Liveness::Exited(code) => Some(code),
                Liveness::Running => None,
            },
            // the waiter task only drops its sender after publishing the exit
            Ok(Err(_)) => Some(self.exit_code()),
            Err(_) => None,
        }
    }
}

/// A process launched and owned by the supervisor.
struct ManagedProcess {
    handle: ProcessHandle,
    started: Instant,
    kill_token: CancellationToken,
    reader_token: CancellationToken,
    tasks: JoinSet<()>,
}

/// What remains of a process once it has been stopped.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub name: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Registry of named background processes. At most one process exists per name; starting a
/// name that is already running replaces the old process.
pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    buffer_capacity: usize,
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            buffer_capacity: output_buffer::DEFAULT_CAPACITY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launches `spec` with both output streams captured. When a ready pattern is given this
    /// blocks until it shows up in the output; on timeout or crash the process is torn down
    /// before the error is returned.
    pub async fn start(&self, spec: ProcessSpec) -> anyhow::Result<ProcessHandle> {
        if self.is_tracked(&spec.name) {
            warn!("Process {} already running, stopping it first", spec.name);
            self.stop(&spec.name).await?;
        }

        info!("Starting process {}: {}", spec.name, spec.command_line());
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        // own process group so termination reaches everything the command forks
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().context(format!(
            "Failed to spawn process {}, command: {}",
            spec.name,
            spec.command_line()
        ))?;
        let pid = child.id();

        let stdout = Arc::new(OutputBuffer::new(self.buffer_capacity));
        let stderr = Arc::new(OutputBuffer::new(self.buffer_capacity));
        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Running);
        let kill_token = CancellationToken::new();
        let reader_token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if let Some(out) = child.stdout.take() {
            tasks.spawn(read_lines(
                out,
                stdout.clone(),
                format!("{}-stdout", spec.name),
                reader_token.clone(),
            ));
        }
        if let Some(err) = child.stderr.take() {
            tasks.spawn(read_lines(
                err,
                stderr.clone(),
                format!("{}-stderr", spec.name),
                reader_token.clone(),
            ));
        }

        {
            let kill_token = kill_token.clone();
            tasks.spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_token.cancelled() => {
                        signal_group(pid, Signal::Kill);
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let code = status.ok().and_then(|status| status.code());
                let _ = liveness_tx.send(Liveness::Exited(code));
            });
        }

        let handle = ProcessHandle {
            name: spec.name.clone(),
            pid,
            started_at: Utc::now(),
            stdout,
            stderr,
            liveness: liveness_rx,
        };
        let managed = ManagedProcess {
            handle: handle.clone(),
            started: Instant::now(),
            kill_token,
            reader_token,
            tasks,
        };

        let displaced = self.registry().insert(spec.name.clone(), managed);
        if let Some(displaced) = displaced {
            // a concurrent start under the same name won the race; only the newest survives
            warn!("Process {} was started concurrently, stopping the older one", spec.name);
            self.shutdown(displaced).await;
        }

        if let Some(pattern) = &spec.ready_pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| OrchestratorError::configuration(format!("bad ready pattern: {e}")));
            let ready = match regex {
                Ok(regex) => handle.wait_for_pattern(&regex, spec.timeout).await,
                Err(e) => Err(e),
            };
            if let Err(e) = ready {
                warn!("Process {} did not become ready: {}", spec.name, e);
                self.stop(&spec.name).await?;
                return Err(e);
            }
        }

        info!("{} started successfully (PID: {:?})", spec.name, pid);
        Ok(handle)
    }

    /// Terminates the named process gracefully, escalating to a kill after the grace period,
    /// and returns whatever output was still buffered. `None` if no such process is tracked.
    pub async fn stop(&self, name: &str) -> anyhow::Result<Option<ProcessOutput>> {
        let managed = self.registry().remove(name);
        match managed {
            Some(managed) => Ok(Some(self.shutdown(managed).await)),
            None => Ok(None),
        }
    }

    /// Stops every tracked process. Safe to call repeatedly.
    pub async fn stop_all(&self) -> Vec<ProcessOutput> {
        let names = self.names();
        let mut outputs = Vec::with_capacity(names.len());
        for name in names {
            match self.stop(&name).await {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(e) => warn!("Failed to stop process {}: {}", name, e),
            }
        }
        outputs
    }

    pub fn handle(&self, name: &str) -> Option<ProcessHandle> {
        self.registry().get(name).map(|managed| managed.handle.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.registry().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn shutdown(&self, mut managed: ManagedProcess) -> ProcessOutput {
        let handle = managed.handle.clone();
        let name = handle.name.clone();

        if handle.is_running() {
            print!("> stopping process {}", name.green());
            signal_group(handle.pid, Signal::Terminate);

            if handle.wait_for_exit(self.grace_period).await.is_none() {
                warn!("{} didn't stop gracefully, killing...", name);
                managed.kill_token.cancel();
                if handle.wait_for_exit(KILL_TIMEOUT).await.is_none() {
                    warn!("{} still alive after kill", name);
                }
            }
            println!("\t{}", "✓".green());
        }

        // the leader is gone but anything it forked is still in its group and may hold the pipes
        signal_group(handle.pid, Signal::Terminate);
        let mut joined = join_all(&mut managed.tasks, ORPHAN_GRACE).await;
        signal_group(handle.pid, Signal::Kill);
        if !joined {
            joined = join_all(&mut managed.tasks, KILL_TIMEOUT).await;
        }
        if !joined {
            debug!("Output readers of {} did not finish, cancelling", name);
            managed.reader_token.cancel();
            managed.kill_token.cancel();
            managed.tasks.abort_all();
        }

        ProcessOutput {
            name,
            exit_code: handle.exit_code(),
            duration: managed.started.elapsed(),
            stdout: handle.drain_stdout(),
            stderr: handle.drain_stderr(),
        }
    }
}

/// Waits for every task in `tasks` to finish. `false` if `timeout` elapsed first.
async fn join_all(tasks: &mut JoinSet<()>, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_ok()
}

async fn read_lines<R>(stream: R, buffer: Arc<OutputBuffer>, label: String, token: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                let line = line.trim_end().to_string();
                debug!("[{}] {}", label, line);
                buffer.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading from {}: {}", label, e);
                break;
            }
        }
    }
    buffer.close();
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: the child leads its own process group (pgid == pid). A group that has already
    // gone away makes kill return ESRCH, which is harmless.
    unsafe {
        libc::kill(-(pid as libc::pid_t), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {
    // no process groups here, the waiter task's start_kill is the only lever
}

/// Fails with a crash error when the process behind `handle` is no longer running.
pub fn ensure_running(handle: &ProcessHandle) -> anyhow::Result<()> {
    if handle.is_running() {
        Ok(())
    } else {
        Err(anyhow!(OrchestratorError::ProcessCrash {
            name: handle.name.clone(),
            code: handle.exit_code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_lines_are_split_into_posix_words() -> anyhow::Result<()> {
        let spec = ProcessSpec::from_command_line("srv", "serve -f 'my video.mp4' --port 8554", false)?;
        assert_eq!(spec.program, "serve");
        assert_eq!(spec.args, ["-f", "my video.mp4", "--port", "8554"]);

        let spec = ProcessSpec::from_command_line("srv", "echo hi | tee out", true)?;
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, ["-c", "echo hi | tee out"]);
        Ok(())
    }

    #[test]
    fn empty_command_is_a_configuration_error() {
        let err = ProcessSpec::from_command_line("srv", "   ", false).unwrap_err();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(OrchestratorError::Configuration(_))
        ));
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use crate::error::kind_of;

        fn supervisor() -> ProcessSupervisor {
            ProcessSupervisor::new().with_grace_period(Duration::from_secs(2))
        }

        #[tokio::test]
        async fn waits_for_ready_pattern_and_captures_output() -> anyhow::Result<()> {
            let supervisor = supervisor();
            let spec = ProcessSpec::new("echo", "sh", ["-c", "echo booting; echo server ready; sleep 30"])
                .ready_pattern("ready")
                .timeout(Duration::from_secs(5));

            let handle = supervisor.start(spec).await?;
            assert!(handle.is_running());

            let output = supervisor.stop("echo").await?.expect("process should be tracked");
            assert_eq!(output.stdout, ["booting", "server ready"]);
            assert!(supervisor.is_empty());
            Ok(())
        }

        #[tokio::test]
        async fn readiness_timeout_tears_the_process_down() {
            let supervisor = supervisor();
            let spec = ProcessSpec::new("quiet", "sleep", ["30"])
                .ready_pattern("never")
                .timeout(Duration::from_millis(300));

            let err = supervisor.start(spec).await.unwrap_err();
            assert!(matches!(
                kind_of(&err),
                Some(OrchestratorError::ReadinessTimeout { .. })
            ));
            assert!(!supervisor.is_tracked("quiet"));
        }

        #[tokio::test]
        async fn early_exit_is_reported_as_a_crash() {
            let supervisor = supervisor();
            let spec = ProcessSpec::new("crash", "sh", ["-c", "echo dying; exit 3"])
                .ready_pattern("never")
                .timeout(Duration::from_secs(5));

            let err = supervisor.start(spec).await.unwrap_err();
            match kind_of(&err) {
                Some(OrchestratorError::ProcessCrash { code, .. }) => assert_eq!(*code, Some(3)),
                other => panic!("expected a crash, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn starting_an_existing_name_replaces_the_process() -> anyhow::Result<()> {
            let supervisor = supervisor();
            let first = supervisor
                .start(ProcessSpec::new("worker", "sleep", ["30"]))
                .await?;
            let second = supervisor
                .start(ProcessSpec::new("worker", "sleep", ["30"]))
                .await?;

            assert_eq!(supervisor.names(), ["worker"]);
            assert!(!first.is_running());
            assert!(second.is_running());
            assert_ne!(first.pid, second.pid);

            supervisor.stop_all().await;
            Ok(())
        }

        #[tokio::test]
        async fn stubborn_processes_are_killed_after_the_grace_period() -> anyhow::Result<()> {
            let supervisor = ProcessSupervisor::new().with_grace_period(Duration::from_millis(300));
            supervisor
                .start(
                    ProcessSpec::new("stubborn", "sh", ["-c", "trap '' TERM; echo armed; while true; do sleep 1; done"])
                        .ready_pattern("armed"),
                )
                .await?;

            let output = supervisor.stop("stubborn").await?.expect("tracked");
            assert_eq!(output.exit_code, None);
            Ok(())
        }

        #[tokio::test]
        async fn stop_all_leaves_nothing_tracked() -> anyhow::Result<()> {
            let supervisor = supervisor();
            supervisor.start(ProcessSpec::new("a", "sleep", ["30"])).await?;
            supervisor.start(ProcessSpec::new("b", "sleep", ["30"])).await?;
            supervisor
                .start(ProcessSpec::new("c", "sh", ["-c", "exit 0"]))
                .await?;

            supervisor.stop_all().await;
            assert!(supervisor.is_empty());

            supervisor.stop_all().await;
            assert!(supervisor.is_empty());
            Ok(())
        }

        #[cfg(target_os = "linux")]
        fn is_alive(pid: i32) -> bool {
            // SAFETY: signal 0 only probes for existence
            let exists = unsafe { libc::kill(pid, 0) } == 0;
            let zombie = std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')))
                .unwrap_or(false);
            exists && !zombie
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn stop_reaches_children_that_outlive_the_leader() -> anyhow::Result<()> {
            let dir = tempfile::tempdir()?;
            let pidfile = dir.path().join("pid");
            let supervisor = supervisor();
            let handle = supervisor
                .start(ProcessSpec::new(
                    "wrapper",
                    "sh",
                    ["-c".to_string(), format!("sleep 30 & echo $! > {}; exit 0", pidfile.display())],
                ))
                .await?;
            assert_eq!(handle.wait_for_exit(Duration::from_secs(5)).await, Some(Some(0)));
            let orphan: i32 = std::fs::read_to_string(&pidfile)?.trim().parse()?;
            assert!(is_alive(orphan));

            let started = Instant::now();
            supervisor.stop_all().await;
            assert!(started.elapsed() < Duration::from_secs(3));
            assert!(supervisor.is_empty());

            let deadline = Instant::now() + Duration::from_secs(2);
            while is_alive(orphan) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(!is_alive(orphan));
            Ok(())
        }

        #[tokio::test]
        async fn captured_output_keeps_only_the_newest_lines() -> anyhow::Result<()> {
            let supervisor = supervisor().with_buffer_capacity(2);
            let handle = supervisor
                .start(ProcessSpec::new("chatty", "sh", ["-c", "for i in 1 2 3 4; do echo $i; done"]))
                .await?;
            handle.wait_for_exit(Duration::from_secs(5)).await;

            let output = supervisor.stop("chatty").await?.expect("tracked");
            assert_eq!(output.stdout, ["3", "4"]);
            Ok(())
        }

        #[tokio::test]
        async fn stopping_an_unknown_process_returns_none() -> anyhow::Result<()> {
            assert!(supervisor().stop("ghost").await?.is_none());
            Ok(())
        }
    }
}
