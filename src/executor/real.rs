//! Real command executor implementation.
//!
//! This module provides [`RealCommandExecutor`], which executes commands
//! using `std::process::Command` with real-time output streaming, output
//! capture and an optional per-command timeout.

use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustix::process::{Pid, Signal, kill_process_group};
use which::which;

use super::pipe::{StreamType, panic_message, read_pipe_to_log};
use super::{CommandExecutor, CommandSpec, ExecutionResult, format_command_args};
use crate::error::ProvisionError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cleans up a child process and its associated reader threads.
///
/// Kills the child process, waits for it to terminate, and joins all reader
/// threads to prevent resource leaks.
fn cleanup_child_process<I>(child: &mut Child, handles: I)
where
    I: IntoIterator<Item = JoinHandle<String>>,
{
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    for handle in handles {
        if let Err(e) = handle.join() {
            tracing::warn!("reader thread panicked during cleanup: {}", panic_message(&*e));
        }
    }
}

/// Kills the child's whole process group after a timeout.
///
/// Grandchildren (`sudo`'s target, `qemu-img` under `qm`, the shell under
/// `pct exec`) inherit the output pipes, so the reader threads are detached
/// instead of joined: they finish once the last holder of the pipes is gone.
fn kill_process_group_of(child: &mut Child, handles: [JoinHandle<String>; 2]) {
    let pid = child.id();
    if let Err(e) = kill_process_group(Pid::from_child(child), Signal::KILL) {
        tracing::debug!(pid = pid, "killing process group failed: {}", e);
    }
    if let Err(e) = child.kill() {
        tracing::debug!(pid = pid, "kill returned error (process may have already exited): {}", e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = pid, "failed to wait for child process after kill: {}", e);
    }
    drop(handles);
}

/// Waits for the child, polling until `timeout` elapses.
///
/// Returns `Ok(None)` when the deadline passed while the child was still running.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Command executor that runs actual system commands.
///
/// When `dry_run` is true, mutating commands are logged but not executed and
/// `execute()` returns a result with `status: None`. Read-only queries still
/// run so that planning sees the real host state.
pub struct RealCommandExecutor {
    pub dry_run: bool,
}

impl RealCommandExecutor {
    fn execution_error(spec: &CommandSpec, status: impl Into<String>) -> anyhow::Error {
        ProvisionError::Execution {
            command: format!("{} {}", spec.command, format_command_args(&spec.args)),
            status: status.into(),
        }
        .into()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
        if self.dry_run && !spec.read_only {
            tracing::info!("dry run: {}", spec.display());
            return Ok(ExecutionResult::default());
        }

        let (program, args) = match spec.privilege {
            Some(method) => method.wrap(&spec.command, &spec.args),
            None => (spec.command.clone(), spec.args.clone()),
        };

        let cmd = which(&program).map_err(|_| ProvisionError::CommandNotFound {
            command: program.clone(),
        })?;
        tracing::trace!("command found: {}: {}", program, cmd.to_string_lossy());

        let mut command = Command::new(cmd);
        command.args(&args);

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        // Own process group, so a timeout can take down every descendant.
        command.process_group(0);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn command `{}` with args {:?}", program, args))?;

        tracing::trace!("spawned command: {}: pid={}", program, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let quiet = spec.read_only;

        let stdout_handle = match thread::Builder::new()
            .name("stdout-reader".to_string())
            .spawn(move || read_pipe_to_log(stdout_pipe, StreamType::Stdout, quiet))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, []);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to spawn stdout reader thread: {}", e),
                ));
            }
        };

        let stderr_handle = match thread::Builder::new()
            .name("stderr-reader".to_string())
            .spawn(move || read_pipe_to_log(stderr_pipe, StreamType::Stderr, quiet))
        {
            Ok(handle) => handle,
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle]);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to spawn stderr reader thread: {}", e),
                ));
            }
        };

        let status = match wait_with_timeout(&mut child, spec.timeout) {
            Ok(Some(s)) => s,
            Ok(None) => {
                kill_process_group_of(&mut child, [stdout_handle, stderr_handle]);
                let secs = spec.timeout.map(|t| t.as_secs()).unwrap_or_default();
                return Err(Self::execution_error(spec, format!("timed out after {}s", secs)));
            }
            Err(e) => {
                cleanup_child_process(&mut child, [stdout_handle, stderr_handle]);
                return Err(Self::execution_error(
                    spec,
                    format!("failed to wait for command: {}", e),
                ));
            }
        };

        let mut captured = [String::new(), String::new()];
        let mut panicked_streams = Vec::new();
        let handles = [("stdout", stdout_handle), ("stderr", stderr_handle)];
        for (slot, (name, handle)) in captured.iter_mut().zip(handles) {
            match handle.join() {
                Ok(text) => *slot = text,
                Err(e) => {
                    let msg = panic_message(&*e);
                    tracing::error!(stream = name, panic = msg, "reader thread panicked");
                    panicked_streams.push(format!("{}: {}", name, msg));
                }
            }
        }

        if !panicked_streams.is_empty() {
            return Err(Self::execution_error(
                spec,
                format!(
                    "reader thread(s) panicked during command execution: {}",
                    panicked_streams.join(", ")
                ),
            ));
        }

        tracing::trace!("executed command: {}: success={}", program, status.success());

        let [stdout, stderr] = captured;
        Ok(ExecutionResult {
            status: Some(status),
            stdout,
            stderr,
        })
    }
}
