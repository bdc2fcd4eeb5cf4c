// Shell execution for delegation commands.
// Every bootstrap/install/check/remove script runs as `sh -lc "<cmd>"`
// with the composed environment map applied on top of the process
// environment. stdout and stderr are read line-buffered and forwarded to
// a per-line callback, which the engine wires into the event stream and
// the session install log.

use crate::libs::errors::EnvboxError;
use crate::log_debug;
use colored::Colorize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-line output callback. Receives each line of stdout and stderr as
/// it is produced, already stripped of the trailing newline.
pub type OutputFn<'a> = &'a (dyn Fn(&str) + Sync);

const ERROR_TAIL_LINES: usize = 10;

/// Runs `command` through the shell, streaming output to `on_line`.
///
/// A non-zero exit status is an execution error whose message carries the
/// last few output lines, so failures are diagnosable without digging
/// through the session log. When `cancel` is set before the process
/// starts, the command is not run at all.
pub fn run_shell(
    command: &str,
    envs: &BTreeMap<String, String>,
    cwd: Option<&Path>,
    on_line: OutputFn<'_>,
    cancel: Option<&AtomicBool>,
) -> Result<(), EnvboxError> {
    if let Some(flag) = cancel {
        if flag.load(Ordering::Relaxed) {
            return Err(EnvboxError::Execution(format!("command '{command}' cancelled")));
        }
    }

    log_debug!("[Shell] Running: {}", command.cyan());
    let mut cmd = Command::new("sh");
    cmd.arg("-lc").arg(command);
    cmd.envs(envs);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|err| EnvboxError::Execution(format!("failed to spawn '{command}': {err}")))?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    // stderr is drained on a helper thread so neither pipe can fill up and
    // stall the child; lines from both streams share the same callback.
    let tail = std::sync::Mutex::new(Vec::<String>::new());
    let outcome = std::thread::scope(|scope| {
        let stderr_tail = &tail;
        let stderr_handle = scope.spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                on_line(&line);
                push_tail(stderr_tail, line);
            }
        });

        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            on_line(&line);
            push_tail(&tail, line);
        }
        let _ = stderr_handle.join();

        child
            .wait()
            .map_err(|err| EnvboxError::Execution(format!("waiting for '{command}': {err}")))
    })?;

    if !outcome.success() {
        let code = outcome.code().unwrap_or(-1);
        let captured = tail.into_inner().unwrap_or_default();
        let context = if captured.is_empty() {
            String::new()
        } else {
            format!("; last output:\n{}", captured.join("\n"))
        };
        return Err(EnvboxError::Execution(format!(
            "command '{command}' exited with status {code}{context}"
        )));
    }
    Ok(())
}

fn push_tail(tail: &std::sync::Mutex<Vec<String>>, line: String) {
    let mut tail = tail.lock().unwrap();
    tail.push(line);
    let excess = tail.len().saturating_sub(ERROR_TAIL_LINES);
    if excess > 0 {
        tail.drain(..excess);
    }
}

/// Runs `command` and captures stdout, used by shell version resolvers.
/// stderr is discarded; a non-zero exit is an execution error.
pub fn run_shell_capture(
    command: &str,
    envs: &BTreeMap<String, String>,
    cwd: Option<&Path>,
) -> Result<String, EnvboxError> {
    log_debug!("[Shell] Capturing: {}", command.cyan());
    let mut cmd = Command::new("sh");
    cmd.arg("-lc").arg(command);
    cmd.envs(envs);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .map_err(|err| EnvboxError::Execution(format!("failed to spawn '{command}': {err}")))?;
    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EnvboxError::Execution(format!(
            "command '{command}' exited with status {code}: {}",
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
