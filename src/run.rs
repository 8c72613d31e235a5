//! Subprocess execution.
//!
//! All external tools are driven through [`run`]: the child gets a fully
//! explicit environment when one is provided, its output is streamed
//! line-wise into the caller's [`BuildLog`], and a non-zero exit becomes
//! a typed [`Error::CommandFailed`] carrying the command and captured
//! stderr.

use crate::error::Error;
use crate::logs::BuildLog;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Options for one subprocess invocation.
#[derive(Default)]
pub struct RunOptions {
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Explicit environment. `Some` replaces the inherited environment
    /// entirely; `None` inherits the parent's.
    pub env: Option<HashMap<String, String>>,
    /// When false, a non-zero exit is returned as a normal
    /// [`CommandOutput`] instead of an error.
    pub no_check: bool,
    /// Suppress echoing the command line into the log (used for
    /// invocations that embed secrets).
    pub quiet: bool,
}

/// Captured result of a completed subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code; -1 when the child was killed by a signal.
    pub code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the child exited successfully.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

fn display_command(argv: &[&str]) -> String {
    shlex::try_join(argv.iter().copied()).unwrap_or_else(|_| argv.join(" "))
}

/// Run a command, streaming its output into `log`.
pub fn run(argv: &[&str], opts: &RunOptions, log: &BuildLog) -> Result<CommandOutput, Error> {
    assert!(!argv.is_empty());
    let command = display_command(argv);
    if !opts.quiet {
        log.line(&format!("$ {}", command));
    }

    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = &opts.env {
        cmd.env_clear();
        cmd.envs(env);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let child_stdout = child.stdout.take().unwrap();
    let child_stderr = child.stderr.take().unwrap();

    let mut stdout = String::new();
    let mut stderr = String::new();
    std::thread::scope(|scope| {
        let stderr_handle = scope.spawn(move || {
            let mut captured = String::new();
            for line in BufReader::new(child_stderr).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                log.line(&line);
                captured.push_str(&line);
                captured.push('\n');
            }
            captured
        });
        for line in BufReader::new(child_stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            log.line(&line);
            stdout.push_str(&line);
            stdout.push('\n');
        }
        stderr = stderr_handle.join().unwrap_or_default();
    });

    let status = child.wait()?;
    let code = status.code().unwrap_or(-1);
    let output = CommandOutput {
        code,
        stdout,
        stderr,
    };
    if !output.success() && !opts.no_check {
        return Err(Error::CommandFailed {
            command,
            code,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// Run a shell snippet through `/bin/bash -c`.
pub fn run_shell(script: &str, opts: &RunOptions, log: &BuildLog) -> Result<CommandOutput, Error> {
    run(&["/bin/bash", "-c", script], opts, log)
}

/// Spawn a command with inherited stdio, for the post-mortem debug shell.
pub fn run_interactive(argv: &[&str], env: Option<&HashMap<String, String>>) -> Result<(), Error> {
    let mut cmd = Command::new(argv[0]);
    cmd.args(&argv[1..]);
    if let Some(env) = env {
        cmd.env_clear();
        cmd.envs(env);
    }
    let status = cmd.status()?;
    if !status.success() {
        log::debug!("interactive shell exited with {:?}", status.code());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{run, run_shell, RunOptions};
    use crate::error::Error;
    use crate::logs::BuildLog;

    #[test]
    fn test_run_captures_stdout() {
        let out = run(
            &["echo", "hello"],
            &RunOptions::default(),
            &BuildLog::null(),
        )
        .unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout, "hello\n");
    }

    #[test]
    fn test_run_failure_carries_stderr() {
        let err = run_shell(
            "echo oops >&2; exit 3",
            &RunOptions::default(),
            &BuildLog::null(),
        )
        .unwrap_err();
        match err {
            Error::CommandFailed {
                code,
                stderr,
                ..
            } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops\n");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_run_no_check_returns_output() {
        let opts = RunOptions {
            no_check: true,
            ..Default::default()
        };
        let out = run_shell("exit 7", &opts, &BuildLog::null()).unwrap();
        assert_eq!(out.code, 7);
    }

    #[test]
    fn test_run_explicit_env_replaces_inherited() {
        let mut env = std::collections::HashMap::new();
        env.insert("ONLY_VAR".to_string(), "42".to_string());
        let opts = RunOptions {
            env: Some(env),
            ..Default::default()
        };
        let out = run_shell("echo ${ONLY_VAR}${HOME}", &opts, &BuildLog::null()).unwrap();
        assert_eq!(out.stdout, "42\n");
    }

    #[test]
    fn test_run_streams_to_log() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("run.log");
        let log = BuildLog::to_file(&path).unwrap();
        run(&["echo", "streamed"], &RunOptions::default(), &log).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("$ echo streamed"));
        assert!(contents.contains("streamed"));
    }
}
