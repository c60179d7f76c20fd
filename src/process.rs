//! Subprocess execution on the background pool.
//!
//! Commands are argv vectors, never shell strings.  A run resolves to the
//! child's stdout; a non-zero exit or signal death resolves to a structured
//! failure carrying the argv, the status, and the captured stderr.

use crate::flow::{Future, Runtime};
use crate::value::{TaskError, Value};
use std::path::PathBuf;
use std::process;

/// What to execute: argv, optional working directory, extra environment.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Command {
        Command {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Command::default()
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Command {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Command {
        self.env.push((key.into(), val.into()));
        self
    }
}

#[cfg(unix)]
fn describe_status(status: process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    if let Some(sig) = status.signal() {
        let name = match sig {
            libc::SIGINT => "SIGINT",
            libc::SIGTERM => "SIGTERM",
            libc::SIGKILL => "SIGKILL",
            libc::SIGSEGV => "SIGSEGV",
            _ => return format!("signal {}", sig),
        };
        return name.to_string();
    }
    format!("exit {}", status.code().unwrap_or(-1))
}

#[cfg(not(unix))]
fn describe_status(status: process::ExitStatus) -> String {
    format!("exit {}", status.code().unwrap_or(-1))
}

fn failure(cmd: &Command, status: String, stderr: String) -> TaskError {
    TaskError(Value::map(vec![
        ("kind".to_string(), Value::str("process")),
        (
            "argv".to_string(),
            Value::list(cmd.argv.iter().map(|a| Value::str(a.clone()))),
        ),
        ("status".to_string(), Value::Str(status)),
        ("stderr".to_string(), Value::Str(stderr)),
    ]))
}

/// Run `cmd` on the background pool.  The future resolves to the child's
/// stdout on a zero exit, or fails with the status and stderr otherwise.
pub fn run(rt: &Runtime, cmd: Command) -> Future<String> {
    rt.submit(move || {
        let mut c = process::Command::new(&cmd.argv[0]);
        c.args(&cmd.argv[1..]);
        if let Some(dir) = &cmd.cwd {
            c.current_dir(dir);
        }
        for (k, v) in &cmd.env {
            c.env(k, v);
        }
        let out = c
            .output()
            .map_err(|e| failure(&cmd, format!("spawn failed: {}", e), String::new()))?;
        if !out.status.success() {
            return Err(failure(
                &cmd,
                describe_status(out.status),
                String::from_utf8_lossy(&out.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    })
}
