//! Execution of networking commands (`ip`, `bridge`).
//!
//! Commands run through `/bin/sh -c`; every argument taken from
//! configuration or resource names must be passed through [`shellquote`]
//! (or built with [`command_line`]) before it reaches the shell.
//!
//! ```ignore
//! use evpn_common::shell::{self, IP_CMD};
//!
//! let cmd = shell::command_line(IP_CMD, ["-j", "-d", "route", "show", "table", "1000"]);
//! let json = shell::exec_checked(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Path to the `ip` command.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `bridge` command.
pub const BRIDGE_CMD: &str = "/sbin/bridge";

/// Errors from command execution.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {exit_code}: {output}")]
    Failed {
        command: String,
        exit_code: i32,
        output: String,
    },
}

/// Characters special inside shell double quotes: `$`, `` ` ``, `"`, `\`
/// and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("shell escape pattern is valid"));

/// Quotes a string for use inside a `/bin/sh` command line.
///
/// The result is wrapped in double quotes with `$`, `` ` ``, `"`, `\` and
/// newline escaped.
///
/// ```
/// use evpn_common::shell::shellquote;
///
/// assert_eq!(shellquote("br-blue"), "\"br-blue\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Builds `program arg1 arg2 ...` with every argument quoted.
pub fn command_line<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&shellquote(arg.as_ref()));
    }
    line
}

/// Outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs `cmd` and returns its exit code and trimmed output.
///
/// Only a failure to spawn the shell is an error; a non-zero exit status is
/// reported in the result.
pub async fn exec(cmd: &str) -> Result<ExecResult, ShellError> {
    debug!(command = %cmd, "Executing command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| ShellError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        trace!(command = %cmd, bytes = result.stdout.len(), "Command succeeded");
    } else {
        warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }
    Ok(result)
}

/// Runs `cmd` and returns its stdout, turning a non-zero exit into an error.
pub async fn exec_checked(cmd: &str) -> Result<String, ShellError> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(ShellError::Failed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
