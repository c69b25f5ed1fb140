//! Shell command execution
//!
//! All cluster tooling (`kubectl`, `helm`) is driven through these helpers.
//! Commands run with a timeout and return their combined stdout/stderr. The
//! silent variants skip logging entirely, for probes that are expected to
//! fail repeatedly while something is still converging.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::{Error, Result};

/// Upper bound for any single command execution.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Run a command, logging it and its outcome.
///
/// Returns combined stdout + stderr. A non-zero exit status is an error
/// carrying the same combined output.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    info!(command = %render(program, args), "running");
    let result = run_inner(program, args, None).await;
    if let Err(ref e) = result {
        warn!(command = %render(program, args), error = %e, "command failed");
    }
    result
}

/// Run a command without logging.
pub async fn run_silent(program: &str, args: &[&str]) -> Result<String> {
    run_inner(program, args, None).await
}

/// Run a command without logging, feeding `input` to its stdin.
///
/// Used to apply throwaway probe objects without materializing them on disk.
pub async fn run_silent_with_stdin(program: &str, args: &[&str], input: &str) -> Result<String> {
    run_inner(program, args, Some(input)).await
}

fn render(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

async fn run_inner(program: &str, args: &[&str], input: Option<&str>) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if input.is_some() {
        cmd.stdin(Stdio::piped());
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::cluster(format!("failed to spawn {}: {}", program, e)))?;

    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(input.as_bytes()).await?;
        }
    }

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result
            .map_err(|e| Error::cluster(format!("failed to execute {}: {}", program, e)))?,
        Err(_) => {
            return Err(Error::cluster(format!(
                "{} timed out after {:?}",
                program, COMMAND_TIMEOUT
            )));
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        Err(Error::cluster(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            combined.trim()
        )))
    }
}
