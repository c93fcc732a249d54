//! External command execution

use crate::error::{ArmadaError, Result};
use tokio::process::Command;

/// Run `program` with `args` and return its stdout.
///
/// A non-zero exit is an error carrying the trimmed stderr.
pub async fn run(program: &str, args: &[String]) -> Result<String> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::debug!("Running: {}", command_line);

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ArmadaError::Command {
            command: command_line.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };
        return Err(ArmadaError::Command {
            command: command_line,
            message,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Build an owned argument list
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
