//! Checkout primitive abstraction

use async_trait::async_trait;
use stagehand_core::{Result, StagehandError};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a checkout command
#[derive(Debug, Clone)]
pub struct CheckoutOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl From<Output> for CheckoutOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

impl CheckoutOutput {
    /// Turn a failed command into a `Checkout` error carrying its stderr
    pub fn into_result(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(StagehandError::Checkout(format!(
                "{} failed: {}",
                what,
                self.stderr.trim()
            )))
        }
    }
}

/// Version-control primitive that creates and removes isolated checkouts
///
/// Implementations are fallible external process calls; callers bound them
/// with timeouts.
#[async_trait]
pub trait Checkout: Send + Sync + 'static {
    /// Create a checkout at `path`
    async fn create(&self, path: &Path) -> Result<()>;

    /// Remove the checkout at `path`
    async fn remove(&self, path: &Path) -> Result<()>;

    /// Drop stale bookkeeping for checkouts that no longer exist
    async fn prune(&self) -> Result<()>;

    /// Repository the checkouts are created from
    fn repo_root(&self) -> &Path;
}

/// Run an external command in `cwd`, capturing its output
///
/// The child is killed if the returned future is dropped, so a caller that
/// times out does not leave a process behind.
#[instrument(skip(args), fields(args = ?args))]
pub async fn run_command(program: &str, args: &[&str], cwd: &Path) -> Result<CheckoutOutput> {
    debug!("Executing {} {:?} in {}", program, args, cwd.display());

    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StagehandError::Checkout(format!("Failed to execute {}: {}", program, e)))?;

    let output = CheckoutOutput::from(output);

    if !output.success {
        debug!("{} command failed: {}", program, output.stderr);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_output_becomes_checkout_error() {
        let output = CheckoutOutput {
            stdout: String::new(),
            stderr: "fatal: not a git repository\n".to_string(),
            success: false,
        };

        let err = output.into_result("git worktree add").unwrap_err();
        assert!(matches!(err, StagehandError::Checkout(ref msg)
            if msg == "git worktree add failed: fatal: not a git repository"));
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let cwd = std::env::temp_dir();
        let result = run_command("stagehand-no-such-binary", &["--version"], &cwd).await;
        assert!(matches!(result, Err(StagehandError::Checkout(_))));
    }
}
