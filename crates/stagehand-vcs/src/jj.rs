//! `jj workspace` checkouts

use async_trait::async_trait;
use stagehand_core::{Result, StagehandError};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::checkout::{run_command, Checkout};

/// Creates workspaces as jj workspaces named after their directory
#[derive(Debug, Clone)]
pub struct JjWorkspace {
    repo_root: PathBuf,
}

impl JjWorkspace {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Discover the repository containing `path`
    pub async fn detect(path: &Path) -> Result<Self> {
        let output = run_command("jj", &["root"], path).await?;

        if !output.success {
            return Err(StagehandError::Checkout("Not in a jj repository".to_string()));
        }

        Ok(Self::new(output.stdout.trim()))
    }

    fn workspace_name(path: &Path) -> Result<&str> {
        path.file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                StagehandError::Checkout(format!("invalid workspace path: {}", path.display()))
            })
    }
}

#[async_trait]
impl Checkout for JjWorkspace {
    async fn create(&self, path: &Path) -> Result<()> {
        let name = Self::workspace_name(path)?;
        let path_str = path.to_str().ok_or_else(|| {
            StagehandError::Checkout("workspace path contains non-UTF-8 characters".into())
        })?;

        run_command(
            "jj",
            &["workspace", "add", "--name", name, path_str],
            &self.repo_root,
        )
        .await?
        .into_result("jj workspace add")?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let name = Self::workspace_name(path)?;

        let output = run_command("jj", &["workspace", "forget", name], &self.repo_root).await?;
        if !output.success {
            debug!("Workspace forget warning: {}", output.stderr);
        }

        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        // jj drops forgotten workspaces itself
        Ok(())
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}
