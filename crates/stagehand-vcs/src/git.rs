//! `git worktree` checkouts

use async_trait::async_trait;
use stagehand_core::{Result, StagehandError};
use std::path::{Path, PathBuf};

use crate::checkout::{run_command, Checkout};

/// Creates workspaces as detached git worktrees of one repository
#[derive(Debug, Clone)]
pub struct GitWorktree {
    repo_root: PathBuf,
}

impl GitWorktree {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Discover the repository containing `path`
    pub async fn detect(path: &Path) -> Result<Self> {
        let output = run_command("git", &["rev-parse", "--show-toplevel"], path).await?;

        if !output.success {
            return Err(StagehandError::Checkout(format!(
                "Not in a git repository: {}",
                path.display()
            )));
        }

        Ok(Self::new(output.stdout.trim()))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        StagehandError::Checkout(format!(
            "checkout path contains non-UTF-8 characters: {}",
            path.display()
        ))
    })
}

#[async_trait]
impl Checkout for GitWorktree {
    async fn create(&self, path: &Path) -> Result<()> {
        run_command(
            "git",
            &["worktree", "add", "--detach", path_arg(path)?],
            &self.repo_root,
        )
        .await?
        .into_result("git worktree add")?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        run_command(
            "git",
            &["worktree", "remove", "--force", path_arg(path)?],
            &self.repo_root,
        )
        .await?
        .into_result("git worktree remove")?;
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        run_command("git", &["worktree", "prune"], &self.repo_root)
            .await?
            .into_result("git worktree prune")?;
        Ok(())
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_outside_repository() {
        let dir = tempfile::tempdir().unwrap();
        // Fails whether or not git is installed
        assert!(GitWorktree::detect(dir.path()).await.is_err());
    }

    #[test]
    fn test_repo_root() {
        let git = GitWorktree::new("/tmp/repo");
        assert_eq!(git.repo_root(), Path::new("/tmp/repo"));
    }
}
