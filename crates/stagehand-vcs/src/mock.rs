//! Mock checkout for testing

use async_trait::async_trait;
use stagehand_core::{Result, StagehandError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::checkout::Checkout;

#[derive(Default)]
struct MockState {
    creates: AtomicUsize,
    removes: AtomicUsize,
    prunes: AtomicUsize,
    fail_create: AtomicBool,
    fail_remove: AtomicBool,
    removed: Mutex<Vec<PathBuf>>,
}

/// In-process checkout that creates plain directories and counts calls
///
/// Clones share counters, so a test can keep one handle while the pool owns
/// another.
#[derive(Clone)]
pub struct MockCheckout {
    repo_root: PathBuf,
    create_delay: Duration,
    remove_delay: Duration,
    state: Arc<MockState>,
}

impl MockCheckout {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            create_delay: Duration::ZERO,
            remove_delay: Duration::ZERO,
            state: Arc::new(MockState::default()),
        }
    }

    /// Simulate a slow `create`
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Simulate a slow `remove`
    pub fn with_remove_delay(mut self, delay: Duration) -> Self {
        self.remove_delay = delay;
        self
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.state.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.state.removes.load(Ordering::SeqCst)
    }

    pub fn prune_calls(&self) -> usize {
        self.state.prunes.load(Ordering::SeqCst)
    }

    /// Paths successfully removed, in order
    pub fn removed_paths(&self) -> Vec<PathBuf> {
        self.state
            .removed
            .lock()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Checkout for MockCheckout {
    async fn create(&self, path: &Path) -> Result<()> {
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(StagehandError::Checkout(format!(
                "mock create failed for {}",
                path.display()
            )));
        }

        std::fs::create_dir_all(path)?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.state.removes.fetch_add(1, Ordering::SeqCst);
        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }

        if self.state.fail_remove.load(Ordering::SeqCst) {
            return Err(StagehandError::Checkout(format!(
                "mock remove failed for {}",
                path.display()
            )));
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        if let Ok(mut removed) = self.state.removed.lock() {
            removed.push(path.to_path_buf());
        }
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        self.state.prunes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}
