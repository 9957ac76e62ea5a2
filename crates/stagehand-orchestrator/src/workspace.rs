//! Bounded pool of isolated workspaces
//!
//! Every stage attempt runs in its own checkout. The pool enforces the
//! concurrency ceiling, arms an auto-reclaim deadline per workspace, and
//! funnels explicit release, deadline expiry, age pruning and run teardown
//! through one idempotent release path: only the caller that flips a
//! workspace from `active` to `reclaiming` performs the removal.

use chrono::Utc;
use stagehand_core::fail_open::{fail_open, fail_open_with_retries};
use stagehand_core::{
    Result, StageId, StagehandError, Utilization, Workspace, WorkspaceConfig, WorkspaceStatus,
};
use stagehand_vcs::Checkout;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `git worktree prune` can lose a race with a concurrent removal
const PRUNE_ATTEMPTS: usize = 3;

struct Entry {
    workspace: Workspace,
    deadline: Option<JoinHandle<()>>,
    purge: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    /// Acquisitions that passed the capacity check but are still provisioning
    reserved: usize,
}

impl Registry {
    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.workspace.status == WorkspaceStatus::Active)
            .count()
    }
}

struct Inner<C> {
    checkout: C,
    config: WorkspaceConfig,
    base_dir: PathBuf,
    snapshot_dir: PathBuf,
    registry: Mutex<Registry>,
    last_stamp: AtomicU64,
}

impl<C> Inner<C> {
    // Never held across an await
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Explicit,
    Deadline,
}

/// Outcome of a bulk release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<String>,
    /// (workspace id, error)
    pub failures: Vec<(String, String)>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Slot taken by an in-flight `acquire`; gives the slot back if dropped
struct Reservation<'a, C: Checkout> {
    pool: &'a WorkspacePool<C>,
    armed: bool,
}

impl<C: Checkout> Reservation<'_, C> {
    fn commit(mut self, workspace: Workspace) {
        let mut registry = self.pool.inner.registry();
        registry.reserved = registry.reserved.saturating_sub(1);
        self.armed = false;

        let deadline = self
            .pool
            .inner
            .config
            .auto_reclaim
            .then(|| self.pool.arm_deadline(workspace.id.clone()));

        registry.entries.insert(
            workspace.id.clone(),
            Entry {
                workspace,
                deadline,
                purge: None,
            },
        );
    }
}

impl<C: Checkout> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut registry = self.pool.inner.registry();
            registry.reserved = registry.reserved.saturating_sub(1);
        }
    }
}

/// Shared handle to the workspace pool
///
/// Clones share one registry, so several runs can draw from the same
/// ceiling.
pub struct WorkspacePool<C: Checkout> {
    inner: Arc<Inner<C>>,
}

impl<C: Checkout> Clone for WorkspacePool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn resolve(root: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        root.join(dir)
    }
}

async fn write_snapshot(snapshot_dir: &Path, workspace: &Workspace) -> Result<()> {
    let dir = snapshot_dir.join(&workspace.id);
    tokio::fs::create_dir_all(&dir).await?;
    let content = serde_json::to_string_pretty(workspace)?;
    tokio::fs::write(dir.join("metadata.json"), content).await?;
    Ok(())
}

impl<C: Checkout> WorkspacePool<C> {
    pub fn new(checkout: C, config: WorkspaceConfig) -> Self {
        let base_dir = resolve(checkout.repo_root(), &config.base_dir);
        let snapshot_dir = resolve(checkout.repo_root(), &config.snapshot_dir);

        Self {
            inner: Arc::new(Inner {
                checkout,
                config,
                base_dir,
                snapshot_dir,
                registry: Mutex::new(Registry::default()),
                last_stamp: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.inner.config
    }

    /// Directory workspaces are created under
    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn checkout(&self) -> &C {
        &self.inner.checkout
    }

    /// Milliseconds since the epoch, strictly increasing per pool
    fn next_stamp(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.inner.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.inner.last_stamp.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn reserve(&self) -> Result<Reservation<'_, C>> {
        let mut registry = self.inner.registry();
        let occupied = registry.active_count() + registry.reserved;
        let ceiling = self.inner.config.max_concurrent;

        if occupied >= ceiling {
            return Err(StagehandError::CapacityExceeded {
                active: occupied,
                ceiling,
            });
        }

        registry.reserved += 1;
        Ok(Reservation {
            pool: self,
            armed: true,
        })
    }

    /// Allocate a fresh workspace for one stage attempt
    ///
    /// Fails with `CapacityExceeded` without side effects when the pool is
    /// full, and with `ProvisionFailed` (nothing registered) when the
    /// checkout cannot be created.
    pub async fn acquire(
        &self,
        run_id: &str,
        stage: StageId,
        executor_id: &str,
    ) -> Result<Workspace> {
        let reservation = self.reserve()?;

        let id = format!("{}-{}-{}", stage, run_id, self.next_stamp());
        let path = self.inner.base_dir.join(&id);
        debug!(workspace_id = %id, path = %path.display(), "Provisioning workspace");

        if let Err(e) = self.provision(&path).await {
            warn!(workspace_id = %id, "Workspace provisioning failed: {}", e);
            if path.exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            return Err(StagehandError::ProvisionFailed(format!("{}: {}", id, e)));
        }

        let workspace = Workspace {
            id: id.clone(),
            run_id: run_id.to_string(),
            stage,
            path,
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
            reclaimed_at: None,
            executor_id: executor_id.to_string(),
        };
        reservation.commit(workspace.clone());

        info!(workspace_id = %id, stage = %stage, run_id, "Workspace acquired");
        Ok(workspace)
    }

    async fn provision(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(&self.inner.base_dir)?;
        self.inner.checkout.create(path).await
    }

    fn arm_deadline(&self, id: String) -> JoinHandle<()> {
        let pool = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.auto_reclaim_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let pool = WorkspacePool { inner };

            info!(workspace_id = %id, "Auto-reclaim deadline reached");
            if let Err(e) = pool.release_with(&id, Trigger::Deadline).await {
                warn!(workspace_id = %id, "Auto-reclaim failed: {}", e);
            }
        })
    }

    fn arm_purge(&self, id: String) -> JoinHandle<()> {
        let pool = Arc::downgrade(&self.inner);
        let grace = self.inner.config.reclaimed_grace();

        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = pool.upgrade() else {
                return;
            };
            let mut registry = inner.registry();
            let reclaimed = registry
                .entries
                .get(&id)
                .is_some_and(|e| e.workspace.status == WorkspaceStatus::Reclaimed);
            if reclaimed {
                registry.entries.remove(&id);
                debug!(workspace_id = %id, "Purged reclaimed workspace");
            }
        })
    }

    /// Reclaim a workspace
    ///
    /// Idempotent: a workspace that is already reclaiming or reclaimed
    /// returns `Ok(())` without repeating any work. Unknown (or purged) ids
    /// are `WorkspaceNotFound`.
    pub async fn release(&self, workspace_id: &str) -> Result<()> {
        self.release_with(workspace_id, Trigger::Explicit).await
    }

    async fn release_with(&self, workspace_id: &str, trigger: Trigger) -> Result<()> {
        let workspace = {
            let mut registry = self.inner.registry();
            let entry = registry
                .entries
                .get_mut(workspace_id)
                .ok_or_else(|| StagehandError::WorkspaceNotFound(workspace_id.to_string()))?;

            if entry.workspace.status != WorkspaceStatus::Active {
                debug!(
                    workspace_id,
                    status = %entry.workspace.status,
                    "Release skipped, workspace already {}",
                    entry.workspace.status
                );
                return Ok(());
            }

            entry.workspace.status = WorkspaceStatus::Reclaiming;
            if let Some(deadline) = entry.deadline.take() {
                if trigger == Trigger::Explicit {
                    deadline.abort();
                }
            }
            entry.workspace.clone()
        };

        info!(workspace_id, trigger = ?trigger, "Reclaiming workspace");

        if self.inner.config.snapshots {
            let snapshot_dir = &self.inner.snapshot_dir;
            fail_open("workspace_snapshot", || write_snapshot(snapshot_dir, &workspace)).await;
        }

        let removal_timeout = self.inner.config.removal_timeout();
        let removal = match tokio::time::timeout(
            removal_timeout,
            self.inner.checkout.remove(&workspace.path),
        )
        .await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "removal timed out after {}s",
                removal_timeout.as_secs()
            )),
        };

        fail_open_with_retries("checkout_prune", || self.inner.checkout.prune(), PRUNE_ATTEMPTS).await;

        match removal {
            Ok(()) => {
                let mut registry = self.inner.registry();
                let purge = self.arm_purge(workspace_id.to_string());
                if let Some(entry) = registry.entries.get_mut(workspace_id) {
                    entry.workspace.status = WorkspaceStatus::Reclaimed;
                    entry.workspace.reclaimed_at = Some(Utc::now());
                    entry.purge = Some(purge);
                }
                info!(workspace_id, "Workspace reclaimed");
                Ok(())
            }
            Err(e) => {
                warn!(workspace_id, "Workspace removal failed: {}", e);
                Err(StagehandError::RemovalFailed(format!("{}: {}", workspace_id, e)))
            }
        }
    }

    async fn release_each(&self, ids: Vec<String>) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for id in ids {
            match self.release(&id).await {
                Ok(()) => report.released.push(id),
                Err(e) => report.failures.push((id, e.to_string())),
            }
        }
        report
    }

    fn active_ids(&self, filter: impl Fn(&Workspace) -> bool) -> Vec<String> {
        let registry = self.inner.registry();
        let mut active: Vec<&Workspace> = registry
            .entries
            .values()
            .map(|e| &e.workspace)
            .filter(|w| w.status == WorkspaceStatus::Active && filter(w))
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        active.into_iter().map(|w| w.id.clone()).collect()
    }

    /// Best-effort release of every active workspace
    pub async fn release_all(&self) -> ReleaseReport {
        let ids = self.active_ids(|_| true);
        self.release_each(ids).await
    }

    /// Best-effort release of the active workspaces owned by one run
    pub async fn release_run(&self, run_id: &str) -> ReleaseReport {
        let ids = self.active_ids(|w| w.run_id == run_id);
        self.release_each(ids).await
    }

    /// Release active workspaces at least `max_age` old
    pub async fn prune_expired(&self, max_age: Duration) -> ReleaseReport {
        let now = Utc::now();
        let ids = self.active_ids(|w| {
            (now - w.created_at)
                .to_std()
                .map(|age| age >= max_age)
                .unwrap_or(max_age.is_zero())
        });

        if !ids.is_empty() {
            info!("Pruning {} expired workspaces", ids.len());
        }
        self.release_each(ids).await
    }

    /// Remove directories under the base dir that this pool does not track
    ///
    /// These are left behind by a process that exited without releasing its
    /// workspaces. Directories modified within `min_age` are kept, since they
    /// may belong to a run in another process.
    pub async fn recover_orphans(&self, min_age: Duration) -> Result<ReleaseReport> {
        let mut report = ReleaseReport::default();
        if !self.inner.base_dir.exists() {
            return Ok(report);
        }

        let tracked: HashSet<String> = self.inner.registry().entries.keys().cloned().collect();
        let mut orphans = Vec::new();
        for entry in std::fs::read_dir(&self.inner.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let age = entry
                .metadata()?
                .modified()?
                .elapsed()
                .unwrap_or(Duration::ZERO);
            if age < min_age {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !tracked.contains(&name) {
                orphans.push((name, entry.path()));
            }
        }
        orphans.sort();

        let removal_timeout = self.inner.config.removal_timeout();
        for (name, path) in orphans {
            info!(workspace_id = %name, "Removing orphaned workspace");
            match tokio::time::timeout(removal_timeout, self.inner.checkout.remove(&path)).await {
                Ok(Ok(())) => report.released.push(name),
                Ok(Err(e)) => report.failures.push((name, e.to_string())),
                Err(_) => report.failures.push((
                    name,
                    format!("removal timed out after {}s", removal_timeout.as_secs()),
                )),
            }
        }

        fail_open_with_retries("checkout_prune", || self.inner.checkout.prune(), PRUNE_ATTEMPTS).await;
        Ok(report)
    }

    pub fn utilization(&self) -> Utilization {
        let active = self.inner.registry().active_count();
        Utilization::new(active, self.inner.config.max_concurrent)
    }

    pub fn get(&self, workspace_id: &str) -> Option<Workspace> {
        self.inner
            .registry()
            .entries
            .get(workspace_id)
            .map(|e| e.workspace.clone())
    }

    /// Every tracked workspace, oldest first
    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self
            .inner
            .registry()
            .entries
            .values()
            .map(|e| e.workspace.clone())
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn active(&self) -> Vec<Workspace> {
        self.list()
            .into_iter()
            .filter(|w| w.status == WorkspaceStatus::Active)
            .collect()
    }

    pub fn exists_on_disk(&self, workspace_id: &str) -> bool {
        self.get(workspace_id)
            .map(|w| w.path)
            .unwrap_or_else(|| self.inner.base_dir.join(workspace_id))
            .exists()
    }

    /// Cancel every pending deadline and purge task
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry();
        let mut cancelled = 0;
        for entry in registry.entries.values_mut() {
            for handle in [entry.deadline.take(), entry.purge.take()].into_iter().flatten() {
                handle.abort();
                cancelled += 1;
            }
        }
        debug!("Workspace pool shut down, {} timers cancelled", cancelled);
    }
}
