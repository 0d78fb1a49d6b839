//! Progress and signal surface.
//!
//! Queries are value snapshots of coordinator state and never block on
//! coordinator work; signals are typed messages applied atomically to a
//! shared store the coordinators gate on. Derived folder counts are
//! recomputed on every mutation so a snapshot is always internally
//! consistent.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::types::{
    DetectionConfirmation, FinalizeDecision, FolderStatus, OrganizeLibraryProgress,
    ProcessFolderProgress, ReviewDecision, StagingNode,
};

/// Typed signals accepted by a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Finalize { approved: bool },
    ReviewDecision(ReviewDecision),
    DetectionConfirmation {
        folder_name: String,
        confirmation: DetectionConfirmation,
    },
}

/// Signal state the coordinators wait on. Review decisions are keyed by
/// review item id, detection confirmations by folder name; a later signal
/// for the same key replaces the earlier one.
#[derive(Debug, Default)]
pub struct SignalStore {
    pub finalize: Option<FinalizeDecision>,
    pub reviews: HashMap<String, ReviewDecision>,
    pub detections: HashMap<String, DetectionConfirmation>,
}

#[derive(Debug, Default)]
pub struct SignalHub {
    store: Mutex<SignalStore>,
    notify: Notify,
}

impl SignalHub {
    pub async fn apply(&self, signal: Signal) {
        {
            let mut store = self.store.lock().await;
            match signal {
                Signal::Finalize { approved } => {
                    debug!(target: "organize::signals", approved, "finalize signal received");
                    store.finalize = Some(FinalizeDecision { approved });
                }
                Signal::ReviewDecision(decision) => {
                    debug!(
                        target: "organize::signals",
                        id = %decision.review_item_id,
                        approved = decision.approved,
                        "review decision received"
                    );
                    store
                        .reviews
                        .insert(decision.review_item_id.clone(), decision);
                }
                Signal::DetectionConfirmation {
                    folder_name,
                    confirmation,
                } => {
                    debug!(
                        target: "organize::signals",
                        folder = %folder_name,
                        confirmed = confirmation.confirmed,
                        "detection confirmation received"
                    );
                    store.detections.insert(folder_name, confirmation);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Suspend until `f` yields a value. The closure may consume store
    /// entries; consumption and the emptiness test are atomic.
    pub async fn wait_until<T>(&self, mut f: impl FnMut(&mut SignalStore) -> Option<T>) -> T {
        loop {
            let notified = self.notify.notified();
            {
                let mut store = self.store.lock().await;
                if let Some(value) = f(&mut store) {
                    return value;
                }
            }
            notified.await;
        }
    }
}

/// Live projection of coordinator state behind the three queries.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    library: RwLock<OrganizeLibraryProgress>,
    discs: RwLock<HashMap<String, ProcessFolderProgress>>,
    staging_tree: RwLock<Option<StagingNode>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ProgressRegistry {
    pub fn library_progress(&self) -> OrganizeLibraryProgress {
        read(&self.library).clone()
    }

    pub fn disc_progress(&self, folder_name: &str) -> Option<ProcessFolderProgress> {
        read(&self.discs).get(folder_name).cloned()
    }

    pub fn staging_tree(&self) -> Option<StagingNode> {
        read(&self.staging_tree).clone()
    }

    pub fn set_staging_tree(&self, tree: StagingNode) {
        *write(&self.staging_tree) = Some(tree);
    }

    pub fn update_library(&self, f: impl FnOnce(&mut OrganizeLibraryProgress)) {
        let mut progress = write(&self.library);
        f(&mut progress);
        recompute(&mut progress);
    }

    pub fn update_disc(&self, folder_name: &str, f: impl FnOnce(&mut ProcessFolderProgress)) {
        let mut discs = write(&self.discs);
        let entry = discs
            .entry(folder_name.to_string())
            .or_insert_with(|| ProcessFolderProgress::new(folder_name));
        f(entry);
    }

    /// Move one folder to `status` in both the disc view and the library's
    /// keyed status map. Keyed updates commute, so out-of-order child
    /// completions are safe.
    pub fn transition_folder(&self, folder_name: &str, status: FolderStatus) {
        self.update_disc(folder_name, |p| p.status = status);
        self.update_library(|p| {
            p.folder_statuses.insert(folder_name.to_string(), status);
        });
    }
}

fn recompute(progress: &mut OrganizeLibraryProgress) {
    let statuses = &progress.folder_statuses;
    progress.folders_completed = statuses
        .values()
        .filter(|s| **s == FolderStatus::Completed)
        .count();
    progress.folders_failed = statuses
        .values()
        .filter(|s| **s == FolderStatus::Failed)
        .count();
    progress.folders_pending_review = statuses
        .values()
        .filter(|s| s.is_awaiting_human())
        .count();
    let pending = statuses
        .values()
        .filter(|s| **s == FolderStatus::Pending)
        .count();
    progress.folders_in_progress = progress
        .total_folders
        .saturating_sub(progress.folders_completed)
        .saturating_sub(progress.folders_failed)
        .saturating_sub(progress.folders_pending_review)
        .saturating_sub(pending);
    progress.unresolved_core_episode_count = progress
        .expected_core_episode_count
        .saturating_sub(progress.resolved_core_episode_count);
}
