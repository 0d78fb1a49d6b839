//! Durable workflow runtime: coordinators, journal, and the query/signal
//! surface.

pub mod disc;
pub mod host;
pub mod journal;
pub mod library;
pub mod progress;

use std::sync::Arc;

use tracing::info;

use crate::activities::ActivitySet;
use crate::error::{OrganizeError, Result};
use crate::types::{
    OrganizeLibraryProgress, OrganizeLibraryResult, OrganizeRequest, ProcessFolderProgress,
    StagingNode,
};

pub use host::WorkflowCtx;
pub use library::OrganizeEnvironment;
pub use progress::Signal;

/// Live handle on one running (or resumed) organize run: value-snapshot
/// queries plus the typed signal inlet.
pub struct OrganizeHandle {
    workflow_id: String,
    ctx: Arc<WorkflowCtx>,
    join: tokio::task::JoinHandle<OrganizeLibraryResult>,
}

impl OrganizeHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn get_progress(&self) -> OrganizeLibraryProgress {
        self.ctx.progress().library_progress()
    }

    pub fn get_folder_progress(&self, folder_name: &str) -> Option<ProcessFolderProgress> {
        self.ctx.progress().disc_progress(folder_name)
    }

    pub fn get_staging_tree(&self) -> Option<StagingNode> {
        self.ctx.progress().staging_tree()
    }

    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.ctx.deliver_signal(signal).await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Hard-stop the coordinator task, as a host crash would. Completed steps
    /// stay journaled; a later [`start_organize`] with the same run directory
    /// resumes from them.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub async fn join(self) -> Result<OrganizeLibraryResult> {
        self.join
            .await
            .map_err(|e| OrganizeError::Internal(format!("workflow task failed: {e}")))
    }
}

/// Start (or resume after a crash) one organize run. The run's journal lives
/// under `run_dir`; invoking again with the same journal replays completed
/// work instead of re-doing it.
pub async fn start_organize(
    activities: ActivitySet,
    environment: OrganizeEnvironment,
    run_dir: std::path::PathBuf,
    max_concurrent_activities: usize,
    request: OrganizeRequest,
) -> Result<OrganizeHandle> {
    let ctx = Arc::new(
        WorkflowCtx::open_root(&request.workflow_id, run_dir, max_concurrent_activities).await?,
    );
    info!(
        target: "organize::workflow",
        workflow = %request.workflow_id,
        series = %request.series_dir.display(),
        dry_run = request.dry_run,
        "organize run starting"
    );

    let join = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            library::organize_library(&ctx, &activities, &environment, &request).await
        })
    };

    Ok(OrganizeHandle {
        workflow_id: ctx.workflow_id().to_string(),
        ctx,
        join,
    })
}
