//! Production filesystem activities.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{EpisodeCopyRequest, MediaStore, PlannedTransfer};
use crate::copy::{self, CopySink, IntegrityReport};
use crate::detect;
use crate::error::Result;
use crate::fsops;
use crate::naming;
use crate::types::{DetectionResult, RenamedFile, SourceFile, StagingNode};
use crate::workflow::host::Heartbeat;

pub const EPISODES_DIR: &str = "_episodes";

#[derive(Debug, Default)]
pub struct FsMediaStore;

impl FsMediaStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn enumerate_source(&self, root: &Path) -> Result<Vec<SourceFile>> {
        fsops::enumerate_files(root).await
    }

    async fn enumerate_built(&self, root: &Path) -> Result<Vec<SourceFile>> {
        fsops::walk_all_files(root).await
    }

    async fn list_disc_folders(&self, series_dir: &Path) -> Result<Vec<std::path::PathBuf>> {
        fsops::list_subdirectories(series_dir).await
    }

    async fn list_videos(&self, folder: &Path) -> Result<Vec<SourceFile>> {
        fsops::collect_video_files(folder).await
    }

    async fn copy_batch(
        &self,
        files: &[SourceFile],
        dest_root: &Path,
        sink: Arc<dyn CopySink>,
        heartbeat: Heartbeat,
        dry_run: bool,
    ) -> Result<()> {
        copy::copy_files(files, dest_root, sink.as_ref(), &heartbeat, dry_run).await
    }

    async fn detect_episodes(&self, folder: &Path) -> Result<DetectionResult> {
        let videos = fsops::collect_video_files(folder).await?;
        let result = detect::detect_episodes(&videos);
        info!(
            target: "organize::detect",
            folder = %folder.display(),
            videos = videos.len(),
            episodes = result.episodes.len(),
            confidence = result.confidence.as_str(),
            "episode cluster detected"
        );
        Ok(result)
    }

    async fn copy_episode(&self, request: &EpisodeCopyRequest) -> Result<RenamedFile> {
        let extension = naming::file_extension(
            &request
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        let new_file_name = naming::plex_episode_file_name(
            &request.show_name,
            request.season_number,
            request.episode_number,
            request.episode_title.as_deref(),
            &extension,
        );
        let season_dir = request
            .series_root
            .join(EPISODES_DIR)
            .join(naming::season_dir_name(request.season_number));
        let destination = season_dir.join(&new_file_name);

        let renamed = RenamedFile {
            original_path: request.source_path.clone(),
            original_relative_path: request.source_relative_path.clone(),
            new_path: destination.clone(),
            new_file_name: new_file_name.clone(),
            season_number: request.season_number,
            episode_number: request.episode_number,
        };

        if request.dry_run {
            debug!(target: "organize::rename", file = %new_file_name, "dry run, skipping episode copy");
            return Ok(renamed);
        }

        if fs::metadata(&destination).await.is_ok() {
            debug!(target: "organize::rename", file = %new_file_name, "destination already present, skipping");
            return Ok(renamed);
        }

        fs::create_dir_all(&season_dir).await?;
        fs::copy(&request.source_path, &destination).await?;
        info!(
            target: "organize::rename",
            from = %request.source_path.display(),
            to = %destination.display(),
            "episode copied into working directory"
        );
        Ok(renamed)
    }

    async fn move_into_structure(
        &self,
        moves: &[PlannedTransfer],
        sink: Arc<dyn CopySink>,
        dry_run: bool,
    ) -> Result<usize> {
        let mut settled = 0;
        for transfer in moves {
            let name = file_name_of(&transfer.to);
            sink.transfer_started(&name);
            if dry_run {
                sink.transfer_finished(&name, 0);
                continue;
            }
            if fs::metadata(&transfer.to).await.is_ok() {
                // Already moved by a previous incarnation of this stage.
                settled += 1;
                sink.transfer_finished(&name, 0);
                continue;
            }
            if let Some(parent) = transfer.to.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&transfer.from, &transfer.to).await?;
            settled += 1;
            sink.transfer_finished(&name, 0);
        }
        Ok(settled)
    }

    async fn copy_extras(
        &self,
        copies: &[PlannedTransfer],
        sink: Arc<dyn CopySink>,
        heartbeat: Heartbeat,
        dry_run: bool,
    ) -> Result<usize> {
        let mut copied = 0;
        for transfer in copies {
            let name = file_name_of(&transfer.to);
            sink.transfer_started(&name);
            if dry_run {
                sink.transfer_finished(&name, 0);
                continue;
            }
            if let Some(parent) = transfer.to.parent() {
                fs::create_dir_all(parent).await?;
            }
            let bytes = fs::copy(&transfer.from, &transfer.to).await?;
            heartbeat.beat();
            copied += 1;
            sink.transfer_finished(&name, bytes);
        }
        Ok(copied)
    }

    async fn capture_staging_tree(&self, root: &Path) -> Result<StagingNode> {
        fsops::capture_tree(root).await
    }

    async fn verify_output_integrity(
        &self,
        source_root: &Path,
        output_root: &Path,
    ) -> Result<IntegrityReport> {
        let report = copy::verify_output_integrity(source_root, output_root).await?;
        if !report.verified {
            warn!(
                target: "organize::copy",
                missing = report.missing.len(),
                output = %output_root.display(),
                "output integrity verification failed"
            );
        }
        Ok(report)
    }

    async fn remove_tree(&self, path: &Path, dry_run: bool) -> Result<()> {
        if dry_run {
            debug!(target: "organize::fs", path = %path.display(), "dry run, keeping tree");
            return Ok(());
        }
        fsops::remove_tree(path).await
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
