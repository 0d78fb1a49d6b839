//! Library coordinator.
//!
//! Drives the six stages in strict order: copy-in, metadata, disc fan-out,
//! structuring, finalize gate, publish. All intermediate state lives under
//! the processing and staging roots keyed by workflow id; the output root is
//! only touched after an approved finalize, and an integrity failure leaves
//! both sandboxes in place for debugging.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::activities::{ActivitySet, PlannedTransfer};
use crate::copy::CopySink;
use crate::error::Result;
use crate::naming;
use crate::types::{
    CopyProgress, EpisodeMetadata, FolderResult, FolderStatus, MetadataStatus, MetadataSummary,
    OrganizeLibraryResult, OrganizeRequest, ProcessFolderInput, ProcessFolderResult, RenamedFile,
    SeasonMetadata, SeasonSummary, SeriesMetadata, SourceFile, StructuringProgress, WorkflowStage,
};
use crate::workflow::disc;
use crate::workflow::host::{ActivityOptions, WorkflowCtx};
use crate::workflow::progress::ProgressRegistry;

pub const MAX_CONCURRENT_FOLDERS: usize = 5;

pub const STRUCTURED_DIR: &str = "_structured";
pub const EXTRAS_DIR: &str = "Extras";

/// The three filesystem roots a run flows through.
#[derive(Clone, Debug)]
pub struct OrganizeEnvironment {
    pub processing_root: PathBuf,
    pub staging_root: PathBuf,
    pub output_root: PathBuf,
}

pub async fn organize_library(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    environment: &OrganizeEnvironment,
    request: &OrganizeRequest,
) -> OrganizeLibraryResult {
    match run_library(ctx, activities, environment, request).await {
        Ok(result) => result,
        Err(e) => {
            warn!(target: "organize::workflow", workflow = %request.workflow_id, error = %e, "library workflow failed");
            fail(ctx.progress(), None, Vec::new(), e.to_string())
        }
    }
}

async fn run_library(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    environment: &OrganizeEnvironment,
    request: &OrganizeRequest,
) -> Result<OrganizeLibraryResult> {
    let progress = ctx.progress();
    let series_name = request
        .series_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "series".to_string());
    let processing_series_dir = environment
        .processing_root
        .join(&request.workflow_id)
        .join(&series_name);

    // ----- Stage 1: copying ------------------------------------------------
    progress.update_library(|p| p.stage = WorkflowStage::Copying);
    info!(target: "organize::workflow", workflow = %request.workflow_id, series = %series_name, "stage 1: copying source");

    let source_files: Vec<SourceFile> = {
        let media = activities.media.clone();
        let root = request.series_dir.clone();
        ctx.activity("enumerate_source", ActivityOptions::quick(), move |_| {
            let media = media.clone();
            let root = root.clone();
            async move { media.enumerate_source(&root).await }
        })
        .await?
    };
    let total_bytes: u64 = source_files.iter().map(|f| f.size_bytes).sum();
    progress.update_library(|p| {
        p.copy_progress = Some(CopyProgress {
            total_files: source_files.len(),
            total_bytes,
            ..CopyProgress::default()
        });
    });

    {
        let media = activities.media.clone();
        let files = source_files.clone();
        let dest = processing_series_dir.clone();
        let sink: Arc<dyn CopySink> = Arc::new(IngestSink {
            registry: ctx.progress_handle(),
        });
        // The private working copy is required even on a dry run: detection
        // and dialogue extraction read from it. Everything from episode
        // copies onward honours the flag.
        ctx.activity("copy_source", ActivityOptions::transfer(), move |actx| {
            let media = media.clone();
            let files = files.clone();
            let dest = dest.clone();
            let sink = sink.clone();
            async move {
                media
                    .copy_batch(&files, &dest, sink, actx.heartbeat.clone(), false)
                    .await
            }
        })
        .await?;
    }

    // ----- Stage 2: fetching metadata -------------------------------------
    progress.update_library(|p| {
        p.stage = WorkflowStage::FetchingMetadata;
        p.metadata_summary = Some(MetadataSummary::default());
    });
    let cleaned_name = naming::clean_search_name(&series_name);
    info!(target: "organize::workflow", workflow = %request.workflow_id, search = %cleaned_name, "stage 2: fetching metadata");

    let search = {
        let catalogue = activities.catalogue.clone();
        let cleaned = cleaned_name.clone();
        ctx.activity("search_anime", ActivityOptions::network(), move |_| {
            let catalogue = catalogue.clone();
            let cleaned = cleaned.clone();
            async move { catalogue.search_anime(&cleaned).await }
        })
        .await?
    };
    let Some(search) = search else {
        return Ok(fail(
            progress,
            None,
            Vec::new(),
            format!("no catalogue entry found for \"{cleaned_name}\""),
        ));
    };
    progress.update_library(|p| {
        if let Some(summary) = p.metadata_summary.as_mut() {
            summary.status = MetadataStatus::Found;
            summary.series_title = search.title.preferred().map(|t| t.to_string());
        }
    });

    progress.update_library(|p| {
        if let Some(summary) = p.metadata_summary.as_mut() {
            summary.status = MetadataStatus::Traversing;
        }
    });
    let entries = {
        let catalogue = activities.catalogue.clone();
        let first_id = search.id;
        ctx.activity("discover_all_seasons", ActivityOptions::network(), move |_| {
            let catalogue = catalogue.clone();
            async move { catalogue.discover_all_seasons(first_id).await }
        })
        .await?
    };
    if entries.is_empty() {
        return Ok(fail(
            progress,
            None,
            Vec::new(),
            format!("catalogue returned no seasons for \"{cleaned_name}\""),
        ));
    }

    progress.update_library(|p| {
        if let Some(summary) = p.metadata_summary.as_mut() {
            summary.status = MetadataStatus::FetchingEpisodes;
        }
    });
    let mut metadata = SeriesMetadata::default();
    for (index, entry) in entries.iter().enumerate() {
        let season_number = index as u32 + 1;
        let episodes = {
            let catalogue = activities.catalogue.clone();
            let id = entry.id;
            let expected = entry.episodes.unwrap_or(0);
            ctx.activity("fetch_season_episodes", ActivityOptions::network(), move |_| {
                let catalogue = catalogue.clone();
                async move { catalogue.fetch_season_episodes(id, expected).await }
            })
            .await?
        };
        let season = SeasonMetadata {
            season_number,
            catalogue_id: entry.id,
            title: entry.title.clone(),
            episode_count: entry.episodes.unwrap_or(episodes.len() as u32),
            episodes: episodes
                .into_iter()
                .map(|e| EpisodeMetadata {
                    number: e.number,
                    title: e.title,
                    description: e.description,
                })
                .collect(),
        };
        progress.update_library(|p| {
            if let Some(summary) = p.metadata_summary.as_mut() {
                summary.seasons.push(SeasonSummary {
                    season_number,
                    title: season.title.preferred().map(|t| t.to_string()),
                    episode_count: season.episode_count,
                });
            }
        });
        metadata.seasons.push(season);
    }
    let expected_episodes = metadata.total_episodes();
    progress.update_library(|p| {
        if let Some(summary) = p.metadata_summary.as_mut() {
            summary.status = MetadataStatus::Complete;
        }
        p.expected_core_episode_count = expected_episodes;
    });

    let show_name = naming::clean_show_name(
        metadata.seasons[0]
            .title
            .preferred()
            .unwrap_or(&series_name),
    );

    // ----- Stage 3: processing folders ------------------------------------
    progress.update_library(|p| p.stage = WorkflowStage::ProcessingFolders);
    let disc_dirs: Vec<PathBuf> = {
        let media = activities.media.clone();
        let dir = processing_series_dir.clone();
        ctx.activity("list_disc_folders", ActivityOptions::quick(), move |_| {
            let media = media.clone();
            let dir = dir.clone();
            async move { media.list_disc_folders(&dir).await }
        })
        .await?
    };
    // A flat series directory is processed as a single disc named after the
    // series itself.
    let folders: Vec<(String, PathBuf)> = if disc_dirs.is_empty() {
        vec![(series_name.clone(), processing_series_dir.clone())]
    } else {
        disc_dirs
            .into_iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                (name, path)
            })
            .collect()
    };
    progress.update_library(|p| p.total_folders = folders.len());
    for (name, _) in &folders {
        progress.transition_folder(name, FolderStatus::Pending);
    }
    info!(target: "organize::workflow", workflow = %request.workflow_id, folders = folders.len(), "stage 3: processing folders");

    let mut queue: VecDeque<(String, PathBuf)> = folders.clone().into();
    let mut in_flight = FuturesUnordered::new();
    let mut disc_results: Vec<ProcessFolderResult> = Vec::new();
    let mut renamed_files: Vec<RenamedFile> = Vec::new();
    let mut episode_paths_by_folder: HashMap<String, Vec<PathBuf>> = HashMap::new();
    loop {
        while in_flight.len() < MAX_CONCURRENT_FOLDERS {
            let Some((name, path)) = queue.pop_front() else {
                break;
            };
            let input = ProcessFolderInput {
                folder_path: path,
                folder_name: name,
                series_root: processing_series_dir.clone(),
                show_name: show_name.clone(),
                metadata: metadata.clone(),
                dry_run: request.dry_run,
                confidence_threshold: request.confidence_threshold,
            };
            in_flight.push(run_disc(ctx, activities, input));
        }
        let Some(result) = in_flight.next().await else {
            break;
        };
        let result = result?;
        progress.transition_folder(&result.folder_name, result.status);
        progress.update_library(|p| {
            p.resolved_core_episode_count += result.episodes_renamed as u32;
        });
        renamed_files.extend(result.renamed_files.iter().cloned());
        episode_paths_by_folder.insert(
            result.folder_name.clone(),
            result.episode_original_paths.clone(),
        );
        disc_results.push(result);
    }

    let folder_results: Vec<FolderResult> = disc_results
        .iter()
        .map(|r| FolderResult {
            folder_name: r.folder_name.clone(),
            status: r.status,
            episodes_renamed: r.episodes_renamed,
            unprocessed_files: r.unprocessed_files.clone(),
            error: r.error.clone(),
        })
        .collect();
    let folders_failed = folder_results
        .iter()
        .filter(|r| r.status == FolderStatus::Failed)
        .count();

    // ----- Stage 4: structuring -------------------------------------------
    progress.update_library(|p| p.stage = WorkflowStage::Structuring);
    let structured_show_root = processing_series_dir.join(STRUCTURED_DIR).join(&show_name);
    info!(target: "organize::workflow", workflow = %request.workflow_id, "stage 4: structuring");

    let moves: Vec<PlannedTransfer> = renamed_files
        .iter()
        .map(|renamed| PlannedTransfer {
            from: renamed.new_path.clone(),
            to: structured_show_root
                .join(naming::season_dir_name(renamed.season_number))
                .join(&renamed.new_file_name),
        })
        .collect();

    let mut extras: Vec<PlannedTransfer> = Vec::new();
    for (name, path) in &folders {
        let videos: Vec<SourceFile> = {
            let media = activities.media.clone();
            let path = path.clone();
            ctx.activity("list_videos", ActivityOptions::quick(), move |_| {
                let media = media.clone();
                let path = path.clone();
                async move { media.list_videos(&path).await }
            })
            .await?
        };
        let episode_paths: HashSet<&PathBuf> = episode_paths_by_folder
            .get(name)
            .map(|paths| paths.iter().collect())
            .unwrap_or_default();
        for video in videos {
            if !episode_paths.contains(&video.path) {
                extras.push(PlannedTransfer {
                    to: structured_show_root
                        .join(EXTRAS_DIR)
                        .join(name)
                        .join(&video.relative_path),
                    from: video.path,
                });
            }
        }
    }

    progress.update_library(|p| {
        p.structuring_progress = Some(StructuringProgress {
            total_files: moves.len() + extras.len(),
            ..StructuringProgress::default()
        });
    });

    {
        let media = activities.media.clone();
        let moves = moves.clone();
        let sink: Arc<dyn CopySink> = Arc::new(StructuringSink {
            registry: ctx.progress_handle(),
        });
        let dry_run = request.dry_run;
        ctx.activity("structure_episodes", ActivityOptions::quick(), move |_| {
            let media = media.clone();
            let moves = moves.clone();
            let sink = sink.clone();
            async move { media.move_into_structure(&moves, sink, dry_run).await }
        })
        .await?;
    }
    {
        let media = activities.media.clone();
        let extras = extras.clone();
        let sink: Arc<dyn CopySink> = Arc::new(StructuringSink {
            registry: ctx.progress_handle(),
        });
        let dry_run = request.dry_run;
        ctx.activity("copy_extras", ActivityOptions::transfer(), move |actx| {
            let media = media.clone();
            let extras = extras.clone();
            let sink = sink.clone();
            async move {
                media
                    .copy_extras(&extras, sink, actx.heartbeat.clone(), dry_run)
                    .await
            }
        })
        .await?;
    }

    let staging_show_dir = environment
        .staging_root
        .join(&request.workflow_id)
        .join(&show_name);
    // Nothing structured (every disc failed) still reaches the finalize gate
    // so the operator sees the failure counts instead of an I/O error.
    if !request.dry_run && !(moves.is_empty() && extras.is_empty()) {
        let structured_files = enumerate_built(ctx, activities, &structured_show_root).await?;
        {
            let media = activities.media.clone();
            let files = structured_files;
            let dest = staging_show_dir.clone();
            let sink: Arc<dyn CopySink> = Arc::new(StructuringSink {
                registry: ctx.progress_handle(),
            });
            ctx.activity("copy_to_staging", ActivityOptions::transfer(), move |actx| {
                let media = media.clone();
                let files = files.clone();
                let dest = dest.clone();
                let sink = sink.clone();
                async move {
                    media
                        .copy_batch(&files, &dest, sink, actx.heartbeat.clone(), false)
                        .await
                }
            })
            .await?;
        }

        let tree = {
            let media = activities.media.clone();
            let dir = staging_show_dir.clone();
            ctx.activity("capture_staging_tree", ActivityOptions::quick(), move |_| {
                let media = media.clone();
                let dir = dir.clone();
                async move { media.capture_staging_tree(&dir).await }
            })
            .await?
        };
        progress.set_staging_tree(tree);
    }

    // ----- Stage 5: awaiting finalize -------------------------------------
    let can_finalize = folders_failed == 0 && !renamed_files.is_empty();
    progress.update_library(|p| {
        p.stage = WorkflowStage::AwaitingFinalize;
        p.can_finalize = can_finalize;
        p.awaiting_final_approval = true;
    });
    info!(target: "organize::workflow", workflow = %request.workflow_id, can_finalize, "stage 5: awaiting finalize");

    loop {
        let decision = ctx.condition(|store| store.finalize.take()).await;
        if !decision.approved {
            progress.update_library(|p| p.awaiting_final_approval = false);
            return Ok(fail(
                progress,
                Some(show_name),
                folder_results,
                "finalize rejected by operator".to_string(),
            ));
        }
        if can_finalize {
            break;
        }
        // Approved but not finalizable; keep waiting for an operator who has
        // seen the failure counts.
        warn!(target: "organize::workflow", workflow = %request.workflow_id, "finalize approved but gate is closed, still waiting");
    }
    progress.update_library(|p| p.awaiting_final_approval = false);

    // ----- Stage 6: finalizing --------------------------------------------
    progress.update_library(|p| p.stage = WorkflowStage::Finalizing);
    let output_show_dir = environment.output_root.join(&show_name);
    info!(target: "organize::workflow", workflow = %request.workflow_id, output = %output_show_dir.display(), "stage 6: finalizing");

    if !request.dry_run {
        let staged_files = enumerate_built(ctx, activities, &staging_show_dir).await?;
        let staged_bytes: u64 = staged_files.iter().map(|f| f.size_bytes).sum();
        progress.update_library(|p| {
            p.output_progress = Some(CopyProgress {
                total_files: staged_files.len(),
                total_bytes: staged_bytes,
                ..CopyProgress::default()
            });
        });
        {
            let media = activities.media.clone();
            let files = staged_files;
            let dest = output_show_dir.clone();
            let sink: Arc<dyn CopySink> = Arc::new(OutputSink {
                registry: ctx.progress_handle(),
            });
            ctx.activity("copy_to_output", ActivityOptions::transfer(), move |actx| {
                let media = media.clone();
                let files = files.clone();
                let dest = dest.clone();
                let sink = sink.clone();
                async move {
                    media
                        .copy_batch(&files, &dest, sink, actx.heartbeat.clone(), false)
                        .await
                }
            })
            .await?;
        }

        let report = {
            let media = activities.media.clone();
            let staging = staging_show_dir.clone();
            let output = output_show_dir.clone();
            ctx.activity("verify_output_integrity", ActivityOptions::quick(), move |_| {
                let media = media.clone();
                let staging = staging.clone();
                let output = output.clone();
                async move { media.verify_output_integrity(&staging, &output).await }
            })
            .await?
        };
        if !report.verified {
            return Ok(fail(
                progress,
                Some(show_name),
                folder_results,
                format!(
                    "output integrity verification failed, {} file(s) missing or truncated",
                    report.missing.len()
                ),
            ));
        }
    }

    for (label, path) in [
        ("remove_staging", environment.staging_root.join(&request.workflow_id)),
        ("remove_processing", environment.processing_root.join(&request.workflow_id)),
    ] {
        let media = activities.media.clone();
        let dry_run = request.dry_run;
        ctx.activity(label, ActivityOptions::quick(), move |_| {
            let media = media.clone();
            let path = path.clone();
            async move { media.remove_tree(&path, dry_run).await }
        })
        .await?;
    }

    progress.update_library(|p| p.stage = WorkflowStage::Completed);
    info!(target: "organize::workflow", workflow = %request.workflow_id, show = %show_name, "library organized");
    Ok(build_result(
        WorkflowStage::Completed,
        Some(show_name),
        folder_results,
        None,
    ))
}

async fn run_disc(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    input: ProcessFolderInput,
) -> Result<ProcessFolderResult> {
    let child_id = input.folder_name.clone();
    ctx.child(&child_id, || async {
        match ctx.child_ctx(&child_id).await {
            Ok(child_ctx) => disc::process_folder(&child_ctx, activities, input).await,
            Err(e) => ProcessFolderResult::failed(child_id.clone(), e.to_string()),
        }
    })
    .await
}

async fn enumerate_built(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    root: &Path,
) -> Result<Vec<SourceFile>> {
    let media = activities.media.clone();
    let root = root.to_path_buf();
    ctx.activity("enumerate_built", ActivityOptions::quick(), move |_| {
        let media = media.clone();
        let root = root.clone();
        async move { media.enumerate_built(&root).await }
    })
    .await
}

fn fail(
    progress: &ProgressRegistry,
    show_name: Option<String>,
    folder_results: Vec<FolderResult>,
    error: String,
) -> OrganizeLibraryResult {
    progress.update_library(|p| p.stage = WorkflowStage::Failed);
    build_result(WorkflowStage::Failed, show_name, folder_results, Some(error))
}

fn build_result(
    stage: WorkflowStage,
    show_name: Option<String>,
    folders: Vec<FolderResult>,
    error: Option<String>,
) -> OrganizeLibraryResult {
    let completed = folders
        .iter()
        .filter(|f| f.status == FolderStatus::Completed)
        .count();
    let failed = folders
        .iter()
        .filter(|f| f.status == FolderStatus::Failed)
        .count();
    let pending_review = folders
        .iter()
        .filter(|f| f.status.is_awaiting_human())
        .count();
    OrganizeLibraryResult {
        stage,
        show_name,
        completed,
        failed,
        pending_review,
        folders,
        error,
    }
}

// Progress sinks projecting transfer events into the query surface.

struct IngestSink {
    registry: Arc<ProgressRegistry>,
}

impl CopySink for IngestSink {
    fn transfer_started(&self, name: &str) {
        self.registry.update_library(|p| {
            if let Some(copy) = p.copy_progress.as_mut() {
                copy.current_files.push(name.to_string());
            }
        });
    }

    fn transfer_finished(&self, name: &str, bytes: u64) {
        self.registry.update_library(|p| {
            if let Some(copy) = p.copy_progress.as_mut() {
                copy.files_copied += 1;
                copy.bytes_copied += bytes;
                copy.current_files.retain(|f| f != name);
            }
        });
    }
}

struct OutputSink {
    registry: Arc<ProgressRegistry>,
}

impl CopySink for OutputSink {
    fn transfer_started(&self, name: &str) {
        self.registry.update_library(|p| {
            if let Some(copy) = p.output_progress.as_mut() {
                copy.current_files.push(name.to_string());
            }
        });
    }

    fn transfer_finished(&self, name: &str, bytes: u64) {
        self.registry.update_library(|p| {
            if let Some(copy) = p.output_progress.as_mut() {
                copy.files_copied += 1;
                copy.bytes_copied += bytes;
                copy.current_files.retain(|f| f != name);
            }
        });
    }
}

struct StructuringSink {
    registry: Arc<ProgressRegistry>,
}

impl CopySink for StructuringSink {
    fn transfer_started(&self, name: &str) {
        self.registry.update_library(|p| {
            if let Some(structuring) = p.structuring_progress.as_mut() {
                structuring.current_file = Some(name.to_string());
            }
        });
    }

    fn transfer_finished(&self, _name: &str, _bytes: u64) {
        self.registry.update_library(|p| {
            if let Some(structuring) = p.structuring_progress.as_mut() {
                structuring.files_structured += 1;
                structuring.current_file = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_counts_follow_folder_statuses() {
        let folders = vec![
            FolderResult {
                folder_name: "Disc 01".into(),
                status: FolderStatus::Completed,
                episodes_renamed: 12,
                unprocessed_files: Vec::new(),
                error: None,
            },
            FolderResult {
                folder_name: "Disc 02".into(),
                status: FolderStatus::Failed,
                episodes_renamed: 0,
                unprocessed_files: vec!["menu.mkv".into()],
                error: Some("boom".into()),
            },
        ];
        let result = build_result(
            WorkflowStage::Failed,
            Some("Show".into()),
            folders,
            Some("integrity".into()),
        );
        assert_eq!(result.completed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.pending_review, 0);
    }

    #[test]
    fn structuring_targets_follow_plex_layout() {
        let structured = PathBuf::from("/proc/wf/Show/_structured/Show");
        let renamed = RenamedFile {
            original_path: PathBuf::from("/proc/wf/Show/Disc 01/raw.mkv"),
            original_relative_path: PathBuf::from("Disc 01/raw.mkv"),
            new_path: PathBuf::from("/proc/wf/Show/_episodes/Season 01/Show - S01E03.mkv"),
            new_file_name: "Show - S01E03.mkv".into(),
            season_number: 1,
            episode_number: 3,
        };
        let target = structured
            .join(naming::season_dir_name(renamed.season_number))
            .join(&renamed.new_file_name);
        assert_eq!(
            target,
            PathBuf::from("/proc/wf/Show/_structured/Show/Season 01/Show - S01E03.mkv")
        );
    }
}
