//! Per-disc coordinator.
//!
//! State machine: scanning → (awaiting_detection_review) → extracting →
//! matching → renaming → (awaiting_review) → completed, with any uncaught
//! error recorded into the result as `failed` so sibling discs continue.
//! Reviews are processed serially in enqueue order, so `episodes_copied` is
//! monotone within a disc.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::activities::{ActivitySet, EpisodeCopyRequest, EpisodeDialogue, SubtitleExtractRequest};
use crate::error::Result;
use crate::types::{
    DetectionConfidence, DetectionResult, EpisodeMatch, EpisodeOption, FolderStatus,
    ProcessFolderInput, ProcessFolderResult, RenamedFile, ReviewItem, SeasonOption, SourceFile,
};
use crate::workflow::host::{ActivityOptions, WorkflowCtx};

pub const SUBTITLES_DIR: &str = "_subtitles";
const REVIEW_SNIPPET_CHARS: usize = 500;

pub async fn process_folder(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    input: ProcessFolderInput,
) -> ProcessFolderResult {
    let folder_name = input.folder_name.clone();
    match run_folder(ctx, activities, &input).await {
        Ok(result) => result,
        Err(e) => {
            warn!(target: "organize::disc", folder = %folder_name, error = %e, "disc processing failed");
            ctx.progress().transition_folder(&folder_name, FolderStatus::Failed);
            ProcessFolderResult::failed(folder_name, e.to_string())
        }
    }
}

async fn run_folder(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    input: &ProcessFolderInput,
) -> Result<ProcessFolderResult> {
    let folder = &input.folder_name;
    let progress = ctx.progress();
    progress.transition_folder(folder, FolderStatus::Scanning);

    // Scanning: size-cluster detection over the disc's video files.
    let detection: DetectionResult = {
        let media = activities.media.clone();
        let path = input.folder_path.clone();
        ctx.activity("detect_episodes", ActivityOptions::quick(), move |_| {
            let media = media.clone();
            let path = path.clone();
            async move { media.detect_episodes(&path).await }
        })
        .await?
    };

    progress.update_disc(folder, |p| {
        p.total_video_files = Some(detection.total_video_files());
        p.detected_episode_count = Some(detection.episodes.len());
        p.detection_confidence = Some(detection.confidence);
    });

    if detection.total_video_files() == 0 {
        info!(target: "organize::disc", folder = %folder, "no video files, disc completes empty");
        progress.transition_folder(folder, FolderStatus::Completed);
        return Ok(ProcessFolderResult {
            folder_name: folder.clone(),
            status: FolderStatus::Completed,
            episodes_renamed: 0,
            renamed_files: Vec::new(),
            episode_original_paths: Vec::new(),
            unprocessed_files: Vec::new(),
            error: None,
        });
    }

    let episodes = confirm_detection(ctx, input, detection).await;
    progress.update_disc(folder, |p| {
        p.detected_episode_count = Some(episodes.len());
        p.total_episode_files = Some(episodes.len());
    });

    // Extracting: per-file dialogue text, serially; per-file failure is
    // tolerated and lands in unprocessed.
    progress.transition_folder(folder, FolderStatus::Extracting);
    let mut dialogues: Vec<EpisodeDialogue> = Vec::new();
    let mut unprocessed: Vec<String> = Vec::new();
    for file in &episodes {
        progress.update_disc(folder, |p| p.current_file = Some(file.name.clone()));
        let request = SubtitleExtractRequest {
            media_path: file.path.clone(),
            media_name: file.name.clone(),
            target_dir: input.series_root.join(SUBTITLES_DIR).join(folder),
        };
        let extracted = {
            let source = activities.subtitles.clone();
            ctx.activity("extract_subtitles", ActivityOptions::slow(), move |_| {
                let source = source.clone();
                let request = request.clone();
                async move { source.extract(&request).await }
            })
            .await?
        };
        match extracted {
            Some(subtitle) => {
                dialogues.push(EpisodeDialogue {
                    file_name: file.name.clone(),
                    file_path: file.path.clone(),
                    dialogue: subtitle.content,
                });
                progress.update_disc(folder, |p| p.subtitles_extracted += 1);
            }
            None => unprocessed.push(file.name.clone()),
        }
    }
    progress.update_disc(folder, |p| p.current_file = None);

    if dialogues.is_empty() {
        let message = format!("no subtitles could be extracted from any episode file in {folder}");
        warn!(target: "organize::disc", folder = %folder, "{message}");
        progress.transition_folder(folder, FolderStatus::Failed);
        return Ok(ProcessFolderResult {
            folder_name: folder.clone(),
            status: FolderStatus::Failed,
            episodes_renamed: 0,
            renamed_files: Vec::new(),
            episode_original_paths: episodes.iter().map(|f| f.path.clone()).collect(),
            unprocessed_files: unprocessed,
            error: Some(message),
        });
    }

    // Matching: one structured model call over the whole disc.
    progress.transition_folder(folder, FolderStatus::Matching);
    progress.update_disc(folder, |p| p.total_to_match = Some(dialogues.len()));
    let matches: Vec<EpisodeMatch> = {
        let matcher = activities.matcher.clone();
        let dialogues = dialogues.clone();
        let metadata = input.metadata.clone();
        ctx.activity("match_episodes", ActivityOptions::slow(), move |_| {
            let matcher = matcher.clone();
            let dialogues = dialogues.clone();
            let metadata = metadata.clone();
            async move { matcher.match_episodes(&dialogues, &metadata).await }
        })
        .await?
    };
    progress.update_disc(folder, |p| p.matches_found = Some(matches.len()));

    let matched_names: HashSet<&str> = matches.iter().map(|m| m.file_name.as_str()).collect();
    for dialogue in &dialogues {
        if !matched_names.contains(dialogue.file_name.as_str()) {
            unprocessed.push(dialogue.file_name.clone());
        }
    }

    // Renaming: confident matches are copied immediately, the rest go to
    // operator review.
    progress.transition_folder(folder, FolderStatus::Renaming);
    let (confident, uncertain): (Vec<EpisodeMatch>, Vec<EpisodeMatch>) = matches
        .into_iter()
        .partition(|m| m.confidence >= input.confidence_threshold);
    progress.update_disc(folder, |p| {
        p.total_episodes_to_copy = Some(confident.len() + uncertain.len());
    });

    let mut renamed: Vec<RenamedFile> = Vec::new();
    let mut assigned_slots: HashSet<(u32, u32)> = HashSet::new();
    for matched in &confident {
        let file = copy_episode(ctx, activities, input, matched, &mut assigned_slots).await?;
        renamed.push(file);
        progress.update_disc(folder, |p| p.episodes_copied += 1);
    }

    if !uncertain.is_empty() {
        let items = build_review_items(input, &uncertain, &dialogues);
        progress.transition_folder(folder, FolderStatus::AwaitingReview);
        progress.update_disc(folder, |p| p.pending_reviews = items.clone());

        for (item, matched) in items.iter().zip(&uncertain) {
            let decision = ctx
                .condition(|store| {
                    let approved = match store.reviews.get(&item.id) {
                        Some(d) => d.approved,
                        None => return None,
                    };
                    let decision = store.reviews.remove(&item.id);
                    // Rejections are discarded so the operator can resubmit.
                    if approved {
                        decision
                    } else {
                        None
                    }
                })
                .await;

            let season = decision.corrected_season.unwrap_or(matched.season_number);
            let episode = decision.corrected_episode.unwrap_or(matched.episode_number);
            let title = input
                .metadata
                .episode(season, episode)
                .and_then(|e| e.title.clone())
                .unwrap_or_else(|| format!("Episode {episode}"));
            let approved = EpisodeMatch {
                file_name: matched.file_name.clone(),
                file_path: matched.file_path.clone(),
                season_number: season,
                episode_number: episode,
                episode_title: Some(title),
                confidence: 1.0,
                reasoning: "user-approved".to_string(),
            };

            let file = copy_episode(ctx, activities, input, &approved, &mut assigned_slots).await?;
            renamed.push(file);
            progress.update_disc(folder, |p| {
                p.episodes_copied += 1;
                p.pending_reviews.retain(|pending| pending.id != item.id);
            });
        }
    }

    progress.transition_folder(folder, FolderStatus::Completed);
    info!(
        target: "organize::disc",
        folder = %folder,
        renamed = renamed.len(),
        unprocessed = unprocessed.len(),
        "disc completed"
    );
    Ok(ProcessFolderResult {
        folder_name: folder.clone(),
        status: FolderStatus::Completed,
        episodes_renamed: renamed.len(),
        renamed_files: renamed,
        episode_original_paths: episodes.iter().map(|f| f.path.clone()).collect(),
        unprocessed_files: unprocessed,
        error: None,
    })
}

/// Gate low-confidence detections on an operator confirmation; edits are
/// applied only from the current detection's own sets, so a stale payload
/// cannot corrupt the partition.
async fn confirm_detection(
    ctx: &WorkflowCtx,
    input: &ProcessFolderInput,
    detection: DetectionResult,
) -> Vec<SourceFile> {
    if detection.confidence == DetectionConfidence::High {
        return detection.episodes;
    }

    let folder = input.folder_name.clone();
    ctx.progress()
        .transition_folder(&folder, FolderStatus::AwaitingDetectionReview);
    info!(target: "organize::disc", folder = %folder, confidence = detection.confidence.as_str(), "awaiting detection confirmation");

    let confirmation = ctx
        .condition(|store| store.detections.remove(&folder))
        .await;

    let mut episodes = detection.episodes;
    if confirmation.confirmed {
        let removed: HashSet<&PathBuf> = confirmation.removed_paths.iter().collect();
        episodes.retain(|f| !removed.contains(&f.path));
        for added in &confirmation.added_paths {
            if let Some(file) = detection.non_episodes.iter().find(|f| &f.path == added) {
                episodes.push(file.clone());
            }
        }
    }
    episodes
}

async fn copy_episode(
    ctx: &WorkflowCtx,
    activities: &ActivitySet,
    input: &ProcessFolderInput,
    matched: &EpisodeMatch,
    assigned_slots: &mut HashSet<(u32, u32)>,
) -> Result<RenamedFile> {
    let slot = (matched.season_number, matched.episode_number);
    if !assigned_slots.insert(slot) {
        warn!(
            target: "organize::disc",
            folder = %input.folder_name,
            file = %matched.file_name,
            season = slot.0,
            episode = slot.1,
            "duplicate slot assignment, first writer wins"
        );
    }

    let request = EpisodeCopyRequest {
        source_path: matched.file_path.clone(),
        source_relative_path: matched
            .file_path
            .strip_prefix(&input.series_root)
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|_| matched.file_path.clone()),
        series_root: input.series_root.clone(),
        show_name: input.show_name.clone(),
        season_number: matched.season_number,
        episode_number: matched.episode_number,
        episode_title: matched.episode_title.clone(),
        dry_run: input.dry_run,
    };

    let media = activities.media.clone();
    ctx.activity("copy_episode", ActivityOptions::transfer(), move |actx| {
        let media = media.clone();
        let request = request.clone();
        async move {
            actx.heartbeat.beat();
            media.copy_episode(&request).await
        }
    })
    .await
}

fn build_review_items(
    input: &ProcessFolderInput,
    uncertain: &[EpisodeMatch],
    dialogues: &[EpisodeDialogue],
) -> Vec<ReviewItem> {
    let dialogue: HashMap<&str, &str> = dialogues
        .iter()
        .map(|d| (d.file_name.as_str(), d.dialogue.as_str()))
        .collect();

    let available_seasons: Vec<SeasonOption> = input
        .metadata
        .seasons
        .iter()
        .map(|s| SeasonOption {
            season_number: s.season_number,
            title: s.title.preferred().map(|t| t.to_string()),
            episode_count: s.episode_count,
        })
        .collect();
    let available_episodes: Vec<EpisodeOption> = input
        .metadata
        .seasons
        .iter()
        .flat_map(|season| {
            (1..=season.episode_count).map(|number| EpisodeOption {
                season_number: season.season_number,
                episode_number: number,
                title: season
                    .episodes
                    .iter()
                    .find(|e| e.number == number)
                    .and_then(|e| e.title.clone()),
            })
        })
        .collect();

    uncertain
        .iter()
        .map(|m| ReviewItem {
            id: ReviewItem::make_id(&input.folder_name, &m.file_name),
            file_name: m.file_name.clone(),
            file_path: m.file_path.clone(),
            suggested_season: m.season_number,
            suggested_episode: m.episode_number,
            confidence: m.confidence,
            reasoning: m.reasoning.clone(),
            subtitle_snippet: snippet(
                dialogue.get(m.file_name.as_str()).copied().unwrap_or(""),
                REVIEW_SNIPPET_CHARS,
            ),
            available_seasons: available_seasons.clone(),
            available_episodes: available_episodes.clone(),
        })
        .collect()
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_respects_char_boundaries() {
        assert_eq!(snippet("abcdef", 4), "abcd");
        assert_eq!(snippet("日本語のテキスト", 3), "日本語");
        assert_eq!(snippet("short", 500), "short");
    }
}
