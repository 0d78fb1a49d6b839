//! Data model shared across the pipeline.
//!
//! Coordinators exchange these by value; the progress types are the wire
//! shape of the query surface and serialize to camelCase JSON. Stage and
//! folder statuses are tagged variants internally, strings only on the wire.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One series as assembled from the catalogue's relation chain: seasons are
/// dense from 1 and every episode entry is addressable by (season, episode).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub seasons: Vec<SeasonMetadata>,
}

impl SeriesMetadata {
    pub fn total_episodes(&self) -> u32 {
        self.seasons.iter().map(|s| s.episode_count).sum()
    }

    pub fn season(&self, season_number: u32) -> Option<&SeasonMetadata> {
        self.seasons
            .iter()
            .find(|s| s.season_number == season_number)
    }

    pub fn episode(&self, season_number: u32, episode_number: u32) -> Option<&EpisodeMetadata> {
        self.season(season_number)
            .and_then(|s| s.episodes.iter().find(|e| e.number == episode_number))
    }

    pub fn contains_slot(&self, season_number: u32, episode_number: u32) -> bool {
        self.season(season_number)
            .map(|s| episode_number >= 1 && episode_number <= s.episode_count)
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeasonMetadata {
    pub season_number: u32,
    pub catalogue_id: u64,
    pub title: BilingualTitle,
    pub episode_count: u32,
    pub episodes: Vec<EpisodeMetadata>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BilingualTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
}

impl BilingualTitle {
    /// English when present, else romaji.
    pub fn preferred(&self) -> Option<&str> {
        self.english
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.romaji.as_deref())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    pub number: u32,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A file as seen under one enumeration root. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionConfidence {
    High,
    Medium,
    Low,
}

impl DetectionConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionConfidence::High => "high",
            DetectionConfidence::Medium => "medium",
            DetectionConfidence::Low => "low",
        }
    }
}

/// Episode/non-episode split for one disc folder. The two sets partition the
/// folder's video files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionResult {
    pub episodes: Vec<SourceFile>,
    pub non_episodes: Vec<SourceFile>,
    pub confidence: DetectionConfidence,
    pub cluster_median: u64,
    pub cluster_range: (u64, u64),
}

impl DetectionResult {
    pub fn empty() -> Self {
        Self {
            episodes: Vec::new(),
            non_episodes: Vec::new(),
            confidence: DetectionConfidence::Low,
            cluster_median: 0,
            cluster_range: (0, 0),
        }
    }

    pub fn total_video_files(&self) -> usize {
        self.episodes.len() + self.non_episodes.len()
    }
}

/// One (file → season/episode) assignment proposed by the matcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeMatch {
    pub file_name: String,
    pub file_path: PathBuf,
    pub season_number: u32,
    pub episode_number: u32,
    pub episode_title: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenamedFile {
    pub original_path: PathBuf,
    pub original_relative_path: PathBuf,
    pub new_path: PathBuf,
    pub new_file_name: String,
    pub season_number: u32,
    pub episode_number: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonOption {
    pub season_number: u32,
    pub title: Option<String>,
    pub episode_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeOption {
    pub season_number: u32,
    pub episode_number: u32,
    pub title: Option<String>,
}

/// A low-confidence match surfaced for manual selection. The id is stable
/// across restarts so decisions can be matched back: `<folder>-<file>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub file_name: String,
    pub file_path: PathBuf,
    pub suggested_season: u32,
    pub suggested_episode: u32,
    pub confidence: f64,
    pub reasoning: String,
    pub subtitle_snippet: String,
    pub available_seasons: Vec<SeasonOption>,
    pub available_episodes: Vec<EpisodeOption>,
}

impl ReviewItem {
    pub fn make_id(folder_name: &str, file_name: &str) -> String {
        format!("{folder_name}-{file_name}")
    }
}

/// Operator verdict on one review item. A rejection is discarded so the
/// operator may resubmit; only `approved = true` settles the item.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDecision {
    pub review_item_id: String,
    pub approved: bool,
    #[serde(default)]
    pub corrected_season: Option<u32>,
    #[serde(default)]
    pub corrected_episode: Option<u32>,
}

/// Operator verdict on a low-confidence detection cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionConfirmation {
    pub confirmed: bool,
    #[serde(default)]
    pub added_paths: Vec<PathBuf>,
    #[serde(default)]
    pub removed_paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeDecision {
    pub approved: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Copying,
    FetchingMetadata,
    ProcessingFolders,
    Structuring,
    AwaitingFinalize,
    Finalizing,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::Copying => "copying",
            WorkflowStage::FetchingMetadata => "fetching_metadata",
            WorkflowStage::ProcessingFolders => "processing_folders",
            WorkflowStage::Structuring => "structuring",
            WorkflowStage::AwaitingFinalize => "awaiting_finalize",
            WorkflowStage::Finalizing => "finalizing",
            WorkflowStage::Completed => "completed",
            WorkflowStage::Failed => "failed",
            WorkflowStage::Canceled => "canceled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStatus {
    Pending,
    Scanning,
    Extracting,
    Matching,
    Renaming,
    AwaitingDetectionReview,
    AwaitingReview,
    Completed,
    Failed,
}

impl FolderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderStatus::Pending => "pending",
            FolderStatus::Scanning => "scanning",
            FolderStatus::Extracting => "extracting",
            FolderStatus::Matching => "matching",
            FolderStatus::Renaming => "renaming",
            FolderStatus::AwaitingDetectionReview => "awaiting_detection_review",
            FolderStatus::AwaitingReview => "awaiting_review",
            FolderStatus::Completed => "completed",
            FolderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FolderStatus::Completed | FolderStatus::Failed)
    }

    pub fn is_awaiting_human(&self) -> bool {
        matches!(
            self,
            FolderStatus::AwaitingReview | FolderStatus::AwaitingDetectionReview
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyProgress {
    pub total_files: usize,
    pub total_bytes: u64,
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub current_files: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuringProgress {
    pub total_files: usize,
    pub files_structured: usize,
    pub current_file: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    Searching,
    Found,
    Traversing,
    FetchingEpisodes,
    Complete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonSummary {
    pub season_number: u32,
    pub title: Option<String>,
    pub episode_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSummary {
    pub status: MetadataStatus,
    pub series_title: Option<String>,
    pub seasons: Vec<SeasonSummary>,
}

impl Default for MetadataSummary {
    fn default() -> Self {
        Self {
            status: MetadataStatus::Searching,
            series_title: None,
            seasons: Vec::new(),
        }
    }
}

/// Library-level progress snapshot; the counts derived from
/// `folder_statuses` are recomputed on every mutation so readers never see a
/// stale aggregate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizeLibraryProgress {
    pub stage: WorkflowStage,
    pub copy_progress: Option<CopyProgress>,
    pub metadata_summary: Option<MetadataSummary>,
    pub structuring_progress: Option<StructuringProgress>,
    pub output_progress: Option<CopyProgress>,
    pub total_folders: usize,
    pub folders_completed: usize,
    pub folders_failed: usize,
    pub folders_in_progress: usize,
    pub folders_pending_review: usize,
    pub folder_statuses: BTreeMap<String, FolderStatus>,
    pub expected_core_episode_count: u32,
    pub resolved_core_episode_count: u32,
    pub unresolved_core_episode_count: u32,
    pub can_finalize: bool,
    pub awaiting_final_approval: bool,
}

impl Default for OrganizeLibraryProgress {
    fn default() -> Self {
        Self {
            stage: WorkflowStage::Copying,
            copy_progress: None,
            metadata_summary: None,
            structuring_progress: None,
            output_progress: None,
            total_folders: 0,
            folders_completed: 0,
            folders_failed: 0,
            folders_in_progress: 0,
            folders_pending_review: 0,
            folder_statuses: BTreeMap::new(),
            expected_core_episode_count: 0,
            resolved_core_episode_count: 0,
            unresolved_core_episode_count: 0,
            can_finalize: false,
            awaiting_final_approval: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFolderProgress {
    pub folder_name: String,
    pub status: FolderStatus,
    pub total_video_files: Option<usize>,
    pub detected_episode_count: Option<usize>,
    pub detection_confidence: Option<DetectionConfidence>,
    pub total_episode_files: Option<usize>,
    pub subtitles_extracted: usize,
    pub current_file: Option<String>,
    pub matches_found: Option<usize>,
    pub total_to_match: Option<usize>,
    pub episodes_copied: usize,
    pub total_episodes_to_copy: Option<usize>,
    pub pending_reviews: Vec<ReviewItem>,
}

impl ProcessFolderProgress {
    pub fn new(folder_name: impl Into<String>) -> Self {
        Self {
            folder_name: folder_name.into(),
            status: FolderStatus::Pending,
            total_video_files: None,
            detected_episode_count: None,
            detection_confidence: None,
            total_episode_files: None,
            subtitles_extracted: 0,
            current_file: None,
            matches_found: None,
            total_to_match: None,
            episodes_copied: 0,
            total_episodes_to_copy: None,
            pending_reviews: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingNodeKind {
    Directory,
    File,
}

/// Recursive snapshot of the staging tree captured at the end of structuring,
/// directories sorted before files, alphabetical within each group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StagingNodeKind,
    pub relative_path: PathBuf,
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StagingNode>,
}

/// One end-to-end run over a single series directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizeRequest {
    pub workflow_id: String,
    pub series_dir: PathBuf,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

pub fn default_confidence_threshold() -> f64 {
    0.85
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderResult {
    pub folder_name: String,
    pub status: FolderStatus,
    pub episodes_renamed: usize,
    pub unprocessed_files: Vec<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizeLibraryResult {
    pub stage: WorkflowStage,
    pub show_name: Option<String>,
    pub completed: usize,
    pub failed: usize,
    pub pending_review: usize,
    pub folders: Vec<FolderResult>,
    pub error: Option<String>,
}

/// Input handed to one disc coordinator. Built deterministically by the
/// library coordinator so a replayed child receives identical input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessFolderInput {
    pub folder_path: PathBuf,
    pub folder_name: String,
    pub series_root: PathBuf,
    pub show_name: String,
    pub metadata: SeriesMetadata,
    pub dry_run: bool,
    pub confidence_threshold: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessFolderResult {
    pub folder_name: String,
    pub status: FolderStatus,
    pub episodes_renamed: usize,
    pub renamed_files: Vec<RenamedFile>,
    pub episode_original_paths: Vec<PathBuf>,
    pub unprocessed_files: Vec<String>,
    pub error: Option<String>,
}

impl ProcessFolderResult {
    pub fn failed(folder_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            folder_name: folder_name.into(),
            status: FolderStatus::Failed,
            episodes_renamed: 0,
            renamed_files: Vec::new(),
            episode_original_paths: Vec::new(),
            unprocessed_files: Vec::new(),
            error: Some(error.into()),
        }
    }
}
