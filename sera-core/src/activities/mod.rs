//! Activity seams and their production implementations.
//!
//! Coordinators only ever touch the world through these traits; the durable
//! host checkpoints each invocation. Tests swap in fakes.

pub mod catalogue;
pub mod matcher;
pub mod media;
pub mod subtitles;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::copy::{CopySink, IntegrityReport};
use crate::error::Result;
use crate::types::{DetectionResult, RenamedFile, SeriesMetadata, SourceFile, StagingNode};
use crate::workflow::host::Heartbeat;

pub use catalogue::{AnimeEpisode, AnimeSearchResult, AnilistClient, MinimalAnimeEntry};
pub use matcher::{AnthropicMatcher, EpisodeDialogue};
pub use media::FsMediaStore;
pub use subtitles::{ExtractedSubtitle, MuxToolExtractor, SubtitleExtractRequest, SubtitleOrigin};

/// Copy-rename of one matched episode into the series' `_episodes/` working
/// directory. The original is never moved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeCopyRequest {
    pub source_path: PathBuf,
    pub source_relative_path: PathBuf,
    pub series_root: PathBuf,
    pub show_name: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub episode_title: Option<String>,
    pub dry_run: bool,
}

/// One planned rename or copy inside the structuring stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Filesystem side effects of the pipeline.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Original content under `root`, reserved working directories skipped.
    async fn enumerate_source(&self, root: &Path) -> Result<Vec<SourceFile>>;

    /// Every file under a tree the pipeline built itself.
    async fn enumerate_built(&self, root: &Path) -> Result<Vec<SourceFile>>;

    /// Immediate disc subfolders of a series directory.
    async fn list_disc_folders(&self, series_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Video files among the original content of one disc folder.
    async fn list_videos(&self, folder: &Path) -> Result<Vec<SourceFile>>;

    /// Parallel batch copy preserving relative layout.
    async fn copy_batch(
        &self,
        files: &[SourceFile],
        dest_root: &Path,
        sink: Arc<dyn CopySink>,
        heartbeat: Heartbeat,
        dry_run: bool,
    ) -> Result<()>;

    /// Size-cluster detection over one disc folder.
    async fn detect_episodes(&self, folder: &Path) -> Result<DetectionResult>;

    /// Idempotent copy-rename into `_episodes/Season <ss>/`.
    async fn copy_episode(&self, request: &EpisodeCopyRequest) -> Result<RenamedFile>;

    /// Same-filesystem renames into the structured tree; already-moved files
    /// are skipped. Returns the number of files moved or already in place.
    async fn move_into_structure(
        &self,
        moves: &[PlannedTransfer],
        sink: Arc<dyn CopySink>,
        dry_run: bool,
    ) -> Result<usize>;

    /// Overwriting copies of extras into the structured tree.
    async fn copy_extras(
        &self,
        copies: &[PlannedTransfer],
        sink: Arc<dyn CopySink>,
        heartbeat: Heartbeat,
        dry_run: bool,
    ) -> Result<usize>;

    async fn capture_staging_tree(&self, root: &Path) -> Result<StagingNode>;

    async fn verify_output_integrity(
        &self,
        source_root: &Path,
        output_root: &Path,
    ) -> Result<IntegrityReport>;

    async fn remove_tree(&self, path: &Path, dry_run: bool) -> Result<()>;
}

/// Dialogue-text extraction for one media file.
#[async_trait]
pub trait SubtitleSource: Send + Sync {
    /// Idempotent per target path; per-file failure surfaces as `None`.
    async fn extract(&self, request: &SubtitleExtractRequest) -> Result<Option<ExtractedSubtitle>>;
}

/// Public anime catalogue.
#[async_trait]
pub trait AnimeCatalogue: Send + Sync {
    async fn search_anime(&self, cleaned_name: &str) -> Result<Option<AnimeSearchResult>>;

    /// Prequel-walk to the relation root, then sequel-walk, TV entries only.
    async fn discover_all_seasons(&self, first_id: u64) -> Result<Vec<MinimalAnimeEntry>>;

    async fn fetch_season_episodes(&self, id: u64, expected_count: u32)
        -> Result<Vec<AnimeEpisode>>;
}

/// Structured-output episode assignment.
#[async_trait]
pub trait EpisodeMatcher: Send + Sync {
    async fn match_episodes(
        &self,
        files: &[EpisodeDialogue],
        metadata: &SeriesMetadata,
    ) -> Result<Vec<crate::types::EpisodeMatch>>;
}

/// Everything a coordinator needs, bundled for registration with the host.
#[derive(Clone)]
pub struct ActivitySet {
    pub media: Arc<dyn MediaStore>,
    pub subtitles: Arc<dyn SubtitleSource>,
    pub catalogue: Arc<dyn AnimeCatalogue>,
    pub matcher: Arc<dyn EpisodeMatcher>,
}

impl ActivitySet {
    pub fn new(
        media: Arc<dyn MediaStore>,
        subtitles: Arc<dyn SubtitleSource>,
        catalogue: Arc<dyn AnimeCatalogue>,
        matcher: Arc<dyn EpisodeMatcher>,
    ) -> Self {
        Self {
            media,
            subtitles,
            catalogue,
            matcher,
        }
    }
}
