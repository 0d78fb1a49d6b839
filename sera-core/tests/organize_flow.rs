//! End-to-end workflow tests: real filesystem activities on temp roots,
//! in-memory fakes for the catalogue, subtitle extraction, and the matcher.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::fs;

use sera_core::activities::{
    ActivitySet, AnimeCatalogue, AnimeEpisode, AnimeSearchResult, EpisodeDialogue, EpisodeMatcher,
    ExtractedSubtitle, FsMediaStore, MinimalAnimeEntry, SubtitleExtractRequest, SubtitleOrigin,
    SubtitleSource,
};
use sera_core::types::{
    BilingualTitle, DetectionConfirmation, EpisodeMatch, FolderStatus, OrganizeLibraryProgress,
    OrganizeRequest, ProcessFolderProgress, ReviewDecision, SeriesMetadata, WorkflowStage,
};
use sera_core::workflow::{start_organize, OrganizeEnvironment, OrganizeHandle, Signal};
use sera_core::Result;

const EPISODE_BYTES: usize = 1000;
const EXTRA_BYTES: usize = 100;
const SHOW: &str = "My Show";

// ---------------------------------------------------------------------------
// Collaborator fakes

#[derive(Default)]
struct FakeSubtitles {
    calls: AtomicUsize,
}

#[async_trait]
impl SubtitleSource for FakeSubtitles {
    async fn extract(&self, request: &SubtitleExtractRequest) -> Result<Option<ExtractedSubtitle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stem = request
            .media_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Some(ExtractedSubtitle {
            file_path: request.target_dir.join(format!("{stem}.txt")),
            file_name: format!("{stem}.txt"),
            content: format!("dialogue from {}", request.media_name),
            source: SubtitleOrigin::Embedded,
            language: Some("eng".to_string()),
        }))
    }
}

struct FakeCatalogue {
    found: bool,
    // (catalogue id, episode count) per season, in chain order.
    seasons: Vec<(u64, u32)>,
    calls: AtomicUsize,
}

impl FakeCatalogue {
    fn single_season(episodes: u32) -> Self {
        Self {
            found: true,
            seasons: vec![(100, episodes)],
            calls: AtomicUsize::new(0),
        }
    }

    fn missing() -> Self {
        Self {
            found: false,
            seasons: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn title() -> BilingualTitle {
        BilingualTitle {
            romaji: Some("Watashi no Bangumi".to_string()),
            english: Some(SHOW.to_string()),
        }
    }
}

#[async_trait]
impl AnimeCatalogue for FakeCatalogue {
    async fn search_anime(&self, _cleaned_name: &str) -> Result<Option<AnimeSearchResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.found {
            return Ok(None);
        }
        Ok(Some(AnimeSearchResult {
            id: self.seasons[0].0,
            title: Self::title(),
            episodes: Some(self.seasons[0].1),
            format: Some("TV".to_string()),
        }))
    }

    async fn discover_all_seasons(&self, _first_id: u64) -> Result<Vec<MinimalAnimeEntry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .seasons
            .iter()
            .map(|(id, count)| MinimalAnimeEntry {
                id: *id,
                title: Self::title(),
                episodes: Some(*count),
            })
            .collect())
    }

    async fn fetch_season_episodes(&self, _id: u64, expected: u32) -> Result<Vec<AnimeEpisode>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((1..=expected)
            .map(|number| AnimeEpisode {
                number,
                title: Some(format!("Title {number}")),
                description: None,
            })
            .collect())
    }
}

struct FakeMatcher {
    // file name -> (season, episode, confidence); absent files stay unmatched.
    assignments: HashMap<String, (u32, u32, f64)>,
    calls: AtomicUsize,
}

impl FakeMatcher {
    fn new(assignments: HashMap<String, (u32, u32, f64)>) -> Self {
        Self {
            assignments,
            calls: AtomicUsize::new(0),
        }
    }

    fn confident_run(episodes: impl IntoIterator<Item = u32>) -> Self {
        Self::new(
            episodes
                .into_iter()
                .map(|n| (format!("ep{n:02}.mkv"), (1, n, 0.95)))
                .collect(),
        )
    }
}

#[async_trait]
impl EpisodeMatcher for FakeMatcher {
    async fn match_episodes(
        &self,
        files: &[EpisodeDialogue],
        _metadata: &SeriesMetadata,
    ) -> Result<Vec<EpisodeMatch>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(files
            .iter()
            .filter_map(|file| {
                self.assignments
                    .get(&file.file_name)
                    .map(|&(season, episode, confidence)| EpisodeMatch {
                        file_name: file.file_name.clone(),
                        file_path: file.file_path.clone(),
                        season_number: season,
                        episode_number: episode,
                        episode_title: Some(format!("Title {episode}")),
                        confidence,
                        reasoning: "fixture assignment".to_string(),
                    })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    _tmp: TempDir,
    input: PathBuf,
    processing: PathBuf,
    staging: PathBuf,
    output: PathBuf,
    state: PathBuf,
    series_dir: PathBuf,
    subtitles: Arc<FakeSubtitles>,
    catalogue: Arc<FakeCatalogue>,
    matcher: Arc<FakeMatcher>,
}

impl Harness {
    async fn new(catalogue: FakeCatalogue, matcher: FakeMatcher) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let harness = Self {
            input: root.join("input"),
            processing: root.join("processing"),
            staging: root.join("staging"),
            output: root.join("output"),
            state: root.join("state"),
            series_dir: root.join("input").join(SHOW),
            subtitles: Arc::new(FakeSubtitles::default()),
            catalogue: Arc::new(catalogue),
            matcher: Arc::new(matcher),
            _tmp: tmp,
        };
        for dir in [
            &harness.input,
            &harness.processing,
            &harness.staging,
            &harness.output,
            &harness.state,
            &harness.series_dir,
        ] {
            fs::create_dir_all(dir).await.expect("create root");
        }
        harness
    }

    async fn seed(&self, relative: &str, bytes: usize) {
        let path = self.series_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.expect("seed parent");
        }
        fs::write(&path, vec![b'x'; bytes]).await.expect("seed file");
    }

    async fn seed_disc(&self, disc: &str, episodes: impl IntoIterator<Item = u32>) {
        for n in episodes {
            self.seed(&format!("{disc}/ep{n:02}.mkv"), EPISODE_BYTES).await;
        }
        self.seed(&format!("{disc}/menu.mkv"), EXTRA_BYTES).await;
    }

    fn activity_set(&self) -> ActivitySet {
        ActivitySet::new(
            Arc::new(FsMediaStore::new()),
            self.subtitles.clone(),
            self.catalogue.clone(),
            self.matcher.clone(),
        )
    }

    async fn start(&self, workflow_id: &str, dry_run: bool) -> OrganizeHandle {
        let request = OrganizeRequest {
            workflow_id: workflow_id.to_string(),
            series_dir: self.series_dir.clone(),
            dry_run,
            confidence_threshold: 0.85,
        };
        start_organize(
            self.activity_set(),
            OrganizeEnvironment {
                processing_root: self.processing.clone(),
                staging_root: self.staging.clone(),
                output_root: self.output.clone(),
            },
            self.state.join(workflow_id),
            10,
            request,
        )
        .await
        .expect("workflow starts")
    }

    fn processing_disc_path(&self, workflow_id: &str, disc: &str, file: &str) -> PathBuf {
        self.processing
            .join(workflow_id)
            .join(SHOW)
            .join(disc)
            .join(file)
    }

    fn output_episode(&self, season: u32, episode: u32) -> PathBuf {
        self.output.join(SHOW).join(format!("Season {season:02}")).join(format!(
            "{SHOW} - S{season:02}E{episode:02} - Title {episode}.mkv"
        ))
    }
}

fn exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

async fn wait_until(
    handle: &OrganizeHandle,
    what: &str,
    pred: impl Fn(&OrganizeLibraryProgress) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if pred(&handle.get_progress()) {
            return;
        }
        assert!(
            !handle.is_finished(),
            "workflow finished while waiting for {what}"
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_folder(
    handle: &OrganizeHandle,
    folder: &str,
    what: &str,
    pred: impl Fn(&ProcessFolderProgress) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if handle
            .get_folder_progress(folder)
            .map(|p| pred(&p))
            .unwrap_or(false)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn happy_path_publishes_canonical_layout() {
    let harness = Harness::new(
        FakeCatalogue::single_season(12),
        FakeMatcher::confident_run(1..=12),
    )
    .await;
    harness.seed_disc("Disc 01", 1..=6).await;
    harness.seed_disc("Disc 02", 7..=12).await;

    let handle = harness.start("wf-happy", false).await;
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;

    let progress = handle.get_progress();
    assert!(progress.can_finalize);
    assert_eq!(progress.folders_completed, 2);
    assert_eq!(progress.resolved_core_episode_count, 12);
    assert_eq!(progress.unresolved_core_episode_count, 0);

    let tree = handle.get_staging_tree().expect("staging tree captured");
    let top: Vec<&str> = tree.children.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(top, vec!["Extras", "Season 01"]);

    handle.signal(Signal::Finalize { approved: true }).await.unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    assert_eq!(result.completed, 2);
    assert_eq!(result.failed, 0);
    assert_eq!(result.show_name.as_deref(), Some(SHOW));

    for episode in 1..=12 {
        assert!(
            exists(&harness.output_episode(1, episode)),
            "missing published episode {episode}"
        );
    }
    assert!(exists(
        &harness.output.join(SHOW).join("Extras/Disc 01/menu.mkv")
    ));
    assert!(exists(
        &harness.output.join(SHOW).join("Extras/Disc 02/menu.mkv")
    ));

    // Sandboxes removed, source untouched.
    assert!(!exists(&harness.processing.join("wf-happy")));
    assert!(!exists(&harness.staging.join("wf-happy")));
    assert!(exists(&harness.series_dir.join("Disc 01/ep01.mkv")));
}

#[tokio::test]
async fn rejected_review_waits_until_an_approval_settles_it() {
    let mut assignments: HashMap<String, (u32, u32, f64)> = (1..=5)
        .map(|n| (format!("ep{n:02}.mkv"), (1, n, 0.95)))
        .collect();
    // Low-confidence and wrong: suggests slot 5, already taken by ep05.
    assignments.insert("ep06.mkv".to_string(), (1, 5, 0.5));

    let harness = Harness::new(
        FakeCatalogue::single_season(6),
        FakeMatcher::new(assignments),
    )
    .await;
    harness.seed_disc("Disc 01", 1..=6).await;

    let handle = harness.start("wf-review", false).await;
    wait_for_folder(&handle, "Disc 01", "review item", |p| {
        p.status == FolderStatus::AwaitingReview && p.pending_reviews.len() == 1
    })
    .await;

    let folder = handle.get_folder_progress("Disc 01").unwrap();
    let item = &folder.pending_reviews[0];
    assert_eq!(item.id, "Disc 01-ep06.mkv");
    assert_eq!(item.suggested_episode, 5);
    assert!(!item.subtitle_snippet.is_empty());
    assert_eq!(folder.episodes_copied, 5);

    // A rejection is discarded; the item stays pending.
    handle
        .signal(Signal::ReviewDecision(ReviewDecision {
            review_item_id: item.id.clone(),
            approved: false,
            corrected_season: None,
            corrected_episode: None,
        }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let folder = handle.get_folder_progress("Disc 01").unwrap();
    assert_eq!(folder.status, FolderStatus::AwaitingReview);
    assert_eq!(folder.pending_reviews.len(), 1);
    assert_eq!(folder.episodes_copied, 5);

    // Approval with a corrected slot settles it.
    handle
        .signal(Signal::ReviewDecision(ReviewDecision {
            review_item_id: item.id.clone(),
            approved: true,
            corrected_season: None,
            corrected_episode: Some(6),
        }))
        .await
        .unwrap();
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;
    handle.signal(Signal::Finalize { approved: true }).await.unwrap();

    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    assert_eq!(result.folders[0].episodes_renamed, 6);
    assert!(exists(&harness.output_episode(1, 6)));
}

#[tokio::test]
async fn detection_confirmation_corrects_the_cluster() {
    let mut assignments: HashMap<String, (u32, u32, f64)> = (1..=4)
        .map(|n| (format!("ep{n:02}.mkv"), (1, n, 0.95)))
        .collect();
    assignments.insert("extra1.mkv".to_string(), (1, 5, 0.95));

    let harness = Harness::new(
        FakeCatalogue::single_season(5),
        FakeMatcher::new(assignments),
    )
    .await;
    for n in 1..=5 {
        harness
            .seed(&format!("Disc 01/ep{n:02}.mkv"), EPISODE_BYTES)
            .await;
    }
    for n in 1..=4 {
        harness
            .seed(&format!("Disc 01/extra{n}.mkv"), EXTRA_BYTES)
            .await;
    }

    let handle = harness.start("wf-detect", false).await;
    wait_for_folder(&handle, "Disc 01", "detection review", |p| {
        p.status == FolderStatus::AwaitingDetectionReview
    })
    .await;

    // The operator pulls ep05 out of the cluster and promotes extra1 into it.
    handle
        .signal(Signal::DetectionConfirmation {
            folder_name: "Disc 01".to_string(),
            confirmation: DetectionConfirmation {
                confirmed: true,
                added_paths: vec![harness.processing_disc_path("wf-detect", "Disc 01", "extra1.mkv")],
                removed_paths: vec![harness.processing_disc_path("wf-detect", "Disc 01", "ep05.mkv")],
            },
        })
        .await
        .unwrap();

    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;
    handle.signal(Signal::Finalize { approved: true }).await.unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    assert_eq!(result.folders[0].episodes_renamed, 5);

    // extra1 was promoted into slot 5; ep05 lands in Extras.
    assert!(exists(&harness.output_episode(1, 5)));
    assert!(exists(
        &harness.output.join(SHOW).join("Extras/Disc 01/ep05.mkv")
    ));
    assert!(!exists(
        &harness.output.join(SHOW).join("Extras/Disc 01/extra1.mkv")
    ));
}

#[tokio::test]
async fn finalize_rejection_preserves_both_sandboxes() {
    let harness = Harness::new(
        FakeCatalogue::single_season(6),
        FakeMatcher::confident_run(1..=6),
    )
    .await;
    harness.seed_disc("Disc 01", 1..=6).await;

    let handle = harness.start("wf-reject", false).await;
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;

    handle.signal(Signal::Finalize { approved: false }).await.unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Failed);
    assert!(result.error.as_deref().unwrap_or("").contains("rejected"));

    // Nothing published, nothing destroyed.
    assert!(!exists(&harness.output.join(SHOW)));
    assert!(exists(&harness.staging.join("wf-reject").join(SHOW)));
    assert!(exists(&harness.processing.join("wf-reject")));
}

#[tokio::test]
async fn catalogue_miss_fails_without_touching_anything() {
    let harness = Harness::new(FakeCatalogue::missing(), FakeMatcher::confident_run(1..=6)).await;
    harness.seed_disc("Disc 01", 1..=6).await;

    let handle = harness.start("wf-miss", false).await;
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Failed);
    assert!(result
        .error
        .as_deref()
        .unwrap_or("")
        .contains("no catalogue entry"));
    assert_eq!(result.completed, 0);
    assert!(!exists(&harness.output.join(SHOW)));
    assert!(exists(&harness.series_dir.join("Disc 01/ep01.mkv")));
}

#[tokio::test]
async fn flat_series_directory_is_processed_as_one_disc() {
    let harness = Harness::new(
        FakeCatalogue::single_season(6),
        FakeMatcher::confident_run(1..=6),
    )
    .await;
    for n in 1..=6 {
        harness.seed(&format!("ep{n:02}.mkv"), EPISODE_BYTES).await;
    }
    harness.seed("menu.mkv", EXTRA_BYTES).await;

    let handle = harness.start("wf-flat", false).await;
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;
    let progress = handle.get_progress();
    assert_eq!(progress.total_folders, 1);
    assert!(progress.folder_statuses.contains_key(SHOW));

    handle.signal(Signal::Finalize { approved: true }).await.unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    assert_eq!(result.completed, 1);
    for episode in 1..=6 {
        assert!(exists(&harness.output_episode(1, episode)));
    }
    assert!(exists(
        &harness.output.join(SHOW).join("Extras").join(SHOW).join("menu.mkv")
    ));
}

#[tokio::test]
async fn crash_before_finalize_resumes_without_re_running_activities() {
    let harness = Harness::new(
        FakeCatalogue::single_season(12),
        FakeMatcher::confident_run(1..=12),
    )
    .await;
    harness.seed_disc("Disc 01", 1..=6).await;
    harness.seed_disc("Disc 02", 7..=12).await;

    let handle = harness.start("wf-resume", false).await;
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;

    let matcher_calls = harness.matcher.calls.load(Ordering::SeqCst);
    let subtitle_calls = harness.subtitles.calls.load(Ordering::SeqCst);
    let catalogue_calls = harness.catalogue.calls.load(Ordering::SeqCst);
    assert_eq!(matcher_calls, 2);
    assert_eq!(subtitle_calls, 12);

    // Simulated host crash between stages 5 and 6.
    handle.abort();
    drop(handle);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let resumed = harness.start("wf-resume", false).await;
    wait_until(&resumed, "awaiting finalize after resume", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;

    // Everything up to the gate replayed from the journal.
    assert_eq!(harness.matcher.calls.load(Ordering::SeqCst), matcher_calls);
    assert_eq!(harness.subtitles.calls.load(Ordering::SeqCst), subtitle_calls);
    assert_eq!(harness.catalogue.calls.load(Ordering::SeqCst), catalogue_calls);

    resumed.signal(Signal::Finalize { approved: true }).await.unwrap();
    let result = resumed.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    for episode in 1..=12 {
        assert!(exists(&harness.output_episode(1, episode)));
    }
    assert!(!exists(&harness.processing.join("wf-resume")));
}

#[tokio::test]
async fn dry_run_plans_without_publishing() {
    let harness = Harness::new(
        FakeCatalogue::single_season(6),
        FakeMatcher::confident_run(1..=6),
    )
    .await;
    harness.seed_disc("Disc 01", 1..=6).await;

    let handle = harness.start("wf-dry", true).await;
    wait_until(&handle, "awaiting finalize", |p| {
        p.stage == WorkflowStage::AwaitingFinalize
    })
    .await;

    let progress = handle.get_progress();
    assert!(progress.can_finalize);
    // Planned actions are enumerated: 6 episode moves + 1 extra copy.
    assert_eq!(
        progress.structuring_progress.as_ref().map(|s| s.total_files),
        Some(7)
    );

    handle.signal(Signal::Finalize { approved: true }).await.unwrap();
    let result = handle.join().await.unwrap();
    assert_eq!(result.stage, WorkflowStage::Completed);
    assert_eq!(result.folders[0].episodes_renamed, 6);

    // No episode copies, no staging, no output; the private working copy is
    // retained for inspection and the source is untouched.
    assert!(!exists(&harness.output.join(SHOW)));
    assert!(!exists(&harness.staging.join("wf-dry")));
    assert!(exists(&harness.processing.join("wf-dry").join(SHOW)));
    assert!(!exists(
        &harness.processing.join("wf-dry").join(SHOW).join("_episodes")
    ));
    assert!(exists(&harness.series_dir.join("Disc 01/ep01.mkv")));
}
