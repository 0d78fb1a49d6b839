//! # sera worker
//!
//! Single worker process for the organize pipeline. Registers the production
//! activity implementations with the embedded durable runtime, then drains
//! the task-queue spool: each request file becomes one organize run, inbound
//! signal files are journaled and applied in lexical order, and progress /
//! result snapshots are written next to the run's journal. On restart,
//! requests still in the spool resume from their journals without re-doing
//! completed work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::fs;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sera_config::Config;
use sera_core::activities::{
    ActivitySet, AnilistClient, AnthropicMatcher, FsMediaStore, MuxToolExtractor,
};
use sera_core::types::{default_confidence_threshold, OrganizeRequest};
use sera_core::workflow::{start_organize, OrganizeEnvironment, OrganizeHandle, Signal};

const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Operator-written request file in the task-queue spool.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrganizeSubmission {
    #[serde(default)]
    workflow_id: Option<String>,
    series_dir: PathBuf,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_confidence_threshold")]
    confidence_threshold: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,organize=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("loading configuration")?;
    config
        .ensure_directories()
        .context("preparing media and state directories")?;

    info!(
        host = %config.host.address,
        namespace = %config.host.namespace,
        task_queue = %config.host.task_queue,
        max_activities = config.limits.max_concurrent_activities,
        max_workflows = config.limits.max_concurrent_workflow_tasks,
        "worker registered"
    );

    let activities = ActivitySet::new(
        Arc::new(FsMediaStore::new()),
        Arc::new(MuxToolExtractor::new()),
        Arc::new(AnilistClient::new()),
        Arc::new(AnthropicMatcher::new(
            config.matcher.api_key.clone(),
            config.matcher.model.clone(),
        )),
    );

    run_worker(Arc::new(config), activities).await;
    Ok(())
}

async fn run_worker(config: Arc<Config>, activities: ActivitySet) {
    let mut running: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
    let mut poll = tokio::time::interval(QUEUE_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested, in-flight runs resume from their journals on next start");
                return;
            }
        }

        running.retain(|_, task| !task.is_finished());

        let pending = match pending_requests(&config.queue_dir()).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "task queue unreadable");
                continue;
            }
        };

        for request_path in pending {
            if running.len() >= config.limits.max_concurrent_workflow_tasks {
                break;
            }
            let request = match parse_submission(&config, &request_path).await {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!(request = %request_path.display(), error = %e, "request rejected");
                    // Park the bad request so the spool doesn't loop on it.
                    let parked = request_path.with_extension("rejected");
                    if let Err(rename_err) = fs::rename(&request_path, &parked).await {
                        warn!(error = %rename_err, "failed to park rejected request");
                    }
                    continue;
                }
            };
            if running.contains_key(&request.workflow_id) {
                continue;
            }
            match launch(&config, &activities, request).await {
                Ok((workflow_id, handle)) => {
                    let supervisor = tokio::spawn(supervise(
                        config.clone(),
                        handle,
                        workflow_id.clone(),
                        request_path,
                    ));
                    running.insert(workflow_id, supervisor);
                }
                Err(e) => {
                    error!(request = %request_path.display(), error = %e, "run failed to start");
                }
            }
        }
    }
}

async fn pending_requests(queue_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut requests = Vec::new();
    let mut entries = fs::read_dir(queue_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            requests.push(path);
        }
    }
    requests.sort();
    Ok(requests)
}

async fn parse_submission(
    config: &Config,
    request_path: &Path,
) -> anyhow::Result<Option<OrganizeRequest>> {
    let raw = fs::read_to_string(request_path)
        .await
        .with_context(|| format!("reading {}", request_path.display()))?;
    let submission: OrganizeSubmission =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", request_path.display()))?;

    let workflow_id = submission
        .workflow_id
        .clone()
        .unwrap_or_else(|| format!("wf-{}", uuid::Uuid::new_v4()));
    let series_dir = if submission.series_dir.is_absolute() {
        submission.series_dir.clone()
    } else {
        config.media.input.join(&submission.series_dir)
    };

    // A run whose result is already on disk is finished; drop the request.
    if fs::metadata(config.run_dir(&workflow_id).join("result.json"))
        .await
        .is_ok()
    {
        info!(workflow = %workflow_id, "request already completed, removing from spool");
        fs::remove_file(request_path).await.ok();
        return Ok(None);
    }

    Ok(Some(OrganizeRequest {
        workflow_id,
        series_dir,
        dry_run: submission.dry_run,
        confidence_threshold: submission.confidence_threshold,
    }))
}

async fn launch(
    config: &Config,
    activities: &ActivitySet,
    request: OrganizeRequest,
) -> anyhow::Result<(String, OrganizeHandle)> {
    let workflow_id = request.workflow_id.clone();
    let environment = OrganizeEnvironment {
        processing_root: config.media.processing.clone(),
        staging_root: config.media.staging.clone(),
        output_root: config.media.output.clone(),
    };

    let handle = start_organize(
        activities.clone(),
        environment,
        config.run_dir(&workflow_id),
        config.limits.max_concurrent_activities,
        request,
    )
    .await?;

    Ok((workflow_id, handle))
}

/// Pump one run: apply inbound signal files in lexical order, keep the
/// progress snapshot fresh, and persist the final result.
async fn supervise(
    config: Arc<Config>,
    handle: OrganizeHandle,
    workflow_id: String,
    request_path: PathBuf,
) {
    let signals_dir = config.signals_dir(&workflow_id);
    let run_dir = config.run_dir(&workflow_id);
    if let Err(e) = fs::create_dir_all(&signals_dir).await {
        warn!(workflow = %workflow_id, error = %e, "cannot create signals directory");
    }

    let mut tick = tokio::time::interval(SIGNAL_POLL_INTERVAL);
    loop {
        tick.tick().await;
        ingest_signals(&handle, &signals_dir).await;
        write_snapshot(&handle, &run_dir).await;
        if handle.is_finished() {
            break;
        }
    }

    match handle.join().await {
        Ok(result) => {
            info!(
                workflow = %workflow_id,
                stage = result.stage.as_str(),
                completed = result.completed,
                failed = result.failed,
                "run finished"
            );
            if let Ok(json) = serde_json::to_string_pretty(&result) {
                if let Err(e) = fs::write(run_dir.join("result.json"), json).await {
                    warn!(workflow = %workflow_id, error = %e, "failed to persist result");
                }
            }
            fs::remove_file(&request_path).await.ok();
        }
        Err(e) => {
            error!(workflow = %workflow_id, error = %e, "run crashed, request stays queued for resume");
        }
    }
}

async fn ingest_signals(handle: &OrganizeHandle, signals_dir: &Path) {
    let mut files = Vec::new();
    let mut entries = match fs::read_dir(signals_dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(signal = %path.display(), error = %e, "signal unreadable");
                continue;
            }
        };
        match serde_json::from_str::<Signal>(&raw) {
            Ok(signal) => {
                if let Err(e) = handle.signal(signal).await {
                    warn!(signal = %path.display(), error = %e, "signal rejected");
                    continue;
                }
                fs::remove_file(&path).await.ok();
            }
            Err(e) => {
                warn!(signal = %path.display(), error = %e, "malformed signal parked");
                fs::rename(&path, path.with_extension("rejected")).await.ok();
            }
        }
    }
}

async fn write_snapshot(handle: &OrganizeHandle, run_dir: &Path) {
    if let Ok(json) = serde_json::to_string_pretty(&handle.get_progress()) {
        fs::write(run_dir.join("progress.json"), json).await.ok();
    }
    if let Some(tree) = handle.get_staging_tree() {
        if let Ok(json) = serde_json::to_string_pretty(&tree) {
            fs::write(run_dir.join("staging_tree.json"), json).await.ok();
        }
    }
}
