//! Shared configuration for the sera worker.
//!
//! Everything is loaded once from the environment into an immutable [`Config`]
//! snapshot at startup; coordinators receive what they need as inputs and
//! never consult the environment themselves. A `.env` file in the working
//! directory is honoured when present.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DEFAULT_HOST_ADDRESS: &str = "localhost:7233";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_TASK_QUEUE: &str = "SERA";
pub const DEFAULT_MATCHER_MODEL: &str = "claude-3-5-haiku-latest";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: HostConfig,
    pub limits: ConcurrencyLimits,
    pub media: MediaRoots,
    pub matcher: MatcherConfig,
}

/// Durable-execution host registration parameters. The address is the
/// endpoint of the orchestration service the worker announces itself to; the
/// namespace and task queue partition on-disk workflow state so independent
/// deployments never share a sandbox.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub address: String,
    pub namespace: String,
    pub task_queue: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
    pub max_concurrent_activities: usize,
    pub max_concurrent_workflow_tasks: usize,
}

/// The four filesystem roots a run flows through. Input is read-only; the
/// processing and staging roots are private per-run sandboxes keyed by
/// workflow id; output is the public library.
#[derive(Debug, Clone)]
pub struct MediaRoots {
    pub input: PathBuf,
    pub processing: PathBuf,
    pub staging: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub model: String,
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let host = HostConfig {
            address: string_var("TEMPORAL_ADDRESS", DEFAULT_HOST_ADDRESS),
            namespace: string_var("TEMPORAL_NAMESPACE", DEFAULT_NAMESPACE),
            task_queue: string_var("TEMPORAL_TASK_QUEUE", DEFAULT_TASK_QUEUE),
        };
        let limits = ConcurrencyLimits {
            max_concurrent_activities: usize_var("MAX_CONCURRENT_ACTIVITIES", 10)?,
            max_concurrent_workflow_tasks: usize_var("MAX_CONCURRENT_WORKFLOW_TASKS", 10)?,
        };
        let media = MediaRoots {
            input: path_var("MEDIA_INPUT_ROOT", "/mnt/media/input"),
            processing: path_var("MEDIA_PROCESSING_ROOT", "/mnt/media/processing"),
            staging: path_var("MEDIA_STAGING_ROOT", "/mnt/media/staging"),
            output: path_var("MEDIA_OUTPUT_ROOT", "/mnt/media/output"),
        };
        let matcher = MatcherConfig {
            model: string_var("ANTHROPIC_MODEL", DEFAULT_MATCHER_MODEL),
            api_key: env::var("ANTHROPIC_API_KEY").ok().filter(|v| !v.trim().is_empty()),
        };

        Ok(Self {
            host,
            limits,
            media,
            matcher,
        })
    }

    /// Root of all durable worker state, partitioned by namespace.
    pub fn state_root(&self) -> PathBuf {
        self.media
            .processing
            .join(".sera")
            .join(&self.host.namespace)
    }

    /// Spool of pending organize requests for this task queue.
    pub fn queue_dir(&self) -> PathBuf {
        self.state_root().join("queue").join(&self.host.task_queue)
    }

    /// Inbound signal files for one run, ingested in lexical order.
    pub fn signals_dir(&self, workflow_id: &str) -> PathBuf {
        self.state_root().join("signals").join(workflow_id)
    }

    /// Journals, progress snapshots, and the final result for one run.
    pub fn run_dir(&self, workflow_id: &str) -> PathBuf {
        self.state_root().join("runs").join(workflow_id)
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.media.processing)
            .with_context(|| format!("creating {}", self.media.processing.display()))?;
        std::fs::create_dir_all(&self.media.staging)
            .with_context(|| format!("creating {}", self.media.staging.display()))?;
        std::fs::create_dir_all(&self.media.output)
            .with_context(|| format!("creating {}", self.media.output.display()))?;
        std::fs::create_dir_all(self.queue_dir())
            .with_context(|| format!("creating {}", self.queue_dir().display()))?;
        Ok(())
    }
}

fn string_var(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn path_var(key: &str, default: &str) -> PathBuf {
    PathBuf::from(string_var(key, default))
}

fn usize_var(key: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{key} must be a positive integer, got {value:?}")),
        _ => Ok(default),
    }
}

/// Convenience for callers that already hold a processing root and need the
/// equivalent state layout without a full [`Config`] (tests, embedding).
pub fn state_root_under(processing_root: &Path, namespace: &str) -> PathBuf {
    processing_root.join(".sera").join(namespace)
}
