//! Append-only run journal.
//!
//! Every completed activity, every child coordinator result, and every
//! inbound signal is appended as one JSON line. Re-running a workflow with
//! the same journal replays recorded outcomes instead of re-executing side
//! effects; the first unrecorded step resumes live. A torn final line (crash
//! mid-append) is dropped on load, which simply re-runs that step.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{OrganizeError, Result};
use crate::workflow::progress::Signal;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    ActivityCompleted {
        seq: u64,
        activity: String,
        result: Value,
        recorded_at: DateTime<Utc>,
    },
    ActivityFailed {
        seq: u64,
        activity: String,
        error: String,
        recorded_at: DateTime<Utc>,
    },
    ChildCompleted {
        child_id: String,
        result: Value,
        recorded_at: DateTime<Utc>,
    },
    SignalReceived {
        signal: Signal,
        recorded_at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
pub enum ActivityOutcome {
    Completed(Value),
    Failed(String),
}

#[derive(Default)]
struct JournalIndex {
    activities: HashMap<u64, ActivityOutcome>,
    children: HashMap<String, Value>,
    signals: Vec<Signal>,
}

pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    index: JournalIndex,
    writer: fs::File,
}

impl Journal {
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut index = JournalIndex::default();
        match fs::read_to_string(&path).await {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalRecord>(line) {
                        Ok(record) => index.absorb(record),
                        Err(e) => {
                            warn!(target: "organize::journal", path = %path.display(), error = %e, "dropping torn journal line");
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let writer = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(
            target: "organize::journal",
            path = %path.display(),
            activities = index.activities.len(),
            children = index.children.len(),
            signals = index.signals.len(),
            "journal opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner { index, writer }),
        })
    }

    pub async fn activity_outcome(&self, seq: u64) -> Option<ActivityOutcome> {
        self.inner.lock().await.index.activities.get(&seq).cloned()
    }

    pub async fn child_result(&self, child_id: &str) -> Option<Value> {
        self.inner.lock().await.index.children.get(child_id).cloned()
    }

    pub async fn recorded_signals(&self) -> Vec<Signal> {
        self.inner.lock().await.index.signals.clone()
    }

    pub async fn record_activity_completed(
        &self,
        seq: u64,
        activity: &str,
        result: Value,
    ) -> Result<()> {
        self.append(JournalRecord::ActivityCompleted {
            seq,
            activity: activity.to_string(),
            result,
            recorded_at: Utc::now(),
        })
        .await
    }

    pub async fn record_activity_failed(&self, seq: u64, activity: &str, error: &str) -> Result<()> {
        self.append(JournalRecord::ActivityFailed {
            seq,
            activity: activity.to_string(),
            error: error.to_string(),
            recorded_at: Utc::now(),
        })
        .await
    }

    pub async fn record_child_completed(&self, child_id: &str, result: Value) -> Result<()> {
        self.append(JournalRecord::ChildCompleted {
            child_id: child_id.to_string(),
            result,
            recorded_at: Utc::now(),
        })
        .await
    }

    pub async fn record_signal(&self, signal: Signal) -> Result<()> {
        self.append(JournalRecord::SignalReceived {
            signal,
            recorded_at: Utc::now(),
        })
        .await
    }

    async fn append(&self, record: JournalRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut inner = self.inner.lock().await;
        inner
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| journal_io(&self.path, e))?;
        inner
            .writer
            .flush()
            .await
            .map_err(|e| journal_io(&self.path, e))?;
        inner
            .writer
            .sync_data()
            .await
            .map_err(|e| journal_io(&self.path, e))?;
        inner.index.absorb(record);
        Ok(())
    }
}

impl JournalIndex {
    fn absorb(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::ActivityCompleted { seq, result, .. } => {
                self.activities.insert(seq, ActivityOutcome::Completed(result));
            }
            JournalRecord::ActivityFailed { seq, error, .. } => {
                self.activities.insert(seq, ActivityOutcome::Failed(error));
            }
            JournalRecord::ChildCompleted {
                child_id, result, ..
            } => {
                self.children.insert(child_id, result);
            }
            JournalRecord::SignalReceived { signal, .. } => self.signals.push(signal),
        }
    }
}

fn journal_io(path: &std::path::Path, e: std::io::Error) -> OrganizeError {
    OrganizeError::Journal(format!("append to {} failed: {e}", path.display()))
}
