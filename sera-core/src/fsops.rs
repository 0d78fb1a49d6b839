//! Filesystem enumeration and tree helpers.
//!
//! Walks that target original content skip reserved working directories
//! (names starting with `_`) and hidden entries; walks over trees the
//! pipeline built itself (structuring, staging, verification) see everything.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs;
use tracing::warn;

use crate::error::{OrganizeError, Result};
use crate::types::{SourceFile, StagingNode, StagingNodeKind};

pub const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "webm", "m4v", "mov", "wmv", "flv"];

pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            VIDEO_EXTENSIONS.iter().any(|v| *v == lower)
        })
        .unwrap_or(false)
}

/// Reserved working directories live alongside original content and must be
/// excluded from any enumeration that targets originals.
pub fn is_working_dir_name(name: &str) -> bool {
    name.starts_with('_')
}

fn skip_dir_for_originals(name: &str) -> bool {
    is_working_dir_name(name) || name.starts_with('.')
}

/// Recursively enumerate original content under `root`, skipping reserved
/// and hidden directories. Relative paths are anchored at `root`.
pub async fn enumerate_files(root: &Path) -> Result<Vec<SourceFile>> {
    walk(root, true).await
}

/// Recursively enumerate every file under `root`, working directories
/// included.
pub async fn walk_all_files(root: &Path) -> Result<Vec<SourceFile>> {
    walk(root, false).await
}

/// Video files among the original content under `root`.
pub async fn collect_video_files(root: &Path) -> Result<Vec<SourceFile>> {
    let mut files = enumerate_files(root).await?;
    files.retain(|f| is_video_file(&f.path));
    Ok(files)
}

async fn walk(root: &Path, originals_only: bool) -> Result<Vec<SourceFile>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await.transpose() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(target: "organize::fs", path = %dir.display(), error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(target: "organize::fs", entry = %name, error = %e, "skipping entry due to metadata error");
                    continue;
                }
            };

            if metadata.is_dir() {
                if originals_only && skip_dir_for_originals(&name) {
                    continue;
                }
                stack.push(entry.path());
            } else if metadata.is_file() {
                let path = entry.path();
                let relative_path = path
                    .strip_prefix(root)
                    .map_err(|_| {
                        OrganizeError::Internal(format!(
                            "entry {} escaped enumeration root {}",
                            path.display(),
                            root.display()
                        ))
                    })?
                    .to_path_buf();
                out.push(SourceFile {
                    path,
                    relative_path,
                    name,
                    size_bytes: metadata.len(),
                });
            }
        }
    }

    // Deterministic ordering regardless of readdir order.
    out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

/// Immediate subdirectories of `root`, reserved and hidden names skipped.
pub async fn list_subdirectories(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if skip_dir_for_originals(&name) {
            continue;
        }
        match entry.metadata().await {
            Ok(metadata) if metadata.is_dir() => dirs.push(entry.path()),
            Ok(_) => {}
            Err(e) => {
                warn!(target: "organize::fs", entry = %name, error = %e, "skipping entry due to metadata error");
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Force-recursive removal that tolerates the tree already being gone.
pub async fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Capture a recursive tree snapshot rooted at `root`: directories sorted
/// before files, alphabetical within each group.
pub async fn capture_tree(root: &Path) -> Result<StagingNode> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());
    let children = capture_children(root.to_path_buf(), PathBuf::new()).await?;
    Ok(StagingNode {
        name,
        kind: StagingNodeKind::Directory,
        relative_path: PathBuf::new(),
        size: None,
        children,
    })
}

fn capture_children(dir: PathBuf, relative: PathBuf) -> BoxFuture<'static, Result<Vec<StagingNode>>> {
    async move {
        let mut dirs = Vec::new();
        let mut files = Vec::new();

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let metadata = entry.metadata().await?;
            let child_relative = relative.join(&name);
            if metadata.is_dir() {
                let children = capture_children(entry.path(), child_relative.clone()).await?;
                dirs.push(StagingNode {
                    name,
                    kind: StagingNodeKind::Directory,
                    relative_path: child_relative,
                    size: None,
                    children,
                });
            } else if metadata.is_file() {
                files.push(StagingNode {
                    name,
                    kind: StagingNodeKind::File,
                    relative_path: child_relative,
                    size: Some(metadata.len()),
                    children: Vec::new(),
                });
            }
        }

        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));
        dirs.extend(files);
        Ok(dirs)
    }
    .boxed()
}
