//! Dialogue text extraction.
//!
//! Prefers a sidecar subtitle file next to the media, falls back to probing
//! embedded text streams with `ffprobe` and extracting via `ffmpeg`. Output
//! is always plain dialogue text; a `.txt` already present in the target
//! directory is returned verbatim, which makes per-file extraction
//! idempotent across restarts. Per-file failure is reported as `None`, never
//! as an error.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use super::SubtitleSource;
use crate::error::Result;

const SIDECAR_EXTENSIONS: &[&str] = &["srt", "ass", "ssa", "vtt"];
const TEXT_SUBTITLE_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "mov_text", "webvtt"];

static HTML_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").expect("tag regex should compile"));

static ASS_OVERRIDE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^}]*\}").expect("override regex should compile"));

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtitleExtractRequest {
    pub media_path: PathBuf,
    pub media_name: String,
    pub target_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleOrigin {
    Embedded,
    External,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedSubtitle {
    pub file_path: PathBuf,
    pub file_name: String,
    pub content: String,
    pub source: SubtitleOrigin,
    pub language: Option<String>,
}

/// Extractor that shells out to the configured muxer binaries.
#[derive(Clone, Debug)]
pub struct MuxToolExtractor {
    ffprobe_bin: String,
    ffmpeg_bin: String,
}

impl Default for MuxToolExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxToolExtractor {
    pub fn new() -> Self {
        Self {
            ffprobe_bin: "ffprobe".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }

    pub fn with_binaries(ffprobe_bin: impl Into<String>, ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    async fn find_sidecar(&self, media_path: &Path) -> Option<(PathBuf, String)> {
        let stem = media_path.file_stem()?.to_string_lossy().to_string();
        let dir = media_path.parent()?;
        for ext in SIDECAR_EXTENSIONS {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if fs::metadata(&candidate).await.is_ok() {
                return Some((candidate, (*ext).to_string()));
            }
        }
        None
    }

    async fn probe_embedded(&self, media_path: &Path) -> Option<(u32, Option<String>)> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(media_path)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let probe: ProbeOutput = serde_json::from_slice(&output.stdout).ok()?;

        let text_streams: Vec<&ProbeStream> = probe
            .streams
            .iter()
            .filter(|s| {
                s.codec_type.as_deref() == Some("subtitle")
                    && s.codec_name
                        .as_deref()
                        .map(|c| TEXT_SUBTITLE_CODECS.contains(&c))
                        .unwrap_or(false)
            })
            .collect();

        let preferred = text_streams
            .iter()
            .find(|s| matches!(s.language().as_deref(), Some("eng") | Some("en")))
            .or_else(|| text_streams.first())?;
        Some((preferred.index, preferred.language()))
    }

    async fn extract_embedded(&self, media_path: &Path, stream_index: u32) -> Option<String> {
        let output = Command::new(&self.ffmpeg_bin)
            .args(["-v", "error", "-i"])
            .arg(media_path)
            .args(["-map", &format!("0:{stream_index}"), "-f", "srt", "-"])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl SubtitleSource for MuxToolExtractor {
    async fn extract(&self, request: &SubtitleExtractRequest) -> Result<Option<ExtractedSubtitle>> {
        let stem = match request.media_path.file_stem() {
            Some(stem) => stem.to_string_lossy().to_string(),
            None => return Ok(None),
        };
        let txt_name = format!("{stem}.txt");
        let txt_path = request.target_dir.join(&txt_name);

        // Idempotence: an existing transcript wins outright.
        if let Ok(existing) = fs::read_to_string(&txt_path).await {
            return Ok(Some(ExtractedSubtitle {
                file_path: txt_path,
                file_name: txt_name,
                content: existing,
                source: SubtitleOrigin::External,
                language: None,
            }));
        }

        let (content, source, language) =
            if let Some((sidecar, ext)) = self.find_sidecar(&request.media_path).await {
                match fs::read_to_string(&sidecar).await {
                    Ok(raw) => (to_plain_text(&ext, &raw), SubtitleOrigin::External, None),
                    Err(e) => {
                        debug!(target: "organize::subtitles", media = %request.media_name, error = %e, "sidecar unreadable");
                        return Ok(None);
                    }
                }
            } else if let Some((index, language)) = self.probe_embedded(&request.media_path).await {
                match self.extract_embedded(&request.media_path, index).await {
                    Some(raw) => (to_plain_text("srt", &raw), SubtitleOrigin::Embedded, language),
                    None => {
                        debug!(target: "organize::subtitles", media = %request.media_name, "embedded extraction failed");
                        return Ok(None);
                    }
                }
            } else {
                debug!(target: "organize::subtitles", media = %request.media_name, "no subtitle source found");
                return Ok(None);
            };

        if content.trim().is_empty() {
            return Ok(None);
        }

        fs::create_dir_all(&request.target_dir).await?;
        fs::write(&txt_path, &content).await?;

        Ok(Some(ExtractedSubtitle {
            file_path: txt_path,
            file_name: txt_name,
            content,
            source,
            language,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

impl ProbeStream {
    fn language(&self) -> Option<String> {
        self.tags.get("language").cloned()
    }
}

/// Reduce a subtitle document to bare dialogue lines.
pub fn to_plain_text(format: &str, raw: &str) -> String {
    match format {
        "ass" | "ssa" => ass_to_plain_text(raw),
        "vtt" => vtt_to_plain_text(raw),
        _ => srt_to_plain_text(raw),
    }
}

fn srt_to_plain_text(raw: &str) -> String {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.contains("-->") || line.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let stripped = HTML_TAG_REGEX.replace_all(line, "");
        let stripped = stripped.trim();
        if !stripped.is_empty() {
            lines.push(stripped.to_string());
        }
    }
    lines.join("\n")
}

fn ass_to_plain_text(raw: &str) -> String {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let Some(rest) = line.trim().strip_prefix("Dialogue:") else {
            continue;
        };
        // Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV,
        // Effect, Text — the text field may itself contain commas.
        let Some(text) = rest.splitn(10, ',').nth(9) else {
            continue;
        };
        let text = ASS_OVERRIDE_REGEX.replace_all(text, "");
        let text = text.replace("\\N", " ").replace("\\n", " ");
        let text = text.trim();
        if !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines.join("\n")
}

fn vtt_to_plain_text(raw: &str) -> String {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.eq_ignore_ascii_case("webvtt")
            || line.starts_with("NOTE")
            || line.contains("-->")
            || line.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        let stripped = HTML_TAG_REGEX.replace_all(line, "");
        let stripped = stripped.trim();
        if !stripped.is_empty() {
            lines.push(stripped.to_string());
        }
    }
    lines.join("\n")
}
