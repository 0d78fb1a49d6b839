//! LLM episode matcher.
//!
//! Sends per-file dialogue excerpts plus the season/episode catalogue to the
//! Anthropic Messages API with a forced tool whose input schema is the match
//! list, so the response is structured rather than free text. The reply is
//! parsed and validated at this boundary: downstream code only ever sees
//! checked [`EpisodeMatch`] values.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::EpisodeMatcher;
use crate::error::Result;
use crate::types::{EpisodeMatch, SeriesMetadata};

/// One media file's dialogue text, keyed by the media file itself (not the
/// transcript on disk) so matches resolve back to the file to copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeDialogue {
    pub file_name: String,
    pub file_path: PathBuf,
    pub dialogue: String,
}

pub const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MATCH_TOOL_NAME: &str = "record_episode_matches";
const MAX_RESPONSE_TOKENS: u32 = 8192;

/// Total dialogue text sent per request; individual files are truncated
/// proportionally so every file keeps a share of the budget.
pub const SUBTITLE_CHAR_BUDGET: usize = 500_000;

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no API key configured")]
    MissingApiKey,
}

pub struct AnthropicMatcher {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl AnthropicMatcher {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: ANTHROPIC_ENDPOINT.to_string(),
            api_key,
            model: model.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl EpisodeMatcher for AnthropicMatcher {
    async fn match_episodes(
        &self,
        files: &[EpisodeDialogue],
        metadata: &SeriesMetadata,
    ) -> Result<Vec<EpisodeMatch>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(MatcherError::MissingApiKey)?;

        let excerpts = truncate_proportionally(files, SUBTITLE_CHAR_BUDGET);
        let request = build_request(&self.model, &excerpts, metadata);

        debug!(target: "organize::matcher", files = files.len(), model = %self.model, "requesting episode assignments");
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(MatcherError::Network)?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.map_err(MatcherError::Network)?;
        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(MatcherError::Api(format!("{status}: {message}")).into());
        }

        let raw_matches = extract_tool_matches(&body)?;
        let matches = validate_matches(raw_matches, files, metadata);
        info!(
            target: "organize::matcher",
            requested = files.len(),
            matched = matches.len(),
            "episode assignments received"
        );
        Ok(matches)
    }
}

fn build_request(
    model: &str,
    excerpts: &[(String, String)],
    metadata: &SeriesMetadata,
) -> serde_json::Value {
    let seasons: Vec<serde_json::Value> = metadata
        .seasons
        .iter()
        .map(|season| {
            json!({
                "seasonNumber": season.season_number,
                "title": season.title.preferred(),
                "episodeCount": season.episode_count,
                "episodes": season.episodes.iter().map(|e| json!({
                    "number": e.number,
                    "title": e.title,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    let files: Vec<serde_json::Value> = excerpts
        .iter()
        .map(|(name, text)| json!({ "fileName": name, "dialogue": text }))
        .collect();

    json!({
        "model": model,
        "max_tokens": MAX_RESPONSE_TOKENS,
        "system": "You assign anime episode files to their (season, episode) slot in a series. \
                   You receive the series' season/episode catalogue and a dialogue excerpt per file. \
                   Match each file by comparing its dialogue to episode titles and your knowledge of \
                   the series. Report a confidence between 0 and 1 for each assignment and a short \
                   reasoning. Only assign slots that exist in the catalogue.",
        "messages": [{
            "role": "user",
            "content": serde_json::to_string(&json!({
                "seasons": seasons,
                "files": files,
            })).unwrap_or_default(),
        }],
        "tools": [{
            "name": MATCH_TOOL_NAME,
            "description": "Record the (season, episode) assignment for every file that could be matched.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "matches": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "fileName": {"type": "string"},
                                "seasonNumber": {"type": "integer", "minimum": 1},
                                "episodeNumber": {"type": "integer", "minimum": 1},
                                "episodeTitle": {"type": "string"},
                                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                                "reasoning": {"type": "string"}
                            },
                            "required": ["fileName", "seasonNumber", "episodeNumber", "confidence", "reasoning"]
                        }
                    }
                },
                "required": ["matches"]
            }
        }],
        "tool_choice": {"type": "tool", "name": MATCH_TOOL_NAME},
    })
}

/// Truncate each file's dialogue so the total stays within `budget`,
/// shrinking every file by the same proportion.
pub fn truncate_proportionally(
    files: &[EpisodeDialogue],
    budget: usize,
) -> Vec<(String, String)> {
    let total: usize = files.iter().map(|f| f.dialogue.len()).sum();
    let scale = if total > budget {
        budget as f64 / total as f64
    } else {
        1.0
    };

    files
        .iter()
        .map(|file| {
            let keep = (file.dialogue.len() as f64 * scale) as usize;
            let excerpt = truncate_on_char_boundary(&file.dialogue, keep);
            (file.file_name.clone(), excerpt)
        })
        .collect()
}

fn truncate_on_char_boundary(text: &str, mut max_bytes: usize) -> String {
    if max_bytes >= text.len() {
        return text.to_string();
    }
    while max_bytes > 0 && !text.is_char_boundary(max_bytes) {
        max_bytes -= 1;
    }
    text[..max_bytes].to_string()
}

#[derive(Debug, Deserialize)]
struct ToolMatches {
    matches: Vec<RawMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatch {
    file_name: String,
    season_number: u32,
    episode_number: u32,
    #[serde(default)]
    episode_title: Option<String>,
    confidence: f64,
    reasoning: String,
}

fn extract_tool_matches(body: &serde_json::Value) -> std::result::Result<Vec<RawMatch>, MatcherError> {
    let content = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| MatcherError::Parse("response carried no content blocks".to_string()))?;

    let input = content
        .iter()
        .find(|block| block.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .and_then(|block| block.get("input"))
        .ok_or_else(|| MatcherError::Parse("response carried no tool_use block".to_string()))?;

    let parsed: ToolMatches = serde_json::from_value(input.clone())
        .map_err(|e| MatcherError::Parse(format!("tool input did not match schema: {e}")))?;
    Ok(parsed.matches)
}

/// Boundary validation: drop assignments pointing at slots the catalogue does
/// not have, clamp confidence into [0, 1], and resolve file paths.
fn validate_matches(
    raw: Vec<RawMatch>,
    files: &[EpisodeDialogue],
    metadata: &SeriesMetadata,
) -> Vec<EpisodeMatch> {
    let paths: HashMap<&str, &PathBuf> = files
        .iter()
        .map(|f| (f.file_name.as_str(), &f.file_path))
        .collect();

    raw.into_iter()
        .filter_map(|m| {
            if !metadata.contains_slot(m.season_number, m.episode_number) {
                warn!(
                    target: "organize::matcher",
                    file = %m.file_name,
                    season = m.season_number,
                    episode = m.episode_number,
                    "dropping assignment to a slot missing from the catalogue"
                );
                return None;
            }
            let Some(file_path) = paths.get(m.file_name.as_str()) else {
                warn!(target: "organize::matcher", file = %m.file_name, "dropping assignment for unknown file");
                return None;
            };
            Some(EpisodeMatch {
                file_name: m.file_name,
                file_path: (*file_path).clone(),
                season_number: m.season_number,
                episode_number: m.episode_number,
                episode_title: m.episode_title,
                confidence: m.confidence.clamp(0.0, 1.0),
                reasoning: m.reasoning,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BilingualTitle, EpisodeMetadata, SeasonMetadata};

    fn subtitle(name: &str, content: &str) -> EpisodeDialogue {
        EpisodeDialogue {
            file_path: PathBuf::from(format!("/proc/{name}")),
            file_name: name.to_string(),
            dialogue: content.to_string(),
        }
    }

    fn metadata() -> SeriesMetadata {
        SeriesMetadata {
            seasons: vec![SeasonMetadata {
                season_number: 1,
                catalogue_id: 1,
                title: BilingualTitle::default(),
                episode_count: 12,
                episodes: vec![EpisodeMetadata {
                    number: 1,
                    title: Some("Opening".into()),
                    description: None,
                }],
            }],
        }
    }

    #[test]
    fn truncation_is_proportional_and_capped() {
        let subs = vec![
            subtitle("a.txt", &"x".repeat(600)),
            subtitle("b.txt", &"y".repeat(200)),
        ];
        let excerpts = truncate_proportionally(&subs, 400);
        assert_eq!(excerpts[0].1.len(), 300);
        assert_eq!(excerpts[1].1.len(), 100);
        let total: usize = excerpts.iter().map(|(_, t)| t.len()).sum();
        assert!(total <= 400);
    }

    #[test]
    fn truncation_is_a_noop_under_budget() {
        let subs = vec![subtitle("a.txt", "short dialogue")];
        let excerpts = truncate_proportionally(&subs, SUBTITLE_CHAR_BUDGET);
        assert_eq!(excerpts[0].1, "short dialogue");
    }

    #[test]
    fn tool_use_block_is_extracted_and_validated() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Assigning episodes."},
                {"type": "tool_use", "id": "toolu_1", "name": "record_episode_matches", "input": {
                    "matches": [
                        {"fileName": "ep01.mkv", "seasonNumber": 1, "episodeNumber": 1,
                         "episodeTitle": "Opening", "confidence": 1.4, "reasoning": "title match"},
                        {"fileName": "ep02.mkv", "seasonNumber": 9, "episodeNumber": 1,
                         "confidence": 0.9, "reasoning": "bogus season"},
                        {"fileName": "ghost.mkv", "seasonNumber": 1, "episodeNumber": 2,
                         "confidence": 0.9, "reasoning": "unknown file"}
                    ]
                }}
            ]
        });
        let raw = extract_tool_matches(&body).unwrap();
        assert_eq!(raw.len(), 3);

        let subs = vec![subtitle("ep01.mkv", "a"), subtitle("ep02.mkv", "b")];
        let matches = validate_matches(raw, &subs, &metadata());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].file_name, "ep01.mkv");
        assert!((matches[0].confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(matches[0].file_path, PathBuf::from("/proc/ep01.mkv"));
    }

    #[test]
    fn missing_tool_block_is_a_parse_error() {
        let body = serde_json::json!({"content": [{"type": "text", "text": "no tools"}]});
        assert!(matches!(
            extract_tool_matches(&body),
            Err(MatcherError::Parse(_))
        ));
    }
}
