//! AniList catalogue client.
//!
//! Speaks GraphQL over HTTP and parses at the edge: downstream code only
//! ever sees the typed DTOs. Season discovery walks PREQUEL relations to the
//! chain root and then SEQUEL relations forward, TV entries only, with a
//! visited set so relation cycles terminate.

use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::AnimeCatalogue;
use crate::error::Result;
use crate::types::BilingualTitle;

pub const ANILIST_ENDPOINT: &str = "https://graphql.anilist.co";

static STREAMING_TITLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^Episode\s+(\d+)\s*-\s*(.+)$").expect("episode title regex should compile")
});

#[derive(Debug, thiserror::Error)]
pub enum CatalogueError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnimeSearchResult {
    pub id: u64,
    pub title: BilingualTitle,
    pub episodes: Option<u32>,
    pub format: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinimalAnimeEntry {
    pub id: u64,
    pub title: BilingualTitle,
    pub episodes: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnimeEpisode {
    pub number: u32,
    pub title: Option<String>,
    pub description: Option<String>,
}

pub struct AnilistClient {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for AnilistClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AnilistClient {
    pub fn new() -> Self {
        Self::with_endpoint(ANILIST_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> std::result::Result<T, CatalogueError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let envelope: GraphQlEnvelope<T> = response.json().await?;
        if let Some(errors) = envelope.errors {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CatalogueError::Api(message));
        }
        envelope
            .data
            .ok_or_else(|| CatalogueError::Parse("response carried no data".to_string()))
    }

    async fn fetch_relations(
        &self,
        id: u64,
    ) -> std::result::Result<Option<MediaWithRelations>, CatalogueError> {
        const QUERY: &str = r#"
            query ($id: Int) {
              Media(id: $id, type: ANIME) {
                id
                format
                episodes
                title { romaji english }
                relations {
                  edges {
                    relationType
                    node { id type format episodes title { romaji english } }
                  }
                }
              }
            }
        "#;
        let data: RelationsData = self.execute(QUERY, json!({ "id": id })).await?;
        Ok(data.media)
    }
}

#[async_trait]
impl AnimeCatalogue for AnilistClient {
    async fn search_anime(&self, cleaned_name: &str) -> Result<Option<AnimeSearchResult>> {
        const QUERY: &str = r#"
            query ($search: String) {
              Media(search: $search, type: ANIME, format_in: [TV]) {
                id
                format
                episodes
                title { romaji english }
              }
            }
        "#;
        debug!(target: "organize::catalogue", search = cleaned_name, "searching catalogue");
        let data: std::result::Result<SearchData, CatalogueError> = self
            .execute(QUERY, json!({ "search": cleaned_name }))
            .await;
        match data {
            Ok(data) => Ok(data.media.map(|m| AnimeSearchResult {
                id: m.id,
                title: m.title.into(),
                episodes: m.episodes,
                format: m.format,
            })),
            // AniList reports an empty search as a NOT_FOUND error.
            Err(CatalogueError::Api(message)) if message.contains("Not Found") => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn discover_all_seasons(&self, first_id: u64) -> Result<Vec<MinimalAnimeEntry>> {
        let mut visited: HashSet<u64> = HashSet::new();

        // Walk PREQUEL edges back to the root of the relation chain.
        let mut root_id = first_id;
        loop {
            visited.insert(root_id);
            let Some(media) = self.fetch_relations(root_id).await? else {
                break;
            };
            let prequel = media
                .relations
                .edges
                .iter()
                .find(|edge| edge.is_tv_relation("PREQUEL") && !visited.contains(&edge.node.id));
            match prequel {
                Some(edge) => root_id = edge.node.id,
                None => break,
            }
        }

        // Walk SEQUEL edges forward collecting the season chain in order.
        let mut seasons = Vec::new();
        let mut cursor = Some(root_id);
        let mut seen: HashSet<u64> = HashSet::new();
        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            let Some(media) = self.fetch_relations(id).await? else {
                break;
            };
            if media.is_tv() {
                seasons.push(MinimalAnimeEntry {
                    id: media.id,
                    title: media.title.clone().into(),
                    episodes: media.episodes,
                });
            }
            cursor = media
                .relations
                .edges
                .iter()
                .find(|edge| edge.is_tv_relation("SEQUEL") && !seen.contains(&edge.node.id))
                .map(|edge| edge.node.id);
        }

        info!(
            target: "organize::catalogue",
            first_id,
            seasons = seasons.len(),
            "season chain discovered"
        );
        Ok(seasons)
    }

    async fn fetch_season_episodes(
        &self,
        id: u64,
        expected_count: u32,
    ) -> Result<Vec<AnimeEpisode>> {
        const QUERY: &str = r#"
            query ($id: Int) {
              Media(id: $id, type: ANIME) {
                id
                episodes
                streamingEpisodes { title }
              }
            }
        "#;
        let data: EpisodesData = self.execute(QUERY, json!({ "id": id })).await?;
        let media = data.media.ok_or_else(|| {
            CatalogueError::Parse(format!("media {id} vanished while fetching episodes"))
        })?;

        let count = if expected_count > 0 {
            expected_count
        } else {
            media
                .episodes
                .unwrap_or(media.streaming_episodes.len() as u32)
        };

        Ok(build_episode_list(count, &media.streaming_episodes))
    }
}

/// Dense 1..=count episode list, titles taken from streaming episodes where
/// their `Episode N - Title` convention can be parsed.
pub fn build_episode_list(count: u32, streaming: &[StreamingEpisode]) -> Vec<AnimeEpisode> {
    let mut titles = std::collections::HashMap::new();
    for entry in streaming {
        if let Some(title) = &entry.title {
            if let Some(captures) = STREAMING_TITLE_REGEX.captures(title) {
                if let Ok(number) = captures[1].parse::<u32>() {
                    titles.insert(number, captures[2].trim().to_string());
                }
            }
        }
    }
    (1..=count)
        .map(|number| AnimeEpisode {
            number,
            title: titles.get(&number).cloned(),
            description: None,
        })
        .collect()
}

// --- wire shapes -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(rename = "Media")]
    media: Option<MediaNode>,
}

#[derive(Debug, Deserialize)]
struct RelationsData {
    #[serde(rename = "Media")]
    media: Option<MediaWithRelations>,
}

#[derive(Debug, Deserialize)]
struct EpisodesData {
    #[serde(rename = "Media")]
    media: Option<MediaEpisodes>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
}

impl From<WireTitle> for BilingualTitle {
    fn from(value: WireTitle) -> Self {
        BilingualTitle {
            romaji: value.romaji,
            english: value.english,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaNode {
    id: u64,
    format: Option<String>,
    episodes: Option<u32>,
    title: WireTitle,
}

#[derive(Debug, Deserialize)]
struct MediaWithRelations {
    id: u64,
    format: Option<String>,
    episodes: Option<u32>,
    title: WireTitle,
    relations: RelationBlock,
}

impl MediaWithRelations {
    fn is_tv(&self) -> bool {
        matches!(self.format.as_deref(), Some("TV"))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RelationBlock {
    #[serde(default)]
    edges: Vec<RelationEdge>,
}

#[derive(Debug, Deserialize)]
struct RelationEdge {
    #[serde(rename = "relationType")]
    relation_type: Option<String>,
    node: RelationNode,
}

impl RelationEdge {
    fn is_tv_relation(&self, kind: &str) -> bool {
        self.relation_type.as_deref() == Some(kind)
            && self.node.media_type.as_deref() == Some("ANIME")
            && self.node.format.as_deref() == Some("TV")
    }
}

#[derive(Debug, Deserialize)]
struct RelationNode {
    id: u64,
    #[serde(rename = "type")]
    media_type: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MediaEpisodes {
    episodes: Option<u32>,
    #[serde(default, rename = "streamingEpisodes")]
    streaming_episodes: Vec<StreamingEpisode>,
}

#[derive(Debug, Deserialize)]
pub struct StreamingEpisode {
    pub title: Option<String>,
}
