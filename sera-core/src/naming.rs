//! Naming rules: filesystem-safe show names, Plex-style episode file names,
//! and catalogue search cleaning for ripped folder names.

use once_cell::sync::Lazy;
use regex::Regex;

static COLLAPSE_WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

static BRACKET_GROUP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]").expect("bracket regex should compile"));

static PAREN_GROUP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([^)]*\)").expect("paren regex should compile"));

static QUALITY_TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(1080p|720p|480p|2160p|4k|x264|x265|hevc|avc|flac|aac|bd|bluray|bdrip|web-dl|webrip)\b",
    )
    .expect("quality token regex should compile")
});

static SEASON_TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bS(\d{1,2})\b").expect("season token regex should compile"));

static SEASON_EPISODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)S(\d{1,3})E(\d{1,4})").expect("episode regex should compile"));

const INVALID_FS_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Collapse repeated whitespace sequences into single spaces while trimming ends.
pub fn collapse_whitespace(value: &str) -> String {
    COLLAPSE_WHITESPACE_REGEX
        .replace_all(value.trim(), " ")
        .to_string()
}

/// Strip characters that are invalid in common filesystems, then collapse
/// whitespace. Used for show names, season directories, and episode titles.
pub fn clean_show_name(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|ch| !INVALID_FS_CHARS.contains(ch))
        .collect();
    collapse_whitespace(&stripped)
}

/// `Season 01`, `Season 12`, widening naturally past two digits.
pub fn season_dir_name(season_number: u32) -> String {
    format!("Season {season_number:02}")
}

/// `<Show> - S<ss>E<ee>[ - <Title>].<ext>` with sanitized components.
pub fn plex_episode_file_name(
    show: &str,
    season_number: u32,
    episode_number: u32,
    episode_title: Option<&str>,
    extension: &str,
) -> String {
    let show = clean_show_name(show);
    let mut name = format!("{show} - S{season_number:02}E{episode_number:02}");
    if let Some(title) = episode_title {
        let title = clean_show_name(title);
        if !title.is_empty() {
            name.push_str(" - ");
            name.push_str(&title);
        }
    }
    if !extension.is_empty() {
        name.push('.');
        name.push_str(extension);
    }
    name
}

/// Recover `(season, episode)` from a Plex-style basename.
pub fn parse_season_episode(name: &str) -> Option<(u32, u32)> {
    let captures = SEASON_EPISODE_REGEX.captures(name)?;
    let season = captures[1].parse().ok()?;
    let episode = captures[2].parse().ok()?;
    Some((season, episode))
}

/// Clean a ripped folder name for a catalogue search: drop release-group
/// brackets and parenthesised qualifiers, drop quality tokens, rewrite bare
/// `S2` markers to `Season 2`, then treat `_`, `.` and `-` as separators.
pub fn clean_search_name(folder_name: &str) -> String {
    let cleaned = BRACKET_GROUP_REGEX.replace_all(folder_name, " ");
    let cleaned = PAREN_GROUP_REGEX.replace_all(&cleaned, " ");
    let cleaned = QUALITY_TOKEN_REGEX.replace_all(&cleaned, " ");
    let cleaned = SEASON_TOKEN_REGEX.replace_all(&cleaned, "Season $1");
    let cleaned = cleaned.replace(['_', '.', '-'], " ");
    collapse_whitespace(&cleaned)
}

/// File extension in lowercase, empty string when absent.
pub fn file_extension(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}
