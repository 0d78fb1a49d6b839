use thiserror::Error;

use crate::activities::catalogue::CatalogueError;
use crate::activities::matcher::MatcherError;

#[derive(Error, Debug)]
pub enum OrganizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("catalogue error: {0}")]
    Catalogue(#[from] CatalogueError),

    #[error("matcher error: {0}")]
    Matcher(#[from] MatcherError),

    #[error("subtitle extraction error: {0}")]
    Subtitles(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("activity {0} timed out")]
    ActivityTimeout(String),

    #[error("activity {activity} failed after {attempts} attempts: {last_error}")]
    ActivityExhausted {
        activity: String,
        attempts: u32,
        last_error: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrganizeError>;
