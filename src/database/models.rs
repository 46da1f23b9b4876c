use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Fixed taxonomy of category kinds.
///
/// The kind is set when a category row is first created and is never
/// reconciled afterwards: if a later classification proposes the same slug
/// with a different kind, the existing kind wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Topic,
    Era,
    Character,
    Location,
}

impl std::fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Topic => write!(f, "topic"),
            Self::Era => write!(f, "era"),
            Self::Character => write!(f, "character"),
            Self::Location => write!(f, "location"),
        }
    }
}

impl std::str::FromStr for CategoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topic" => Ok(Self::Topic),
            "era" => Ok(Self::Era),
            "character" => Ok(Self::Character),
            "location" => Ok(Self::Location),
            other => Err(format!("unknown category kind: {}", other)),
        }
    }
}

/// An episode row. The id is the external feed id and is stable across
/// ingestion runs; re-ingesting merges fields instead of duplicating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub title: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<NaiveDateTime>,
}

/// Episode fields as mapped from one feed item, ready to upsert.
#[derive(Debug, Clone)]
pub struct NewEpisode {
    pub id: i64,
    pub title: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub kind: CategoryKind,
}

/// An episode together with its linked categories, for the read surface.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeWithCategories {
    #[serde(flatten)]
    pub episode: Episode,
    pub categories: Vec<Category>,
}

/// The ingestion watermark singleton (row id 1).
#[derive(Debug, Clone, Serialize)]
pub struct IngestionPosition {
    pub last_episode_id: Option<i64>,
    pub updated_at: Option<String>,
}
