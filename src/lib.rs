//! Catalog service for the episode archive of a history radio programme.
//!
//! Two pipelines keep the local SQLite catalog current:
//!
//! * ingestion walks the public paginated feed newest-first, stopping at a
//!   persisted watermark, and commits new episodes atomically
//!   ([`ingest::IngestionSyncer`]);
//! * classification asks an OpenAI-compatible model to tag unclassified
//!   episodes with topic/era/character/location categories, deduplicated by
//!   normalized slug ([`classify::ClassificationRunner`]).

pub mod classifier;
pub mod classify;
pub mod config;
pub mod database;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod slug;

pub use error::AppError;
