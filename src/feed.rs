//! Client for the external paginated episode feed.
//!
//! The feed is JSON, newest-first, wrapped in a `resposta` envelope. It is
//! an untrusted collaborator: any HTTP or shape problem surfaces as
//! `AppError::Feed` and aborts the current ingestion run.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppError;

/// One page of the feed, as consumed by the ingestion syncer.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub total_pages: u32,
}

/// One episode entry, field names as received from the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    #[serde(default)]
    pub titol: Option<String>,
    #[serde(default)]
    pub nom_friendly: Option<String>,
    #[serde(default)]
    pub entradeta: Option<String>,
    #[serde(default)]
    pub data_publicacio: Option<String>,
}

/// Source of feed pages; production uses HTTP, tests use in-memory fakes.
#[async_trait]
pub trait EpisodeFeed: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, AppError>;
}

pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl FeedClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl EpisodeFeed for FeedClient {
    async fn fetch_page(&self, page: u32) -> Result<FeedPage, AppError> {
        let url = format!("{}&pagina={}", self.base_url, page);
        log::info!("Fetching feed page {} from {}", page, url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Feed(format!("failed to fetch page {}: {}", page, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Feed(format!(
                "feed returned {} for page {}",
                response.status(),
                page
            )));
        }

        let body: FeedResponse = response
            .json()
            .await
            .map_err(|e| AppError::Feed(format!("failed to parse page {}: {}", page, e)))?;

        Ok(body.into_page())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    resposta: Resposta,
}

#[derive(Debug, Default, Deserialize)]
struct Resposta {
    #[serde(default)]
    items: Items,
    #[serde(default)]
    paginacio: Paginacio,
}

#[derive(Debug, Default, Deserialize)]
struct Items {
    #[serde(default)]
    item: ItemList,
}

/// The feed collapses single-element lists to a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ItemList {
    Many(Vec<FeedItem>),
    One(Box<FeedItem>),
}

impl Default for ItemList {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
struct Paginacio {
    #[serde(default)]
    total_pagines: u32,
}

impl FeedResponse {
    fn into_page(self) -> FeedPage {
        let items = match self.resposta.items.item {
            ItemList::Many(items) => items,
            ItemList::One(item) => vec![*item],
        };
        FeedPage {
            items,
            total_pages: self.resposta.paginacio.total_pagines,
        }
    }
}
