//! Incremental feed ingestion.
//!
//! Walks the paginated feed newest-first, stops at the last known episode
//! id (the watermark), and commits all upserts plus the watermark advance
//! in a single transaction. Initial bulk backfill and later incremental
//! syncs are the same algorithm; only the number of scanned pages differs.

use chrono::NaiveDateTime;
use std::sync::Arc;

use crate::database::{Database, NewEpisode};
use crate::error::AppError;
use crate::feed::{EpisodeFeed, FeedItem};

/// Feed date format: `DD/MM/YYYY HH:MM:SS`.
const FEED_DATE_FMT: &str = "%d/%m/%Y %H:%M:%S";

/// Summary of one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub pages_fetched: u32,
    pub ingested: usize,
    /// Watermark after the run (unchanged when nothing new was seen).
    pub watermark: Option<i64>,
    /// True when the run stopped because it hit the prior watermark.
    pub caught_up: bool,
}

pub struct IngestionSyncer {
    db: Arc<Database>,
    feed: Arc<dyn EpisodeFeed>,
}

impl IngestionSyncer {
    pub fn new(db: Arc<Database>, feed: Arc<dyn EpisodeFeed>) -> Self {
        Self { db, feed }
    }

    /// Run one ingestion pass.
    ///
    /// Any fetch or parse failure aborts the whole run before anything is
    /// committed; retry policy belongs to the external scheduler.
    pub async fn run(&self) -> Result<IngestReport, AppError> {
        log::info!("Starting episode ingestion run");

        let known_last_id = self.db.ingestion_position()?.last_episode_id;
        let mut newest_id_this_run: Option<i64> = None;
        let mut episodes: Vec<NewEpisode> = Vec::new();
        let mut caught_up = false;
        let mut pages_fetched = 0u32;
        let mut page = 1u32;

        loop {
            let feed_page = self.feed.fetch_page(page).await?;
            pages_fetched += 1;

            if feed_page.items.is_empty() {
                log::info!("No more items found on page {}", page);
                break;
            }

            // Items arrive newest-first; the very first id of the run is
            // the candidate new watermark.
            for item in &feed_page.items {
                if newest_id_this_run.is_none() {
                    newest_id_this_run = Some(item.id);
                }
                if Some(item.id) == known_last_id {
                    caught_up = true;
                    break;
                }
                episodes.push(map_feed_item(item));
            }

            if caught_up {
                log::info!(
                    "Found last known episode {:?}; ingestion is up to date",
                    known_last_id
                );
                break;
            }

            // Page-count drift while items are being added mid-scan is an
            // accepted approximation; the count is not re-checked.
            if page >= feed_page.total_pages {
                log::info!("Reached the final page ({}) of the feed", page);
                break;
            }
            page += 1;
        }

        let ingested = self.db.commit_ingestion(&episodes, newest_id_this_run)?;

        let watermark = match newest_id_this_run {
            Some(newest) => Some(newest),
            None => known_last_id,
        };

        if ingested > 0 {
            log::info!(
                "Ingested {} episodes across {} pages; watermark now {:?}",
                ingested,
                pages_fetched,
                watermark
            );
        } else {
            log::info!("No new episodes were ingested");
        }

        Ok(IngestReport {
            pages_fetched,
            ingested,
            watermark,
            caught_up,
        })
    }
}

fn map_feed_item(item: &FeedItem) -> NewEpisode {
    NewEpisode {
        id: item.id,
        title: item.titol.clone().unwrap_or_default(),
        slug: item.nom_friendly.clone(),
        description: item.entradeta.clone(),
        published_at: item
            .data_publicacio
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, FEED_DATE_FMT).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedPage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn setup_test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (Arc::new(db), temp_dir)
    }

    fn item(id: i64) -> FeedItem {
        FeedItem {
            id,
            titol: Some(format!("Episodi {}", id)),
            nom_friendly: Some(format!("episodi-{}", id)),
            entradeta: Some(format!("Descripció de l'episodi {}", id)),
            data_publicacio: Some(format!("{:02}/01/2020 06:00:00", id.min(28))),
        }
    }

    fn page(ids: &[i64], total_pages: u32) -> FeedPage {
        FeedPage {
            items: ids.iter().copied().map(item).collect(),
            total_pages,
        }
    }

    struct FakeFeed {
        pages: Vec<FeedPage>,
        calls: Mutex<u32>,
    }

    impl FakeFeed {
        fn new(pages: Vec<FeedPage>) -> Self {
            Self {
                pages,
                calls: Mutex::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl EpisodeFeed for FakeFeed {
        async fn fetch_page(&self, page: u32) -> Result<FeedPage, AppError> {
            *self.calls.lock().unwrap() += 1;
            self.pages
                .get((page - 1) as usize)
                .cloned()
                .ok_or_else(|| AppError::Feed(format!("no such page: {}", page)))
        }
    }

    /// Feed that fails on a given page, to test run aborts.
    struct FailingFeed {
        good_first_page: FeedPage,
        fail_from: u32,
    }

    #[async_trait]
    impl EpisodeFeed for FailingFeed {
        async fn fetch_page(&self, page: u32) -> Result<FeedPage, AppError> {
            if page >= self.fail_from {
                Err(AppError::Feed("connection reset".to_string()))
            } else {
                Ok(self.good_first_page.clone())
            }
        }
    }

    #[tokio::test]
    async fn test_initial_backfill_sets_watermark_to_newest() {
        let (db, _temp) = setup_test_db();
        let feed = Arc::new(FakeFeed::new(vec![page(&[3, 2, 1], 1)]));
        let syncer = IngestionSyncer::new(db.clone(), feed);

        let report = syncer.run().await.unwrap();

        assert_eq!(report.ingested, 3);
        assert_eq!(report.watermark, Some(3));
        assert!(!report.caught_up);
        assert_eq!(db.ingestion_position().unwrap().last_episode_id, Some(3));
        assert!(db.get_episode_by_id(1).unwrap().is_some());
        assert!(db.get_episode_by_id(3).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incremental_run_writes_only_ids_newer_than_watermark() {
        let (db, _temp) = setup_test_db();

        let first = IngestionSyncer::new(
            db.clone(),
            Arc::new(FakeFeed::new(vec![page(&[3, 2, 1], 1)])),
        );
        first.run().await.unwrap();

        let second = IngestionSyncer::new(
            db.clone(),
            Arc::new(FakeFeed::new(vec![page(&[5, 4, 3, 2, 1], 1)])),
        );
        let report = second.run().await.unwrap();

        assert_eq!(report.ingested, 2);
        assert_eq!(report.watermark, Some(5));
        assert!(report.caught_up);
        assert_eq!(db.ingestion_position().unwrap().last_episode_id, Some(5));

        let (all, total) = db.get_episodes(None, true, &[], 50, 0).unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_noop_when_newest_equals_watermark() {
        let (db, _temp) = setup_test_db();

        IngestionSyncer::new(
            db.clone(),
            Arc::new(FakeFeed::new(vec![page(&[3, 2, 1], 1)])),
        )
        .run()
        .await
        .unwrap();
        let before = db.ingestion_position().unwrap();

        let feed = Arc::new(FakeFeed::new(vec![page(&[3, 2, 1], 1)]));
        let report = IngestionSyncer::new(db.clone(), feed.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.ingested, 0);
        assert!(report.caught_up);
        assert_eq!(feed.call_count(), 1);

        let after = db.ingestion_position().unwrap();
        assert_eq!(after.last_episode_id, Some(3));
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_pagination_traverses_every_page_exactly_once() {
        let (db, _temp) = setup_test_db();
        let feed = Arc::new(FakeFeed::new(vec![
            page(&[30], 3),
            page(&[20], 3),
            page(&[10], 3),
        ]));
        let syncer = IngestionSyncer::new(db.clone(), feed.clone());

        let report = syncer.run().await.unwrap();

        assert_eq!(feed.call_count(), 3);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.ingested, 3);
        assert_eq!(report.watermark, Some(30));
    }

    #[tokio::test]
    async fn test_empty_feed_terminates_without_watermark() {
        let (db, _temp) = setup_test_db();
        let feed = Arc::new(FakeFeed::new(vec![page(&[], 0)]));

        let report = IngestionSyncer::new(db.clone(), feed).run().await.unwrap();

        assert_eq!(report.ingested, 0);
        assert_eq!(report.watermark, None);
        assert_eq!(db.ingestion_position().unwrap().last_episode_id, None);
    }

    #[tokio::test]
    async fn test_fetch_failure_aborts_run_without_side_effects() {
        let (db, _temp) = setup_test_db();
        let feed = Arc::new(FailingFeed {
            good_first_page: page(&[3, 2, 1], 2),
            fail_from: 2,
        });

        let result = IngestionSyncer::new(db.clone(), feed).run().await;

        assert!(matches!(result, Err(AppError::Feed(_))));
        // Nothing committed: no episodes, no watermark advance.
        let (_, total) = db.get_episodes(None, true, &[], 50, 0).unwrap();
        assert_eq!(total, 0);
        assert_eq!(db.ingestion_position().unwrap().last_episode_id, None);
    }

    #[test]
    fn test_map_feed_item_parses_feed_date() {
        let episode = map_feed_item(&item(9));
        assert_eq!(episode.id, 9);
        assert_eq!(episode.title, "Episodi 9");
        assert_eq!(
            episode.published_at.unwrap().format("%Y-%m-%d %H:%M:%S").to_string(),
            "2020-01-09 06:00:00"
        );

        let bad_date = FeedItem {
            data_publicacio: Some("not a date".to_string()),
            ..item(9)
        };
        assert!(map_feed_item(&bad_date).published_at.is_none());
    }
}
