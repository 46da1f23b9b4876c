//! Classification batch runner.
//!
//! Selects unclassified episodes in bounded batches, classifies each one,
//! and links the resulting categories. Classification calls are the
//! expensive, flaky step, so failures there are isolated per episode; the
//! database writes for a batch are committed atomically.

use std::sync::Arc;

use crate::classifier::Classifier;
use crate::database::{BatchApplyOutcome, ClassifiedEpisode, Database, Episode};
use crate::error::AppError;

/// Storage surface the batch runner depends on. `Database` provides it in
/// production; tests substitute fakes to script storage failures that are
/// hard to provoke through a real SQLite file.
pub trait ClassificationStore: Send + Sync {
    fn unclassified_episodes(&self, limit: i64) -> Result<Vec<Episode>, AppError>;
    fn category_vocabulary(&self) -> Result<Vec<String>, AppError>;
    fn apply_batch(&self, batch: &[ClassifiedEpisode]) -> Result<BatchApplyOutcome, AppError>;
}

impl ClassificationStore for Database {
    fn unclassified_episodes(&self, limit: i64) -> Result<Vec<Episode>, AppError> {
        Ok(self.get_unclassified_episodes(limit)?)
    }

    fn category_vocabulary(&self) -> Result<Vec<String>, AppError> {
        Ok(self.category_names()?)
    }

    fn apply_batch(&self, batch: &[ClassifiedEpisode]) -> Result<BatchApplyOutcome, AppError> {
        Ok(self.apply_classification_batch(batch)?)
    }
}

/// Totals accumulated across all batches of one run.
#[derive(Debug, Clone, Default)]
pub struct ClassifyReport {
    /// Episodes pulled from the unclassified query.
    pub processed: usize,
    /// Episodes whose categories were resolved, linked, and committed.
    pub successful: usize,
    /// Classifier errors plus per-episode apply failures plus whole
    /// batches lost to a failed commit.
    pub failed: usize,
    /// Episodes where the model replied but nothing was parseable; they
    /// stay unclassified and are picked up by a future run.
    pub unparsed: usize,
}

pub struct ClassificationRunner {
    db: Arc<dyn ClassificationStore>,
    classifier: Arc<dyn Classifier>,
}

impl ClassificationRunner {
    pub fn new(db: Arc<dyn ClassificationStore>, classifier: Arc<dyn Classifier>) -> Self {
        Self { db, classifier }
    }

    /// Classify up to `max_total` episodes (all of them when None), in
    /// batches of `batch_size`.
    pub async fn run(
        &self,
        batch_size: usize,
        max_total: Option<usize>,
    ) -> Result<ClassifyReport, AppError> {
        log::info!(
            "Starting classification run: batch_size={}, max_total={:?}",
            batch_size,
            max_total
        );

        let mut report = ClassifyReport::default();

        loop {
            let remaining = max_total.map(|m| m.saturating_sub(report.processed));
            if remaining == Some(0) {
                log::info!("Reached max_total budget");
                break;
            }
            let current_batch_size = remaining.map_or(batch_size, |r| batch_size.min(r));

            let unclassified = self.db.unclassified_episodes(current_batch_size as i64)?;
            if unclassified.is_empty() {
                log::info!("No more episodes to classify");
                break;
            }

            log::info!("Processing batch of {} episodes", unclassified.len());

            // Snapshot of the vocabulary, refreshed per batch so later
            // batches see categories committed by earlier ones.
            let vocabulary = self.db.category_vocabulary()?;

            let mut batch: Vec<ClassifiedEpisode> = Vec::new();
            let mut batch_failed = 0usize;
            let mut batch_unparsed = 0usize;

            for episode in &unclassified {
                log::info!("Classifying episode {}: {}", episode.id, episode.title);

                match self.classifier.classify(episode, &vocabulary).await {
                    // A valid reply with zero categories links nothing and
                    // would be re-selected forever; treat it as unparsed.
                    Ok(Some(classification)) if !classification.is_empty() => {
                        batch.push(ClassifiedEpisode {
                            episode_id: episode.id,
                            categories: classification.categories,
                        });
                    }
                    Ok(Some(_)) => {
                        batch_unparsed += 1;
                    }
                    Ok(None) => {
                        // Expected outcome, not an error; no linkage.
                        batch_unparsed += 1;
                    }
                    Err(e) => {
                        log::error!("Failed to classify episode {}: {}", episode.id, e);
                        batch_failed += 1;
                    }
                }
            }

            let batch_successful;
            match self.db.apply_batch(&batch) {
                Ok(outcome) => {
                    batch_successful = outcome.applied;
                    batch_failed += outcome.failed_episode_ids.len();
                    log::info!(
                        "Committed batch: {} successful ({} links), {} failed, {} unparseable",
                        batch_successful,
                        outcome.links_created,
                        batch_failed,
                        batch_unparsed
                    );
                }
                Err(e) => {
                    // The batch is all-or-nothing at commit time.
                    log::error!("Failed to commit batch: {}", e);
                    batch_successful = 0;
                    batch_failed = unclassified.len();
                    batch_unparsed = 0;
                }
            }

            report.processed += unclassified.len();
            report.successful += batch_successful;
            report.failed += batch_failed;
            report.unparsed += batch_unparsed;

            log::info!(
                "Progress: {} processed, {} successful, {} failed, {} unparseable",
                report.processed,
                report.successful,
                report.failed,
                report.unparsed
            );

            // The unclassified query re-evaluates current state, so a batch
            // that linked nothing would be re-selected verbatim next loop.
            if batch_successful == 0 {
                log::warn!("Batch made no progress; stopping run");
                break;
            }

            if unclassified.len() < current_batch_size {
                break;
            }
        }

        log::info!(
            "Classification complete: {} successful, {} failed, {} unparseable, {} total",
            report.successful,
            report.failed,
            report.unparsed,
            report.processed
        );

        Ok(report)
    }
}
