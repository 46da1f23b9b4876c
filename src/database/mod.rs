pub mod models;


use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::slug;

pub use models::*;

/// Text format used to store `published_at`; sorts chronologically as text.
const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Episodes keyed by the external feed id (never regenerated)
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                slug TEXT,
                description TEXT,
                published_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_published
                ON episodes(published_at DESC);
            CREATE INDEX IF NOT EXISTS idx_episodes_title ON episodes(title);

            -- Categories deduplicated by normalized slug; kind is one of
            -- 'topic', 'era', 'character', 'location' and never changes.
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_categories_kind ON categories(kind);
            CREATE INDEX IF NOT EXISTS idx_categories_name ON categories(name);

            CREATE TABLE IF NOT EXISTS episode_categories (
                episode_id INTEGER NOT NULL,
                category_id INTEGER NOT NULL,
                PRIMARY KEY (episode_id, category_id),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_episode_categories_category
                ON episode_categories(category_id);

            -- Ingestion watermark singleton (fixed id 1)
            CREATE TABLE IF NOT EXISTS ingestion_position (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_episode_id INTEGER,
                updated_at TEXT
            );
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    /// Insert a new episode or merge fields into the existing row (by id).
    /// Returns true when the row was newly created.
    pub fn upsert_episode(&self, episode: &NewEpisode) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        upsert_episode_on(&conn, episode)
    }

    pub fn get_episode_by_id(&self, id: i64) -> Result<Option<EpisodeWithCategories>> {
        let conn = self.conn.lock().unwrap();

        let episode = conn
            .query_row(
                "SELECT id, title, slug, description, published_at
                 FROM episodes WHERE id = ?",
                params![id],
                map_episode_row,
            )
            .optional()?;

        match episode {
            Some(episode) => {
                let categories = categories_for_episode(&conn, episode.id)?;
                Ok(Some(EpisodeWithCategories {
                    episode,
                    categories,
                }))
            }
            None => Ok(None),
        }
    }

    /// Paginated episode listing: optional title search, publication-date
    /// order, optional category-id filter. Returns (page, total count).
    pub fn get_episodes(
        &self,
        search: Option<&str>,
        order_desc: bool,
        category_ids: &[i64],
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<EpisodeWithCategories>, i64)> {
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        if let Some(search_term) = search {
            let search_term = search_term.trim();
            if !search_term.is_empty() {
                conditions.push(format!(
                    "title LIKE '%{}%'",
                    search_term.replace('\'', "''")
                ));
            }
        }
        if !category_ids.is_empty() {
            let ids = category_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            conditions.push(format!(
                "id IN (SELECT episode_id FROM episode_categories WHERE category_id IN ({}))",
                ids
            ));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sort_direction = if order_desc { "DESC" } else { "ASC" };

        let count_sql = format!("SELECT COUNT(*) FROM episodes {}", where_clause);
        let total: i64 = conn.query_row(&count_sql, [], |row| row.get(0))?;

        let sql = format!(
            "SELECT id, title, slug, description, published_at
             FROM episodes {}
             ORDER BY published_at {}
             LIMIT ? OFFSET ?",
            where_clause, sort_direction
        );

        let mut stmt = conn.prepare(&sql)?;
        let episodes = stmt
            .query_map(params![limit, offset], map_episode_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(episodes.len());
        for episode in episodes {
            let categories = categories_for_episode(&conn, episode.id)?;
            out.push(EpisodeWithCategories {
                episode,
                categories,
            });
        }

        Ok((out, total))
    }

    /// Episodes eligible for classification: non-empty description, zero
    /// linked categories, newest-published first. A fresh snapshot per
    /// call; episodes linked since the last call drop out naturally.
    pub fn get_unclassified_episodes(&self, limit: i64) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, slug, description, published_at
             FROM episodes
             WHERE description IS NOT NULL AND TRIM(description) != ''
               AND id NOT IN (SELECT episode_id FROM episode_categories)
             ORDER BY published_at DESC
             LIMIT ?",
        )?;

        let episodes = stmt
            .query_map(params![limit], map_episode_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(episodes)
    }

    /// Idempotent link insert; no-op when the pair already exists.
    pub fn link_episode_to_category(&self, episode_id: i64, category_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        link_on(&conn, episode_id, category_id)?;
        Ok(())
    }

    // =========================================================================
    // Category queries
    // =========================================================================

    /// Resolve a category by normalized slug, creating it on first
    /// reference. First writer wins for both display name and kind.
    pub fn get_or_create_category(&self, name: &str, kind: CategoryKind) -> Result<Category> {
        let conn = self.conn.lock().unwrap();
        get_or_create_category_on(&conn, name, kind)
    }

    pub fn get_categories(
        &self,
        kind: Option<CategoryKind>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Category>, i64)> {
        let conn = self.conn.lock().unwrap();

        let where_clause = match kind {
            Some(k) => format!("WHERE kind = '{}'", k),
            None => String::new(),
        };

        let count_sql = format!("SELECT COUNT(*) FROM categories {}", where_clause);
        let total: i64 = conn.query_row(&count_sql, [], |row| row.get(0))?;

        let sql = format!(
            "SELECT id, slug, name, kind FROM categories {}
             ORDER BY name ASC LIMIT ? OFFSET ?",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let categories = stmt
            .query_map(params![limit, offset], map_category_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((categories, total))
    }

    /// The full current vocabulary of category names, used to bias the
    /// classifier toward reusing existing categories.
    pub fn category_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM categories ORDER BY name ASC")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // =========================================================================
    // Ingestion watermark
    // =========================================================================

    pub fn ingestion_position(&self) -> Result<IngestionPosition> {
        let conn = self.conn.lock().unwrap();
        let position = conn
            .query_row(
                "SELECT last_episode_id, updated_at FROM ingestion_position WHERE id = 1",
                [],
                |row| {
                    Ok(IngestionPosition {
                        last_episode_id: row.get(0)?,
                        updated_at: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(position.unwrap_or(IngestionPosition {
            last_episode_id: None,
            updated_at: None,
        }))
    }

    /// Commit one ingestion run atomically: every accumulated upsert plus
    /// the watermark advance land in a single transaction, so an aborted
    /// run never leaves a watermark pointing past unwritten episodes.
    ///
    /// The watermark is only touched when `newest_id` was observed and
    /// differs from the stored value.
    pub fn commit_ingestion(
        &self,
        episodes: &[NewEpisode],
        newest_id: Option<i64>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut ingested = 0;
        for episode in episodes {
            upsert_episode_on(&tx, episode)?;
            ingested += 1;
        }

        if let Some(newest) = newest_id {
            let prior: Option<i64> = tx
                .query_row(
                    "SELECT last_episode_id FROM ingestion_position WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();

            if prior != Some(newest) {
                tx.execute(
                    "INSERT INTO ingestion_position (id, last_episode_id, updated_at)
                     VALUES (1, ?1, datetime('now'))
                     ON CONFLICT(id) DO UPDATE SET
                        last_episode_id = excluded.last_episode_id,
                        updated_at = excluded.updated_at",
                    params![newest],
                )?;
            }
        }

        tx.commit()?;
        Ok(ingested)
    }

    // =========================================================================
    // Classification batch commit
    // =========================================================================

    /// Apply one batch of classifications in a single transaction.
    ///
    /// Each episode gets its own savepoint: a failure while resolving or
    /// linking one episode's categories rolls back that episode only and
    /// the batch continues. The outer commit is all-or-nothing: if it
    /// fails, the caller counts the whole batch as failed.
    pub fn apply_classification_batch(
        &self,
        batch: &[ClassifiedEpisode],
    ) -> Result<BatchApplyOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let mut tx = conn.transaction()?;

        let mut outcome = BatchApplyOutcome::default();

        for item in batch {
            let sp = tx.savepoint()?;
            match apply_one_classification(&sp, item) {
                Ok(linked) => {
                    sp.commit()?;
                    outcome.applied += 1;
                    outcome.links_created += linked;
                }
                Err(e) => {
                    // Savepoint rolls back on drop; this episode is skipped.
                    log::error!(
                        "Failed to apply categories for episode {}: {}",
                        item.episode_id,
                        e
                    );
                    drop(sp);
                    outcome.failed_episode_ids.push(item.episode_id);
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }
}

/// One episode's resolved classification, ready to persist.
#[derive(Debug, Clone)]
pub struct ClassifiedEpisode {
    pub episode_id: i64,
    /// (kind, display name) pairs as proposed by the classifier.
    pub categories: Vec<(CategoryKind, String)>,
}

#[derive(Debug, Default)]
pub struct BatchApplyOutcome {
    pub applied: usize,
    pub links_created: usize,
    pub failed_episode_ids: Vec<i64>,
}

// =============================================================================
// Connection-level helpers, shared by plain calls and transactions
// =============================================================================

fn apply_one_classification(conn: &Connection, item: &ClassifiedEpisode) -> Result<usize> {
    let mut linked = 0;
    for (kind, name) in &item.categories {
        let category = get_or_create_category_on(conn, name, *kind)?;
        if link_on(conn, item.episode_id, category.id)? {
            linked += 1;
        }
    }
    Ok(linked)
}

fn upsert_episode_on(conn: &Connection, episode: &NewEpisode) -> Result<bool> {
    let published_at = episode
        .published_at
        .map(|dt| dt.format(DATETIME_FMT).to_string());

    let existed: bool = conn
        .query_row(
            "SELECT 1 FROM episodes WHERE id = ?",
            params![episode.id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    conn.execute(
        "INSERT INTO episodes (id, title, slug, description, published_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            slug = excluded.slug,
            description = excluded.description,
            published_at = excluded.published_at",
        params![
            episode.id,
            episode.title,
            episode.slug,
            episode.description,
            published_at
        ],
    )?;

    Ok(!existed)
}

fn get_or_create_category_on(
    conn: &Connection,
    name: &str,
    kind: CategoryKind,
) -> Result<Category> {
    let slug = slug::normalize(name);
    if slug.is_empty() {
        anyhow::bail!("category name {:?} normalizes to an empty slug", name);
    }

    if let Some(category) = find_category_by_slug(conn, &slug)? {
        return Ok(category);
    }

    // INSERT OR IGNORE keeps a concurrent creator from surfacing a
    // constraint error; the re-select below returns the winning row.
    conn.execute(
        "INSERT OR IGNORE INTO categories (slug, name, kind) VALUES (?1, ?2, ?3)",
        params![slug, name.trim(), kind.to_string()],
    )?;

    find_category_by_slug(conn, &slug)?
        .with_context(|| format!("category '{}' missing after insert", slug))
}

fn find_category_by_slug(conn: &Connection, slug: &str) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            "SELECT id, slug, name, kind FROM categories WHERE slug = ?",
            params![slug],
            map_category_row,
        )
        .optional()?;
    Ok(category)
}

/// Returns true when a new link row was inserted.
fn link_on(conn: &Connection, episode_id: i64, category_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO episode_categories (episode_id, category_id) VALUES (?1, ?2)",
        params![episode_id, category_id],
    )?;
    Ok(changed > 0)
}

fn categories_for_episode(conn: &Connection, episode_id: i64) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.slug, c.name, c.kind
         FROM categories c
         JOIN episode_categories ec ON ec.category_id = c.id
         WHERE ec.episode_id = ?
         ORDER BY c.name ASC",
    )?;
    let categories = stmt
        .query_map(params![episode_id], map_category_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(categories)
}

fn map_episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let published_at: Option<String> = row.get(4)?;
    Ok(Episode {
        id: row.get(0)?,
        title: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        published_at: published_at
            .and_then(|s| chrono::NaiveDateTime::parse_from_str(&s, DATETIME_FMT).ok()),
    })
}

fn map_category_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    let kind: String = row.get(3)?;
    Ok(Category {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        // Unknown kinds in storage would be a programming error; fall back
        // to topic rather than poisoning reads.
        kind: kind.parse().unwrap_or(CategoryKind::Topic),
    })
}
