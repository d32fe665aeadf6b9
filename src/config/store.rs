use arc_swap::ArcSwap;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::Result;

/// Boolean preference persisted per endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preference {
    Background,
    Microphone,
}

impl Preference {
    pub fn key(&self, endpoint: &str) -> String {
        match self {
            Preference::Background => format!("{}.background", endpoint),
            Preference::Microphone => format!("{}.microphone", endpoint),
        }
    }
}

/// Preference change event
#[derive(Debug, Clone)]
pub struct PreferenceChange {
    pub key: String,
    pub value: bool,
}

/// Viewer preference store backed by SQLite
///
/// Reads go through an `ArcSwap` snapshot of the whole table so the session
/// hot path never awaits the database.
#[derive(Clone)]
pub struct PreferenceStore {
    /// `None` for the in-memory store
    pool: Option<Pool<Sqlite>>,
    cache: Arc<ArcSwap<HashMap<String, bool>>>,
    change_tx: broadcast::Sender<PreferenceChange>,
}

impl PreferenceStore {
    /// Open (or create) the preference database
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;
        let values = Self::load_all(&pool).await?;

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            pool: Some(pool),
            cache: Arc::new(ArcSwap::from_pointee(values)),
            change_tx,
        })
    }

    /// Store that keeps preferences for the lifetime of the process only
    pub fn in_memory() -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            pool: None,
            cache: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            change_tx,
        }
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn load_all(pool: &Pool<Sqlite>) -> Result<HashMap<String, bool>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT key, value FROM preferences")
            .fetch_all(pool)
            .await?;

        Ok(rows.into_iter().map(|(key, value)| (key, value != 0)).collect())
    }

    /// Read a preference (lock-free). Unset preferences read as `false`.
    pub fn get(&self, endpoint: &str, pref: Preference) -> bool {
        self.cache
            .load()
            .get(&pref.key(endpoint))
            .copied()
            .unwrap_or(false)
    }

    /// Persist a preference, then publish it to readers and subscribers
    pub async fn set(&self, endpoint: &str, pref: Preference, value: bool) -> Result<()> {
        let key = pref.key(endpoint);

        if let Some(pool) = &self.pool {
            sqlx::query(
                r#"
                INSERT INTO preferences (key, value, updated_at)
                VALUES (?1, ?2, datetime('now'))
                ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')
                "#,
            )
            .bind(&key)
            .bind(value as i64)
            .execute(pool)
            .await?;
        }

        self.cache.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), value);
            next
        });

        let _ = self.change_tx.send(PreferenceChange { key, value });

        Ok(())
    }

    /// Subscribe to preference changes
    pub fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.change_tx.subscribe()
    }

    pub fn is_persistent(&self) -> bool {
        self.pool.is_some()
    }
}
