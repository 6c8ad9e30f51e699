//! SQLite implementation of [`Store`].
//!
//! Migrations are embedded with `sqlx::migrate!("./migrations")`, resolved
//! relative to `CARGO_MANIFEST_DIR` at compile time, and run by
//! [`SqliteStore::connect`]. The database location itself comes from
//! `THREADWATCH_DATABASE_URL` at runtime.
//!
//! # Queries
//!
//! The runtime-verified `sqlx::query` form is used so that no
//! `DATABASE_URL` is needed at compile time.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use threadwatch_core::entity::Download;
use threadwatch_core::{Entity, EntityId, ImageRef, Kind, Status, Store, StoreError};
use threadwatch_fetch::CookieMap;

const ENTITY_COLUMNS: &str = "id, url, name, version, developer, kind, status, score, last_updated, \
     last_full_refresh, last_refresh_version, played, installed, updated, description, changelog, \
     tags, image_url, downloads, added_on";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://threadwatch.db"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

// ── row mapping ──────────────────────────────────────────────────────────────

fn corrupt(field: &str, err: impl Display) -> StoreError {
    StoreError::Corrupt {
        field: field.to_owned(),
        message: err.to_string(),
    }
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(StoreError::backend)
}

fn timestamp(field: &str, secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| corrupt(field, format!("{secs} is out of range")))
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity, StoreError> {
    let id: i64 = col(row, "id")?;
    let kind: String = col(row, "kind")?;
    let status: String = col(row, "status")?;
    let score: f64 = col(row, "score")?;
    let last_updated: Option<String> = col(row, "last_updated")?;
    let last_full_refresh: Option<i64> = col(row, "last_full_refresh")?;
    let tags: String = col(row, "tags")?;
    let image_url: String = col(row, "image_url")?;
    let downloads: String = col(row, "downloads")?;
    let added_on: i64 = col(row, "added_on")?;

    Ok(Entity {
        id: EntityId::try_from(id).map_err(|e| corrupt("id", e))?,
        url: col(row, "url")?,
        name: col(row, "name")?,
        version: col(row, "version")?,
        developer: col(row, "developer")?,
        kind: kind.parse::<Kind>().map_err(|e| corrupt("kind", e))?,
        status: status.parse::<Status>().map_err(|e| corrupt("status", e))?,
        score: score as f32,
        last_updated: last_updated
            .map(|d| d.parse::<NaiveDate>().map_err(|e| corrupt("last_updated", e)))
            .transpose()?,
        last_full_refresh: last_full_refresh
            .map(|ts| timestamp("last_full_refresh", ts))
            .transpose()?,
        last_refresh_version: col(row, "last_refresh_version")?,
        played: col(row, "played")?,
        installed: col(row, "installed")?,
        updated: col(row, "updated")?,
        description: col(row, "description")?,
        changelog: col(row, "changelog")?,
        tags: serde_json::from_str::<BTreeSet<String>>(&tags).map_err(|e| corrupt("tags", e))?,
        image_url: ImageRef::from_column(&image_url),
        downloads: serde_json::from_str::<Vec<Download>>(&downloads).map_err(|e| corrupt("downloads", e))?,
        added_on: timestamp("added_on", added_on)?,
    })
}

fn sql_id(id: EntityId) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|e| corrupt("id", e))
}

// ── Store ────────────────────────────────────────────────────────────────────

impl Store for SqliteStore {
    async fn load_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {ENTITY_COLUMNS} FROM entities ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1"))
            .bind(sql_id(id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        let tags = serde_json::to_string(&entity.tags).map_err(|e| corrupt("tags", e))?;
        let downloads = serde_json::to_string(&entity.downloads).map_err(|e| corrupt("downloads", e))?;
        sqlx::query(&format!(
            "INSERT INTO entities ({ENTITY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20) \
             ON CONFLICT(id) DO UPDATE SET \
             url = excluded.url, name = excluded.name, version = excluded.version, \
             developer = excluded.developer, kind = excluded.kind, status = excluded.status, \
             score = excluded.score, last_updated = excluded.last_updated, \
             last_full_refresh = excluded.last_full_refresh, \
             last_refresh_version = excluded.last_refresh_version, played = excluded.played, \
             installed = excluded.installed, updated = excluded.updated, \
             description = excluded.description, changelog = excluded.changelog, \
             tags = excluded.tags, image_url = excluded.image_url, downloads = excluded.downloads"
        ))
        .bind(sql_id(entity.id)?)
        .bind(&entity.url)
        .bind(&entity.name)
        .bind(&entity.version)
        .bind(&entity.developer)
        .bind(entity.kind.as_ref())
        .bind(entity.status.as_ref())
        .bind(f64::from(entity.score))
        .bind(entity.last_updated.map(|d| d.to_string()))
        .bind(entity.last_full_refresh.map(|at| at.timestamp()))
        .bind(&entity.last_refresh_version)
        .bind(entity.played)
        .bind(&entity.installed)
        .bind(entity.updated)
        .bind(&entity.description)
        .bind(&entity.changelog)
        .bind(&tags)
        .bind(entity.image_url.to_column())
        .bind(&downloads)
        .bind(entity.added_on.timestamp())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn delete_entity(&self, id: EntityId) -> Result<bool, StoreError> {
        let done = sqlx::query("DELETE FROM entities WHERE id = ?1")
            .bind(sql_id(id)?)
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(done.rows_affected() > 0)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let updated_at = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
        )
        .bind(key)
        .bind(value)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn load_cookies(&self) -> Result<CookieMap, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT name, value FROM cookies")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(rows.into_iter().collect())
    }

    async fn save_cookies(&self, cookies: &CookieMap) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        sqlx::query("DELETE FROM cookies")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        for (name, value) in cookies {
            sqlx::query("INSERT INTO cookies (name, value) VALUES (?1, ?2)")
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        }
        tx.commit().await.map_err(StoreError::backend)
    }
}
