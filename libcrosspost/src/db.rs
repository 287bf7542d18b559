//! Database operations for Crosspost
//!
//! All durable state lives in one SQLite database: posts, connections,
//! per-platform publish records, the job log timeline, webhook events and
//! (when the sqlite backend is selected) the publish queue itself.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{CrosspostError, DbError, Result};
use crate::types::{
    Connection, JobLog, LogLevel, MediaKind, MediaRef, Post, PostStatus, Provider, PublishRecord,
    WebhookEvent, WebhookEventStatus, WebhookEventType,
};

const POST_COLUMNS: &str = "id, owner_id, caption, media_type, media_url, scheduled_at, status, \
     platforms, preflight_issues, job_id, external_id, external_url, options, version, \
     created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database file and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // mode=rwc creates the file; forward slashes keep the URL valid on Windows
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Non-durable database for tests and single-process demos.
    ///
    /// A single connection keeps the in-memory database alive for as long as
    /// this handle (or a clone) exists.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations against it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- posts ----------------------------------------------------------

    /// Insert a new post. The post's version is stored as given.
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let (media_type, media_url) = split_media(&post.media);

        sqlx::query(
            r#"
            INSERT INTO posts (id, owner_id, caption, media_type, media_url, scheduled_at, status,
                               platforms, preflight_issues, job_id, external_id, external_url,
                               options, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.owner_id)
        .bind(&post.caption)
        .bind(media_type)
        .bind(media_url)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(serde_json::to_string(&post.platforms).map_err(DbError::Json)?)
        .bind(encode_issues(post)?)
        .bind(&post.job_id)
        .bind(&post.external_id)
        .bind(&post.external_url)
        .bind(serde_json::to_string(&post.options).map_err(DbError::Json)?)
        .bind(post.version)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Persist every mutable field of `post`, guarded by its version.
    ///
    /// On success the in-memory post gets the bumped version and new
    /// `updated_at`. If another writer got there first the call fails with
    /// [`DbError::StaleWrite`] and nothing is written.
    pub async fn update_post(&self, post: &mut Post) -> Result<()> {
        let (media_type, media_url) = split_media(&post.media);
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE posts
            SET caption = ?, media_type = ?, media_url = ?, scheduled_at = ?, status = ?,
                platforms = ?, preflight_issues = ?, job_id = ?, external_id = ?,
                external_url = ?, options = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&post.caption)
        .bind(media_type)
        .bind(media_url)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(serde_json::to_string(&post.platforms).map_err(DbError::Json)?)
        .bind(encode_issues(post)?)
        .bind(&post.job_id)
        .bind(&post.external_id)
        .bind(&post.external_url)
        .bind(serde_json::to_string(&post.options).map_err(DbError::Json)?)
        .bind(now)
        .bind(&post.id)
        .bind(post.version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return match self.get_post(&post.id).await? {
                Some(_) => Err(DbError::StaleWrite(post.id.clone()).into()),
                None => Err(CrosspostError::NotFound(format!("post {}", post.id))),
            };
        }

        post.version += 1;
        post.updated_at = now;
        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let sql = format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.map(|r| post_from_row(&r)).transpose()
    }

    /// Like [`get_post`](Self::get_post) but missing posts are an error
    pub async fn require_post(&self, post_id: &str) -> Result<Post> {
        self.get_post(post_id)
            .await?
            .ok_or_else(|| CrosspostError::NotFound(format!("post {}", post_id)))
    }

    /// Posts newest first, optionally filtered by owner and status
    pub async fn list_posts(
        &self,
        owner_id: Option<&str>,
        status: Option<PostStatus>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let mut where_clauses = vec!["1=1"];
        if owner_id.is_some() {
            where_clauses.push("owner_id = ?");
        }
        if status.is_some() {
            where_clauses.push("status = ?");
        }

        let sql = format!(
            "SELECT {} FROM posts WHERE {} ORDER BY created_at DESC, id LIMIT ?",
            POST_COLUMNS,
            where_clauses.join(" AND ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(owner) = owner_id {
            query = query.bind(owner);
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// `scheduled` posts that never reached the queue, oldest target first
    pub async fn posts_awaiting_enqueue(&self, limit: usize) -> Result<Vec<Post>> {
        let sql = format!(
            "SELECT {} FROM posts WHERE status = 'scheduled' AND job_id IS NULL \
             ORDER BY scheduled_at ASC LIMIT ?",
            POST_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(post_from_row).collect()
    }

    /// Resolve a platform-side identifier back to our post id
    pub async fn find_post_by_external_id(&self, external_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT post_id AS id FROM publish_records WHERE external_id = ?
            UNION
            SELECT id FROM posts WHERE external_id = ?
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("id")))
    }

    pub async fn post_exists(&self, post_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(row.is_some())
    }

    // ---- connections ----------------------------------------------------

    /// Insert or replace the connection for (owner, provider)
    pub async fn upsert_connection(&self, connection: &Connection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connections (id, owner_id, provider, access_token, refresh_token,
                                     token_type, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                token_type = excluded.token_type,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.owner_id)
        .bind(connection.provider.as_str())
        .bind(&connection.access_token)
        .bind(&connection.refresh_token)
        .bind(&connection.token_type)
        .bind(connection.expires_at)
        .bind(connection.created_at)
        .bind(connection.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_connection(
        &self,
        owner_id: &str,
        provider: Provider,
    ) -> Result<Option<Connection>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, provider, access_token, refresh_token, token_type,
                   expires_at, created_at, updated_at
            FROM connections WHERE owner_id = ? AND provider = ?
            "#,
        )
        .bind(owner_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| connection_from_row(&r)).transpose()
    }

    /// Connections for one owner, or every stored connection when `owner_id` is None
    pub async fn list_connections(&self, owner_id: Option<&str>) -> Result<Vec<Connection>> {
        let rows = match owner_id {
            Some(owner) => sqlx::query(
                r#"
                SELECT id, owner_id, provider, access_token, refresh_token, token_type,
                       expires_at, created_at, updated_at
                FROM connections WHERE owner_id = ? ORDER BY provider
                "#,
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                SELECT id, owner_id, provider, access_token, refresh_token, token_type,
                       expires_at, created_at, updated_at
                FROM connections ORDER BY owner_id, provider
                "#,
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(connection_from_row).collect()
    }

    /// Replace the sealed token columns of one connection
    pub async fn update_connection_tokens(
        &self,
        connection_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connections
            SET access_token = ?, refresh_token = ?, expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(chrono::Utc::now().timestamp())
        .bind(connection_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Returns true when a connection was removed
    pub async fn delete_connection(&self, owner_id: &str, provider: Provider) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connections WHERE owner_id = ? AND provider = ?")
            .bind(owner_id)
            .bind(provider.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ---- publish records ------------------------------------------------

    pub async fn create_publish_record(&self, record: &PublishRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_records (post_id, provider, external_id, external_url, published_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(post_id, provider) DO NOTHING
            "#,
        )
        .bind(&record.post_id)
        .bind(record.provider.as_str())
        .bind(&record.external_id)
        .bind(&record.external_url)
        .bind(record.published_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_publish_records(&self, post_id: &str) -> Result<Vec<PublishRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, provider, external_id, external_url, published_at
            FROM publish_records WHERE post_id = ? ORDER BY id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(PublishRecord {
                    id: Some(r.get("id")),
                    post_id: r.get("post_id"),
                    provider: Provider::from_str(&r.get::<String, _>("provider"))?,
                    external_id: r.get("external_id"),
                    external_url: r.get("external_url"),
                    published_at: r.get("published_at"),
                })
            })
            .collect()
    }

    /// Forget earlier deliveries so a new publish cycle starts clean
    pub async fn clear_publish_records(&self, post_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM publish_records WHERE post_id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    // ---- job logs -------------------------------------------------------

    pub async fn append_log(&self, log: &JobLog) -> Result<i64> {
        let raw = log
            .raw
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(DbError::Json)?;

        let result = sqlx::query(
            r#"
            INSERT INTO job_logs (post_id, level, message, raw, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.post_id)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(raw)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    /// The post's timeline, oldest entry first
    pub async fn get_logs(&self, post_id: &str) -> Result<Vec<JobLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, level, message, raw, created_at
            FROM job_logs WHERE post_id = ? ORDER BY id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(log_from_row).collect()
    }

    pub async fn last_log_at_level(&self, post_id: &str, level: LogLevel) -> Result<Option<JobLog>> {
        let row = sqlx::query(
            r#"
            SELECT id, post_id, level, message, raw, created_at
            FROM job_logs WHERE post_id = ? AND level = ? ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(post_id)
        .bind(level.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|r| log_from_row(&r)).transpose()
    }

    // ---- webhook events -------------------------------------------------

    pub async fn create_webhook_event(&self, event: &WebhookEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events (platform, event_type, payload, signature, status,
                                        post_id, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.platform.as_str())
        .bind(event.event_type.as_str())
        .bind(serde_json::to_string(&event.payload).map_err(DbError::Json)?)
        .bind(&event.signature)
        .bind(event.status.as_str())
        .bind(&event.post_id)
        .bind(&event.error_message)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent events first, optionally for a single platform
    pub async fn list_webhook_events(
        &self,
        platform: Option<Provider>,
        limit: usize,
    ) -> Result<Vec<WebhookEvent>> {
        let rows = match platform {
            Some(p) => sqlx::query(
                r#"
                SELECT id, platform, event_type, payload, signature, status, post_id,
                       error_message, created_at
                FROM webhook_events WHERE platform = ? ORDER BY id DESC LIMIT ?
                "#,
            )
            .bind(p.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                r#"
                SELECT id, platform, event_type, payload, signature, status, post_id,
                       error_message, created_at
                FROM webhook_events ORDER BY id DESC LIMIT ?
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let payload: String = r.get("payload");
                Ok(WebhookEvent {
                    id: Some(r.get("id")),
                    platform: Provider::from_str(&r.get::<String, _>("platform"))?,
                    event_type: WebhookEventType::parse(&r.get::<String, _>("event_type")),
                    payload: serde_json::from_str(&payload).map_err(DbError::Json)?,
                    signature: r.get("signature"),
                    status: WebhookEventStatus::parse(&r.get::<String, _>("status")),
                    post_id: r.get("post_id"),
                    error_message: r.get("error_message"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }
}

fn split_media(media: &Option<MediaRef>) -> (Option<&'static str>, Option<String>) {
    match media {
        Some(m) => (Some(m.kind.as_str()), Some(m.url.clone())),
        None => (None, None),
    }
}

fn encode_issues(post: &Post) -> Result<Option<String>> {
    post.preflight_issues
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DbError::Json(e).into())
}

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let media = match (
        r.get::<Option<String>, _>("media_type"),
        r.get::<Option<String>, _>("media_url"),
    ) {
        (Some(kind), Some(url)) => Some(MediaRef {
            kind: if kind == "video" {
                MediaKind::Video
            } else {
                MediaKind::Image
            },
            url,
        }),
        _ => None,
    };

    let platforms: String = r.get("platforms");
    let issues: Option<String> = r.get("preflight_issues");
    let options: String = r.get("options");

    Ok(Post {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        caption: r.get("caption"),
        media,
        scheduled_at: r.get("scheduled_at"),
        status: PostStatus::from_str(&r.get::<String, _>("status"))?,
        platforms: serde_json::from_str(&platforms).map_err(DbError::Json)?,
        preflight_issues: issues
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(DbError::Json)?,
        job_id: r.get("job_id"),
        external_id: r.get("external_id"),
        external_url: r.get("external_url"),
        options: serde_json::from_str(&options).map_err(DbError::Json)?,
        version: r.get("version"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn connection_from_row(r: &SqliteRow) -> Result<Connection> {
    Ok(Connection {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        provider: Provider::from_str(&r.get::<String, _>("provider"))?,
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        token_type: r.get("token_type"),
        expires_at: r.get("expires_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn log_from_row(r: &SqliteRow) -> Result<JobLog> {
    let raw: Option<String> = r.get("raw");
    Ok(JobLog {
        id: Some(r.get("id")),
        post_id: r.get("post_id"),
        level: LogLevel::parse(&r.get::<String, _>("level")),
        message: r.get("message"),
        raw: raw
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(DbError::Json)?,
        created_at: r.get("created_at"),
    })
}
