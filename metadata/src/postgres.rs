use std::time::Duration;

use chrono::Utc;
use secret::Secret;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, Pool, Postgres};

use crate::error::{MetadataError, MetadataResult};
use crate::models::{Image, NewImage, NewUser, Published, Tag, TagReport, User, UserUpdate};
use crate::rows::{attach_tags, users, ImageRow, TagRow, UserRow};
use crate::store::MetadataStore;

/// Connection parameters for [PostgresMetadataStore].
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Server hostname.
    pub host: String,
    /// Server port, usually 5432.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Login role.
    pub username: String,
    /// Login password.
    pub password: Secret,
    /// Pool size.
    pub max_connections: u32,
    /// Upper bound on waiting for a pooled connection.
    pub acquire_timeout: Duration,
}

/// PostgreSQL-backed metadata store.
///
/// Writes to one image take a row lock on it (`FOR UPDATE`), so concurrent
/// writers of the same image serialize while distinct images proceed in
/// parallel.
#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: Pool<Postgres>,
}

impl PostgresMetadataStore {
    /// Connect and apply the schema.
    pub async fn connect(options: &PostgresOptions) -> MetadataResult<Self> {
        let connect = PgConnectOptions::new()
            .host(&options.host)
            .port(options.port)
            .username(&options.username)
            .password(options.password.revealed())
            .database(&options.database);

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(connect)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(
            host = %options.host,
            port = options.port,
            database = %options.database,
            "connected to postgres metadata store"
        );
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

/// Look up a live image, locking its row until the transaction ends.
async fn lock_image(conn: &mut PgConnection, name: &str) -> MetadataResult<ImageRow> {
    sqlx::query_as::<_, ImageRow>(
        "SELECT id, name, description, owner, public, created_at, updated_at, deleted_at \
         FROM images WHERE name = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| MetadataError::image_not_found(name))
}

async fn live_image(conn: &mut PgConnection, name: &str) -> MetadataResult<ImageRow> {
    sqlx::query_as::<_, ImageRow>(
        "SELECT id, name, description, owner, public, created_at, updated_at, deleted_at \
         FROM images WHERE name = $1 AND deleted_at IS NULL",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| MetadataError::image_not_found(name))
}

async fn live_tags(conn: &mut PgConnection, image_id: i64) -> MetadataResult<Vec<TagRow>> {
    let rows = sqlx::query_as::<_, TagRow>(
        "SELECT t.image_id, i.name AS image, t.name, t.digest, t.size, t.created_at, \
                t.last_pulled, t.pull_count, t.deleted_at \
         FROM tags t JOIN images i ON i.id = t.image_id \
         WHERE t.image_id = $1 AND t.deleted_at IS NULL",
    )
    .bind(image_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

async fn live_tag(
    conn: &mut PgConnection,
    image_id: i64,
    tag: &str,
) -> MetadataResult<Option<TagRow>> {
    let row = sqlx::query_as::<_, TagRow>(
        "SELECT t.image_id, i.name AS image, t.name, t.digest, t.size, t.created_at, \
                t.last_pulled, t.pull_count, t.deleted_at \
         FROM tags t JOIN images i ON i.id = t.image_id \
         WHERE t.image_id = $1 AND t.name = $2 AND t.deleted_at IS NULL",
    )
    .bind(image_id)
    .bind(tag)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn live_user(conn: &mut PgConnection, username: &str) -> MetadataResult<User> {
    sqlx::query_as::<_, UserRow>(
        "SELECT username, password_hash, email, role, active, created_at, updated_at, deleted_at \
         FROM users WHERE username = $1 AND deleted_at IS NULL",
    )
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| MetadataError::user_not_found(username))?
    .try_into()
}

#[async_trait::async_trait]
impl MetadataStore for PostgresMetadataStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[tracing::instrument(skip(self, user), fields(username = %user.username))]
    async fn create_user(&self, user: NewUser) -> MetadataResult<User> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (username, password_hash, email, role, active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&user.username)
        .bind(user.password.as_str())
        .bind(&user.email)
        .bind(&user.role)
        .bind(true)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!("created user");
        Ok(User {
            username: user.username,
            password: user.password,
            email: user.email,
            role: user.role,
            active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn find_user(&self, username: &str) -> MetadataResult<User> {
        let mut conn = self.pool.acquire().await?;
        live_user(&mut conn, username).await
    }

    async fn list_users(&self) -> MetadataResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT username, password_hash, email, role, active, created_at, updated_at, deleted_at \
             FROM users WHERE deleted_at IS NULL ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;
        users(rows)
    }

    #[tracing::instrument(skip(self, update))]
    async fn update_user(&self, username: &str, update: UserUpdate) -> MetadataResult<User> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE users SET email = $1, role = $2, \
                    password_hash = COALESCE($3, password_hash), updated_at = $4 \
             WHERE username = $5 AND deleted_at IS NULL",
        )
        .bind(&update.email)
        .bind(&update.role)
        .bind(update.password.as_ref().map(|p| p.as_str()))
        .bind(Utc::now())
        .bind(username)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MetadataError::user_not_found(username));
        }
        let user = live_user(&mut tx, username).await?;
        tx.commit().await?;
        Ok(user)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_user(&self, username: &str) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE users SET deleted_at = $1 WHERE username = $2 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(username)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::user_not_found(username));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, image), fields(image = %image.name))]
    async fn create_image(&self, image: NewImage) -> MetadataResult<Image> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO images (name, description, owner, public, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&image.name)
        .bind(&image.description)
        .bind(&image.owner)
        .bind(image.public)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Image {
            name: image.name,
            description: image.description,
            owner: image.owner,
            public: image.public,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    async fn list_images(&self) -> MetadataResult<Vec<Image>> {
        let mut tx = self.pool.begin().await?;
        let images = sqlx::query_as::<_, ImageRow>(
            "SELECT id, name, description, owner, public, created_at, updated_at, deleted_at \
             FROM images WHERE deleted_at IS NULL",
        )
        .fetch_all(&mut *tx)
        .await?;
        let tags = sqlx::query_as::<_, TagRow>(
            "SELECT t.image_id, i.name AS image, t.name, t.digest, t.size, t.created_at, \
                    t.last_pulled, t.pull_count, t.deleted_at \
             FROM tags t JOIN images i ON i.id = t.image_id \
             WHERE t.deleted_at IS NULL AND i.deleted_at IS NULL",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(attach_tags(images, tags))
    }

    #[tracing::instrument(skip(self))]
    async fn get_image(&self, name: &str) -> MetadataResult<Image> {
        let mut tx = self.pool.begin().await?;
        let image = live_image(&mut tx, name).await?;
        let tags = live_tags(&mut tx, image.id).await?;
        tx.commit().await?;
        Ok(image.into_image(tags.into_iter().map(Tag::from).collect()))
    }

    #[tracing::instrument(skip(self))]
    async fn list_tags(&self, image: &str) -> MetadataResult<Vec<Tag>> {
        let mut tx = self.pool.begin().await?;
        let row = live_image(&mut tx, image).await?;
        let tags = live_tags(&mut tx, row.id).await?;
        tx.commit().await?;
        Ok(tags.into_iter().map(Tag::from).collect())
    }

    #[tracing::instrument(skip(self, report), fields(tag = %report.name))]
    async fn put_tag(&self, image: &str, report: TagReport) -> MetadataResult<Published> {
        let mut tx = self.pool.begin().await?;
        let row = lock_image(&mut tx, image).await?;

        let existed = live_tag(&mut tx, row.id, &report.name).await?.is_some();
        if existed {
            sqlx::query(
                "UPDATE tags SET digest = $1, size = $2 \
                 WHERE image_id = $3 AND name = $4 AND deleted_at IS NULL",
            )
            .bind(&report.digest)
            .bind(report.size)
            .bind(row.id)
            .bind(&report.name)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO tags (image_id, name, digest, size, created_at, pull_count) \
                 VALUES ($1, $2, $3, $4, $5, 0)",
            )
            .bind(row.id)
            .bind(&report.name)
            .bind(&report.digest)
            .bind(report.size)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        let tag = live_tag(&mut tx, row.id, &report.name)
            .await?
            .ok_or_else(|| MetadataError::Internal(format!("tag {image}:{} vanished", report.name)))?;
        tx.commit().await?;
        tracing::debug!(digest = %tag.digest, created = !existed, "recorded tag");
        Ok(Published {
            tag: tag.into(),
            created: !existed,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn record_pull(&self, image: &str, tag: &str) -> MetadataResult<Tag> {
        let mut tx = self.pool.begin().await?;
        let row = live_image(&mut tx, image).await?;
        let result = sqlx::query(
            "UPDATE tags SET pull_count = pull_count + 1, last_pulled = $1 \
             WHERE image_id = $2 AND name = $3 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(row.id)
        .bind(tag)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::tag_not_found(image, tag));
        }

        let record = live_tag(&mut tx, row.id, tag)
            .await?
            .ok_or_else(|| MetadataError::tag_not_found(image, tag))?;
        tx.commit().await?;
        Ok(record.into())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_image(&self, name: &str) -> MetadataResult<u64> {
        // The row lock makes a concurrent delete of the same image wait here,
        // then find no live row and report NotFound.
        let mut tx = self.pool.begin().await?;
        let row = lock_image(&mut tx, name).await?;
        let now = Utc::now();

        let removed = sqlx::query(
            "UPDATE tags SET deleted_at = $1 WHERE image_id = $2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let result = sqlx::query(
            "UPDATE images SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::image_not_found(name));
        }

        tx.commit().await?;
        tracing::debug!(tags = removed, "deleted image");
        Ok(removed)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_tag(&self, image: &str, tag: &str) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = lock_image(&mut tx, image).await?;
        let result = sqlx::query(
            "UPDATE tags SET deleted_at = $1 \
             WHERE image_id = $2 AND name = $3 AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(row.id)
        .bind(tag)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::tag_not_found(image, tag));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    username TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    email TEXT NOT NULL,
    role TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_live_username
    ON users(username) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS images (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    owner TEXT NOT NULL,
    public BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_images_live_name
    ON images(name) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS tags (
    id BIGSERIAL PRIMARY KEY,
    image_id BIGINT NOT NULL REFERENCES images(id),
    name TEXT NOT NULL,
    digest TEXT NOT NULL,
    size BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    last_pulled TIMESTAMPTZ,
    pull_count BIGINT NOT NULL DEFAULT 0,
    deleted_at TIMESTAMPTZ
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_live_name
    ON tags(image_id, name) WHERE deleted_at IS NULL;
"#;
