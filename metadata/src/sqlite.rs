use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};

use crate::error::{MetadataError, MetadataResult};
use crate::models::{Image, NewImage, NewUser, Published, Tag, TagReport, User, UserUpdate};
use crate::rows::{attach_tags, users, ImageRow, TagRow, UserRow};
use crate::store::MetadataStore;

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    pool: Pool<Sqlite>,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                MetadataError::Internal(format!("creating {}: {err}", parent.display()))
            })?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes writers; SQLite would otherwise
        // surface "database is locked" under concurrent transactions.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "opened sqlite metadata store");
        Ok(store)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

async fn live_image(conn: &mut SqliteConnection, name: &str) -> MetadataResult<ImageRow> {
    sqlx::query_as::<_, ImageRow>(
        "SELECT id, name, description, owner, public, created_at, updated_at, deleted_at \
         FROM images WHERE name = ? AND deleted_at IS NULL",
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| MetadataError::image_not_found(name))
}

async fn live_tags(conn: &mut SqliteConnection, image_id: i64) -> MetadataResult<Vec<TagRow>> {
    let rows = sqlx::query_as::<_, TagRow>(
        "SELECT t.image_id, i.name AS image, t.name, t.digest, t.size, t.created_at, \
                t.last_pulled, t.pull_count, t.deleted_at \
         FROM tags t JOIN images i ON i.id = t.image_id \
         WHERE t.image_id = ? AND t.deleted_at IS NULL",
    )
    .bind(image_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

async fn live_tag(
    conn: &mut SqliteConnection,
    image_id: i64,
    tag: &str,
) -> MetadataResult<Option<TagRow>> {
    let row = sqlx::query_as::<_, TagRow>(
        "SELECT t.image_id, i.name AS image, t.name, t.digest, t.size, t.created_at, \
                t.last_pulled, t.pull_count, t.deleted_at \
         FROM tags t JOIN images i ON i.id = t.image_id \
         WHERE t.image_id = ? AND t.name = ? AND t.deleted_at IS NULL",
    )
    .bind(image_id)
    .bind(tag)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

async fn live_user(conn: &mut SqliteConnection, username: &str) -> MetadataResult<User> {
    sqlx::query_as::<_, UserRow>(
        "SELECT username, password_hash, email, role, active, created_at, updated_at, deleted_at \
         FROM users WHERE username = ? AND deleted_at IS NULL",
    )
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| MetadataError::user_not_found(username))?
    .try_into()
}

#[async_trait::async_trait]
impl MetadataStore for SqliteMetadataStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[tracing::instrument(skip(self, user), fields(username = %user.username))]
    async fn create_user(&self, user: NewUser) -> MetadataResult<User> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (username, password_hash, email, role, active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
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
            "UPDATE users SET email = ?, role = ?, \
                    password_hash = COALESCE(?, password_hash), updated_at = ? \
             WHERE username = ? AND deleted_at IS NULL",
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
        let result =
            sqlx::query("UPDATE users SET deleted_at = ? WHERE username = ? AND deleted_at IS NULL")
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
             VALUES (?, ?, ?, ?, ?, ?)",
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
        let row = live_image(&mut tx, image).await?;

        let existed = live_tag(&mut tx, row.id, &report.name).await?.is_some();
        if existed {
            sqlx::query(
                "UPDATE tags SET digest = ?, size = ? \
                 WHERE image_id = ? AND name = ? AND deleted_at IS NULL",
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
                 VALUES (?, ?, ?, ?, ?, 0)",
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
            "UPDATE tags SET pull_count = pull_count + 1, last_pulled = ? \
             WHERE image_id = ? AND name = ? AND deleted_at IS NULL",
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
        // Dropping `tx` on any early return rolls back the tag deletions.
        let mut tx = self.pool.begin().await?;
        let row = live_image(&mut tx, name).await?;
        let now = Utc::now();

        let removed = sqlx::query(
            "UPDATE tags SET deleted_at = ? WHERE image_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let result = sqlx::query(
            "UPDATE images SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
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
        let row = live_image(&mut tx, image).await?;
        let result = sqlx::query(
            "UPDATE tags SET deleted_at = ? WHERE image_id = ? AND name = ? AND deleted_at IS NULL",
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
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    email TEXT NOT NULL,
    role TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_users_live_username
    ON users(username) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    owner TEXT NOT NULL,
    public BOOLEAN NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_images_live_name
    ON images(name) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL REFERENCES images(id),
    name TEXT NOT NULL,
    digest TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_pulled TEXT,
    pull_count INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_live_name
    ON tags(image_id, name) WHERE deleted_at IS NULL;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use secret::{PasswordHash, Secret};

    const DIGEST: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn store() -> (tempfile::TempDir, SqliteMetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteMetadataStore::new(dir.path().join("metadata.db"))
            .await
            .unwrap();
        (dir, store)
    }

    async fn image_with_tags(store: &SqliteMetadataStore, name: &str, tags: &[&str]) {
        store
            .create_image(NewImage::new(name, "", "alice", false).unwrap())
            .await
            .unwrap();
        for tag in tags {
            store
                .put_tag(name, TagReport::new(*tag, DIGEST, 42).unwrap())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let (_dir, store) = store().await;
        store.migrate().await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn user_round_trip_keeps_hash() {
        let (_dir, store) = store().await;
        let hash = PasswordHash::new(&Secret::from("s3cr3t")).unwrap();
        store
            .create_user(NewUser::new("alice", hash, "alice@example.com", "admin").unwrap())
            .await
            .unwrap();

        let user = store.find_user("alice").await.unwrap();
        assert_eq!(user.role, "admin");
        assert!(user.active);
        assert!(user.password.verify(&Secret::from("s3cr3t")));
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_live_user() {
        let (_dir, store) = store().await;
        let hash = PasswordHash::new(&Secret::from("pw")).unwrap();
        let user = NewUser::new("bob", hash, "bob@example.com", "user").unwrap();
        store.create_user(user.clone()).await.unwrap();
        let err = store.create_user(user.clone()).await.unwrap_err();
        assert!(matches!(err, MetadataError::Conflict(_)), "{err:?}");

        // The name is free again once the holder is soft-deleted.
        store.delete_user("bob").await.unwrap();
        store.create_user(user).await.unwrap();
    }

    #[tokio::test]
    async fn cascade_rolls_back_when_tag_deletion_fails() {
        let (_dir, store) = store().await;
        image_with_tags(&store, "app/web", &["v1", "v2", "v3"]).await;

        sqlx::raw_sql(
            "CREATE TRIGGER fail_tag_delete BEFORE UPDATE OF deleted_at ON tags \
             WHEN NEW.name = 'v2' BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.delete_image("app/web").await.unwrap_err();
        assert!(matches!(err, MetadataError::Unavailable(_)), "{err:?}");

        let image = store.get_image("app/web").await.unwrap();
        assert!(image.deleted_at.is_none());
        let mut names: Vec<_> = image.tags.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(names, ["v1", "v2", "v3"]);

        sqlx::raw_sql("DROP TRIGGER fail_tag_delete")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.delete_image("app/web").await.unwrap(), 3);
        assert!(store.list_tags("app/web").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cascade_restores_tags_when_image_deletion_fails() {
        let (_dir, store) = store().await;
        image_with_tags(&store, "app/api", &["v1", "v2"]).await;

        sqlx::raw_sql(
            "CREATE TRIGGER fail_image_delete BEFORE UPDATE OF deleted_at ON images \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.delete_image("app/api").await.unwrap_err();
        assert!(matches!(err, MetadataError::Unavailable(_)), "{err:?}");

        // The tag step ran before the image step failed and must not survive.
        let mut names: Vec<_> = store
            .list_tags("app/api")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        assert_eq!(names, ["v1", "v2"]);

        let (deleted,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM tags WHERE deleted_at IS NOT NULL")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(deleted, 0);

        sqlx::raw_sql("DROP TRIGGER fail_image_delete")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.delete_image("app/api").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deleted_rows_are_retained_for_history() {
        let (_dir, store) = store().await;
        image_with_tags(&store, "app", &["v1"]).await;
        store.record_pull("app", "v1").await.unwrap();
        store.delete_image("app").await.unwrap();

        let (pulls, deleted): (i64, Option<chrono::DateTime<Utc>>) =
            sqlx::query_as("SELECT pull_count, deleted_at FROM tags WHERE name = 'v1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(pulls, 1);
        assert!(deleted.is_some());
    }

    #[tokio::test]
    async fn republish_updates_digest_and_keeps_pulls() {
        let (_dir, store) = store().await;
        image_with_tags(&store, "app", &["latest"]).await;
        store.record_pull("app", "latest").await.unwrap();

        let other = "sha256:ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
        let published = store
            .put_tag("app", TagReport::new("latest", other, 7).unwrap())
            .await
            .unwrap();
        assert!(!published.created);
        let tag = published.tag;
        assert_eq!(tag.digest, other);
        assert_eq!(tag.size, 7);
        assert_eq!(tag.pull_count, 1);
        assert_eq!(store.list_tags("app").await.unwrap().len(), 1);
    }
}
