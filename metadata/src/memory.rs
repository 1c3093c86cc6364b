use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{MetadataError, MetadataResult};
use crate::models::{
    Image, NewImage, NewUser, Published, SoftDelete, Tag, TagReport, User, UserUpdate,
};
use crate::store::MetadataStore;

#[derive(Debug)]
struct ImageRow {
    id: u64,
    image: Image,
}

#[derive(Debug)]
struct TagRow {
    image_id: u64,
    tag: Tag,
}

#[derive(Debug, Default)]
struct Tables {
    users: Vec<User>,
    images: Vec<ImageRow>,
    tags: Vec<TagRow>,
    next_image_id: u64,
}

impl Tables {
    fn live_user(&self, username: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|u| u.is_live() && u.username == username)
    }

    fn live_user_mut(&mut self, username: &str) -> Option<&mut User> {
        self.users
            .iter_mut()
            .find(|u| u.is_live() && u.username == username)
    }

    fn live_image(&self, name: &str) -> Option<&ImageRow> {
        self.images
            .iter()
            .find(|row| row.image.is_live() && row.image.name == name)
    }

    fn live_tags(&self, image_id: u64) -> impl Iterator<Item = &Tag> {
        self.tags
            .iter()
            .filter(move |row| row.image_id == image_id && row.tag.is_live())
            .map(|row| &row.tag)
    }

    fn live_tag_mut(&mut self, image_id: u64, tag: &str) -> Option<&mut Tag> {
        self.tags
            .iter_mut()
            .find(|row| row.image_id == image_id && row.tag.is_live() && row.tag.name == tag)
            .map(|row| &mut row.tag)
    }

    fn with_tags(&self, row: &ImageRow) -> Image {
        let mut image = row.image.clone();
        image.tags = self.live_tags(row.id).cloned().collect();
        image
    }
}

/// Metadata store that keeps every table in memory.
///
/// One lock covers all tables, so each operation (including the image
/// cascade) is applied atomically with respect to every other.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_user(&self, user: NewUser) -> MetadataResult<User> {
        let mut tables = self.tables.write().await;
        if tables.live_user(&user.username).is_some() {
            return Err(MetadataError::Conflict(format!("user {}", user.username)));
        }

        let now = Utc::now();
        let record = User {
            username: user.username,
            password: user.password,
            email: user.email,
            role: user.role,
            active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.users.push(record.clone());
        tracing::debug!(username = %record.username, "created user");
        Ok(record)
    }

    async fn find_user(&self, username: &str) -> MetadataResult<User> {
        let tables = self.tables.read().await;
        tables
            .live_user(username)
            .cloned()
            .ok_or_else(|| MetadataError::user_not_found(username))
    }

    async fn list_users(&self) -> MetadataResult<Vec<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.iter().filter(|u| u.is_live()).cloned().collect())
    }

    async fn update_user(&self, username: &str, update: UserUpdate) -> MetadataResult<User> {
        let mut tables = self.tables.write().await;
        let user = tables
            .live_user_mut(username)
            .ok_or_else(|| MetadataError::user_not_found(username))?;

        user.email = update.email;
        user.role = update.role;
        if let Some(password) = update.password {
            user.password = password;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn delete_user(&self, username: &str) -> MetadataResult<()> {
        let mut tables = self.tables.write().await;
        let user = tables
            .live_user_mut(username)
            .ok_or_else(|| MetadataError::user_not_found(username))?;
        user.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn create_image(&self, image: NewImage) -> MetadataResult<Image> {
        let mut tables = self.tables.write().await;
        if tables.live_image(&image.name).is_some() {
            return Err(MetadataError::Conflict(format!("image {}", image.name)));
        }

        let now = Utc::now();
        let record = Image {
            name: image.name,
            description: image.description,
            owner: image.owner,
            public: image.public,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.next_image_id += 1;
        let id = tables.next_image_id;
        tables.images.push(ImageRow {
            id,
            image: record.clone(),
        });
        Ok(record)
    }

    async fn list_images(&self) -> MetadataResult<Vec<Image>> {
        let tables = self.tables.read().await;
        Ok(tables
            .images
            .iter()
            .filter(|row| row.image.is_live())
            .map(|row| tables.with_tags(row))
            .collect())
    }

    async fn get_image(&self, name: &str) -> MetadataResult<Image> {
        let tables = self.tables.read().await;
        let row = tables
            .live_image(name)
            .ok_or_else(|| MetadataError::image_not_found(name))?;
        Ok(tables.with_tags(row))
    }

    async fn list_tags(&self, image: &str) -> MetadataResult<Vec<Tag>> {
        let tables = self.tables.read().await;
        let row = tables
            .live_image(image)
            .ok_or_else(|| MetadataError::image_not_found(image))?;
        Ok(tables.live_tags(row.id).cloned().collect())
    }

    async fn put_tag(&self, image: &str, report: TagReport) -> MetadataResult<Published> {
        let mut tables = self.tables.write().await;
        let image_id = tables
            .live_image(image)
            .ok_or_else(|| MetadataError::image_not_found(image))?
            .id;

        if let Some(tag) = tables.live_tag_mut(image_id, &report.name) {
            tag.digest = report.digest;
            tag.size = report.size;
            return Ok(Published {
                tag: tag.clone(),
                created: false,
            });
        }

        let tag = Tag {
            image: image.to_string(),
            name: report.name,
            digest: report.digest,
            size: report.size,
            created_at: Utc::now(),
            last_pulled: None,
            pull_count: 0,
            deleted_at: None,
        };
        tables.tags.push(TagRow {
            image_id,
            tag: tag.clone(),
        });
        Ok(Published { tag, created: true })
    }

    async fn record_pull(&self, image: &str, tag: &str) -> MetadataResult<Tag> {
        let mut tables = self.tables.write().await;
        let image_id = tables
            .live_image(image)
            .ok_or_else(|| MetadataError::image_not_found(image))?
            .id;
        let record = tables
            .live_tag_mut(image_id, tag)
            .ok_or_else(|| MetadataError::tag_not_found(image, tag))?;
        record.pull_count += 1;
        record.last_pulled = Some(Utc::now());
        Ok(record.clone())
    }

    async fn delete_image(&self, name: &str) -> MetadataResult<u64> {
        let mut tables = self.tables.write().await;
        let image_id = tables
            .live_image(name)
            .ok_or_else(|| MetadataError::image_not_found(name))?
            .id;

        let now = Utc::now();
        let mut removed = 0;
        for row in tables
            .tags
            .iter_mut()
            .filter(|row| row.image_id == image_id && row.tag.is_live())
        {
            row.tag.deleted_at = Some(now);
            removed += 1;
        }

        if let Some(row) = tables.images.iter_mut().find(|row| row.id == image_id) {
            row.image.deleted_at = Some(now);
        }
        tracing::debug!(image = %name, tags = removed, "deleted image");
        Ok(removed)
    }

    async fn delete_tag(&self, image: &str, tag: &str) -> MetadataResult<()> {
        let mut tables = self.tables.write().await;
        let image_id = tables
            .live_image(image)
            .ok_or_else(|| MetadataError::image_not_found(image))?
            .id;
        let record = tables
            .live_tag_mut(image_id, tag)
            .ok_or_else(|| MetadataError::tag_not_found(image, tag))?;
        record.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }
}
