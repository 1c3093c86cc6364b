//! Row types shared by the SQL backends.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secret::PasswordHash;
use sqlx::FromRow;

use crate::error::MetadataError;
use crate::models::{Image, Tag, User};

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub role: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<UserRow> for User {
    type Error = MetadataError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            password: PasswordHash::from_phc(row.password_hash)?,
            username: row.username,
            email: row.email,
            role: row.role,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ImageRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub owner: String,
    pub public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ImageRow {
    pub fn into_image(self, tags: Vec<Tag>) -> Image {
        Image {
            name: self.name,
            description: self.description,
            owner: self.owner,
            public: self.public,
            tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TagRow {
    pub image_id: i64,
    pub image: String,
    pub name: String,
    pub digest: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub last_pulled: Option<DateTime<Utc>>,
    pub pull_count: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl From<TagRow> for Tag {
    fn from(row: TagRow) -> Self {
        Tag {
            image: row.image,
            name: row.name,
            digest: row.digest,
            size: row.size,
            created_at: row.created_at,
            last_pulled: row.last_pulled,
            pull_count: row.pull_count,
            deleted_at: row.deleted_at,
        }
    }
}

/// Pair each image with its tags.
pub(crate) fn attach_tags(images: Vec<ImageRow>, tags: Vec<TagRow>) -> Vec<Image> {
    let mut by_image: HashMap<i64, Vec<Tag>> = HashMap::new();
    for tag in tags {
        by_image.entry(tag.image_id).or_default().push(tag.into());
    }
    images
        .into_iter()
        .map(|row| {
            let tags = by_image.remove(&row.id).unwrap_or_default();
            row.into_image(tags)
        })
        .collect()
}

pub(crate) fn users(rows: Vec<UserRow>) -> Result<Vec<User>, MetadataError> {
    rows.into_iter().map(User::try_from).collect()
}
