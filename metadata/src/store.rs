//! The repository interface every metadata backend implements.

use std::fmt;

use async_trait::async_trait;

use crate::error::MetadataResult;
use crate::models::{Image, NewImage, NewUser, Published, Tag, TagReport, User, UserUpdate};

/// Users, images and tags, looked up by natural key.
///
/// Implementations must serialize conflicting writes to the same key while
/// leaving distinct keys independent, and must only ever return live records.
#[async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create a user. Fails with `Conflict` if a live user holds the name.
    async fn create_user(&self, user: NewUser) -> MetadataResult<User>;

    /// Look up a live user.
    async fn find_user(&self, username: &str) -> MetadataResult<User>;

    /// All live users.
    async fn list_users(&self) -> MetadataResult<Vec<User>>;

    /// Replace email and role, and the password hash when one is supplied.
    async fn update_user(&self, username: &str, update: UserUpdate) -> MetadataResult<User>;

    /// Soft-delete a user. Images they own are untouched.
    async fn delete_user(&self, username: &str) -> MetadataResult<()>;

    /// Create an image. Fails with `Conflict` if a live image holds the name.
    async fn create_image(&self, image: NewImage) -> MetadataResult<Image>;

    /// All live images with their live tags, in no particular order.
    async fn list_images(&self) -> MetadataResult<Vec<Image>>;

    /// A live image with its live tags.
    async fn get_image(&self, name: &str) -> MetadataResult<Image>;

    /// Live tags of a live image.
    async fn list_tags(&self, image: &str) -> MetadataResult<Vec<Tag>>;

    /// Record a pushed tag. An existing live tag of the same name is repointed
    /// at the new digest, keeping its pull history.
    async fn put_tag(&self, image: &str, report: TagReport) -> MetadataResult<Published>;

    /// Count a pull of a tag.
    async fn record_pull(&self, image: &str, tag: &str) -> MetadataResult<Tag>;

    /// Soft-delete an image and, first, all of its tags, as one unit.
    ///
    /// Returns how many tags were removed. Either every tag and the image are
    /// marked deleted, or nothing is. Of two concurrent deletes of the same
    /// image exactly one succeeds; the other sees `NotFound`.
    async fn delete_image(&self, name: &str) -> MetadataResult<u64>;

    /// Soft-delete one tag, leaving its image in place.
    async fn delete_tag(&self, image: &str, tag: &str) -> MetadataResult<()>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> MetadataResult<()>;
}
