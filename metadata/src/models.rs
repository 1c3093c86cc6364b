//! Records held by the metadata store and the validated inputs that create them.

use chrono::{DateTime, Utc};
use secret::PasswordHash;
use serde::Serialize;

use crate::error::{MetadataError, MetadataResult};

/// Logical deletion marker shared by every record.
///
/// Deleted rows are retained so historical pull counters stay inspectable;
/// every read path filters on [SoftDelete::is_live].
pub trait SoftDelete {
    /// When the record was logically removed, if it was.
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    /// True while the record has not been deleted.
    fn is_live(&self) -> bool {
        self.deleted_at().is_none()
    }
}

/// A registry operator.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    /// Login name, unique among live users.
    pub username: String,
    /// Salted argon2id hash. Never serialized.
    #[serde(skip_serializing)]
    pub password: PasswordHash,
    pub email: String,
    /// Free-form role name consulted by the access policy.
    pub role: String,
    /// Inactive users cannot log in.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the user was soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete for User {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// A named image repository. `owner` is a username, but not a foreign key:
/// deleting the user leaves their images in place.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    /// Repository name, unique among live images.
    pub name: String,
    pub description: String,
    /// Username of the creator.
    pub owner: String,
    /// Whether anonymous pulls are allowed.
    pub public: bool,
    /// Live tags, ordered by name.
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the image was soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete for Image {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// Outcome of recording a pushed tag.
#[derive(Debug, Clone, Serialize)]
pub struct Published {
    /// The tag as stored.
    #[serde(flatten)]
    pub tag: Tag,
    /// False when an existing tag was repointed.
    pub created: bool,
}

/// A tag within exactly one image.
#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    /// Name of the owning image.
    pub image: String,
    /// Tag name, unique among the image's live tags.
    pub name: String,
    /// Content digest of the manifest, e.g. `sha256:...`.
    pub digest: String,
    /// Manifest size in bytes.
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub last_pulled: Option<DateTime<Utc>>,
    pub pull_count: i64,
    /// Set when the tag was soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete for Tag {
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

/// A validated request to create a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub(crate) username: String,
    pub(crate) password: PasswordHash,
    pub(crate) email: String,
    pub(crate) role: String,
}

impl NewUser {
    /// Validate the fields of a new user. The password must already be hashed.
    pub fn new(
        username: impl Into<String>,
        password: PasswordHash,
        email: impl Into<String>,
        role: impl Into<String>,
    ) -> MetadataResult<Self> {
        let (username, email, role) = (username.into(), email.into(), role.into());
        Self::validate(&username, &email, &role)?;
        Ok(Self {
            username,
            password,
            email,
            role,
        })
    }

    /// Check the plain fields of a new user, before paying for a password hash.
    pub fn validate(username: &str, email: &str, role: &str) -> MetadataResult<()> {
        validate_username(username)?;
        validate_email(email)?;
        validate_role(role)
    }

    /// The username being claimed.
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// A partial update of a user. A `None` password keeps the stored hash.
#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub(crate) email: String,
    pub(crate) role: String,
    pub(crate) password: Option<PasswordHash>,
}

impl UserUpdate {
    /// Validate an update.
    pub fn new(
        email: impl Into<String>,
        role: impl Into<String>,
        password: Option<PasswordHash>,
    ) -> MetadataResult<Self> {
        let (email, role) = (email.into(), role.into());
        Self::validate(&email, &role)?;
        Ok(Self {
            email,
            role,
            password,
        })
    }

    /// Check the email and role of an update, before hashing a new password.
    pub fn validate(email: &str, role: &str) -> MetadataResult<()> {
        validate_email(email)?;
        validate_role(role)
    }
}

/// A validated request to create an image.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) owner: String,
    pub(crate) public: bool,
}

impl NewImage {
    /// Validate the fields of a new image.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        owner: impl Into<String>,
        public: bool,
    ) -> MetadataResult<Self> {
        let name = name.into();
        validate_image_name(&name)?;
        let owner = owner.into();
        validate_username(&owner)?;
        Ok(Self {
            name,
            description: description.into(),
            owner,
            public,
        })
    }

    /// The image name being claimed.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What the blob-transfer endpoint reports after pushing a tag.
#[derive(Debug, Clone)]
pub struct TagReport {
    pub(crate) name: String,
    pub(crate) digest: String,
    pub(crate) size: i64,
}

impl TagReport {
    /// Validate a publish report.
    pub fn new(name: impl Into<String>, digest: impl Into<String>, size: i64) -> MetadataResult<Self> {
        let name = name.into();
        validate_tag_name(&name)?;
        let digest = digest.into();
        validate_digest(&digest)?;
        if size < 0 {
            return Err(MetadataError::invalid("size", "must not be negative"));
        }
        Ok(Self { name, digest, size })
    }
}

fn validate_username(username: &str) -> MetadataResult<()> {
    if username.is_empty() {
        return Err(MetadataError::invalid("username", "must not be empty"));
    }
    if username.len() > 255 {
        return Err(MetadataError::invalid("username", "longer than 255 bytes"));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control() || c == '/') {
        return Err(MetadataError::invalid(
            "username",
            "must not contain whitespace or '/'",
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> MetadataResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(MetadataError::invalid("email", "expected local@domain")),
    }
}

fn validate_role(role: &str) -> MetadataResult<()> {
    if role.trim().is_empty() {
        return Err(MetadataError::invalid("role", "must not be empty"));
    }
    Ok(())
}

/// Repository names are lowercase alphanumeric path components, separated
/// internally by single `.`, `_` or `-`, and joined by `/`.
fn validate_image_name(name: &str) -> MetadataResult<()> {
    if name.is_empty() {
        return Err(MetadataError::invalid("image name", "must not be empty"));
    }
    if name.len() > 255 {
        return Err(MetadataError::invalid("image name", "longer than 255 bytes"));
    }

    for component in name.split('/') {
        let bytes = component.as_bytes();
        let well_formed = !bytes.is_empty()
            && bytes.first().is_some_and(u8::is_ascii_alphanumeric)
            && bytes.last().is_some_and(u8::is_ascii_alphanumeric)
            && bytes
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(b))
            && !bytes
                .windows(2)
                .any(|w| b"._-".contains(&w[0]) && b"._-".contains(&w[1]));
        if !well_formed {
            return Err(MetadataError::invalid(
                "image name",
                format!("bad path component {component:?} in {name:?}"),
            ));
        }
    }
    Ok(())
}

fn validate_tag_name(tag: &str) -> MetadataResult<()> {
    let bytes = tag.as_bytes();
    let valid = matches!(bytes.first(), Some(b) if b.is_ascii_alphanumeric() || *b == b'_')
        && bytes.len() <= 128
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || b"_.-".contains(b));
    if !valid {
        return Err(MetadataError::invalid(
            "tag",
            format!("{tag:?} is not a valid tag name"),
        ));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> MetadataResult<()> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(MetadataError::invalid("digest", "expected <algorithm>:<hex>"));
    };
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b));
    let hex_ok = hex.len() >= 32 && hex.bytes().all(|b| b.is_ascii_hexdigit());
    if !(algorithm_ok && hex_ok) {
        return Err(MetadataError::invalid("digest", format!("malformed digest {digest:?}")));
    }
    Ok(())
}
