//! Authorization hook consulted before every authenticated operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::credentials::Claims;
use crate::error::{RegistryError, RegistryResult};

/// Everything an authenticated caller can ask the registry to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// List live images.
    ListImages,
    /// Read one image with its tags.
    GetImage,
    /// Create an image owned by the caller.
    CreateImage,
    /// Delete an image and its tags.
    DeleteImage,
    /// List an image's tags.
    ListTags,
    /// Record a pushed tag.
    PublishTag,
    /// Record a tag pull.
    RecordPull,
    /// Delete one tag.
    DeleteTag,
    /// List live users.
    ListUsers,
    /// Create a user.
    CreateUser,
    /// Change a user's email, role or password.
    UpdateUser,
    /// Soft-delete a user.
    DeleteUser,
    /// Read registry counters.
    ReadMetrics,
    /// Exchange a token for a fresh one.
    RefreshToken,
    /// Inspect a token's claims.
    VerifyToken,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Operation; 15] = [
        Operation::ListImages,
        Operation::GetImage,
        Operation::CreateImage,
        Operation::DeleteImage,
        Operation::ListTags,
        Operation::PublishTag,
        Operation::RecordPull,
        Operation::DeleteTag,
        Operation::ListUsers,
        Operation::CreateUser,
        Operation::UpdateUser,
        Operation::DeleteUser,
        Operation::ReadMetrics,
        Operation::RefreshToken,
        Operation::VerifyToken,
    ];

    /// The kebab-case name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ListImages => "list-images",
            Operation::GetImage => "get-image",
            Operation::CreateImage => "create-image",
            Operation::DeleteImage => "delete-image",
            Operation::ListTags => "list-tags",
            Operation::PublishTag => "publish-tag",
            Operation::RecordPull => "record-pull",
            Operation::DeleteTag => "delete-tag",
            Operation::ListUsers => "list-users",
            Operation::CreateUser => "create-user",
            Operation::UpdateUser => "update-user",
            Operation::DeleteUser => "delete-user",
            Operation::ReadMetrics => "read-metrics",
            Operation::RefreshToken => "refresh-token",
            Operation::VerifyToken => "verify-token",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown operation name.
#[derive(Debug, thiserror::Error)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == name)
            .ok_or_else(|| UnknownOperation(name.to_string()))
    }
}

/// Decides whether a verified caller may perform an operation.
pub trait AccessPolicy: fmt::Debug + Send + Sync {
    /// `Ok(())` to allow, [RegistryError::Forbidden] to refuse.
    fn authorize(&self, claims: &Claims, operation: Operation) -> RegistryResult<()>;
}

/// Any holder of a valid token may do anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAuthenticated;

impl AccessPolicy for AllowAuthenticated {
    fn authorize(&self, _claims: &Claims, _operation: Operation) -> RegistryResult<()> {
        Ok(())
    }
}

/// Restricts listed operations to a set of roles. Unlisted operations are
/// open to every authenticated caller.
#[derive(Debug, Default, Clone)]
pub struct RolePolicy {
    rules: BTreeMap<Operation, BTreeSet<String>>,
}

impl RolePolicy {
    /// An empty policy, equivalent to [AllowAuthenticated].
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `operation` only for `roles` (adds to any roles already allowed).
    pub fn restrict<I, S>(mut self, operation: Operation, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(operation)
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    /// Restrict each operation to the `admin` role.
    pub fn admin_only(operations: impl IntoIterator<Item = Operation>) -> Self {
        operations
            .into_iter()
            .fold(Self::new(), |policy, op| policy.restrict(op, ["admin"]))
    }

    /// True when no operation is restricted.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl AccessPolicy for RolePolicy {
    fn authorize(&self, claims: &Claims, operation: Operation) -> RegistryResult<()> {
        match self.rules.get(&operation) {
            Some(roles) if !roles.contains(&claims.role) => {
                tracing::debug!(
                    username = %claims.username,
                    role = %claims.role,
                    %operation,
                    "operation refused by role policy"
                );
                Err(RegistryError::Forbidden(operation.to_string()))
            }
            _ => Ok(()),
        }
    }
}
