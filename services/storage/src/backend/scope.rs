//! Per-principal key scoping for Firebase Storage.
//!
//! Every object lives under `users/{uid}/`. Anonymous callers share the
//! `users/anonymous/` segment. Keys are validated so that a scoped path can
//! never point outside the caller's namespace.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Root segment of every scoped path
pub const USERS_ROOT: &str = "users";

/// Segment used when no principal is signed in
pub const ANONYMOUS_SEGMENT: &str = "anonymous";

/// The authenticated caller, passed explicitly into storage operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier from the authentication provider
    pub uid: Option<String>,
    /// ID token forwarded to Firebase Storage
    #[serde(skip_serializing)]
    pub id_token: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            id_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    /// Namespace segment for this principal
    pub fn segment(&self) -> Result<&str, StorageError> {
        match self.uid.as_deref() {
            None => Ok(ANONYMOUS_SEGMENT),
            Some(uid) if uid.is_empty() => Ok(ANONYMOUS_SEGMENT),
            Some(uid) if uid.contains('/') || uid.contains('\\') || uid == "." || uid == ".." => {
                Err(StorageError::invalid_key(uid, "user id is not a single path segment"))
            }
            Some(uid) if uid == ANONYMOUS_SEGMENT => Err(StorageError::invalid_key(
                uid,
                "user id collides with the anonymous namespace",
            )),
            Some(uid) => Ok(uid),
        }
    }

    /// `users/{uid}` prefix owned by this principal
    pub fn root(&self) -> Result<String, StorageError> {
        Ok(format!("{USERS_ROOT}/{}", self.segment()?))
    }

    /// Resolve `key` into `users/{uid}/{key}`
    pub fn scoped_path(&self, key: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        Ok(format!("{}/{key}", self.root()?))
    }

    /// Strip this principal's prefix from a full object path
    pub fn relative_key<'a>(&self, full_path: &'a str) -> Option<&'a str> {
        let root = self.root().ok()?;
        full_path
            .strip_prefix(root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

/// Reject keys that are empty, absolute or contain dot segments
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "key is empty"));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::invalid_key(key, "key must be relative"));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::invalid_key(key, "key contains an empty or dot segment"));
    }
    Ok(())
}
