//! Host directory boundary.
//!
//! The control plane never owns user or organization data. The host
//! application implements [`Directory`] and hands it to the access
//! controller at construction time; lookups and permission resolution flow
//! through that one seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Kinds of principal a directory can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    User,
    Organization,
}

impl PrincipalKind {
    pub fn name(self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Organization => "organization",
        }
    }
}

/// A directory entry. Soft deletion is modeled with a timestamp so hosts can
/// keep tombstones; a deleted record never passes access control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub id: String,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Host-defined payload carried through to predicate policies untouched.
    #[serde(default)]
    pub attributes: Value,
}

impl DirectoryRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted_at: None,
            attributes: Value::Null,
        }
    }

    pub fn deleted(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            deleted_at: Some(at),
            attributes: Value::Null,
        }
    }

    pub fn with_attributes(mut self, attributes: Value) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Opaque host state threaded through directory lookups and predicate
/// policies. The control plane never inspects it; hosts downcast it back
/// with [`RequestContext::get`].
#[derive(Clone, Default)]
pub struct RequestContext(Option<Arc<dyn Any + Send + Sync>>);

impl RequestContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Recover the host value, if one of type `T` was stored.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_some() {
            f.write_str("RequestContext(..)")
        } else {
            f.write_str("RequestContext(empty)")
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The lookup reached the host directory but failed there.
    #[error("directory lookup failed: {0}")]
    Lookup(String),

    /// The host never wired a permission resolver.
    #[error("no permission resolver configured")]
    NoPermissionResolver,
}

impl DirectoryError {
    pub fn lookup(reason: impl Into<String>) -> Self {
        DirectoryError::Lookup(reason.into())
    }
}

/// Host-application directory of users and organizations.
#[async_trait]
pub trait Directory: Send + Sync + fmt::Debug {
    /// Resolve a principal by id. `Ok(None)` when no such record exists.
    async fn get_by_id(
        &self,
        ctx: &RequestContext,
        kind: PrincipalKind,
        id: &str,
    ) -> Result<Option<DirectoryRecord>, DirectoryError>;

    /// Organizations in which `user` holds every permission named in
    /// `permissions`.
    ///
    /// The default body reports the resolver as unwired, which the access
    /// controller turns into a closed-fail denial. Hosts that declare
    /// `ReadAccess::Permission` channels must override this.
    async fn permitted_organizations(
        &self,
        ctx: &RequestContext,
        user: &DirectoryRecord,
        permissions: &[&str],
    ) -> Result<Vec<String>, DirectoryError> {
        let _ = (ctx, user, permissions);
        Err(DirectoryError::NoPermissionResolver)
    }
}
