use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use crate::records::{
    ChangeBatch, ChangeScope, Identity, ItemCategory, ItemWrite, Project, ProjectAction,
    RemoteItem,
};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl BackendError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            BackendError::Api { status, .. } => classify_api_status(*status),
            BackendError::Request(_) | BackendError::Unavailable(_) => ApiErrorClass::Transient,
            BackendError::Url(_) | BackendError::NotFound(_) | BackendError::Malformed(_) => {
                ApiErrorClass::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::Api { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }
}

pub(crate) fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Project and item records plus the change feed.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_projects(&self, identity: &str) -> Result<Vec<Project>, BackendError>;

    async fn list_items(
        &self,
        project_id: &str,
        category: ItemCategory,
    ) -> Result<Vec<RemoteItem>, BackendError>;

    async fn get_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<Option<RemoteItem>, BackendError>;

    async fn upsert_item(&self, item: &ItemWrite) -> Result<RemoteItem, BackendError>;

    async fn delete_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<(), BackendError>;

    /// Changes after `anchor`; `None` starts from the store's current head.
    async fn poll_changes(
        &self,
        scope: &ChangeScope,
        anchor: Option<&str>,
    ) -> Result<ChangeBatch, BackendError>;
}

/// Content bytes addressed by locator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn object_size(&self, locator: &str) -> Result<u64, BackendError>;

    async fn read_object(&self, locator: &str) -> Result<Vec<u8>, BackendError>;

    async fn read_range(
        &self,
        locator: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError>;

    async fn write_object(&self, locator: &str, bytes: Vec<u8>) -> Result<(), BackendError>;

    /// Stages part `part_number` (starting at 0) of a multipart write.
    async fn write_part(
        &self,
        locator: &str,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError>;

    async fn complete_multipart(&self, locator: &str, parts: u32) -> Result<(), BackendError>;

    async fn delete_object(&self, locator: &str) -> Result<(), BackendError>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn identity(&self) -> Option<Identity>;

    fn is_authenticated(&self) -> bool {
        self.identity().is_some()
    }

    async fn has_permission(
        &self,
        project_id: &str,
        action: ProjectAction,
    ) -> Result<bool, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses_like_transfer_policy() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNPROCESSABLE_ENTITY),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn unavailable_is_retryable_and_not_found_is_not() {
        assert!(BackendError::Unavailable("down".into()).is_retryable());
        let missing = BackendError::NotFound("x".into());
        assert!(!missing.is_retryable());
        assert!(missing.is_not_found());
    }
}
