use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, header};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::records::{
    ChangeBatch, ChangeScope, Identity, ItemCategory, ItemWrite, Project, ProjectAction,
    RemoteItem,
};
use crate::remote::{BackendError, IdentityProvider, MetadataStore, ObjectStore};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// REST client for the project backend: metadata, objects and permissions.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base_url: Url,
    token: String,
    identity: Option<Identity>,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            request: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HttpBackend {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_timeouts(base_url, token, HttpTimeouts::default())
    }

    pub fn with_timeouts(
        base_url: &str,
        token: impl Into<String>,
        timeouts: HttpTimeouts,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
            identity: None,
        })
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    fn endpoint<'a, I>(&self, segments: I) -> Result<Url, BackendError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn item_endpoint(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: Option<&str>,
    ) -> Result<Url, BackendError> {
        let mut segments = vec!["v1", "projects", project_id, category.as_str()];
        if let Some(name) = name {
            segments.push(name);
        }
        self.endpoint(segments)
    }

    fn object_endpoint(&self, locator: &str) -> Result<Url, BackendError> {
        let segments = ["v1", "objects"]
            .into_iter()
            .chain(locator.split('/').filter(|part| !part.is_empty()));
        self.endpoint(segments)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(header::AUTHORIZATION, format!("Bearer {}", self.token))
    }

    async fn handle_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::check(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Api { status, body })
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ObjectStat {
    size: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct PermissionAnswer {
    allowed: bool,
}

#[async_trait]
impl MetadataStore for HttpBackend {
    async fn list_projects(&self, identity: &str) -> Result<Vec<Project>, BackendError> {
        let mut url = self.endpoint(["v1", "projects"])?;
        url.query_pairs_mut().append_pair("identity", identity);
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_json(response).await
    }

    async fn list_items(
        &self,
        project_id: &str,
        category: ItemCategory,
    ) -> Result<Vec<RemoteItem>, BackendError> {
        let url = self.item_endpoint(project_id, category, None)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_json(response).await
    }

    async fn get_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<Option<RemoteItem>, BackendError> {
        let url = self.item_endpoint(project_id, category, Some(name))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_json(response).await?))
    }

    async fn upsert_item(&self, item: &ItemWrite) -> Result<RemoteItem, BackendError> {
        let url = self.item_endpoint(&item.project_id, item.category, Some(&item.name))?;
        let response = self
            .authorized(self.http.put(url))
            .json(item)
            .send()
            .await?;
        Self::handle_json(response).await
    }

    async fn delete_item(
        &self,
        project_id: &str,
        category: ItemCategory,
        name: &str,
    ) -> Result<(), BackendError> {
        let url = self.item_endpoint(project_id, category, Some(name))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(format!("{project_id}/{category}/{name}")));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn poll_changes(
        &self,
        scope: &ChangeScope,
        anchor: Option<&str>,
    ) -> Result<ChangeBatch, BackendError> {
        let mut url = self.endpoint(["v1", "changes"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("scope", &scope.key());
            if let Some(anchor) = anchor {
                query.append_pair("anchor", anchor);
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_json(response).await
    }
}

#[async_trait]
impl ObjectStore for HttpBackend {
    async fn object_size(&self, locator: &str) -> Result<u64, BackendError> {
        let mut url = self.object_endpoint(locator)?;
        url.query_pairs_mut().append_pair("stat", "true");
        let response = self.authorized(self.http.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(locator.to_string()));
        }
        let stat: ObjectStat = Self::handle_json(response).await?;
        Ok(stat.size)
    }

    async fn read_object(&self, locator: &str) -> Result<Vec<u8>, BackendError> {
        let url = self.object_endpoint(locator)?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let response = Self::check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn read_range(
        &self,
        locator: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, BackendError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let url = self.object_endpoint(locator)?;
        let last = offset.saturating_add(len - 1);
        let response = self
            .authorized(self.http.get(url))
            .header(header::RANGE, format!("bytes={offset}-{last}"))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let bytes = response.bytes().await?;
        if bytes.len() as u64 > len {
            return Err(BackendError::Malformed(format!(
                "range {offset}-{last} returned {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }

    async fn write_object(&self, locator: &str, bytes: Vec<u8>) -> Result<(), BackendError> {
        let url = self.object_endpoint(locator)?;
        let response = self
            .authorized(self.http.put(url))
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn write_part(
        &self,
        locator: &str,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        let mut url = self.object_endpoint(locator)?;
        url.query_pairs_mut()
            .append_pair("part", &part_number.to_string());
        let response = self
            .authorized(self.http.put(url))
            .body(bytes)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn complete_multipart(&self, locator: &str, parts: u32) -> Result<(), BackendError> {
        let mut url = self.object_endpoint(locator)?;
        url.query_pairs_mut().append_pair("parts", &parts.to_string());
        let response = self.authorized(self.http.post(url)).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_object(&self, locator: &str) -> Result<(), BackendError> {
        let url = self.object_endpoint(locator)?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(locator.to_string()));
        }
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for HttpBackend {
    fn identity(&self) -> Option<Identity> {
        self.identity.clone()
    }

    async fn has_permission(
        &self,
        project_id: &str,
        action: ProjectAction,
    ) -> Result<bool, BackendError> {
        let url = self.endpoint(["v1", "projects", project_id, "permissions", action.as_str()])?;
        let response = self.authorized(self.http.get(url)).send().await?;
        if matches!(
            response.status(),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            return Ok(false);
        }
        let answer: PermissionAnswer = Self::handle_json(response).await?;
        Ok(answer.allowed)
    }
}
