//! REST client for the Cloud Director CloudAPI

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use super::api::CloudDirectorApi;
use super::types::{
    ExternalObject, Operation, ResourceKind, ResourceRequest, Submission, Task, TaskHandle,
    TaskStatus,
};
use crate::config::PlatformConfig;
use crate::error::{Error, Result};

const CLOUDAPI_PREFIX: &str = "cloudapi/1.0.0";

#[derive(Deserialize)]
struct Page {
    #[serde(default)]
    values: Vec<ExternalObject>,
}

#[derive(Deserialize)]
struct TaskBody {
    status: String,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Deserialize)]
struct TaskError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    minor_error_code: String,
    #[serde(default)]
    message: String,
}

/// Client for one Cloud Director endpoint, authenticated with an API token
pub struct VcdClient {
    http_client: Client,
    base_url: String,
    token: Option<String>,
}

impl VcdClient {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let accept = format!("application/json;version={}", config.api_version);
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&accept)
                .map_err(|e| Error::ConfigError(format!("Invalid API version: {e}")))?,
        );

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/{}/{}", self.base_url, CLOUDAPI_PREFIX, kind.collection())
    }

    fn object_url(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}/{}", self.collection_url(kind), id)
    }

    fn task_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!("{}/{}", self.base_url, href.trim_start_matches('/'))
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Interpret the answer to a mutating call
    async fn submission(response: Response, operation: String) -> Result<Submission> {
        let status = response.status();
        match status {
            StatusCode::ACCEPTED => {
                let href = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match href {
                    Some(href) => Ok(Submission::Task(TaskHandle { href, operation })),
                    None => Ok(Submission::Completed),
                }
            }
            s if s.is_success() => Ok(Submission::Completed),
            StatusCode::NOT_FOUND => Ok(Submission::NotFound),
            StatusCode::CONFLICT => {
                let body = error_body(response).await;
                match body.minor_error_code.as_str() {
                    "DUPLICATE_NAME" => Ok(Submission::AlreadyExists),
                    "BUSY_ENTITY" => Ok(Submission::Busy),
                    _ => Err(Error::platform(409, body.minor_error_code, body.message)),
                }
            }
            _ => Err(platform_error(response).await),
        }
    }
}

async fn error_body(response: Response) -> ErrorBody {
    response.json::<ErrorBody>().await.unwrap_or_default()
}

async fn platform_error(response: Response) -> Error {
    let status = response.status().as_u16();
    let body = error_body(response).await;
    Error::platform(status, body.minor_error_code, body.message)
}

#[async_trait]
impl CloudDirectorApi for VcdClient {
    #[instrument(skip(self))]
    async fn find(&self, kind: ResourceKind, name: &str) -> Result<Option<ExternalObject>> {
        let response = self
            .authorize(self.http_client.get(self.collection_url(kind)))
            .query(&[("filter", format!("name=={name}"))])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(platform_error(response).await);
        }

        let page: Page = response.json().await?;
        Ok(page.values.into_iter().find(|o| o.name == name))
    }

    #[instrument(skip(self, request), fields(kind = %request.kind(), name = request.name()))]
    async fn create(&self, request: &ResourceRequest) -> Result<Submission> {
        let body = request.body()?;
        let response = self
            .authorize(self.http_client.post(self.collection_url(request.kind())))
            .json(&body)
            .send()
            .await?;
        debug!(status = %response.status(), "create submitted");
        Self::submission(
            response,
            format!("create {} {}", request.kind(), request.name()),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<Submission> {
        let response = self
            .authorize(self.http_client.delete(self.object_url(kind, id)))
            .send()
            .await?;
        Self::submission(response, format!("delete {kind} {id}")).await
    }

    #[instrument(skip(self, operation), fields(verb = operation.verb()))]
    async fn act(&self, kind: ResourceKind, id: &str, operation: &Operation) -> Result<Submission> {
        let url = format!("{}/actions/{}", self.object_url(kind, id), operation.verb());
        let response = self
            .authorize(self.http_client.post(url))
            .json(&operation.body())
            .send()
            .await?;
        Self::submission(response, format!("{} {kind} {id}", operation.verb())).await
    }

    async fn task(&self, handle: &TaskHandle) -> Result<Task> {
        let response = self
            .authorize(self.http_client.get(self.task_url(&handle.href)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(platform_error(response).await);
        }

        let body: TaskBody = response.json().await?;
        Ok(Task {
            status: TaskStatus::from_platform(&body.status),
            message: body.error.map(|e| e.message).filter(|m| !m.is_empty()),
        })
    }
}
