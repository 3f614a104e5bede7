use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{ApiError, FunctionApi, FunctionPatch, FunctionRecord};
use crate::types::{FunctionName, Namespace};

/// Header selecting the namespace a request operates on.
pub const NAMESPACE_HEADER: &str = "x-function-namespace";

/// Connection settings for [`HttpFunctionApi`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra headers sent verbatim with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8070".to_string(),
            request_timeout: Duration::from_secs(60),
            token: None,
            username: None,
            password: None,
            headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    fn default_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();

        if let Some(token) = &self.token {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        } else if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or_default();
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            headers.insert(AUTHORIZATION, header_value(&format!("Basic {}", encoded))?);
        }

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::InvalidRequest(format!("header `{}`: {}", name, e)))?;
            headers.insert(name, header_value(value)?);
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

/// [`FunctionApi`] backed by the platform's HTTP API.
#[derive(Clone)]
pub struct HttpFunctionApi {
    base_url: Url,
    client: Client,
}

impl HttpFunctionApi {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ApiError::InvalidRequest(format!("api url `{}`: {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidRequest(format!(
                "api url `{}` cannot be used as a base",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("fnctl/", env!("CARGO_PKG_VERSION")))
            .default_headers(config.default_headers()?)
            .build()?;

        Ok(Self { base_url, client })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ApiError::InvalidRequest(format!("api url `{}` cannot be a base", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn functions_url(&self, name: Option<&FunctionName>) -> Result<Url, ApiError> {
        match name {
            Some(name) => self.endpoint(&["api", "functions", name.as_str()]),
            None => self.endpoint(&["api", "functions"]),
        }
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status,
        body: body.trim().to_string(),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl FunctionApi for HttpFunctionApi {
    async fn list_functions(
        &self,
        namespace: &Namespace,
        label_selector: Option<&str>,
    ) -> Result<Vec<FunctionRecord>, ApiError> {
        let mut url = self.functions_url(None)?;
        if let Some(selector) = label_selector {
            url.query_pairs_mut().append_pair("labelSelector", selector);
        }
        debug!(%url, %namespace, "Listing functions");

        let response = self
            .client
            .get(url)
            .header(NAMESPACE_HEADER, namespace.as_str())
            .send()
            .await?;

        let by_name: BTreeMap<String, FunctionRecord> =
            decode(check_status(response).await?).await?;

        Ok(by_name
            .into_iter()
            .map(|(name, mut record)| {
                if record.metadata.name.is_empty() {
                    record.metadata.name = name;
                }
                record
            })
            .collect())
    }

    async fn get_function(
        &self,
        namespace: &Namespace,
        name: &FunctionName,
    ) -> Result<FunctionRecord, ApiError> {
        let url = self.functions_url(Some(name))?;
        let response = self
            .client
            .get(url)
            .header(NAMESPACE_HEADER, namespace.as_str())
            .send()
            .await?;

        let mut record: FunctionRecord = decode(check_status(response).await?).await?;
        if record.metadata.name.is_empty() {
            record.metadata.name = name.to_string();
        }
        Ok(record)
    }

    async fn patch_function(
        &self,
        namespace: &Namespace,
        name: &FunctionName,
        patch: &FunctionPatch,
    ) -> Result<(), ApiError> {
        let url = self.functions_url(Some(name))?;
        debug!(%url, %namespace, desired_state = %patch.desired_state, "Patching function");

        let response = self
            .client
            .patch(url)
            .header(NAMESPACE_HEADER, namespace.as_str())
            .json(patch)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
