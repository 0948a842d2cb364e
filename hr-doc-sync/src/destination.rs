//! # Destination client (SpringCM REST)
//!
//! Implements [`DestinationClient`] over the SpringCM v201606 API with `reqwest`.
//!
//! Endpoint hosts are derived from the configured data center (`na11`, `uatna11`, ...)
//! unless overridden. `authenticate` exchanges the client credentials for a bearer token
//! that every later call carries.
//!
//! Reference extracts are downloaded once per run and parsed with `csv`;
//! [`DestinationClient::lookup_by_key`] then filters the cached rows in memory.

use async_trait::async_trait;
use hr_doc_sync_core::contract::{
    ClientError, DestinationClient, DocumentAttributes, DocumentHandle, FolderHandle, ReferenceRow,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const API_VERSION: &str = "v201606";

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSettings {
    pub data_center: String,
    pub client_id: String,
    /// Injected from the environment, never read from the file.
    #[serde(skip)]
    pub client_secret: String,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    300
}

/// Resolved endpoint roots, without trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub auth: String,
    pub api: String,
    pub upload: String,
    pub download: String,
}

impl DestinationSettings {
    pub fn endpoints(&self) -> Endpoints {
        let dc = self.data_center.trim().to_ascii_lowercase();
        let auth_host = if dc.starts_with("uat") {
            "authuat"
        } else {
            "auth"
        };
        let host = |service: &str| format!("https://{service}{dc}.springcm.com/{API_VERSION}");
        let pick = |explicit: &Option<String>, derived: String| {
            explicit
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(derived)
        };
        tracing::debug!(data_center = %dc, "[DESTINATION] Derived endpoints");
        Endpoints {
            auth: pick(
                &self.auth_url,
                format!("https://{auth_host}.springcm.com/api/{API_VERSION}/apiuser"),
            ),
            api: pick(&self.api_url, host("api")),
            upload: pick(&self.upload_url, host("upload")),
            download: pick(&self.download_url, host("download")),
        }
    }
}

pub struct SpringCmClient {
    http: reqwest::Client,
    settings: DestinationSettings,
    endpoints: Endpoints,
    token: RwLock<Option<String>>,
    extracts: Mutex<HashMap<String, Arc<Vec<ReferenceRow>>>>,
}

impl SpringCmClient {
    pub fn new(settings: DestinationSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let endpoints = settings.endpoints();
        Ok(Self {
            http,
            settings,
            endpoints,
            token: RwLock::new(None),
            extracts: Mutex::new(HashMap::new()),
        })
    }

    async fn bearer(&self) -> Result<String, ClientError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| "destination client is not authenticated".into())
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Value>, ClientError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(self.bearer().await?)
            .query(query)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(checked(response).await?.json().await?))
    }

    async fn upload_bytes(
        &self,
        url: String,
        content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError> {
        let bytes = tokio::fs::read(content).await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.bearer().await?)
            .query(&[("name", file_name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        parse_document(&checked(response).await?.json::<Value>().await?)
    }

    async fn extract_rows(
        &self,
        reference: &DocumentHandle,
    ) -> Result<Arc<Vec<ReferenceRow>>, ClientError> {
        let mut extracts = self.extracts.lock().await;
        if let Some(rows) = extracts.get(&reference.id) {
            return Ok(rows.clone());
        }

        let response = self
            .http
            .get(format!("{}/documents/{}", self.endpoints.download, reference.id))
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;
        let body = checked(response).await?.bytes().await?;
        let rows = Arc::new(parse_extract(&body)?);
        tracing::info!(
            path = %reference.path,
            rows = rows.len(),
            "[DESTINATION] Loaded reference extract"
        );
        extracts.insert(reference.id.clone(), rows.clone());
        Ok(rows)
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(%status, %url, body = %body, "[DESTINATION][ERROR] Request failed");
    Err(format!("{url} returned {status}: {body}").into())
}

/// Id is the last segment of the entity's `Href`.
fn href_id(value: &Value) -> Option<String> {
    value
        .get("Href")
        .and_then(Value::as_str)
        .and_then(|href| href.trim_end_matches('/').rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn parse_document(value: &Value) -> Result<DocumentHandle, ClientError> {
    let id = href_id(value).ok_or("document response has no Href")?;
    let path = value
        .get("Path")
        .or_else(|| value.get("Name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let page_count = value
        .get("PageCount")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    Ok(DocumentHandle {
        id,
        path,
        page_count,
    })
}

pub fn parse_folder(value: &Value, path: &str) -> Result<FolderHandle, ClientError> {
    let id = href_id(value).ok_or("folder response has no Href")?;
    Ok(FolderHandle {
        id,
        path: path.to_string(),
    })
}

/// Rows of a headered CSV, keyed by trimmed header.
pub fn parse_extract(bytes: &[u8]) -> Result<Vec<ReferenceRow>, ClientError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: ReferenceRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.trim().to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn matching_rows(rows: &[ReferenceRow], column: &str, value: &str) -> Vec<ReferenceRow> {
    rows.iter()
        .filter(|row| row.get(column).is_some_and(|v| v == value))
        .cloned()
        .collect()
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", path),
    }
}

#[async_trait]
impl DestinationClient for SpringCmClient {
    async fn authenticate(&self) -> Result<(), ClientError> {
        tracing::info!(
            client_id = %self.settings.client_id,
            data_center = %self.settings.data_center,
            "[DESTINATION] Connecting"
        );
        let response = self
            .http
            .post(&self.endpoints.auth)
            .json(&json!({
                "client_id": self.settings.client_id,
                "client_secret": self.settings.client_secret,
            }))
            .send()
            .await?;
        let body: Value = checked(response).await?.json().await?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or("auth response has no access token")?
            .to_string();
        *self.token.write().await = Some(token);
        tracing::info!("[DESTINATION] Authenticated");
        Ok(())
    }

    async fn resolve_path(&self, path: &str) -> Result<Option<DocumentHandle>, ClientError> {
        let url = format!("{}/documents", self.endpoints.api);
        match self.get_json(&url, &[("path", path)]).await? {
            Some(body) => {
                let mut document = parse_document(&body)?;
                if document.path.is_empty() {
                    document.path = path.to_string();
                }
                Ok(Some(document))
            }
            None => Ok(None),
        }
    }

    async fn resolve_folder(&self, path: &str) -> Result<FolderHandle, ClientError> {
        let url = format!("{}/folders", self.endpoints.api);
        let body = self
            .get_json(&url, &[("path", path)])
            .await?
            .ok_or_else(|| format!("folder {path} not found"))?;
        parse_folder(&body, path)
    }

    async fn upload(
        &self,
        folder: &FolderHandle,
        content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError> {
        let url = format!("{}/folders/{}/documents", self.endpoints.upload, folder.id);
        self.upload_bytes(url, content, file_name).await
    }

    async fn set_metadata(
        &self,
        document: &DocumentHandle,
        attributes: &DocumentAttributes,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .patch(format!("{}/documents/{}", self.endpoints.api, document.id))
            .bearer_auth(self.bearer().await?)
            .json(&json!({ "AttributeGroups": attributes.to_json() }))
            .send()
            .await?;
        checked(response).await?;
        Ok(())
    }

    async fn lookup_by_key(
        &self,
        reference: &DocumentHandle,
        column: &str,
        value: &str,
    ) -> Result<Vec<ReferenceRow>, ClientError> {
        let rows = self.extract_rows(reference).await?;
        Ok(matching_rows(&rows, column, value))
    }

    async fn check_in(
        &self,
        path: &str,
        content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError> {
        if let Some(existing) = self.resolve_path(path).await? {
            let url = format!("{}/documents/{}", self.endpoints.upload, existing.id);
            tracing::info!(path, "[DESTINATION] Checking in new version");
            return self.upload_bytes(url, content, file_name).await;
        }
        let (parent, name) = split_path(path);
        let folder = self.resolve_folder(parent).await?;
        tracing::info!(path, "[DESTINATION] Creating document");
        self.upload(&folder, content, name).await
    }

    async fn document_by_uid(&self, uid: &str) -> Result<DocumentHandle, ClientError> {
        let url = format!("{}/documents/{uid}", self.endpoints.api);
        let body = self
            .get_json(&url, &[])
            .await?
            .ok_or_else(|| format!("document {uid} not found"))?;
        parse_document(&body)
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.token.write().await.take();
        self.extracts.lock().await.clear();
        tracing::info!("[DESTINATION] Closed session");
        Ok(())
    }
}
