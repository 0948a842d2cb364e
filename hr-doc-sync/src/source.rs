//! # Source client (Taleo Business Edition REST)
//!
//! Implements [`SourceClient`] over the Taleo REST API with `reqwest`.
//!
//! - `authenticate` resolves the organisation's service URL through the dispatcher
//!   (unless one is configured), logs in and keeps the auth token for later calls.
//! - Every request carries the token as the `authToken` cookie.
//! - Response bodies are parsed as loose JSON; the `parse_*` helpers are public so the
//!   mapping can be tested without a server.

use async_trait::async_trait;
use hr_doc_sync_core::contract::{
    ClientError, DocumentKind, DocumentRecord, SourceClient, SubjectRecord, SubjectStatus,
};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    #[serde(default = "default_dispatcher_url")]
    pub dispatcher_url: String,
    /// Skips dispatcher resolution when set.
    #[serde(default)]
    pub service_url: Option<String>,
    pub org_code: String,
    pub username: String,
    /// Injected from the environment, never read from the file.
    #[serde(skip)]
    pub password: String,
    /// Activity statuses that count as signed or complete.
    #[serde(default = "default_completed_statuses")]
    pub completed_statuses: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_dispatcher_url() -> String {
    "https://tbe.taleo.net/MANAGER/dispatcher/api/v1/serviceUrl".to_string()
}

fn default_completed_statuses() -> Vec<String> {
    vec![
        "Complete".to_string(),
        "Completed".to_string(),
        "Signed".to_string(),
    ]
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone)]
struct Session {
    base_url: String,
    token: String,
}

pub struct TaleoClient {
    http: reqwest::Client,
    settings: SourceSettings,
    session: RwLock<Option<Session>>,
}

impl TaleoClient {
    pub fn new(settings: SourceSettings) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            settings,
            session: RwLock::new(None),
        })
    }

    async fn session(&self) -> Result<Session, ClientError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| "source client is not authenticated".into())
    }

    async fn service_url(&self) -> Result<String, ClientError> {
        if let Some(url) = &self.settings.service_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let url = format!(
            "{}/{}",
            self.settings.dispatcher_url.trim_end_matches('/'),
            self.settings.org_code
        );
        let body: Value = checked(self.http.get(&url).send().await?)
            .await?
            .json()
            .await?;
        let service = body
            .pointer("/response/URL")
            .and_then(Value::as_str)
            .ok_or("dispatcher response has no service URL")?;
        Ok(service.trim_end_matches('/').to_string())
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ClientError> {
        let session = self.session().await?;
        let response = self
            .http
            .get(format!("{}/{}", session.base_url, path))
            .header(
                reqwest::header::COOKIE,
                format!("authToken={}", session.token),
            )
            .query(query)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }
}

/// Maps a non-success status to an error carrying the response body.
async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    tracing::error!(%status, %url, body = %body, "[SOURCE][ERROR] Request failed");
    Err(format!("{url} returned {status}: {body}").into())
}

#[async_trait]
impl SourceClient for TaleoClient {
    async fn authenticate(&self) -> Result<(), ClientError> {
        let base_url = self.service_url().await?;
        tracing::info!(
            org_code = %self.settings.org_code,
            username = %self.settings.username,
            "[SOURCE] Logging in"
        );
        let response = self
            .http
            .post(format!("{base_url}/login"))
            .query(&[
                ("orgCode", self.settings.org_code.as_str()),
                ("userName", self.settings.username.as_str()),
                ("password", self.settings.password.as_str()),
            ])
            .send()
            .await?;
        let body: Value = checked(response).await?.json().await?;
        let token = body
            .pointer("/response/authToken")
            .and_then(Value::as_str)
            .ok_or("login response has no auth token")?
            .to_string();

        *self.session.write().await = Some(Session { base_url, token });
        tracing::info!("[SOURCE] Received auth token");
        Ok(())
    }

    async fn list_page(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<Vec<SubjectRecord>, ClientError> {
        let body = self
            .get_json(
                "object/employee/search",
                &[
                    ("start", cursor.to_string()),
                    ("limit", page_size.to_string()),
                ],
            )
            .await?;
        Ok(entities(&body, "searchResults", "employee")
            .filter_map(parse_employee)
            .collect())
    }

    async fn list_documents(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        let packets = self
            .get_json(&format!("object/employee/{}/packets", subject.id), &[])
            .await?;
        let packet_ids: Vec<i64> = entities(&packets, "packets", "packet")
            .filter_map(|p| p.get("id").and_then(as_i64))
            .collect();

        let mut documents = Vec::new();
        for packet_id in packet_ids {
            let body = self
                .get_json(
                    &format!("object/employee/{}/packet/{packet_id}/activities", subject.id),
                    &[],
                )
                .await?;
            let activities: Vec<DocumentRecord> = entities(&body, "activities", "activity")
                .filter_map(|a| {
                    parse_activity(subject.id, packet_id, a, &self.settings.completed_statuses)
                })
                .collect();
            tracing::info!(
                subject_id = subject.id,
                packet_id,
                activities = activities.len(),
                "[SOURCE] Listed packet activities"
            );
            documents.extend(activities);
        }
        Ok(documents)
    }

    async fn list_attachments(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        let body = self
            .get_json(&format!("object/employee/{}/attachment", subject.id), &[])
            .await?;
        Ok(entities(&body, "attachments", "attachment")
            .filter_map(|a| parse_attachment(subject.id, a))
            .collect())
    }

    async fn download(&self, document: &DocumentRecord, sink: &Path) -> Result<u64, ClientError> {
        let session = self.session().await?;
        let response = self
            .http
            .get(format!("{}/object/{}", session.base_url, document.content_ref))
            .header(
                reqwest::header::COOKIE,
                format!("authToken={}", session.token),
            )
            .send()
            .await?;
        let bytes = checked(response).await?.bytes().await?;
        tokio::fs::write(sink, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn close(&self) -> Result<(), ClientError> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{}/logout", session.base_url))
            .header(
                reqwest::header::COOKIE,
                format!("authToken={}", session.token),
            )
            .send()
            .await?;
        checked(response).await?;
        tracing::info!("[SOURCE] Logged out");
        Ok(())
    }
}

/// Items of `response.{list}`, each unwrapped from its `{entity: {...}}` envelope.
pub fn entities<'a>(
    body: &'a Value,
    list: &str,
    entity: &'a str,
) -> impl Iterator<Item = &'a Value> {
    body.get("response")
        .and_then(|r| r.get(list))
        .and_then(Value::as_array)
        .map(|items| items.as_slice())
        .unwrap_or_default()
        .iter()
        .map(move |item| item.get(entity).unwrap_or(item))
}

fn as_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn text(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_employee(value: &Value) -> Option<SubjectRecord> {
    let id = value.get("id").and_then(as_i64)?;
    Some(SubjectRecord {
        id,
        first_name: text(value, "firstName").unwrap_or_default(),
        last_name: text(value, "lastName").unwrap_or_default(),
        location_id: value.get("location").and_then(as_i64),
        external_key: text(value, "ssn"),
        status: value
            .get("status")
            .and_then(as_i64)
            .map(SubjectStatus::from_code)
            .unwrap_or(SubjectStatus::Unknown),
        department_id: text(value, "department"),
        created_at: text(value, "creationDate"),
        start_date: text(value, "startDate"),
    })
}

pub fn parse_activity(
    subject_id: i64,
    packet_id: i64,
    value: &Value,
    completed_statuses: &[String],
) -> Option<DocumentRecord> {
    let id = value.get("id").and_then(as_i64)?;
    let status = text(value, "status").unwrap_or_default();
    let signed_or_complete = completed_statuses
        .iter()
        .any(|s| s.eq_ignore_ascii_case(&status));
    Some(DocumentRecord {
        id,
        kind: DocumentKind::Activity,
        title: text(value, "title").unwrap_or_default(),
        subject_id,
        signed_or_complete,
        content_ref: format!("employee/{subject_id}/packet/{packet_id}/activity/{id}/download"),
        attachment_type: None,
        file_name: None,
    })
}

pub fn parse_attachment(subject_id: i64, value: &Value) -> Option<DocumentRecord> {
    let id = value.get("id").and_then(as_i64)?;
    Some(DocumentRecord {
        id,
        kind: DocumentKind::Attachment,
        title: text(value, "description").unwrap_or_default(),
        subject_id,
        signed_or_complete: true,
        content_ref: format!("employee/{subject_id}/attachment/{id}/data"),
        attachment_type: text(value, "attachmentType"),
        file_name: text(value, "fileName"),
    })
}
