//! # contract: collaborator interfaces and the records that flow between them
//!
//! This module defines the three seams the synchronisation engine talks through:
//!
//! - [`SourceClient`]: the HR source-of-record (paged subject listing, sub-resource
//!   listing, binary download).
//! - [`DestinationClient`]: the document-management store (path/folder resolution,
//!   upload, metadata tagging, reference-extract lookup).
//! - [`Ledger`]: the durable table of delivered documents.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the mocks are exported behind the default
//!   `test-export-mocks` feature so integration tests and the CLI crate can use them.
//!
//! ## Error Types
//! - Client calls return [`ClientError`] (boxed, `Send + Sync`), the same shape the
//!   vendor adapters produce.
//! - Ledger calls return [`LedgerError`], which distinguishes a duplicate key from a
//!   storage failure.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::classify::Classification;

/// Error type returned by source and destination clients.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// One row of the reference extract, keyed by column header.
pub type ReferenceRow = BTreeMap<String, String>;

/// Employment status as reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubjectStatus {
    Employed,
    Terminated,
    #[serde(rename = "Pre-Boarding")]
    PreBoarding,
    Unknown,
}

impl SubjectStatus {
    /// Maps the source's numeric status code.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => SubjectStatus::Employed,
            2 => SubjectStatus::Terminated,
            6 => SubjectStatus::PreBoarding,
            _ => SubjectStatus::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubjectStatus::Employed => "Employed",
            SubjectStatus::Terminated => "Terminated",
            SubjectStatus::PreBoarding => "Pre-Boarding",
            SubjectStatus::Unknown => "Unknown",
        }
    }
}

/// A subject (employee or applicant) as listed by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub location_id: Option<i64>,
    /// SSN or equivalent key into the reference extract.
    pub external_key: Option<String>,
    pub status: SubjectStatus,
    pub department_id: Option<String>,
    pub created_at: Option<String>,
    pub start_date: Option<String>,
}

impl SubjectRecord {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Sub-resource flavours. Ids are only unique within one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// A form completed as part of an onboarding packet.
    Activity,
    /// A file attached directly to the subject.
    Attachment,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Activity => "activity",
            DocumentKind::Attachment => "attachment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "activity" => Some(DocumentKind::Activity),
            "attachment" => Some(DocumentKind::Attachment),
            _ => None,
        }
    }
}

/// Ledger key: the document id qualified by its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub kind: DocumentKind,
    pub id: i64,
}

impl DocumentKey {
    pub fn activity(id: i64) -> Self {
        Self {
            kind: DocumentKind::Activity,
            id,
        }
    }

    pub fn attachment(id: i64) -> Self {
        Self {
            kind: DocumentKind::Attachment,
            id,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// A file-bearing sub-resource of a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: i64,
    pub kind: DocumentKind,
    /// Activity title, or attachment description.
    pub title: String,
    pub subject_id: i64,
    pub signed_or_complete: bool,
    /// Opaque download handle understood by the source client.
    pub content_ref: String,
    pub attachment_type: Option<String>,
    pub file_name: Option<String>,
}

impl DocumentRecord {
    pub fn key(&self) -> DocumentKey {
        DocumentKey {
            kind: self.kind,
            id: self.id,
        }
    }
}

/// A folder in the destination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderHandle {
    pub id: String,
    pub path: String,
}

/// A document in the destination store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: String,
    pub path: String,
    pub page_count: u32,
}

/// Metadata written to a delivered document: subject fields from the reference
/// extract plus the classification triple, grouped under one attribute group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentAttributes {
    pub group: String,
    pub subject_fields: BTreeMap<String, String>,
    pub classification: Classification,
}

impl DocumentAttributes {
    /// Nested `group -> set -> field -> {"Value": ..}` layout used by the store's
    /// attribute API.
    pub fn to_json(&self) -> serde_json::Value {
        let subject: serde_json::Map<String, serde_json::Value> = self
            .subject_fields
            .iter()
            .map(|(field, value)| (field.clone(), serde_json::json!({ "Value": value })))
            .collect();

        let sets = serde_json::json!({
            "Employee Data": subject,
            "Category": {
                "Document Name": { "Value": self.classification.document_name },
                "SubCategory": { "Value": self.classification.subcategory },
                "Category": { "Value": self.classification.category },
            }
        });

        let mut groups = serde_json::Map::new();
        groups.insert(self.group.clone(), sets);
        serde_json::Value::Object(groups)
    }
}

/// Client for the HR source-of-record.
///
/// `list_page` takes a 1-based start offset; the caller advances it by the number of
/// records returned, so implementations never need to report a next cursor.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), ClientError>;

    async fn list_page(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<Vec<SubjectRecord>, ClientError>;

    /// All packet activities for the subject, flattened across packets.
    async fn list_documents(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError>;

    async fn list_attachments(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError>;

    /// Writes the document's content to `sink`, returning the number of bytes written.
    async fn download(&self, document: &DocumentRecord, sink: &Path) -> Result<u64, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// Client for the destination document store.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DestinationClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), ClientError>;

    /// Looks up a document by full path; `Ok(None)` when nothing exists there.
    async fn resolve_path(&self, path: &str) -> Result<Option<DocumentHandle>, ClientError>;

    async fn resolve_folder(&self, path: &str) -> Result<FolderHandle, ClientError>;

    async fn upload(
        &self,
        folder: &FolderHandle,
        content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError>;

    async fn set_metadata(
        &self,
        document: &DocumentHandle,
        attributes: &DocumentAttributes,
    ) -> Result<(), ClientError>;

    /// Rows of a tabular reference document whose `column` equals `value`.
    async fn lookup_by_key(
        &self,
        reference: &DocumentHandle,
        column: &str,
        value: &str,
    ) -> Result<Vec<ReferenceRow>, ClientError>;

    /// Replaces the document at `path` with new content, creating it if absent.
    async fn check_in(
        &self,
        path: &str,
        content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError>;

    async fn document_by_uid(&self, uid: &str) -> Result<DocumentHandle, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

/// A delivered document, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub key: DocumentKey,
    pub subject_id: i64,
    pub title: String,
    pub page_count: u32,
    pub subject_display_name: String,
    pub exception_flag: bool,
    pub attachment_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("document {0} is already recorded in the ledger")]
    DuplicateKey(DocumentKey),
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Durable record of delivered documents.
///
/// `record` must fail with [`LedgerError::DuplicateKey`] when the key already exists
/// and leave the stored entry untouched.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Verifies the connection and creates the schema if needed.
    async fn prepare(&self) -> Result<(), LedgerError>;

    async fn exists(&self, key: &DocumentKey) -> Result<bool, LedgerError>;

    async fn entry(&self, key: &DocumentKey) -> Result<Option<LedgerEntry>, LedgerError>;

    async fn record(&self, entry: LedgerEntry) -> Result<(), LedgerError>;

    async fn close(&self) -> Result<(), LedgerError>;
}
