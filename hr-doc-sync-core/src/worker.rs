//! Sync worker: delivers every document of one subject.
//!
//! For a subject the worker first resolves exactly one reference row, then lists the
//! subject's activities and attachments and walks them one at a time through an
//! ordered pipeline:
//!
//! ledger check → completeness → routing → destination check → temp file → download
//! → classify → upload → tag → ledger commit
//!
//! A failing stage aborts only the current document; its siblings continue. Temp files
//! are owned by [`tempfile::NamedTempFile`] and removed when the document's pipeline
//! returns, whatever the outcome.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::AddAssign;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::classify::{Classification, Taxonomy};
use crate::contract::{
    DestinationClient, DocumentAttributes, DocumentHandle, DocumentKey, DocumentKind,
    DocumentRecord, Ledger, LedgerEntry, LedgerError, ReferenceRow, SourceClient,
    SubjectRecord,
};
use crate::report::{ExceptionLog, ExceptionRecord, KeyStatus, ReferenceStatus};
use crate::routing::RoutingTable;

/// Immutable inputs shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub routing: RoutingTable,
    pub taxonomy: Taxonomy,
    /// The reference extract, resolved once at startup.
    pub reference: DocumentHandle,
    /// Column of the reference extract holding the external key.
    pub key_column: String,
    /// Reference columns copied into the delivered document's metadata.
    pub reference_fields: Vec<String>,
    pub attribute_group: String,
    /// Directory for download temp files; the system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
}

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LedgerCheck,
    Routing,
    DestinationCheck,
    TempFile,
    Download,
    Upload,
    Tag,
    Record,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LedgerCheck => "ledger check",
            Stage::Routing => "routing",
            Stage::DestinationCheck => "destination check",
            Stage::TempFile => "temp file",
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Tag => "tag",
            Stage::Record => "ledger record",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed for {key}: {message}")]
pub struct DocumentError {
    pub key: DocumentKey,
    pub stage: Stage,
    pub message: String,
}

/// Subject-level failures. None of the subject's documents were attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("subject {subject_id} has no external key")]
    MissingKey { subject_id: i64 },
    #[error("subject {subject_id} matched {matches} reference rows, expected exactly one")]
    AmbiguousOrMissingReference { subject_id: i64, matches: usize },
    #[error("reference lookup failed for subject {subject_id}: {message}")]
    ReferenceLookup { subject_id: i64, message: String },
    #[error("listing {} documents failed for subject {subject_id}: {message}", .kind.as_str())]
    Listing {
        subject_id: i64,
        kind: DocumentKind,
        message: String,
    },
    #[error("worker for subject {subject_id} panicked: {message}")]
    Panicked { subject_id: i64, message: String },
}

/// Per-subject document counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentTally {
    pub delivered: usize,
    pub already_delivered: usize,
    pub present_at_destination: usize,
    pub incomplete: usize,
    pub claimed_elsewhere: usize,
    /// Delivered documents no classification rule matched. Counted in `delivered` too.
    pub defaulted: usize,
}

impl DocumentTally {
    pub fn skipped(&self) -> usize {
        self.already_delivered
            + self.present_at_destination
            + self.incomplete
            + self.claimed_elsewhere
    }

    fn count(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered { defaulted } => {
                self.delivered += 1;
                self.defaulted += usize::from(defaulted);
            }
            Delivery::AlreadyDelivered => self.already_delivered += 1,
            Delivery::PresentAtDestination => self.present_at_destination += 1,
            Delivery::Incomplete => self.incomplete += 1,
            Delivery::ClaimedElsewhere => self.claimed_elsewhere += 1,
        }
    }
}

impl AddAssign for DocumentTally {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.already_delivered += other.already_delivered;
        self.present_at_destination += other.present_at_destination;
        self.incomplete += other.incomplete;
        self.claimed_elsewhere += other.claimed_elsewhere;
        self.defaulted += other.defaulted;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Delivered(DocumentTally),
    PartiallySkipped(DocumentTally, Vec<DocumentError>),
    Failed(SubjectError),
}

/// How a single document left the pipeline without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered { defaulted: bool },
    AlreadyDelivered,
    PresentAtDestination,
    Incomplete,
    ClaimedElsewhere,
}

/// Documents currently in a pipeline somewhere in this process.
#[derive(Debug, Default)]
pub struct ClaimSet {
    claimed: Mutex<HashSet<DocumentKey>>,
}

/// Releases its key when dropped.
pub struct Claim {
    set: Arc<ClaimSet>,
    key: DocumentKey,
}

impl ClaimSet {
    /// `None` when another worker already holds the key.
    pub fn claim(self: &Arc<Self>, key: DocumentKey) -> Option<Claim> {
        let inserted = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key);
        inserted.then(|| Claim {
            set: self.clone(),
            key,
        })
    }

    pub fn is_claimed(&self, key: &DocumentKey) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Anything the dispatcher can hand a subject to.
#[async_trait]
pub trait SubjectProcessor: Send + Sync + 'static {
    async fn process(&self, subject: SubjectRecord) -> WorkerOutcome;
}

pub struct SyncWorker<S, D, L> {
    source: Arc<S>,
    destination: Arc<D>,
    ledger: Arc<L>,
    context: Arc<SyncContext>,
    exceptions: ExceptionLog,
    claims: Arc<ClaimSet>,
}

impl<S, D, L> SyncWorker<S, D, L>
where
    S: SourceClient + 'static,
    D: DestinationClient + 'static,
    L: Ledger + 'static,
{
    pub fn new(
        source: Arc<S>,
        destination: Arc<D>,
        ledger: Arc<L>,
        context: Arc<SyncContext>,
        exceptions: ExceptionLog,
    ) -> Self {
        Self {
            source,
            destination,
            ledger,
            context,
            exceptions,
            claims: Arc::new(ClaimSet::default()),
        }
    }

    pub fn claims(&self) -> Arc<ClaimSet> {
        self.claims.clone()
    }

    async fn resolve_reference(
        &self,
        subject: &SubjectRecord,
    ) -> Result<ReferenceRow, SubjectError> {
        let key = subject
            .external_key
            .as_deref()
            .ok_or(SubjectError::MissingKey {
                subject_id: subject.id,
            })?;

        let mut rows = self
            .destination
            .lookup_by_key(&self.context.reference, &self.context.key_column, key)
            .await
            .map_err(|e| SubjectError::ReferenceLookup {
                subject_id: subject.id,
                message: e.to_string(),
            })?;

        if rows.len() == 1 {
            if let Some(row) = rows.pop() {
                return Ok(row);
            }
        }

        let status = if rows.is_empty() {
            ReferenceStatus::Missing
        } else {
            ReferenceStatus::Multiple
        };
        self.exceptions
            .record(ExceptionRecord::new(subject, KeyStatus::Valid, status));
        Err(SubjectError::AmbiguousOrMissingReference {
            subject_id: subject.id,
            matches: rows.len(),
        })
    }

    async fn deliver(
        &self,
        subject: &SubjectRecord,
        reference: &ReferenceRow,
        document: &DocumentRecord,
    ) -> Result<Delivery, DocumentError> {
        let key = document.key();
        let fail = |stage: Stage, message: String| DocumentError {
            key,
            stage,
            message,
        };

        let Some(_claim) = self.claims.claim(key) else {
            info!(document = %key, "[WORKER] Document is being delivered by another worker");
            return Ok(Delivery::ClaimedElsewhere);
        };

        let delivered = self
            .ledger
            .exists(&key)
            .await
            .map_err(|e| fail(Stage::LedgerCheck, e.to_string()))?;
        if delivered {
            info!(document = %key, subject_id = subject.id, "[WORKER] Already delivered");
            return Ok(Delivery::AlreadyDelivered);
        }

        if !document.signed_or_complete {
            info!(
                document = %key,
                subject_id = subject.id,
                "[WORKER] Document not complete, skipping"
            );
            return Ok(Delivery::Incomplete);
        }

        let folder_path = self
            .context
            .routing
            .resolve(subject.location_id)
            .map_err(|e| fail(Stage::Routing, e.to_string()))?;

        let file_name = destination_file_name(subject, document);
        let target = format!("{}/{}", folder_path.trim_end_matches('/'), file_name);
        let existing = self
            .destination
            .resolve_path(&target)
            .await
            .map_err(|e| fail(Stage::DestinationCheck, e.to_string()))?;
        if let Some(existing) = existing {
            // Not recorded in the ledger: the ledger only holds deliveries made by this tool.
            warn!(
                document = %key,
                path = %existing.path,
                "[WORKER] Present at destination but not in ledger, skipping"
            );
            return Ok(Delivery::PresentAtDestination);
        }

        let folder = self
            .destination
            .resolve_folder(folder_path)
            .await
            .map_err(|e| fail(Stage::Routing, e.to_string()))?;

        let temp = self
            .temp_file()
            .map_err(|e| fail(Stage::TempFile, e.to_string()))?;

        let bytes = self
            .source
            .download(document, temp.path())
            .await
            .map_err(|e| fail(Stage::Download, e.to_string()))?;
        info!(
            document = %key,
            bytes,
            temp_path = %temp.path().display(),
            "[WORKER] Downloaded document"
        );

        let classification = self.classify(document);
        let defaulted = self.context.taxonomy.is_default(&classification);
        if defaulted {
            info!(
                document = %key,
                subject_id = subject.id,
                title = %document.title,
                document_name = %classification.document_name,
                "[WORKER] No classification rule matched, defaulting document name"
            );
        }

        let handle = self
            .destination
            .upload(&folder, temp.path(), &file_name)
            .await
            .map_err(|e| fail(Stage::Upload, e.to_string()))?;
        info!(
            document = %key,
            remote_path = %folder.path,
            "[WORKER] Uploaded document"
        );

        let attributes = DocumentAttributes {
            group: self.context.attribute_group.clone(),
            subject_fields: self.subject_fields(reference),
            classification: classification.clone(),
        };
        self.destination
            .set_metadata(&handle, &attributes)
            .await
            .map_err(|e| fail(Stage::Tag, e.to_string()))?;
        info!(
            document = %key,
            document_name = %classification.document_name,
            attribute_group = %attributes.group,
            "[WORKER] Tagged document"
        );

        let entry = LedgerEntry {
            key,
            subject_id: subject.id,
            title: document.title.clone(),
            page_count: handle.page_count,
            subject_display_name: subject.display_name(),
            exception_flag: false,
            attachment_type: document.attachment_type.clone(),
        };
        match self.ledger.record(entry).await {
            Ok(()) => {
                info!(document = %key, "[WORKER] Recorded delivery in ledger");
            }
            Err(LedgerError::DuplicateKey(_)) => {
                warn!(document = %key, "[WORKER] Ledger already held this document");
            }
            Err(e) => return Err(fail(Stage::Record, e.to_string())),
        }

        Ok(Delivery::Delivered { defaulted })
    }

    fn temp_file(&self) -> std::io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("hr-doc-").suffix(".part");
        match &self.context.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }

    fn classify(&self, document: &DocumentRecord) -> Classification {
        let taxonomy = &self.context.taxonomy;
        match document.kind {
            DocumentKind::Activity => taxonomy.classify(&document.title),
            DocumentKind::Attachment => {
                taxonomy.classify_attachment(document.attachment_type.as_deref(), &document.title)
            }
        }
    }

    /// Configured reference columns; columns absent from the row are left out.
    fn subject_fields(&self, reference: &ReferenceRow) -> BTreeMap<String, String> {
        self.context
            .reference_fields
            .iter()
            .filter_map(|field| {
                reference
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl<S, D, L> SubjectProcessor for SyncWorker<S, D, L>
where
    S: SourceClient + 'static,
    D: DestinationClient + 'static,
    L: Ledger + 'static,
{
    async fn process(&self, subject: SubjectRecord) -> WorkerOutcome {
        let display_name = subject.display_name();
        info!(subject_id = subject.id, subject = %display_name, "[WORKER] Processing subject");

        let reference = match self.resolve_reference(&subject).await {
            Ok(row) => row,
            Err(e) => {
                error!(
                    subject_id = subject.id,
                    error = %e,
                    "[WORKER][ERROR] Reference lookup failed"
                );
                return WorkerOutcome::Failed(e);
            }
        };

        let mut documents = match self.source.list_documents(&subject).await {
            Ok(documents) => documents,
            Err(e) => {
                return WorkerOutcome::Failed(listing_failed(&subject, DocumentKind::Activity, e))
            }
        };
        let attachments = match self.source.list_attachments(&subject).await {
            Ok(attachments) => attachments,
            Err(e) => {
                return WorkerOutcome::Failed(listing_failed(
                    &subject,
                    DocumentKind::Attachment,
                    e,
                ))
            }
        };
        info!(
            subject_id = subject.id,
            activities = documents.len(),
            attachments = attachments.len(),
            "[WORKER] Listed documents"
        );
        documents.extend(attachments);

        let mut tally = DocumentTally::default();
        let mut errors = Vec::new();
        for document in &documents {
            match self.deliver(&subject, &reference, document).await {
                Ok(delivery) => tally.count(delivery),
                Err(e) => {
                    error!(
                        subject_id = subject.id,
                        document = %e.key,
                        stage = %e.stage,
                        error = %e.message,
                        "[WORKER][ERROR] Document skipped"
                    );
                    errors.push(e);
                }
            }
        }

        info!(
            subject_id = subject.id,
            delivered = tally.delivered,
            defaulted = tally.defaulted,
            skipped = tally.skipped(),
            failed = errors.len(),
            "[WORKER] Finished subject"
        );
        if errors.is_empty() {
            WorkerOutcome::Delivered(tally)
        } else {
            WorkerOutcome::PartiallySkipped(tally, errors)
        }
    }
}

fn listing_failed(
    subject: &SubjectRecord,
    kind: DocumentKind,
    e: crate::contract::ClientError,
) -> SubjectError {
    let err = SubjectError::Listing {
        subject_id: subject.id,
        kind,
        message: e.to_string(),
    };
    error!(subject_id = subject.id, error = %err, "[WORKER][ERROR] Listing failed");
    err
}

/// Name the document is stored under at the destination.
///
/// Activities: `"{subject id} {display name} - {document id} {title}.pdf"`. Attachments
/// keep their source file name when they have one.
pub fn destination_file_name(subject: &SubjectRecord, document: &DocumentRecord) -> String {
    if document.kind == DocumentKind::Attachment {
        if let Some(name) = document.file_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return sanitise(name);
        }
    }
    sanitise(&format!(
        "{} {} - {} {}.pdf",
        subject.id,
        subject.display_name(),
        document.id,
        document.title
    ))
}

fn sanitise(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}
