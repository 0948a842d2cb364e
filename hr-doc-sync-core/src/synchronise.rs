//! Run controller: one complete batch synchronisation.
//!
//! [`synchronise`] walks a run through its phases:
//!
//! `Init → AuthenticatingCollaborators → FetchingAndDispatching → Draining →
//! ClosingCollaborators → Done`
//!
//! # Responsibilities
//! - Prepares the ledger, authenticates the destination, resolves the reference
//!   extract and authenticates the source, in that order. Any failure here skips
//!   straight to closing.
//! - Wires the [`RecordFetcher`] stream into a [`Dispatcher`] of [`SyncWorker`]s.
//! - Writes the exception report after draining and, when configured, checks it in to
//!   the destination.
//! - Always closes destination, source and ledger, in that order.
//!
//! # Exit status
//! [`ExitStatus::Clean`] when nothing fatal happened, including runs with zero eligible
//! subjects. [`ExitStatus::Failed`] on any fatal condition, on a close failure, and on
//! recorded exceptions when `fail_on_exceptions` is set.
//!
//! # Navigation
//! - Main entrypoint: [`synchronise`]
//! - Supporting types: [`SyncSettings`], [`SynchroniseReport`].

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classify::Taxonomy;
use crate::contract::{DestinationClient, DocumentHandle, Ledger, SourceClient, SubjectStatus};
use crate::dispatch::{ConcurrencyBudget, DispatchReport, Dispatcher};
use crate::fetch::{EligibilityFilter, FetchError, FetchOptions, KeyRule, RecordFetcher};
use crate::report::{write_csv, Department, ExceptionLog, ExceptionRecord, ReportError};
use crate::routing::{LocationRoute, RoutingTable};
use crate::worker::{SyncContext, SyncWorker};

/// Where the reference extract lives and which of its columns matter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    /// Full path of the extract in the destination store.
    pub path: String,
    pub key_column: String,
    /// Columns copied into each delivered document's metadata.
    pub fields: Vec<String>,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            path: "/HR/_Admin - HR/Prospect Employee List.csv".to_string(),
            key_column: "SSN".to_string(),
            fields: [
                "Last Name",
                "First Name",
                "SSN",
                "SSN (Last 4)",
                "Company Code",
                "Department Code",
                "Department Name",
                "Status",
                "Location",
                "Hire Date",
                "Termination Date",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub local_path: PathBuf,
    /// Destination path the report is checked in to. Not checked in when `None`.
    pub remote_path: Option<String>,
    /// Resolves department code and name for report rows.
    pub departments: Vec<Department>,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            local_path: PathBuf::from("exceptions.csv"),
            remote_path: None,
            departments: Vec::new(),
        }
    }
}

/// Everything one run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub fetch: FetchOptions,
    pub routes: Vec<LocationRoute>,
    pub key_rule: KeyRule,
    pub required_statuses: Vec<SubjectStatus>,
    pub require_start_date: bool,
    pub taxonomy: Taxonomy,
    pub reference: ReferenceSettings,
    pub attribute_group: String,
    pub budget: ConcurrencyBudget,
    pub temp_dir: Option<PathBuf>,
    pub report: ReportSettings,
    pub fail_on_exceptions: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            routes: Vec::new(),
            key_rule: KeyRule::default(),
            required_statuses: Vec::new(),
            require_start_date: false,
            taxonomy: Taxonomy::default(),
            reference: ReferenceSettings::default(),
            attribute_group: "Employee Files".to_string(),
            budget: ConcurrencyBudget::default(),
            temp_dir: None,
            report: ReportSettings::default(),
            fail_on_exceptions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failed,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Failed => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    AuthenticatingCollaborators,
    FetchingAndDispatching,
    Draining,
    ClosingCollaborators,
    Done(ExitStatus),
}

/// Conditions that make a run exit non-zero.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("ledger unavailable: {0}")]
    Ledger(String),
    #[error("destination authentication failed: {0}")]
    DestinationAuth(String),
    #[error("reference extract not found at {0}")]
    ReferenceMissing(String),
    #[error("resolving reference extract {path} failed: {message}")]
    ReferenceLookup { path: String, message: String },
    #[error("source authentication failed: {0}")]
    SourceAuth(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("closing {collaborator} failed: {message}")]
    Close {
        collaborator: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub subjects_seen: usize,
    pub subjects_failed: usize,
    pub documents_delivered: usize,
    /// Delivered under the default classification.
    pub documents_defaulted: usize,
    pub documents_skipped: usize,
    pub documents_failed: usize,
    pub exceptions: usize,
}

#[derive(Debug)]
pub struct SynchroniseReport {
    pub run_id: Uuid,
    pub phases: Vec<RunPhase>,
    pub counters: RunCounters,
    pub ceiling: usize,
    pub peak_active: usize,
    pub exceptions: Vec<ExceptionRecord>,
    pub fatal: Vec<FatalError>,
    pub exit: ExitStatus,
}

impl SynchroniseReport {
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }
}

/// Runs one batch synchronisation. Never returns early: collaborators are always closed
/// and the outcome is carried in the report.
pub async fn synchronise<S, D, L>(
    settings: &SyncSettings,
    source: Arc<S>,
    destination: Arc<D>,
    ledger: Arc<L>,
) -> SynchroniseReport
where
    S: SourceClient + 'static,
    D: DestinationClient + 'static,
    L: Ledger + 'static,
{
    let run_id = Uuid::new_v4();
    let mut phases = vec![RunPhase::Init];
    let mut fatal = Vec::new();
    let mut counters = RunCounters::default();
    let exceptions = ExceptionLog::with_departments(&settings.report.departments);
    let ceiling = settings.budget.ceiling();
    let mut peak_active = 0;

    info!(%run_id, ceiling, "[SYNC] Starting synchronisation run");

    phases.push(RunPhase::AuthenticatingCollaborators);
    match authenticate(settings, &*source, &*destination, &*ledger).await {
        Ok(reference) => {
            phases.push(RunPhase::FetchingAndDispatching);
            let routing = RoutingTable::from_routes(&settings.routes);
            if routing.is_empty() {
                warn!(%run_id, "[SYNC] No locations configured, nothing is eligible");
            }
            let filter = EligibilityFilter {
                allowed_locations: routing.locations(),
                key_rule: settings.key_rule.clone(),
                required_statuses: settings.required_statuses.clone(),
                require_start_date: settings.require_start_date,
            };
            let context = SyncContext {
                routing,
                taxonomy: settings.taxonomy.clone(),
                reference,
                key_column: settings.reference.key_column.clone(),
                reference_fields: settings.reference.fields.clone(),
                attribute_group: settings.attribute_group.clone(),
                temp_dir: settings.temp_dir.clone(),
            };

            let fetcher = RecordFetcher::new(
                source.clone(),
                filter,
                settings.fetch.clone(),
                exceptions.clone(),
            );
            let worker = SyncWorker::new(
                source.clone(),
                destination.clone(),
                ledger.clone(),
                Arc::new(context),
                exceptions.clone(),
            );
            let mut dispatcher = Dispatcher::new(Arc::new(worker), ceiling);
            dispatcher.submit_all(fetcher.fetch_eligible()).await;

            phases.push(RunPhase::Draining);
            let mut dispatched = dispatcher.drain().await;
            peak_active = dispatched.peak_active;
            counters = tally(&dispatched);
            if let Some(e) = dispatched.fetch_error.take() {
                fatal.push(FatalError::Fetch(e));
            }

            let rows = exceptions.snapshot();
            if let Err(e) = publish_report(&settings.report, &rows, &*destination).await {
                error!(%run_id, error = %e, "[SYNC][ERROR] Exception report failed");
                fatal.push(FatalError::Report(e));
            }
        }
        Err(e) => {
            error!(%run_id, error = %e, "[SYNC][ERROR] Startup failed, closing collaborators");
            fatal.push(e);
        }
    }

    phases.push(RunPhase::ClosingCollaborators);
    fatal.extend(close_all(&*source, &*destination, &*ledger).await);

    let exceptions = exceptions.snapshot();
    counters.exceptions = exceptions.len();
    let exit = if !fatal.is_empty() || (settings.fail_on_exceptions && !exceptions.is_empty()) {
        ExitStatus::Failed
    } else {
        ExitStatus::Clean
    };
    phases.push(RunPhase::Done(exit));

    info!(
        %run_id,
        subjects = counters.subjects_seen,
        delivered = counters.documents_delivered,
        defaulted = counters.documents_defaulted,
        skipped = counters.documents_skipped,
        failed = counters.documents_failed,
        exceptions = counters.exceptions,
        exit_code = exit.code(),
        "[SYNC] Synchronisation run finished"
    );

    SynchroniseReport {
        run_id,
        phases,
        counters,
        ceiling,
        peak_active,
        exceptions,
        fatal,
        exit,
    }
}

async fn authenticate<S, D, L>(
    settings: &SyncSettings,
    source: &S,
    destination: &D,
    ledger: &L,
) -> Result<DocumentHandle, FatalError>
where
    S: SourceClient,
    D: DestinationClient,
    L: Ledger,
{
    ledger
        .prepare()
        .await
        .map_err(|e| FatalError::Ledger(e.to_string()))?;
    info!("[SYNC] Ledger ready");

    destination
        .authenticate()
        .await
        .map_err(|e| FatalError::DestinationAuth(e.to_string()))?;
    info!("[SYNC] Authenticated with destination");

    let path = &settings.reference.path;
    let reference = destination
        .resolve_path(path)
        .await
        .map_err(|e| FatalError::ReferenceLookup {
            path: path.clone(),
            message: e.to_string(),
        })?
        .ok_or_else(|| FatalError::ReferenceMissing(path.clone()))?;
    info!(path = %reference.path, "[SYNC] Resolved reference extract");

    source
        .authenticate()
        .await
        .map_err(|e| FatalError::SourceAuth(e.to_string()))?;
    info!("[SYNC] Authenticated with source");

    Ok(reference)
}

async fn publish_report<D: DestinationClient>(
    settings: &ReportSettings,
    rows: &[ExceptionRecord],
    destination: &D,
) -> Result<(), ReportError> {
    write_csv(rows, &settings.local_path)?;

    let Some(remote) = &settings.remote_path else {
        return Ok(());
    };
    let file_name = settings
        .local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "exceptions.csv".to_string());
    destination
        .check_in(remote, &settings.local_path, &file_name)
        .await
        .map_err(|e| ReportError::CheckIn {
            path: remote.clone(),
            message: e.to_string(),
        })?;
    info!(path = %remote, rows = rows.len(), "[SYNC] Checked in exception report");
    Ok(())
}

async fn close_all<S, D, L>(source: &S, destination: &D, ledger: &L) -> Vec<FatalError>
where
    S: SourceClient,
    D: DestinationClient,
    L: Ledger,
{
    let mut errors = Vec::new();
    if let Err(e) = destination.close().await {
        errors.push(close_failed("destination", e.to_string()));
    }
    if let Err(e) = source.close().await {
        errors.push(close_failed("source", e.to_string()));
    }
    if let Err(e) = ledger.close().await {
        errors.push(close_failed("ledger", e.to_string()));
    }
    if errors.is_empty() {
        info!("[SYNC] Closed all collaborators");
    }
    errors
}

fn close_failed(collaborator: &'static str, message: String) -> FatalError {
    error!(collaborator, error = %message, "[SYNC][ERROR] Close failed");
    FatalError::Close {
        collaborator,
        message,
    }
}

fn tally(dispatched: &DispatchReport) -> RunCounters {
    RunCounters {
        subjects_seen: dispatched.submitted,
        subjects_failed: dispatched.subjects_failed,
        documents_delivered: dispatched.tally.delivered,
        documents_defaulted: dispatched.tally.defaulted,
        documents_skipped: dispatched.tally.skipped(),
        documents_failed: dispatched.documents_failed,
        exceptions: 0,
    }
}
