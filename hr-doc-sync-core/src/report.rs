//! Per-subject exception tracking and the CSV exception report.
//!
//! Subjects that cannot be routed to a reference row (missing or malformed key,
//! no match or several matches in the reference extract) are collected in an
//! [`ExceptionLog`] during the run and written out as a delimited table once the
//! dispatcher has drained.
//!
//! Department code and name columns come from the configured [`Department`]
//! directory and stay empty for ids it does not list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::contract::SubjectRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyStatus {
    Missing,
    Invalid,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReferenceStatus {
    #[serde(rename = "N/A")]
    NotApplicable,
    Missing,
    Multiple,
}

/// Department directory entry, keyed by the source's department id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: String,
    pub code: String,
    pub name: String,
}

/// One row of the exception report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionRecord {
    #[serde(rename = "SSN Status")]
    pub key_status: KeyStatus,
    #[serde(rename = "HRIS Extract Status")]
    pub reference_status: ReferenceStatus,
    #[serde(rename = "Department ID")]
    pub department_id: String,
    #[serde(rename = "Department Code")]
    pub department_code: String,
    #[serde(rename = "Department Name")]
    pub department_name: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Employee ID")]
    pub subject_id: i64,
    #[serde(rename = "Employee Last Name")]
    pub last_name: String,
    #[serde(rename = "Employee First Name")]
    pub first_name: String,
    #[serde(rename = "Employee Creation Date")]
    pub created_at: String,
}

impl ExceptionRecord {
    pub const HEADERS: [&'static str; 10] = [
        "SSN Status",
        "HRIS Extract Status",
        "Department ID",
        "Department Code",
        "Department Name",
        "Status",
        "Employee ID",
        "Employee Last Name",
        "Employee First Name",
        "Employee Creation Date",
    ];

    pub fn new(
        subject: &SubjectRecord,
        key_status: KeyStatus,
        reference_status: ReferenceStatus,
    ) -> Self {
        Self {
            key_status,
            reference_status,
            department_id: subject.department_id.clone().unwrap_or_default(),
            department_code: String::new(),
            department_name: String::new(),
            status: subject.status.name().to_string(),
            subject_id: subject.id,
            last_name: subject.last_name.clone(),
            first_name: subject.first_name.clone(),
            created_at: subject.created_at.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write exception report {path}: {message}")]
    Write { path: String, message: String },
    #[error("failed to check in exception report to {path}: {message}")]
    CheckIn { path: String, message: String },
}

/// Shared, append-only collection of exception rows. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct ExceptionLog {
    rows: Arc<Mutex<Vec<ExceptionRecord>>>,
    departments: Arc<HashMap<String, Department>>,
}

impl ExceptionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that fills department code and name from `departments` as rows arrive.
    pub fn with_departments(departments: &[Department]) -> Self {
        let departments = departments
            .iter()
            .map(|department| (department.id.clone(), department.clone()))
            .collect();
        Self {
            rows: Arc::default(),
            departments: Arc::new(departments),
        }
    }

    pub fn record(&self, mut record: ExceptionRecord) {
        if let Some(department) = self.departments.get(&record.department_id) {
            record.department_code = department.code.clone();
            record.department_name = department.name.clone();
        }
        tracing::info!(
            subject_id = record.subject_id,
            key_status = ?record.key_status,
            reference_status = ?record.reference_status,
            "[REPORT] Recorded subject exception"
        );
        self.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ExceptionRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ExceptionRecord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes the rows as comma-delimited CSV with a header line, even when empty.
pub fn write_csv(records: &[ExceptionRecord], path: &Path) -> Result<(), ReportError> {
    let write_err = |message: String| ReportError::Write {
        path: path.display().to_string(),
        message,
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| write_err(e.to_string()))?;
    writer
        .write_record(ExceptionRecord::HEADERS)
        .map_err(|e| write_err(e.to_string()))?;
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| write_err(e.to_string()))?;
    }
    writer.flush().map_err(|e| write_err(e.to_string()))?;

    tracing::info!(
        path = %path.display(),
        rows = records.len(),
        "[REPORT] Wrote exception report"
    );
    Ok(())
}
