//! Page-count tally over delivered documents.
//!
//! Reads destination document UIDs from a CSV export (column `Uid`) and sums the page
//! counts the destination reports for them, with a bounded number of lookups in flight.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};

use crate::contract::DestinationClient;

/// Concurrent lookups used when the caller does not choose.
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 15;

#[derive(Debug, Error)]
pub enum PageCountError {
    #[error("failed to read UID list {path}: {message}")]
    Read { path: String, message: String },
}

#[derive(Debug, Deserialize)]
struct UidRow {
    #[serde(rename = "Uid")]
    uid: String,
}

/// UIDs from the `Uid` column, in file order. Blank cells are skipped.
pub fn read_uids(path: &Path) -> Result<Vec<String>, PageCountError> {
    let read_err = |message: String| PageCountError::Read {
        path: path.display().to_string(),
        message,
    };

    let mut reader = csv::Reader::from_path(path).map_err(|e| read_err(e.to_string()))?;
    let mut uids = Vec::new();
    for row in reader.deserialize::<UidRow>() {
        let row = row.map_err(|e| read_err(e.to_string()))?;
        let uid = row.uid.trim();
        if !uid.is_empty() {
            uids.push(uid.to_string());
        }
    }
    Ok(uids)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTally {
    pub documents: usize,
    pub pages: u64,
    /// `(uid, error)` for every lookup that failed.
    pub failures: Vec<(String, String)>,
}

pub async fn tally_pages<D>(destination: &D, uids: Vec<String>, concurrency: usize) -> PageTally
where
    D: DestinationClient,
{
    let mut lookups = stream::iter(uids)
        .map(|uid| async move {
            let result = destination.document_by_uid(&uid).await;
            (uid, result)
        })
        .buffer_unordered(concurrency.max(1));

    let mut tally = PageTally::default();
    while let Some((uid, result)) = lookups.next().await {
        match result {
            Ok(document) => {
                tally.documents += 1;
                tally.pages += u64::from(document.page_count);
                info!(
                    n = tally.documents,
                    uid = %uid,
                    pages = document.page_count,
                    "[PAGES] Counted document"
                );
            }
            Err(e) => {
                error!(uid = %uid, error = %e, "[PAGES][ERROR] Lookup failed");
                tally.failures.push((uid, e.to_string()));
            }
        }
    }

    info!(
        documents = tally.documents,
        pages = tally.pages,
        failed = tally.failures.len(),
        "[PAGES] Page count complete"
    );
    tally
}
