//! Record fetcher: pulls subjects page by page from the source and yields the
//! eligible ones as a lazy stream.
//!
//! # Paging
//! The cursor is a 1-based start offset. After each page the cursor advances by the
//! number of records the page held. The stream ends on the first empty page, or once
//! the cursor passes the optional `max_offset`.
//!
//! # Eligibility
//! A subject is yielded only when its location is routable, its external key is
//! present and (after normalisation) well-formed, and the configured required fields
//! hold. Rejected subjects are logged and dropped. In-location subjects dropped for a
//! missing or invalid key are also recorded in the [`ExceptionLog`].
//!
//! # Errors
//! A page-fetch failure is yielded once as [`FetchError::Page`] and ends the stream.
//! Records yielded before the failure stay valid.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::contract::{SourceClient, SubjectRecord, SubjectStatus};
use crate::report::{ExceptionLog, ExceptionRecord, KeyStatus, ReferenceStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("failed to fetch subject page at offset {cursor}: {message}")]
    Page { cursor: u64, message: String },
}

/// How the external key is normalised and validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRule {
    /// Strip every non-digit before validating.
    pub digits_only: bool,
    /// Exact length required after normalisation.
    pub length: Option<usize>,
}

impl Default for KeyRule {
    fn default() -> Self {
        Self {
            digits_only: true,
            length: Some(9),
        }
    }
}

impl KeyRule {
    pub fn normalise(&self, raw: Option<&str>) -> Result<String, Rejection> {
        let raw = raw.map(str::trim).unwrap_or_default();
        if raw.is_empty() {
            return Err(Rejection::MissingKey);
        }

        let key: String = if self.digits_only {
            raw.chars().filter(char::is_ascii_digit).collect()
        } else {
            raw.to_string()
        };

        match self.length {
            Some(expected) if key.chars().count() != expected => Err(Rejection::InvalidKey),
            _ if key.is_empty() => Err(Rejection::InvalidKey),
            _ => Ok(key),
        }
    }
}

/// Why a subject was not yielded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("location {0:?} is not routable")]
    Location(Option<i64>),
    #[error("external key is missing")]
    MissingKey,
    #[error("external key is malformed")]
    InvalidKey,
    #[error("status {} is not eligible", .0.name())]
    Status(SubjectStatus),
    #[error("start date is missing")]
    MissingStartDate,
}

impl Rejection {
    /// The key status to report, for rejections that belong in the exception report.
    pub fn key_status(&self) -> Option<KeyStatus> {
        match self {
            Rejection::MissingKey => Some(KeyStatus::Missing),
            Rejection::InvalidKey => Some(KeyStatus::Invalid),
            _ => None,
        }
    }
}

/// Eligibility predicate applied to every listed subject.
#[derive(Debug, Clone, Default)]
pub struct EligibilityFilter {
    pub allowed_locations: HashSet<i64>,
    pub key_rule: KeyRule,
    /// Empty means every status is accepted.
    pub required_statuses: Vec<SubjectStatus>,
    pub require_start_date: bool,
}

impl EligibilityFilter {
    /// Returns the subject with its external key normalised, or the first failed check.
    pub fn evaluate(&self, subject: &SubjectRecord) -> Result<SubjectRecord, Rejection> {
        match subject.location_id {
            Some(id) if self.allowed_locations.contains(&id) => {}
            other => return Err(Rejection::Location(other)),
        }

        let key = self.key_rule.normalise(subject.external_key.as_deref())?;

        if !self.required_statuses.is_empty() && !self.required_statuses.contains(&subject.status)
        {
            return Err(Rejection::Status(subject.status));
        }

        let has_start_date = subject
            .start_date
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty());
        if self.require_start_date && !has_start_date {
            return Err(Rejection::MissingStartDate);
        }

        Ok(SubjectRecord {
            external_key: Some(key),
            ..subject.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub page_size: usize,
    pub start: u64,
    /// Stop once the cursor passes this offset. `None` means no limit.
    pub max_offset: Option<u64>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 25,
            start: 1,
            max_offset: None,
        }
    }
}

pub struct RecordFetcher<S> {
    source: Arc<S>,
    filter: Arc<EligibilityFilter>,
    options: FetchOptions,
    exceptions: ExceptionLog,
}

struct PageState<S> {
    source: Arc<S>,
    filter: Arc<EligibilityFilter>,
    exceptions: ExceptionLog,
    page_size: usize,
    max_offset: Option<u64>,
    cursor: u64,
    buffer: VecDeque<SubjectRecord>,
    finished: bool,
}

impl<S> RecordFetcher<S>
where
    S: SourceClient + 'static,
{
    pub fn new(
        source: Arc<S>,
        filter: EligibilityFilter,
        options: FetchOptions,
        exceptions: ExceptionLog,
    ) -> Self {
        Self {
            source,
            filter: Arc::new(filter),
            options,
            exceptions,
        }
    }

    /// Lazy stream of eligible subjects. No page is requested until the stream is polled.
    pub fn fetch_eligible(&self) -> BoxStream<'static, Result<SubjectRecord, FetchError>> {
        let state = PageState {
            source: self.source.clone(),
            filter: self.filter.clone(),
            exceptions: self.exceptions.clone(),
            page_size: self.options.page_size.max(1),
            max_offset: self.options.max_offset,
            cursor: self.options.start,
            buffer: VecDeque::new(),
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(subject) = state.buffer.pop_front() {
                    return Some((Ok(subject), state));
                }
                if state.finished {
                    return None;
                }

                let cursor = state.cursor;
                let page = match state.source.list_page(cursor, state.page_size).await {
                    Ok(page) => page,
                    Err(e) => {
                        error!(cursor, error = %e, "[FETCH][ERROR] Page request failed");
                        state.finished = true;
                        let err = FetchError::Page {
                            cursor,
                            message: e.to_string(),
                        };
                        return Some((Err(err), state));
                    }
                };

                if page.is_empty() {
                    info!(cursor, "[FETCH] Empty page, subject listing complete");
                    state.finished = true;
                    continue;
                }

                let length = page.len() as u64;
                info!(
                    start = cursor,
                    end = cursor + length - 1,
                    "[FETCH] Received subject page"
                );
                state.cursor += length;
                if state.max_offset.is_some_and(|max| state.cursor > max) {
                    info!(cursor = state.cursor, "[FETCH] Reached maximum offset");
                    state.finished = true;
                }

                for subject in page {
                    match state.filter.evaluate(&subject) {
                        Ok(eligible) => state.buffer.push_back(eligible),
                        Err(rejection) => reject(&state.exceptions, &subject, &rejection),
                    }
                }
            }
        })
        .boxed()
    }
}

fn reject(exceptions: &ExceptionLog, subject: &SubjectRecord, rejection: &Rejection) {
    match rejection.key_status() {
        Some(key_status) => {
            info!(
                subject_id = subject.id,
                reason = %rejection,
                "[FETCH] Skipping subject"
            );
            exceptions.record(ExceptionRecord::new(
                subject,
                key_status,
                ReferenceStatus::NotApplicable,
            ));
        }
        None => {
            debug!(
                subject_id = subject.id,
                reason = %rejection,
                "[FETCH] Subject not eligible"
            );
        }
    }
}
