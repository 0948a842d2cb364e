//! Bounded fan-out of subjects across concurrent workers.
//!
//! The [`Dispatcher`] pulls subjects from the fetcher's stream and spawns one tokio task
//! per subject, gated by a semaphore holding `C` permits. A permit is taken before the
//! next subject is pulled, so the stream is only polled when a worker slot is free.
//! Completion is unordered. The run is drained once the stream has ended and every
//! spawned task has been joined.
//!
//! A panicking worker is caught at the task boundary and reported as a failed subject.

use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::contract::SubjectRecord;
use crate::fetch::FetchError;
use crate::worker::{DocumentTally, SubjectError, SubjectProcessor, WorkerOutcome};

/// Session budget the ceiling is derived from.
///
/// The source allows `session_quota` concurrent sessions; `reserved` of those are kept
/// for the controller itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyBudget {
    pub session_quota: usize,
    pub reserved: usize,
    pub max_workers: Option<usize>,
}

impl Default for ConcurrencyBudget {
    fn default() -> Self {
        Self {
            session_quota: 20,
            reserved: 1,
            max_workers: None,
        }
    }
}

impl ConcurrencyBudget {
    /// `min(max_workers, session_quota - reserved)`, never below 1.
    pub fn ceiling(&self) -> usize {
        let available = self.session_quota.saturating_sub(self.reserved);
        let ceiling = match self.max_workers {
            Some(max) => max.min(available),
            None => available,
        };
        ceiling.max(1)
    }
}

/// Splits `ceiling` across `units` so that the parts sum to at most `ceiling`.
/// Earlier units receive the remainder. Units are capped at `ceiling` so every
/// returned allowance is at least one.
pub fn split_allowance(ceiling: usize, units: usize) -> Vec<usize> {
    let units = units.min(ceiling);
    if units == 0 {
        return Vec::new();
    }
    let base = ceiling / units;
    let remainder = ceiling % units;
    (0..units)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// Disjoint contiguous slices covering `items`, at most `units` of them, none empty.
pub fn partition<T>(items: &[T], units: usize) -> Vec<&[T]> {
    if items.is_empty() || units == 0 {
        return Vec::new();
    }
    let size = items.len().div_ceil(units);
    items.chunks(size).collect()
}

/// Pairs each contiguous slice of `items` with its share of `ceiling`.
///
/// The unit count is capped at `ceiling` before partitioning, so no slice is left
/// with a zero allowance and every item belongs to exactly one unit.
pub fn assign_units<T>(items: &[T], ceiling: usize, units: usize) -> Vec<(&[T], usize)> {
    let slices = partition(items, units.min(ceiling));
    let allowances = split_allowance(ceiling, slices.len());
    slices.into_iter().zip(allowances).collect()
}

/// Tracks how many workers are running, and the most that ever ran at once.
#[derive(Debug, Clone, Default)]
pub struct ActivityProbe {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActivityProbe {
    pub fn enter(&self) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            active: self.active.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aggregate of every joined worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub ceiling: usize,
    pub submitted: usize,
    pub completed: usize,
    pub peak_active: usize,
    pub tally: DocumentTally,
    pub subjects_delivered: usize,
    pub subjects_partial: usize,
    pub subjects_failed: usize,
    pub documents_failed: usize,
    pub panicked: usize,
    pub failures: Vec<SubjectError>,
    pub fetch_error: Option<FetchError>,
}

impl DispatchReport {
    fn absorb(&mut self, outcome: WorkerOutcome) {
        self.completed += 1;
        match outcome {
            WorkerOutcome::Delivered(tally) => {
                self.subjects_delivered += 1;
                self.tally += tally;
            }
            WorkerOutcome::PartiallySkipped(tally, errors) => {
                self.subjects_partial += 1;
                self.tally += tally;
                self.documents_failed += errors.len();
            }
            WorkerOutcome::Failed(e) => {
                self.subjects_failed += 1;
                if matches!(e, SubjectError::Panicked { .. }) {
                    self.panicked += 1;
                }
                self.failures.push(e);
            }
        }
    }
}

pub struct Dispatcher<P> {
    processor: Arc<P>,
    ceiling: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<(i64, WorkerOutcome)>,
    probe: ActivityProbe,
    report: DispatchReport,
}

impl<P: SubjectProcessor> Dispatcher<P> {
    pub fn new(processor: Arc<P>, ceiling: usize) -> Self {
        let ceiling = ceiling.max(1);
        Self {
            processor,
            ceiling,
            permits: Arc::new(Semaphore::new(ceiling)),
            tasks: JoinSet::new(),
            probe: ActivityProbe::default(),
            report: DispatchReport {
                ceiling,
                ..DispatchReport::default()
            },
        }
    }

    pub fn probe(&self) -> ActivityProbe {
        self.probe.clone()
    }

    /// Spawned workers whose outcome has not been absorbed yet.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Submits then drains.
    pub async fn run(
        mut self,
        subjects: BoxStream<'_, Result<SubjectRecord, FetchError>>,
    ) -> DispatchReport {
        self.submit_all(subjects).await;
        self.drain().await
    }

    /// Submits every subject the stream yields. Returns when the stream ends or fails;
    /// in-flight work keeps running.
    pub async fn submit_all(
        &mut self,
        mut subjects: BoxStream<'_, Result<SubjectRecord, FetchError>>,
    ) {
        info!(ceiling = self.ceiling, "[DISPATCH] Dispatching subjects");
        loop {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "[DISPATCH][ERROR] Worker semaphore closed");
                    break;
                }
            };
            while let Some(joined) = self.tasks.try_join_next() {
                self.settle(joined);
            }

            let subject = match subjects.next().await {
                Some(Ok(subject)) => subject,
                Some(Err(e)) => {
                    error!(
                        error = %e,
                        "[DISPATCH][ERROR] Subject stream failed, no further dispatch"
                    );
                    self.report.fetch_error = Some(e);
                    break;
                }
                None => break,
            };

            let processor = self.processor.clone();
            let probe = self.probe.clone();
            let subject_id = subject.id;
            self.report.submitted += 1;
            self.tasks.spawn(async move {
                let _permit = permit;
                let _active = probe.enter();
                let outcome = AssertUnwindSafe(processor.process(subject))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        error!(subject_id, panic = %message, "[DISPATCH][ERROR] Worker panicked");
                        WorkerOutcome::Failed(SubjectError::Panicked {
                            subject_id,
                            message,
                        })
                    });
                (subject_id, outcome)
            });
        }
        info!(
            submitted = self.report.submitted,
            "[DISPATCH] Subject stream exhausted"
        );
    }

    /// Waits for every submitted worker.
    pub async fn drain(mut self) -> DispatchReport {
        while let Some(joined) = self.tasks.join_next().await {
            self.settle(joined);
        }

        let mut report = std::mem::take(&mut self.report);
        report.peak_active = self.probe.peak();
        info!(
            completed = report.completed,
            peak_active = report.peak_active,
            delivered = report.tally.delivered,
            subjects_failed = report.subjects_failed,
            "[DISPATCH] Drained"
        );
        report
    }

    fn settle(&mut self, joined: Result<(i64, WorkerOutcome), JoinError>) {
        match joined {
            Ok((subject_id, outcome)) => {
                if let WorkerOutcome::Failed(e) = &outcome {
                    warn!(subject_id, error = %e, "[DISPATCH] Subject failed");
                }
                self.report.absorb(outcome);
            }
            Err(e) => {
                error!(error = %e, "[DISPATCH][ERROR] Worker task aborted");
                self.report.absorb(WorkerOutcome::Failed(SubjectError::Panicked {
                    subject_id: 0,
                    message: e.to_string(),
                }));
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
