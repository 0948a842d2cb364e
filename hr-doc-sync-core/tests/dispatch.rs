use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use hr_doc_sync_core::contract::{SubjectRecord, SubjectStatus};
use hr_doc_sync_core::dispatch::{
    assign_units, partition, split_allowance, ConcurrencyBudget, Dispatcher,
};
use hr_doc_sync_core::fetch::FetchError;
use hr_doc_sync_core::worker::{DocumentTally, SubjectError, SubjectProcessor, WorkerOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn subject(id: i64) -> SubjectRecord {
    SubjectRecord {
        id,
        first_name: "Sub".to_string(),
        last_name: format!("Ject{id}"),
        location_id: Some(1),
        external_key: Some("123456789".to_string()),
        status: SubjectStatus::Employed,
        department_id: None,
        created_at: None,
        start_date: None,
    }
}

/// Sleeps briefly per subject and tracks concurrency independently of the dispatcher.
#[derive(Default)]
struct SlowProcessor {
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl SubjectProcessor for SlowProcessor {
    async fn process(&self, subject: SubjectRecord) -> WorkerOutcome {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.seen.lock().unwrap().push(subject.id);
        self.active.fetch_sub(1, Ordering::SeqCst);
        WorkerOutcome::Delivered(DocumentTally {
            delivered: 1,
            ..DocumentTally::default()
        })
    }
}

struct PanickyProcessor;

#[async_trait]
impl SubjectProcessor for PanickyProcessor {
    async fn process(&self, subject: SubjectRecord) -> WorkerOutcome {
        if subject.id == 2 {
            panic!("boom on subject 2");
        }
        WorkerOutcome::Failed(SubjectError::AmbiguousOrMissingReference {
            subject_id: subject.id,
            matches: 0,
        })
    }
}

#[test]
fn ceiling_is_quota_minus_reserved_capped_by_max_workers() {
    assert_eq!(ConcurrencyBudget::default().ceiling(), 19);
    let capped = ConcurrencyBudget {
        max_workers: Some(4),
        ..ConcurrencyBudget::default()
    };
    assert_eq!(capped.ceiling(), 4);
    let exhausted = ConcurrencyBudget {
        session_quota: 1,
        reserved: 3,
        max_workers: None,
    };
    assert_eq!(exhausted.ceiling(), 1, "ceiling never drops below one");
}

#[test]
fn split_allowance_never_exceeds_ceiling() {
    assert_eq!(split_allowance(19, 4), vec![5, 5, 5, 4]);
    assert_eq!(split_allowance(2, 3), vec![1, 1], "units are capped at the ceiling");
    assert!(split_allowance(0, 3).is_empty());
    assert!(split_allowance(5, 0).is_empty());
    for units in 1..10 {
        assert!(split_allowance(19, units).iter().sum::<usize>() <= 19);
    }
}

#[test]
fn partition_is_disjoint_and_contiguous() {
    let items: Vec<i32> = (0..10).collect();
    let parts = partition(&items, 3);
    assert_eq!(parts.len(), 3);
    assert_eq!(parts.concat(), items);
    assert!(parts.iter().all(|p| !p.is_empty()));
    assert!(partition::<i32>(&[], 3).is_empty());
    assert_eq!(partition(&items[..2], 5).len(), 2);
}

#[test]
fn every_assigned_unit_has_work_and_an_allowance() {
    let items: Vec<i32> = (0..10).collect();

    let units = assign_units(&items, 2, 3);
    assert_eq!(units.len(), 2);
    assert!(units.iter().all(|(slice, allowance)| !slice.is_empty() && *allowance >= 1));
    let covered: Vec<i32> = units.iter().flat_map(|(slice, _)| slice.iter().copied()).collect();
    assert_eq!(covered, items);

    let units = assign_units(&items, 19, 4);
    assert_eq!(
        units.iter().map(|(_, allowance)| *allowance).collect::<Vec<_>>(),
        vec![5, 5, 5, 4]
    );
    assert!(units.iter().map(|(_, a)| a).sum::<usize>() <= 19);
}

#[tokio::test]
async fn active_workers_never_exceed_ceiling_and_all_subjects_run() {
    let processor = Arc::new(SlowProcessor::default());
    let subjects = stream::iter((1..=12).map(|id| Ok(subject(id)))).boxed();

    let report = Dispatcher::new(processor.clone(), 3).run(subjects).await;

    assert_eq!(report.submitted, 12);
    assert_eq!(report.completed, 12);
    assert_eq!(report.tally.delivered, 12);
    assert!(report.peak_active <= 3, "peak {} > ceiling", report.peak_active);
    assert!(processor.peak.load(Ordering::SeqCst) <= 3);
    assert!(report.peak_active >= 2, "work should overlap");

    let mut seen = processor.seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (1..=12).collect::<Vec<_>>());
}

#[tokio::test]
async fn finished_workers_are_absorbed_while_submitting() {
    let subjects = stream::iter((1..=40).map(|id| Ok(subject(id)))).boxed();
    let mut dispatcher = Dispatcher::new(Arc::new(PanickyProcessor), 2);

    dispatcher.submit_all(subjects).await;
    assert!(
        dispatcher.pending() <= 2,
        "{} unabsorbed workers held after submit",
        dispatcher.pending()
    );

    let report = dispatcher.drain().await;
    assert_eq!(report.submitted, 40);
    assert_eq!(report.completed, 40);
    assert_eq!(report.subjects_failed, 40);
    assert_eq!(report.panicked, 1);
}

#[tokio::test]
async fn fetch_error_stops_dispatch_but_drains_in_flight_work() {
    let processor = Arc::new(SlowProcessor::default());
    let items = vec![
        Ok(subject(1)),
        Ok(subject(2)),
        Err(FetchError::Page {
            cursor: 3,
            message: "timeout".to_string(),
        }),
        Ok(subject(3)),
    ];

    let report = Dispatcher::new(processor.clone(), 4)
        .run(stream::iter(items).boxed())
        .await;

    assert_eq!(report.submitted, 2);
    assert_eq!(report.completed, 2);
    assert!(matches!(report.fetch_error, Some(FetchError::Page { cursor: 3, .. })));
    assert_eq!(processor.seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn empty_stream_drains_immediately() {
    let processor = Arc::new(SlowProcessor::default());
    let report = Dispatcher::new(processor, 5)
        .run(stream::empty().boxed())
        .await;
    assert_eq!(report.submitted, 0);
    assert_eq!(report.completed, 0);
    assert_eq!(report.peak_active, 0);
}

#[tokio::test]
async fn panicking_worker_is_a_failed_subject() {
    let subjects = stream::iter((1..=3).map(|id| Ok(subject(id)))).boxed();
    let report = Dispatcher::new(Arc::new(PanickyProcessor), 2).run(subjects).await;

    assert_eq!(report.completed, 3);
    assert_eq!(report.subjects_failed, 3);
    assert_eq!(report.panicked, 1);
    assert!(report.failures.iter().any(|f| matches!(
        f,
        SubjectError::Panicked { subject_id: 2, message } if message.contains("boom")
    )));
}
