use async_trait::async_trait;
use hr_doc_sync_core::contract::{
    ClientError, DestinationClient, DocumentAttributes, DocumentHandle, DocumentKey,
    DocumentKind, DocumentRecord, FolderHandle, Ledger, ReferenceRow, SourceClient,
    SubjectRecord, SubjectStatus,
};
use hr_doc_sync_core::ledger::MemoryLedger;
use hr_doc_sync_core::report::Department;
use hr_doc_sync_core::routing::LocationRoute;
use hr_doc_sync_core::synchronise::{
    synchronise, ExitStatus, FatalError, ReferenceSettings, ReportSettings, RunPhase,
    SyncSettings,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

const EXTRACT: &str = "/HR/_Admin - HR/extract.csv";
const FOLDER: &str = "/HR/Delivery";

fn subject(id: i64, location: i64, key: Option<&str>) -> SubjectRecord {
    SubjectRecord {
        id,
        first_name: "Emp".to_string(),
        last_name: format!("Number{id}"),
        location_id: Some(location),
        external_key: key.map(str::to_string),
        status: SubjectStatus::Employed,
        department_id: Some("D1".to_string()),
        created_at: Some("2022-01-01".to_string()),
        start_date: None,
    }
}

fn ssn(id: i64) -> String {
    format!("{:09}", 100_000_000 + id)
}

/// In-memory source: a fixed subject list and two documents per subject.
#[derive(Default)]
struct FakeSource {
    subjects: Vec<SubjectRecord>,
    fail_auth: bool,
    fail_page_at: Option<u64>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    page_calls: AtomicUsize,
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn authenticate(&self) -> Result<(), ClientError> {
        if self.fail_auth {
            return Err("bad credentials".into());
        }
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_page(
        &self,
        cursor: u64,
        page_size: usize,
    ) -> Result<Vec<SubjectRecord>, ClientError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_page_at == Some(cursor) {
            return Err("source unavailable".into());
        }
        let start = (cursor - 1) as usize;
        Ok(self
            .subjects
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn list_documents(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        Ok(vec![DocumentRecord {
            id: subject.id * 10,
            kind: DocumentKind::Activity,
            title: "03 - I-9".to_string(),
            subject_id: subject.id,
            signed_or_complete: true,
            content_ref: String::new(),
            attachment_type: None,
            file_name: None,
        }])
    }

    async fn list_attachments(
        &self,
        subject: &SubjectRecord,
    ) -> Result<Vec<DocumentRecord>, ClientError> {
        Ok(vec![DocumentRecord {
            id: subject.id * 10,
            kind: DocumentKind::Attachment,
            title: "Passport".to_string(),
            subject_id: subject.id,
            signed_or_complete: true,
            content_ref: String::new(),
            attachment_type: None,
            file_name: Some(format!("passport-{}.pdf", subject.id)),
        }])
    }

    async fn download(&self, document: &DocumentRecord, sink: &Path) -> Result<u64, ClientError> {
        std::fs::write(sink, document.title.as_bytes())?;
        Ok(document.title.len() as u64)
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory destination store keyed by full path.
#[derive(Default)]
struct FakeDestination {
    reference: Vec<ReferenceRow>,
    missing_extract: bool,
    documents: Mutex<HashMap<String, DocumentHandle>>,
    uploads: AtomicUsize,
    check_ins: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl FakeDestination {
    fn with_reference(keys: &[String]) -> Self {
        Self {
            reference: keys
                .iter()
                .map(|k| ReferenceRow::from([("SSN".to_string(), k.clone())]))
                .collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl DestinationClient for FakeDestination {
    async fn authenticate(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn resolve_path(&self, path: &str) -> Result<Option<DocumentHandle>, ClientError> {
        if path == EXTRACT && !self.missing_extract {
            return Ok(Some(DocumentHandle {
                id: "extract".to_string(),
                path: path.to_string(),
                page_count: 0,
            }));
        }
        Ok(self.documents.lock().unwrap().get(path).cloned())
    }

    async fn resolve_folder(&self, path: &str) -> Result<FolderHandle, ClientError> {
        Ok(FolderHandle {
            id: path.to_string(),
            path: path.to_string(),
        })
    }

    async fn upload(
        &self,
        folder: &FolderHandle,
        _content: &Path,
        file_name: &str,
    ) -> Result<DocumentHandle, ClientError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let path = format!("{}/{}", folder.path, file_name);
        let handle = DocumentHandle {
            id: format!("doc-{n}"),
            path: path.clone(),
            page_count: 1,
        };
        self.documents.lock().unwrap().insert(path, handle.clone());
        Ok(handle)
    }

    async fn set_metadata(
        &self,
        _document: &DocumentHandle,
        _attributes: &DocumentAttributes,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn lookup_by_key(
        &self,
        _reference: &DocumentHandle,
        column: &str,
        value: &str,
    ) -> Result<Vec<ReferenceRow>, ClientError> {
        Ok(self
            .reference
            .iter()
            .filter(|row| row.get(column).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn check_in(
        &self,
        path: &str,
        content: &Path,
        _file_name: &str,
    ) -> Result<DocumentHandle, ClientError> {
        let body = std::fs::read_to_string(content)?;
        self.check_ins
            .lock()
            .unwrap()
            .push((path.to_string(), body));
        Ok(DocumentHandle {
            id: "report".to_string(),
            path: path.to_string(),
            page_count: 0,
        })
    }

    async fn document_by_uid(&self, uid: &str) -> Result<DocumentHandle, ClientError> {
        Err(format!("no document {uid}").into())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn settings(temp: &TempDir) -> SyncSettings {
    SyncSettings {
        routes: vec![LocationRoute {
            name: "Main".to_string(),
            location_ids: vec![1],
            folder: FOLDER.to_string(),
        }],
        reference: ReferenceSettings {
            path: EXTRACT.to_string(),
            key_column: "SSN".to_string(),
            fields: vec!["SSN".to_string()],
        },
        temp_dir: Some(temp.path().to_path_buf()),
        report: ReportSettings {
            local_path: temp.path().join("exceptions.csv"),
            remote_path: None,
            departments: Vec::new(),
        },
        ..SyncSettings::default()
    }
}

#[tokio::test]
async fn second_run_delivers_nothing_new() {
    let temp = tempdir().unwrap();
    let subjects: Vec<SubjectRecord> = (1..=30).map(|id| subject(id, 1, Some(&ssn(id)))).collect();
    let keys: Vec<String> = (1..=30).map(ssn).collect();

    let source = Arc::new(FakeSource {
        subjects,
        ..FakeSource::default()
    });
    let destination = Arc::new(FakeDestination::with_reference(&keys));
    let ledger = Arc::new(MemoryLedger::new());
    let settings = settings(&temp);

    let first = synchronise(&settings, source.clone(), destination.clone(), ledger.clone()).await;
    assert_eq!(first.exit, ExitStatus::Clean, "fatal: {:?}", first.fatal);
    assert_eq!(first.counters.subjects_seen, 30);
    assert_eq!(first.counters.documents_delivered, 60);
    assert_eq!(destination.uploads.load(Ordering::SeqCst), 60);
    assert_eq!(ledger.len(), 60);
    assert!(first.peak_active <= first.ceiling);

    let second = synchronise(&settings, source.clone(), destination.clone(), ledger.clone()).await;
    assert_eq!(second.exit, ExitStatus::Clean);
    assert_eq!(second.counters.documents_delivered, 0);
    assert_eq!(second.counters.documents_skipped, 60);
    assert_eq!(destination.uploads.load(Ordering::SeqCst), 60);
    assert_eq!(ledger.len(), 60);
    assert!(ledger
        .exists(&DocumentKey::attachment(300))
        .await
        .unwrap());

    assert_eq!(
        first.phases,
        vec![
            RunPhase::Init,
            RunPhase::AuthenticatingCollaborators,
            RunPhase::FetchingAndDispatching,
            RunPhase::Draining,
            RunPhase::ClosingCollaborators,
            RunPhase::Done(ExitStatus::Clean),
        ]
    );
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn source_auth_failure_closes_everything_and_exits_one() {
    let temp = tempdir().unwrap();
    let source = Arc::new(FakeSource {
        subjects: vec![subject(1, 1, Some(&ssn(1)))],
        fail_auth: true,
        ..FakeSource::default()
    });
    let destination = Arc::new(FakeDestination::default());
    let ledger = Arc::new(MemoryLedger::new());

    let report = synchronise(&settings(&temp), source.clone(), destination.clone(), ledger).await;

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.fatal[0], FatalError::SourceAuth(_)));
    assert!(!report.phases.contains(&RunPhase::FetchingAndDispatching));
    assert_eq!(report.phases.last(), Some(&RunPhase::Done(ExitStatus::Failed)));
    assert_eq!(source.page_calls.load(Ordering::SeqCst), 0);
    assert!(source.closed.load(Ordering::SeqCst));
    assert!(destination.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn missing_reference_extract_is_fatal_before_source_login() {
    let temp = tempdir().unwrap();
    let source = Arc::new(FakeSource::default());
    let destination = Arc::new(FakeDestination {
        missing_extract: true,
        ..FakeDestination::default()
    });

    let report = synchronise(
        &settings(&temp),
        source.clone(),
        destination.clone(),
        Arc::new(MemoryLedger::new()),
    )
    .await;

    assert_eq!(report.exit, ExitStatus::Failed);
    assert!(matches!(&report.fatal[0], FatalError::ReferenceMissing(path) if path == EXTRACT));
    assert!(!source.authenticated.load(Ordering::SeqCst));
    assert!(source.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn zero_eligible_subjects_is_a_clean_run() {
    let temp = tempdir().unwrap();
    let source = Arc::new(FakeSource {
        subjects: (1..=5).map(|id| subject(id, 9, Some(&ssn(id)))).collect(),
        ..FakeSource::default()
    });
    let destination = Arc::new(FakeDestination::default());

    let report = synchronise(
        &settings(&temp),
        source,
        destination.clone(),
        Arc::new(MemoryLedger::new()),
    )
    .await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.counters.subjects_seen, 0);
    assert!(report.exceptions.is_empty());
    assert_eq!(destination.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn exceptions_are_reported_and_checked_in() {
    let temp = tempdir().unwrap();
    let source = Arc::new(FakeSource {
        subjects: vec![
            subject(1, 1, Some(&ssn(1))),
            subject(2, 1, None),
            subject(3, 1, Some("12")),
            subject(4, 1, Some(&ssn(4))),
        ],
        ..FakeSource::default()
    });
    // Subject 4 is absent from the reference extract.
    let destination = Arc::new(FakeDestination::with_reference(&[ssn(1)]));
    let mut settings = settings(&temp);
    settings.report.remote_path = Some("/HR/_Admin - HR/Exceptions.csv".to_string());
    settings.fail_on_exceptions = true;
    settings.report.departments = vec![Department {
        id: "D1".to_string(),
        code: "4410".to_string(),
        name: "Nursing".to_string(),
    }];

    let report = synchronise(
        &settings,
        source,
        destination.clone(),
        Arc::new(MemoryLedger::new()),
    )
    .await;

    assert_eq!(report.counters.exceptions, 3);
    assert_eq!(report.counters.subjects_seen, 2);
    assert_eq!(report.counters.subjects_failed, 1);
    assert_eq!(report.counters.documents_delivered, 2);
    assert!(report.fatal.is_empty());
    assert_eq!(report.exit, ExitStatus::Failed, "fail_on_exceptions is set");

    let csv = std::fs::read_to_string(temp.path().join("exceptions.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some(
            "SSN Status,HRIS Extract Status,Department ID,Department Code,Department Name,\
             Status,Employee ID,Employee Last Name,Employee First Name,Employee Creation Date"
        )
    );
    assert!(csv.contains("Missing,N/A,D1,4410,Nursing,Employed,2,Number2,Emp,2022-01-01"));
    assert!(csv.contains("Invalid,N/A,D1,4410,Nursing,Employed,3,"));
    assert!(csv.contains("Valid,Missing,D1,4410,Nursing,Employed,4,"));

    let check_ins = destination.check_ins.lock().unwrap();
    assert_eq!(check_ins.len(), 1);
    assert_eq!(check_ins[0].0, "/HR/_Admin - HR/Exceptions.csv");
    assert_eq!(check_ins[0].1, csv);
}

#[tokio::test]
async fn page_failure_is_fatal_but_earlier_work_completes() {
    let temp = tempdir().unwrap();
    let source = Arc::new(FakeSource {
        subjects: (1..=60).map(|id| subject(id, 1, Some(&ssn(id)))).collect(),
        fail_page_at: Some(26),
        ..FakeSource::default()
    });
    let keys: Vec<String> = (1..=60).map(ssn).collect();
    let destination = Arc::new(FakeDestination::with_reference(&keys));
    let ledger = Arc::new(MemoryLedger::new());

    let report = synchronise(&settings(&temp), source.clone(), destination, ledger.clone()).await;

    assert_eq!(report.exit_code(), 1);
    assert!(matches!(report.fatal[0], FatalError::Fetch(_)));
    assert_eq!(report.counters.subjects_seen, 25);
    assert_eq!(ledger.len(), 50);
    assert!(report.phases.contains(&RunPhase::Draining));
    assert!(source.closed.load(Ordering::SeqCst));
}
