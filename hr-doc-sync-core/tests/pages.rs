use hr_doc_sync_core::contract::{DocumentHandle, MockDestinationClient};
use hr_doc_sync_core::pages::{read_uids, tally_pages, PageCountError};
use std::io::Write;
use tempfile::NamedTempFile;

fn export(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn reads_uid_column_and_skips_blanks() {
    let file = export("Name,Uid,Size\na.pdf,uid-1,10\nb.pdf,,3\nc.pdf, uid-3 ,7\n");
    let uids = read_uids(file.path()).unwrap();
    assert_eq!(uids, vec!["uid-1".to_string(), "uid-3".to_string()]);
}

#[test]
fn missing_file_is_a_read_error() {
    let err = read_uids(std::path::Path::new("/no/such/export.csv")).unwrap_err();
    assert!(matches!(err, PageCountError::Read { path, .. } if path.ends_with("export.csv")));
}

#[tokio::test]
async fn sums_page_counts_and_keeps_going_past_failures() {
    let mut destination = MockDestinationClient::new();
    destination
        .expect_document_by_uid()
        .times(4)
        .returning(|uid| match uid {
            "bad" => Err("404 not found".into()),
            other => Ok(DocumentHandle {
                id: other.to_string(),
                path: format!("/HR/{other}.pdf"),
                page_count: other.len() as u32,
            }),
        });

    let uids = ["a", "bb", "bad", "cccc"].map(String::from).to_vec();
    let tally = tally_pages(&destination, uids, 2).await;

    assert_eq!(tally.documents, 3);
    assert_eq!(tally.pages, 7);
    assert_eq!(tally.failures.len(), 1);
    assert_eq!(tally.failures[0].0, "bad");
    assert!(tally.failures[0].1.contains("404"));
}

#[tokio::test]
async fn empty_list_makes_no_lookups() {
    let mut destination = MockDestinationClient::new();
    destination.expect_document_by_uid().times(0);
    let tally = tally_pages(&destination, Vec::new(), 15).await;
    assert_eq!(tally.documents, 0);
    assert_eq!(tally.pages, 0);
    assert!(tally.failures.is_empty());
}
