use hr_doc_sync::destination::{
    matching_rows, parse_document, parse_extract, parse_folder, DestinationSettings,
};
use hr_doc_sync::source::{entities, parse_activity, parse_attachment, parse_employee};
use hr_doc_sync_core::contract::{DocumentKind, SubjectStatus};
use serde_json::json;

fn completed() -> Vec<String> {
    vec!["Complete".to_string(), "Signed".to_string()]
}

#[test]
fn employee_search_results_are_unwrapped() {
    let body = json!({
        "response": {
            "searchResults": [
                { "employee": {
                    "id": 4821, "firstName": "Ada", "lastName": " Lovelace ",
                    "location": "12", "ssn": "123-45-6789", "status": 6,
                    "department": 77, "creationDate": "2023-01-05", "startDate": ""
                }},
                { "employee": { "firstName": "no id" } }
            ]
        }
    });

    let subjects: Vec<_> = entities(&body, "searchResults", "employee")
        .filter_map(parse_employee)
        .collect();

    assert_eq!(subjects.len(), 1);
    let ada = &subjects[0];
    assert_eq!(ada.id, 4821);
    assert_eq!(ada.last_name, "Lovelace");
    assert_eq!(ada.location_id, Some(12));
    assert_eq!(ada.external_key.as_deref(), Some("123-45-6789"));
    assert_eq!(ada.status, SubjectStatus::PreBoarding);
    assert_eq!(ada.department_id.as_deref(), Some("77"));
    assert_eq!(ada.start_date, None);
}

#[test]
fn missing_list_yields_nothing() {
    let body = json!({ "response": {} });
    assert_eq!(entities(&body, "searchResults", "employee").count(), 0);
}

#[test]
fn activity_completion_follows_configured_statuses() {
    let signed = json!({ "id": 9, "title": "03 - I-9", "status": "signed" });
    let pending = json!({ "id": 10, "title": "W4", "status": "In Progress" });

    let doc = parse_activity(1, 55, &signed, &completed()).unwrap();
    assert_eq!(doc.kind, DocumentKind::Activity);
    assert!(doc.signed_or_complete);
    assert_eq!(doc.content_ref, "employee/1/packet/55/activity/9/download");

    let doc = parse_activity(1, 55, &pending, &completed()).unwrap();
    assert!(!doc.signed_or_complete);
}

#[test]
fn attachments_are_always_complete() {
    let value = json!({
        "id": 31,
        "description": "Scanned resume",
        "attachmentType": "Resume_Type",
        "fileName": "resume.pdf"
    });
    let doc = parse_attachment(7, &value).unwrap();
    assert_eq!(doc.kind, DocumentKind::Attachment);
    assert!(doc.signed_or_complete);
    assert_eq!(doc.title, "Scanned resume");
    assert_eq!(doc.attachment_type.as_deref(), Some("Resume_Type"));
    assert_eq!(doc.file_name.as_deref(), Some("resume.pdf"));
    assert_eq!(doc.content_ref, "employee/7/attachment/31/data");
}

#[test]
fn document_and_folder_ids_come_from_href() {
    let doc = parse_document(&json!({
        "Href": "https://apina11.springcm.com/v201606/documents/abc-123",
        "Path": "/HR/Plant/1 Ada - 9 I-9.pdf",
        "PageCount": 4
    }))
    .unwrap();
    assert_eq!(doc.id, "abc-123");
    assert_eq!(doc.path, "/HR/Plant/1 Ada - 9 I-9.pdf");
    assert_eq!(doc.page_count, 4);

    let folder = parse_folder(
        &json!({ "Href": "https://apina11.springcm.com/v201606/folders/f-9/" }),
        "/HR/Plant",
    )
    .unwrap();
    assert_eq!(folder.id, "f-9");
    assert_eq!(folder.path, "/HR/Plant");

    assert!(parse_document(&json!({ "Name": "orphan" })).is_err());
}

#[test]
fn extract_rows_match_on_exact_column_value() {
    let csv = b" SSN ,Last Name,Status\n\
        123456789,Lovelace,Active\n\
        987654321,Hopper,Active\n\
        123456789,Duplicate,Terminated\n";
    let rows = parse_extract(csv).unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0].get("Last Name").map(String::as_str),
        Some("Lovelace")
    );

    assert_eq!(matching_rows(&rows, "SSN", "987654321").len(), 1);
    assert_eq!(matching_rows(&rows, "SSN", "123456789").len(), 2);
    assert!(matching_rows(&rows, "SSN", "12345678").is_empty());
    assert!(matching_rows(&rows, "Missing Column", "123456789").is_empty());
}

#[test]
fn endpoints_derive_from_data_center() {
    let settings = DestinationSettings {
        data_center: "NA11".to_string(),
        client_id: "id".to_string(),
        client_secret: String::new(),
        auth_url: None,
        api_url: Some("http://localhost:8080/api/".to_string()),
        upload_url: None,
        download_url: None,
        timeout_secs: 30,
    };
    let endpoints = settings.endpoints();
    assert_eq!(endpoints.auth, "https://auth.springcm.com/api/v201606/apiuser");
    assert_eq!(endpoints.api, "http://localhost:8080/api");
    assert_eq!(endpoints.upload, "https://uploadna11.springcm.com/v201606");
    assert_eq!(endpoints.download, "https://downloadna11.springcm.com/v201606");

    let uat = DestinationSettings {
        data_center: "uatna11".to_string(),
        ..settings
    };
    assert_eq!(
        uat.endpoints().auth,
        "https://authuat.springcm.com/api/v201606/apiuser"
    );
}
