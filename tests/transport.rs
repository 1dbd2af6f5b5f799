//! Submission and form download against an in-process HTTP server

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use fieldsync::events::EventBus;
use fieldsync::forms::{FormFilter, FormMetadata, FormRegistry};
use fieldsync::instances::{InstanceId, InstanceRegistry, InstanceStatus, NewInstance};
use fieldsync::storage::{md5_bytes, StoragePaths, Subdirectory};
use fieldsync::sync::{FormSynchronizer, SyncMode};
use fieldsync::transport::{
    ChunkLimits, Credentials, HttpTransport, OpenRosaTransport, TransportConfig,
};
use fieldsync::upload::InstanceUploader;
use fieldsync::Error;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const BIRDS_XML: &str = "<h:html><h:head><h:title>Birds</h:title></h:head></h:html>";
const PHOTO: &[u8] = b"not really a jpeg";

#[derive(Debug, Clone)]
struct Received {
    path: String,
    headers: HeaderMap,
    body: String,
}

#[derive(Clone)]
struct ServerState {
    base: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl ServerState {
    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn record(
    State(state): State<ServerState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    StatusCode::CREATED
}

async fn unauthorized(body: Bytes) -> StatusCode {
    drop(body);
    StatusCode::UNAUTHORIZED
}

async fn broken(body: Bytes) -> (StatusCode, &'static str) {
    drop(body);
    (StatusCode::INTERNAL_SERVER_ERROR, "database is down")
}

/// Accepts the first request and fails every later one
async fn flaky(
    State(state): State<ServerState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let mut received = state.received.lock().unwrap();
    received.push(Received {
        path: uri.path().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });
    if received.len() == 1 {
        StatusCode::CREATED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn no_content(body: Bytes) -> StatusCode {
    drop(body);
    StatusCode::NO_CONTENT
}

async fn slow(body: Bytes) -> StatusCode {
    drop(body);
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::CREATED
}

async fn form_list(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!([{
        "formID": "birds",
        "name": "Birds",
        "version": "1",
        "hash": format!("md5:{}", md5_bytes(BIRDS_XML.as_bytes())),
        "downloadUrl": format!("{}/formXml/birds", state.base),
        "manifestUrl": format!("{}/manifest/birds", state.base),
    }]))
}

async fn captive_portal() -> Html<&'static str> {
    Html("<html><body>Please log in to the wifi</body></html>")
}

async fn form_xml(UrlPath(id): UrlPath<String>) -> impl IntoResponse {
    if id == "birds" {
        ([(header::CONTENT_TYPE, "text/xml")], BIRDS_XML).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn manifest(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "mediaFiles": [{
            "filename": "photo.jpg",
            "hash": format!("md5:{}", md5_bytes(PHOTO)),
            "downloadUrl": format!("{}/media/photo.jpg", state.base),
        }]
    }))
}

async fn media() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/jpeg")], PHOTO)
}

async fn start_server() -> ServerState {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState {
        base: format!("http://{}", addr),
        received: Arc::new(Mutex::new(Vec::new())),
    };

    let app = Router::new()
        .route("/submission", post(record))
        .route("/token/submission", post(record))
        .route("/secure/submission", post(unauthorized))
        .route("/broken/submission", post(broken))
        .route("/flaky/submission", post(flaky))
        .route("/empty/submission", post(no_content))
        .route("/slow/submission", post(slow))
        .route("/formList", get(form_list))
        .route("/portal/formList", get(captive_portal))
        .route("/formXml/{id}", get(form_xml))
        .route("/manifest/birds", get(manifest))
        .route("/media/photo.jpg", get(media))
        .with_state(state.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    state
}

struct Device {
    _tmp: TempDir,
    forms: Arc<FormRegistry>,
    instances: Arc<InstanceRegistry>,
}

fn device() -> Device {
    let tmp = tempfile::tempdir().unwrap();
    let paths = StoragePaths::new(tmp.path());
    paths.ensure_dirs().unwrap();
    let events = EventBus::new();
    Device {
        forms: Arc::new(FormRegistry::open(&paths, events.clone()).unwrap()),
        instances: Arc::new(InstanceRegistry::open(&paths, events).unwrap()),
        _tmp: tmp,
    }
}

/// A finalized instance with three 40-byte attachments
fn finalized_instance(device: &Device) -> InstanceId {
    let file = device
        .forms
        .paths()
        .dir(Subdirectory::Forms)
        .join("household.xml");
    std::fs::write(&file, "<h:html/>").unwrap();
    let form_id = device
        .forms
        .register(&file, FormMetadata::new("household").with_version("1"))
        .unwrap();
    let form = device.forms.get(form_id).unwrap().unwrap();

    let id = device.instances.create(&form, NewInstance::default()).unwrap();
    let instance = device.instances.get(id).unwrap().unwrap();
    let dir = instance.instance_dir().unwrap();
    std::fs::write(&instance.instance_file_path, "<data/>").unwrap();
    for name in ["a.jpg", "b.jpg", "c.m4a"] {
        std::fs::write(dir.join(name), [b'x'; 40]).unwrap();
    }
    device
        .instances
        .update_status(id, InstanceStatus::Complete)
        .unwrap();
    id
}

fn transport(credentials: Credentials, limits: ChunkLimits) -> Arc<HttpTransport> {
    let config = TransportConfig {
        limits,
        ..Default::default()
    };
    Arc::new(HttpTransport::new(config, Some(credentials)).unwrap())
}

fn uploader(device: &Device, transport: Arc<HttpTransport>, endpoint: &str) -> InstanceUploader {
    InstanceUploader::new(device.instances.clone(), device.forms.clone(), transport)
        .with_default_endpoint(endpoint)
}

fn status(device: &Device, id: InstanceId) -> InstanceStatus {
    device.instances.get(id).unwrap().unwrap().status
}

#[tokio::test]
async fn test_large_submission_split_across_requests() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    // 7 bytes of XML + 40 + 40 > 60: every attachment travels alone
    let limits = ChunkLimits {
        max_request_bytes: 60,
        max_files_per_request: 100,
    };
    let transport = transport(Credentials::basic("enumerator", "pw"), limits);
    let outcome = uploader(&device, transport, &format!("{}/submission", server.base))
        .upload(id)
        .await
        .unwrap();

    assert_eq!(outcome.result.requests, 3);
    assert_eq!(outcome.result.status, 201);
    assert_eq!(status(&device, id), InstanceStatus::Submitted);

    let received = server.received();
    assert_eq!(received.len(), 3);
    for (n, request) in received.iter().enumerate() {
        assert_eq!(request.path, "/submission");
        assert!(request.body.contains("name=\"xml_submission_file\""));
        assert_eq!(request.headers["x-openrosa-version"], "1.0");
        assert_eq!(request.headers["form_status"], "complete");
        assert!(request.headers["authorization"]
            .to_str()
            .unwrap()
            .starts_with("Basic "));
        let incomplete = request.body.contains("name=\"*isIncomplete*\"");
        assert_eq!(incomplete, n < 2, "request {}", n);
    }
    assert!(received[0].body.contains("filename=\"a.jpg\""));
    assert!(received[2].body.contains("filename=\"c.m4a\""));
}

#[tokio::test]
async fn test_small_submission_is_one_request() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let transport = transport(Credentials::basic("enumerator", "pw"), ChunkLimits::default());
    let outcome = uploader(&device, transport, &format!("{}/submission", server.base))
        .upload(id)
        .await
        .unwrap();

    assert_eq!(outcome.result.requests, 1);
    let received = server.received();
    assert_eq!(received.len(), 1);
    assert!(!received[0].body.contains("*isIncomplete*"));
    assert!(received[0]
        .body
        .to_ascii_lowercase()
        .contains("content-type: image/jpeg"));
}

#[tokio::test]
async fn test_unauthorized_keeps_status() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);
    let before = device.instances.get(id).unwrap().unwrap();

    let transport = transport(Credentials::basic("enumerator", "wrong"), ChunkLimits::default());
    let err = uploader(&device, transport, &format!("{}/secure/submission", server.base))
        .upload(id)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Authentication { .. }));
    let after = device.instances.get(id).unwrap().unwrap();
    assert_eq!(after.status, InstanceStatus::Complete);
    assert_eq!(after.last_status_change_date, before.last_status_change_date);
}

#[tokio::test]
async fn test_server_error_marks_submission_failed() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let transport = transport(Credentials::basic("enumerator", "pw"), ChunkLimits::default());
    let err = uploader(&device, transport, &format!("{}/broken/submission", server.base))
        .upload(id)
        .await
        .unwrap_err();

    match err {
        Error::Server {
            status, message, ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "database is down");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(status(&device, id), InstanceStatus::SubmissionFailed);
}

#[tokio::test]
async fn test_failed_later_chunk_marks_submission_failed() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let limits = ChunkLimits {
        max_request_bytes: 60,
        max_files_per_request: 100,
    };
    let transport = transport(Credentials::basic("enumerator", "pw"), limits);
    let err = uploader(&device, transport, &format!("{}/flaky/submission", server.base))
        .upload(id)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Server { status: 500, .. }));
    assert_eq!(server.received().len(), 2);
    assert!(server.received()[0].body.contains("name=\"*isIncomplete*\""));
    assert_eq!(status(&device, id), InstanceStatus::SubmissionFailed);
}

#[tokio::test]
async fn test_no_content_reply_is_not_success() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let transport = transport(Credentials::basic("enumerator", "pw"), ChunkLimits::default());
    let err = uploader(&device, transport, &format!("{}/empty/submission", server.base))
        .upload(id)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Server { status: 204, .. }));
    assert_eq!(status(&device, id), InstanceStatus::SubmissionFailed);
}

#[tokio::test]
async fn test_timeout_is_a_network_error() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let config = TransportConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let transport = Arc::new(
        HttpTransport::new(config, Some(Credentials::basic("enumerator", "pw"))).unwrap(),
    );
    let err = uploader(&device, transport, &format!("{}/slow/submission", server.base))
        .upload(id)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Network { .. }));
    assert!(err.is_retryable());
    assert_eq!(status(&device, id), InstanceStatus::SubmissionFailed);
}

#[tokio::test]
async fn test_token_credentials_use_token_path() {
    let server = start_server().await;
    let device = device();
    let id = finalized_instance(&device);

    let transport = transport(Credentials::token("s3cret"), ChunkLimits::default());
    uploader(&device, transport, &format!("{}/submission", server.base))
        .upload(id)
        .await
        .unwrap();

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].path, "/token/submission");
    assert_eq!(received[0].headers["authorization"], "Bearer s3cret");
}

#[tokio::test]
async fn test_wrong_content_type_is_reported() {
    let server = start_server().await;
    let transport = transport(Credentials::basic("u", "p"), ChunkLimits::default());

    let err = transport
        .fetch_form_list(&format!("{}/portal/formList", server.base))
        .await
        .unwrap_err();
    match err {
        Error::UnexpectedContentType {
            expected, actual, ..
        } => {
            assert_eq!(expected, "application/json");
            assert!(actual.starts_with("text/html"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_downloads_form_and_media() {
    let server = start_server().await;
    let device = device();
    let transport = transport(Credentials::basic("u", "p"), ChunkLimits::default());

    let synchronizer = FormSynchronizer::new(
        device.forms.clone(),
        device.instances.clone(),
        transport,
        format!("{}/formList", server.base),
        SyncMode::MatchExactly,
    );
    let report = synchronizer.sync().await.unwrap();
    assert_eq!(report.added, vec!["birds"]);
    assert!(report.failures.is_empty());

    let forms = device.forms.list(&FormFilter::Live).unwrap();
    assert_eq!(forms.len(), 1);
    let birds = &forms[0];
    assert_eq!(birds.version.as_deref(), Some("1"));
    assert_eq!(birds.md5_hash, md5_bytes(BIRDS_XML.as_bytes()));
    assert_eq!(
        std::fs::read(birds.form_media_path.join("photo.jpg")).unwrap(),
        PHOTO
    );

    // a second cycle finds nothing to do
    assert!(synchronizer.sync().await.unwrap().is_empty());
}
