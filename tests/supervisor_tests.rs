#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path};
use axum::http::{Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use convertd::config::{CategoryConfig, Config, ConversionMode, ConverterKind, WorkerConfig};
use convertd::convert::{ConversionInput, UploadedFile};
use convertd::gateway::{build_state, router};
use convertd::session::ManualClock;
use convertd::store::LocalArtifactStore;
use convertd::supervisor::{ProcessSupervisor, ProxyBody, WorkerState};
use convertd::utils::ConvertdError;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

const DOCX_BYTES: &[u8] = b"PK-fake-docx";

/// Starts an HTTP server that behaves like the conversion worker
async fn spawn_fake_worker() -> u16 {
    let app = Router::new()
        .route(
            "/convert",
            post(|mut multipart: Multipart| async move {
                let mut files = 0;
                while let Some(field) = multipart.next_field().await.unwrap() {
                    if field.file_name().is_some() {
                        files += 1;
                    }
                    let _ = field.bytes().await.unwrap();
                }
                Json(json!({
                    "success": true,
                    "download_id": "abc123",
                    "pages": 2,
                    "files": files,
                }))
            }),
        )
        .route(
            "/reject",
            post(|| async {
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": "bad pdf" })),
                )
            }),
        )
        .route(
            "/download/{id}",
            get(|Path(id): Path<String>| async move {
                if id == "abc123" {
                    (
                        [
                            (
                                header::CONTENT_TYPE,
                                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                            ),
                            (header::CONTENT_DISPOSITION, "attachment; filename=\"out.docx\""),
                        ],
                        DOCX_BYTES,
                    )
                        .into_response()
                } else {
                    (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown download" })))
                        .into_response()
                }
            }),
        )
        .route(
            "/echo",
            any(|method: Method, body: Bytes| async move { format!("{} {}", method, body.len()) }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Worker that accepts conversions but never finishes sending the result
async fn spawn_stalling_worker() -> u16 {
    let app = Router::new()
        .route(
            "/convert",
            post(|| async { Json(json!({ "success": true, "download_id": "slow" })) }),
        )
        .route(
            "/download/{id}",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                DOCX_BYTES
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// Worker process that announces readiness and then stays up
fn long_running_worker(port: u16) -> WorkerConfig {
    let mut config = WorkerConfig::new("sh");
    config.args = vec![
        "-c".to_string(),
        "echo 'Running on http://127.0.0.1'; exec sleep 30".to_string(),
    ];
    config.port = port;
    config.respawn_delay_secs = 1;
    config
}

async fn ready_supervisor(config: WorkerConfig) -> Arc<ProcessSupervisor> {
    let supervisor = Arc::new(ProcessSupervisor::new(config).unwrap());
    supervisor.start();
    assert!(
        supervisor
            .wait_for_state(WorkerState::Ready, Duration::from_secs(10))
            .await,
        "worker never became ready"
    );
    supervisor
}

#[tokio::test]
async fn test_supervisor_recovers_after_crash() {
    let mut config = WorkerConfig::new("sh");
    config.args = vec![
        "-c".to_string(),
        "echo 'Running on http://127.0.0.1'; sleep 0.3; exit 3".to_string(),
    ];
    config.respawn_delay_secs = 1;
    let supervisor = ready_supervisor(config).await;

    assert!(
        supervisor
            .wait_for_state(WorkerState::Crashed, Duration::from_secs(5))
            .await
    );
    assert!(!supervisor.is_ready());

    // Requests are refused while the worker is down
    let result = supervisor
        .proxy_request(
            Method::GET,
            "/echo",
            &header::HeaderMap::new(),
            ProxyBody::Empty,
        )
        .await;
    assert!(matches!(result, Err(ConvertdError::WorkerUnavailable { .. })));

    // Respawned after the delay
    assert!(
        supervisor
            .wait_for_state(WorkerState::Ready, Duration::from_secs(10))
            .await
    );
    assert!(supervisor.restarts() >= 1);

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_stops_a_running_worker() {
    let port = spawn_fake_worker().await;
    let supervisor = ready_supervisor(long_running_worker(port)).await;

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert_eq!(supervisor.restarts(), 0);

    // Never respawned after shutdown
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_sends_sigterm_to_worker() {
    let temp_dir = TempDir::new().unwrap();
    let marker = temp_dir.path().join("got_term");

    let mut config = WorkerConfig::new("sh");
    config.args = vec![
        "-c".to_string(),
        "trap 'touch \"$TERM_MARKER\"; exit 0' TERM; \
         echo 'Running on http://127.0.0.1'; \
         while true; do sleep 0.1; done"
            .to_string(),
    ];
    config
        .env
        .insert("TERM_MARKER".to_string(), marker.display().to_string());
    let supervisor = ready_supervisor(config).await;

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert!(marker.exists(), "worker did not get a chance to clean up");
}

#[tokio::test]
async fn test_shutdown_kills_worker_ignoring_sigterm() {
    let mut config = WorkerConfig::new("sh");
    config.args = vec![
        "-c".to_string(),
        "trap '' TERM; echo 'Running on http://127.0.0.1'; while true; do sleep 0.1; done"
            .to_string(),
    ];
    config.stop_grace_secs = 1;
    let supervisor = ready_supervisor(config).await;

    let started = std::time::Instant::now();
    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), WorkerState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_stale_ready_marker_is_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let first_run = temp_dir.path().join("first_run");

    // The first child exits while a background job still holds its stdout and
    // prints the marker after the successor was spawned. The successor never
    // announces itself.
    let mut config = WorkerConfig::new("sh");
    config.args = vec![
        "-c".to_string(),
        "if [ -e \"$FIRST_RUN\" ]; then exec sleep 30; fi; \
         touch \"$FIRST_RUN\"; \
         echo 'Running on http://127.0.0.1'; \
         (sleep 2.5; echo 'Running on http://127.0.0.1') & \
         sleep 0.5; exit 3"
            .to_string(),
    ];
    config
        .env
        .insert("FIRST_RUN".to_string(), first_run.display().to_string());
    config.respawn_delay_secs = 1;
    let supervisor = ready_supervisor(config).await;

    assert!(
        supervisor
            .wait_for_state(WorkerState::Starting, Duration::from_secs(5))
            .await
    );
    assert!(
        !supervisor
            .wait_for_state(WorkerState::Ready, Duration::from_secs(3))
            .await
    );
    assert_eq!(supervisor.state(), WorkerState::Starting);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_forward_conversion_times_out_on_stalled_download() {
    let port = spawn_stalling_worker().await;
    let mut config = long_running_worker(port);
    config.request_timeout_secs = 1;
    let supervisor = ready_supervisor(config).await;

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.forward_conversion("/convert", ConversionInput::default()),
    )
    .await
    .expect("conversion hung past the request timeout");
    assert!(matches!(result, Err(ConvertdError::WorkerRequest { .. })));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_proxy_request_and_download() {
    let port = spawn_fake_worker().await;
    let supervisor = ready_supervisor(long_running_worker(port)).await;

    let response = supervisor
        .proxy_request(
            Method::POST,
            "/echo",
            &header::HeaderMap::new(),
            ProxyBody::Raw(Bytes::from_static(b"hello")),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"POST 5");

    // Worker errors come back untouched
    let response = supervisor
        .proxy_request(
            Method::POST,
            "/reject",
            &header::HeaderMap::new(),
            ProxyBody::Json(json!({})),
        )
        .await
        .unwrap();
    assert_eq!(response.status, 422);
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["error"], "bad pdf");

    let download = supervisor.proxy_download("abc123").await.unwrap();
    assert_eq!(download.content_disposition, "attachment; filename=\"out.docx\"");
    assert_eq!(download.content_length, Some(DOCX_BYTES.len() as u64));

    let missing = supervisor.proxy_download("nothing").await;
    match missing {
        Err(ConvertdError::WorkerResponse { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected passthrough, got {:?}", other),
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_forward_conversion_fetches_the_result() {
    let port = spawn_fake_worker().await;
    let supervisor = ready_supervisor(long_running_worker(port)).await;

    let input = ConversionInput {
        file: Some(UploadedFile {
            field_name: "file".to_string(),
            file_name: "scan.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            data: Bytes::from_static(b"%PDF-1.7"),
        }),
        ..Default::default()
    };

    let output = supervisor.forward_conversion("/convert", input).await.unwrap();
    assert_eq!(output.file_name, "out.docx");
    assert_eq!(&output.data[..], DOCX_BYTES);
    assert_eq!(output.metadata["pages"], 2);
    assert_eq!(output.metadata["files"], 1);
    assert!(output.metadata.get("download_id").is_none());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_worker_category_over_http() {
    let port = spawn_fake_worker().await;
    let supervisor = ready_supervisor(long_running_worker(port)).await;

    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(LocalArtifactStore::new(temp_dir.path().to_path_buf()));
    store.initialize().await.unwrap();

    let mut config = Config {
        download_cleanup_delay_ms: 0,
        worker: Some(long_running_worker(port)),
        ..Config::default()
    };
    config.categories.push(CategoryConfig {
        name: "pdf-tools".to_string(),
        ttl_secs: 600,
        max_upload_bytes: 1024 * 1024,
        allowed_types: vec!["application/pdf".to_string()],
        mode: ConversionMode::Deferred,
        converter: ConverterKind::Worker {
            endpoint: "/convert".to_string(),
        },
    });

    let state = build_state(
        &config,
        store,
        Arc::new(ManualClock::default()),
        Some(supervisor.clone()),
    )
    .unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    let client = reqwest::Client::new();

    let form = Form::new().part(
        "file",
        Part::bytes(b"%PDF-1.7".to_vec())
            .file_name("scan.pdf")
            .mime_str("application/pdf")
            .unwrap(),
    );
    let receipt: Value = client
        .post(format!("{}/api/pdf-tools/convert", base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(receipt["ready"], false);
    let id = receipt["sessionId"].as_str().unwrap().to_string();

    let mut status = Value::Null;
    for _ in 0..100 {
        status = client
            .get(format!("{}/api/pdf-tools/status/{}", base_url, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if status["ready"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status["ready"], true);
    assert_eq!(status["metadata"]["pages"], 2);

    let download = client
        .get(format!("{}/api/pdf-tools/download/{}", base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(download.status(), 200);
    assert_eq!(&download.bytes().await.unwrap()[..], DOCX_BYTES);

    // Raw proxy and streamed worker download
    let echoed = client
        .get(format!("{}/api/worker/echo?x=1", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(echoed.status(), 200);
    assert_eq!(echoed.text().await.unwrap(), "GET 0");

    let streamed = client
        .get(format!("{}/api/worker/download/abc123", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(
        streamed.headers()["content-disposition"],
        "attachment; filename=\"out.docx\""
    );
    assert_eq!(&streamed.bytes().await.unwrap()[..], DOCX_BYTES);

    let rejected = client
        .post(format!("{}/api/worker/reject", base_url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 422);

    let health: Value = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["worker"]["state"], "ready");

    supervisor.shutdown().await;
}
