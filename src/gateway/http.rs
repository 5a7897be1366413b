//! HTTP surface of the gateway
//!
//! Routes:
//! - `POST /api/{category}/convert` multipart or JSON submission
//! - `GET  /api/{category}/status/{id}`
//! - `GET  /api/{category}/download/{id}` single-use download
//! - `GET  /api/worker/download/{id}` streamed from the worker
//! - `ANY  /api/worker/{*path}` proxied to the worker
//! - `GET  /health`

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::convert::{ConversionInput, UploadedFile};
use crate::gateway::category::{ConversionReceipt, ToolCategory};
use crate::gateway::download::{DownloadGateway, SessionStatus};
use crate::store::content_type_for;
use crate::supervisor::{ProcessSupervisor, ProxyBody};
use crate::utils::{ConvertdError, Result};

/// Seconds clients are told to wait when the worker is unavailable
const RETRY_AFTER_SECS: &str = "5";

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub categories: Arc<BTreeMap<String, Arc<ToolCategory>>>,
    pub downloads: Arc<DownloadGateway>,
    pub supervisor: Option<Arc<ProcessSupervisor>>,
    /// Hard cap on request bodies, above any category limit
    pub max_body_bytes: usize,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    fn category(&self, name: &str) -> Option<&Arc<ToolCategory>> {
        self.categories.get(name)
    }

    fn supervisor(&self) -> Result<&Arc<ProcessSupervisor>> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| ConvertdError::worker_unavailable("no conversion worker configured"))
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/api/worker/download/{id}", get(worker_download))
        .route("/api/worker/{*path}", any(worker_proxy))
        .route("/api/{category}/convert", post(convert))
        .route("/api/{category}/status/{id}", get(status))
        .route("/api/{category}/download/{id}", get(download))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

impl IntoResponse for ConvertdError {
    fn into_response(self) -> Response {
        match self.severity() {
            tracing::Level::ERROR => error!(error = %self, "Request failed"),
            tracing::Level::WARN => warn!(error = %self, "Request failed"),
            tracing::Level::INFO => info!(error = %self, "Request rejected"),
            _ => debug!(error = %self, "Request rejected"),
        }

        if let ConvertdError::WorkerResponse {
            status,
            content_type,
            body,
        } = self
        {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, body).into_response();
            if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            return response;
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retry = matches!(
            self,
            ConvertdError::WorkerUnavailable { .. } | ConvertdError::WorkerCrashed { .. }
        );

        let mut response = (status, Json(json!({ "error": self.client_message() }))).into_response();
        if retry {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

fn unknown_category(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("Unknown tool category: {}", name) })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut categories = Vec::with_capacity(state.categories.len());
    for (name, category) in state.categories.iter() {
        categories.push(json!({
            "name": name,
            "ttlSeconds": category.config().ttl_secs,
            "activeSessions": category.registry().len().await,
        }));
    }

    let worker = state.supervisor.as_ref().map(|supervisor| {
        json!({
            "state": supervisor.state(),
            "restarts": supervisor.restarts(),
        })
    });

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": (Utc::now() - state.started_at).num_seconds().max(0),
        "categories": categories,
        "worker": worker,
    }))
}

async fn convert(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Response {
    let Some(category) = state.category(&name).cloned() else {
        return unknown_category(&name);
    };

    match submit(&category, request, state.max_body_bytes).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn submit(
    category: &ToolCategory,
    request: Request,
    limit: usize,
) -> Result<ConversionReceipt> {
    let input = read_conversion_input(request, limit).await?;
    category.submit(input).await
}

async fn status(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Response {
    let Some(category) = state.category(&name) else {
        return unknown_category(&name);
    };

    let result: Result<Json<SessionStatus>> = state
        .downloads
        .status(category.registry(), &id)
        .await
        .map(Json);
    result.into_response()
}

async fn download(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Response {
    let Some(category) = state.category(&name) else {
        return unknown_category(&name);
    };

    let download = match state.downloads.download(category.registry(), &id).await {
        Ok(download) => download,
        Err(e) => return e.into_response(),
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, &download.artifact.content_type);
    insert_header(
        &mut headers,
        header::CONTENT_DISPOSITION,
        &download.content_disposition(),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.artifact.size));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    (headers, Body::from_stream(download.body)).into_response()
}

async fn worker_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ConvertdError> {
    let download = state.supervisor()?.proxy_download(&id).await?;

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::CONTENT_TYPE, &download.content_type);
    insert_header(
        &mut headers,
        header::CONTENT_DISPOSITION,
        &download.content_disposition,
    );
    if let Some(length) = download.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }

    Ok((headers, Body::from_stream(download.stream)).into_response())
}

async fn worker_proxy(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request,
) -> std::result::Result<Response, ConvertdError> {
    let supervisor = Arc::clone(state.supervisor()?);

    let method = request.method().clone();
    let headers = request.headers().clone();
    let path_and_query = match request.uri().query() {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };

    let body = match body_kind(&headers) {
        BodyKind::Multipart => {
            let (fields, files) = read_multipart(request, state.max_body_bytes).await?;
            ProxyBody::Multipart { fields, files }
        }
        BodyKind::Json => {
            let data = read_body(request, state.max_body_bytes).await?;
            if data.is_empty() {
                ProxyBody::Empty
            } else {
                ProxyBody::Json(serde_json::from_slice(&data).map_err(|e| {
                    ConvertdError::invalid_input(format!("Invalid JSON body: {}", e))
                })?)
            }
        }
        BodyKind::Other => {
            let data = read_body(request, state.max_body_bytes).await?;
            if data.is_empty() {
                ProxyBody::Empty
            } else {
                ProxyBody::Raw(data)
            }
        }
    };

    let proxied = supervisor
        .proxy_request(method, &path_and_query, &headers, body)
        .await?;

    let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, proxied.body).into_response();
    response.headers_mut().extend(proxied.headers);
    Ok(response)
}

enum BodyKind {
    Multipart,
    Json,
    Other,
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        BodyKind::Multipart
    } else if content_type.starts_with("application/json") {
        BodyKind::Json
    } else {
        BodyKind::Other
    }
}

/// Parses a submission into the converter's input.
///
/// Multipart uploads carry at most one file; JSON bodies carry only fields.
async fn read_conversion_input(request: Request, limit: usize) -> Result<ConversionInput> {
    match body_kind(request.headers()) {
        BodyKind::Multipart => {
            let (fields, files) = read_multipart(request, limit).await?;
            if files.len() > 1 {
                return Err(ConvertdError::invalid_input("Only one file per conversion"));
            }
            Ok(ConversionInput {
                file: files.into_iter().next(),
                fields: fields.into_iter().collect(),
            })
        }
        BodyKind::Json => {
            let data = read_body(request, limit).await?;
            let value: Value = serde_json::from_slice(&data)
                .map_err(|e| ConvertdError::invalid_input(format!("Invalid JSON body: {}", e)))?;
            let Value::Object(map) = value else {
                return Err(ConvertdError::invalid_input("JSON body must be an object"));
            };

            let fields = map
                .into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, value)
                })
                .collect();
            Ok(ConversionInput { file: None, fields })
        }
        BodyKind::Other => Err(ConvertdError::invalid_input(
            "Expected a multipart/form-data or JSON body",
        )),
    }
}

async fn read_multipart(
    request: Request,
    limit: usize,
) -> Result<(Vec<(String, String)>, Vec<UploadedFile>)> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ConvertdError::invalid_input(format!("Invalid multipart body: {}", e)))?;

    let mut fields = Vec::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, limit))? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| content_type_for(&file_name).to_string());
                let data = field.bytes().await.map_err(|e| multipart_error(e, limit))?;
                files.push(UploadedFile {
                    field_name,
                    file_name,
                    content_type,
                    data,
                });
            }
            None => {
                let value = field.text().await.map_err(|e| multipart_error(e, limit))?;
                fields.push((field_name, value));
            }
        }
    }

    Ok((fields, files))
}

fn multipart_error(e: MultipartError, limit: usize) -> ConvertdError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        // The body was cut off at the limit, so only a lower bound is known
        return ConvertdError::too_large(limit as u64 + 1, limit as u64);
    }
    ConvertdError::invalid_input(format!("Invalid multipart body: {}", e))
}

async fn read_body(request: Request, limit: usize) -> Result<Bytes> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(size) = declared {
        if size > limit as u64 {
            return Err(ConvertdError::too_large(size, limit as u64));
        }
    }

    // Chunked bodies carry no length, so the limit is enforced while reading
    let mut stream = request.into_body().into_data_stream();
    let mut data = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            ConvertdError::invalid_input(format!("Failed to read request body: {}", e))
        })?;
        let received = data.len() as u64 + chunk.len() as u64;
        if received > limit as u64 {
            return Err(ConvertdError::too_large(received, limit as u64));
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data.freeze())
}

fn insert_header(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Dropping invalid header value"),
    }
}
