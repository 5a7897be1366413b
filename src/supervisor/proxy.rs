//! Forwarding requests to the supervised worker
//!
//! Requests go to `http://127.0.0.1:{port}` with the client's method and
//! headers, minus hop-by-hop headers. The `Host` header is dropped so reqwest
//! sets it for the worker. Downloads are streamed through without buffering.

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderName};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Response};
use serde_json::{Map, Value};
use tracing::debug;

use crate::convert::{ConversionInput, ConversionOutput, UploadedFile};
use crate::store::ArtifactStream;
use crate::supervisor::ProcessSupervisor;
use crate::utils::{ConvertdError, Result};

/// Used when the worker sends no `Content-Disposition`
pub const DEFAULT_DOWNLOAD_NAME: &str = "converted.docx";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request body as received by the gateway
#[derive(Debug, Clone)]
pub enum ProxyBody {
    Empty,
    Json(Value),
    /// Forwarded byte for byte with the client's `Content-Type`
    Raw(Bytes),
    /// Pre-parsed multipart upload, re-encoded for the worker
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<UploadedFile>,
    },
}

/// Buffered worker response
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Streaming worker download
pub struct ProxiedDownload {
    pub content_type: String,
    pub content_disposition: String,
    pub content_length: Option<u64>,
    pub stream: ArtifactStream,
}

impl std::fmt::Debug for ProxiedDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxiedDownload")
            .field("content_type", &self.content_type)
            .field("content_disposition", &self.content_disposition)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Reissues a request to the worker and buffers its answer
    pub async fn proxy_request(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: ProxyBody,
    ) -> Result<ProxiedResponse> {
        self.ensure_ready()?;
        let url = self.worker_url(path_and_query)?;

        // reqwest writes its own Content-Type for JSON and multipart bodies
        let rebuilt = matches!(body, ProxyBody::Json(_) | ProxyBody::Multipart { .. });
        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(forwardable_headers(headers, rebuilt))
            .timeout(self.request_timeout());

        request = match body {
            ProxyBody::Empty => request,
            ProxyBody::Json(value) => request.json(&value),
            ProxyBody::Raw(data) => request.body(data),
            ProxyBody::Multipart { fields, files } => request.multipart(build_form(fields, files)?),
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = forwardable_headers(response.headers(), false);
        let body = response.bytes().await?;

        debug!(
            method = %method,
            path = %path_and_query,
            status = status,
            "Proxied worker request"
        );

        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }

    /// Streams a file the worker holds under `download_id`.
    ///
    /// A non-success answer is returned as `WorkerResponse` with the worker's
    /// status and body untouched.
    pub async fn proxy_download(&self, download_id: &str) -> Result<ProxiedDownload> {
        self.ensure_ready()?;
        // Streamed straight to the client, so no overall deadline
        let response = self.fetch_download(download_id, None).await?;

        let content_type = header_str(&response, header::CONTENT_TYPE)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let content_disposition = header_str(&response, header::CONTENT_DISPOSITION)
            .unwrap_or_else(|| format!("attachment; filename=\"{}\"", DEFAULT_DOWNLOAD_NAME));
        let content_length = response.content_length();

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));

        Ok(ProxiedDownload {
            content_type,
            content_disposition,
            content_length,
            stream: Box::pin(stream),
        })
    }

    /// Runs a conversion on the worker.
    ///
    /// The input is posted as multipart to `endpoint`. A JSON answer carrying a
    /// `download_id` is followed by a download of that file; any other
    /// successful answer is taken as the converted file itself.
    pub async fn forward_conversion(
        &self,
        endpoint: &str,
        input: ConversionInput,
    ) -> Result<ConversionOutput> {
        self.ensure_ready()?;
        let url = self.worker_url(endpoint)?;

        let fields: Vec<(String, String)> = input.fields.into_iter().collect();
        let files: Vec<UploadedFile> = input.file.into_iter().collect();
        let response = self
            .client
            .post(&url)
            .multipart(build_form(fields, files)?)
            .timeout(self.request_timeout())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(passthrough_error(response).await);
        }

        let is_json = header_str(&response, header::CONTENT_TYPE)
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        if !is_json {
            let file_name = header_str(&response, header::CONTENT_DISPOSITION)
                .and_then(|v| filename_from_disposition(&v))
                .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string());
            let data = response.bytes().await?;
            return Ok(ConversionOutput {
                file_name,
                data,
                metadata: Map::new(),
            });
        }

        let mut metadata = match response.json::<Value>().await? {
            Value::Object(map) => map,
            _ => return Err(ConvertdError::conversion("worker returned a non-object JSON body")),
        };

        if metadata.get("success") == Some(&Value::Bool(false)) {
            let message = metadata
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reported a failure");
            return Err(ConvertdError::conversion(message));
        }
        metadata.remove("success");

        let download_id = match metadata
            .remove("download_id")
            .or_else(|| metadata.remove("downloadId"))
        {
            Some(Value::String(id)) => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(ConvertdError::conversion(
                    "worker response carries no download id",
                ));
            }
        };

        let download = self
            .fetch_download(&download_id, Some(self.request_timeout()))
            .await?;
        let file_name = header_str(&download, header::CONTENT_DISPOSITION)
            .and_then(|v| filename_from_disposition(&v))
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_string());
        let data = download.bytes().await?;

        debug!(
            endpoint = %endpoint,
            download_id = %download_id,
            size = data.len(),
            "Worker conversion complete"
        );

        Ok(ConversionOutput {
            file_name,
            data,
            metadata,
        })
    }

    /// `timeout` bounds the whole exchange, body included
    async fn fetch_download(
        &self,
        download_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let well_formed = !download_id.is_empty()
            && download_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(ConvertdError::invalid_input("Invalid download id"));
        }

        let path = self.config.download_path.replace("{id}", download_id);
        let url = self.worker_url(&path)?;
        let mut request = self.client.get(&url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(passthrough_error(response).await);
        }
        Ok(response)
    }

    fn worker_url(&self, path_and_query: &str) -> Result<String> {
        if !path_and_query.starts_with('/') || path_and_query.starts_with("//") {
            return Err(ConvertdError::invalid_input(format!(
                "invalid worker path: {}",
                path_and_query
            )));
        }
        Ok(format!("{}{}", self.config.base_url(), path_and_query))
    }
}

/// Copies headers that may cross the proxy
fn forwardable_headers(headers: &HeaderMap, drop_content_type: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || (drop_content_type && name == header::CONTENT_TYPE)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn build_form(fields: Vec<(String, String)>, files: Vec<UploadedFile>) -> Result<Form> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(name, value);
    }
    for file in files {
        let part = Part::bytes(file.data.to_vec())
            .file_name(file.file_name)
            .mime_str(&file.content_type)
            .map_err(|e| ConvertdError::invalid_input(format!("invalid content type: {}", e)))?;
        form = form.part(file.field_name, part);
    }
    Ok(form)
}

fn header_str(response: &Response, name: HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Turns a worker error answer into a verbatim passthrough
async fn passthrough_error(response: Response) -> ConvertdError {
    let status = response.status().as_u16();
    let content_type = header_str(&response, header::CONTENT_TYPE);
    match response.bytes().await {
        Ok(body) => ConvertdError::WorkerResponse {
            status,
            content_type,
            body,
        },
        Err(e) => ConvertdError::worker_request(format!(
            "failed to read worker error response: {}",
            e
        )),
    }
}

/// Extracts `filename` from a `Content-Disposition` value
pub fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let name = part.trim().strip_prefix("filename=")?.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}
