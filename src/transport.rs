use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use crate::model::{Credential, Destination};

/// Classified result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// `receipt` is a backend reference to the delivered item, when it gives one.
    Success { receipt: Option<String> },
    /// The credential was rejected; the whole endpoint link is invalid.
    AuthFailure(String),
    /// Network or server trouble; eligible for a manual retry.
    TransientFailure(String),
    /// Missing file or a request the backend will never accept.
    PermanentFailure(String),
}

/// Backend-specific transfer of one file. Implementations must map every
/// failure onto a `DeliveryOutcome`.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(
        &self,
        file: &Path,
        destination: &Destination,
        credential: &Credential,
    ) -> DeliveryOutcome;
}

/// Generic multipart upload with a bearer credential.
#[derive(Clone)]
pub struct HttpDeliverer {
    http: Client,
    upload_url: Url,
}

impl fmt::Debug for HttpDeliverer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDeliverer")
            .field("upload_url", &self.upload_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    url: Option<String>,
    id: Option<String>,
}

impl HttpDeliverer {
    pub fn new(upload_url: Url, timeout: Duration) -> reqwest::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("wings/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, upload_url })
    }

    pub fn build_request(
        &self,
        file_name: &str,
        content: Vec<u8>,
        destination: &Destination,
        credential: &Credential,
    ) -> reqwest::Result<reqwest::Request> {
        let mut form = multipart::Form::new()
            .text("destination_id", destination.destination_id().to_string())
            .part(
                "file",
                multipart::Part::bytes(content)
                    .file_name(file_name.to_string())
                    .mime_str(content_type(Path::new(file_name)))?,
            );
        for (key, value) in &credential.settings {
            form = form.text(key.clone(), value.clone());
        }
        self.http
            .post(self.upload_url.clone())
            .bearer_auth(&credential.token)
            .multipart(form)
            .build()
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(
        &self,
        file: &Path,
        destination: &Destination,
        credential: &Credential,
    ) -> DeliveryOutcome {
        let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
            return DeliveryOutcome::PermanentFailure(format!("invalid file name: {}", file.display()));
        };
        let content = match fs::read(file).await {
            Ok(content) => content,
            Err(err) => {
                return DeliveryOutcome::PermanentFailure(format!(
                    "failed to read {}: {}",
                    file.display(),
                    err
                ))
            }
        };

        let request = match self.build_request(file_name, content, destination, credential) {
            Ok(request) => request,
            Err(err) => return DeliveryOutcome::PermanentFailure(format!("invalid request: {err}")),
        };
        debug!(url = %request.url(), %destination, file_name, "uploading");

        let res = match self.http.execute(request).await {
            Ok(res) => res,
            Err(err) => {
                warn!(?err, %destination, "upload request failed");
                return DeliveryOutcome::TransientFailure(err.to_string());
            }
        };

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %destination, body = %body, "upload rejected");
            return classify_status(status, body);
        }

        let receipt = res
            .json::<UploadResponse>()
            .await
            .ok()
            .and_then(|r| r.url.or(r.id));
        DeliveryOutcome::Success { receipt }
    }
}

/// Map a non-success HTTP status onto the delivery taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> DeliveryOutcome {
    let reason = format!("{status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeliveryOutcome::AuthFailure(reason),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            DeliveryOutcome::TransientFailure(reason)
        }
        s if s.is_server_error() => DeliveryOutcome::TransientFailure(reason),
        _ => DeliveryOutcome::PermanentFailure(reason),
    }
}

fn content_type(file_path: &Path) -> &'static str {
    match file_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "pdf" => "application/pdf",
        Some(ext) if ext == "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
