//! Multipart upload of finished segments

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use thiserror::Error;
use tracing::debug;

/// Request timeout for a single upload
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upload rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// One file to send, plus the labels attached to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub url: String,
    pub token: Option<String>,
    pub file: PathBuf,
    pub system_name: String,
    pub recording_user: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Send one file. `Ok` only on a 2xx response.
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError>;
}

/// `multipart/form-data` POST over reqwest
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: Client,
}

impl HttpUploader {
    pub fn new() -> Result<Self, UploadError> {
        let client = Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let io_error = |source| UploadError::Io {
            path: request.file.clone(),
            source,
        };

        let file = tokio::fs::File::open(&request.file)
            .await
            .map_err(io_error)?;
        let length = file.metadata().await.map_err(io_error)?.len();
        let file_name = request
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_string());

        let part = Part::stream_with_length(Body::from(file), length)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;

        let mut form = Form::new();
        if !request.system_name.is_empty() {
            form = form.text("systemName", request.system_name.clone());
        }
        if !request.recording_user.is_empty() {
            form = form.text("recordingUser", request.recording_user.clone());
        }
        form = form.part("file", part);

        let mut builder = self.client.post(&request.url).multipart(form);
        if let Some(token) = request.token.as_deref().filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }

        debug!("Uploading {} ({} bytes)", request.file.display(), length);
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        body.truncate(body.char_indices().nth(200).map_or(body.len(), |(i, _)| i));
        Err(UploadError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with `status` and hand back what was received
    async fn serve_once(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                let closing = text
                    .split("boundary=")
                    .nth(1)
                    .and_then(|rest| rest.split("\r\n").next())
                    .map(|boundary| format!("--{}--", boundary));
                if closing.is_some_and(|closing| text.contains(&closing)) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
                status
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        (url, server)
    }

    fn segment(dir: &std::path::Path) -> PathBuf {
        let file = dir.join("20260101_120000.mkv");
        std::fs::write(&file, b"segment bytes").unwrap();
        file
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = HttpUploader::new().unwrap();
        let request = UploadRequest {
            url: "http://127.0.0.1:9/upload".to_string(),
            token: None,
            file: dir.path().join("gone.mkv"),
            system_name: "box".to_string(),
            recording_user: "alice".to_string(),
        };

        let err = uploader.upload(&request).await.unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
    }

    #[tokio::test]
    async fn success_response_sends_labels_file_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let (url, server) = serve_once("200 OK").await;
        let request = UploadRequest {
            url,
            token: Some("secret".to_string()),
            file: segment(dir.path()),
            system_name: "box".to_string(),
            recording_user: "alice".to_string(),
        };

        HttpUploader::new().unwrap().upload(&request).await.unwrap();

        let received = server.await.unwrap();
        let lower = received.to_lowercase();
        assert!(lower.contains("authorization: bearer secret"));
        assert!(received.contains("name=\"systemName\"\r\n\r\nbox"));
        assert!(received.contains("name=\"recordingUser\"\r\n\r\nalice"));
        assert!(received.contains("filename=\"20260101_120000.mkv\""));
        assert!(received.contains("segment bytes"));
    }

    #[tokio::test]
    async fn error_response_is_a_status_error() {
        let dir = tempfile::tempdir().unwrap();
        let (url, server) = serve_once("500 Internal Server Error").await;
        let request = UploadRequest {
            url,
            token: None,
            file: segment(dir.path()),
            system_name: String::new(),
            recording_user: "alice".to_string(),
        };

        let err = HttpUploader::new().unwrap().upload(&request).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::Status { status: 500, ref body } if body == "nope"
        ));
        let received = server.await.unwrap();
        assert!(!received.to_lowercase().contains("authorization:"));
        assert!(!received.contains("systemName"));
    }
}
