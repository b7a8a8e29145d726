use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use url::Url;

use crate::params::GenerationRequest;
use crate::server::{ErrorResponse, GenerateResponse, HealthResponse, JobStatusResponse};

/// Bound for JSON calls. Downloads are only bounded by the connect timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid API base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned HTTP {}: {message}", .status.as_u16())]
    Status {
        path: String,
        status: StatusCode,
        message: String,
    },
    #[error("failed to parse response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("job {job_id} did not finish within {waited:?}")]
    Timeout { job_id: String, waited: Duration },
}

impl ClientError {
    /// HTTP status for errors the server answered with.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP client for the job-queue API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_request_timeout(base_url, REQUEST_TIMEOUT)
    }

    /// Like [`ApiClient::new`] with a custom bound for JSON calls.
    pub fn with_request_timeout(base_url: &str, request_timeout: Duration) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|source| ClientError::Transport {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            base_url,
            client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URL for a server-relative path such as `/api/videos/x.mp4`.
    pub fn url(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response, ClientError> {
        let resp = request.send().await.map_err(|source| ClientError::Transport {
            url: path.to_string(),
            source,
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|err| err.error)
            .unwrap_or(body);
        Err(ClientError::Status {
            path: path.to_string(),
            status,
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let request = self.client.get(self.url(path)?).timeout(self.request_timeout);
        let resp = self.send(request, path).await?;
        resp.json::<T>()
            .await
            .map_err(|source| ClientError::Decode {
                path: path.to_string(),
                source,
            })
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get_json("/health").await
    }

    /// `GET /api/info`
    pub async fn info(&self) -> Result<serde_json::Value, ClientError> {
        self.get_json("/api/info").await
    }

    /// `POST /api/generate`
    pub async fn submit(&self, request: &GenerationRequest) -> Result<GenerateResponse, ClientError> {
        let path = "/api/generate";
        let resp = self
            .send(
                self.client
                    .post(self.url(path)?)
                    .timeout(self.request_timeout)
                    .json(request),
                path,
            )
            .await?;
        resp.json().await.map_err(|source| ClientError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// `GET /api/status/{job_id}`
    pub async fn status(&self, job_id: &str) -> Result<JobStatusResponse, ClientError> {
        self.get_json(&format!("/api/status/{job_id}")).await
    }

    /// Download `video_url` (server-relative) into `dest`. Returns the byte count.
    ///
    /// The body is streamed into `<dest>.part` and renamed once complete, so
    /// `dest` never holds a truncated video.
    pub async fn download(&self, video_url: &str, dest: &Path) -> Result<u64, ClientError> {
        let resp = self.send(self.client.get(self.url(video_url)?), video_url).await?;

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ClientError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        let partial = partial_download_path(dest);
        let written = match stream_to_file(resp, video_url, &partial).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial download");
                    }
                }
                return Err(err);
            }
        };

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|source| ClientError::Io {
                path: dest.display().to_string(),
                source,
            })?;
        Ok(written)
    }

    /// Poll until the job is terminal or `max_wait` elapses.
    ///
    /// Transient status failures are logged and retried. Giving up leaves the
    /// job untouched on the server.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<JobStatusResponse, ClientError> {
        let started = Instant::now();
        let mut last_progress = None;

        loop {
            match self.status(job_id).await {
                Ok(status) => {
                    if last_progress != Some(status.progress) {
                        info!(
                            job_id,
                            status = %status.status,
                            progress = %format!("{:.1}%", status.progress * 100.0),
                            elapsed_secs = started.elapsed().as_secs(),
                            "Job progress"
                        );
                        last_progress = Some(status.progress);
                    }
                    if status.status.is_terminal() {
                        return Ok(status);
                    }
                }
                Err(err @ ClientError::Status { status: StatusCode::NOT_FOUND, .. }) => return Err(err),
                Err(err) => warn!(job_id, error = %err, "Failed to check job status"),
            }

            if started.elapsed() + poll_interval > max_wait {
                return Err(ClientError::Timeout {
                    job_id: job_id.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn partial_download_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

async fn stream_to_file(
    mut resp: reqwest::Response,
    video_url: &str,
    path: &Path,
) -> Result<u64, ClientError> {
    let io_err = |source| ClientError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;

    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await.map_err(|source| ClientError::Transport {
        url: video_url.to_string(),
        source,
    })? {
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

/// Probe `url` and report whether it answered HTTP 200.
pub async fn check_health(url: &str) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "Health check failed - could not build HTTP client");
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(resp) if resp.status() == StatusCode::OK => {
            info!("Health check passed - service is running");
            true
        }
        Ok(resp) => {
            warn!(status = resp.status().as_u16(), "Health check failed");
            false
        }
        Err(err) => {
            warn!(error = %err, "Health check failed - service unreachable");
            false
        }
    }
}
