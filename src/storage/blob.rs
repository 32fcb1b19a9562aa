//! Blob storage for dataset images, training archives and adapters.
//!
//! Two backends:
//! - [`LocalBlobStorage`]: files under a root directory, served from a base URL.
//! - [`HttpBlobStorage`]: an object-store REST API (bucket + bearer token).
//!
//! Both can fetch arbitrary `http(s)` URLs on download, which is how the
//! reference image and remote training artifacts are read.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{BlobError, ServiceError};

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Stores `bytes` at `path` (overwriting) and returns its public URL.
    async fn upload(&self, path: &str, bytes: &[u8], content_type: &str)
        -> Result<String, BlobError>;

    /// Public URL of `path`. Does not check existence.
    fn public_url(&self, path: &str) -> String;

    /// Fetches a stored path or any `http(s)` URL.
    async fn download(&self, path_or_url: &str) -> Result<Vec<u8>, BlobError>;
}

pub fn is_remote_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Rejects absolute paths and parent-directory segments.
fn validate_object_path(path: &str) -> Result<(), BlobError> {
    let candidate = Path::new(path);
    let ok = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, BlobError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| BlobError::DownloadFailed {
            location: url.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(BlobError::NotFound(url.to_string()));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(BlobError::Backend {
            code: status.as_u16(),
            message,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| BlobError::DownloadFailed {
            location: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(bytes.to_vec())
}

fn download_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_default()
}

/// Filesystem-backed blob storage.
pub struct LocalBlobStorage {
    root: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl LocalBlobStorage {
    /// `base_url` is what [`BlobStorage::public_url`] prefixes paths with,
    /// e.g. `file:///var/lib/persona-forge/blobs` or an nginx location.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: download_client(),
        }
    }

    /// Serves files from `root` through `file://` URLs.
    pub fn with_file_urls(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self::new(root, base_url)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn local_path(&self, location: &str) -> Result<PathBuf, BlobError> {
        let path = location
            .strip_prefix(&self.base_url)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(location);
        validate_object_path(path)?;
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, BlobError> {
        let target = self.local_path(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file.
        let tmp = target.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, &target).await?;

        tracing::debug!(
            path = path,
            size_bytes = bytes.len(),
            content_type = content_type,
            sha256 = %checksum(bytes),
            "Stored blob"
        );
        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn download(&self, path_or_url: &str) -> Result<Vec<u8>, BlobError> {
        if is_remote_url(path_or_url) && !path_or_url.starts_with(&self.base_url) {
            return fetch_url(&self.client, path_or_url).await;
        }

        let path = self.local_path(path_or_url)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(path_or_url.to_string()))
            }
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

/// Connection settings for [`HttpBlobStorage`].
#[derive(Debug, Clone)]
pub struct HttpBlobConfig {
    /// API root, e.g. `https://project.supabase.co/storage/v1`.
    pub endpoint: String,
    pub bucket: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl HttpBlobConfig {
    /// Reads `STORAGE_URL`, `STORAGE_BUCKET` and `STORAGE_API_KEY`.
    pub fn from_env() -> Result<Self, ServiceError> {
        let endpoint = std::env::var("STORAGE_URL")
            .map_err(|_| ServiceError::not_configured("Blob storage", "STORAGE_URL is not set"))?;
        let api_key = std::env::var("STORAGE_API_KEY").map_err(|_| {
            ServiceError::not_configured("Blob storage", "STORAGE_API_KEY is not set")
        })?;
        let bucket = std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "persona-forge".into());

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            api_key,
            timeout: Duration::from_secs(300),
        })
    }
}

/// Object-store REST backend.
///
/// Uploads go to `POST {endpoint}/object/{bucket}/{path}` with upsert
/// enabled; public objects are read from `{endpoint}/object/public/{bucket}/{path}`.
pub struct HttpBlobStorage {
    config: HttpBlobConfig,
    client: reqwest::Client,
}

impl HttpBlobStorage {
    pub fn new(config: HttpBlobConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ServiceError::from_reqwest)?;
        Ok(Self { config, client })
    }

    pub fn from_env() -> Result<Self, ServiceError> {
        Self::new(HttpBlobConfig::from_env()?)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/object/{}/{}",
            self.config.endpoint,
            self.config.bucket,
            encode_path(path)
        )
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, BlobError> {
        validate_object_path(path)?;

        let response = self
            .client
            .post(self.object_url(path))
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| BlobError::UploadFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BlobError::Backend {
                code: status.as_u16(),
                message,
            });
        }

        tracing::debug!(path = path, size_bytes = bytes.len(), "Uploaded blob");
        Ok(self.public_url(path))
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/object/public/{}/{}",
            self.config.endpoint,
            self.config.bucket,
            encode_path(path.trim_start_matches('/'))
        )
    }

    async fn download(&self, path_or_url: &str) -> Result<Vec<u8>, BlobError> {
        let url = if is_remote_url(path_or_url) {
            path_or_url.to_string()
        } else {
            validate_object_path(path_or_url)?;
            self.public_url(path_or_url)
        };
        fetch_url(&self.client, &url).await
    }
}
