//! Artifact download and extraction.
//!
//! Artifacts are gzip-compressed tar archives served by the scheduler. The
//! execution token travels in the `x-mesh-token` header, never in the URL.
//! The body streams through gzip decompression into tar extraction, so
//! memory use is independent of artifact size; a failure at any stage
//! aborts the whole pipeline and is surfaced exactly once.

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use reqwest::StatusCode;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;
use url::Url;

use crate::error::{ExecutorError, ExecutorResult};
use mesh_proto::url::TOKEN_HEADER;

/// Fetches one deployment's artifact into a container directory.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Downloads and extracts the artifact at `url` into `dest`.
    async fn fetch(&self, url: &Url, token: &str, dest: &Path) -> ExecutorResult<()>;
}

/// HTTP fetcher with a streaming gzip/tar pipeline.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, token: &str, dest: &Path) -> ExecutorResult<()> {
        debug!(url = %url, dest = %dest.display(), "downloading artifact");

        let response = self
            .client
            .get(url.clone())
            .header(TOKEN_HEADER, token)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ExecutorError::DownloadStatus {
                status: status.as_u16(),
            });
        }

        tokio::fs::create_dir_all(dest)
            .await
            .map_err(ExecutorError::Archive)?;

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let reader = SyncIoBridge::new(StreamReader::new(stream));

        let dest = dest.to_owned();
        tokio::task::spawn_blocking(move || extract_stripped(reader, &dest))
            .await
            .map_err(|e| ExecutorError::Archive(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

/// Extracts a gzip tar stream into `dest`, stripping the archive's single
/// top-level directory component.
fn extract_stripped(reader: impl Read, dest: &Path) -> ExecutorResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    for entry in archive.entries().map_err(ExecutorError::Archive)? {
        let mut entry = entry.map_err(ExecutorError::Archive)?;
        let path = entry.path().map_err(ExecutorError::Archive)?.into_owned();

        let mut components = path.components();
        components.next();
        let stripped: PathBuf = components.as_path().to_owned();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ExecutorError::Archive(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive path {} escapes the container directory", path.display()),
            )));
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(ExecutorError::Archive)?;
        }
        entry.unpack(&target).map_err(ExecutorError::Archive)?;
    }

    Ok(())
}

/// Recording fetcher for tests; optionally fails every fetch.
#[derive(Debug, Default)]
pub struct MockFetcher {
    fail: AtomicBool,
    fetches: Mutex<Vec<(Url, String)>>,
}

impl MockFetcher {
    /// Creates a fetcher that always succeeds without touching the network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent fetch fail with a 500 download status.
    pub fn fail_downloads(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// The (url, token) pairs fetched so far.
    #[must_use]
    pub fn fetches(&self) -> Vec<(Url, String)> {
        self.fetches.lock().expect("mock lock").clone()
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, url: &Url, token: &str, _dest: &Path) -> ExecutorResult<()> {
        self.fetches
            .lock()
            .expect("mock lock")
            .push((url.clone(), token.to_owned()));

        if self.fail.load(Ordering::SeqCst) {
            return Err(ExecutorError::DownloadStatus { status: 500 });
        }
        Ok(())
    }
}
