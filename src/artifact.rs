//! Artifact retrieval and deployment workspaces
//!
//! Every deploy call stages its downloads and generated tarballs in a
//! [`TempWorkspace`] under the configured image temp root. The workspace is
//! owned by that one call and removed however the call ends. Files in it
//! are published to the board over HTTP by mapping the temp root onto the
//! configured base URL.

use async_trait::async_trait;
use reqwest::Url;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// Default timeout for one artifact download
const DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

/// Remote artifact staged into a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentArtifact {
    pub url: String,
    pub local_path: PathBuf,
}

/// Fetches artifacts into a directory, optionally through a cache
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Download `url` into `dest_dir`, returning the local path
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Like [`fetch`](Self::fetch), reusing a copy under `cache_dir`
    async fn fetch_cached(&self, url: &str, dest_dir: &Path, cache_dir: &Path) -> Result<PathBuf>;
}

/// Moves the bytes of one URL to one file
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Downloader for `http(s)://` and `file://` URLs and plain paths
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lava-deploy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn download_http(&self, url: &str, dest: &Path) -> Result<()> {
        let fetch_failed = |reason: String| Error::ArtifactFetchFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_failed(format!("HTTP {}", response.status())));
        }

        // Partial transfers never appear under the final name
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, dest).await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(())
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        match local_source(url) {
            Some(source) => {
                tokio::fs::copy(&source, dest)
                    .await
                    .map_err(|e| Error::ArtifactFetchFailed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(())
            }
            None => self.download_http(url, dest).await,
        }
    }
}

/// Local file behind a `file://` URL or bare path
fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

/// Artifact store with an on-disk cache keyed by URL host and path
pub struct CachingFetcher<D: Downloader> {
    downloader: D,
}

impl<D: Downloader> CachingFetcher<D> {
    pub fn new(downloader: D) -> Self {
        Self { downloader }
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }
}

#[async_trait]
impl<D: Downloader> ArtifactStore for CachingFetcher<D> {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let dest = dest_dir.join(file_name(url)?);
        info!("Downloading {}", url);
        self.downloader.download(url, &dest).await?;
        Ok(dest)
    }

    async fn fetch_cached(&self, url: &str, dest_dir: &Path, cache_dir: &Path) -> Result<PathBuf> {
        let dest = dest_dir.join(file_name(url)?);
        let cached = cache_path(cache_dir, url)?;

        if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            info!("Using cached copy of {}", url);
            link_or_copy(&cached, &dest).await?;
            return Ok(dest);
        }

        info!("Downloading {} (caching)", url);
        self.downloader.download(url, &dest).await?;

        // A cache that cannot be populated only costs the next download
        if let Some(parent) = cached.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Cannot create cache directory {}: {}", parent.display(), e);
                return Ok(dest);
            }
        }
        if let Err(e) = link_or_copy(&dest, &cached).await {
            warn!("Cannot cache {}: {}", url, e);
        }
        Ok(dest)
    }
}

/// Hard link `from` to `to`, copying when they live on different filesystems
async fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::hard_link(from, to).await.is_err() {
        tokio::fs::copy(from, to).await?;
    }
    Ok(())
}

/// Last path segment of a URL
pub fn file_name(url: &str) -> Result<String> {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::ArtifactFetchFailed {
            url: url.to_string(),
            reason: "URL does not name a file".to_string(),
        })
}

/// Location of `url` inside the cache directory
pub fn cache_path(cache_dir: &Path, url: &str) -> Result<PathBuf> {
    let rejected = |reason: &str| Error::ArtifactFetchFailed {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(url).ok();
    let (host, path) = match &parsed {
        Some(parsed) if parsed.scheme() != "file" => {
            (parsed.host_str().unwrap_or("localhost").to_string(), parsed.path().to_string())
        }
        Some(parsed) => ("localhost".to_string(), parsed.path().to_string()),
        None => ("localhost".to_string(), url.to_string()),
    };

    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(rejected("path escapes the cache directory"));
    }
    if relative.as_os_str().is_empty() {
        return Err(rejected("URL does not name a file"));
    }
    Ok(cache_dir.join(host).join(relative))
}

/// Stage one artifact into the workspace, through the cache when given one
pub async fn stage(
    store: &dyn ArtifactStore,
    url: &str,
    workspace: &TempWorkspace,
    cache_dir: Option<&Path>,
) -> Result<DeploymentArtifact> {
    let local_path = match cache_dir {
        Some(cache) => store.fetch_cached(url, workspace.path(), cache).await?,
        None => store.fetch(url, workspace.path()).await?,
    };
    Ok(DeploymentArtifact {
        url: url.to_string(),
        local_path,
    })
}

/// Per-deployment scratch directory, removed when dropped
#[derive(Debug)]
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    /// Create a fresh world-readable directory under `root`
    ///
    /// The board fetches tarballs from here through the dispatcher's web
    /// server, so the directory must be traversable by it.
    pub fn create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("lava-").tempdir_in(root)?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755))?;
        debug!("Created workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the workspace now, reporting failures
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!("Removed workspace {}", path.display());
        Ok(())
    }
}

/// URL under which the dispatcher serves a file from the temp root
pub fn public_url(path: &Path, tmp_root: &Path, base_url: &str) -> Result<String> {
    let relative = path.strip_prefix(tmp_root).map_err(|_| {
        Error::Other(format!(
            "{} is not under the image temp root {}",
            path.display(),
            tmp_root.display()
        ))
    })?;
    let relative = relative.to_string_lossy();
    Ok(format!(
        "{}/{}",
        base_url.trim_matches('/'),
        relative.trim_matches('/')
    ))
}
