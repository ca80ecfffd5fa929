//! Quick-start image download.

use crate::catalog::QuickStartDescriptor;
use crate::error::{Error, Result};
use crate::plan::{FirmwareEntry, FirmwarePlan};
use log::{debug, info};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
#[cfg(feature = "http")]
use std::time::Duration;

/// Download progress: `(received, declared_total)` in bytes.
pub type DownloadProgress<'a> = dyn FnMut(u64, Option<u64>) + 'a;

const CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on buffer space reserved from a declared length.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Retrieves image bytes for a URL.
pub trait Fetcher {
    /// Fetch `url`, reporting progress as bytes arrive.
    ///
    /// Failures are reported as [`Error::Network`].
    fn fetch(&self, url: &str, progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>>;
}

/// Drain `reader`, reporting bytes received against an optional total.
///
/// The declared total only sizes the first allocation, up to
/// `MAX_PREALLOC`; the buffer grows with the bytes actually received.
pub fn read_stream<R: Read>(
    mut reader: R,
    declared: Option<u64>,
    progress: &mut DownloadProgress<'_>,
) -> Result<Vec<u8>> {
    let capacity = declared
        .map(|n| n.min(MAX_PREALLOC))
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0);
    let mut data = Vec::with_capacity(capacity);
    let mut chunk = vec![0u8; CHUNK_SIZE];
    progress(0, declared);
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Network(e.to_string())),
        };
        data.extend_from_slice(&chunk[..n]);
        progress(data.len() as u64, declared);
    }
    Ok(data)
}

/// Path for a `file://` URL or a bare path; `None` for remote URLs.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

/// Reads images from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl LocalFetcher {
    fn read(path: &Path, progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>> {
        let file = File::open(path)
            .map_err(|e| Error::Network(format!("{}: {e}", path.display())))?;
        let declared = file.metadata().ok().map(|m| m.len());
        read_stream(file, declared, progress)
    }
}

impl Fetcher for LocalFetcher {
    fn fetch(&self, url: &str, progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>> {
        let path = local_path(url)
            .ok_or_else(|| Error::Network(format!("unsupported URL scheme in '{url}'")))?;
        Self::read(&path, progress)
    }
}

/// Time allowed to establish a connection.
#[cfg(feature = "http")]
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Time allowed for a whole download, body included.
///
/// Sized for multi-megabyte images over slow links.
#[cfg(feature = "http")]
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Downloads over HTTP(S); `file://` URLs and bare paths are read locally.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    /// Create a fetcher with [`CONNECT_TIMEOUT`] and [`DOWNLOAD_TIMEOUT`].
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::Network(format!("cannot create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Create a fetcher around an existing client.
    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, progress: &mut DownloadProgress<'_>) -> Result<Vec<u8>> {
        if let Some(path) = local_path(url) {
            return LocalFetcher::read(&path, progress);
        }

        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("{url}: HTTP {status}")));
        }
        let declared = response.content_length();
        read_stream(response, declared, progress)
    }
}

/// Build a single-entry plan for a quick-start application.
///
/// Fails with [`Error::NoApplicationSelected`] without a descriptor,
/// [`Error::InvalidDescriptor`] when its URL or address is missing, and
/// [`Error::Network`] when the download fails or yields no bytes.
pub fn build_quick_start_plan(
    descriptor: Option<&QuickStartDescriptor>,
    fetcher: &dyn Fetcher,
    progress: &mut DownloadProgress<'_>,
) -> Result<FirmwarePlan> {
    let descriptor = descriptor.ok_or(Error::NoApplicationSelected)?;
    let url = descriptor.require_url()?;
    let address = descriptor.require_address()?;

    info!("Downloading {} from {url}", descriptor.name);
    let data = fetcher.fetch(url, progress)?;
    if data.is_empty() {
        return Err(Error::Network(format!("{url}: downloaded image is empty")));
    }
    debug!("Downloaded {} bytes for {}", data.len(), descriptor.name);

    Ok(FirmwarePlan::new([FirmwareEntry::new(
        descriptor.image_name(),
        data,
        address,
    )]))
}
