//! Byte-range sources the loader and broker fetch from.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use mediaferry_common::{Error, Result};
use reqwest::{header, Client, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Connection timeout for range requests
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-stream fetch configuration.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Declared total size of the resource, if known up front.
    pub total_size: Option<u64>,
    /// Extra request headers (e.g. authorization) for network sources.
    pub headers: Vec<(String, String)>,
}

impl FetchOptions {
    pub fn with_total_size(total_size: u64) -> Self {
        Self {
            total_size: Some(total_size),
            ..Self::default()
        }
    }
}

/// Something that can read a byte range of a remote or local resource.
///
/// Implementations return at most `limit` bytes starting at `offset`; a
/// shorter result is allowed near the end of the resource.
#[async_trait::async_trait]
pub trait RangeSource: Send + Sync {
    /// Fetch up to `limit` bytes at `offset`.
    async fn get_part(
        &self,
        location: &str,
        offset: u64,
        limit: u64,
        options: &FetchOptions,
    ) -> Result<Bytes>;

    /// Total size of the resource.
    ///
    /// Defaults to the size declared in `options`.
    async fn total_size(&self, _location: &str, options: &FetchOptions) -> Result<Option<u64>> {
        Ok(options.total_size)
    }
}

/// Reads ranges from local files.
#[derive(Debug, Clone, Default)]
pub struct FileRangeSource {
    root: Option<PathBuf>,
}

impl FileRangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locations against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(location.trim_start_matches('/')),
            None => Path::new(location).to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl RangeSource for FileRangeSource {
    async fn get_part(
        &self,
        location: &str,
        offset: u64,
        limit: u64,
        _options: &FetchOptions,
    ) -> Result<Bytes> {
        let path = self.resolve(location);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(limit.min(1 << 20) as usize);
        file.take(limit).read_to_end(&mut buf).await?;

        tracing::trace!(path = %path.display(), offset, limit, read = buf.len(), "Read file range");
        Ok(Bytes::from(buf))
    }

    async fn total_size(&self, location: &str, options: &FetchOptions) -> Result<Option<u64>> {
        if options.total_size.is_some() {
            return Ok(options.total_size);
        }
        let metadata = tokio::fs::metadata(self.resolve(location)).await?;
        Ok(Some(metadata.len()))
    }
}

/// Reads ranges over HTTP with `Range` requests.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: Client,
}

impl HttpRangeSource {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request(
        &self,
        method: reqwest::Method,
        location: &str,
        options: &FetchOptions,
    ) -> reqwest::RequestBuilder {
        options
            .headers
            .iter()
            .fold(self.client.request(method, location), |req, (k, v)| {
                req.header(k.as_str(), v.as_str())
            })
    }
}

impl Default for HttpRangeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RangeSource for HttpRangeSource {
    async fn get_part(
        &self,
        location: &str,
        offset: u64,
        limit: u64,
        options: &FetchOptions,
    ) -> Result<Bytes> {
        if limit == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset.saturating_add(limit - 1));
        let response = self
            .request(reqwest::Method::GET, location, options)
            .header(header::RANGE, &range)
            .send()
            .await
            .map_err(|e| Error::io(format!("GET {} ({}): {}", location, range, e)))?;

        let status = response.status();
        // Where the returned body starts; brokers may answer from an aligned offset.
        let body_start = match status {
            StatusCode::PARTIAL_CONTENT => response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start)
                .unwrap_or(offset),
            _ => 0,
        };
        let body = match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::OK => {
                response.bytes().await.map(|full| {
                    let start = (offset.saturating_sub(body_start) as usize).min(full.len());
                    let end = start.saturating_add(limit as usize).min(full.len());
                    full.slice(start..end)
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => return Ok(Bytes::new()),
            StatusCode::NOT_FOUND => return Err(Error::not_found(location.to_string())),
            other => {
                return Err(Error::io(format!("GET {} ({}): HTTP {}", location, range, other)))
            }
        }
        .map_err(|e| Error::io(format!("Reading body of {}: {}", location, e)))?;

        tracing::trace!(location, offset, limit, read = body.len(), %status, "Fetched range");
        Ok(body)
    }

    async fn total_size(&self, location: &str, options: &FetchOptions) -> Result<Option<u64>> {
        if options.total_size.is_some() {
            return Ok(options.total_size);
        }
        let response = self
            .request(reqwest::Method::HEAD, location, options)
            .send()
            .await
            .map_err(|e| Error::io(format!("HEAD {}: {}", location, e)))?;
        if !response.status().is_success() {
            return Err(Error::not_found(location.to_string()));
        }
        Ok(response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }
}

/// Start offset of a `Content-Range: bytes a-b/size` value.
fn content_range_start(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .split('-')
        .next()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    #[tokio::test]
    async fn test_file_source_reads_range() {
        let file = fixture(1000);
        let source = FileRangeSource::new();
        let location = file.path().to_str().unwrap();

        let part = source
            .get_part(location, 10, 5, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(&part[..], &[10, 11, 12, 13, 14]);
        assert_eq!(
            source
                .total_size(location, &FetchOptions::default())
                .await
                .unwrap(),
            Some(1000)
        );
    }

    #[tokio::test]
    async fn test_file_source_short_read_at_end() {
        let file = fixture(100);
        let source = FileRangeSource::new();
        let part = source
            .get_part(file.path().to_str().unwrap(), 90, 4096, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(part.len(), 10);

        let past_end = source
            .get_part(file.path().to_str().unwrap(), 500, 10, &FetchOptions::default())
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_file_source_with_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"abcdef").unwrap();
        let source = FileRangeSource::with_root(dir.path());

        let part = source
            .get_part("/clip.mp4", 2, 2, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(&part[..], b"cd");

        let missing = source
            .get_part("nope.mp4", 0, 2, &FetchOptions::default())
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_content_range_start() {
        assert_eq!(content_range_start("bytes 524288-1048575/2000000"), Some(524288));
        assert_eq!(content_range_start("bytes 0-9/*"), Some(0));
        assert_eq!(content_range_start("items 0-9/10"), None);
    }

    #[tokio::test]
    async fn test_declared_size_wins() {
        let source = FileRangeSource::new();
        let size = source
            .total_size("/does/not/exist", &FetchOptions::with_total_size(42))
            .await
            .unwrap();
        assert_eq!(size, Some(42));
    }
}
