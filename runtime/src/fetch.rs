//! Archive download.
//!
//! A single unauthenticated HTTP GET whose body is persisted verbatim to a
//! local file before any processing happens.

use std::path::{Path, PathBuf};

use a3s_bake_core::error::{BakeError, Result};
use tokio::io::AsyncWriteExt;

/// Permission bits of the downloaded archive.
const ARCHIVE_MODE: u32 = 0o644;

/// A downloaded archive on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    /// Source URL
    pub url: String,
    /// Local materialization path
    pub path: PathBuf,
    /// Number of bytes written
    pub size: u64,
}

/// Downloads archives over HTTP.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFetcher {
    http: reqwest::Client,
}

impl ArchiveFetcher {
    /// Create a fetcher with a default client (no auth, no timeout).
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Fetch `url` into `dest`.
    ///
    /// A non-success status fails before anything is written. If writing the
    /// body fails, the partial file is removed.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedArchive> {
        tracing::info!(url = %url, dest = %dest.display(), "Fetching archive");

        let network_error = |message: String| BakeError::NetworkFetchError {
            url: url.to_string(),
            message,
        };

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(network_error(format!("unexpected status {}", status)));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(dest, e))?;
        }

        let mut file = open_archive_file(dest).await?;
        let mut size = 0u64;
        let copied: Result<()> = async {
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| network_error(e.to_string()))?
            {
                file.write_all(&chunk).await.map_err(|e| write_error(dest, e))?;
                size += chunk.len() as u64;
            }
            file.flush().await.map_err(|e| write_error(dest, e))?;
            file.sync_all().await.map_err(|e| write_error(dest, e))
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }

        tracing::info!(url = %url, size, "Archive fetched");

        Ok(FetchedArchive {
            url: url.to_string(),
            path: dest.to_path_buf(),
            size,
        })
    }
}

async fn open_archive_file(dest: &Path) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(ARCHIVE_MODE);

    let file = options.open(dest).await.map_err(|e| write_error(dest, e))?;

    // Mode on open is filtered by umask
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(ARCHIVE_MODE))
            .await
            .map_err(|e| write_error(dest, e))?;
    }

    Ok(file)
}

fn write_error(path: &Path, err: std::io::Error) -> BakeError {
    BakeError::ArchiveWriteError {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` with `status` to every connection; returns the base URL.
    pub(crate) async fn serve(status: u16, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut request = Vec::new();
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 {} Status\r\nContent-Length: {}\r\nContent-Type: application/gzip\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_writes_body_verbatim() {
        let body = b"\x1f\x8b not really gzip".to_vec();
        let url = serve(200, body.clone()).await;
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("nested/graph-data.tar.gz");

        let fetched = ArchiveFetcher::new()
            .fetch(&format!("{}/graph-data.tar.gz", url), &dest)
            .await
            .unwrap();

        assert_eq!(fetched.path, dest);
        assert_eq!(fetched.size, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn test_fetch_error_status_writes_nothing() {
        let url = serve(500, b"boom".to_vec()).await;
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("graph-data.tar.gz");

        let err = ArchiveFetcher::new().fetch(&url, &dest).await.unwrap_err();

        match err {
            BakeError::NetworkFetchError { url: failed, message } => {
                assert_eq!(failed, url);
                assert!(message.contains("500"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("graph-data.tar.gz");
        let err = ArchiveFetcher::new()
            .fetch(&format!("http://{}/x", addr), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, BakeError::NetworkFetchError { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_fetch_unwritable_destination() {
        let url = serve(200, b"data".to_vec()).await;
        let tmp = TempDir::new().unwrap();
        // A regular file where a parent directory is expected
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = ArchiveFetcher::new()
            .fetch(&url, &blocker.join("graph-data.tar.gz"))
            .await
            .unwrap_err();

        assert!(matches!(err, BakeError::ArchiveWriteError { .. }));
    }
}
