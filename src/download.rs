use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::VbError;
use crate::prompt::Prompter;

const UNVERIFIED_QUESTION: &str =
    "No checksum provided! Are you sure you want to boot from an unverified image?";

/// Local file name for `url`: its last path segment.
pub fn local_path(url: &reqwest::Url, download_dir: &Path) -> PathBuf {
    let filename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("medium.img");
    download_dir.join(filename)
}

/// Hex SHA-256 of a file's contents.
pub async fn sha256_file(path: &Path) -> Result<String, VbError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| VbError::Io {
            context: format!("opening {}", path.display()),
            source: e,
        })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| VbError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn check_digest(path: &Path, expected: &str, actual: String) -> Result<(), VbError> {
    if actual.eq_ignore_ascii_case(expected.trim()) {
        return Ok(());
    }
    Err(VbError::ChecksumMismatch {
        path: path.display().to_string(),
        expected: expected.to_string(),
        actual,
    })
}

/// Write the response body to `path` and return the hex SHA-256 of what
/// was written.
async fn stream_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<String, VbError> {
    let io_err = |action: &str, e: std::io::Error| VbError::Io {
        context: format!("{action} {}", path.display()),
        source: e,
    };
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| io_err("creating", e))?;

    let mut hasher = Sha256::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| VbError::Download {
            message: "connection dropped while downloading medium".into(),
            source: Box::new(e),
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| io_err("writing", e))?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await.map_err(|e| io_err("flushing", e))?;

    Ok(hex::encode(hasher.finalize()))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "couldn't remove partial download");
    }
}

/// Make the remote medium at `url` available in `download_dir` and return
/// its local path. Without a checksum the operator has to confirm; with one,
/// both a previously downloaded file and a fresh download are verified.
/// A fresh download only gets its final name once it matches.
pub async fn fetch_remote(
    url: &reqwest::Url,
    sha256: Option<&str>,
    download_dir: &Path,
    prompter: &dyn Prompter,
) -> Result<PathBuf, VbError> {
    fetch_with(&reqwest::Client::new(), url, sha256, download_dir, prompter).await
}

async fn fetch_with(
    client: &reqwest::Client,
    url: &reqwest::Url,
    sha256: Option<&str>,
    download_dir: &Path,
    prompter: &dyn Prompter,
) -> Result<PathBuf, VbError> {
    if sha256.is_none() && !prompter.confirm(UNVERIFIED_QUESTION)? {
        return Err(VbError::Cancelled {
            message: format!("refused unverified image {url}"),
        });
    }

    tokio::fs::create_dir_all(download_dir)
        .await
        .map_err(|e| VbError::Io {
            context: format!("creating download dir {}", download_dir.display()),
            source: e,
        })?;

    let dest = local_path(url, download_dir);
    if dest.exists() {
        if let Some(expected) = sha256 {
            check_digest(&dest, expected, sha256_file(&dest).await?)?;
        }
        tracing::info!(path = %dest.display(), "using downloaded medium");
        return Ok(dest);
    }

    tracing::info!(%url, path = %dest.display(), "downloading medium");
    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| VbError::Download {
            message: format!("couldn't download {url}"),
            source: Box::new(e),
        })?;

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) = ProgressStyle::with_template("{msg} {wide_bar} {bytes}/{total_bytes}") {
        pb.set_style(style);
    }
    if let Some(name) = dest.file_name() {
        pb.set_message(name.to_string_lossy().into_owned());
    }

    let mut part = dest.clone().into_os_string();
    part.push(".part");
    let part = PathBuf::from(part);

    let digest = stream_to_file(&part, response, &pb).await;
    pb.finish_and_clear();
    let checked = digest.and_then(|actual| match sha256 {
        Some(expected) => check_digest(&dest, expected, actual),
        None => Ok(()),
    });
    if let Err(e) = checked {
        discard(&part).await;
        return Err(e);
    }

    tokio::fs::rename(&part, &dest)
        .await
        .map_err(|e| VbError::Io {
            context: format!("moving {} into place", part.display()),
            source: e,
        })?;
    tracing::info!(path = %dest.display(), "medium downloaded");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vbox::testing::FixedPrompter;

    // sha256("hello\n")
    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn url(s: &str) -> reqwest::Url {
        reqwest::Url::parse(s).unwrap()
    }

    /// Answer a single HTTP request for `/x.vdi` with `body`.
    async fn serve_once(body: &'static [u8]) -> reqwest::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        url(&format!("http://{addr}/x.vdi"))
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn local_path_uses_last_segment() {
        let dir = Path::new("/cache");
        assert_eq!(
            local_path(&url("https://example.com/images/debian.vdi"), dir),
            PathBuf::from("/cache/debian.vdi")
        );
        assert_eq!(
            local_path(&url("https://example.com/"), dir),
            PathBuf::from("/cache/medium.img")
        );
    }

    #[tokio::test]
    async fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"hello\n").unwrap();
        assert_eq!(sha256_file(&path).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn existing_download_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.vdi"), b"hello\n").unwrap();
        let prompter = FixedPrompter::new(false);
        let path = fetch_remote(
            &url("https://example.com/x.vdi"),
            Some(HELLO_SHA256),
            dir.path(),
            &prompter,
        )
        .await
        .unwrap();
        assert_eq!(path, dir.path().join("x.vdi"));
        assert!(prompter.asked().is_empty());
    }

    #[tokio::test]
    async fn existing_download_with_wrong_checksum_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.vdi"), b"tampered\n").unwrap();
        let err = fetch_remote(
            &url("https://example.com/x.vdi"),
            Some(HELLO_SHA256),
            dir.path(),
            &FixedPrompter::new(true),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VbError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn unverified_image_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let prompter = FixedPrompter::new(false);
        let err = fetch_remote(&url("https://example.com/x.vdi"), None, dir.path(), &prompter)
            .await
            .unwrap_err();
        assert!(matches!(err, VbError::Cancelled { .. }));
        assert_eq!(prompter.asked(), vec![UNVERIFIED_QUESTION.to_string()]);
    }

    #[tokio::test]
    async fn confirmed_unverified_image_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.vdi"), b"anything").unwrap();
        let path = fetch_remote(
            &url("https://example.com/x.vdi"),
            None,
            dir.path(),
            &FixedPrompter::new(true),
        )
        .await
        .unwrap();
        assert_eq!(path, dir.path().join("x.vdi"));
    }

    #[tokio::test]
    async fn fresh_download_is_verified_and_moved_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let source = serve_once(b"hello\n").await;

        let prompter = FixedPrompter::new(false);
        let path = fetch_with(&client(), &source, Some(HELLO_SHA256), dir.path(), &prompter)
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("x.vdi"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\n");
        assert!(!dir.path().join("x.vdi.part").exists());
    }

    #[tokio::test]
    async fn corrupt_download_is_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let prompter = FixedPrompter::new(false);

        let source = serve_once(b"tampered\n").await;
        let err = fetch_with(&client(), &source, Some(HELLO_SHA256), dir.path(), &prompter)
            .await
            .unwrap_err();
        assert!(matches!(err, VbError::ChecksumMismatch { .. }));
        assert!(!dir.path().join("x.vdi").exists());
        assert!(!dir.path().join("x.vdi.part").exists());

        // Once the source serves the right bytes the next run succeeds.
        let source = serve_once(b"hello\n").await;
        let path = fetch_with(&client(), &source, Some(HELLO_SHA256), dir.path(), &prompter)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\n");
    }
}
