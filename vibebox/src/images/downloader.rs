//! Resumable artifact download with digest verification.
//!
//! A partial file on disk is continued with an HTTP Range request; servers
//! that ignore the range (status 200) cause a clean restart from byte 0.
//! After the transfer the whole file is hashed and compared against the
//! catalog digest; a mismatch deletes the artifact so the next attempt
//! starts from scratch.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::errors::{ImageError, VibeboxResult};
use crate::progress::{percent, Phase, ProgressEvent, ProgressMeter, ProgressSink};

/// Parameters for downloading and verifying one artifact.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub dest_path: PathBuf,
    /// Expected lowercase/uppercase hex digest; compared case-insensitively.
    pub expected_sha256: String,
    /// Catalog size used for percent/ETA; 0 falls back to Content-Length.
    pub expected_bytes: u64,
}

/// Download the artifact with resume support and validate its sha256.
pub async fn download_and_verify(
    req: &DownloadRequest,
    sink: &dyn ProgressSink,
) -> VibeboxResult<()> {
    if let Some(parent) = req.dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let existing = match tokio::fs::metadata(&req.dest_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };

    sink.emit(ProgressEvent::message(
        Phase::Resolving,
        "resolving image source",
    ));

    let client = reqwest::Client::new();
    let mut request = client.get(&req.url);
    if existing > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", existing));
    }
    let response = request
        .send()
        .await
        .map_err(|e| ImageError::Download(e.to_string()))?;

    let status = response.status();
    let resuming = status == reqwest::StatusCode::PARTIAL_CONTENT && existing > 0;
    if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(ImageError::Download(status.to_string()).into());
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(resuming)
        .truncate(!resuming)
        .open(&req.dest_path)
        .await?;
    let existing = if resuming { existing } else { 0 };

    let total = if req.expected_bytes > 0 {
        req.expected_bytes
    } else {
        response
            .content_length()
            .map(|len| existing + len)
            .unwrap_or(0)
    };

    sink.emit(ProgressEvent {
        phase: Phase::Downloading,
        message: "downloading image".into(),
        percent: percent(existing, total),
        bytes_done: existing,
        bytes_total: total,
        speed_bps: 0.0,
        eta: None,
        error: None,
        done: false,
    });

    let mut meter = ProgressMeter::new(total, existing);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ImageError::Download(e.to_string()))?;
        file.write_all(&chunk).await?;
        meter.add(chunk.len() as u64, sink);
    }
    file.flush().await?;
    drop(file);

    sink.emit(ProgressEvent {
        phase: Phase::Downloading,
        message: "download completed".into(),
        percent: 100.0,
        bytes_done: meter.done(),
        bytes_total: total,
        speed_bps: 0.0,
        eta: None,
        error: None,
        done: false,
    });

    sink.emit(ProgressEvent::message(
        Phase::Verifying,
        "verifying image digest",
    ));
    let actual = compute_sha256(&req.dest_path).await?;
    if !actual.eq_ignore_ascii_case(&req.expected_sha256) {
        let _ = tokio::fs::remove_file(&req.dest_path).await;
        return Err(ImageError::IntegrityMismatch {
            expected: req.expected_sha256.clone(),
            actual,
        }
        .into());
    }

    sink.emit(ProgressEvent {
        phase: Phase::Verifying,
        message: "digest verified".into(),
        percent: 100.0,
        bytes_done: 0,
        bytes_total: 0,
        speed_bps: 0.0,
        eta: None,
        error: None,
        done: false,
    });
    Ok(())
}

/// Streaming sha256 of a file, rendered as lowercase hex.
pub async fn compute_sha256(path: &Path) -> VibeboxResult<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> VibeboxResult<String> {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    })
    .await
    .map_err(|e| crate::errors::VibeboxError::Internal(format!("hash task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NopSink;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use tempfile::TempDir;

    /// Serves one canned HTTP exchange per accepted connection, recording
    /// the request heads it saw. The Rust stand-in for Go's httptest.
    fn serve(responses: Vec<Vec<u8>>) -> (String, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap();
                seen.push(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(&response).unwrap();
            }
            seen
        });
        (format!("http://{}", addr), handle)
    }

    fn http_response(status_line: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(status_line.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out.extend_from_slice(body);
        out
    }

    fn sha256_hex(data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[tokio::test]
    async fn test_download_and_verify() {
        let payload = b"vibebox-test-payload".to_vec();
        let sum = sha256_hex(&payload);
        let (url, server) = serve(vec![http_response("HTTP/1.1 200 OK", &payload)]);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.bin");
        download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dest.clone(),
                expected_sha256: sum,
                expected_bytes: payload.len() as u64,
            },
            &NopSink,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_resume_converges_to_identical_file() {
        let payload = b"0123456789abcdefghij".to_vec();
        let sum = sha256_hex(&payload);
        let tail = payload[12..].to_vec();
        let (url, server) = serve(vec![http_response(
            "HTTP/1.1 206 Partial Content",
            &tail,
        )]);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.bin");
        // A prior run left the first 12 bytes behind.
        std::fs::write(&dest, &payload[..12]).unwrap();

        download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dest.clone(),
                expected_sha256: sum,
                expected_bytes: payload.len() as u64,
            },
            &NopSink,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        let seen = server.join().unwrap();
        assert!(seen[0].contains("Range: bytes=12-") || seen[0].contains("range: bytes=12-"));
    }

    #[tokio::test]
    async fn test_full_restart_on_200_with_partial_file() {
        let payload = b"fresh-content".to_vec();
        let sum = sha256_hex(&payload);
        // Server ignores the range and replays the whole body with 200.
        let (url, server) = serve(vec![http_response("HTTP/1.1 200 OK", &payload)]);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.bin");
        std::fs::write(&dest, b"stale-partial-data-that-must-go").unwrap();

        download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dest.clone(),
                expected_sha256: sum,
                expected_bytes: payload.len() as u64,
            },
            &NopSink,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_integrity_mismatch_removes_artifact() {
        let payload = b"whatever-the-server-says".to_vec();
        let (url, server) = serve(vec![http_response("HTTP/1.1 200 OK", &payload)]);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.bin");
        let err = download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dest.clone(),
                expected_sha256: "0".repeat(64),
                expected_bytes: payload.len() as u64,
            },
            &NopSink,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("sha256 mismatch"));
        assert!(!dest.exists());
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let (url, server) = serve(vec![http_response("HTTP/1.1 404 Not Found", b"")]);

        let dir = TempDir::new().unwrap();
        let err = download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dir.path().join("artifact.bin"),
                expected_sha256: "0".repeat(64),
                expected_bytes: 0,
            },
            &NopSink,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("404"));
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_zero_byte_artifact_with_matching_digest() {
        // sha256 of the empty string.
        let empty_sum = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let (url, server) = serve(vec![http_response("HTTP/1.1 200 OK", b"")]);

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("artifact.bin");
        download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dest.clone(),
                expected_sha256: empty_sum.into(),
                expected_bytes: 0,
            },
            &NopSink,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_digest_compare_is_case_insensitive() {
        let payload = b"case-check".to_vec();
        let sum = sha256_hex(&payload).to_uppercase();
        let (url, server) = serve(vec![http_response("HTTP/1.1 200 OK", &payload)]);

        let dir = TempDir::new().unwrap();
        download_and_verify(
            &DownloadRequest {
                url,
                dest_path: dir.path().join("artifact.bin"),
                expected_sha256: sum,
                expected_bytes: 0,
            },
            &NopSink,
        )
        .await
        .unwrap();
        server.join().unwrap();
    }
}
