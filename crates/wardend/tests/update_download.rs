//! Download-cycle tests against a minimal in-process release server:
//! check contract, streamed staging with progress, checksum verification,
//! and the guarantee that a failed verification leaves nothing behind.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use warden_common::DownloadPhase;
use wardend::updater::{UpdateError, Updater};

struct ReleaseServer {
    base_url: String,
}

/// One-route HTTP responder: /api/check returns the release JSON,
/// /artifact returns the raw bytes.
async fn start_release_server(artifact: Vec<u8>, checksum: String, version: String) -> ReleaseServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");
    let download_url = format!("{base_url}/artifact");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let artifact = artifact.clone();
            let checksum = checksum.clone();
            let version = version.clone();
            let download_url = download_url.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.split();
                let mut reader = BufReader::new(read_half);

                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.is_err() {
                    return;
                }
                loop {
                    let mut header = String::new();
                    match reader.read_line(&mut header).await {
                        Ok(0) => break,
                        Ok(_) if header == "\r\n" || header == "\n" => break,
                        Ok(_) => {}
                        Err(_) => return,
                    }
                }

                let (content_type, body): (&str, Vec<u8>) =
                    if request_line.starts_with("GET /api/check") {
                        let json = serde_json::json!({
                            "available": true,
                            "latest_version": version,
                            "release_notes": "bug fixes",
                            "download_url": download_url,
                            "size": artifact.len(),
                            "checksum": checksum,
                            "release_date": "2025-11-02",
                            "is_critical": false,
                        });
                        ("application/json", json.to_string().into_bytes())
                    } else if request_line.starts_with("GET /artifact") {
                        ("application/octet-stream", artifact)
                    } else {
                        let _ = write_half
                            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                            .await;
                        return;
                    };

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = write_half.write_all(head.as_bytes()).await;
                let _ = write_half.write_all(&body).await;
            });
        }
    });

    ReleaseServer { base_url }
}

#[tokio::test]
async fn check_parses_the_release_contract_and_stamps_last_check() {
    let server = start_release_server(b"bits".to_vec(), String::new(), "2.1.0".into()).await;
    let dir = tempfile::tempdir().unwrap();
    let updater = Updater::new("1.0.0", dir.path(), server.base_url.clone(), "wardend").unwrap();

    let info = updater.check().await.unwrap();
    assert!(info.available);
    assert_eq!(info.latest_version, "2.1.0");
    assert_eq!(info.current_version, "1.0.0");
    assert_eq!(info.size, 4);
    assert!(!info.is_critical);
    assert!(updater.config().await.last_check.is_some());
}

#[tokio::test]
async fn download_stages_the_artifact_with_progress() {
    let artifact = vec![0xA5u8; 96 * 1024];
    let checksum = hex::encode(Sha256::digest(&artifact));
    let server = start_release_server(artifact.clone(), checksum, "2.1.0".into()).await;

    let dir = tempfile::tempdir().unwrap();
    let updater = Updater::new("1.0.0", dir.path(), server.base_url.clone(), "wardend").unwrap();

    let (tx, mut rx) = mpsc::channel(256);
    let staged = updater.download("2.1.0", Some(tx)).await.unwrap();

    assert_eq!(std::fs::read(&staged).unwrap(), artifact);

    let mut phases = Vec::new();
    while let Some(progress) = rx.recv().await {
        assert!(progress.downloaded <= progress.total);
        phases.push(progress.phase);
    }
    assert!(phases.contains(&DownloadPhase::Downloading));
    // verifying comes before ready, ready is last
    assert_eq!(*phases.last().unwrap(), DownloadPhase::Ready);
    let verifying = phases.iter().position(|p| *p == DownloadPhase::Verifying).unwrap();
    assert!(verifying < phases.len() - 1);
}

#[tokio::test]
async fn checksum_mismatch_removes_staged_file_and_records_failure() {
    let artifact = vec![0x5Au8; 16 * 1024];
    let wrong = hex::encode(Sha256::digest(b"a different artifact"));
    let server = start_release_server(artifact, wrong, "2.1.0".into()).await;

    let dir = tempfile::tempdir().unwrap();
    let updater = Updater::new("1.0.0", dir.path(), server.base_url.clone(), "wardend").unwrap();

    // stands in for the running executable; the download stage must never
    // touch it
    let binary = dir.path().join("wardend");
    std::fs::write(&binary, b"running-binary").unwrap();

    let err = updater.download("2.1.0", None).await.unwrap_err();
    assert!(matches!(err, UpdateError::ChecksumMismatch));

    assert!(!updater.staged_path("2.1.0").exists());
    assert_eq!(std::fs::read(&binary).unwrap(), b"running-binary");

    let history = updater.history().await;
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].error.as_deref(), Some("checksum mismatch"));
}

#[tokio::test]
async fn download_refuses_a_version_the_server_does_not_offer() {
    let server = start_release_server(b"bits".to_vec(), String::new(), "2.1.0".into()).await;
    let dir = tempfile::tempdir().unwrap();
    let updater = Updater::new("1.0.0", dir.path(), server.base_url.clone(), "wardend").unwrap();

    let err = updater.download("9.9.9", None).await.unwrap_err();
    assert!(matches!(err, UpdateError::VersionUnavailable(_)));
}
