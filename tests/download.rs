//! Download through a mock content endpoint, then decrypt the result

mod common;

use common::{account, account_expiring_in, test_config, AaxFixture, ACCESS_TOKEN};
use librisync_core::api::content::DownloadQuality;
use librisync_core::crypto::aax::AaxDecrypter;
use librisync_core::crypto::activation::ActivationBytes;
use librisync_core::download::{DownloadManager, DownloadOptions};
use librisync_core::file::part_path;
use librisync_core::LibriSyncError;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ASIN: &str = "B07NP9L44Y";

async fn mount_license(server: &MockServer, status: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/1.0/content/{}/licenserequest", ASIN)))
        .and(header("authorization", format!("Bearer {}", ACCESS_TOKEN).as_str()))
        .and(body_partial_json(json!({"drm_type": "Adrm"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content_license": {
                "asin": ASIN,
                "status_code": status,
                "drm_type": "Adrm",
                "content_metadata": {
                    "content_url": {
                        "offline_url": format!("{}/assets/{}.aax", server.uri(), ASIN)
                    }
                }
            }
        })))
        .mount(server)
        .await;
}

async fn mount_asset(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(format!("/assets/{}.aax", ASIN)))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_download_then_decrypt() {
    common::init_logging();
    let server = MockServer::start().await;
    let config = test_config(&server.uri());
    let fixture = AaxFixture::new([0x1c, 0xeb, 0x00, 0xda]);

    mount_license(&server, "Granted").await;
    mount_asset(&server, ResponseTemplate::new(200).set_body_bytes(fixture.bytes.clone())).await;

    let dir = tempfile::tempdir().unwrap();
    let aax = dir.path().join("downloads").join("book.aax");

    let manager = DownloadManager::for_account(&account(), &config).unwrap();
    let descriptor = manager
        .download(ASIN, &aax, &DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(descriptor.asin, ASIN);
    assert_eq!(descriptor.bytes_downloaded, fixture.bytes.len() as u64);
    assert_eq!(std::fs::read(&aax).unwrap(), fixture.bytes);
    assert!(!part_path(&aax).exists());

    let m4b = dir.path().join("book.m4b");
    let activation = ActivationBytes::from_hex("1CEB00DA").unwrap();
    let outcome = AaxDecrypter::new(activation).decrypt_file(&aax, &m4b).await.unwrap();
    assert_eq!(outcome.metadata.title.as_deref(), Some("The Fifth Season"));

    let decrypted = std::fs::read(&m4b).unwrap();
    let (offset, plain) = &fixture.samples[0];
    let start = *offset as usize;
    assert_eq!(&decrypted[start..start + plain.len()], plain.as_slice());
}

#[tokio::test]
async fn test_license_not_granted() {
    let server = MockServer::start().await;
    let config = test_config(&server.uri());
    mount_license(&server, "Denied").await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");

    let manager = DownloadManager::with_token(ACCESS_TOKEN, "us", &config).unwrap();
    let err = manager
        .download(ASIN, &output, &DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_auth_error());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_missing_asset_leaves_no_file() {
    let server = MockServer::start().await;
    let config = test_config(&server.uri());
    mount_license(&server, "Granted").await;
    mount_asset(&server, ResponseTemplate::new(404)).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");

    let manager = DownloadManager::for_account(&account(), &config).unwrap();
    let err = manager
        .download(ASIN, &output, &DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, LibriSyncError::ApiError { status_code: Some(404), .. }));
    assert!(!output.exists());
    assert!(!part_path(&output).exists());
}

#[tokio::test]
async fn test_slow_asset_times_out() {
    let server = MockServer::start().await;
    let config = test_config(&server.uri());
    mount_license(&server, "Granted").await;
    mount_asset(
        &server,
        ResponseTemplate::new(200)
            .set_body_bytes(vec![0u8; 1024])
            .set_delay(Duration::from_secs(3)),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");
    let options = DownloadOptions {
        timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };

    let manager = DownloadManager::for_account(&account(), &config).unwrap();
    let err = manager.download(ASIN, &output, &options).await.unwrap_err();

    assert!(matches!(err, LibriSyncError::Timeout(_)));
    assert!(!output.exists());
    assert!(!part_path(&output).exists());
}

#[tokio::test]
async fn test_cancelled_before_license() {
    let server = MockServer::start().await;
    let config = test_config(&server.uri());
    mount_license(&server, "Granted").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = DownloadOptions {
        cancel: Some(cancel),
        ..Default::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");

    let manager = DownloadManager::for_account(&account(), &config).unwrap();
    let err = manager.download(ASIN, &output, &options).await.unwrap_err();

    assert!(matches!(err, LibriSyncError::Cancelled));
    assert!(!output.exists());
}

#[test]
fn test_expired_account_is_rejected() {
    let config = test_config("http://127.0.0.1:9");
    assert!(matches!(
        DownloadManager::for_account(&account_expiring_in(0), &config),
        Err(LibriSyncError::AuthError { .. })
    ));
}

#[tokio::test]
async fn test_requested_quality_reaches_license() {
    let server = MockServer::start().await;
    let config = test_config(&server.uri());

    Mock::given(method("POST"))
        .and(path(format!("/1.0/content/{}/licenserequest", ASIN)))
        .and(body_partial_json(json!({"quality": "Extreme", "consumption_type": "Download"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content_license": {
                "asin": ASIN,
                "status_code": "Granted",
                "content_metadata": {
                    "content_url": {"offline_url": format!("{}/assets/{}.aax", server.uri(), ASIN)}
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_asset(&server, ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64])).await;

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.aax");
    let options = DownloadOptions {
        quality: DownloadQuality::Extreme,
        ..Default::default()
    };

    let manager = DownloadManager::for_account(&account(), &config).unwrap();
    let descriptor = manager.download(ASIN, &output, &options).await.unwrap();

    assert_eq!(descriptor.bytes_downloaded, 64);
    assert_eq!(std::fs::read(&output).unwrap(), vec![7u8; 64]);
}
