//! Whole-run orchestration tests: manifest in, organized layout out.

mod support;

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use wiremock::MockServer;

use nbia_fetch::auth::Credentials;
use nbia_fetch::config::RunConfig;
use nbia_fetch::run::run;

use support::{
    IMAGE_PATH, META_PATH, TOKEN_PATH, build_zip_with_hashes, mount_image, mount_metadata,
    mount_token_endpoint, series_record_json,
};

fn test_config(server: &MockServer, input: &Path, output: &Path) -> RunConfig {
    RunConfig {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        concurrency: 2,
        metadata_workers: 4,
        max_conns_per_host: 8,
        max_retries: 1,
        retry_delay: Duration::from_millis(20),
        request_delay: Duration::ZERO,
        force: false,
        skip_existing: false,
        no_extract: false,
        hash_verify: true,
        refresh_metadata: false,
        meta_only: false,
        proxy: None,
        credentials: Credentials {
            username: "nbia_guest".to_string(),
            password: String::new(),
        },
        token_url: format!("{}{TOKEN_PATH}", server.uri()),
        meta_url: format!("{}{META_PATH}", server.uri()),
        image_url: format!("{}{IMAGE_PATH}", server.uri()),
        debug: false,
    }
}

/// Manifest in, extracted series and cache entries out.
#[tokio::test]
async fn full_run_from_manifest() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let body = vec![0x42_u8; 1000];
    for uid in ["U1", "U2"] {
        mount_metadata(&server, uid, series_record_json(uid, "S", "Y", 1000)).await;
        mount_image(&server, uid, build_zip_with_hashes(&[("img.dcm", &body)])).await;
    }

    let dir = TempDir::new().expect("temp dir");
    let manifest = dir.path().join("list.tcia");
    std::fs::write(&manifest, "manifestVersion=3.0\nU1\nU2\n").expect("write manifest");
    let output = dir.path().join("out");

    run(test_config(&server, &manifest, &output))
        .await
        .expect("run succeeds");

    for uid in ["U1", "U2"] {
        assert_eq!(
            std::fs::read(output.join("S/Y").join(uid).join("img.dcm")).expect("image"),
            body
        );
        assert!(output.join("metadata").join(format!("{uid}.json")).exists());
    }
    assert!(output.join("nbia_guest.json").exists(), "token persisted");
}

/// An empty manifest terminates cleanly with nothing downloaded.
#[tokio::test]
async fn empty_manifest_terminates_cleanly() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let dir = TempDir::new().expect("temp dir");
    let manifest = dir.path().join("list.tcia");
    std::fs::write(&manifest, "downloadServerUrl=https://archive.example\n").expect("manifest");
    let output = dir.path().join("out");

    run(test_config(&server, &manifest, &output))
        .await
        .expect("empty run succeeds");

    assert!(output.join("metadata").is_dir());
    let image_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == IMAGE_PATH)
        .count();
    assert_eq!(image_requests, 0);
}

/// Meta-only runs stop after metadata resolution.
#[tokio::test]
async fn meta_only_stops_before_downloads() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;
    mount_metadata(&server, "U1", series_record_json("U1", "S", "Y", 1000)).await;

    let dir = TempDir::new().expect("temp dir");
    let manifest = dir.path().join("list.tcia");
    std::fs::write(&manifest, "U1\n").expect("manifest");
    let output = dir.path().join("out");

    let mut config = test_config(&server, &manifest, &output);
    config.meta_only = true;
    run(config).await.expect("meta-only run succeeds");

    assert!(output.join("metadata/U1.json").exists());
    assert!(!output.join("S").exists(), "no image downloads");
    let image_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == IMAGE_PATH)
        .count();
    assert_eq!(image_requests, 0);
}

/// A missing manifest is a fatal startup error.
#[tokio::test]
async fn missing_manifest_is_fatal() {
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let dir = TempDir::new().expect("temp dir");
    let config = test_config(&server, &dir.path().join("absent.tcia"), &dir.path().join("out"));

    assert!(run(config).await.is_err());
}

/// An unreachable token endpoint is a fatal startup error.
#[tokio::test]
async fn token_bootstrap_failure_is_fatal() {
    let server = MockServer::start().await;
    // No token endpoint mounted: wiremock answers 404.

    let dir = TempDir::new().expect("temp dir");
    let manifest = dir.path().join("list.tcia");
    std::fs::write(&manifest, "U1\n").expect("manifest");

    let config = test_config(&server, &manifest, &dir.path().join("out"));
    assert!(run(config).await.is_err());
}
