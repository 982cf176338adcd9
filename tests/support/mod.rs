//! Shared fixtures for integration tests: mock archive endpoints and
//! ZIP payload builders.
#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use md5::{Digest, Md5};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

use nbia_fetch::auth::{Credentials, TokenManager};
use nbia_fetch::http::ApiClient;

/// Path of the mock token endpoint.
pub const TOKEN_PATH: &str = "/nbia-api/oauth/token";

/// Path of the mock metadata endpoint (newer generation).
pub const META_PATH: &str = "/nbia-api/services/v2/getSeriesMetaData";

/// Path of the mock image endpoint (newer generation, hash variant).
pub const IMAGE_PATH: &str = "/nbia-api/services/v2/getImageWithMD5Hash";

/// Mounts a token endpoint issuing a long-lived bearer.
pub async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"access_token":"test-bearer","expires_in":7200,"refresh_token":"r","token_type":"bearer","not-before-policy":0}"#,
        ))
        .mount(server)
        .await;
}

/// Mounts a metadata response (array form) for one series UID.
pub async fn mount_metadata(server: &MockServer, uid: &str, record: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(META_PATH))
        .and(query_param("SeriesInstanceUID", uid))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([record])))
        .mount(server)
        .await;
}

/// Mounts an image response serving the given archive bytes.
pub async fn mount_image(server: &MockServer, uid: &str, zip_bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(IMAGE_PATH))
        .and(query_param("SeriesInstanceUID", uid))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/zip")
                .set_body_bytes(zip_bytes),
        )
        .mount(server)
        .await;
}

/// A series record as the archive's metadata endpoint would return it.
pub fn series_record_json(uid: &str, subject: &str, study: &str, file_size: u64) -> serde_json::Value {
    serde_json::json!({
        "Series UID": uid,
        "Study UID": study,
        "Subject ID": subject,
        "Collection": "TEST-COLLECTION",
        "Modality": "CT",
        "Number of Images": "1",
        "File Size": file_size.to_string(),
    })
}

/// Builds a ZIP archive from (name, content) entries.
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(content).expect("write zip entry");
        }
        writer.finish().expect("finish zip");
    }
    cursor.into_inner()
}

/// Builds a ZIP archive whose `md5hashes.csv` lists the correct digest of
/// every entry.
pub fn build_zip_with_hashes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut manifest = String::from("filename,md5\n");
    for (name, content) in entries {
        manifest.push_str(&format!("{name},{}\n", md5_hex(content)));
    }

    let mut all: Vec<(&str, &[u8])> = vec![("md5hashes.csv", manifest.as_bytes())];
    all.extend_from_slice(entries);
    build_zip(&all)
}

/// Builds a ZIP archive whose manifest deliberately mismatches `bad_entry`.
pub fn build_zip_with_bad_hash(entries: &[(&str, &[u8])], bad_entry: &str) -> Vec<u8> {
    let mut manifest = String::from("filename,md5\n");
    for (name, content) in entries {
        if *name == bad_entry {
            manifest.push_str(&format!("{name},{}\n", md5_hex(b"different bytes")));
        } else {
            manifest.push_str(&format!("{name},{}\n", md5_hex(content)));
        }
    }

    let mut all: Vec<(&str, &[u8])> = vec![("md5hashes.csv", manifest.as_bytes())];
    all.extend_from_slice(entries);
    build_zip(&all)
}

/// Lowercase hex MD5 of a byte slice.
pub fn md5_hex(content: &[u8]) -> String {
    let digest = Md5::digest(content);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Connects a token manager against the mock server.
pub async fn connect_tokens(server: &MockServer, output: &Path) -> Arc<TokenManager> {
    Arc::new(
        TokenManager::connect(
            ApiClient::new(reqwest_client()),
            format!("{}{TOKEN_PATH}", server.uri()),
            Credentials {
                username: "nbia_guest".to_string(),
                password: String::new(),
            },
            output.join("nbia_guest.json"),
        )
        .await
        .expect("token bootstrap against mock server"),
    )
}

/// Plain client for tests; the production transport options are exercised
/// in the transport unit tests.
pub fn reqwest_client() -> reqwest::Client {
    reqwest::Client::new()
}
