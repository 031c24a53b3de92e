//! Artifact download against a real HTTP server.

use std::io::{self, Cursor};

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use mesh_executor::{ArtifactFetcher, ExecutorError, HttpFetcher};
use mesh_proto::url::TOKEN_HEADER;
use mesh_proto::{ContainerId, ControlUrl};

/// A gzip tarball with a single `pkg/` top-level directory.
fn gzipped_package() -> Vec<u8> {
    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);

        let content = b"{\"name\":\"example-app\",\"version\":\"1.2.3\"}";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "pkg/package.json", &content[..])
            .unwrap();

        let content = b"module.exports = {};\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "pkg/lib/index.js", &content[..])
            .unwrap();

        builder.finish().unwrap();
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    io::copy(&mut Cursor::new(tar_data), &mut encoder).unwrap();
    encoder.finish().unwrap()
}

async fn serve_artifact(
    Path((id, deployment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Vec<u8>, StatusCode> {
    if headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) != Some("exec-token") {
        return Err(StatusCode::FORBIDDEN);
    }
    if (id.as_str(), deployment.as_str()) != ("3", "12345") {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(gzipped_package())
}

async fn start_server() -> ControlUrl {
    let app = Router::new().route("/artifacts/executor/:id/:deployment", get(serve_artifact));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ControlUrl::parse(&format!(
        "ws://exec-token@127.0.0.1:{}/executor-control",
        addr.port()
    ))
    .unwrap()
}

#[tokio::test]
async fn downloads_and_extracts_into_the_container_directory() {
    let control = start_server().await;
    let url = control.download_url(&ContainerId::new("3"), "12345");

    let dest = TempDir::new().unwrap();
    HttpFetcher::new()
        .fetch(&url, control.token(), dest.path())
        .await
        .unwrap();

    let manifest = std::fs::read_to_string(dest.path().join("package.json")).unwrap();
    assert!(manifest.contains("example-app"));
    assert!(dest.path().join("lib/index.js").exists());
    // The archive's top-level directory was stripped away.
    assert!(!dest.path().join("pkg").exists());
}

#[tokio::test]
async fn wrong_token_surfaces_the_http_status() {
    let control = start_server().await;
    let url = control.download_url(&ContainerId::new("3"), "12345");

    let dest = TempDir::new().unwrap();
    let err = HttpFetcher::new()
        .fetch(&url, "wrong-token", dest.path())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::DownloadStatus { status: 403 }));
}

#[tokio::test]
async fn missing_deployment_is_a_download_status_error() {
    let control = start_server().await;
    let url = control.download_url(&ContainerId::new("3"), "no-such-deployment");

    let dest = TempDir::new().unwrap();
    let err = HttpFetcher::new()
        .fetch(&url, control.token(), dest.path())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::DownloadStatus { status: 404 }));
}
