mod common;

use common::generating_tools;
use imgdelta_core::{create_delta, spawn_create_delta, CreateOptions, DeltaError, ErrorKind};
use imgdelta_schema::{decode_header, HeaderMode};
use imgdelta_store::{MockStore, StoreError};
use std::fs;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

async fn two_images(store: &MockStore) -> (String, String) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f"), "v1").unwrap();
    let src = store
        .import(dir.path(), serde_json::json!({"Cmd": ["old"]}), Some("src"))
        .await
        .unwrap();
    fs::write(dir.path().join("f"), "v2").unwrap();
    let dst = store
        .import(dir.path(), serde_json::json!({"Cmd": ["new"]}), Some("dst"))
        .await
        .unwrap();
    (src.id.into_inner(), dst.id.into_inner())
}

fn options(tools: imgdelta_runtime::Tools) -> CreateOptions {
    CreateOptions {
        tools,
        ..CreateOptions::default()
    }
}

#[tokio::test]
async fn output_is_header_then_batch() {
    let bin = tempfile::tempdir().unwrap();
    let store = MockStore::new().unwrap();
    let (src, dst) = two_images(&store).await;

    let mut out = Vec::new();
    let report = create_delta(
        &store,
        &src,
        &dst,
        &options(generating_tools(bin.path(), "batch-bytes")),
        &mut out,
    )
    .await
    .unwrap();

    let nul = out.iter().position(|b| *b == 0).unwrap();
    let metadata = decode_header(&out[..nul]).unwrap();
    assert_eq!(metadata.version, 2);
    assert_eq!(metadata.docker_config, serde_json::json!({"Cmd": ["new"]}));
    assert_eq!(&out[nul + 1..], b"batch-bytes");
    assert_eq!(report.header_len, (nul + 1) as u64);
    assert_eq!(report.bytes_written, out.len() as u64);
    assert_eq!(store.active_mounts(), 0);
}

#[tokio::test]
async fn legacy_mode_writes_batch_only() {
    let bin = tempfile::tempdir().unwrap();
    let store = MockStore::new().unwrap();
    let (src, dst) = two_images(&store).await;
    let mut opts = options(generating_tools(bin.path(), "raw"));
    opts.header = HeaderMode::Legacy;

    let mut out = Vec::new();
    let report = create_delta(&store, &src, &dst, &opts, &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"raw");
    assert_eq!(report.header_len, 0);
}

#[tokio::test]
async fn generator_failure_is_reported_and_mounts_released() {
    let bin = tempfile::tempdir().unwrap();
    let store = MockStore::new().unwrap();
    let (src, dst) = two_images(&store).await;
    let tools = imgdelta_runtime::Tools {
        rsync: common::script(bin.path(), "rsync", "exit 12"),
        ..imgdelta_runtime::Tools::default()
    };

    let mut out = Vec::new();
    let err = create_delta(&store, &src, &dst, &options(tools), &mut out)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Process);
    assert_eq!(store.active_mounts(), 0);
}

#[tokio::test]
async fn missing_image_fails_before_rsync() {
    let bin = tempfile::tempdir().unwrap();
    let store = MockStore::new().unwrap();
    let (src, _) = two_images(&store).await;
    let tools = generating_tools(bin.path(), "x");

    let mut out = Vec::new();
    let err = create_delta(&store, &src, "nope", &options(tools), &mut out)
        .await
        .unwrap_err();
    assert!(matches!(err, DeltaError::Store(StoreError::ImageNotFound(_))));
    assert!(out.is_empty());
    assert_eq!(store.active_mounts(), 0);
}

#[tokio::test]
async fn progress_reports_stages() {
    let bin = tempfile::tempdir().unwrap();
    let store = MockStore::new().unwrap();
    let (src, dst) = two_images(&store).await;
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut opts = options(generating_tools(bin.path(), "b"));
    opts.progress = imgdelta_core::Progress::new(move |m| sink.lock().unwrap().push(m.to_owned()));

    create_delta(&store, &src, &dst, &opts, &mut Vec::new())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].starts_with("Invoking rsync from "));
    assert!(seen.iter().any(|m| m == "Extracted image config"));
    assert_eq!(seen.last().map(String::as_str), Some("rsync exited"));
}

#[tokio::test]
async fn reader_surface_streams_and_finishes() {
    let bin = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new().unwrap());
    let (src, dst) = two_images(&store).await;

    let mut reader = spawn_create_delta(
        Arc::clone(&store),
        src,
        dst,
        options(generating_tools(bin.path(), "stream")),
    );
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    let report = reader.finish().await.unwrap();

    assert!(out.ends_with(b"\x00stream"));
    assert_eq!(report.bytes_written, out.len() as u64);
}

#[tokio::test]
async fn reader_surface_fails_at_end_of_stream() {
    let bin = tempfile::tempdir().unwrap();
    let store = Arc::new(MockStore::new().unwrap());
    let (src, _) = two_images(&store).await;

    let mut reader = spawn_create_delta(
        Arc::clone(&store),
        src,
        "missing",
        options(generating_tools(bin.path(), "x")),
    );
    let mut out = Vec::new();
    let err = reader.read_to_end(&mut out).await.unwrap_err();
    assert!(err.to_string().contains("missing"), "{err}");

    let typed = reader.finish().await.unwrap_err();
    assert!(matches!(typed, DeltaError::Store(StoreError::ImageNotFound(_))));
}
