//! Bulk archive fetch from local files and a mock download server

mod common;

use common::{init_tracing, job, Stores};
use flate2::write::GzEncoder;
use flate2::Compression;
use matflow_pipeline::source::BulkArchiveSource;
use matflow_pipeline::{Cursor, FetchPool, JobConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dump_lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!(r#"{{"entry_id": "oqmd-{i:04}", "natoms": {}}}"#, i % 7 + 1))
        .collect()
}

fn gzipped(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap()
}

fn archive_pool(stores: &Stores, url: &str, downloads: &Path, config: JobConfig) -> FetchPool {
    let source = BulkArchiveSource::new("oqmd", url, downloads, config.limit, "entry_id").unwrap();
    FetchPool::new(
        Arc::new(source),
        stores.store.clone(),
        stores.checkpoints.clone(),
        stores.failures.clone(),
        config,
    )
}

fn write_plain(dir: &Path, lines: &[String]) -> PathBuf {
    let path = dir.join("oqmd.jsonl");
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn oqmd_job() -> JobConfig {
    JobConfig {
        limit: 5,
        ..job("oqmd")
    }
}

#[tokio::test]
async fn test_local_archive_is_fetched_completely() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let archive = write_plain(dir.path(), &dump_lines(23));
    let stores = Stores::new();

    let report = archive_pool(
        &stores,
        &format!("file://{}", archive.display()),
        &dir.path().join("downloads"),
        oqmd_job(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.records_written, 23);
    assert_eq!(report.units_completed, 5);
    assert_eq!(report.last_cursor, Some(Cursor::Offset(23)));
    assert_eq!(
        stores.checkpoints.history("oqmd", "raw").await.last(),
        Some(&Cursor::Offset(23))
    );
    let snapshot = stores.raw_snapshot("raw").await;
    assert_eq!(snapshot[0].0, "oqmd-0000");
    assert_eq!(snapshot[22].2, Cursor::Offset(20));
}

#[tokio::test]
async fn test_archive_run_resumes_from_checkpoint() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let archive = write_plain(dir.path(), &dump_lines(12));
    let url = format!("file://{}", archive.display());
    let downloads = dir.path().join("downloads");
    let stores = Stores::new();

    archive_pool(&stores, &url, &downloads, oqmd_job()).run().await.unwrap();

    // Nothing left past the checkpoint
    let again = archive_pool(&stores, &url, &downloads, oqmd_job()).run().await.unwrap();
    assert_eq!(again.records_written, 0);

    // An explicit offset re-reads from that entry
    let partial = JobConfig {
        offset: Some(8),
        ..oqmd_job()
    };
    let report = archive_pool(&stores, &url, &downloads, partial).run().await.unwrap();
    assert_eq!(report.records_written, 4);
    assert_eq!(report.last_cursor, Some(Cursor::Offset(12)));
    assert_eq!(stores.raw_snapshot("raw").await.len(), 12);
}

#[tokio::test]
async fn test_bad_lines_are_logged_not_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut lines = dump_lines(6);
    lines[2] = "{not json".to_string();
    lines[4] = r#"{"natoms": 3}"#.to_string();
    let archive = write_plain(dir.path(), &lines);
    let stores = Stores::new();

    let report = archive_pool(
        &stores,
        archive.to_str().unwrap(),
        &dir.path().join("downloads"),
        oqmd_job(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.records_written, 4);
    assert_eq!(report.records_failed, 2);
    let mut locators: Vec<String> = stores
        .failures
        .entries()
        .await
        .into_iter()
        .map(|e| e.url_or_id)
        .collect();
    locators.sort();
    assert!(locators[0].ends_with("#2"));
    assert!(locators[1].ends_with("#4"));
}

#[tokio::test]
async fn test_downloaded_gzip_archive_is_used_once() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dumps/oqmd.jsonl.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(gzipped(&dump_lines(9))))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let downloads = dir.path().join("downloads");
    let url = format!("{}/dumps/oqmd.jsonl.gz", server.uri());
    let stores = Stores::new();

    let report = archive_pool(&stores, &url, &downloads, oqmd_job()).run().await.unwrap();
    assert_eq!(report.records_written, 9);
    assert!(downloads.join("oqmd.jsonl.gz").exists());
    assert!(downloads.join("oqmd.jsonl").exists());

    // A second source over the same directory reuses the download
    let rerun = JobConfig {
        offset: Some(0),
        ..oqmd_job()
    };
    let report = archive_pool(&stores, &url, &downloads, rerun).run().await.unwrap();
    assert_eq!(report.records_written, 9);
    server.verify().await;
}

#[tokio::test]
async fn test_failed_download_aborts_the_job() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let stores = Stores::new();

    let result = archive_pool(
        &stores,
        &format!("{}/dumps/oqmd.jsonl.gz", server.uri()),
        dir.path(),
        oqmd_job(),
    )
    .run()
    .await;

    assert!(result.is_err());
    assert!(stores.store.raw_rows(&common::table_name("raw")).await.is_empty());
}
