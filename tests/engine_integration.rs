//! End-to-end harvest runs against a mock provider.
//!
//! These tests drive the whole pipeline: windowed search rounds, the
//! dedup pool, bundle download and extraction, inventory export, and
//! the final archive.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use leakharvest_core::engine::FetchError;
use leakharvest_core::{HarvestError, Harvester, HarvesterConfig, SearchClientOptions};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

fn fast_search_options() -> SearchClientOptions {
    SearchClientOptions {
        proxy_url: None,
        sort_settle: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
        result_deadline: Duration::from_secs(2),
    }
}

fn config_for(server: &MockServer, output: PathBuf, limit: usize) -> HarvesterConfig {
    let mut config = HarvesterConfig::new("victim@example.com", "test-key", output);
    config.base_url = server.uri();
    config.limit = limit;
    config.search = fast_search_options();
    config
}

fn record_json(id: &str, date: &str) -> serde_json::Value {
    json!({
        "systemid": id,
        "name": format!("{id}.txt"),
        "bucket": "leaks.public",
        "media": "Paste document",
        "type": "text/plain",
        "size": 64,
        "date": date
    })
}

fn bundle_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn mount_terminate(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/intelligent/search/terminate"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn mount_results(server: &MockServer, session: &str, records: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/intelligent/search/result"))
        .and(query_param("id", session))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 1,
            "records": records
        })))
        .mount(server)
        .await;
}

async fn mount_export(server: &MockServer, session: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path("/intelligent/search/export"))
        .and(query_param("id", session))
        .and(query_param("f", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

fn archive_names(path: &std::path::Path) -> Vec<String> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

fn archive_entry(path: &std::path::Path, name: &str) -> String {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    content
}

#[tokio::test]
async fn test_run_walks_rounds_until_exhausted_and_packs_archive() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    // Round one: a full page of four results. The second dispatch must
    // carry the oldest stored date as its window end.
    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-1",
            "softselectorwarning": false,
            "status": 0
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .and(body_partial_json(json!({ "dateto": "2024-06-07 10:00:00" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-2",
            "softselectorwarning": false,
            "status": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    mount_results(
        &server,
        "sess-1",
        vec![
            record_json("r1", "2024-06-10 10:00:00"),
            record_json("r2", "2024-06-09 10:00:00"),
            record_json("r3", "2024-06-08 10:00:00"),
            record_json("r4", "2024-06-07 10:00:00"),
        ],
    )
    .await;
    // Round two: one already-known result plus two older ones, which is
    // below the exhaustion threshold and ends the run.
    mount_results(
        &server,
        "sess-2",
        vec![
            record_json("r4", "2024-06-07 10:00:00"),
            record_json("r5", "2024-06-05 10:00:00"),
            record_json("r6", "2024-06-04 10:00:00"),
        ],
    )
    .await;

    let side_file = "System ID,Name,Bucket,Media,Type,Size,Date\n\
                     r1,r1.txt,leaks.public,24,1,64,2024-06-10 10:00:00\n\
                     r2,r2.txt,leaks.public,24,1,64,2024-06-09 10:00:00\n";
    mount_export(
        &server,
        "sess-1",
        bundle_bytes(&[
            ("r1.txt", b"alpha".as_slice()),
            ("r2.txt", b"bravo".as_slice()),
            ("r3.txt", b"charlie".as_slice()),
            ("r4.txt", b"delta".as_slice()),
            ("Info.csv", side_file.as_bytes()),
        ]),
    )
    .await;
    mount_export(
        &server,
        "sess-2",
        bundle_bytes(&[
            ("r5.txt", b"echo".as_slice()),
            ("r6.txt", b"foxtrot".as_slice()),
        ]),
    )
    .await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 4))
        .await
        .unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let summary = harvester.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.total_files, 7);
    assert_eq!(summary.downloaded, 6);
    assert_eq!(summary.duplicated, 1);
    assert!(summary.total_bytes > 0);
    assert_eq!(summary.output.as_deref(), Some(output.as_path()));

    // r1-r6 artifacts, the preserved bundle side file, the inventory,
    // and the result database.
    assert_eq!(summary.archived_files, 9);
    let names = archive_names(&output);
    for artifact in ["r1.txt", "r2.txt", "r3.txt", "r4.txt", "r5.txt", "r6.txt"] {
        assert!(names.contains(&artifact.to_string()), "missing {artifact}");
    }
    assert!(names.contains(&"Info.csv".to_string()));
    assert!(names.contains(&"info.sqlite3".to_string()));
    assert_eq!(
        names
            .iter()
            .filter(|n| n.starts_with("info_orig_") && n.ends_with(".csv"))
            .count(),
        1
    );

    // Every record made it into the inventory, flagged as downloaded.
    let inventory = archive_entry(&output, "Info.csv");
    let mut reader = csv::Reader::from_reader(inventory.as_bytes());
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 6);
    for row in &rows {
        assert_eq!(row.get(8), Some("true"), "row not downloaded: {row:?}");
    }

    assert!(!workspace.exists(), "workspace should be removed");
    server.verify().await;
}

#[tokio::test]
async fn test_run_reabsorbs_a_fully_repeated_round() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    // Both rounds return the same full page. All records share one
    // timestamp, so the second window ends exactly on it and the
    // provider hands the page back; dedup absorbs it and the round
    // inserts nothing.
    let page: Vec<serde_json::Value> = (0..10)
        .map(|i| record_json(&format!("d{i}"), "2024-03-15 12:00:00"))
        .collect();

    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-a",
            "softselectorwarning": false,
            "status": 0
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-b",
            "softselectorwarning": false,
            "status": 0
        })))
        .mount(&server)
        .await;
    mount_results(&server, "sess-a", page.clone()).await;
    mount_results(&server, "sess-b", page).await;

    let files: Vec<(String, Vec<u8>)> = (0..10)
        .map(|i| (format!("d{i}.txt"), format!("payload {i}").into_bytes()))
        .collect();
    let entries: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_slice()))
        .collect();
    mount_export(&server, "sess-a", bundle_bytes(&entries)).await;
    mount_export(&server, "sess-b", bundle_bytes(&[])).await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 10))
        .await
        .unwrap();

    let summary = harvester.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rounds, 2);
    assert_eq!(summary.total_files, 20);
    assert_eq!(summary.duplicated, 10);
    assert_eq!(summary.downloaded, 10);
    // 10 artifacts plus the inventory and the result database.
    assert_eq!(summary.archived_files, 12);
}

#[tokio::test]
async fn test_run_dedups_within_a_page() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-dup",
            "softselectorwarning": false,
            "status": 0
        })))
        .mount(&server)
        .await;
    mount_results(
        &server,
        "sess-dup",
        vec![
            record_json("xxx", "2024-02-02 00:00:00"),
            record_json("xxx", "2024-02-02 00:00:00"),
            record_json("xxx", "2024-02-02 00:00:00"),
            record_json("yyy", "2024-02-01 00:00:00"),
        ],
    )
    .await;
    mount_export(
        &server,
        "sess-dup",
        bundle_bytes(&[
            ("xxx.txt", b"once".as_slice()),
            ("yyy.txt", b"twice".as_slice()),
        ]),
    )
    .await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 1000))
        .await
        .unwrap();

    let summary = harvester.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.total_files, 4);
    assert_eq!(summary.duplicated, 2);
    assert_eq!(summary.downloaded, 2);
    assert!(output.exists());
}

#[tokio::test]
async fn test_run_without_results_writes_no_archive() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-empty",
            "softselectorwarning": false,
            "status": 0
        })))
        .mount(&server)
        .await;
    mount_results(&server, "sess-empty", Vec::new()).await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 1000))
        .await
        .unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let summary = harvester.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.rounds, 1);
    assert_eq!(summary.total_files, 0);
    assert_eq!(summary.downloaded, 0);
    assert!(summary.output.is_none());
    assert!(!output.exists());
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_run_aborts_on_non_zip_bundle_and_cleans_up() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-bad",
            "softselectorwarning": false,
            "status": 0
        })))
        .mount(&server)
        .await;
    mount_results(
        &server,
        "sess-bad",
        vec![record_json("bad", "2024-01-01 00:00:00")],
    )
    .await;
    mount_export(&server, "sess-bad", b"an html error page, not a zip".to_vec()).await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 1000))
        .await
        .unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let error = harvester.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(
        error,
        HarvestError::Fetch(FetchError::InvalidBundleType { .. })
    ));
    assert!(!output.exists());
    assert!(!workspace.exists(), "workspace should be removed on error");
}

#[tokio::test]
async fn test_run_rejects_unsupported_selector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "",
            "softselectorwarning": true,
            "status": 0
        })))
        .mount(&server)
        .await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 1000))
        .await
        .unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let error = harvester.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(error, HarvestError::InvalidSelector { .. }));
    assert!(!workspace.exists());
}

#[tokio::test]
async fn test_run_cancelled_during_bundle_download() {
    let server = MockServer::start().await;
    mount_terminate(&server).await;

    Mock::given(method("POST"))
        .and(path("/intelligent/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "sess-slow",
            "softselectorwarning": false,
            "status": 0
        })))
        .mount(&server)
        .await;
    mount_results(
        &server,
        "sess-slow",
        vec![record_json("slow1", "2024-04-01 00:00:00")],
    )
    .await;
    // The export stalls long enough for the cancel to land mid-transfer.
    Mock::given(method("GET"))
        .and(path("/intelligent/search/export"))
        .and(query_param("id", "sess-slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(bundle_bytes(&[("slow1.txt", b"late".as_slice())]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");
    let harvester = Harvester::new(config_for(&server, output.clone(), 1000))
        .await
        .unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
    }

    let started = std::time::Instant::now();
    let error = harvester.run(cancel).await.unwrap_err();

    assert!(matches!(error, HarvestError::Cancelled));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "run kept going after cancellation"
    );
    assert!(!output.exists(), "no archive after a cancelled run");
    assert!(!workspace.exists(), "workspace should be removed on cancel");
}

#[tokio::test]
async fn test_run_cancelled_before_first_round() {
    let out_dir = TempDir::new().unwrap();
    let output = out_dir.path().join("final.zip");

    let mut config = HarvesterConfig::new("victim@example.com", "test-key", output.clone());
    config.base_url = "http://127.0.0.1:1".to_string();
    config.search = fast_search_options();

    let harvester = Harvester::new(config).await.unwrap();
    let workspace = harvester.workspace().to_path_buf();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = harvester.run(cancel).await.unwrap_err();

    assert!(matches!(error, HarvestError::Cancelled));
    assert!(!output.exists());
    assert!(!workspace.exists(), "workspace should be removed on cancel");
}
