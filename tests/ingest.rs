//! Batch ingestion: per-item failures and request correlation

use deployctl::common::StoreConfig;
use deployctl::store::{DeploymentRequest, Store};
use deployctl::{BatchIngestor, BatchOutcome, Error};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn setup(dir: &TempDir) -> (Store, BatchIngestor) {
    let store = Store::open(&StoreConfig::with_path(dir.path().join("db"))).unwrap();
    let ingestor = BatchIngestor::new(store.records.clone(), Duration::from_secs(30));
    (store, ingestor)
}

fn item(domain: &str, app: &str, port: i64) -> DeploymentRequest {
    DeploymentRequest {
        domain: domain.into(),
        app_name: app.into(),
        docker_image: format!("registry.example.com/{}:2.1", app),
        port: Some(port),
        env: Some(vec!["RUST_LOG=info".into()]),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_partial_batch_keeps_good_items() {
    let dir = TempDir::new().unwrap();
    let (store, ingestor) = setup(&dir);

    let result = ingestor
        .ingest(vec![
            item("example.com", "api", 8080),
            item("example.com", "web", 99999),
            item("example.com", "worker", 9000),
        ])
        .await
        .unwrap();

    assert_eq!(result.outcome(), BatchOutcome::Partial);
    assert_eq!(result.processed_count(), 2);
    assert_eq!(result.failed_count(), 1);

    let failed = &result.failed[0];
    assert_eq!(failed.index, 1);
    assert_eq!(failed.app_name, "web");
    assert!(failed.error.contains("port"), "{}", failed.error);

    let latest = store.records.list_latest().await.unwrap();
    let mut names: Vec<_> = latest.iter().map(|r| r.app_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["api", "worker"]);
    assert!(latest.iter().all(|r| r.request_id == result.request_id));
}

#[tokio::test]
async fn test_all_items_invalid() {
    let dir = TempDir::new().unwrap();
    let (store, ingestor) = setup(&dir);

    let mut no_image = item("example.com", "api", 8080);
    no_image.docker_image.clear();
    let mut no_port = item("example.com", "web", 8080);
    no_port.port = None;

    let result = ingestor.ingest(vec![no_image, no_port]).await.unwrap();
    assert_eq!(result.outcome(), BatchOutcome::AllFailed);
    assert_eq!(
        result.failed.iter().map(|f| f.index).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert!(store.records.list_latest().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_batch_is_an_error() {
    let dir = TempDir::new().unwrap();
    let (_store, ingestor) = setup(&dir);

    let err = assert_err!(ingestor.ingest(Vec::new()).await);
    assert!(matches!(err, Error::EmptyBatch));
    assert_eq!(err.to_http_status(), 400);
}

#[tokio::test]
async fn test_separate_pushes_get_separate_request_ids() {
    let dir = TempDir::new().unwrap();
    let (_store, ingestor) = setup(&dir);

    let first = assert_ok!(ingestor.ingest(vec![item("example.com", "api", 8080)]).await);
    let second = assert_ok!(ingestor.ingest(vec![item("example.com", "api", 8080)]).await);

    assert_ne!(first.request_id, second.request_id);
    assert_eq!(first.created[0].version, 1);
    assert_eq!(second.created[0].version, 2);
}
