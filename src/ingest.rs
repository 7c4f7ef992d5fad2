//! Batch ingestion
//!
//! A push carries one or more deployment changes. Items are validated and
//! written one at a time in input order; a failing item is recorded against
//! its index and the rest of the batch carries on.

use crate::common::{Error, Result, METRICS};
use crate::store::{DeploymentRecord, DeploymentRequest, RecordStore};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{error, info};
use uuid::Uuid;

/// A push item that was not written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub index: usize,
    pub domain: String,
    pub app_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    AllSucceeded,
    AllFailed,
    Partial,
}

/// Result of one push
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    /// Correlation id stamped on every record of this push
    pub request_id: String,
    pub created: Vec<DeploymentRecord>,
    pub failed: Vec<FailedItem>,
}

impl BatchResult {
    pub fn processed_count(&self) -> usize {
        self.created.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn outcome(&self) -> BatchOutcome {
        match (self.created.is_empty(), self.failed.is_empty()) {
            (_, true) => BatchOutcome::AllSucceeded,
            (true, false) => BatchOutcome::AllFailed,
            (false, false) => BatchOutcome::Partial,
        }
    }
}

/// One push item after decoding. A malformed item keeps whatever identity
/// fields could be read so its failure entry still names it.
struct PushItem {
    domain: String,
    app_name: String,
    request: Result<DeploymentRequest>,
}

impl From<DeploymentRequest> for PushItem {
    fn from(request: DeploymentRequest) -> Self {
        Self {
            domain: request.domain.clone(),
            app_name: request.app_name.clone(),
            request: Ok(request),
        }
    }
}

impl PushItem {
    fn decode(raw: Value) -> Self {
        let field = |name: &str| {
            raw.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let domain = field("domain");
        let app_name = field("app_name");
        let request = serde_json::from_value::<DeploymentRequest>(raw)
            .map_err(|e| Error::Validation(format!("malformed deployment: {}", e)));
        Self {
            domain,
            app_name,
            request,
        }
    }
}

#[derive(Clone)]
pub struct BatchIngestor {
    records: RecordStore,
    batch_timeout: Duration,
}

impl BatchIngestor {
    pub fn new(records: RecordStore, batch_timeout: Duration) -> Self {
        Self {
            records,
            batch_timeout,
        }
    }

    /// Write every item of a push. Only an empty push fails as a whole.
    pub async fn ingest(&self, items: Vec<DeploymentRequest>) -> Result<BatchResult> {
        self.ingest_items(items.into_iter().map(PushItem::from).collect())
            .await
    }

    /// Like [`ingest`](Self::ingest) for undecoded JSON items. An item whose
    /// fields have the wrong types fails on its own index.
    pub async fn ingest_json(&self, items: Vec<Value>) -> Result<BatchResult> {
        self.ingest_items(items.into_iter().map(PushItem::decode).collect())
            .await
    }

    async fn ingest_items(&self, items: Vec<PushItem>) -> Result<BatchResult> {
        if items.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let request_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.batch_timeout;
        info!(request_id = %request_id, count = items.len(), "Processing deployment push");

        let mut result = BatchResult {
            request_id,
            created: Vec::with_capacity(items.len()),
            failed: Vec::new(),
        };

        for (index, item) in items.into_iter().enumerate() {
            let written = match item.request.and_then(|req| req.validate()) {
                Ok(new) => {
                    self.records
                        .create_before(new, &result.request_id, deadline)
                        .await
                }
                Err(e) => Err(e),
            };

            match written {
                Ok(record) => {
                    info!(
                        request_id = %result.request_id,
                        deployment_id = %record.id,
                        domain = %record.domain,
                        app_name = %record.app_name,
                        version = record.version,
                        "Created deployment"
                    );
                    result.created.push(record);
                }
                Err(e) => {
                    error!(
                        request_id = %result.request_id,
                        index,
                        domain = %item.domain,
                        app_name = %item.app_name,
                        error = %e,
                        "Failed to create deployment"
                    );
                    METRICS.batch_items_failed.inc();
                    result.failed.push(FailedItem {
                        index,
                        domain: item.domain,
                        app_name: item.app_name,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StoreConfig;
    use crate::store::Store;
    use tempfile::tempdir;

    fn item(domain: &str, app: &str, port: i64) -> DeploymentRequest {
        DeploymentRequest {
            domain: domain.into(),
            app_name: app.into(),
            docker_image: format!("{}:latest", app),
            port: Some(port),
            ..Default::default()
        }
    }

    #[test]
    fn test_outcome_classification() {
        let mut result = BatchResult {
            request_id: "r".into(),
            created: Vec::new(),
            failed: Vec::new(),
        };
        assert_eq!(result.outcome(), BatchOutcome::AllSucceeded);

        result.failed.push(FailedItem {
            index: 0,
            domain: "d".into(),
            app_name: "a".into(),
            error: "bad".into(),
        });
        assert_eq!(result.outcome(), BatchOutcome::AllFailed);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let dir = tempdir().unwrap();
        let store = Store::open(&StoreConfig::with_path(dir.path().join("db"))).unwrap();
        let ingestor = BatchIngestor::new(store.records.clone(), Duration::from_secs(30));

        assert!(matches!(ingestor.ingest(vec![]).await, Err(Error::EmptyBatch)));
        assert!(store.records.list_latest().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_item_fails_alone() {
        let dir = tempdir().unwrap();
        let store = Store::open(&StoreConfig::with_path(dir.path().join("db"))).unwrap();
        let ingestor = BatchIngestor::new(store.records.clone(), Duration::from_secs(30));

        let good = serde_json::to_value(item("example.com", "api", 8080)).unwrap();
        let bad = serde_json::json!({
            "domain": "example.com",
            "app_name": "web",
            "docker_image": "web:latest",
            "port": 80,
            "updated_at": "yesterday",
        });

        let result = ingestor.ingest_json(vec![bad, good]).await.unwrap();
        assert_eq!(result.outcome(), BatchOutcome::Partial);
        assert_eq!(result.failed[0].index, 0);
        assert_eq!(result.failed[0].app_name, "web");
        assert!(result.failed[0].error.contains("malformed"));
        assert_eq!(result.created[0].app_name, "api");
    }

    #[tokio::test]
    async fn test_records_share_request_id() {
        let dir = tempdir().unwrap();
        let store = Store::open(&StoreConfig::with_path(dir.path().join("db"))).unwrap();
        let ingestor = BatchIngestor::new(store.records.clone(), Duration::from_secs(30));

        let result = ingestor
            .ingest(vec![
                item("example.com", "api", 8080),
                item("example.com", "api", 8081),
            ])
            .await
            .unwrap();

        assert_eq!(result.outcome(), BatchOutcome::AllSucceeded);
        assert!(result
            .created
            .iter()
            .all(|r| r.request_id == result.request_id));
        // same key twice in one push: input order decides the versions
        assert_eq!(result.created[0].version, 1);
        assert_eq!(result.created[0].port, 8080);
        assert_eq!(result.created[1].version, 2);
    }
}
