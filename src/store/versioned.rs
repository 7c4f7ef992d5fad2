//! Versioned deployment record store
//!
//! Every create appends a new record whose version is one more than the
//! highest committed version for its (domain, app_name) key. Version
//! allocation and record insertion happen in one optimistic transaction:
//!
//! 1. read the key's head for update (registers it for conflict detection)
//! 2. `version = head + 1`, check the `versions` slot is free
//! 3. write record, `versions` slot and new head
//! 4. commit; a concurrent commit on the same head fails this one
//!
//! A failed attempt is dropped uncommitted before the next attempt re-reads
//! the head, so aborted attempts never leave a gap. Writers on one key also
//! queue on an in-process gate so they rarely reach step 4 together.

use crate::common::{Error, Result, StoreConfig, METRICS};
use crate::store::locks::KeyLocks;
use crate::store::pool::{ensure_before, StorePool};
use crate::store::record::split_version_key;
use crate::store::{
    cf, commit_error, Db, DeploymentKey, DeploymentRecord, DeploymentStats, DeploymentStatus,
    NewDeployment, CF_DEPLOYMENTS, CF_HEADS, CF_VERSIONS,
};
use chrono::Utc;
use rocksdb::{Direction, IteratorMode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RecordStore {
    pool: StorePool,
    locks: Arc<KeyLocks>,
    op_timeout: Duration,
    max_attempts: u32,
    write_delay: Duration,
}

impl RecordStore {
    pub fn new(pool: StorePool, config: &StoreConfig) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::new()),
            op_timeout: config.op_timeout(),
            max_attempts: config.max_conflict_retries,
            write_delay: config.write_delay(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.op_timeout
    }

    /// Append a new version for the key of `new`.
    pub async fn create(&self, new: NewDeployment, request_id: &str) -> Result<DeploymentRecord> {
        self.create_before(new, request_id, self.deadline()).await
    }

    /// [`create`](Self::create) bounded by an explicit deadline.
    pub async fn create_before(
        &self,
        new: NewDeployment,
        request_id: &str,
        deadline: Instant,
    ) -> Result<DeploymentRecord> {
        new.validate()?;
        let key = new.key();
        let head_key = key.head_key();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let _gate = tokio::time::timeout(remaining, self.locks.lock(&head_key))
            .await
            .map_err(|_| {
                METRICS.store_timeouts.inc();
                Error::Timeout(format!("create {}: deadline passed waiting for key", key))
            })?;

        let request_id = request_id.to_string();
        let max_attempts = self.max_attempts;
        let write_delay = self.write_delay;

        let record = self
            .pool
            .run("create", deadline, move |db, deadline| {
                for attempt in 1..=max_attempts {
                    ensure_before(deadline, "create")?;
                    match try_create(db, &new, &key, &request_id, deadline, write_delay) {
                        Err(Error::KeyConflict(what)) => {
                            METRICS.version_conflicts.inc();
                            debug!(key = %what, attempt, "version conflict, retrying");
                        }
                        other => return other,
                    }
                }
                warn!(key = %key, attempts = max_attempts, "version allocation kept conflicting");
                Err(Error::KeyConflict(format!(
                    "{} after {} attempts",
                    key, max_attempts
                )))
            })
            .await?;

        METRICS.deployments_created.inc();
        Ok(record)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<DeploymentRecord> {
        self.pool
            .run("get_by_id", self.deadline(), move |db, _| {
                match db.get_cf(cf(db, CF_DEPLOYMENTS)?, id.as_bytes())? {
                    Some(bytes) => DeploymentRecord::decode(&bytes),
                    None => Err(Error::NotFound(format!("deployment {}", id))),
                }
            })
            .await
    }

    /// Latest record per key, newest `created_at` first.
    pub async fn list_latest(&self) -> Result<Vec<DeploymentRecord>> {
        self.pool
            .run("list_latest", self.deadline(), |db, _| latest_records(db))
            .await
    }

    /// Every version of one key, oldest first.
    pub async fn history(&self, key: DeploymentKey) -> Result<Vec<DeploymentRecord>> {
        self.pool
            .run("history", self.deadline(), move |db, _| {
                let snapshot = db.snapshot();
                let versions = cf(db, CF_VERSIONS)?;
                let records = cf(db, CF_DEPLOYMENTS)?;
                let head = key.head_key();

                let mut out = Vec::new();
                let from = key.version_key(0);
                let mode = IteratorMode::From(from.as_slice(), Direction::Forward);
                for item in snapshot.iterator_cf(versions, mode) {
                    let (raw, id) = item?;
                    match split_version_key(&raw) {
                        Some((prefix, _)) if prefix == head.as_slice() => {}
                        _ => break,
                    }
                    let bytes = snapshot.get_cf(records, &id)?.ok_or_else(|| {
                        Error::Internal(format!("version index points at missing record for {}", key))
                    })?;
                    out.push(DeploymentRecord::decode(&bytes)?);
                }
                Ok(out)
            })
            .await
    }

    /// Set the status of a record. `deployed` also stamps `deployed_at`.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: DeploymentStatus,
    ) -> Result<DeploymentRecord> {
        let max_attempts = self.max_attempts;
        let record = self
            .pool
            .run("update_status", self.deadline(), move |db, deadline| {
                for attempt in 1..=max_attempts {
                    ensure_before(deadline, "update_status")?;
                    match try_update_status(db, id, status, deadline) {
                        Err(Error::KeyConflict(_)) => {
                            METRICS.version_conflicts.inc();
                            debug!(%id, attempt, "status update conflict, retrying");
                        }
                        other => return other,
                    }
                }
                Err(Error::KeyConflict(format!(
                    "deployment {} after {} attempts",
                    id, max_attempts
                )))
            })
            .await?;

        METRICS.status_updates.inc();
        Ok(record)
    }

    /// Counts over the latest record of every key.
    pub async fn stats(&self) -> Result<DeploymentStats> {
        self.pool
            .run("stats", self.deadline(), |db, _| {
                let latest = latest_records(db)?;
                Ok(DeploymentStats::from_latest(&latest))
            })
            .await
    }
}

fn decode_version(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Internal(format!("corrupt head entry ({} bytes)", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// One allocation attempt. Dropping `txn` on any early return rolls it back.
fn try_create(
    db: &Db,
    new: &NewDeployment,
    key: &DeploymentKey,
    request_id: &str,
    deadline: Instant,
    write_delay: Duration,
) -> Result<DeploymentRecord> {
    let heads = cf(db, CF_HEADS)?;
    let versions = cf(db, CF_VERSIONS)?;
    let records = cf(db, CF_DEPLOYMENTS)?;

    let head_key = key.head_key();
    let txn = db.transaction();

    let current = match txn.get_for_update_cf(heads, &head_key, true)? {
        Some(bytes) => decode_version(&bytes)?,
        None => 0,
    };
    let version = current + 1;

    let version_key = key.version_key(version);
    if txn.get_for_update_cf(versions, &version_key, true)?.is_some() {
        return Err(Error::KeyConflict(format!("{} v{}", key, version)));
    }

    let now = Utc::now();
    let record = DeploymentRecord {
        id: Uuid::new_v4(),
        request_id: request_id.to_string(),
        domain: new.domain.clone(),
        app_name: new.app_name.clone(),
        docker_image: new.docker_image.clone(),
        port: new.port,
        env: new.env.clone(),
        version,
        updated_at: new.updated_at.unwrap_or(now),
        deployed_at: None,
        status: DeploymentStatus::Pending,
        created_at: now,
    };

    txn.put_cf(records, record.id.as_bytes(), record.encode()?)?;
    txn.put_cf(versions, &version_key, record.id.as_bytes())?;
    txn.put_cf(heads, &head_key, version.to_be_bytes())?;

    if !write_delay.is_zero() {
        std::thread::sleep(write_delay);
    }

    if let Err(e) = ensure_before(deadline, "create") {
        txn.rollback()?;
        return Err(e);
    }

    txn.commit()
        .map_err(|e| commit_error(e, &key.to_string()))?;

    debug!(key = %key, version, id = %record.id, "deployment version committed");
    Ok(record)
}

fn try_update_status(
    db: &Db,
    id: Uuid,
    status: DeploymentStatus,
    deadline: Instant,
) -> Result<DeploymentRecord> {
    let records = cf(db, CF_DEPLOYMENTS)?;
    let txn = db.transaction();

    let mut record = match txn.get_for_update_cf(records, id.as_bytes(), true)? {
        Some(bytes) => DeploymentRecord::decode(&bytes)?,
        None => return Err(Error::NotFound(format!("deployment {}", id))),
    };
    record.apply_status(status, Utc::now());
    txn.put_cf(records, id.as_bytes(), record.encode()?)?;

    if let Err(e) = ensure_before(deadline, "update_status") {
        txn.rollback()?;
        return Err(e);
    }
    txn.commit()
        .map_err(|e| commit_error(e, &format!("deployment {}", id)))?;
    Ok(record)
}

/// Derive the latest-per-key view from one snapshot of the version index.
///
/// Versions of a key are contiguous and ascending in `versions`, so the last
/// entry of each run is that key's latest record.
fn latest_records(db: &Db) -> Result<Vec<DeploymentRecord>> {
    let snapshot = db.snapshot();
    let versions = cf(db, CF_VERSIONS)?;
    let records = cf(db, CF_DEPLOYMENTS)?;

    let mut latest_ids: Vec<Box<[u8]>> = Vec::new();
    let mut current: Option<(Vec<u8>, Box<[u8]>)> = None;

    for item in snapshot.iterator_cf(versions, IteratorMode::Start) {
        let (raw, id) = item?;
        let (prefix, _) = split_version_key(&raw)
            .ok_or_else(|| Error::Internal("malformed version index entry".into()))?;

        let same_key = matches!(&current, Some((p, _)) if p.as_slice() == prefix);
        if same_key {
            if let Some((_, latest)) = current.as_mut() {
                *latest = id;
            }
        } else if let Some((_, done)) = current.replace((prefix.to_vec(), id)) {
            latest_ids.push(done);
        }
    }
    if let Some((_, done)) = current {
        latest_ids.push(done);
    }

    let mut out = Vec::with_capacity(latest_ids.len());
    for id in latest_ids {
        let bytes = snapshot
            .get_cf(records, &id)?
            .ok_or_else(|| Error::Internal("version index points at missing record".into()))?;
        out.push(DeploymentRecord::decode(&bytes)?);
    }

    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> Store {
        Store::open(&StoreConfig::with_path(dir.path().join("db"))).unwrap()
    }

    fn app(domain: &str, app: &str) -> NewDeployment {
        NewDeployment::new(domain, app, format!("registry.example.com/{}:latest", app), 8080)
    }

    #[tokio::test]
    async fn test_versions_increase_per_key() {
        let dir = tempdir().unwrap();
        let store = open(&dir).records;

        let v1 = store.create(app("example.com", "api"), "req-1").await.unwrap();
        let v2 = store.create(app("example.com", "api"), "req-2").await.unwrap();
        let other = store.create(app("example.com", "web"), "req-2").await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);
        assert_ne!(v1.id, v2.id);
        assert_eq!(v2.status, DeploymentStatus::Pending);
        assert_eq!(v2.request_id, "req-2");
    }

    #[tokio::test]
    async fn test_updated_at_defaults_to_creation_time() {
        let dir = tempdir().unwrap();
        let store = open(&dir).records;

        let rec = store.create(app("example.com", "api"), "r").await.unwrap();
        assert_eq!(rec.updated_at, rec.created_at);

        let supplied = chrono::DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let rec = store
            .create(app("example.com", "api").with_updated_at(supplied), "r")
            .await
            .unwrap();
        assert_eq!(rec.updated_at, supplied);
        assert_eq!(rec.version, 2);
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        let dir = tempdir().unwrap();
        let store = open(&dir).records;

        let mut bad = app("example.com", "api");
        bad.docker_image.clear();
        assert!(matches!(
            store.create(bad, "r").await,
            Err(Error::Validation(_))
        ));

        let rec = store.create(app("example.com", "api"), "r").await.unwrap();
        assert_eq!(rec.version, 1);
    }

    #[tokio::test]
    async fn test_get_by_id_round_trip() {
        let dir = tempdir().unwrap();
        let store = open(&dir).records;

        let created = store
            .create(
                app("example.com", "api").with_env(vec!["Z=1".into(), "A=2".into()]),
                "r",
            )
            .await
            .unwrap();
        let fetched = store.get_by_id(created.id).await.unwrap();
        assert_eq!(fetched, created);

        let missing = store.get_by_id(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_history_is_scoped_to_key() {
        let dir = tempdir().unwrap();
        let store = open(&dir).records;

        for _ in 0..3 {
            store.create(app("example.com", "api"), "r").await.unwrap();
        }
        store.create(app("example.com", "api-v2"), "r").await.unwrap();

        let history = store
            .history(DeploymentKey::new("example.com", "api"))
            .await
            .unwrap();
        let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    /// Writers that skip the key gate (as a second controller process
    /// would) collide on commit, roll back and recompute their version.
    #[test]
    fn test_conflicting_commits_retry_without_gaps() {
        use crate::store::open_db;
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Barrier;

        let dir = tempdir().unwrap();
        let db = Arc::new(open_db(dir.path().join("db")).unwrap());
        let key = DeploymentKey::new("example.com", "api");
        let writers = 6;
        let barrier = Arc::new(Barrier::new(writers));
        let conflicts = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let (db, key, barrier, conflicts) =
                    (db.clone(), key.clone(), barrier.clone(), conflicts.clone());
                std::thread::spawn(move || {
                    let new = app("example.com", "api");
                    let deadline = Instant::now() + Duration::from_secs(30);
                    barrier.wait();
                    loop {
                        match try_create(
                            &db,
                            &new,
                            &key,
                            &format!("writer-{}", i),
                            deadline,
                            Duration::from_millis(40),
                        ) {
                            Err(Error::KeyConflict(_)) => {
                                conflicts.fetch_add(1, Ordering::Relaxed);
                            }
                            other => return other.unwrap().version,
                        }
                    }
                })
            })
            .collect();

        let mut versions: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        versions.sort_unstable();
        assert_eq!(versions, (1..=writers as u64).collect::<Vec<_>>());
        assert!(conflicts.load(Ordering::Relaxed) > 0);

        // head and version index agree: no slot was consumed by a loser
        let heads = cf(&db, CF_HEADS).unwrap();
        let head = db.get_cf(heads, key.head_key()).unwrap().unwrap();
        assert_eq!(decode_version(&head).unwrap(), writers as u64);

        let index = cf(&db, CF_VERSIONS).unwrap();
        let indexed: Vec<u64> = db
            .iterator_cf(index, IteratorMode::Start)
            .map(|item| split_version_key(&item.unwrap().0).unwrap().1)
            .collect();
        assert_eq!(indexed, (1..=writers as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let dir = tempdir().unwrap();
        {
            let store = open(&dir).records;
            store.create(app("example.com", "api"), "r").await.unwrap();
            store.create(app("example.com", "api"), "r").await.unwrap();
        }
        let store = open(&dir).records;
        let rec = store.create(app("example.com", "api"), "r").await.unwrap();
        assert_eq!(rec.version, 3);
    }
}
