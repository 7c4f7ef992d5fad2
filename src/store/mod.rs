//! Persistent stores backed by one RocksDB instance
//!
//! Column families:
//! - `deployments`: record id -> [`DeploymentRecord`]
//! - `versions`: `domain \0 app_name \0 version` -> record id. Enforces the
//!   (domain, app_name, version) uniqueness constraint; the latest-per-key
//!   view is derived from it.
//! - `heads`: `domain \0 app_name` -> highest committed version. Every create
//!   reads it for update, which is what makes two writers on one key collide.
//! - `registry`: registry id -> [`RegistryCredential`]

mod locks;
pub mod pool;
pub mod record;
pub mod registry;
pub mod versioned;

pub use pool::StorePool;
pub use record::{
    DeploymentKey, DeploymentRecord, DeploymentRequest, DeploymentStats, DeploymentStatus,
    NewDeployment,
};
pub use registry::{CredentialStore, RegistryCredential};
pub use versioned::RecordStore;

use crate::common::{Error, Result, StoreConfig};
use rocksdb::{ColumnFamily, OptimisticTransactionDB, Options};
use std::path::Path;

pub(crate) const CF_DEPLOYMENTS: &str = "deployments";
pub(crate) const CF_VERSIONS: &str = "versions";
pub(crate) const CF_HEADS: &str = "heads";
pub(crate) const CF_REGISTRY: &str = "registry";

/// Database handle shared by all stores
pub type Db = OptimisticTransactionDB;

/// Open or create the database with every column family.
pub fn open_db(path: impl AsRef<Path>) -> Result<Db> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let db = Db::open_cf(
        &opts,
        path,
        [CF_DEPLOYMENTS, CF_VERSIONS, CF_HEADS, CF_REGISTRY],
    )?;
    Ok(db)
}

pub(crate) fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
}

/// Map a commit failure: a busy/try-again status means another writer touched
/// a key this transaction read for update.
pub(crate) fn commit_error(e: rocksdb::Error, what: &str) -> Error {
    match e.kind() {
        rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain => {
            Error::KeyConflict(what.to_string())
        }
        _ => Error::RocksDb(e),
    }
}

/// Record store and credential store sharing one pool
#[derive(Clone)]
pub struct Store {
    pub records: RecordStore,
    pub credentials: CredentialStore,
    pool: StorePool,
}

impl Store {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let db = open_db(&config.db_path)?;
        let pool = StorePool::new(db, config);

        tracing::info!(
            path = %config.db_path.display(),
            max_conns = config.max_conns,
            "record store opened"
        );

        Ok(Self {
            records: RecordStore::new(pool.clone(), config),
            credentials: CredentialStore::new(pool.clone(), config),
            pool,
        })
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    /// Liveness check: the pool hands out a slot and the database answers a
    /// read within `timeout`.
    pub async fn ping(&self, timeout: std::time::Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        self.pool
            .run("ping", deadline, |db, _| {
                db.get_cf(cf(db, CF_HEADS)?, b"")?;
                Ok(())
            })
            .await
    }
}
