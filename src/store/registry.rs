//! Registry credential store
//!
//! Keyed by registry id with plain upsert semantics; no history is kept.

use crate::common::{Error, Result, StoreConfig};
use crate::store::pool::{ensure_before, StorePool};
use crate::store::{cf, commit_error, Db, CF_REGISTRY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: StorePool,
    op_timeout: Duration,
    max_attempts: u32,
}

impl CredentialStore {
    pub fn new(pool: StorePool, config: &StoreConfig) -> Self {
        Self {
            pool,
            op_timeout: config.op_timeout(),
            max_attempts: config.max_conflict_retries,
        }
    }

    /// Insert or replace the credential for `registry`. The original
    /// `created_at` survives a replace.
    pub async fn store(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<RegistryCredential> {
        for (field, value) in [
            ("registry", registry),
            ("username", username),
            ("password", password),
        ] {
            if value.is_empty() {
                return Err(Error::Validation(format!("{} is required", field)));
            }
        }

        let registry = registry.to_string();
        let username = username.to_string();
        let password = password.to_string();
        let max_attempts = self.max_attempts;

        self.pool
            .run("store_credential", self.deadline(), move |db, deadline| {
                for _ in 0..max_attempts {
                    ensure_before(deadline, "store_credential")?;
                    match try_upsert(db, &registry, &username, &password, deadline) {
                        Err(Error::KeyConflict(_)) => continue,
                        other => return other,
                    }
                }
                Err(Error::KeyConflict(format!("registry {}", registry)))
            })
            .await
    }

    pub async fn get(&self, registry: &str) -> Result<RegistryCredential> {
        let registry = registry.to_string();
        self.pool
            .run("get_credential", self.deadline(), move |db, _| {
                match db.get_cf(cf(db, CF_REGISTRY)?, registry.as_bytes())? {
                    Some(bytes) => Ok(bincode::deserialize(&bytes)?),
                    None => Err(Error::NotFound(format!("registry credential {}", registry))),
                }
            })
            .await
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.op_timeout
    }
}

fn try_upsert(
    db: &Db,
    registry: &str,
    username: &str,
    password: &str,
    deadline: Instant,
) -> Result<RegistryCredential> {
    let creds = cf(db, CF_REGISTRY)?;
    let txn = db.transaction();

    let now = Utc::now();
    let created_at = match txn.get_for_update_cf(creds, registry.as_bytes(), true)? {
        Some(bytes) => bincode::deserialize::<RegistryCredential>(&bytes)?.created_at,
        None => now,
    };

    let cred = RegistryCredential {
        registry: registry.to_string(),
        username: username.to_string(),
        password: password.to_string(),
        updated_at: now,
        created_at,
    };
    txn.put_cf(creds, registry.as_bytes(), bincode::serialize(&cred)?)?;

    if let Err(e) = ensure_before(deadline, "store_credential") {
        txn.rollback()?;
        return Err(e);
    }
    txn.commit()
        .map_err(|e| commit_error(e, &format!("registry {}", registry)))?;

    tracing::debug!(registry, "registry credential stored");
    Ok(cred)
}
