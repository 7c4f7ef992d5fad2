//! Bounded access to the RocksDB handle
//!
//! RocksDB calls block, so every store operation runs on tokio's blocking
//! pool behind a semaphore. The semaphore plays the role of a connection
//! pool: at most `max_conns` operations touch the database at once, and a
//! caller that cannot get a slot within `acquire_timeout` gets
//! [`Error::StoreUnavailable`] instead of queueing forever.

use crate::common::{Error, Result, StoreConfig, METRICS};
use crate::store::Db;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct StorePool {
    db: Arc<Db>,
    permits: Arc<Semaphore>,
    max_conns: usize,
    acquire_timeout: Duration,
}

impl StorePool {
    pub fn new(db: Db, config: &StoreConfig) -> Self {
        Self {
            db: Arc::new(db),
            permits: Arc::new(Semaphore::new(config.max_conns)),
            max_conns: config.max_conns,
            acquire_timeout: config.acquire_timeout(),
        }
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns
    }

    /// Run `f` against the database on the blocking pool.
    ///
    /// `f` receives the deadline and must check it (see [`ensure_before`])
    /// before committing anything. The returned future always waits for `f`
    /// to finish, so an `Err(Timeout)` from `f` is the only way a deadline is
    /// reported once the closure has started.
    pub async fn run<T, F>(&self, op: &'static str, deadline: Instant, f: F) -> Result<T>
    where
        F: FnOnce(&Db, Instant) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let wait = remaining.min(self.acquire_timeout);

        let permit = match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::StoreUnavailable("store is closed".into())),
            Err(_) if wait < self.acquire_timeout => {
                METRICS.store_timeouts.inc();
                return Err(Error::Timeout(format!("{}: deadline passed waiting for store", op)));
            }
            Err(_) => {
                tracing::warn!(op, max_conns = self.max_conns, "store pool exhausted");
                return Err(Error::StoreUnavailable(format!(
                    "{}: no store slot within {}ms",
                    op,
                    self.acquire_timeout.as_millis()
                )));
            }
        };

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&db, deadline)
        })
        .await?
    }
}

/// Fail with [`Error::Timeout`] if `deadline` has passed.
pub(crate) fn ensure_before(deadline: Instant, what: &str) -> Result<()> {
    if Instant::now() >= deadline {
        METRICS.store_timeouts.inc();
        return Err(Error::Timeout(format!("{}: deadline exceeded", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_db;
    use tempfile::tempdir;

    fn pool(max_conns: usize, acquire_timeout_ms: u64) -> (tempfile::TempDir, StorePool) {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::with_path(dir.path().join("db"));
        config.max_conns = max_conns;
        config.acquire_timeout_ms = acquire_timeout_ms;
        let db = open_db(&config.db_path).unwrap();
        (dir, StorePool::new(db, &config))
    }

    #[tokio::test]
    async fn test_run_returns_closure_result() {
        let (_dir, pool) = pool(2, 1_000);
        let deadline = Instant::now() + Duration::from_secs(5);
        let out = pool.run("noop", deadline, |_db, _| Ok(7u32)).await.unwrap();
        assert_eq!(out, 7);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_unavailable() {
        let (_dir, pool) = pool(1, 50);
        let deadline = Instant::now() + Duration::from_secs(5);

        let busy = pool.clone();
        let holder = tokio::spawn(async move {
            busy.run("hold", deadline, |_db, _| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool.run("second", deadline, |_db, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)), "got {:?}", err);

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_expired_deadline_is_timeout() {
        let (_dir, pool) = pool(1, 5_000);
        let deadline = Instant::now() + Duration::from_secs(5);

        let busy = pool.clone();
        let holder = tokio::spawn(async move {
            busy.run("hold", deadline, |_db, _| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let short = Instant::now() + Duration::from_millis(50);
        let err = pool.run("second", short, |_db, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);

        holder.await.unwrap().unwrap();
    }

    #[test]
    fn test_ensure_before() {
        assert!(ensure_before(Instant::now() + Duration::from_secs(1), "op").is_ok());
        assert!(matches!(
            ensure_before(Instant::now(), "op"),
            Err(Error::Timeout(_))
        ));
    }
}
