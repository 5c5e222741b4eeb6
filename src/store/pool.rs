use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;

/// How long a handle may sit idle before the sweeper closes it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Sweeper tick interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded pool of SQLite handles over one database file. `acquire` serves
/// from the idle list, then opens a new handle under the cap, then parks on
/// a notifier until a release wakes it. Every released handle is stamped so
/// the background sweeper can close the ones idle past 60s.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    path: Option<PathBuf>,
    state: Mutex<PoolState>,
    notify: Notify,
    max: usize,
    shutting_down: AtomicBool,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<IdleConn>,
    total: usize,
}

#[derive(Debug)]
struct IdleConn {
    conn: Connection,
    last_used: Instant,
}

/// RAII guard holding one handle for a single logical unit of work.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// File-backed pool with the given handle cap (default is 3).
    pub fn open(path: impl Into<PathBuf>, max: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let pool = Self {
            inner: Arc::new(PoolInner {
                path: Some(path),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                }),
                notify: Notify::new(),
                max: max.max(1),
                shutting_down: AtomicBool::new(false),
            }),
        };
        // Open one handle eagerly so path errors surface at construction.
        let probe = pool.inner.open_conn()?;
        pool.inner.give_back(probe);
        Ok(pool)
    }

    /// Single-handle in-memory pool. Each in-memory connection is its own
    /// database, so the cap is pinned to 1.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::Db)?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                path: None,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    total: 0,
                }),
                notify: Notify::new(),
                max: 1,
                shutting_down: AtomicBool::new(false),
            }),
        };
        pool.inner.give_back(conn);
        Ok(pool)
    }

    /// Borrow a handle. Waits when the cap is reached; fails only when the
    /// pool is shutting down and nothing will ever be released.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        loop {
            let open_new = {
                let mut state = self.inner.state.lock().expect("pool lock");
                if let Some(idle) = state.idle.pop() {
                    return Ok(PooledConnection {
                        conn: Some(idle.conn),
                        inner: self.inner.clone(),
                    });
                }
                if state.total < self.inner.max {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if open_new {
                match self.inner.open_conn_counted() {
                    Ok(conn) => {
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            inner: self.inner.clone(),
                        })
                    }
                    Err(e) => return Err(e),
                }
            }

            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(StoreError::PoolExhausted);
            }
            self.inner.notify.notified().await;
        }
    }

    /// Close handles idle longer than `IDLE_TIMEOUT`. In-memory pools are
    /// exempt: their single handle IS the database.
    pub fn sweep_idle(&self) -> usize {
        if self.inner.path.is_none() {
            return 0;
        }
        let mut state = self.inner.state.lock().expect("pool lock");
        let before = state.idle.len();
        let now = Instant::now();
        state
            .idle
            .retain(|idle| now.duration_since(idle.last_used) < IDLE_TIMEOUT);
        let closed = before - state.idle.len();
        state.total -= closed;
        if closed > 0 {
            debug!(closed, "closed idle database handles");
        }
        closed
    }

    /// Spawn the background idle sweeper. Ticks every 60s until cancelled.
    pub fn spawn_idle_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                        pool.sweep_idle();
                    }
                }
            }
        })
    }

    /// Stop serving new waiters. In-flight guards still return normally.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock").idle.len()
    }
}

impl PoolInner {
    fn open_conn(&self) -> Result<Connection, StoreError> {
        let conn = match &self.path {
            Some(path) => Connection::open(path).map_err(StoreError::Db)?,
            None => Connection::open_in_memory().map_err(StoreError::Db)?,
        };
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::Db)?;
        Ok(conn)
    }

    /// Open under an already-taken slot; roll the count back on failure.
    fn open_conn_counted(&self) -> Result<Connection, StoreError> {
        match self.open_conn() {
            Ok(conn) => Ok(conn),
            Err(e) => {
                let mut state = self.state.lock().expect("pool lock");
                state.total -= 1;
                warn!(error = %e, "failed to open pooled connection");
                Err(e)
            }
        }
    }

    fn give_back(&self, conn: Connection) {
        let mut state = self.state.lock().expect("pool lock");
        if state.total < state.idle.len() + 1 {
            state.total = state.idle.len() + 1;
        }
        state.idle.push(IdleConn {
            conn,
            last_used: Instant::now(),
        });
        drop(state);
        self.notify.notify_one();
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.inner.state.lock().expect("pool lock");
            state.idle.push(IdleConn {
                conn,
                last_used: Instant::now(),
            });
            drop(state);
            self.inner.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_cycles() {
        let pool = ConnectionPool::in_memory().unwrap();
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let conn = pool.acquire().await.unwrap();
        conn.execute("INSERT INTO t (x) VALUES (1)", []).unwrap();
    }

    #[tokio::test]
    async fn waiter_woken_by_release() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 1).unwrap();

        let held = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let _conn = pool2.acquire().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap();
    }

    #[tokio::test]
    async fn cap_respected_under_contention() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 2).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        {
            let state = pool.inner.state.lock().unwrap();
            assert_eq!(state.total, 2);
        }
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_fails_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(dir.path().join("test.db"), 1).unwrap();
        let _held = pool.acquire().await.unwrap();
        pool.shutdown();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted));
    }
}
