//! Bounded connection pool for read traffic.
//!
//! Write traffic never touches the pool; the store owns one dedicated
//! writer connection. Readers check connections out and the pool keeps at
//! most `max_connections` open in total: a checkout beyond the cap fails
//! fast instead of queueing. Idle connections above `min_idle` that have
//! sat unused for longer than `idle_timeout` are closed during checkout
//! and checkin sweeps, so the pool shrinks back without a timer task.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::CatalogError;

/// Connections retained through idle sweeps.
const DEFAULT_MIN_IDLE: usize = 2;

/// Hard cap on open read connections.
const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// Idle age after which surplus connections are closed.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolInner {
    idle: Vec<IdleConnection>,
    open: usize,
}

/// A bounded pool of read-only SQLite connections.
pub struct Pool {
    path: PathBuf,
    inner: Mutex<PoolInner>,
    min_idle: usize,
    max_connections: usize,
    idle_timeout: Duration,
}

impl Pool {
    /// Creates a pool over the database at `path` with default bounds.
    pub fn new(path: &Path) -> Self {
        Self::with_limits(
            path,
            DEFAULT_MIN_IDLE,
            DEFAULT_MAX_CONNECTIONS,
            DEFAULT_IDLE_TIMEOUT,
        )
    }

    /// Creates a pool with explicit bounds; used by tests.
    pub fn with_limits(
        path: &Path,
        min_idle: usize,
        max_connections: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                open: 0,
            }),
            min_idle,
            max_connections,
            idle_timeout,
        }
    }

    /// Checks a connection out, opening a new one below the cap.
    ///
    /// Fails fast with [`CatalogError::PoolExhausted`] once
    /// `max_connections` connections are checked out.
    pub fn acquire(&self) -> Result<PooledConnection<'_>, CatalogError> {
        let mut inner = self.inner.lock().expect("catalog pool lock poisoned");
        Self::sweep(&mut inner, self.min_idle, self.idle_timeout);

        if let Some(idle) = inner.idle.pop() {
            return Ok(PooledConnection {
                pool: self,
                conn: Some(idle.conn),
            });
        }

        if inner.open >= self.max_connections {
            return Err(CatalogError::PoolExhausted);
        }
        inner.open += 1;
        drop(inner);

        match Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .and_then(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(conn)
        }) {
            Ok(conn) => Ok(PooledConnection {
                pool: self,
                conn: Some(conn),
            }),
            Err(error) => {
                let mut inner = self.inner.lock().expect("catalog pool lock poisoned");
                inner.open -= 1;
                Err(error.into())
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut inner = self.inner.lock().expect("catalog pool lock poisoned");
        inner.idle.push(IdleConnection {
            conn,
            since: Instant::now(),
        });
        Self::sweep(&mut inner, self.min_idle, self.idle_timeout);
    }

    /// Closes idle connections above the retained minimum that have aged
    /// past the idle timeout.
    fn sweep(inner: &mut PoolInner, min_idle: usize, idle_timeout: Duration) {
        let now = Instant::now();
        while inner.idle.len() > min_idle {
            let expired = inner
                .idle
                .first()
                .is_some_and(|idle| now.duration_since(idle.since) >= idle_timeout);
            if !expired {
                break;
            }
            let idle = inner.idle.remove(0);
            drop(idle.conn);
            inner.open -= 1;
            debug!(open = inner.open, "closed idle catalog connection");
        }
    }

    #[cfg(test)]
    fn open_connections(&self) -> usize {
        self.inner.lock().expect("catalog pool lock poisoned").open
    }
}

/// A checked-out connection; returns itself to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a Pool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_at(dir: &tempfile::TempDir, min: usize, max: usize, idle: Duration) -> Pool {
        let path = dir.path().join("catalog.db");
        // The pool opens read-write without create; make the file first.
        Connection::open(&path).expect("create database");
        Pool::with_limits(&path, min, max, idle)
    }

    #[test]
    fn acquire_beyond_cap_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_at(&dir, 1, 2, Duration::from_secs(600));
        let first = pool.acquire().expect("first");
        let second = pool.acquire().expect("second");
        assert!(matches!(pool.acquire(), Err(CatalogError::PoolExhausted)));
        drop(first);
        drop(second);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn idle_connections_above_minimum_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_at(&dir, 1, 4, Duration::from_millis(0));
        {
            let a = pool.acquire().expect("a");
            let b = pool.acquire().expect("b");
            let c = pool.acquire().expect("c");
            drop(a);
            drop(b);
            drop(c);
        }
        // Zero idle timeout: everything above the minimum is closed on the
        // next sweep.
        let _conn = pool.acquire().expect("reacquire");
        assert!(pool.open_connections() <= 2);
    }
}
