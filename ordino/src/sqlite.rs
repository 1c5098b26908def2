//! SQLite backend, built on the [`rusqlite`](https://crates.io/crates/rusqlite) crate.
//!
//! SQLite supports transactional DDL, so a failed migration rolls back
//! completely. SQLite has no server-side advisory lock; cross-process
//! exclusion uses a row in the lock table written with `INSERT OR ABORT`,
//! polled until the configured timeout. SQLite is single-writer, so the
//! row write itself is race-free.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::backend::{Backend, DbHandle};
use crate::error::Error;
use crate::uri::DatabaseUri;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct SqliteBackend {
    conn: Connection,
    migration_table: String,
    in_transaction: bool,
    lock_held: bool,
}

impl SqliteBackend {
    /// Open the database named by `uri`. Three-slash URIs are relative
    /// paths, four-slash absolute; `sqlite:///:memory:` opens an in-memory
    /// database.
    pub fn connect(uri: &DatabaseUri, migration_table: &str) -> Result<Self, Error> {
        let conn = Connection::open(&uri.database)?;
        Ok(Self::from_connection(conn, migration_table))
    }

    /// Wrap an existing connection. Useful for embedding and tests.
    pub fn from_connection(conn: Connection, migration_table: &str) -> Self {
        SqliteBackend {
            conn,
            migration_table: migration_table.to_string(),
            in_transaction: false,
            lock_held: false,
        }
    }

    /// Consume the backend, returning the underlying connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    fn try_insert_lock_row(&mut self) -> Result<bool, Error> {
        let result = self.conn.execute(
            &format!(
                "INSERT OR ABORT INTO {} (locked, ctime, pid) VALUES (1, ?1, ?2)",
                self.lock_table()
            ),
            rusqlite::params![Utc::now().to_rfc3339(), std::process::id() as i64],
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock_holder_pid(&mut self) -> Option<i64> {
        self.conn
            .query_row(
                &format!("SELECT pid FROM {} WHERE locked = 1", self.lock_table()),
                [],
                |row| row.get(0),
            )
            .ok()
    }
}

impl Backend for SqliteBackend {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn connection(&mut self) -> DbHandle<'_> {
        DbHandle::Sqlite(&mut self.conn)
    }

    fn migration_table(&self) -> &str {
        &self.migration_table
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn ensure_internal_tables(&mut self) -> Result<(), Error> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL PRIMARY KEY,
                ctime TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {} (
                locked INTEGER NOT NULL PRIMARY KEY,
                ctime TEXT NOT NULL,
                pid INTEGER NOT NULL
            );",
            self.migration_table,
            self.lock_table()
        ))?;
        Ok(())
    }

    fn list_applied(&mut self) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} ORDER BY ctime",
            self.migration_table
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn is_applied(&mut self, id: &str) -> Result<bool, Error> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(1) FROM {} WHERE id = ?1", self.migration_table),
            rusqlite::params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record_applied(&mut self, id: &str, ctime: DateTime<Utc>) -> Result<(), Error> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (id, ctime) VALUES (?1, ?2)",
                self.migration_table
            ),
            rusqlite::params![id, ctime.to_rfc3339()],
        )?;
        Ok(())
    }

    fn unrecord_applied(&mut self, id: &str) -> Result<(), Error> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.migration_table),
            rusqlite::params![id],
        )?;
        Ok(())
    }

    fn lock(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.lock_held {
            return Ok(());
        }
        let started = Instant::now();
        loop {
            if self.try_insert_lock_row()? {
                self.lock_held = true;
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    let holder = self
                        .lock_holder_pid()
                        .map(|pid| format!(" (held by pid {})", pid))
                        .unwrap_or_default();
                    return Err(Error::LockTimeout(format!(
                        "timed out waiting for {}{}",
                        self.lock_table(),
                        holder
                    )));
                }
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if !self.lock_held {
            return Ok(());
        }
        self.conn.execute(
            &format!("DELETE FROM {} WHERE pid = ?1", self.lock_table()),
            rusqlite::params![std::process::id() as i64],
        )?;
        self.lock_held = false;
        Ok(())
    }
}
