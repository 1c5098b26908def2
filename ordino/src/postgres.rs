//! PostgreSQL backend, built on the [`postgres`](https://crates.io/crates/postgres) crate.
//!
//! PostgreSQL fully supports transactional DDL: a failed migration rolls
//! back completely, including CREATE/ALTER/DROP TABLE. (CREATE DATABASE and
//! CREATE TABLESPACE remain exceptions; avoid them in migrations.)
//!
//! Cross-process exclusion uses a session-level advisory lock,
//! `pg_advisory_lock`, keyed on a stable 64-bit hash of the lock table
//! name so that every migrator pointed at the same table contends on the
//! same key.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};
use sha2::{Digest, Sha256};

use crate::backend::{Backend, DbHandle};
use crate::error::Error;
use crate::uri::DatabaseUri;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct PostgresBackend {
    client: Client,
    migration_table: String,
    in_transaction: bool,
    lock_held: bool,
}

impl PostgresBackend {
    pub fn connect(uri: &DatabaseUri, migration_table: &str) -> Result<Self, Error> {
        let mut config = postgres::Config::new();
        if let Some(user) = &uri.username {
            config.user(user);
        }
        if let Some(password) = &uri.password {
            config.password(password);
        }
        if let Some(host) = &uri.hostname {
            config.host(host);
        }
        if let Some(port) = uri.port {
            config.port(port);
        }
        if !uri.database.is_empty() {
            config.dbname(&uri.database);
        }
        let client = config.connect(NoTls)?;
        Ok(Self::from_client(client, migration_table))
    }

    /// Wrap an existing client. Useful for embedding and tests.
    pub fn from_client(client: Client, migration_table: &str) -> Self {
        PostgresBackend {
            client,
            migration_table: migration_table.to_string(),
            in_transaction: false,
            lock_held: false,
        }
    }

    /// The advisory lock key: the first eight bytes of the SHA-256 digest
    /// of the lock table name, as a signed 64-bit integer.
    fn lock_key(&self) -> i64 {
        let digest = Sha256::digest(self.lock_table().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

impl Backend for PostgresBackend {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql)?;
        Ok(())
    }

    fn connection(&mut self) -> DbHandle<'_> {
        DbHandle::Postgres(&mut self.client)
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
        self.client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL PRIMARY KEY,
                ctime TIMESTAMPTZ NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {} (
                locked INTEGER NOT NULL PRIMARY KEY,
                ctime TIMESTAMPTZ NOT NULL,
                pid INTEGER NOT NULL
            );",
            self.migration_table,
            self.lock_table()
        ))?;
        Ok(())
    }

    fn list_applied(&mut self) -> Result<Vec<String>, Error> {
        let rows = self.client.query(
            &format!("SELECT id FROM {} ORDER BY ctime", self.migration_table),
            &[],
        )?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    fn is_applied(&mut self, id: &str) -> Result<bool, Error> {
        let row = self.client.query_one(
            &format!("SELECT COUNT(1) FROM {} WHERE id = $1", self.migration_table),
            &[&id],
        )?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    fn record_applied(&mut self, id: &str, ctime: DateTime<Utc>) -> Result<(), Error> {
        self.client.execute(
            &format!(
                "INSERT INTO {} (id, ctime) VALUES ($1, $2)",
                self.migration_table
            ),
            &[&id, &ctime],
        )?;
        Ok(())
    }

    fn unrecord_applied(&mut self, id: &str) -> Result<(), Error> {
        self.client.execute(
            &format!("DELETE FROM {} WHERE id = $1", self.migration_table),
            &[&id],
        )?;
        Ok(())
    }

    fn lock(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.lock_held {
            return Ok(());
        }
        let key = self.lock_key();
        match timeout {
            None => {
                // Session-level lock; blocks until granted.
                self.client
                    .execute("SELECT pg_advisory_lock($1)", &[&key])?;
                self.lock_held = true;
                Ok(())
            }
            Some(timeout) => {
                let started = Instant::now();
                loop {
                    let row = self
                        .client
                        .query_one("SELECT pg_try_advisory_lock($1)", &[&key])?;
                    let acquired: bool = row.get(0);
                    if acquired {
                        self.lock_held = true;
                        return Ok(());
                    }
                    if started.elapsed() >= timeout {
                        return Err(Error::LockTimeout(format!(
                            "timed out waiting for advisory lock {}",
                            key
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
            }
        }
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if !self.lock_held {
            return Ok(());
        }
        let key = self.lock_key();
        self.client
            .execute("SELECT pg_advisory_unlock($1)", &[&key])?;
        self.lock_held = false;
        Ok(())
    }
}
