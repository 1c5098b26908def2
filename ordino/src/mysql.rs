//! MySQL backend, built on the [`mysql`](https://crates.io/crates/mysql) crate.
//!
//! MySQL DDL statements (CREATE TABLE, ALTER TABLE, …) cause an implicit
//! commit and cannot be rolled back. The executor still runs the two-level
//! transaction protocol here, but a migration whose steps are DDL cannot be
//! promised rollback: on failure the engine reverses the steps that already
//! ran inasmuch as possible and reports which ones had completed.
//!
//! Cross-process exclusion uses `GET_LOCK`; a negative timeout waits
//! forever. Connections are opened with `CLIENT_MULTI_STATEMENTS` so a
//! migration file can hold a statement batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};

use crate::backend::{Backend, DbHandle};
use crate::error::Error;
use crate::uri::DatabaseUri;

pub struct MysqlBackend {
    conn: Conn,
    migration_table: String,
    in_transaction: bool,
    lock_held: bool,
}

impl MysqlBackend {
    /// Connect using a parsed URI. The `unix_socket` query argument selects
    /// a socket connection; host/port are used otherwise.
    pub fn connect(uri: &DatabaseUri, migration_table: &str) -> Result<Self, Error> {
        let mut opts = OptsBuilder::new()
            .user(uri.username.clone())
            .pass(uri.password.clone())
            .db_name(if uri.database.is_empty() {
                None
            } else {
                Some(uri.database.clone())
            })
            .additional_capabilities(mysql::consts::CapabilityFlags::CLIENT_MULTI_STATEMENTS);
        if let Some(socket) = uri.args.get("unix_socket") {
            opts = opts.socket(Some(socket.clone()));
        } else {
            opts = opts.ip_or_hostname(uri.hostname.clone());
            if let Some(port) = uri.port {
                opts = opts.tcp_port(port);
            }
        }
        let conn = Conn::new(opts)?;
        Ok(Self::from_connection(conn, migration_table))
    }

    /// Wrap an existing connection. Useful for embedding and tests.
    pub fn from_connection(conn: Conn, migration_table: &str) -> Self {
        MysqlBackend {
            conn,
            migration_table: migration_table.to_string(),
            in_transaction: false,
            lock_held: false,
        }
    }

    fn lock_name(&self) -> String {
        // GET_LOCK names are limited to 64 characters.
        format!("ordino:{}", self.migration_table)
            .chars()
            .take(64)
            .collect()
    }
}

impl Backend for MysqlBackend {
    fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.query_drop(sql)?;
        Ok(())
    }

    fn connection(&mut self) -> DbHandle<'_> {
        DbHandle::Mysql(&mut self.conn)
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
        false
    }

    fn ensure_internal_tables(&mut self) -> Result<(), Error> {
        self.conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id VARCHAR(255) NOT NULL PRIMARY KEY,
                ctime DATETIME NOT NULL
            )",
            self.migration_table
        ))?;
        self.conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} (
                locked INT NOT NULL PRIMARY KEY,
                ctime DATETIME NOT NULL,
                pid INT NOT NULL
            )",
            self.lock_table()
        ))?;
        Ok(())
    }

    fn list_applied(&mut self) -> Result<Vec<String>, Error> {
        let ids = self
            .conn
            .query(format!("SELECT id FROM {} ORDER BY ctime", self.migration_table))?;
        Ok(ids)
    }

    fn is_applied(&mut self, id: &str) -> Result<bool, Error> {
        let count: Option<i64> = self.conn.exec_first(
            format!("SELECT COUNT(1) FROM {} WHERE id = ?", self.migration_table),
            (id,),
        )?;
        Ok(count.unwrap_or(0) > 0)
    }

    fn record_applied(&mut self, id: &str, ctime: DateTime<Utc>) -> Result<(), Error> {
        self.conn.exec_drop(
            format!(
                "INSERT INTO {} (id, ctime) VALUES (?, ?)",
                self.migration_table
            ),
            (id, ctime.format("%Y-%m-%d %H:%M:%S").to_string()),
        )?;
        Ok(())
    }

    fn unrecord_applied(&mut self, id: &str) -> Result<(), Error> {
        self.conn.exec_drop(
            format!("DELETE FROM {} WHERE id = ?", self.migration_table),
            (id,),
        )?;
        Ok(())
    }

    fn lock(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if self.lock_held {
            return Ok(());
        }
        // A negative timeout means wait forever.
        let timeout_secs: i64 = match timeout {
            Some(t) => t.as_secs() as i64,
            None => -1,
        };
        let acquired: Option<Option<i64>> = self.conn.exec_first(
            "SELECT GET_LOCK(?, ?)",
            (self.lock_name(), timeout_secs),
        )?;
        match acquired.flatten() {
            Some(1) => {
                self.lock_held = true;
                Ok(())
            }
            Some(_) => Err(Error::LockTimeout(format!(
                "timed out waiting for lock {}",
                self.lock_name()
            ))),
            None => Err(Error::LockTimeout(format!(
                "could not acquire lock {}",
                self.lock_name()
            ))),
        }
    }

    fn unlock(&mut self) -> Result<(), Error> {
        if !self.lock_held {
            return Ok(());
        }
        self.conn
            .exec_drop("SELECT RELEASE_LOCK(?)", (self.lock_name(),))?;
        self.lock_held = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendExt;
    use crate::executor::Executor;
    use crate::migration::{Migration, MigrationSet, Step};
    use crate::test_support::mysql_backend;

    #[test]
    fn applies_and_records_migrations() {
        let mut backend = mysql_backend();

        let set = MigrationSet::from_migrations(vec![Migration::new("0001-users").with_step(
            Step::sql_with_rollback(
                "CREATE TABLE users (id INT PRIMARY KEY AUTO_INCREMENT, name VARCHAR(255))",
                "DROP TABLE users",
            ),
        )])
        .unwrap();

        let exec = Executor::new();
        let report = backend.apply_migrations(&set, None, &exec).unwrap();
        assert_eq!(report.applied, vec!["0001-users"]);
        assert!(backend.is_applied("0001-users").unwrap());

        let report = backend.rollback_migrations(&set, None, &exec).unwrap();
        assert_eq!(report.rolled_back, vec!["0001-users"]);
        assert!(!backend.is_applied("0001-users").unwrap());
    }

    #[test]
    fn failure_reverses_completed_ddl_steps() {
        let mut backend = mysql_backend();

        // DDL commits implicitly here, so the engine reverses the completed
        // steps instead of relying on transaction rollback.
        let set = MigrationSet::from_migrations(vec![Migration::new("0001-broken")
            .with_step(Step::sql_with_rollback(
                "CREATE TABLE half_done (id INT PRIMARY KEY)",
                "DROP TABLE half_done",
            ))
            .with_step(Step::sql("THIS IS NOT VALID SQL"))])
        .unwrap();

        let report = backend
            .apply_migrations(&set, None, &Executor::new())
            .unwrap();
        let failure = report.failure.expect("the migration should have failed");
        assert_eq!(failure.steps_completed, 1);

        let count: Option<i64> = backend
            .conn
            .query_first(
                "SELECT COUNT(1) FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = 'half_done'",
            )
            .unwrap();
        assert_eq!(count, Some(0), "recovery should have dropped the table");
        assert!(!backend.is_applied("0001-broken").unwrap());
    }
}
