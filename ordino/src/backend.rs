//! The backend adapter: a uniform interface over a concrete SQL driver.
//!
//! Transactions and savepoints are driven through plain SQL (`BEGIN`,
//! `COMMIT`, `SAVEPOINT …`) on every driver so that a single executor state
//! machine serves all of them; the per-driver modules implement only
//! connection setup, batch execution, the parameter-bound applied-set
//! statements and the advisory-lock primitive.
//!
//! ## Driver capabilities
//!
//! | Behavior | SQLite | MySQL | PostgreSQL |
//! |----------|--------|-------|------------|
//! | DDL in transactions | Supported | Causes implicit commit | Supported |
//! | Advisory lock | Lock-table row | `GET_LOCK` | `pg_advisory_lock` |
//!
//! [`Backend::transactional_ddl`] reports the first capability; the executor
//! still runs the two-level protocol on MySQL but cannot promise rollback
//! for migrations whose steps are DDL.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::executor::Executor;
use crate::migration::MigrationSet;
use crate::plan::Operation;

/// The default name of the applied-set table.
pub const DEFAULT_MIGRATION_TABLE: &str = "_ordino_migration";

/// A live connection handle, passed to callable steps for the duration of
/// the step. Callable steps must not close it.
pub enum DbHandle<'a> {
    #[cfg(feature = "sqlite")]
    Sqlite(&'a mut rusqlite::Connection),
    #[cfg(feature = "mysql")]
    Mysql(&'a mut mysql::Conn),
    #[cfg(feature = "postgres")]
    Postgres(&'a mut postgres::Client),
    #[cfg(not(any(feature = "sqlite", feature = "mysql", feature = "postgres")))]
    #[doc(hidden)]
    Unavailable(std::marker::PhantomData<&'a mut ()>),
}

impl<'a> DbHandle<'a> {
    /// Execute a statement batch on whichever driver is behind the handle.
    /// Callable steps that need driver-specific APIs should match on the
    /// variant instead.
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        match self {
            #[cfg(feature = "sqlite")]
            DbHandle::Sqlite(conn) => conn.execute_batch(sql).map_err(Error::from),
            #[cfg(feature = "mysql")]
            DbHandle::Mysql(conn) => {
                use mysql::prelude::Queryable;
                conn.query_drop(sql).map_err(Error::from)
            }
            #[cfg(feature = "postgres")]
            DbHandle::Postgres(client) => client.batch_execute(sql).map_err(Error::from),
            #[cfg(not(any(feature = "sqlite", feature = "mysql", feature = "postgres")))]
            DbHandle::Unavailable(_) => {
                let _ = sql;
                Err(Error::Generic("no database driver enabled".to_string()))
            }
        }
    }

    #[cfg(feature = "sqlite")]
    pub fn as_sqlite(&mut self) -> Option<&mut rusqlite::Connection> {
        match self {
            DbHandle::Sqlite(conn) => Some(conn),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[cfg(feature = "mysql")]
    pub fn as_mysql(&mut self) -> Option<&mut mysql::Conn> {
        match self {
            DbHandle::Mysql(conn) => Some(conn),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    #[cfg(feature = "postgres")]
    pub fn as_postgres(&mut self) -> Option<&mut postgres::Client> {
        match self {
            DbHandle::Postgres(client) => Some(client),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

/// Uniform interface over a concrete SQL driver.
///
/// The applied-set table (`migration_table`) is the authoritative record of
/// which migrations have run; its row for a migration is written iff the
/// migration's outer transaction committed. The lock table serializes
/// concurrent migrator processes on drivers without a native advisory lock.
pub trait Backend {
    /// Execute a statement batch outside of any parameter binding.
    fn execute(&mut self, sql: &str) -> Result<(), Error>;

    /// The live handle handed to callable steps.
    fn connection(&mut self) -> DbHandle<'_>;

    /// The applied-set table name.
    fn migration_table(&self) -> &str;

    fn in_transaction(&self) -> bool;
    fn set_in_transaction(&mut self, in_transaction: bool);

    /// Whether DDL statements can participate in transactions on this
    /// driver. When false, the executor warns and performs best-effort
    /// recovery instead of relying on rollback.
    fn transactional_ddl(&self) -> bool;

    /// Create the applied-set and lock tables if they do not exist.
    fn ensure_internal_tables(&mut self) -> Result<(), Error>;

    /// The identities currently recorded as applied, in application order.
    fn list_applied(&mut self) -> Result<Vec<String>, Error>;

    fn is_applied(&mut self, id: &str) -> Result<bool, Error>;

    /// Insert an applied-set row. Must run inside the caller's transaction.
    fn record_applied(&mut self, id: &str, ctime: DateTime<Utc>) -> Result<(), Error>;

    /// Delete an applied-set row. Must run inside the caller's transaction.
    fn unrecord_applied(&mut self, id: &str) -> Result<(), Error>;

    /// Acquire the cross-process advisory lock. `None` waits indefinitely.
    fn lock(&mut self, timeout: Option<Duration>) -> Result<(), Error>;

    /// Release the advisory lock. Called on every exit path.
    fn unlock(&mut self) -> Result<(), Error>;

    /// The lock table name, derived from the applied-set table name.
    fn lock_table(&self) -> String {
        format!("{}_lock", self.migration_table())
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.in_transaction() {
            return Err(Error::Generic(
                "transaction already open; outer transactions do not nest".to_string(),
            ));
        }
        self.execute("BEGIN")?;
        self.set_in_transaction(true);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.execute("COMMIT")?;
        self.set_in_transaction(false);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.execute("ROLLBACK")?;
        self.set_in_transaction(false);
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> Result<(), Error> {
        self.execute(&format!("SAVEPOINT {}", name))
    }

    fn savepoint_release(&mut self, name: &str) -> Result<(), Error> {
        self.execute(&format!("RELEASE SAVEPOINT {}", name))
    }

    fn savepoint_rollback(&mut self, name: &str) -> Result<(), Error> {
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
    }
}

/// The stable programmatic interface: single-call operations on any
/// [Backend]. Each call locks, reads the applied-set, resolves a plan and
/// executes it.
pub trait BackendExt: Backend {
    /// Apply every unapplied migration (or the target and its ancestors),
    /// then run any post-apply hooks.
    fn apply_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Apply migrations without running post-apply hooks.
    fn apply_migrations_only(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Roll back every applied migration (or the target and its applied
    /// descendants).
    fn rollback_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Roll back exactly one migration. Fails if other applied migrations
    /// still depend on it.
    fn rollback_one(
        &mut self,
        set: &MigrationSet,
        id: &str,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Roll back then re-apply (the target and its applied descendants, or
    /// everything applied). Ends in a forward phase, so post-apply hooks run.
    fn reapply_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Record migrations as applied without executing their steps.
    fn mark_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;

    /// Remove migrations from the applied-set without executing their steps.
    fn unmark_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error>;
}

impl<B: Backend + ?Sized> BackendExt for B {
    fn apply_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run(self, set, Operation::Apply, target)
    }

    fn apply_migrations_only(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run_without_post_apply(self, set, Operation::Apply, target)
    }

    fn rollback_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run(self, set, Operation::Rollback, target)
    }

    fn rollback_one(
        &mut self,
        set: &MigrationSet,
        id: &str,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run_single_rollback(self, set, id)
    }

    fn reapply_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run(self, set, Operation::Reapply, target)
    }

    fn mark_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run(self, set, Operation::Mark, target)
    }

    fn unmark_migrations(
        &mut self,
        set: &MigrationSet,
        target: Option<&str>,
        executor: &Executor,
    ) -> Result<crate::executor::MigrationReport, Error> {
        executor.run(self, set, Operation::Unmark, target)
    }
}
