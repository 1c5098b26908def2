#![cfg_attr(docsrs, feature(doc_cfg))]
//! `ordino` is a database schema migration engine with dependency-ordered
//! execution.
//!
//! Core concepts:
//! - Migrations are identified by name, not by a numeric version: each
//!   migration declares the migrations it depends on, and the resolver
//!   computes a deterministic topological order over the resulting graph.
//! - Execution uses a two-level transaction protocol: one outer transaction
//!   per migration, one savepoint per step. A migration's applied-set row is
//!   written exactly when its outer transaction commits.
//! - Steps can be SQL text, or Rust closures that receive the live database
//!   connection and can query data, transform it and write it back.
//!
//! # Example
//!
//! ```
//! use ordino::{BackendExt, Executor, Migration, MigrationSet, Step};
//! use ordino::sqlite::SqliteBackend;
//!
//! let set = MigrationSet::from_migrations(vec![
//!     Migration::new("0001-create-users")
//!         .with_step(Step::sql_with_rollback(
//!             "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
//!             "DROP TABLE users",
//!         )),
//!     Migration::new("0002-add-email")
//!         .with_dependencies(["0001-create-users"])
//!         .with_step(Step::sql_with_rollback(
//!             "ALTER TABLE users ADD COLUMN email TEXT",
//!             "ALTER TABLE users DROP COLUMN email",
//!         )),
//! ])
//! .unwrap();
//!
//! let conn = rusqlite::Connection::open_in_memory().unwrap();
//! let mut backend = SqliteBackend::from_connection(conn, ordino::DEFAULT_MIGRATION_TABLE);
//!
//! let report = backend.apply_migrations(&set, None, &Executor::new()).unwrap();
//! assert_eq!(report.applied, vec!["0001-create-users", "0002-add-email"]);
//!
//! let report = backend
//!     .rollback_migrations(&set, Some("0002-add-email"), &Executor::new())
//!     .unwrap();
//! assert_eq!(report.rolled_back, vec!["0002-add-email"]);
//! ```
//!
//! # Migration sources
//!
//! [read_migrations] loads SQL migration files from source directories; see
//! the [sources] module for the file format. Migrations that need callable
//! or group steps are constructed in code with the [Migration] builder.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag (default).
//! - [`MySQL`](mysql) - available with the `mysql` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! DDL-in-transaction support differs per driver; see the module docs and
//! [Backend::transactional_ddl].

mod backend;
pub use backend::{Backend, BackendExt, DbHandle, DEFAULT_MIGRATION_TABLE};

pub mod config;

mod error;
pub use error::Error;

mod executor;
pub use executor::{
    CancellationToken, ConfirmFn, Decision, Executor, MigrationFailure, MigrationReport,
};

mod graph;

mod migration;
pub use migration::{
    IgnoreErrors, Migration, MigrationSet, Step, StepBody, StepFn, POST_APPLY_PREFIX,
};

mod plan;
pub use plan::{resolve, Direction, Operation, Plan, PlanEntry};

pub mod sources;
pub use sources::read_migrations;

pub mod uri;
pub use uri::{parse_uri, DatabaseUri};

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, any(feature = "mysql", feature = "postgres")))]
pub(crate) mod test_support;

/// Connect to the database named by `uri` and return a boxed [Backend],
/// with the internal tables created.
///
/// Recognised schemes: `sqlite`, `postgresql` (alias `postgres`), `mysql`
/// (including the `mysql+mysqldb` driver-suffix form, which routes to the
/// same driver here).
pub fn get_backend(uri: &str, migration_table: &str) -> Result<Box<dyn Backend>, Error> {
    let parsed = parse_uri(uri)?;
    let mut backend: Box<dyn Backend> = match parsed.scheme.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => Box::new(sqlite::SqliteBackend::connect(&parsed, migration_table)?),
        #[cfg(feature = "mysql")]
        "mysql" => Box::new(mysql::MysqlBackend::connect(&parsed, migration_table)?),
        #[cfg(feature = "postgres")]
        "postgresql" | "postgres" => {
            Box::new(postgres::PostgresBackend::connect(&parsed, migration_table)?)
        }
        other => return Err(Error::UnknownScheme(other.to_string())),
    };
    backend.ensure_internal_tables()?;
    Ok(backend)
}
