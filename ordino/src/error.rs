/// Error type for the ordino crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "mysql")]
    #[error("{0}")]
    Mysql(String),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),

    /// The connection URI could not be parsed.
    #[error("invalid database URI {uri}: {reason}")]
    BadUri { uri: String, reason: String },

    /// The connection URI named a scheme no backend is registered for.
    #[error("unrecognised database connection scheme {0:?}")]
    UnknownScheme(String),

    /// The same migration identity was defined more than once.
    #[error("migration {0:?} is defined more than once")]
    MigrationConflict(String),

    /// A migration declared a dependency on an identity that is not present
    /// in the loaded set.
    #[error("migration {id:?} depends on unknown migration {depends:?}")]
    UnknownDependency { id: String, depends: String },

    /// The dependency graph contains a cycle.
    #[error("circular dependencies among these migrations: {0}")]
    CircularDependencies(String),

    /// The requested target revision is not in the loaded set.
    #[error("unknown migration {0:?}")]
    UnknownMigration(String),

    /// The applied-set records a migration whose definition is not loaded,
    /// and the operation would need to execute its steps.
    #[error(
        "migration {0:?} is recorded as applied but its definition could not \
         be found in the migration sources"
    )]
    MissingSource(String),

    /// A migration file could not be loaded.
    #[error("could not load migration from {path}: {reason}")]
    BadMigration { path: String, reason: String },

    /// The advisory lock could not be acquired within the configured timeout.
    #[error("could not acquire migration lock: {0}")]
    LockTimeout(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(String),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

#[cfg(feature = "mysql")]
impl From<mysql::Error> for Error {
    fn from(value: mysql::Error) -> Self {
        Self::Mysql(value.to_string())
    }
}

// Manual PartialEq implementation because the driver error types don't all
// implement PartialEq.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            #[cfg(feature = "sqlite")]
            (Self::Sqlite(a), Self::Sqlite(b)) => a == b,
            #[cfg(feature = "mysql")]
            (Self::Mysql(a), Self::Mysql(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b) && a.to_string() == b.to_string(),
        }
    }
}
