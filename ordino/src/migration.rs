//! The migration object model.
//!
//! A [Migration] is an identity, an ordered list of [Step]s and a set of
//! dependency identities. Migrations are read-only once constructed: source
//! discovery (see [`read_migrations`](crate::read_migrations)) or the
//! consuming builder methods on [Migration] produce them, the resolver and
//! executor only ever borrow them.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::backend::DbHandle;
use crate::error::Error;
use crate::plan::Direction;

/// The identity prefix that marks a migration as a post-apply hook.
pub const POST_APPLY_PREFIX: &str = "post-apply";

/// A callable step body. Receives the live connection for the duration of
/// the step; implementations must not close it.
pub type StepFn = Box<dyn Fn(&mut DbHandle<'_>) -> Result<(), Error> + Send + Sync>;

/// Which direction(s) of execution a step tolerates errors in.
///
/// A covered error causes the step's savepoint to be rolled back and the
/// plan to continue with the next step instead of aborting the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnoreErrors {
    /// Errors always abort the migration.
    #[default]
    Never,
    /// Errors are tolerated while applying.
    Apply,
    /// Errors are tolerated while rolling back.
    Rollback,
    /// Errors are tolerated in both directions.
    All,
}

impl IgnoreErrors {
    /// Whether this policy tolerates an error raised in `direction`.
    pub fn covers(self, direction: Direction) -> bool {
        match (self, direction) {
            (IgnoreErrors::All, _) => true,
            (IgnoreErrors::Apply, Direction::Forward) => true,
            (IgnoreErrors::Rollback, Direction::Backward) => true,
            _ => false,
        }
    }
}

/// The body of a [Step].
pub enum StepBody {
    /// A literal SQL statement batch, with an optional rollback batch.
    /// A missing rollback makes the step a no-op in the backward direction.
    Sql {
        apply: String,
        rollback: Option<String>,
    },
    /// An opaque operation invoked with the live connection.
    Callable {
        apply: StepFn,
        rollback: Option<StepFn>,
    },
    /// An ordered sequence of child steps sharing this step's savepoint.
    /// Children nest their own savepoints beneath it.
    Group { steps: Vec<Step> },
}

impl fmt::Debug for StepBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepBody::Sql { apply, rollback } => f
                .debug_struct("Sql")
                .field("apply", apply)
                .field("rollback", rollback)
                .finish(),
            StepBody::Callable { rollback, .. } => f
                .debug_struct("Callable")
                .field("rollback", &rollback.is_some())
                .finish(),
            StepBody::Group { steps } => f.debug_struct("Group").field("steps", steps).finish(),
        }
    }
}

/// The smallest executable unit within a migration.
#[derive(Debug)]
pub struct Step {
    pub(crate) body: StepBody,
    pub(crate) ignore_errors: IgnoreErrors,
}

impl Step {
    /// A SQL step with an apply statement and no rollback.
    pub fn sql(apply: impl Into<String>) -> Self {
        Step {
            body: StepBody::Sql {
                apply: apply.into(),
                rollback: None,
            },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    /// A SQL step with both apply and rollback statements.
    pub fn sql_with_rollback(apply: impl Into<String>, rollback: impl Into<String>) -> Self {
        Step {
            body: StepBody::Sql {
                apply: apply.into(),
                rollback: Some(rollback.into()),
            },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    /// A callable step with no rollback.
    pub fn callable<F>(apply: F) -> Self
    where
        F: Fn(&mut DbHandle<'_>) -> Result<(), Error> + Send + Sync + 'static,
    {
        Step {
            body: StepBody::Callable {
                apply: Box::new(apply),
                rollback: None,
            },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    /// A callable step with both apply and rollback operations.
    pub fn callable_with_rollback<F, G>(apply: F, rollback: G) -> Self
    where
        F: Fn(&mut DbHandle<'_>) -> Result<(), Error> + Send + Sync + 'static,
        G: Fn(&mut DbHandle<'_>) -> Result<(), Error> + Send + Sync + 'static,
    {
        Step {
            body: StepBody::Callable {
                apply: Box::new(apply),
                rollback: Some(Box::new(rollback)),
            },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    /// A group of steps run under a single shared savepoint.
    pub fn group(steps: Vec<Step>) -> Self {
        Step {
            body: StepBody::Group { steps },
            ignore_errors: IgnoreErrors::Never,
        }
    }

    /// Set the error-tolerance policy for this step.
    pub fn ignore_errors(mut self, policy: IgnoreErrors) -> Self {
        self.ignore_errors = policy;
        self
    }

    pub fn body(&self) -> &StepBody {
        &self.body
    }

    pub fn policy(&self) -> IgnoreErrors {
        self.ignore_errors
    }
}

/// A single database migration: an identity, an ordered list of steps and
/// the identities of the migrations it depends on.
#[derive(Debug)]
pub struct Migration {
    pub(crate) id: String,
    pub(crate) steps: Vec<Step>,
    pub(crate) depends: Vec<String>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) source: Option<String>,
}

impl Migration {
    /// Start a new migration with the given identity. Steps and dependencies
    /// are attached with the consuming builder methods.
    pub fn new(id: impl Into<String>) -> Self {
        Migration {
            id: id.into(),
            steps: Vec::new(),
            depends: Vec::new(),
            path: None,
            source: None,
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare dependencies on other migrations by identity.
    pub fn with_dependencies<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends.extend(depends.into_iter().map(Into::into));
        self
    }

    pub(crate) fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub(crate) fn with_source(mut self, source: String) -> Self {
        self.source = Some(source);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    /// The file this migration was loaded from, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// The raw source text of the migration file, if loaded from disk.
    /// Used by interactive front-ends to display the migration in full.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Whether this migration is a post-apply hook.
    pub fn is_post_apply(&self) -> bool {
        self.id.starts_with(POST_APPLY_PREFIX)
    }
}

/// A collection of migrations, with post-apply hooks segregated from the
/// ordinary set. Identities must be unique across the whole collection;
/// inserting a duplicate is a hard error.
#[derive(Debug, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
    post_apply: Vec<Migration>,
}

impl MigrationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a collection of migrations, failing on identity
    /// conflicts.
    pub fn from_migrations<I>(migrations: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Migration>,
    {
        let mut set = Self::new();
        for m in migrations {
            set.push(m)?;
        }
        Ok(set)
    }

    /// Insert a migration, routing post-apply hooks into their own list.
    pub fn push(&mut self, migration: Migration) -> Result<(), Error> {
        if self.contains(&migration.id) {
            return Err(Error::MigrationConflict(migration.id));
        }
        if migration.is_post_apply() {
            self.post_apply.push(migration);
        } else {
            self.migrations.push(migration);
        }
        Ok(())
    }

    /// Merge another set into this one, failing on identity conflicts.
    pub fn merge(&mut self, other: MigrationSet) -> Result<(), Error> {
        for m in other.migrations.into_iter().chain(other.post_apply) {
            self.push(m)?;
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.migrations
            .iter()
            .chain(self.post_apply.iter())
            .find(|m| m.id == id)
    }

    /// The ordinary migrations, in load order.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// The post-apply hooks, in load order.
    pub fn post_apply(&self) -> &[Migration] {
        &self.post_apply
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// The migrations no other migration depends on. A freshly created
    /// migration conventionally depends on all current heads.
    pub fn heads(&self) -> Vec<&str> {
        let depended_on: HashSet<&str> = self
            .migrations
            .iter()
            .flat_map(|m| m.depends.iter().map(String::as_str))
            .collect();
        self.migrations
            .iter()
            .map(|m| m.id.as_str())
            .filter(|id| !depended_on.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_errors_covers_directions() {
        assert!(!IgnoreErrors::Never.covers(Direction::Forward));
        assert!(!IgnoreErrors::Never.covers(Direction::Backward));
        assert!(IgnoreErrors::Apply.covers(Direction::Forward));
        assert!(!IgnoreErrors::Apply.covers(Direction::Backward));
        assert!(!IgnoreErrors::Rollback.covers(Direction::Forward));
        assert!(IgnoreErrors::Rollback.covers(Direction::Backward));
        assert!(IgnoreErrors::All.covers(Direction::Forward));
        assert!(IgnoreErrors::All.covers(Direction::Backward));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut set = MigrationSet::new();
        set.push(Migration::new("0001-a")).unwrap();
        let err = set.push(Migration::new("0001-a")).unwrap_err();
        assert_eq!(err, Error::MigrationConflict("0001-a".to_string()));
    }

    #[test]
    fn post_apply_is_segregated() {
        let mut set = MigrationSet::new();
        set.push(Migration::new("0001-a")).unwrap();
        set.push(Migration::new("post-apply")).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.post_apply().len(), 1);
        assert!(set.contains("post-apply"));
    }

    #[test]
    fn heads_excludes_depended_on_migrations() {
        let set = MigrationSet::from_migrations(vec![
            Migration::new("a"),
            Migration::new("b").with_dependencies(["a"]),
            Migration::new("c").with_dependencies(["a"]),
        ])
        .unwrap();
        let mut heads = set.heads();
        heads.sort();
        assert_eq!(heads, vec!["b", "c"]);
    }

    #[test]
    fn merge_detects_conflicts_across_directories() {
        let mut a = MigrationSet::from_migrations(vec![Migration::new("0001-a")]).unwrap();
        let b = MigrationSet::from_migrations(vec![Migration::new("0001-a")]).unwrap();
        assert!(a.merge(b).is_err());
    }
}
