//! The plan executor.
//!
//! Drives a resolved [Plan](crate::plan::Plan) against a [Backend] using a
//! two-level transaction protocol: one outer transaction per migration, one
//! savepoint per step. The outer commit establishes atomicity of "steps ran
//! and the applied-set was updated"; on drivers where DDL cannot take part
//! in a transaction the executor still runs the same state machine but
//! performs best-effort recovery instead of relying on rollback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::backend::Backend;
use crate::error::Error;
use crate::migration::{Migration, MigrationSet, Step, StepBody};
use crate::plan::{resolve, Direction, Operation, Plan, PlanEntry};

/// The decision returned by a [ConfirmFn] when running interactively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Execute this migration.
    Yes,
    /// Skip this migration.
    No,
    /// Execute this and every remaining migration without further prompts.
    All,
    /// Stop; remaining migrations are not executed.
    Quit,
}

/// Callback consulted before each migration when not in batch mode.
pub type ConfirmFn = Box<dyn Fn(&Migration, Direction) -> Decision + Send + Sync>;

/// A caller-held handle for cancelling a running executor. Cancellation is
/// checked between steps: the in-flight step finishes, the outer
/// transaction is rolled back and the lock released.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-migration execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MigrationState {
    Pending,
    Running,
    Committed,
    Aborted,
}

/// The failure recorded in a [MigrationReport].
#[derive(Debug, PartialEq)]
pub struct MigrationFailure {
    /// The migration that failed.
    pub id: String,
    /// The direction it was being executed in.
    pub direction: Direction,
    /// How many top-level steps had completed before the failure. On
    /// drivers without transactional DDL these steps may have left committed
    /// changes behind; front-ends print a diagnostic from this count.
    pub steps_completed: usize,
    pub error: Error,
}

/// A report of actions performed during an executor run.
#[derive(Debug, Default, PartialEq)]
pub struct MigrationReport {
    /// Identities applied, in execution order.
    pub applied: Vec<String>,
    /// Identities rolled back, in execution order.
    pub rolled_back: Vec<String>,
    /// Identities recorded as applied without executing steps.
    pub marked: Vec<String>,
    /// Identities removed from the applied-set without executing steps.
    pub unmarked: Vec<String>,
    /// Identities skipped because a concurrent migrator got there first, or
    /// because the interactive confirmation declined them.
    pub skipped: Vec<String>,
    /// Whether the post-apply hooks ran.
    pub post_apply_ran: bool,
    /// The first failure, if any. With `continue_on_failure`, later
    /// failures are logged but not recorded here.
    pub failure: Option<MigrationFailure>,
}

impl MigrationReport {
    /// Whether the run completed without any failure.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// The executor and its invocation policy.
///
/// This is the explicit configuration object for a run: batch mode, error
/// forcing, failure policy, lock timeout, cancellation and the interactive
/// confirmation callback, plus optional progress hooks in the style of an
/// observability layer.
#[derive(Default)]
pub struct Executor {
    batch_mode: bool,
    force: bool,
    continue_on_failure: bool,
    lock_timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    confirm: Option<ConfirmFn>,
    on_migration_start: Option<Box<dyn Fn(&str, Direction) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(&str, Direction, Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(&str, Direction, &Error) + Send + Sync>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("batch_mode", &self.batch_mode)
            .field("force", &self.force)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("lock_timeout", &self.lock_timeout)
            .field("confirm", &self.confirm.is_some())
            .finish()
    }
}

impl Executor {
    /// An executor with library defaults: batch mode, no forcing, halt on
    /// failure, wait indefinitely for the lock.
    pub fn new() -> Self {
        Executor {
            batch_mode: true,
            ..Default::default()
        }
    }

    /// Run interactively: consult `confirm` before each migration.
    pub fn interactive<F>(mut self, confirm: F) -> Self
    where
        F: Fn(&Migration, Direction) -> Decision + Send + Sync + 'static,
    {
        self.batch_mode = false;
        self.confirm = Some(Box::new(confirm));
        self
    }

    /// Treat every step error as ignorable, in both directions.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Keep executing subsequent migrations after one aborts.
    pub fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    /// Fail lock acquisition after `timeout` instead of waiting forever.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token checked between steps.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set a callback invoked when a migration starts executing.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a migration commits, with its duration.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction, Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a migration aborts.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Direction, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Resolve and execute `op` over `set`, running post-apply hooks after
    /// a successful forward phase.
    pub fn run<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        set: &MigrationSet,
        op: Operation,
        target: Option<&str>,
    ) -> Result<MigrationReport, Error> {
        self.run_inner(backend, set, op, target, true)
    }

    /// Resolve and execute `op` over `set` without running post-apply hooks.
    pub fn run_without_post_apply<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        set: &MigrationSet,
        op: Operation,
        target: Option<&str>,
    ) -> Result<MigrationReport, Error> {
        self.run_inner(backend, set, op, target, false)
    }

    /// Roll back exactly one migration, refusing if other applied
    /// migrations still depend on it.
    pub fn run_single_rollback<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        set: &MigrationSet,
        id: &str,
    ) -> Result<MigrationReport, Error> {
        backend.ensure_internal_tables()?;
        backend.lock(self.lock_timeout)?;
        let result: Result<MigrationReport, Error> = (|| {
            let applied = backend.list_applied()?;
            let plan = resolve(set, &applied, Operation::Rollback, Some(id), self.force)?;
            let dependents: Vec<&str> = plan
                .entries
                .iter()
                .map(|e| e.migration.id())
                .filter(|planned| *planned != id)
                .collect();
            if !dependents.is_empty() {
                return Err(Error::Generic(format!(
                    "cannot roll back {} alone: applied migrations depend on it: {}",
                    id,
                    dependents.join(", ")
                )));
            }
            self.execute_plan(backend, &plan)
        })();
        let unlocked = backend.unlock();
        let report = result?;
        unlocked?;
        Ok(report)
    }

    fn run_inner<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        set: &MigrationSet,
        op: Operation,
        target: Option<&str>,
        with_post_apply: bool,
    ) -> Result<MigrationReport, Error> {
        backend.ensure_internal_tables()?;
        // The lock covers the applied-set read as well as the mutations, so
        // a second migrator observes this run's rows before planning.
        backend.lock(self.lock_timeout)?;
        let result: Result<MigrationReport, Error> = (|| {
            let applied = backend.list_applied()?;
            let plan = resolve(set, &applied, op, target, self.force)?;
            let mut report = self.execute_plan(backend, &plan)?;
            if with_post_apply
                && report.is_success()
                && !report.applied.is_empty()
                && !set.post_apply().is_empty()
            {
                self.run_post_apply(backend, set, &mut report)?;
            }
            Ok(report)
        })();
        let unlocked = backend.unlock();
        let report = result?;
        unlocked?;
        Ok(report)
    }

    fn run_post_apply<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        set: &MigrationSet,
        report: &mut MigrationReport,
    ) -> Result<(), Error> {
        for hook in set.post_apply() {
            tracing::info!(migration = %hook.id(), "running post-apply hook");
            match self.run_migration(backend, hook, Direction::Forward, false) {
                Ok(MigrationOutcome::Executed) => report.post_apply_ran = true,
                Ok(MigrationOutcome::Skipped) => {}
                Err(StepFailure { error, steps_completed }) => {
                    // Only the hook's transaction is rolled back; rows
                    // recorded by the plan remain.
                    report.failure = Some(MigrationFailure {
                        id: hook.id().to_string(),
                        direction: Direction::Forward,
                        steps_completed,
                        error,
                    });
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Execute an already-resolved plan. Exposed for front-ends that
    /// resolve and execute in separate phases; most callers use [run].
    ///
    /// [run]: Executor::run
    pub fn execute_plan<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        plan: &Plan<'_>,
    ) -> Result<MigrationReport, Error> {
        let mut report = MigrationReport::default();
        let mut confirm_all = false;

        for entry in &plan.entries {
            let PlanEntry {
                migration,
                direction,
                mark_only,
            } = *entry;

            if self.check_cancelled().is_err() {
                return Err(Error::Cancelled);
            }

            if !self.batch_mode && !confirm_all {
                if let Some(confirm) = &self.confirm {
                    match confirm(migration, direction) {
                        Decision::Yes => {}
                        Decision::No => {
                            report.skipped.push(migration.id().to_string());
                            continue;
                        }
                        Decision::All => confirm_all = true,
                        Decision::Quit => break,
                    }
                }
            }

            tracing::debug!(
                migration = %migration.id(),
                from = ?MigrationState::Pending,
                to = ?MigrationState::Running,
                "state transition"
            );

            let outcome = if mark_only {
                self.mark_migration(backend, migration, direction)
            } else {
                self.run_migration(backend, migration, direction, true)
            };

            match outcome {
                Ok(MigrationOutcome::Executed) => {
                    tracing::debug!(
                        migration = %migration.id(),
                        from = ?MigrationState::Running,
                        to = ?MigrationState::Committed,
                        "state transition"
                    );
                    let list = match (mark_only, direction) {
                        (true, Direction::Forward) => &mut report.marked,
                        (true, Direction::Backward) => &mut report.unmarked,
                        (false, Direction::Forward) => &mut report.applied,
                        (false, Direction::Backward) => &mut report.rolled_back,
                    };
                    list.push(migration.id().to_string());
                }
                Ok(MigrationOutcome::Skipped) => {
                    report.skipped.push(migration.id().to_string());
                }
                Err(StepFailure { error, steps_completed }) => {
                    tracing::debug!(
                        migration = %migration.id(),
                        from = ?MigrationState::Running,
                        to = ?MigrationState::Aborted,
                        "state transition"
                    );
                    if let Error::Cancelled = error {
                        return Err(Error::Cancelled);
                    }
                    if let Some(callback) = &self.on_migration_error {
                        callback(migration.id(), direction, &error);
                    }
                    if report.failure.is_none() {
                        report.failure = Some(MigrationFailure {
                            id: migration.id().to_string(),
                            direction,
                            steps_completed,
                            error,
                        });
                    } else {
                        tracing::warn!(
                            migration = %migration.id(),
                            %direction,
                            %error,
                            "further migration failed"
                        );
                    }
                    if !self.continue_on_failure {
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Run one migration under the two-level transaction protocol.
    /// `record` controls the applied-set mutation; post-apply hooks pass
    /// false and are never recorded.
    fn run_migration<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        migration: &Migration,
        direction: Direction,
        record: bool,
    ) -> Result<MigrationOutcome, StepFailure> {
        let span = tracing::info_span!(
            "migration",
            id = %migration.id(),
            direction = %direction
        );
        let _span = span.entered();

        if let Some(callback) = &self.on_migration_start {
            callback(migration.id(), direction);
        }
        match direction {
            Direction::Forward => tracing::info!("applying {}", migration.id()),
            Direction::Backward => tracing::info!("rolling back {}", migration.id()),
        }
        let started = Instant::now();

        backend.begin().map_err(StepFailure::before_any_step)?;

        // A concurrent migrator may have applied this migration between our
        // applied-set read and now; treat the conflict as a warning.
        if record && direction == Direction::Forward {
            match backend.is_applied(migration.id()) {
                Ok(true) => {
                    tracing::warn!(
                        migration = %migration.id(),
                        "already recorded as applied; skipping"
                    );
                    let _ = backend.rollback();
                    return Ok(MigrationOutcome::Skipped);
                }
                Ok(false) => {}
                Err(e) => {
                    let _ = backend.rollback();
                    return Err(StepFailure::before_any_step(e));
                }
            }
        }

        let mut savepoints = SavepointNames::default();
        let mut executed: Vec<&Step> = Vec::new();
        let steps = migration.steps();
        let ordered: Vec<&Step> = match direction {
            Direction::Forward => steps.iter().collect(),
            Direction::Backward => steps.iter().rev().collect(),
        };

        for step in ordered {
            if let Err(e) = self.check_cancelled() {
                let _ = backend.rollback();
                return Err(StepFailure {
                    error: e,
                    steps_completed: executed.len(),
                });
            }
            if let Err(error) = self.run_step(backend, step, direction, &mut savepoints) {
                let steps_completed = executed.len();
                if !backend.transactional_ddl() {
                    // Any DDL that already ran has been committed. Go back
                    // through the executed steps to undo what can be undone.
                    self.reverse_executed(backend, &executed, direction);
                }
                let _ = backend.rollback();
                return Err(StepFailure {
                    error,
                    steps_completed,
                });
            }
            executed.push(step);
        }

        if record {
            let mutation = match direction {
                Direction::Forward => backend.record_applied(migration.id(), Utc::now()),
                Direction::Backward => backend.unrecord_applied(migration.id()),
            };
            if let Err(e) = mutation {
                let _ = backend.rollback();
                return Err(StepFailure {
                    error: e,
                    steps_completed: executed.len(),
                });
            }
        }

        if let Err(e) = backend.commit() {
            let _ = backend.rollback();
            return Err(StepFailure {
                error: e,
                steps_completed: executed.len(),
            });
        }

        let elapsed = started.elapsed();
        tracing::info!(duration_ms = elapsed.as_millis() as u64, "committed");
        if let Some(callback) = &self.on_migration_complete {
            callback(migration.id(), direction, elapsed);
        }
        Ok(MigrationOutcome::Executed)
    }

    /// Execute one step under its own savepoint, honoring its
    /// `ignore_errors` policy. Group children recurse, nesting their
    /// savepoints beneath the group's.
    fn run_step<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        step: &Step,
        direction: Direction,
        savepoints: &mut SavepointNames,
    ) -> Result<(), Error> {
        let name = savepoints.next();
        backend.savepoint(&name)?;

        let result = self.run_step_body(backend, step, direction, savepoints);
        match result {
            Ok(()) => {
                // Releasing after DDL on a driver that auto-committed would
                // itself error, so only release where savepoints survive.
                if backend.transactional_ddl() {
                    backend.savepoint_release(&name)?;
                }
                Ok(())
            }
            Err(error) => {
                if step.policy().covers(direction) || self.force {
                    tracing::warn!(%error, "ignored error in step");
                    if let Err(rollback_error) = backend.savepoint_rollback(&name) {
                        tracing::warn!(
                            %rollback_error,
                            "could not roll back to savepoint after ignored error"
                        );
                    }
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    fn run_step_body<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        step: &Step,
        direction: Direction,
        savepoints: &mut SavepointNames,
    ) -> Result<(), Error> {
        match step.body() {
            StepBody::Group { steps } => {
                let ordered: Vec<&Step> = match direction {
                    Direction::Forward => steps.iter().collect(),
                    Direction::Backward => steps.iter().rev().collect(),
                };
                for child in ordered {
                    self.run_step(backend, child, direction, savepoints)?;
                }
                Ok(())
            }
            _ => self.run_plain_body(backend, step, direction),
        }
    }

    /// Best-effort reversal of already-executed steps after a failure on a
    /// driver without transactional DDL. Runs outside the savepoint
    /// protocol; savepoints do not survive an implicit commit.
    fn reverse_executed<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        executed: &[&Step],
        direction: Direction,
    ) {
        let reverse = match direction {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        };
        for step in executed.iter().rev() {
            self.reverse_step(backend, step, reverse);
        }
    }

    fn reverse_step<B: Backend + ?Sized>(&self, backend: &mut B, step: &Step, reverse: Direction) {
        match step.body() {
            StepBody::Group { steps } => {
                let ordered: Vec<&Step> = match reverse {
                    Direction::Forward => steps.iter().collect(),
                    Direction::Backward => steps.iter().rev().collect(),
                };
                for child in ordered {
                    self.reverse_step(backend, child, reverse);
                }
            }
            _ => {
                if let Err(error) = self.run_plain_body(backend, step, reverse) {
                    tracing::warn!(%error, "could not reverse step during recovery");
                }
            }
        }
    }

    fn run_plain_body<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        step: &Step,
        direction: Direction,
    ) -> Result<(), Error> {
        match step.body() {
            StepBody::Sql { apply, rollback } => match direction {
                Direction::Forward => {
                    tracing::debug!(sql = %apply, "executing");
                    backend.execute(apply)
                }
                Direction::Backward => match rollback {
                    Some(sql) => {
                        tracing::debug!(%sql, "executing");
                        backend.execute(sql)
                    }
                    None => Ok(()),
                },
            },
            StepBody::Callable { apply, rollback } => match direction {
                Direction::Forward => apply(&mut backend.connection()),
                Direction::Backward => match rollback {
                    Some(f) => f(&mut backend.connection()),
                    None => Ok(()),
                },
            },
            StepBody::Group { .. } => Ok(()),
        }
    }

    fn mark_migration<B: Backend + ?Sized>(
        &self,
        backend: &mut B,
        migration: &Migration,
        direction: Direction,
    ) -> Result<MigrationOutcome, StepFailure> {
        backend.begin().map_err(StepFailure::before_any_step)?;
        let result = match direction {
            Direction::Forward => {
                match backend.is_applied(migration.id()) {
                    Ok(true) => {
                        let _ = backend.rollback();
                        return Ok(MigrationOutcome::Skipped);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        let _ = backend.rollback();
                        return Err(StepFailure::before_any_step(e));
                    }
                }
                tracing::info!(migration = %migration.id(), "marking applied");
                backend.record_applied(migration.id(), Utc::now())
            }
            Direction::Backward => {
                tracing::info!(migration = %migration.id(), "unmarking");
                backend.unrecord_applied(migration.id())
            }
        };
        if let Err(e) = result {
            let _ = backend.rollback();
            return Err(StepFailure::before_any_step(e));
        }
        if let Err(e) = backend.commit() {
            let _ = backend.rollback();
            return Err(StepFailure::before_any_step(e));
        }
        Ok(MigrationOutcome::Executed)
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        match &self.cancellation {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

enum MigrationOutcome {
    Executed,
    Skipped,
}

struct StepFailure {
    error: Error,
    steps_completed: usize,
}

impl StepFailure {
    fn before_any_step(error: Error) -> Self {
        StepFailure {
            error,
            steps_completed: 0,
        }
    }
}

/// Monotonic savepoint names, one counter per migration.
#[derive(Default)]
struct SavepointNames {
    next_id: u32,
}

impl SavepointNames {
    fn next(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("sp_{}", id)
    }
}
