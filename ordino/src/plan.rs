//! The plan resolver.
//!
//! Takes the loaded migration set plus the applied-set read from the
//! backend and produces the ordered sequence of (migration, direction)
//! pairs for a requested operation, optionally narrowed to a target
//! revision and its transitive closure.

use std::collections::HashSet;
use std::fmt;

use crate::error::Error;
use crate::graph::DependencyGraph;
use crate::migration::{Migration, MigrationSet};

/// The direction a migration is executed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// The user-facing verb for this direction.
    pub fn verb(self) -> &'static str {
        match self {
            Direction::Forward => "apply",
            Direction::Backward => "rollback",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// The operation a plan is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Rollback,
    Reapply,
    /// Record migrations as applied without executing their steps.
    Mark,
    /// Remove migrations from the applied-set without executing their steps.
    Unmark,
}

/// One entry of a [Plan]. `mark_only` directs the executor to mutate the
/// applied-set without running step bodies.
#[derive(Debug, Clone, Copy)]
pub struct PlanEntry<'a> {
    pub migration: &'a Migration,
    pub direction: Direction,
    pub mark_only: bool,
}

/// An ordered sequence of (migration, direction) pairs. Executing the
/// entries left to right against the applied-set they were resolved from
/// keeps every dependency precondition satisfied.
#[derive(Debug, Default)]
pub struct Plan<'a> {
    pub entries: Vec<PlanEntry<'a>>,
}

impl<'a> Plan<'a> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Resolve a plan for `op` over `set`, given the identities currently
/// recorded as applied.
///
/// Applied identities with no loaded definition are tolerated and left
/// alone when applying. A rollback that would need to execute them is fatal
/// unless `force` is set, in which case they are skipped with a warning.
/// A `target` identity not present in the set is always fatal.
pub fn resolve<'a>(
    set: &'a MigrationSet,
    applied: &[String],
    op: Operation,
    target: Option<&str>,
    force: bool,
) -> Result<Plan<'a>, Error> {
    let migrations = set.migrations();
    let graph = DependencyGraph::new(migrations)?;
    let order = graph.topo_order()?;

    let applied_ids: HashSet<&str> = applied.iter().map(String::as_str).collect();
    let is_applied = |ix: usize| applied_ids.contains(migrations[ix].id());

    for id in applied {
        if graph.index_of(id).is_none() {
            match op {
                Operation::Apply | Operation::Mark => {
                    tracing::debug!(
                        migration = %id,
                        "applied migration has no loaded definition; leaving it alone"
                    );
                }
                Operation::Rollback | Operation::Reapply | Operation::Unmark
                    if target.is_none() =>
                {
                    if !force {
                        return Err(Error::MissingSource(id.clone()));
                    }
                    tracing::warn!(
                        migration = %id,
                        "applied migration has no loaded definition; skipping (forced)"
                    );
                }
                _ => {}
            }
        }
    }

    let target_ix = match target {
        Some(t) => match graph.index_of(t) {
            Some(ix) => Some(ix),
            None => {
                // The target may be recorded as applied without a definition;
                // refuse to touch it either way.
                if applied_ids.contains(t) {
                    return Err(Error::MissingSource(t.to_string()));
                }
                return Err(Error::UnknownMigration(t.to_string()));
            }
        },
        None => None,
    };

    // The set an operation is restricted to: the target plus its transitive
    // closure (ancestors when moving forward, descendants when backward).
    let forward_scope = target_ix.map(|ix| {
        let mut scope = graph.ancestors(ix);
        scope.insert(ix);
        scope
    });
    let backward_scope = target_ix.map(|ix| {
        let mut scope = graph.descendants(ix);
        scope.insert(ix);
        scope
    });

    let forward_selection: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&ix| !is_applied(ix))
        .filter(|ix| forward_scope.as_ref().map_or(true, |s| s.contains(ix)))
        .collect();
    let backward_selection: Vec<usize> = order
        .iter()
        .rev()
        .copied()
        .filter(|&ix| is_applied(ix))
        .filter(|ix| backward_scope.as_ref().map_or(true, |s| s.contains(ix)))
        .collect();

    let entry = |ix: usize, direction: Direction, mark_only: bool| PlanEntry {
        migration: &migrations[ix],
        direction,
        mark_only,
    };

    let entries = match op {
        Operation::Apply => forward_selection
            .iter()
            .map(|&ix| entry(ix, Direction::Forward, false))
            .collect(),
        Operation::Rollback => backward_selection
            .iter()
            .map(|&ix| entry(ix, Direction::Backward, false))
            .collect(),
        Operation::Reapply => {
            // Roll the restricted set back, then apply it again in forward
            // order. The selection is the applied subset in both phases.
            let mut entries: Vec<PlanEntry> = backward_selection
                .iter()
                .map(|&ix| entry(ix, Direction::Backward, false))
                .collect();
            let rolled_back: HashSet<usize> = backward_selection.iter().copied().collect();
            entries.extend(
                order
                    .iter()
                    .copied()
                    .filter(|ix| rolled_back.contains(ix))
                    .map(|ix| entry(ix, Direction::Forward, false)),
            );
            entries
        }
        Operation::Mark => forward_selection
            .iter()
            .map(|&ix| entry(ix, Direction::Forward, true))
            .collect(),
        Operation::Unmark => backward_selection
            .iter()
            .map(|&ix| entry(ix, Direction::Backward, true))
            .collect(),
    };

    Ok(Plan { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration;

    fn diamond() -> MigrationSet {
        MigrationSet::from_migrations(vec![
            Migration::new("a"),
            Migration::new("b").with_dependencies(["a"]),
            Migration::new("c").with_dependencies(["a"]),
            Migration::new("d").with_dependencies(["b", "c"]),
        ])
        .unwrap()
    }

    fn applied(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn plan_ids(plan: &Plan) -> Vec<(String, Direction)> {
        plan.entries
            .iter()
            .map(|e| (e.migration.id().to_string(), e.direction))
            .collect()
    }

    #[test]
    fn apply_selects_unapplied_in_forward_order() {
        let set = diamond();
        let plan = resolve(&set, &applied(&["a"]), Operation::Apply, None, false).unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![
                ("b".to_string(), Direction::Forward),
                ("c".to_string(), Direction::Forward),
                ("d".to_string(), Direction::Forward),
            ]
        );
    }

    #[test]
    fn apply_with_target_restricts_to_ancestors() {
        let set = diamond();
        let plan = resolve(&set, &[], Operation::Apply, Some("b"), false).unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![
                ("a".to_string(), Direction::Forward),
                ("b".to_string(), Direction::Forward),
            ]
        );
    }

    #[test]
    fn apply_is_empty_when_everything_is_applied() {
        let set = diamond();
        let plan = resolve(
            &set,
            &applied(&["a", "b", "c", "d"]),
            Operation::Apply,
            None,
            false,
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn rollback_selects_applied_in_reverse_order() {
        let set = diamond();
        let plan = resolve(
            &set,
            &applied(&["a", "b", "c", "d"]),
            Operation::Rollback,
            None,
            false,
        )
        .unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![
                ("d".to_string(), Direction::Backward),
                ("c".to_string(), Direction::Backward),
                ("b".to_string(), Direction::Backward),
                ("a".to_string(), Direction::Backward),
            ]
        );
    }

    #[test]
    fn rollback_with_target_includes_applied_descendants() {
        let set = diamond();
        let plan = resolve(
            &set,
            &applied(&["a", "b", "d"]),
            Operation::Rollback,
            Some("b"),
            false,
        )
        .unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![
                ("d".to_string(), Direction::Backward),
                ("b".to_string(), Direction::Backward),
            ]
        );
    }

    #[test]
    fn reapply_composes_backward_then_forward() {
        let set = diamond();
        let plan = resolve(
            &set,
            &applied(&["a", "b"]),
            Operation::Reapply,
            Some("b"),
            false,
        )
        .unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![
                ("b".to_string(), Direction::Backward),
                ("b".to_string(), Direction::Forward),
            ]
        );
    }

    #[test]
    fn mark_and_unmark_carry_the_sentinel() {
        let set = diamond();
        let plan = resolve(&set, &[], Operation::Mark, Some("a"), false).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.entries[0].mark_only);

        let plan = resolve(&set, &applied(&["a"]), Operation::Unmark, None, false).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.entries[0].mark_only);
        assert_eq!(plan.entries[0].direction, Direction::Backward);
    }

    #[test]
    fn unknown_applied_is_tolerated_on_apply() {
        let set = diamond();
        let plan = resolve(&set, &applied(&["099"]), Operation::Apply, None, false).unwrap();
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn unknown_applied_is_fatal_on_rollback_unless_forced() {
        let set = diamond();
        let err = resolve(
            &set,
            &applied(&["a", "099"]),
            Operation::Rollback,
            None,
            false,
        )
        .unwrap_err();
        assert_eq!(err, Error::MissingSource("099".to_string()));

        let plan = resolve(
            &set,
            &applied(&["a", "099"]),
            Operation::Rollback,
            None,
            true,
        )
        .unwrap();
        assert_eq!(
            plan_ids(&plan),
            vec![("a".to_string(), Direction::Backward)]
        );
    }

    #[test]
    fn rollback_targeting_an_unknown_applied_migration_is_fatal() {
        let set = diamond();
        let err = resolve(
            &set,
            &applied(&["099"]),
            Operation::Rollback,
            Some("099"),
            false,
        )
        .unwrap_err();
        assert_eq!(err, Error::MissingSource("099".to_string()));
    }

    #[test]
    fn unknown_target_is_fatal() {
        let set = diamond();
        let err = resolve(&set, &[], Operation::Apply, Some("zzz"), false).unwrap_err();
        assert_eq!(err, Error::UnknownMigration("zzz".to_string()));
    }

    #[test]
    fn apply_plan_satisfies_dependency_preconditions() {
        // Invariant: every dependency of a planned migration appears earlier
        // in the plan or is already applied.
        let set = diamond();
        let already = applied(&["a"]);
        let plan = resolve(&set, &already, Operation::Apply, None, false).unwrap();
        let mut seen: Vec<&str> = already.iter().map(String::as_str).collect();
        for e in &plan.entries {
            for dep in e.migration.depends() {
                assert!(seen.contains(&dep.as_str()), "{} before its dep {}", e.migration.id(), dep);
            }
            seen.push(e.migration.id());
        }
    }
}
