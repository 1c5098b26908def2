//! Dependency graph over a set of migrations.
//!
//! Migrations are stored in an arena (the slice held by
//! [`MigrationSet`](crate::MigrationSet)); dependency identities are
//! resolved once into indices when the graph is built, so traversal never
//! touches strings again.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::Error;
use crate::migration::Migration;

#[derive(Debug)]
pub(crate) struct DependencyGraph<'a> {
    migrations: &'a [Migration],
    index: HashMap<&'a str, usize>,
    /// For each migration, the indices it depends on.
    depends: Vec<Vec<usize>>,
    /// For each migration, the indices that depend on it.
    dependents: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Resolve dependency identities into indices. A dependency naming an
    /// identity outside `migrations` is fatal.
    pub fn new(migrations: &'a [Migration]) -> Result<Self, Error> {
        let mut index = HashMap::with_capacity(migrations.len());
        for (ix, m) in migrations.iter().enumerate() {
            index.insert(m.id(), ix);
        }

        let mut depends = vec![Vec::new(); migrations.len()];
        let mut dependents = vec![Vec::new(); migrations.len()];
        for (ix, m) in migrations.iter().enumerate() {
            for dep in m.depends() {
                let dep_ix = *index.get(dep.as_str()).ok_or_else(|| Error::UnknownDependency {
                    id: m.id().to_string(),
                    depends: dep.clone(),
                })?;
                depends[ix].push(dep_ix);
                dependents[dep_ix].push(ix);
            }
        }

        Ok(DependencyGraph {
            migrations,
            index,
            depends,
            dependents,
        })
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Topological order of all migrations: dependencies before dependents.
    /// Where two migrations are not ordered relative to each other, the
    /// lexicographically smaller identity comes first.
    pub fn topo_order(&self) -> Result<Vec<usize>, Error> {
        let n = self.migrations.len();
        let mut in_degree: Vec<usize> = self.depends.iter().map(Vec::len).collect();

        // Min-heap on identity keeps the order deterministic.
        let mut ready: BinaryHeap<Reverse<(&str, usize)>> = BinaryHeap::new();
        for ix in 0..n {
            if in_degree[ix] == 0 {
                ready.push(Reverse((self.migrations[ix].id(), ix)));
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, ix))) = ready.pop() {
            order.push(ix);
            for &dep_ix in &self.dependents[ix] {
                in_degree[dep_ix] -= 1;
                if in_degree[dep_ix] == 0 {
                    ready.push(Reverse((self.migrations[dep_ix].id(), dep_ix)));
                }
            }
        }

        if order.len() < n {
            let mut cycle: Vec<&str> = (0..n)
                .filter(|ix| !order.contains(ix))
                .map(|ix| self.migrations[ix].id())
                .collect();
            cycle.sort_unstable();
            return Err(Error::CircularDependencies(cycle.join(", ")));
        }

        Ok(order)
    }

    /// All transitive dependencies of `ix`, not including `ix` itself.
    pub fn ancestors(&self, ix: usize) -> HashSet<usize> {
        self.closure(ix, &self.depends)
    }

    /// All transitive dependents of `ix`, not including `ix` itself.
    pub fn descendants(&self, ix: usize) -> HashSet<usize> {
        self.closure(ix, &self.dependents)
    }

    fn closure(&self, start: usize, edges: &[Vec<usize>]) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut to_process: Vec<usize> = edges[start].clone();
        while let Some(ix) = to_process.pop() {
            if seen.insert(ix) {
                to_process.extend(&edges[ix]);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::Migration;

    fn migrations(specs: &[(&str, &[&str])]) -> Vec<Migration> {
        specs
            .iter()
            .map(|(id, deps)| Migration::new(*id).with_dependencies(deps.iter().copied()))
            .collect()
    }

    fn ids<'a>(ms: &'a [Migration], order: &[usize]) -> Vec<&'a str> {
        order.iter().map(|&ix| ms[ix].id()).collect()
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let ms = migrations(&[("003", &["002"]), ("001", &[]), ("002", &["001"])]);
        let graph = DependencyGraph::new(&ms).unwrap();
        let order = graph.topo_order().unwrap();
        assert_eq!(ids(&ms, &order), vec!["001", "002", "003"]);
    }

    #[test]
    fn diamond_breaks_ties_lexicographically() {
        let ms = migrations(&[
            ("d", &["c", "b"]),
            ("c", &["a"]),
            ("b", &["a"]),
            ("a", &[]),
        ]);
        let graph = DependencyGraph::new(&ms).unwrap();
        let order = graph.topo_order().unwrap();
        assert_eq!(ids(&ms, &order), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unrelated_migrations_sort_by_identity() {
        let ms = migrations(&[("zebra", &[]), ("apple", &[]), ("mango", &[])]);
        let graph = DependencyGraph::new(&ms).unwrap();
        let order = graph.topo_order().unwrap();
        assert_eq!(ids(&ms, &order), vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn cycle_is_fatal_and_reports_members() {
        let ms = migrations(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let graph = DependencyGraph::new(&ms).unwrap();
        match graph.topo_order() {
            Err(Error::CircularDependencies(members)) => {
                assert!(members.contains('a') && members.contains('b'));
                assert!(!members.contains('c'));
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_dependency_is_fatal() {
        let ms = migrations(&[("a", &["nope"])]);
        match DependencyGraph::new(&ms) {
            Err(Error::UnknownDependency { id, depends }) => {
                assert_eq!(id, "a");
                assert_eq!(depends, "nope");
            }
            other => panic!("expected unknown dependency error, got {:?}", other),
        }
    }

    #[test]
    fn ancestors_and_descendants_are_transitive() {
        let ms = migrations(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a"]),
        ]);
        let graph = DependencyGraph::new(&ms).unwrap();
        let c = graph.index_of("c").unwrap();
        let a = graph.index_of("a").unwrap();
        let anc = graph.ancestors(c);
        assert_eq!(anc.len(), 2);
        assert!(anc.contains(&graph.index_of("b").unwrap()));
        assert!(anc.contains(&a));

        let desc = graph.descendants(a);
        assert_eq!(desc.len(), 3);
        assert!(!desc.contains(&a));
    }
}
