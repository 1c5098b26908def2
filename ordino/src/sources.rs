//! Migration source discovery.
//!
//! A migration source directory contains SQL migration files:
//!
//! - `<id>.sql` — the apply statements. The file stem is the migration's
//!   identity.
//! - `<id>.rollback.sql` — optional rollback statements.
//!
//! A leading comment block may declare dependencies and a free-form
//! message:
//!
//! ```sql
//! -- add the accounts table
//! -- depends: 0001-create-users 0002-create-groups
//! CREATE TABLE accounts (id INTEGER PRIMARY KEY);
//! ```
//!
//! Each file pair yields a migration with a single SQL step; the engine
//! never parses or validates the SQL itself. Files whose stem starts with
//! `post-apply` load as post-apply hooks. Migrations that need callable or
//! group steps are registered in code through the
//! [Migration](crate::Migration) builder instead.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::migration::{Migration, MigrationSet, Step};

/// Files created by `new` before they are named; skipped during discovery.
pub const TMPFILE_PREFIX: &str = ".tmp-";

const ROLLBACK_SUFFIX: &str = ".rollback.sql";

/// Read every migration from the given source directories into a single
/// set. Identity collisions across directories are a hard error.
pub fn read_migrations<P: AsRef<Path>>(paths: &[P]) -> Result<MigrationSet, Error> {
    let mut set = MigrationSet::new();
    for dir in paths {
        let dir = dir.as_ref();
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| Error::BadMigration {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_migration_file(path))
            .collect();
        entries.sort();

        for path in entries {
            let migration = load_sql_migration(&path)?;
            set.push(migration)?;
        }
    }
    Ok(set)
}

fn is_migration_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".sql") && !name.ends_with(ROLLBACK_SUFFIX) && !name.starts_with(TMPFILE_PREFIX)
}

fn load_sql_migration(path: &Path) -> Result<Migration, Error> {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::BadMigration {
            path: path.display().to_string(),
            reason: "file name is not valid UTF-8".to_string(),
        })?
        .to_string();

    let source = fs::read_to_string(path).map_err(|e| Error::BadMigration {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let depends = parse_depends(&source);

    let rollback_path = path.with_file_name(format!("{}{}", id, ROLLBACK_SUFFIX));
    let rollback = match fs::read_to_string(&rollback_path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(Error::BadMigration {
                path: rollback_path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    let step = match rollback {
        Some(rollback) => Step::sql_with_rollback(source.clone(), rollback),
        None => Step::sql(source.clone()),
    };

    Ok(Migration::new(id)
        .with_dependencies(depends)
        .with_step(step)
        .with_path(path.to_path_buf())
        .with_source(source))
}

/// Extract dependency identities from the leading comment block.
fn parse_depends(source: &str) -> Vec<String> {
    let mut depends = Vec::new();
    for line in source.lines() {
        let Some(comment) = line.trim().strip_prefix("--") else {
            break;
        };
        if let Some(list) = comment.trim().strip_prefix("depends:") {
            depends.extend(list.split_whitespace().map(str::to_string));
        }
    }
    depends
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::StepBody;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn reads_migrations_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "0002-b.sql", "CREATE TABLE b (id INTEGER);");
        write_file(dir.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        let set = read_migrations(&[dir.path()]).unwrap();
        let ids: Vec<&str> = set.migrations().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["0001-a", "0002-b"]);
    }

    #[test]
    fn parses_the_depends_header() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "0002-b.sql",
            "-- add table b\n-- depends: 0001-a 0000-base\nCREATE TABLE b (id INTEGER);",
        );
        write_file(dir.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        write_file(dir.path(), "0000-base.sql", "CREATE TABLE base (id INTEGER);");
        let set = read_migrations(&[dir.path()]).unwrap();
        let b = set.get("0002-b").unwrap();
        assert_eq!(b.depends(), ["0001-a", "0000-base"]);
    }

    #[test]
    fn depends_header_stops_at_the_first_non_comment_line() {
        let depends = parse_depends("CREATE TABLE a (id INTEGER);\n-- depends: nope");
        assert!(depends.is_empty());
    }

    #[test]
    fn pairs_the_rollback_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        write_file(dir.path(), "0001-a.rollback.sql", "DROP TABLE a;");
        let set = read_migrations(&[dir.path()]).unwrap();
        let m = set.get("0001-a").unwrap();
        assert_eq!(m.steps().len(), 1);
        match m.steps()[0].body() {
            StepBody::Sql { rollback, .. } => {
                assert_eq!(rollback.as_deref(), Some("DROP TABLE a;"));
            }
            other => panic!("expected SQL step, got {:?}", other),
        }
    }

    #[test]
    fn post_apply_files_are_segregated() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        write_file(dir.path(), "post-apply.sql", "SELECT 1;");
        let set = read_migrations(&[dir.path()]).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.post_apply().len(), 1);
    }

    #[test]
    fn temporary_and_non_sql_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        write_file(dir.path(), ".tmp-0002.sql", "CREATE TABLE b (id INTEGER);");
        write_file(dir.path(), "README.md", "not a migration");
        let set = read_migrations(&[dir.path()]).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn conflicts_across_directories_are_fatal() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        write_file(dir_a.path(), "0001-a.sql", "CREATE TABLE a (id INTEGER);");
        write_file(dir_b.path(), "0001-a.sql", "CREATE TABLE a2 (id INTEGER);");
        let err = read_migrations(&[dir_a.path(), dir_b.path()]).unwrap_err();
        assert_eq!(err, Error::MigrationConflict("0001-a".to_string()));
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(read_migrations(&[Path::new("/nonexistent/migrations")]).is_err());
    }
}
