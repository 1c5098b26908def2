//! Command-line front-end for ordino database migrations.
//!
//! A thin adapter over the library façade: it loads the configuration
//! file, reads migration sources, connects the backend and hands a plan to
//! the executor. Exit code 0 on success, non-zero on any fatal error.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use clap::{ArgAction, Args, Parser, Subcommand};

use ordino::config::{find_config, read_config, Config};
use ordino::sources::TMPFILE_PREFIX;
use ordino::{
    get_backend, parse_uri, read_migrations, Backend, BackendExt, Decision, Direction, Executor,
    Migration, MigrationReport, MigrationSet,
};

#[derive(Parser)]
#[command(name = "ordino")]
#[command(version, about = "Database schema migrations with dependency ordering")]
struct Cli {
    /// Path to the config file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Don't read any config file
    #[arg(long, global = true)]
    no_config_file: bool,

    /// Verbose output; use multiple times to increase the level
    #[arg(short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Run in batch mode, turning off all user prompts
    #[arg(short = 'b', long = "batch", global = true)]
    batch: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct MigrationArgs {
    /// Source directories of migration scripts
    sources: Vec<String>,

    /// Database URI, eg 'sqlite:///app.db' or 'postgresql://user@host/db'
    #[arg(short = 'd', long)]
    database: Option<String>,

    /// Select a target revision and its transitive closure
    #[arg(short = 'r', long)]
    revision: Option<String>,

    /// Force operations past errors and missing migration sources
    #[arg(short = 'f', long)]
    force: bool,

    /// Prompt for the database password
    #[arg(short = 'p', long)]
    prompt_password: bool,

    /// Name of the table used for storing migration metadata
    #[arg(long)]
    migration_table: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new migration file
    New {
        #[command(flatten)]
        args: MigrationArgs,
        /// A short description of the migration
        #[arg(short = 'm', long)]
        message: Option<String>,
    },
    /// Apply migrations
    Apply(MigrationArgs),
    /// Rollback migrations
    Rollback(MigrationArgs),
    /// Rollback then reapply migrations
    Reapply(MigrationArgs),
    /// Record migrations as applied without running them
    Mark(MigrationArgs),
    /// Remove migrations from the applied record without running them
    Unmark(MigrationArgs),
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    init_logging(&cli, &config);

    let batch = cli.batch || config.batch_mode;
    match &cli.command {
        Command::New { args, message } => new_migration(args, message.as_deref(), &config, batch),
        Command::Apply(args) => run_operation(OperationKind::Apply, args, &config, batch),
        Command::Rollback(args) => run_operation(OperationKind::Rollback, args, &config, batch),
        Command::Reapply(args) => run_operation(OperationKind::Reapply, args, &config, batch),
        Command::Mark(args) => run_operation(OperationKind::Mark, args, &config, batch),
        Command::Unmark(args) => run_operation(OperationKind::Unmark, args, &config, batch),
    }
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    if cli.no_config_file {
        return Ok(Config::default());
    }
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => find_config(),
    };
    match path {
        Some(path) => Ok(read_config(&path)?),
        None => Ok(Config::default()),
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    let verbosity = config.verbosity.max(cli.verbose).min(3);
    let level = match verbosity {
        0 => tracing::Level::ERROR,
        1 => tracing::Level::WARN,
        2 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

enum OperationKind {
    Apply,
    Rollback,
    Reapply,
    Mark,
    Unmark,
}

fn sources_for(args: &MigrationArgs, config: &Config) -> Result<Vec<String>, String> {
    let sources = if args.sources.is_empty() {
        config.sources.clone()
    } else {
        args.sources.clone()
    };
    if sources.is_empty() {
        return Err(
            "no migration sources given; pass a directory or set 'sources' in ordino.ini"
                .to_string(),
        );
    }
    Ok(sources)
}

fn database_for(args: &MigrationArgs, config: &Config) -> Result<String, String> {
    let database = args
        .database
        .clone()
        .or_else(|| config.database.clone())
        .ok_or_else(|| {
            "no database given; pass --database or set 'database' in ordino.ini".to_string()
        })?;
    if args.prompt_password {
        let parsed = parse_uri(&database).map_err(|e| e.to_string())?;
        eprint!("Password for {}: ", parsed);
        std::io::stderr().flush().ok();
        let mut password = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut password)
            .map_err(|e| e.to_string())?;
        let password = password.trim_end_matches(['\r', '\n']);
        return Ok(parsed.with_password(password).uri());
    }
    Ok(database)
}

fn run_operation(
    op: OperationKind,
    args: &MigrationArgs,
    config: &Config,
    batch: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let sources = sources_for(args, config)?;
    let database = database_for(args, config)?;
    let migration_table = args
        .migration_table
        .clone()
        .unwrap_or_else(|| config.migration_table.clone());

    let set = read_migrations(&sources)?;
    let mut backend = get_backend(&database, &migration_table)?;

    let mut executor = Executor::new().force(args.force);
    if !batch {
        executor = executor.interactive(confirm_prompt);
    }

    let revision = args.revision.as_deref();
    let report = match op {
        OperationKind::Apply => backend.apply_migrations(&set, revision, &executor)?,
        OperationKind::Rollback => backend.rollback_migrations(&set, revision, &executor)?,
        OperationKind::Reapply => backend.reapply_migrations(&set, revision, &executor)?,
        OperationKind::Mark => backend.mark_migrations(&set, revision, &executor)?,
        OperationKind::Unmark => backend.unmark_migrations(&set, revision, &executor)?,
    };

    print_report(&report, backend.as_ref());
    Ok(if report.is_success() { 0 } else { 1 })
}

fn print_report(report: &MigrationReport, backend: &dyn Backend) {
    let summarize = |verb: &str, ids: &[String]| {
        if !ids.is_empty() {
            println!("{} {} migration(s): {}", verb, ids.len(), ids.join(", "));
        }
    };
    summarize("applied", &report.applied);
    summarize("rolled back", &report.rolled_back);
    summarize("marked", &report.marked);
    summarize("unmarked", &report.unmarked);
    summarize("skipped", &report.skipped);
    if report.post_apply_ran {
        println!("ran post-apply hook(s)");
    }
    if report.applied.is_empty()
        && report.rolled_back.is_empty()
        && report.marked.is_empty()
        && report.unmarked.is_empty()
        && report.failure.is_none()
    {
        println!("nothing to do");
    }

    if let Some(failure) = &report.failure {
        eprintln!(
            "error: {} failed for migration {}",
            failure.direction, failure.id
        );
        eprintln!("{}", failure.error);
        if !backend.transactional_ddl() && failure.steps_completed > 0 {
            eprintln!(
                "note: {} step(s) had run and may have been committed before the \
                 failure; best-effort recovery was attempted",
                failure.steps_completed
            );
        }
    }
}

/// Interactive confirmation, one migration at a time.
fn confirm_prompt(migration: &Migration, direction: Direction) -> Decision {
    let stdin = std::io::stdin();
    loop {
        println!();
        println!("[{}]", migration.id());
        print!("Shall I {} this migration? [Ynaqv?]: ", direction.verb());
        std::io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() {
            return Decision::Quit;
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "" | "y" => return Decision::Yes,
            "n" => return Decision::No,
            "a" => return Decision::All,
            "q" => return Decision::Quit,
            "v" => {
                match migration.source() {
                    Some(source) => println!("{}", source),
                    None => println!("(no source file; defined in code)"),
                }
            }
            _ => {
                println!("y: {} this migration", direction.verb());
                println!("n: don't {} it", direction.verb());
                println!("a: {} all the remaining migrations", direction.verb());
                println!("q: cancel without making any further changes");
                println!("v: view this migration in full");
            }
        }
    }
}

fn new_migration(
    args: &MigrationArgs,
    message: Option<&str>,
    config: &Config,
    batch: bool,
) -> Result<i32, Box<dyn std::error::Error>> {
    let sources = sources_for(args, config)?;
    let dir = PathBuf::from(&sources[0]);
    let set = read_migrations(&sources)?;

    let id = format!("{:04}-{}", next_sequence(&set), slugify(message));
    let mut contents = String::new();
    if let Some(message) = message {
        contents.push_str(&format!("-- {}\n", message));
    }
    let heads = set.heads();
    if !heads.is_empty() {
        contents.push_str(&format!("-- depends: {}\n", heads.join(" ")));
    }
    contents.push('\n');

    // Write to a temporary name first so a half-edited file is never picked
    // up by source discovery.
    let tmp_path = dir.join(format!("{}{}.sql", TMPFILE_PREFIX, id));
    std::fs::write(&tmp_path, &contents)?;

    if !batch {
        if let Err(e) = open_editor(&tmp_path, config) {
            tracing::warn!("could not open editor: {}", e);
        }
    }

    let path = dir.join(format!("{}.sql", id));
    std::fs::rename(&tmp_path, &path)?;
    std::fs::write(dir.join(format!("{}.rollback.sql", id)), "")?;
    println!("created {}", path.display());

    if let Some(command) = &config.post_create_command {
        let command = command.replace("{}", &path.display().to_string());
        let status = ProcessCommand::new("sh").arg("-c").arg(&command).status()?;
        if !status.success() {
            tracing::warn!(%command, "post_create_command exited with failure");
        }
    }

    Ok(0)
}

/// The next free numeric prefix across the loaded migrations.
fn next_sequence(set: &MigrationSet) -> u32 {
    set.migrations()
        .iter()
        .filter_map(|m| {
            let prefix = m.id().split('-').next()?;
            prefix.parse::<u32>().ok()
        })
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

fn slugify(message: Option<&str>) -> String {
    let slug: String = message
        .unwrap_or("migration")
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug
    }
}

fn open_editor(path: &Path, config: &Config) -> Result<(), std::io::Error> {
    let editor = config
        .editor
        .clone()
        .or_else(|| std::env::var("EDITOR").ok())
        .unwrap_or_else(|| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");
    ProcessCommand::new(program)
        .args(parts)
        .arg(path)
        .status()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_squashes_punctuation() {
        assert_eq!(slugify(Some("Add users table!")), "add-users-table");
        assert_eq!(slugify(None), "migration");
        assert_eq!(slugify(Some("---")), "migration");
    }

    #[test]
    fn next_sequence_counts_past_the_highest_prefix() {
        let set = MigrationSet::from_migrations(vec![
            Migration::new("0001-a"),
            Migration::new("0007-b"),
            Migration::new("unnumbered"),
        ])
        .unwrap();
        assert_eq!(next_sequence(&set), 8);

        assert_eq!(next_sequence(&MigrationSet::new()), 1);
    }

    #[test]
    fn cli_parses_subcommands_and_globals() {
        let cli = Cli::parse_from([
            "ordino",
            "-b",
            "apply",
            "migrations",
            "--database",
            "sqlite:///app.db",
            "-r",
            "0002-add-email",
        ]);
        assert!(cli.batch);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.sources, vec!["migrations"]);
                assert_eq!(args.database.as_deref(), Some("sqlite:///app.db"));
                assert_eq!(args.revision.as_deref(), Some("0002-add-email"));
            }
            _ => panic!("expected apply"),
        }
    }
}
