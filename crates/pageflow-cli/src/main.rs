mod confirm;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use pageflow_common::Error;
use pageflow_config::{AppConfig, ConfigLoader, LogFormat, LoggingConfig};
use pageflow_db::schema::builtin_registry;
use pageflow_db::{Applier, Ledger, MigrationLock, Registry, SqliteDatabase, source};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Schema migrations for the Pageflow snapshot database
#[derive(Parser, Debug)]
#[command(name = "pageflow", version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.pageflow/config.yml)
    #[arg(short, long, global = true, env = "PAGEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file, overrides the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Directory of migration files, overrides the config. Without one the
    /// builtin Pageflow migrations are used.
    #[arg(long, global = true)]
    migrations: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply all pending migrations, or a single one
    Apply {
        /// Only apply this migration
        id: Option<String>,

        /// List what would be applied without touching the schema
        #[arg(long)]
        dry_run: bool,
    },
    /// Roll back the most recently applied migration
    Rollback {
        /// Migration to roll back; must be the latest applied
        id: Option<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show every known migration and whether it is applied
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Record a migration as applied without running it
    Mark { id: String },
    /// Remove a ledger entry without running its rollback
    Unmark { id: String },
    /// Roll back and re-apply the most recently applied migration
    Reapply {
        id: String,

        #[arg(short, long)]
        yes: bool,
    },
    /// Show recent ledger operations
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Remove a lock left behind by a crashed run
    BreakLock,
    /// Create a new numbered migration file pair in the migrations directory.
    /// Both files start with a `SELECT 1;` placeholder to replace.
    New { name: String },
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let (mut config, loader) = load_config(cli.config.as_deref())?;
    if let Some(path) = cli.database {
        config.database.path = Some(path);
    }
    if let Some(dir) = cli.migrations {
        config.migrations.directory = Some(dir);
    }
    init_logging(&config.logging, cli.verbose);
    debug!(?config, "effective configuration");

    if let Command::New { name } = &cli.command {
        let Some(dir) = config.migrations.directory.as_deref() else {
            bail!("`new` needs a migrations directory (--migrations or migrations.directory)");
        };
        let id = source::scaffold(dir, name)?;
        println!("Created {}", dir.join(format!("{id}.sql")).display());
        return Ok(());
    }

    let registry = load_registry(&config)?;
    let db_path = config
        .database
        .path
        .clone()
        .unwrap_or_else(|| loader.default_database_path());
    let db = SqliteDatabase::open_with_timeout(
        &db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )
    .with_context(|| format!("failed to open {}", db_path.display()))?;

    let applier = Applier::new(&db, &registry)
        .with_ledger(Ledger::new(
            config.migrations.ledger_table.as_str(),
            config.migrations.log_table.as_str(),
        ))
        .with_lock(MigrationLock::new(config.migrations.lock_table.as_str()));

    match cli.command {
        Command::Apply { id: None, dry_run: true } => {
            let pending = applier.pending()?;
            if pending.is_empty() {
                println!("Nothing to apply, database is up to date.");
            }
            for migration in pending {
                println!("  would apply  {}", migration.id());
            }
        }
        Command::Apply { id: None, dry_run: false } => {
            let report = applier.apply_pending().context("migration run failed")?;
            print!("{}", report::render_apply(&report));
        }
        Command::Apply { id: Some(id), dry_run } => {
            if dry_run {
                println!("  would apply  {id}");
                return Ok(());
            }
            match applier.apply(&id) {
                Ok(count) => println!("Applied {id} ({count} statements)."),
                Err(Error::AlreadyApplied(id)) => {
                    warn!(migration = id.as_str(), "already applied");
                    println!("{id} is already applied, nothing to do.");
                }
                Err(e) => return Err(e).context(format!("failed to apply {id}")),
            }
        }
        Command::Rollback { id, yes } => {
            applier.ledger().ensure(&db)?;
            let target = match id {
                Some(id) => id,
                None => applier
                    .ledger()
                    .latest(&db)?
                    .map(|entry| entry.migration_id)
                    .ok_or(Error::NothingToRollback)?,
            };
            if !confirm::confirm(&format!("roll back {target}"), yes)? {
                println!("Rollback cancelled.");
                return Ok(());
            }
            applier
                .rollback(&target)
                .with_context(|| format!("failed to roll back {target}"))?;
            println!("Rolled back {target}.");
        }
        Command::Status { json } => {
            let statuses = applier.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print!("{}", report::render_status(&statuses));
            }
        }
        Command::Mark { id } => match applier.mark(&id) {
            Ok(()) => println!("Marked {id} as applied."),
            Err(Error::AlreadyApplied(id)) => println!("{id} is already applied, nothing to do."),
            Err(e) => return Err(e).context(format!("failed to mark {id}")),
        },
        Command::Unmark { id } => {
            applier
                .unmark(&id)
                .with_context(|| format!("failed to unmark {id}"))?;
            println!("Unmarked {id}.");
        }
        Command::Reapply { id, yes } => {
            if !confirm::confirm(&format!("roll back and re-apply {id}"), yes)? {
                println!("Reapply cancelled.");
                return Ok(());
            }
            let count = applier
                .reapply(&id)
                .with_context(|| format!("failed to reapply {id}"))?;
            println!("Reapplied {id} ({count} statements).");
        }
        Command::History { limit } => {
            applier.ledger().ensure(&db)?;
            let entries = applier.ledger().history(&db, limit)?;
            print!("{}", report::render_history(&entries));
        }
        Command::BreakLock => {
            if applier.lock().break_lock(&db)? {
                println!("Lock removed.");
            } else {
                println!("No lock was held.");
            }
        }
        Command::New { .. } => unreachable!("handled before opening the database"),
    }

    Ok(())
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<(AppConfig, ConfigLoader)> {
    match explicit {
        Some(path) => {
            let config = ConfigLoader::load_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            Ok((config, ConfigLoader::new(dir)))
        }
        None => {
            let loader = ConfigLoader::new(ConfigLoader::default_dir());
            let config = loader.load()?;
            Ok((config, loader))
        }
    }
}

fn load_registry(config: &AppConfig) -> Result<Registry> {
    match config.migrations.directory.as_deref() {
        Some(dir) => {
            let registry = source::load_dir(dir)?;
            if registry.is_empty() {
                warn!("no migrations found in {}", dir.display());
            }
            Ok(registry)
        }
        None => Ok(builtin_registry()?),
    }
}

fn init_logging(logging: &LoggingConfig, verbose: u8) {
    let level = match verbose {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
