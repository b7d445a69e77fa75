// Employee Sync - CLI
// Import CSV files, sweep pending notifications, inspect jobs and history.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use employee_sync::record::digits_only;
use employee_sync::{logging, Owner, Pipeline, PipelineConfig, RepositoryError};

/// Exit status of `sweep` when there is nothing to notify
const EXIT_NOTHING_TO_NOTIFY: u8 = 2;

#[derive(Parser)]
#[command(name = "employee-sync", version, about = "CSV employee reconciliation and owner notifications")]
struct Cli {
    /// TOML configuration file (falls back to $EMPLOYEE_SYNC_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema and storage directory
    Init,

    /// Import a CSV file of employees for one owner
    Import {
        file: PathBuf,

        #[arg(long)]
        owner: i64,

        /// Print the full outcome report (row errors included)
        #[arg(long)]
        wait: bool,
    },

    /// Notify owners about dirty records updated in the last window
    Sweep {
        #[arg(long)]
        owner: Option<i64>,
    },

    /// Show the status of an import job
    Status { job_id: String },

    /// Show the audit trail of one employee document
    History { document: String },

    /// Manage notification owners
    Owner {
        #[command(subcommand)]
        command: OwnerCommand,
    },
}

#[derive(Subcommand)]
enum OwnerCommand {
    /// Add or update an owner contact
    Add { id: i64, name: String, email: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.log_level);

    let pipeline = Pipeline::open(config).context("Failed to open pipeline storage")?;

    match cli.command {
        Command::Init => run_init(&pipeline),
        Command::Import { file, owner, wait } => run_import(&pipeline, file, owner, wait).await,
        Command::Sweep { owner } => run_sweep(&pipeline, owner),
        Command::Status { job_id } => run_status(&pipeline, &job_id),
        Command::History { document } => run_history(&pipeline, &document),
        Command::Owner {
            command: OwnerCommand::Add { id, name, email },
        } => run_owner_add(&pipeline, id, name, email),
    }
}

fn run_init(pipeline: &Pipeline) -> Result<ExitCode> {
    println!("🗄️  Employee Sync - storage ready");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✓ Database: {} (WAL mode)", pipeline.config.database_path.display());
    println!("✓ Storage:  {}", pipeline.config.storage_dir.display());
    println!("✓ Employees on file: {}", pipeline.repo.count()?);
    Ok(ExitCode::SUCCESS)
}

async fn run_import(pipeline: &Pipeline, file: PathBuf, owner: i64, wait: bool) -> Result<ExitCode> {
    println!("📂 Importing {} for owner {}", file.display(), owner);

    let source = File::open(&file).with_context(|| format!("Failed to open {}", file.display()))?;

    let queue = pipeline.queue()?;
    let uploads = pipeline.uploads(queue.clone());
    let job_id = uploads.accept(source, owner).context("Failed to enqueue import")?;
    println!("✓ Job {} scheduled", job_id);

    // This process hosts the worker, so it stays until the job is terminal
    let result = queue.wait(&job_id).await;

    if !wait {
        println!("   Run: employee-sync status {}", job_id);
        return Ok(if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }

    match result {
        Ok(outcome) => {
            println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("✅ Processed: {}", outcome.processed);
            println!("   Created:   {}", outcome.created);
            println!("   Updated:   {}", outcome.updated);
            println!("   Unchanged: {}", outcome.unchanged);
            println!("   Failed:    {}", outcome.failed);
            println!("   Notified:  {} owner(s)", outcome.notifications.notifications_sent);
            for row_error in &outcome.errors {
                let messages: Vec<String> = row_error.errors.iter().map(ToString::to_string).collect();
                println!("   ❌ row {}: {}", row_error.row, messages.join("; "));
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("❌ Import failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_sweep(pipeline: &Pipeline, owner: Option<i64>) -> Result<ExitCode> {
    let window = pipeline.config.notifications.dirty_window();

    match pipeline.dispatcher.sweep_strict(owner, window) {
        Ok(report) => {
            println!("📬 Notifications sent: {}", report.notifications_sent);
            println!("   Records cleared:    {}", report.records_cleared);
            if report.records_pending > 0 {
                println!("   ⚠️  Still pending:   {} (owners {:?})", report.records_pending, report.failed_owners);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(RepositoryError::NotFound(message)) => {
            eprintln!("ℹ️  {}", message);
            Ok(ExitCode::from(EXIT_NOTHING_TO_NOTIFY))
        }
        Err(e) => Err(e).context("Notification sweep failed"),
    }
}

fn run_status(pipeline: &Pipeline, job_id: &str) -> Result<ExitCode> {
    match pipeline.jobs.status(job_id)? {
        Some(status) => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("❌ Unknown job {}", job_id);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_history(pipeline: &Pipeline, document: &str) -> Result<ExitCode> {
    let key = digits_only(document);
    let events = pipeline.repo.events_for(&key)?;

    if events.is_empty() {
        println!("No history for {}", key);
        return Ok(ExitCode::SUCCESS);
    }

    for event in events {
        println!(
            "{}  {:<17} {}  {}",
            employee_sync::record::format_timestamp(event.timestamp),
            event.event_type,
            event.actor,
            event.data["changed_fields"]
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_owner_add(pipeline: &Pipeline, id: i64, name: String, email: String) -> Result<ExitCode> {
    let owner = Owner { id, name, email };
    let conn = employee_sync::db::lock(&pipeline.db)?;
    employee_sync::upsert_owner(&conn, &owner)?;
    println!("✓ Owner {} <{}> saved", owner.id, owner.email);
    Ok(ExitCode::SUCCESS)
}
