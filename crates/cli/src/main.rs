mod export;
mod serve;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cohort_core::{ExperimentStorage, LifecycleEngine, Settings, StorageLocation};
use cohort_storage::{MemoryStorage, SqliteStorage};

/// Cohort experiment server.
#[derive(Parser)]
#[command(
    name = "cohort",
    version,
    about = "Participant lifecycle server for online experiments"
)]
struct Cli {
    /// Settings file (TOML), the place for admin credentials. Defaults to
    /// ./cohort.toml when that file exists. Environment variables override
    /// its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the reclamation sweeper
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,
        /// Built experiment bundle to serve under /exp
        #[arg(long)]
        frontend_dir: Option<PathBuf>,
    },

    /// Run one reclamation sweep and print the workers that timed out
    Sweep,

    /// Create the database tables if they are missing
    CreateTables,

    /// Drop the database tables and everything in them
    DropTables,

    /// Drop and recreate the database tables
    ResetDb,

    /// Write participant.csv and data.csv
    Export {
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Flatten every submission's trials into trials.csv
    ExtractTrials {
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

type CliResult = Result<(), Box<dyn Error>>;

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli.command, settings)) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(command: Commands, settings: Settings) -> CliResult {
    let location = settings.storage_location()?;
    let job = match command {
        Commands::CreateTables => return schema_command(&location, SchemaAction::Create).await,
        Commands::DropTables => return schema_command(&location, SchemaAction::Drop).await,
        Commands::ResetDb => return schema_command(&location, SchemaAction::Reset).await,
        Commands::Serve {
            host,
            port,
            frontend_dir,
        } => Job::Serve {
            host,
            port,
            frontend_dir,
        },
        Commands::Sweep => Job::Sweep,
        Commands::Export { out } => Job::Export(out),
        Commands::ExtractTrials { out } => Job::ExtractTrials(out),
    };

    match location {
        StorageLocation::Memory => {
            tracing::warn!("using in-memory storage, nothing will be persisted");
            run_job(job, Arc::new(MemoryStorage::new()), settings).await
        }
        StorageLocation::Sqlite(path) => {
            let storage = SqliteStorage::open(&path)?;
            tracing::info!(path = %path.display(), "opened sqlite database");
            run_job(job, Arc::new(storage), settings).await
        }
    }
}

/// Commands that need a lifecycle engine over an open store.
enum Job {
    Serve {
        host: String,
        port: u16,
        frontend_dir: Option<PathBuf>,
    },
    Sweep,
    Export(PathBuf),
    ExtractTrials(PathBuf),
}

async fn run_job<S: ExperimentStorage>(job: Job, storage: Arc<S>, settings: Settings) -> CliResult {
    let engine = LifecycleEngine::new(storage, Arc::new(settings));
    match job {
        Job::Serve {
            host,
            port,
            frontend_dir,
        } => serve::start_server(engine, &host, port, frontend_dir).await,
        Job::Sweep => cmd_sweep(&engine).await,
        Job::Export(out) => cmd_export(&engine, &out).await,
        Job::ExtractTrials(out) => cmd_extract_trials(&engine, &out).await,
    }
}

enum SchemaAction {
    Create,
    Drop,
    Reset,
}

async fn schema_command(location: &StorageLocation, action: SchemaAction) -> CliResult {
    let path = match location {
        StorageLocation::Sqlite(path) => path,
        StorageLocation::Memory => {
            println!("in-memory storage has no schema to manage");
            return Ok(());
        }
    };
    let storage = SqliteStorage::open(path)?;
    let done = match action {
        SchemaAction::Create => {
            storage.create_tables().await?;
            "created tables"
        }
        SchemaAction::Drop => {
            storage.drop_tables().await?;
            "dropped tables"
        }
        SchemaAction::Reset => {
            storage.reset().await?;
            "reset database"
        }
    };
    println!("{} in {}", done, path.display());
    Ok(())
}

async fn cmd_sweep<S: ExperimentStorage>(engine: &LifecycleEngine<S>) -> CliResult {
    let expired = engine.reclaim().await?;
    if expired.is_empty() {
        println!("no participants timed out");
    }
    for p in &expired {
        println!("{}", p.worker_id);
    }
    Ok(())
}

async fn cmd_export<S: ExperimentStorage>(engine: &LifecycleEngine<S>, out: &Path) -> CliResult {
    std::fs::create_dir_all(out)?;
    let participants = engine.storage().list_participants().await?;
    let data = engine.storage().list_data().await?;

    let participant_path = out.join("participant.csv");
    std::fs::write(&participant_path, export::participants_csv(&participants)?)?;
    let data_path = out.join("data.csv");
    std::fs::write(&data_path, export::data_csv(&data)?)?;

    println!(
        "wrote {} participants to {} and {} submissions to {}",
        participants.len(),
        participant_path.display(),
        data.len(),
        data_path.display()
    );
    Ok(())
}

async fn cmd_extract_trials<S: ExperimentStorage>(
    engine: &LifecycleEngine<S>,
    out: &Path,
) -> CliResult {
    std::fs::create_dir_all(out)?;
    let data = engine.storage().list_data().await?;
    let (csv, rows) = export::trials_csv(&data)?;
    let path = out.join("trials.csv");
    std::fs::write(&path, csv)?;
    println!("wrote {} trials to {}", rows, path.display());
    Ok(())
}
