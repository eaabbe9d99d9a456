//! Elohim Curriculum operator tool
//!
//! ## Usage
//!
//! ```bash
//! # Load a path tree from JSON and show it
//! elohim-curriculum import path.json
//! elohim-curriculum show 1
//!
//! # Reorder siblings
//! elohim-curriculum insert chapter 1 --position 0 --set title=Intro
//! elohim-curriculum move step 42 0
//! elohim-curriculum reorder chapter 1 3,1,2
//!
//! # Duplicate a path for an actor and wait for the result
//! elohim-curriculum duplicate --source 1 --actor alice --wait
//!
//! # Run the worker pool and attachment copier until Ctrl+C
//! elohim-curriculum serve
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use elohim_curriculum::attachments::{AttachmentCopier, BlobStore, CopierSettings};
use elohim_curriculum::db::{CreatePathInput, CurriculumDb, BLOCKS, CHAPTERS, NESTED_BLOCKS, STEPS};
use elohim_curriculum::duplication::{DuplicationExecutor, HierarchySchema};
use elohim_curriculum::jobs::{
    CoordinatorSettings, InMemoryQueue, JobCoordinator, JobOutcome, JobState,
};
use elohim_curriculum::ordering::{SiblingPayload, SiblingScope};
use elohim_curriculum::services::{spawn_logging_listener, EventBus, Services};
use elohim_curriculum::{Config, FieldValue};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type Coordinator = JobCoordinator<CurriculumDb, CurriculumDb, InMemoryQueue>;
type Copier = AttachmentCopier<CurriculumDb, BlobStore>;
type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "elohim-curriculum")]
#[command(about = "Ordered curriculum storage and path duplication")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ELOHIM_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a path tree from a JSON file
    Import { file: PathBuf },
    /// Print a path tree as JSON
    Show { path_id: i64 },
    /// Insert a sibling, appending when no position is given
    Insert {
        kind: Kind,
        container_id: i64,
        #[arg(long)]
        position: Option<i64>,
        /// Column value as column=value, repeatable
        #[arg(long = "set", value_parser = parse_assignment)]
        values: Vec<(String, String)>,
    },
    /// Move a sibling to a new index
    Move { kind: Kind, id: i64, position: i64 },
    /// Delete a sibling and close the gap
    Delete { kind: Kind, id: i64 },
    /// Reassign positions from an ordered id list
    Reorder {
        kind: Kind,
        container_id: i64,
        #[arg(value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Repair gaps and duplicate positions in a container
    Normalize { kind: Kind, container_id: i64 },
    /// Request a duplicate of a path for an actor
    Duplicate {
        #[arg(long)]
        source: i64,
        #[arg(long)]
        actor: String,
        /// Run workers in this process until the job finishes
        #[arg(long)]
        wait: bool,
    },
    /// Show a job and its attachment outcome
    Status { job_id: String },
    /// List jobs, newest first
    Jobs {
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Cancel a job between attempts
    Cancel { job_id: String },
    /// Re-queue a dead-lettered job
    Revive { job_id: String },
    /// Re-queue failed attachment copies
    RepairAttachments {
        #[arg(long)]
        root: Option<i64>,
    },
    /// Run the duplication workers and attachment copier until Ctrl+C
    Serve,
}

/// Sibling kinds with a maintained order
#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Chapter,
    Step,
    Block,
    NestedBlock,
}

impl Kind {
    fn scope(self) -> &'static SiblingScope {
        match self {
            Kind::Chapter => &CHAPTERS,
            Kind::Step => &STEPS,
            Kind::Block => &BLOCKS,
            Kind::NestedBlock => &NESTED_BLOCKS,
        }
    }
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected column=value, got '{}'", s))
}

fn field_value(raw: &str) -> FieldValue {
    match raw.parse::<i64>() {
        Ok(n) => FieldValue::Integer(n),
        Err(_) => FieldValue::from(raw),
    }
}

/// Everything a subcommand may need, opened once
struct Runtime {
    config: Config,
    db: Arc<CurriculumDb>,
    services: Services,
    coordinator: Arc<Coordinator>,
    copier: Arc<Copier>,
}

impl Runtime {
    async fn open(config: Config) -> CliResult<Self> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
        let db = Arc::new(CurriculumDb::open_file(&config.database_path())?);
        let blobs = Arc::new(BlobStore::new(config.blobs_dir()).await?);
        let events = Arc::new(EventBus::new());
        let services =
            Services::with_max_depth(db.clone(), events.clone(), config.duplication.max_depth);

        let schema = Arc::new(HierarchySchema::curriculum(config.duplication.max_depth));
        let executor = Arc::new(DuplicationExecutor::new(db.clone(), schema, "path")?);

        let copier = Arc::new(AttachmentCopier::new(
            db.clone(),
            blobs,
            events.clone(),
            CopierSettings::from_config(&config.attachments),
        ));
        let coordinator = Arc::new(
            JobCoordinator::new(
                db.clone(),
                executor,
                Arc::new(InMemoryQueue::new()),
                events,
                CoordinatorSettings::from_config(&config.duplication),
            )
            .with_attachment_notify(copier.notifier()),
        );

        Ok(Self {
            config,
            db,
            services,
            coordinator,
            copier,
        })
    }

    /// Start workers, poller and copier; all stop on `shutdown`
    async fn start(&self, shutdown: &broadcast::Sender<()>) -> CliResult<Vec<JoinHandle<()>>> {
        self.coordinator.recover().await?;
        let mut handles = self.coordinator.spawn_workers(shutdown);
        handles.push(tokio::spawn(self.copier.clone().run(shutdown.subscribe())));
        Ok(handles)
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_curriculum=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    // Save default config if it doesn't exist
    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let rt = Runtime::open(config).await?;

    match args.command {
        Command::Import { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let input: CreatePathInput = serde_json::from_str(&raw)?;
            let id = rt.services.path.create(&input)?;
            println!("{}", id);
        }
        Command::Show { path_id } => match rt.services.path.get_tree(path_id)? {
            Some(tree) => print_json(&tree)?,
            None => return Err(format!("path {} not found", path_id).into()),
        },
        Command::Insert {
            kind,
            container_id,
            position,
            values,
        } => {
            let payload = values
                .iter()
                .fold(SiblingPayload::new(), |p, (k, v)| p.with(k.as_str(), field_value(v)));
            let id = rt
                .services
                .ordering
                .insert(kind.scope(), container_id, position, &payload)?;
            println!("{}", id);
        }
        Command::Move { kind, id, position } => {
            let final_position = rt.services.ordering.move_to(kind.scope(), id, position)?;
            println!("{}", final_position);
        }
        Command::Delete { kind, id } => {
            if !rt.services.ordering.delete(kind.scope(), id)? {
                return Err(format!("{} {} not found", kind.scope().table, id).into());
            }
        }
        Command::Reorder {
            kind,
            container_id,
            ids,
        } => {
            let updated = rt.services.ordering.reorder(kind.scope(), container_id, &ids)?;
            println!("{} updated", updated);
        }
        Command::Normalize { kind, container_id } => {
            let updated = rt.services.ordering.normalize(kind.scope(), container_id)?;
            println!("{} updated", updated);
        }
        Command::Duplicate {
            source,
            actor,
            wait,
        } => {
            let receipt = rt.coordinator.submit(source, &actor).await?;
            if !wait {
                print_json(&receipt)?;
                return Ok(());
            }
            wait_for_job(&rt, &receipt.job_id).await?;
        }
        Command::Status { job_id } => {
            let status = rt.coordinator.status(&job_id)?;
            print_json(&serde_json::json!({
                "job": status.job,
                "attachments": status.attachments,
                "outcome": status.outcome(),
            }))?;
        }
        Command::Jobs { state, limit } => {
            let state = state.as_deref().map(JobState::parse).transpose()?;
            print_json(&rt.coordinator.list(state, limit)?)?;
        }
        Command::Cancel { job_id } => {
            let result = rt.coordinator.cancel(&job_id)?;
            println!("{:?}", result);
        }
        Command::Revive { job_id } => {
            print_json(&rt.coordinator.revive(&job_id).await?)?;
        }
        Command::RepairAttachments { root } => {
            let requeued = rt.copier.repair(root)?;
            println!("{} re-queued", requeued);
        }
        Command::Serve => serve(&rt).await?,
    }

    Ok(())
}

async fn wait_for_job(rt: &Runtime, job_id: &str) -> CliResult<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = rt.start(&shutdown_tx).await?;

    let status = loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = rt.coordinator.status(job_id)?;
        match status.outcome() {
            JobOutcome::Pending => continue,
            JobOutcome::Succeeded {
                pending_attachments,
                ..
            } if pending_attachments > 0 => continue,
            _ => break status,
        }
    };

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    print_json(&serde_json::json!({
        "job": status.job,
        "attachments": status.attachments,
        "outcome": status.outcome(),
    }))
}

async fn serve(rt: &Runtime) -> CliResult<()> {
    info!(
        storage_dir = %rt.config.storage_dir.display(),
        workers = rt.config.duplication.worker_count,
        "Starting elohim-curriculum workers"
    );

    let _listener = spawn_logging_listener(rt.services.events.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = rt.start(&shutdown_tx).await?;

    info!("Press Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Shutting down...");

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    // Print stats before exit
    if let Ok(stats) = rt.db.stats() {
        info!(
            paths = stats.path_count,
            entities = stats.entity_count(),
            broken_media = stats.broken_media_count,
            "Final storage stats"
        );
    }

    Ok(())
}
