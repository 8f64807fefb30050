use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use factoryd::agent::cli::CliEngine;
use factoryd::agent::SessionStore;
use factoryd::hub::IntegrationHub;
use factoryd::tasks::model::{Actor, Phase};
use factoryd::tasks::store::CreateTaskRequest;
use factoryd::tasks::{TaskScope, TaskStore};
use factoryd::workspace::watcher::ConfigWatcher;
use factoryd::workspace::{Workspace, WorkspaceRegistry};
use factoryd::Settings;

#[derive(Parser)]
#[command(
    name = "factoryd",
    about = "Task Factory — local daemon that runs AI coding-agent sessions through a lean task pipeline",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data home for the registry, artifacts, and config
    #[arg(long, env = "FACTORY_DATA_HOME")]
    data_home: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FACTORY_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "FACTORY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand given).
    Serve,
    /// Manage registered workspaces.
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
    /// Inspect and mutate tasks from the command line.
    ///
    /// Operates on the same stores the daemon uses; a running daemon picks
    /// up changes on its next queue kick.
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Register a project directory as a workspace.
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// List registered workspaces.
    List,
    /// Remove a workspace and its factory artifacts (project files untouched).
    Remove { id: String },
}

#[derive(Subcommand)]
enum TasksAction {
    /// List tasks in a workspace.
    List {
        #[arg(long)]
        workspace: String,
        /// all | active | archived
        #[arg(long, default_value = "active")]
        scope: String,
    },
    /// Create a backlog task.
    Create {
        #[arg(long)]
        workspace: String,
        description: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Move a task to a new phase.
    Move {
        #[arg(long)]
        workspace: String,
        id: String,
        phase: String,
    },
    /// Print one task's document.
    Show {
        #[arg(long)]
        workspace: String,
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::new(args.data_home.clone(), args.log.clone());

    // File logging keeps a guard alive for the process lifetime.
    let _log_guard = init_tracing(&settings.log, args.log_file.as_deref());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Workspace { action } => workspace_command(settings, action).await,
        Command::Tasks { action } => tasks_command(settings, action).await,
    }
}

fn init_tracing(
    filter: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "factoryd.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

// ─── Serve ───────────────────────────────────────────────────────────────────

async fn serve(settings: Settings) -> Result<()> {
    info!(data_home = %settings.data_home.display(), "factoryd starting");

    let registry = Arc::new(WorkspaceRegistry::open(&settings.data_home).await?);
    let agent_command = settings.agent_command.clone();
    let hub = Arc::new(IntegrationHub::new(
        registry.clone(),
        settings,
        Box::new(move |workspace: &Workspace| {
            let sessions_dir = workspace.artifact_root.join("agent-sessions");
            Arc::new(CliEngine::new(agent_command.clone(), &sessions_dir)) as Arc<dyn SessionStore>
        }),
    ));

    // Bring up every registered workspace: queue loop, config watcher, and
    // an initial kick to resume whatever was in flight.
    let mut watchers = Vec::new();
    for workspace in registry.list_workspaces().await {
        let services = hub.services(&workspace.id).await?;
        if let Some(watcher) = ConfigWatcher::start(services.core.clone()) {
            watchers.push(watcher);
        }
        services.core.request_kick();
        info!(id = %workspace.id, name = %workspace.name, "workspace online");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    drop(watchers);
    hub.shutdown().await;
    Ok(())
}

// ─── Workspace commands ──────────────────────────────────────────────────────

async fn workspace_command(settings: Settings, action: WorkspaceAction) -> Result<()> {
    let registry = WorkspaceRegistry::open(&settings.data_home).await?;
    match action {
        WorkspaceAction::Add { path, name } => {
            let path = path.canonicalize().context("path does not exist")?;
            let workspace = registry.create_workspace(&path, name).await?;
            println!("{}  {}  {}", workspace.id, workspace.name, workspace.path.display());
        }
        WorkspaceAction::List => {
            for workspace in registry.list_workspaces().await {
                println!(
                    "{}  {}  {}",
                    workspace.id,
                    workspace.name,
                    workspace.path.display()
                );
            }
        }
        WorkspaceAction::Remove { id } => {
            registry.delete_workspace(&id).await?;
            println!("removed {id}");
        }
    }
    Ok(())
}

// ─── Task commands ───────────────────────────────────────────────────────────

async fn open_store(registry: &WorkspaceRegistry, workspace_id: &str) -> Result<TaskStore> {
    let workspace = registry.get_workspace_by_id(workspace_id).await?;
    let config = registry.read_config(&workspace).await;
    let tasks_dir = workspace.artifact_root.join(&config.default_task_location);
    Ok(TaskStore::new(
        &workspace.path,
        &workspace.artifact_root,
        &tasks_dir,
    ))
}

fn parse_scope(raw: &str) -> Result<TaskScope> {
    Ok(match raw {
        "all" => TaskScope::All,
        "active" => TaskScope::Active,
        "archived" => TaskScope::Archived,
        other => bail!("unknown scope: {other} (expected all|active|archived)"),
    })
}

fn parse_phase(raw: &str) -> Result<Phase> {
    Ok(match raw {
        "backlog" => Phase::Backlog,
        "ready" => Phase::Ready,
        "executing" => Phase::Executing,
        "complete" => Phase::Complete,
        "archived" => Phase::Archived,
        other => bail!("unknown phase: {other}"),
    })
}

async fn tasks_command(settings: Settings, action: TasksAction) -> Result<()> {
    let registry = WorkspaceRegistry::open(&settings.data_home).await?;
    match action {
        TasksAction::List { workspace, scope } => {
            let store = open_store(&registry, &workspace).await?;
            for task in store.discover_tasks(parse_scope(&scope)?).await? {
                println!(
                    "{:<12} {:<10} {}",
                    task.id(),
                    task.phase().as_str(),
                    task.frontmatter
                        .title
                        .as_deref()
                        .unwrap_or_else(|| task.description.lines().next().unwrap_or(""))
                );
            }
        }
        TasksAction::Create {
            workspace,
            description,
            title,
        } => {
            let store = open_store(&registry, &workspace).await?;
            let task = store
                .create_task(CreateTaskRequest {
                    title,
                    description,
                    ..Default::default()
                })
                .await?;
            println!("created {}", task.id());
        }
        TasksAction::Move {
            workspace,
            id,
            phase,
        } => {
            let store = open_store(&registry, &workspace).await?;
            let task = store.get_task(&id).await?;
            let moved = store
                .move_task_to_phase(&task, parse_phase(&phase)?, Actor::User, None, None)
                .await?;
            println!("{} -> {}", moved.id(), moved.phase());
        }
        TasksAction::Show { workspace, id } => {
            let store = open_store(&registry, &workspace).await?;
            let task = store.get_task(&id).await?;
            let doc = serde_yaml::to_string(&task.into_document())?;
            print!("{doc}");
        }
    }
    Ok(())
}
