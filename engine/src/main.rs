use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use steward_agents::{register_worker_tools, SubAgentRunner, WorkerManager};
use steward_chat::ChatRuntime;
use steward_core::{ConfigStore, PathPolicy};
use steward_memory::{MemoryManager, MemoryPipeline, MemorySummaryWorker};
use steward_providers::LlmClient;
use steward_scheduler::{register_service_tools, CentralService, TaskRunner};
use steward_store::{
    ensure_schema, DailyMemoryStore, DbQueue, MemoryIndexStore, SchedulerStore,
};
use steward_tools::{register_kernel_tools, ToolRegistry};

#[derive(Parser, Debug)]
#[command(name = "steward-engine")]
#[command(about = "Headless Steward agent runtime")]
struct Cli {
    /// Repository root holding config/, context/, memory/, outputs/.
    #[arg(long, env = "STEWARD_ROOT")]
    root: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central service and memory worker until interrupted.
    Serve,
    /// Handle one chat message and print the reply.
    Chat {
        #[arg(long, default_value = "default")]
        session: String,
        message: String,
    },
    /// Scheduler administration.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Service status snapshot.
    Status,
}

#[derive(Subcommand, Debug)]
enum TaskCommand {
    /// List schedules and their last outcomes.
    List,
    /// Recent run history.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manually queue a run for a profile.
    Trigger {
        profile_id: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Kill a queued, waiting, or running run.
    Kill { run_id: String },
    /// Resume a waiting-for-user run.
    Resume {
        run_id: String,
        response: String,
    },
    /// Runs paused on user input.
    Waiting,
}

struct EngineState {
    service: CentralService,
    summary_worker: Arc<MemorySummaryWorker>,
    chat: Arc<ChatRuntime>,
    store: Arc<SchedulerStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let root = resolve_root(cli.root)?;
    let state = build_state(&root).await?;

    match cli.command {
        Command::Serve => {
            info!("starting steward-engine (root={})", root.display());
            state.service.start().await;
            state.summary_worker.start().await;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            state.summary_worker.stop().await;
            state.service.stop().await;
        }
        Command::Chat { session, message } => {
            let reply = state.chat.handle_message(&session, &message).await;
            println!("{}", reply.reply);
            if let Some(error) = reply.error {
                eprintln!("({}: {error})", reply.route);
            }
        }
        Command::Task { command } => run_task_command(&state, command).await?,
        Command::Status => {
            let status = state.service.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn run_task_command(state: &EngineState, command: TaskCommand) -> anyhow::Result<()> {
    match command {
        TaskCommand::List => {
            let summary = state.service.check_in_summary().await?;
            println!("{summary}");
        }
        TaskCommand::History { limit } => {
            for run in state.store.list_run_history(limit).await? {
                println!(
                    "{} {} {} {}",
                    run.run_id,
                    run.profile_id,
                    run.status.as_str(),
                    run.summary.or(run.error).unwrap_or_default()
                );
            }
        }
        TaskCommand::Trigger {
            profile_id,
            description,
        } => {
            let run = state
                .service
                .trigger_profile(&profile_id, description.as_deref())
                .await?;
            state.service.dispatch_available().await;
            println!("queued {}", run.run_id);
        }
        TaskCommand::Kill { run_id } => {
            let outcome = state.service.kill_run(&run_id, "cli").await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        TaskCommand::Resume { run_id, response } => {
            let outcome = state.service.resume_run(&run_id, &response, "cli").await?;
            state.service.dispatch_available().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        TaskCommand::Waiting => {
            for run in state.service.list_waiting_runs(50).await? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
    }
    Ok(())
}

fn resolve_root(flag: Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(PathBuf::from(root));
    }
    std::env::current_dir().context("resolving working directory")
}

async fn build_state(root: &PathBuf) -> anyhow::Result<EngineState> {
    let config = ConfigStore::for_root(root);
    let snapshot = config.get().await;

    // Single serialized writer over the core store.
    let db_path = {
        let configured = PathBuf::from(&snapshot.central_service.scheduler_db_path);
        if configured.is_absolute() {
            configured
        } else {
            root.join(configured)
        }
    };
    let queue = DbQueue::new(&db_path, snapshot.central_service.db_queue_busy_timeout_ms);
    queue.start();
    ensure_schema(&queue).await?;

    let store = Arc::new(SchedulerStore::new(queue.clone()));
    let daily = Arc::new(
        DailyMemoryStore::new(queue.clone(), snapshot.timezone.clone()).with_legacy_root(root),
    );
    let migrated = daily.migrate_legacy_files().await.unwrap_or(0);
    if migrated > 0 {
        info!("migrated {migrated} legacy daily memory entries");
    }
    let index = Arc::new(MemoryIndexStore::new(queue.clone()));

    let llm = Arc::new(LlmClient::new(config.clone()));
    let policy = Arc::new(PathPolicy::new(root, &snapshot.filesystem));
    let tools = ToolRegistry::new();
    register_kernel_tools(&tools, &config, policy)
        .await
        .map_err(anyhow::Error::msg)?;

    let sub_agent = Arc::new(SubAgentRunner::new(
        llm.clone(),
        tools.clone(),
        config.clone(),
    ));
    let workers = WorkerManager::new(
        sub_agent.clone(),
        root.clone(),
        snapshot.workers.max_concurrent_workers,
    );
    register_worker_tools(&tools, &workers)
        .await
        .map_err(anyhow::Error::msg)?;

    let pipeline = Arc::new(MemoryPipeline::new(
        daily.clone(),
        index.clone(),
        llm.clone(),
        config.clone(),
    ));
    let memory_manager = Arc::new(MemoryManager::new(pipeline.clone()));
    let summary_worker = Arc::new(MemorySummaryWorker::new(pipeline, config.clone()));

    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        daily.clone(),
        sub_agent,
        config.clone(),
        root.clone(),
    ));
    let service = CentralService::new(
        config.clone(),
        root.clone(),
        queue,
        store.clone(),
        runner,
        memory_manager.clone(),
        daily.clone(),
        index.clone(),
    );
    service.attach_summary_worker(summary_worker.clone()).await;
    register_service_tools(&tools, &service)
        .await
        .map_err(anyhow::Error::msg)?;

    let chat = Arc::new(
        ChatRuntime::new(
            config.clone(),
            root.clone(),
            llm,
            tools,
            workers,
            Some(service.clone()),
            daily,
            index,
            memory_manager,
            Some(summary_worker.clone()),
        )
        .await,
    );

    Ok(EngineState {
        service,
        summary_worker,
        chat,
        store,
    })
}
