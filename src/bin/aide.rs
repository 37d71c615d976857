use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use teloxide::Bot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aide::{
    agent::{AgentRunner, NoopObserver},
    chat::Conversations,
    config::Config,
    notify,
    scheduler::Scheduler,
    store::timestamp,
    tasks::{NewTask, TaskPatch, TaskStatus},
    telegram::TelegramBot,
    tui::run_tui,
    workspace::{Surface, Workspace},
    VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "aide")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Overrides workspace.path from the config file
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the long-lived services
    Run {
        #[arg(short, long, value_enum, default_value = "all")]
        mode: Mode,
    },
    /// Run the agent once and print its answer
    Ask {
        prompt: String,
        #[arg(long)]
        session: Option<String>,
    },
    /// Manage cron jobs
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Manage remembered facts
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Send a message through the configured notifier
    Send {
        #[arg(long)]
        text: String,
        #[arg(long)]
        to: Option<String>,
    },
    /// Append an entry to today's journal
    Journal {
        #[arg(long)]
        text: String,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Telegram,
    Tui,
    Scheduler,
    All,
}

impl Mode {
    fn telegram(self) -> bool {
        matches!(self, Mode::Telegram | Mode::All)
    }

    fn scheduler(self) -> bool {
        matches!(self, Mode::Scheduler | Mode::All)
    }
}

#[derive(Subcommand, Debug)]
enum CronAction {
    List,
    Add {
        #[arg(long)]
        schedule: String,
        #[arg(long)]
        prompt: String,
    },
    Remove {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
    Update {
        id: String,
        #[arg(long)]
        schedule: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TaskAction {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Add {
        #[arg(long)]
        title: String,
        #[command(flatten)]
        fields: TaskFields,
    },
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[command(flatten)]
        fields: TaskFields,
    },
    Complete {
        id: String,
    },
}

#[derive(clap::Args, Debug)]
struct TaskFields {
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    context: Option<String>,
    /// e.g. 2024-03-05T17:00:00 or 2024-03-05
    #[arg(long)]
    due: Option<String>,
    #[arg(long)]
    remind: Option<String>,
    /// daily, weekly, monthly, yearly or a cron expression
    #[arg(long)]
    recurrence: Option<String>,
}

#[derive(Subcommand, Debug)]
enum ProjectAction {
    List,
    Add {
        #[arg(long)]
        name: String,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Archive {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum MemoryAction {
    List,
    Add {
        #[arg(long)]
        text: String,
    },
    Search {
        #[arg(long)]
        query: String,
    },
    Forget {
        id: String,
    },
}

fn init_tracing(to_file: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    if to_file {
        match std::fs::File::create("aide.log") {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .init();
                return;
            }
            Err(e) => eprintln!("Could not open aide.log: {}", e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_workspace(workspace: Option<PathBuf>, config: &Config) -> Result<Workspace> {
    let path = workspace.unwrap_or_else(|| config.workspace.path.clone());
    Workspace::new(path)
}

fn parse_time(field: &str, value: Option<&str>) -> Result<Option<NaiveDateTime>> {
    match value {
        None => Ok(None),
        Some(raw) => timestamp::parse(raw)
            .map(Some)
            .ok_or_else(|| anyhow!("Invalid {} timestamp: {}", field, raw)),
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Prints the `{"success": ..}` envelope the agent parses when it drives
/// these commands as tools.
fn envelope(result: Result<Value>) -> ExitCode {
    match result {
        Ok(data) => {
            println!("{}", json!({ "success": true, "data": data }));
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}", json!({ "success": false, "error": format!("{:#}", e) }));
            ExitCode::FAILURE
        }
    }
}

fn cron_command(ws: &Workspace, action: CronAction) -> Result<Value> {
    let jobs = ws.cron_jobs();
    match action {
        CronAction::List => to_data(jobs.list()),
        CronAction::Add { schedule, prompt } => to_data(jobs.add(&schedule, &prompt)?),
        CronAction::Remove { id } => {
            jobs.remove(&id)?;
            Ok(json!({ "id": id }))
        }
        CronAction::Enable { id } => {
            jobs.set_enabled(&id, true)?;
            Ok(json!({ "id": id, "enabled": true }))
        }
        CronAction::Disable { id } => {
            jobs.set_enabled(&id, false)?;
            Ok(json!({ "id": id, "enabled": false }))
        }
        CronAction::Update {
            id,
            schedule,
            prompt,
        } => {
            jobs.update(&id, schedule.as_deref(), prompt.as_deref())?;
            Ok(json!({ "id": id }))
        }
    }
}

fn task_command(ws: &Workspace, action: TaskAction) -> Result<Value> {
    let tasks = ws.tasks();
    match action {
        TaskAction::List { status } => {
            let status = status.map(TaskStatus::from);
            to_data(tasks.list(status.as_ref()))
        }
        TaskAction::Add { title, fields } => {
            let task = tasks.add(NewTask {
                title,
                due: parse_time("due", fields.due.as_deref())?,
                remind: parse_time("remind", fields.remind.as_deref())?,
                project: fields.project,
                priority: fields.priority,
                context: fields.context,
                recurrence: fields.recurrence,
            })?;
            to_data(task)
        }
        TaskAction::Update {
            id,
            title,
            status,
            fields,
        } => {
            tasks.update(
                &id,
                TaskPatch {
                    title,
                    status: status.map(TaskStatus::from),
                    due: parse_time("due", fields.due.as_deref())?,
                    remind: parse_time("remind", fields.remind.as_deref())?,
                    project: fields.project,
                    priority: fields.priority,
                    context: fields.context,
                    recurrence: fields.recurrence,
                },
            )?;
            Ok(json!({ "id": id }))
        }
        TaskAction::Complete { id } => {
            let next = tasks.complete(&id)?;
            Ok(json!({ "id": id, "next_id": next }))
        }
    }
}

fn project_command(ws: &Workspace, action: ProjectAction) -> Result<Value> {
    let projects = ws.projects();
    match action {
        ProjectAction::List => to_data(projects.list()),
        ProjectAction::Add { name } => to_data(projects.add(&name)?),
        ProjectAction::Update { id, name, status } => {
            projects.update(&id, name.as_deref(), status.as_deref())?;
            Ok(json!({ "id": id }))
        }
        ProjectAction::Archive { id } => {
            projects.archive(&id)?;
            Ok(json!({ "id": id, "status": "archived" }))
        }
    }
}

fn memory_command(ws: &Workspace, action: MemoryAction) -> Result<Value> {
    let memory = ws.memory();
    match action {
        MemoryAction::List => to_data(memory.list()),
        MemoryAction::Add { text } => to_data(memory.add(&text)?),
        MemoryAction::Search { query } => to_data(memory.search(&query)),
        MemoryAction::Forget { id } => {
            memory.forget(&id)?;
            Ok(json!({ "id": id }))
        }
    }
}

async fn ask(config: &Config, ws: &Workspace, prompt: &str, session: Option<&str>) -> Result<()> {
    let runner = AgentRunner::new(config.agent.clone());
    let reply = runner
        .run(prompt, session, ws.path(), config.agent.timeout(), &NoopObserver)
        .await?;
    println!("{}", reply.answer);
    if let Some(id) = reply.session_id {
        println!("[session_id] {}", id);
    }
    Ok(())
}

async fn run(config: Config, ws: Workspace, mode: Mode) -> Result<()> {
    if mode.telegram() && !config.telegram.has_token() {
        bail!("Telegram mode requires telegram.token in the config file (or use --mode tui)");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                shutdown.cancel();
            }
        });
    }

    let runner = AgentRunner::new(config.agent.clone());
    let mut services: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    if mode.scheduler() {
        if config.scheduler.enabled {
            let sender = notify::from_config(&config.notify, &config.telegram)
                .context("Failed to set up the notifier")?;
            let scheduler = Scheduler::new(
                ws.clone(),
                Arc::new(runner.clone()),
                sender,
                config.scheduler.clone(),
            );
            let shutdown = shutdown.clone();
            services.spawn(async move {
                scheduler.run(shutdown).await;
                ("scheduler", Ok(()))
            });
        } else {
            warn!("Scheduler is disabled in the config file");
        }
    }

    if mode.telegram() {
        let conversations = Conversations::new(
            runner.clone(),
            ws.sessions(Surface::Telegram),
            ws.memory(),
            config.memory.clone(),
            ws.path().to_path_buf(),
        );
        let bot = TelegramBot::new(
            Bot::new(config.telegram.token.clone()),
            conversations,
            config.telegram.clone(),
        );
        let shutdown = shutdown.clone();
        services.spawn(async move { ("telegram", bot.run(shutdown).await) });
    }

    if mode == Mode::Tui {
        let conversations = Conversations::new(
            runner.clone(),
            ws.sessions(Surface::Tui),
            ws.memory(),
            config.memory.clone(),
            ws.path().to_path_buf(),
        );
        let ws = ws.clone();
        let shutdown = shutdown.clone();
        services.spawn(async move { ("tui", run_tui(conversations, ws, shutdown).await) });
    }

    if services.is_empty() {
        bail!("Nothing to run in mode {:?}", mode);
    }

    let mut failure = None;
    while let Some(done) = services.join_next().await {
        // One service ending takes the others down with it.
        shutdown.cancel();
        match done {
            Ok((name, Ok(()))) => info!(service = name, "Service stopped"),
            Ok((name, Err(e))) => {
                error!(service = name, "Service failed: {:#}", e);
                failure.get_or_insert(e.context(format!("{} failed", name)));
            }
            Err(e) => error!("Service panicked: {}", e),
        }
    }

    info!("Goodbye");
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn record_command(
    config_path: &Path,
    workspace: Option<PathBuf>,
    command: Command,
) -> Result<Value> {
    let config = Config::load_or_default(config_path)?;
    let ws = open_workspace(workspace, &config)?;
    match command {
        Command::Cron { action } => cron_command(&ws, action),
        Command::Task { action } => task_command(&ws, action),
        Command::Project { action } => project_command(&ws, action),
        Command::Memory { action } => memory_command(&ws, action),
        Command::Send { text, to } => {
            let sender = notify::from_config(&config.notify, &config.telegram)?;
            sender.send(&text, to.as_deref()).await?;
            Ok(json!({ "sent": true }))
        }
        Command::Journal { text } => {
            let path = ws.journal_append(&text)?;
            Ok(json!({ "path": path.display().to_string() }))
        }
        Command::Run { .. } | Command::Ask { .. } => bail!("not a record command"),
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let Args {
        config: config_path,
        workspace,
        command,
    } = Args::parse();
    init_tracing(matches!(command, Command::Run { mode: Mode::Tui }));

    match command {
        Command::Run { mode } => {
            let result = async {
                let config = Config::load(&config_path)?;
                let ws = open_workspace(workspace, &config)?;
                if mode != Mode::Tui {
                    println!(
                        "aide v{} | mode: {:?} | workspace: {}",
                        VERSION,
                        mode,
                        ws.path().display()
                    );
                }
                run(config, ws, mode).await
            }
            .await;
            report(result)
        }
        Command::Ask { prompt, session } => {
            let result = async {
                let config = Config::load_or_default(&config_path)?;
                let ws = open_workspace(workspace, &config)?;
                ask(&config, &ws, &prompt, session.as_deref()).await
            }
            .await;
            report(result)
        }
        command => envelope(record_command(&config_path, workspace, command).await),
    }
}
