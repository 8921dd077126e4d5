//! vela - autonomous coding agent CLI

mod config;
mod host;
mod tools;
mod utils;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use vela_agent::{Mode, Task, TaskExit, TaskStore};
use vela_ai::ModelClient;
use vela_ai::scripted::ScriptedClient;

/// vela - autonomous coding agent
#[derive(Parser, Debug)]
#[command(name = "vela")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Task to run (prompted for on stdin if omitted)
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Play back model responses from a JSON file
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Operating mode (act, plan)
    #[arg(short, long)]
    mode: Option<Mode>,

    /// Tools to run without approval (comma separated)
    #[arg(long, value_delimiter = ',')]
    auto_approve: Vec<String>,

    /// Working directory
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Directory holding task histories
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Resume a previous task by ID
    #[arg(long)]
    resume: Option<String>,

    /// List saved tasks
    #[arg(long)]
    tasks: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::new("vela=debug,vela_agent=debug,vela_ai=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if args.init_config {
        let path = config::Config::init().context("creating config file")?;
        println!("Config file at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut cfg = config::Config::load();
    if let Some(dir) = args.data_dir.clone() {
        cfg.data_dir = Some(dir);
    }

    if args.tasks {
        return list_tasks(&cfg.data_dir());
    }

    if let Some(ref dir) = args.working_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("changing to {}", dir.display()))?;
    }
    let cwd = std::env::current_dir()?;
    let task_tools = tools::all(&cwd);

    let mut task_config = cfg
        .task_config(cwd)
        .context("reading system prompt file")?;
    if let Some(mode) = args.mode {
        task_config.mode = mode;
    }
    task_config
        .auto_approve
        .extend(config::split_names(&args.auto_approve));

    let Some(replay) = args.replay else {
        anyhow::bail!(
            "No model client configured. Provider clients plug in through vela_ai::ModelClient; \
             use --replay <file.json> to play back scripted responses."
        );
    };
    let client: Arc<dyn ModelClient> = Arc::new(
        ScriptedClient::from_file(&replay)
            .with_context(|| format!("loading replay file {}", replay.display()))?,
    );

    let (task, prompt) = match args.resume {
        Some(id) => {
            let task = Task::open(task_config, client, task_tools, &id)
                .with_context(|| format!("opening task {}", id))?;
            println!("Resuming task {}", id);
            (task, None)
        }
        None => {
            let prompt = match args.command {
                Some(command) => command,
                None => read_prompt()?,
            };
            (Task::new(task_config, client, task_tools), Some(prompt))
        }
    };

    let handle = task.handle();
    let host = host::spawn(handle.clone());
    let interrupt = {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.abort();
            }
        })
    };

    let result = match prompt {
        Some(prompt) => task.start(&prompt, Vec::new()).await,
        None => task.resume().await,
    };
    let _ = host.await;
    interrupt.abort();

    match result {
        Ok(TaskExit::Completed) => Ok(()),
        Ok(TaskExit::Aborted) => {
            println!("Resume later with: vela --resume {}", handle.task_id());
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("task {} failed", handle.task_id())),
    }
}

fn read_prompt() -> anyhow::Result<String> {
    use std::io::{self, Write};

    print!("task> ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("no task given");
    }
    Ok(input.to_string())
}

fn list_tasks(data_dir: &std::path::Path) -> anyhow::Result<()> {
    let tasks = TaskStore::list_tasks(data_dir)?;
    if tasks.is_empty() {
        println!("No saved tasks.");
        return Ok(());
    }

    println!("Saved tasks:\n");
    for task in tasks {
        println!(
            "  {}  {}  ({} messages)  {}",
            &task.id,
            task.created_at_display(),
            task.message_count,
            utils::truncate_chars(&task.task, 60)
        );
    }
    println!("\nResume with: vela --resume <id>");
    Ok(())
}
