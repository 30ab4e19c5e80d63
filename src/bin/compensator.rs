//! compensator CLI: operator interface to the compensation task table.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use compensator_rs::config::Config;
use compensator_rs::db::{Backend, PgStore, SqliteStore, TaskStore};
use compensator_rs::engine::Compensator;
use compensator_rs::error::Error;
use compensator_rs::executor::ExecutorRegistry;
use compensator_rs::model::TaskId;
use compensator_rs::telemetry::init_telemetry;
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "compensator", about = "Inspect and maintain compensation tasks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Show one task
    Show {
        /// Task ID (full UUID)
        id: String,
    },
    /// List outstanding tasks of a group
    List {
        /// Task group
        #[arg(long, default_value_t = 0)]
        group: i32,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(config.telemetry_config())?;

    let url = config.database_url.expose_secret();
    match Backend::from_url(url)? {
        Backend::Postgres => run(PgStore::connect(url).await?, &config, cli.command).await,
        Backend::Sqlite => run(SqliteStore::connect(url).await?, &config, cli.command).await,
    }
}

async fn run<S: TaskStore>(store: S, config: &Config, command: Command) -> anyhow::Result<()> {
    store.migrate().await?;
    if let Command::Migrate = command {
        println!("Migrations applied.");
        return Ok(());
    }

    let engine = Compensator::new(
        Arc::new(store),
        Arc::new(ExecutorRegistry::new()),
        config.engine_config(),
    );

    match command {
        Command::Migrate => Ok(()),
        Command::Show { id } => cmd_show(&engine, &id).await,
        Command::List { group, limit } => cmd_list(&engine, group, limit).await,
    }
}

async fn cmd_show<S: TaskStore>(engine: &Compensator<S>, id: &str) -> anyhow::Result<()> {
    let id: TaskId = id.parse()?;
    let Some(task) = engine.task_by_id(id).await? else {
        // An absent row is how success is recorded.
        return Err(Error::NotFound(format!("{id} (succeeded or never submitted)")).into());
    };

    println!("ID:          {}", task.id);
    println!("Name:        {}", task.name);
    println!("Group:       {}", task.group);
    println!("Args:        {}", task.args);
    println!("Retries:     {}", task.retries);
    println!(
        "Locker:      {}",
        if task.locker.is_empty() { "-" } else { &task.locker }
    );
    println!("Lock Expire: {}", task.lock_expire);
    println!("Created:     {}", task.created_at);
    if let Some(exec_time) = task.exec_time {
        println!("Exec Time:   {exec_time}");
    }
    if !task.last_error.is_empty() {
        println!("---");
        println!("Last Error:  {}", task.last_error);
    }

    Ok(())
}

async fn cmd_list<S: TaskStore>(
    engine: &Compensator<S>,
    group: i32,
    limit: i64,
) -> anyhow::Result<()> {
    let tasks = engine.outstanding(group, limit).await?;

    if tasks.is_empty() {
        println!("No outstanding tasks in group {group}.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16}  {:<7}  {:<6}  {:<16}  LAST_ERROR",
        "ID", "NAME", "RETRIES", "HELD", "LOCK_EXPIRE"
    );
    println!("{}", "-".repeat(110));

    for task in &tasks {
        let error: String = task.last_error.chars().take(30).collect();
        println!(
            "{:<36}  {:<16}  {:<7}  {:<6}  {:<16}  {}",
            task.id.to_string(),
            task.name,
            task.retries,
            if task.locker.is_empty() { "no" } else { "yes" },
            task.lock_expire.format("%Y-%m-%d %H:%M").to_string(),
            if error.is_empty() { "-" } else { &error }
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}
