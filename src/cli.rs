//! Administrative CLI
//!
//! Runs compiled executables against either backend and inspects persisted
//! sessions without requiring a language runtime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::controller::{Controller, DatabaseController, MemoryController};
use crate::executable::Executable;
use crate::foreign::ForeignRegistry;
use crate::invoker::TaskInvoker;
use crate::session::{RunRequest, RunReport, Session};
use crate::value::Value;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand - a resumable VM for durable functional programs", long_about = None)]
pub struct Cli {
    /// Database URL (overrides config file and env vars)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a compiled executable
    Run {
        /// Path to the executable document (wire-format JSON)
        executable: String,

        /// Entry function name
        function: String,

        /// Arguments as a JSON array
        #[arg(default_value = "[]")]
        args: String,

        /// Backend: memory or database
        #[arg(long, default_value = "memory")]
        backend: String,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        /// Launch and return immediately instead of waiting for the result
        #[arg(long)]
        no_wait: bool,
    },

    /// Resume a suspended thread of a persisted session
    Resume {
        session_id: String,
        thread_id: u32,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },

    /// Show the status of a persisted session
    Status { session_id: String },

    /// Print a persisted session's stdout
    Stdout { session_id: String },

    /// Run database migrations
    Migrate,
}

pub async fn run_cli() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Some(url) = &cli.database_url {
        std::env::set_var("STRAND_DATABASE_URL", url);
    }
    let config = Config::load()?;

    match cli.command {
        Commands::Run {
            executable,
            function,
            args,
            backend,
            timeout_secs,
            no_wait,
        } => {
            run_command(
                &config,
                &executable,
                &function,
                &args,
                &backend,
                timeout_secs,
                no_wait,
            )
            .await
        }

        Commands::Resume {
            session_id,
            thread_id,
            timeout_secs,
        } => resume_command(&config, &session_id, thread_id, timeout_secs).await,

        Commands::Status { session_id } => status_command(&config, &session_id).await,

        Commands::Stdout { session_id } => {
            let session = attach_session(&config, &session_id).await?;
            print!("{}", session.controller().read_stdout().await?);
            Ok(())
        }

        Commands::Migrate => {
            let pool = DatabaseController::connect(&config).await?;
            DatabaseController::migrate(&pool).await?;
            println!("Migrations applied");
            Ok(())
        }
    }
}

async fn run_command(
    config: &Config,
    executable_path: &str,
    function: &str,
    args_json: &str,
    backend: &str,
    timeout_secs: u64,
    no_wait: bool,
) -> Result<()> {
    let document = std::fs::read_to_string(executable_path)
        .with_context(|| format!("Failed to read {executable_path}"))?;
    let document: serde_json::Value =
        serde_json::from_str(&document).context("Executable is not valid JSON")?;
    let exe = Executable::from_wire(&document).context("Failed to decode executable")?;

    let args: serde_json::Value =
        serde_json::from_str(args_json).context("Arguments are not valid JSON")?;
    let args = args
        .as_array()
        .ok_or_else(|| anyhow!("Arguments must be a JSON array"))?
        .iter()
        .map(Value::from_json)
        .collect::<Result<Vec<_>, _>>()?;

    let ctrl: Arc<dyn Controller> = match backend {
        "memory" => Arc::new(MemoryController::new(config.lock.clone())),
        "database" => {
            let pool = DatabaseController::connect(config).await?;
            let ctrl = DatabaseController::create(pool, config.lock.clone()).await?;
            println!("Session:  {}", ctrl.session_id());
            Arc::new(ctrl)
        }
        other => return Err(anyhow!("Unknown backend '{other}' (memory or database)")),
    };

    let registry = Arc::new(ForeignRegistry::with_host_module());
    let invoker = Arc::new(TaskInvoker::new(ctrl.clone(), registry));
    let session = Session::new(
        ctrl,
        invoker,
        Duration::from_millis(config.run.poll_interval_ms),
    );

    let report = session
        .start(
            &exe,
            RunRequest {
                function: function.to_string(),
                args,
                timeout: Duration::from_secs(timeout_secs),
                wait_for_finish: !no_wait,
            },
        )
        .await?;

    print_report(&report);
    Ok(())
}

async fn resume_command(
    config: &Config,
    session_id: &str,
    thread_id: u32,
    timeout_secs: u64,
) -> Result<()> {
    let session = attach_session(config, session_id).await?;
    session.resume(thread_id).await?;
    let report = session
        .wait_until_stopped(Duration::from_secs(timeout_secs))
        .await?;
    print_report(&report);
    Ok(())
}

async fn status_command(config: &Config, session_id: &str) -> Result<()> {
    let session = attach_session(config, session_id).await?;
    let ctrl = session.controller();

    let finished = ctrl.all_stopped().await?;
    let report = session.report(finished).await?;
    println!("Threads:  {}", ctrl.thread_count().await?);
    print_report(&report);

    let events = ctrl.events().await?;
    if !events.is_empty() {
        println!("Events:");
        for event in events {
            println!(
                "  [{}] thread {} {}: {}",
                event.at, event.vmid, event.kind, event.data
            );
        }
    }
    Ok(())
}

async fn attach_session(config: &Config, session_id: &str) -> Result<Session> {
    let pool = DatabaseController::connect(config).await?;
    let ctrl = Arc::new(
        DatabaseController::attach(pool, config.lock.clone(), session_id.to_string()).await?,
    );
    let registry = Arc::new(ForeignRegistry::with_host_module());
    let invoker = Arc::new(TaskInvoker::new(ctrl.clone(), registry));
    Ok(Session::new(
        ctrl,
        invoker,
        Duration::from_millis(config.run.poll_interval_ms),
    ))
}

fn print_report(report: &RunReport) {
    if !report.finished {
        println!("Finished: no (threads still running)");
    }
    println!("Broken:   {}", report.broken);
    match &report.result {
        Some(value) => println!("Result:   {}", value.to_json()),
        None => println!("Result:   (none)"),
    }
    if !report.stdout.is_empty() {
        println!("Stdout:");
        for line in report.stdout.lines() {
            println!("  {line}");
        }
    }
    for error in &report.errors {
        println!("Error in thread {}: {}", error.vmid, error.message);
        if !error.trace.is_empty() {
            println!("{}", error.trace);
        }
    }
}
