//! baton - local demo wiring for baton-core.
//!
//! `serve` runs the dispatcher (and inbox watcher) with a logging actuator;
//! the other subcommands inspect or feed the store directly.

use std::path::PathBuf;
use std::sync::Arc;

use baton_core::domain::{EnvelopeId, Priority, TaskId};
use baton_core::impls::LoggingActuator;
use baton_core::{App, AppBuilder, BatonConfig, Bucket};
use clap::{Parser, Subcommand, ValueEnum};
use eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "baton", version, about = "Serialized dispatch onto one shared actuator")]
struct Cli {
    /// Config file (default: ./baton.yml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the dispatcher and inbox watcher until Ctrl-C
    Serve,

    /// Print queue counts, lock holder and task states as JSON
    Status,

    /// Enqueue one envelope
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        tag: String,
        /// Explicit command (defaults to the tag)
        #[arg(long)]
        command: Option<String>,
        /// JSON document, or plain text
        #[arg(long, default_value = "")]
        body: String,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
        #[arg(long)]
        task_id: Option<String>,
        /// Caller-chosen id (default: generated)
        #[arg(long)]
        id: Option<String>,
    },

    /// List the envelopes in one bucket as JSON
    List {
        #[arg(value_enum, default_value_t = BucketArg::Pending)]
        bucket: BucketArg,
    },

    /// Confirm receipt of a completed envelope
    Ack { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Critical,
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Critical => Priority::Critical,
            PriorityArg::High => Priority::High,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BucketArg {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<BucketArg> for Bucket {
    fn from(arg: BucketArg) -> Self {
        match arg {
            BucketArg::Pending => Bucket::Pending,
            BucketArg::Processing => Bucket::Processing,
            BucketArg::Completed => Bucket::Completed,
            BucketArg::Failed => Bucket::Failed,
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = BatonConfig::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;
    let app = AppBuilder::new(config)
        .with_actuator(Arc::new(LoggingActuator))
        .build()
        .wrap_err("failed to build app")?;

    match cli.command {
        Command::Serve => serve(&app).await,
        Command::Status => {
            let report = app.status().wrap_err("failed to collect status")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Send {
            from,
            to,
            tag,
            command,
            body,
            priority,
            task_id,
            id,
        } => {
            let body = if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
            };
            let mut envelope = app.envelope(&from, &to, &tag, body).with_priority(priority.into());
            if let Some(id) = id {
                envelope.id = EnvelopeId::parse(id)?;
            }
            if let Some(task_id) = task_id {
                envelope = envelope.with_task(TaskId::parse(task_id)?);
            }
            envelope.command = command;
            let id = app.store.enqueue(envelope)?;
            println!("{id}");
            Ok(())
        }
        Command::List { bucket } => {
            let envelopes = app.store.list(bucket.into())?;
            println!("{}", serde_json::to_string_pretty(&envelopes)?);
            Ok(())
        }
        Command::Ack { id } => {
            let envelope = app.store.acknowledge(&EnvelopeId::parse(id)?)?;
            println!("{}", envelope.id);
            Ok(())
        }
    }
}

async fn serve(app: &App) -> Result<()> {
    info!(
        root = %app.store.root().display(),
        holder = %app.dispatcher.holder(),
        commands = ?app.router.commands(),
        "baton serving"
    );
    let services = app.spawn();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
        _ = services.stopped() => {}
    }
    services
        .shutdown_and_join()
        .await
        .wrap_err("dispatcher stopped with an error")
}
