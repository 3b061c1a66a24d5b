mod config;
mod dispatcher;
mod error;
mod job;
mod processed;
mod queue;
mod signals;
mod store;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use dispatcher::{Dispatcher, SystemClock};
use job::ProcessLauncher;
use processed::ProcessedSet;
use queue::{CommandEntry, CommandQueue, OpaqueId, Submitter};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const TOOL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run queued chat commands through an external CLI tool.
#[derive(Debug, Parser)]
#[command(name = "cqmon", version, about)]
struct Cli {
    /// Settings file (default: ~/.claude/command_monitor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the command queue and launch pending commands.
    Run {
        /// Run a single poll cycle, then shut down.
        #[arg(long)]
        once: bool,
    },
    /// List queued commands that have not been launched yet.
    Pending,
    /// Sanitize a command and append it to the queue.
    Enqueue(EnqueueArgs),
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    /// Producer message id; with the timestamp it forms the command id.
    #[arg(long)]
    message_id: String,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    user_name: Option<String>,
    #[arg(long)]
    channel_id: Option<String>,
    #[arg(long)]
    guild_id: Option<String>,
    /// Command text; multiple words are joined with spaces.
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn run(config: &Config, once: bool) -> Result<i32> {
    if config.check_tool {
        if !job::tool_available(&config.tool_command, TOOL_PROBE_TIMEOUT) {
            error!(
                tool = %config.tool_command,
                "external tool not available, install it or set tool_command"
            );
            return Ok(1);
        }
        info!(tool = %config.tool_command, "external tool is available");
    }

    let stop = signals::install_stop_handler()?;
    let launcher = ProcessLauncher::new(&config.tool_command, &config.working_dir);
    let mut dispatcher = Dispatcher::new(config, launcher, SystemClock);
    dispatcher.run(&stop, once)?;
    Ok(0)
}

fn pending(config: &Config) -> Result<i32> {
    let processed = ProcessedSet::load(&config.processed_file);
    for entry in CommandQueue::new(&config.queue_file).pending(&processed) {
        println!("{}\t{}", entry.id(), entry.command);
    }
    Ok(0)
}

fn enqueue(config: &Config, args: EnqueueArgs) -> Result<i32> {
    let from = Submitter {
        user_id: args.user_id.as_deref().map(OpaqueId::parse_arg),
        user_name: args.user_name,
        channel_id: args.channel_id.as_deref().map(OpaqueId::parse_arg),
        guild_id: args.guild_id.as_deref().map(OpaqueId::parse_arg),
    };
    let entry = CommandEntry::submit(
        &args.text.join(" "),
        OpaqueId::parse_arg(&args.message_id),
        from,
    );
    let queue = CommandQueue::new(&config.queue_file);
    queue
        .append(entry.clone())
        .context("adding command to queue")?;
    info!(command_id = %entry.id(), command = %entry.command, "queued command");
    println!(
        "{}",
        serde_json::to_string(&entry).context("serializing queued command")?
    );
    Ok(0)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = Config::load(&cli.config.unwrap_or_else(Config::default_path)).and_then(
        |config| match cli.command {
            Command::Run { once } => run(&config, once),
            Command::Pending => pending(&config),
            Command::Enqueue(args) => enqueue(&config, args),
        },
    );

    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("cqmon: {err:#}");
            process::exit(2);
        }
    }
}
