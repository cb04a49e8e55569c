//! `catty`: run agent programs on remote machines with local terminal feel.

mod api;
mod commands;
mod credentials;
mod relay;
mod terminal;
mod workspace;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use crate::commands::session::RunOptions;

#[derive(Parser)]
#[command(
    name = "catty",
    version,
    about = "Remote agent terminal streaming",
    long_about = "Run AI agents on remote machines with local terminal feel"
)]
struct Cli {
    /// API server address (default: http://127.0.0.1:4815)
    #[arg(long, global = true, env = "CATTY_API")]
    api: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate with Catty to start remote sessions
    Login,
    /// Remove stored credentials and log out
    Logout,
    /// Start a new remote agent session
    New {
        /// Agent to use: claude or codex
        #[arg(long, default_value = "claude")]
        agent: String,
        /// Don't upload the current directory to the remote session
        #[arg(long)]
        no_upload: bool,
        #[arg(long, default_value = "iad")]
        region: String,
        #[arg(long, default_value_t = 1)]
        cpus: u32,
        /// Memory in MB
        #[arg(long, default_value_t = 1024)]
        memory: u32,
        /// Session TTL in seconds
        #[arg(long, default_value_t = 7200)]
        ttl: u64,
    },
    /// Start a new session running an arbitrary command
    Run {
        #[arg(long, default_value = "custom")]
        agent: String,
        #[arg(long, default_value = "auto")]
        region: String,
        #[arg(long, default_value_t = 1)]
        cpus: u32,
        #[arg(long, default_value_t = 1024)]
        memory: u32,
        #[arg(long, default_value_t = 7200)]
        ttl: u64,
        #[arg(long)]
        no_upload: bool,
        /// Command to run, after `--`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// List all sessions
    #[command(alias = "ls")]
    List,
    /// Stop a session by id or label
    Stop {
        id_or_label: String,
        /// Delete the machine after stopping
        #[arg(long)]
        delete: bool,
    },
    /// Stop and delete ALL sessions
    #[command(name = "stop-all-sessions-dangerously", hide = true)]
    StopAll {
        #[arg(long = "yes-i-mean-it")]
        yes_i_mean_it: bool,
    },
    /// Reconnect to an existing session by its label
    Connect { label: String },
    /// Print the client version
    Version,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Login => commands::login::login(cli.api).await,
        Commands::Logout => commands::login::logout(),
        Commands::New {
            agent,
            no_upload,
            region,
            cpus,
            memory,
            ttl,
        } => {
            let cmd = match agent.as_str() {
                "claude" => vec!["claude-wrapper".to_string()],
                "codex" => vec!["codex".to_string()],
                other => bail!("unknown agent: {other} (must be 'claude' or 'codex')"),
            };
            eprintln!("Starting {agent} session...");
            commands::session::run(
                cli.api,
                RunOptions {
                    agent,
                    cmd,
                    region,
                    cpus,
                    memory_mb: memory,
                    ttl_sec: ttl,
                    upload_workspace: !no_upload,
                },
            )
            .await
        }
        Commands::Run {
            agent,
            region,
            cpus,
            memory,
            ttl,
            no_upload,
            command,
        } => {
            let cmd = if command.is_empty() {
                vec!["/bin/sh".to_string()]
            } else {
                command
            };
            commands::session::run(
                cli.api,
                RunOptions {
                    agent,
                    cmd,
                    region,
                    cpus,
                    memory_mb: memory,
                    ttl_sec: ttl,
                    upload_workspace: !no_upload,
                },
            )
            .await
        }
        Commands::List => commands::list::list(cli.api).await,
        Commands::Stop {
            id_or_label,
            delete,
        } => commands::stop::stop(cli.api, &id_or_label, delete).await,
        Commands::StopAll { yes_i_mean_it } => {
            commands::stop::stop_all(cli.api, yes_i_mean_it).await
        }
        Commands::Connect { label } => commands::connect::connect(cli.api, &label).await,
        Commands::Version => {
            println!("catty {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
