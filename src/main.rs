//! xtunnel - manage saved SSH tunnels, start them and keep them up until Ctrl+C

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (copy buffers, channel messages)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use xtunnel_lib::commands::{self, DefinitionEdit};
use xtunnel_lib::config::{self, TunnelStore};
use xtunnel_lib::{
    init_logging, write_startup_log, RusshConnector, TunnelDefinition, TunnelEvent, TunnelManager,
};

#[derive(Parser)]
#[command(name = "xtunnel")]
#[command(version)]
#[command(about = "Named SSH-tunneled TCP forwarders")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Tunnel identifiers to start
    identifiers: Vec<String>,

    /// Start every saved tunnel
    #[arg(long, conflicts_with = "identifiers")]
    all: bool,

    /// Path to config.json (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// List saved tunnels and exit
    #[arg(long)]
    list: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Save a new tunnel definition
    Add(AddArgs),
    /// Change fields of a saved tunnel definition
    Edit {
        /// Identifier of the saved tunnel
        identifier: String,
        #[command(flatten)]
        fields: EditArgs,
    },
    /// Delete a saved tunnel definition
    Rm {
        /// Identifier of the saved tunnel
        identifier: String,
    },
}

#[derive(Args)]
struct AddArgs {
    /// Identifier (generated when omitted)
    #[arg(long)]
    id: Option<String>,
    /// Display name
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    remote_ip: String,
    /// Remote port, also used as the local listening port
    #[arg(long)]
    remote_port: String,
    #[arg(long)]
    server_ip: String,
    #[arg(long, default_value = "22")]
    server_port: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    password: String,
}

impl From<AddArgs> for TunnelDefinition {
    fn from(args: AddArgs) -> Self {
        TunnelDefinition {
            identifier: args.id.unwrap_or_default(),
            config_name: args.name.unwrap_or_default(),
            remote_ip: args.remote_ip,
            remote_port: args.remote_port,
            server_ip: args.server_ip,
            server_port: args.server_port,
            user_name: args.user,
            password: args.password,
            ..Default::default()
        }
    }
}

#[derive(Args)]
struct EditArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    remote_ip: Option<String>,
    #[arg(long)]
    remote_port: Option<String>,
    #[arg(long)]
    server_ip: Option<String>,
    #[arg(long)]
    server_port: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
}

impl From<EditArgs> for DefinitionEdit {
    fn from(args: EditArgs) -> Self {
        DefinitionEdit {
            config_name: args.name,
            remote_ip: args.remote_ip,
            remote_port: args.remote_port,
            server_ip: args.server_ip,
            server_port: args.server_port,
            user_name: args.user,
            password: args.password,
        }
    }
}

/// Run one definition command against the store and the registry
async fn run_command(command: Command, store: &TunnelStore, manager: &TunnelManager) -> ExitCode {
    let result = match command {
        Command::Add(args) => commands::create_tunnel(store, manager, args.into())
            .await
            .map(|def| println!("{}\t{}", def.identifier, def.display_name())),
        Command::Edit { identifier, fields } => {
            commands::edit_tunnel(store, manager, &identifier, fields.into())
                .await
                .map(|def| println!("{}\t{}", def.identifier, def.display_name()))
        }
        Command::Rm { identifier } => commands::delete_tunnel(store, manager, &identifier).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Flushes the log file on exit
    let _log_guard = init_logging();
    info!("Starting xtunnel v{}", env!("CARGO_PKG_VERSION"));
    write_startup_log("xtunnel starting");

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => match config::app_config_file() {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to locate config file: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    let app_config = match config::load_app_config(&config_path).await {
        Ok(app_config) => app_config,
        Err(e) => {
            error!("Failed to load {:?}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    let store = match app_config.tunnels_dir.clone() {
        Some(dir) => TunnelStore::with_dir(dir),
        None => match TunnelStore::new() {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to open tunnel store: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };
    let definitions = match store.load().await {
        Ok(definitions) => definitions,
        Err(e) => {
            error!("Failed to load tunnel definitions from {:?}: {}", store.dir(), e);
            return ExitCode::FAILURE;
        }
    };

    let manager = Arc::new(TunnelManager::new(
        Arc::new(RusshConnector::new()),
        app_config.settings,
    ));
    manager.load_definitions(&definitions);

    if let Some(command) = cli.command {
        return run_command(command, &store, &manager).await;
    }

    if cli.list {
        for def in &definitions {
            println!(
                "{}\t{}\t{}:{} via {}:{}",
                def.identifier,
                def.display_name(),
                def.remote_ip,
                def.remote_port,
                def.server_ip,
                def.server_port
            );
        }
        return ExitCode::SUCCESS;
    }

    let targets: Vec<String> = if cli.all {
        manager
            .list_tunnels()
            .into_iter()
            .map(|info| info.identifier)
            .collect()
    } else {
        cli.identifiers
    };

    if targets.is_empty() {
        warn!("No tunnels selected; pass identifiers or --all");
        return ExitCode::FAILURE;
    }

    // Surface asynchronous failures while we wait
    let mut events = manager.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TunnelEvent::KeepaliveLost { identifier, error } => {
                    warn!("Tunnel {} lost its relay session: {}", identifier, error)
                }
                TunnelEvent::Reconnected { identifier, attempt } => {
                    info!("Tunnel {} reconnected (cycle {})", identifier, attempt)
                }
                _ => {}
            }
        }
    });

    let starts = targets.iter().map(|identifier| {
        let manager = manager.clone();
        let identifier = identifier.clone();
        async move {
            let result = manager.start_tunnel(&identifier).await;
            (identifier, result)
        }
    });

    let mut running = 0;
    for (identifier, result) in futures_util::future::join_all(starts).await {
        match result {
            Ok(()) => running += 1,
            Err(e) => error!("Failed to start {}: {}", identifier, e),
        }
    }
    info!("{} of {} tunnel(s) running", running, targets.len());

    if running > 0 {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received Ctrl+C, initiating shutdown...");
    }

    manager.stop_all().await;
    event_task.abort();
    info!("xtunnel stopped");

    if running == 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
