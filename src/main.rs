//! Serve CLI - run local static-file servers backed by Caddy
//!
//! Usage:
//!   serve list                     List servers and their status
//!   serve add <root> <port>        Create a server for a directory
//!   serve start <id>               Start a server and keep it running
//!   serve stop <id>                Stop a server run by another serve process
//!   serve status <id>              Show a server's status
//!   serve rename <old> <new>       Rename a server
//!   serve remove <id>              Delete a server and its logs
//!   serve show <id>                Print a server's Caddyfile
//!   serve run [<id>...]            Start servers (all by default), stop them on Ctrl+C
//!
//! `start` and `run` supervise their servers in the foreground. Other
//! invocations find them through the pid file in each server directory.
//!
//! Options:
//!   --config <path>                Configuration file (default: <config dir>/Serve/config.toml)

use anyhow::{Context, Result};
use serve::config::ServeConfig;
use serve::layout::Layout;
use serve::{ProcessManager, Status, StatusNotifier};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// CLI command structure
#[derive(Debug, PartialEq)]
enum Command {
    List,
    Add { root: PathBuf, port: u16 },
    Start { id: String },
    Stop { id: String },
    Status { id: String },
    Rename { old_id: String, new_id: String },
    Remove { id: String },
    Show { id: String },
    Run { ids: Vec<String> },
    Help,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serve=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, rest) = split_config_flag(&args)?;
    let command = parse_command(&rest)?;

    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let config = load_config(config_path)?;
    let layout = Layout::new(config.storage.root());
    let notifier = StatusNotifier::new(config.notifications.capacity);
    let manager = ProcessManager::new(layout, config.caddy.clone(), notifier);

    match command {
        Command::List => handle_list(&manager).await?,
        Command::Add { root, port } => {
            let root = std::fs::canonicalize(&root)
                .with_context(|| format!("Cannot resolve root {}", root.display()))?;
            let definition = manager.create_server(root, port)?;
            println!("{}", definition.id);
        }
        Command::Start { id } => handle_run(&manager, vec![id]).await?,
        Command::Run { ids } => handle_run(&manager, ids).await?,
        Command::Stop { id } => {
            manager.server(&id)?;
            if manager.stop_anywhere(&id).await? {
                println!("{} stopped", id);
            } else {
                println!("{} is not running", id);
            }
        }
        Command::Status { id } => {
            manager.server(&id)?;
            println!("{}", manager.status_anywhere(&id).await);
        }
        Command::Rename { old_id, new_id } => {
            let definition = manager.rename_server(&old_id, &new_id).await?;
            println!("{}", definition.id);
        }
        Command::Remove { id } => manager.delete_server(&id).await?,
        Command::Show { id } => {
            manager.server(&id)?;
            let path = manager.layout().caddyfile_path(&id);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            print!("{}", text);
        }
        Command::Help => print_help(),
    }

    Ok(())
}

fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }

    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    let arg = |index: usize, name: &str| -> Result<String> {
        args.get(index)
            .cloned()
            .with_context(|| format!("missing <{}> argument", name))
    };

    let command = match first.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "list" | "ls" => Command::List,
        "add" | "create" => {
            let root = PathBuf::from(arg(1, "root")?);
            let port = arg(2, "port")?
                .parse::<u16>()
                .context("<port> must be a number between 1 and 65535")?;
            Command::Add { root, port }
        }
        "start" => Command::Start { id: arg(1, "id")? },
        "stop" => Command::Stop { id: arg(1, "id")? },
        "status" => Command::Status { id: arg(1, "id")? },
        "rename" | "mv" => Command::Rename {
            old_id: arg(1, "old")?,
            new_id: arg(2, "new")?,
        },
        "remove" | "rm" | "delete" => Command::Remove { id: arg(1, "id")? },
        "show" | "cat" => Command::Show { id: arg(1, "id")? },
        "run" => Command::Run {
            ids: args[1..].to_vec(),
        },
        other => anyhow::bail!("unknown command '{}', try 'serve help'", other),
    };

    Ok(command)
}

fn load_config(path: Option<PathBuf>) -> Result<ServeConfig> {
    let path = match path {
        Some(path) => path,
        None => match ServeConfig::default_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(ServeConfig::default()),
        },
    };

    let config = ServeConfig::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn handle_list(manager: &Arc<ProcessManager>) -> Result<()> {
    let statuses = manager.list_statuses().await?;
    if statuses.is_empty() {
        println!("No servers configured. Add one with 'serve add <root> <port>'.");
        return Ok(());
    }

    println!("{:<38} {:<6} {:<8} ROOT", "ID", "PORT", "STATUS");
    for (definition, status) in statuses {
        println!(
            "{:<38} {:<6} {:<8} {}",
            definition.id,
            definition.port,
            status,
            definition.root.display()
        );
    }
    Ok(())
}

/// Start servers and supervise them until Ctrl+C/SIGTERM
async fn handle_run(manager: &Arc<ProcessManager>, ids: Vec<String>) -> Result<()> {
    let definitions = if ids.is_empty() {
        manager.list_servers()?
    } else {
        ids.iter()
            .map(|id| manager.server(id))
            .collect::<serve::Result<Vec<_>>>()?
    };

    if definitions.is_empty() {
        anyhow::bail!("no servers to run");
    }

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(id = %event.server_id, status = %event.status, "Status changed");
        }
    });

    let mut started = 0usize;
    for definition in &definitions {
        match manager.start(definition).await {
            Ok(()) => {
                started += 1;
                println!("{} running on http://localhost:{}", definition.id, definition.port);
            }
            Err(e) => error!(id = %definition.id, error = %e, "Failed to start server"),
        }
    }

    if started == 0 {
        anyhow::bail!("no server could be started");
    }

    wait_for_shutdown(manager).await;

    let report = manager.kill_all().await;
    if !report.abandoned.is_empty() {
        warn!(servers = ?report.abandoned, "Some servers could not be stopped");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal while watching for servers that died
async fn wait_for_shutdown(manager: &Arc<ProcessManager>) {
    // Also how quickly a `serve stop` from another shell is noticed
    let poll = std::time::Duration::from_millis(500);

    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            None
        }
    };

    loop {
        #[cfg(unix)]
        let terminate = async {
            match sigterm.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                return;
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down...");
                return;
            }
            _ = tokio::time::sleep(poll) => {
                if manager.running_servers().await.is_empty() {
                    warn!("No server is running anymore, exiting");
                    return;
                }
            }
        }
    }
}

fn print_help() {
    println!(
        "serve {} - run local static-file servers backed by Caddy

Usage:
  serve list                     List servers and their status
  serve add <root> <port>        Create a server for a directory
  serve start <id>               Start a server and keep it running
  serve stop <id>                Stop a server run by another serve process
  serve status <id>              Show a server's status
  serve rename <old> <new>       Rename a server
  serve remove <id>              Delete a server and its logs
  serve show <id>                Print a server's Caddyfile
  serve run [<id>...]            Start servers (all by default), stop them on Ctrl+C

Options:
  --config <path>                Configuration file

Status values: {} / {}",
        env!("CARGO_PKG_VERSION"),
        Status::Running,
        Status::Stopped
    );
}
