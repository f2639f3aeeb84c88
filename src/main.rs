mod config;
mod control;
mod engine;
mod error;
mod fleet;
mod monitor;
mod reconcile;
mod signal;
mod status;
mod transition;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::control::LifecycleOp;
use crate::engine::Engine;
use crate::fleet::{FleetModel, Group};

#[derive(Parser)]
#[command(name = "vmfleet", about = "Fleet manager for locally hosted VMs, driven through the hypervisor control tool")]
struct Cli {
    /// Path to config file (TOML).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all known groups and machines.
    List {
        /// Include machines and groups flagged hidden.
        #[arg(long)]
        all: bool,
        /// Refresh from the hypervisor before listing.
        #[arg(long)]
        refresh: bool,
    },
    /// Query a machine's live status from the hypervisor.
    Status { machine: String },
    /// Start a machine, or every eligible machine in a group.
    Start {
        target: String,
        #[arg(long)]
        group: bool,
    },
    /// Stop a machine, or every eligible machine in a group.
    Stop {
        target: String,
        #[arg(long)]
        group: bool,
    },
    /// Pause a machine, or every running machine in a group.
    Pause {
        target: String,
        #[arg(long)]
        group: bool,
    },
    /// Resume a paused machine, or every paused machine in a group.
    Resume {
        target: String,
        #[arg(long)]
        group: bool,
    },
    /// Suspend a machine, or every running machine in a group.
    Suspend {
        target: String,
        #[arg(long)]
        group: bool,
    },
    /// Snapshot operations.
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Rename a machine.
    Rename { machine: String, new_name: String },
    /// Register an existing machine bundle with the hypervisor.
    Register { path: PathBuf },
    /// Unregister a machine (keeps its files).
    Unregister { machine: String },
    /// Delete a machine permanently.
    Delete { machine: String },
    /// Capture a machine's screen to an image file.
    Screenshot { machine: String, file: PathBuf },
    /// Set a configuration key on a machine (e.g. memsize 2048).
    SetConfig {
        machine: String,
        key: String,
        value: String,
    },
    /// Group management.
    #[command(subcommand)]
    Group(GroupCommands),
    /// Move a machine into a group.
    Move { machine: String, group: String },
    /// Hide a machine or group from listings.
    Hide { target: String },
    /// Unhide a machine or group.
    Show { target: String },
    /// Run the engine: event monitor plus periodic reconciler.
    Daemon,
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List a machine's snapshots.
    List { machine: String },
    /// Create a named snapshot.
    Create { machine: String, name: String },
    /// Delete a snapshot by identifier.
    Delete { machine: String, snapshot: String },
    /// Restore a machine to a snapshot.
    Restore { machine: String, snapshot: String },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Create a group, optionally nested under a parent group.
    Create {
        name: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Remove a group; its machines move to the ungrouped group.
    Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut engine = Engine::new(config)?;

    match cli.command {
        Commands::List { all, refresh } => {
            if refresh {
                engine.refresh_now().await?;
            }
            let show_hidden = all || engine.show_hidden();
            print!("{}", render_tree(&engine.model_view().await, show_hidden));
        }
        Commands::Status { machine } => {
            let status = engine.machine_status(&machine).await?;
            println!("{status}");
        }
        Commands::Start { target, group } => lifecycle(&engine, &target, group, LifecycleOp::Start).await?,
        Commands::Stop { target, group } => lifecycle(&engine, &target, group, LifecycleOp::Stop).await?,
        Commands::Pause { target, group } => lifecycle(&engine, &target, group, LifecycleOp::Pause).await?,
        Commands::Resume { target, group } => lifecycle(&engine, &target, group, LifecycleOp::Resume).await?,
        Commands::Suspend { target, group } => lifecycle(&engine, &target, group, LifecycleOp::Suspend).await?,
        Commands::Snapshot(cmd) => match cmd {
            SnapshotCommands::List { machine } => {
                let snapshots = engine.snapshots(&machine).await?;
                if snapshots.is_empty() {
                    println!("no snapshots");
                }
                for snap in snapshots {
                    let marker = if snap.current { "*" } else { " " };
                    let parent = snap.parent.as_deref().unwrap_or("-");
                    println!("{marker} {}  {}  (parent: {parent})", snap.id, snap.name);
                }
            }
            SnapshotCommands::Create { machine, name } => {
                engine.snapshot_create(&machine, &name).await?;
                println!("snapshot '{name}' created");
            }
            SnapshotCommands::Delete { machine, snapshot } => {
                engine.snapshot_delete(&machine, &snapshot).await?;
                println!("snapshot {snapshot} deleted");
            }
            SnapshotCommands::Restore { machine, snapshot } => {
                engine.snapshot_restore(&machine, &snapshot).await?;
                println!("restored to snapshot {snapshot}");
            }
        },
        Commands::Rename { machine, new_name } => {
            engine.rename_machine(&machine, &new_name).await?;
            println!("renamed to {new_name}");
        }
        Commands::Register { path } => {
            engine.register_machine(&path).await?;
            println!("registered {}", path.display());
        }
        Commands::Unregister { machine } => {
            engine.unregister_machine(&machine).await?;
            println!("unregistered {machine}");
        }
        Commands::Delete { machine } => {
            engine.delete_machine(&machine).await?;
            println!("deleted {machine}");
        }
        Commands::Screenshot { machine, file } => {
            engine.capture_screen(&machine, &file).await?;
            println!("captured to {}", file.display());
        }
        Commands::SetConfig { machine, key, value } => {
            engine.set_machine_config(&machine, &key, &value).await?;
            println!("{key} set");
        }
        Commands::Group(cmd) => match cmd {
            GroupCommands::Create { name, parent } => {
                engine.create_group(&name, parent.as_deref()).await?;
                println!("group '{name}' created");
            }
            GroupCommands::Remove { name } => {
                engine.remove_group(&name).await?;
                println!("group '{name}' removed");
            }
        },
        Commands::Move { machine, group } => {
            engine.move_machine(&machine, &group).await?;
            println!("moved {machine} to {group}");
        }
        Commands::Hide { target } => {
            engine.set_hidden(&target, true).await?;
        }
        Commands::Show { target } => {
            engine.set_hidden(&target, false).await?;
        }
        Commands::Daemon => {
            engine
                .run_daemon()
                .await
                .context("running fleet engine")?;
        }
    }

    Ok(())
}

async fn lifecycle(
    engine: &Engine,
    target: &str,
    group: bool,
    op: LifecycleOp,
) -> Result<()> {
    if group {
        let touched = engine.group_lifecycle(target, op).await?;
        println!("{op}: {touched} machine(s)");
    } else {
        let status = engine.machine_lifecycle(target, op).await?;
        println!("{target}: {status}");
    }
    Ok(())
}

/// Render the group/machine tree, indented by nesting depth.
fn render_tree(model: &FleetModel, show_hidden: bool) -> String {
    use std::fmt::Write;

    fn render_group(out: &mut String, group: &Group, depth: usize, show_hidden: bool) {
        if group.hidden && !show_hidden {
            return;
        }
        let pad = "  ".repeat(depth);
        let _ = writeln!(out, "{pad}{}/", group.name);
        for machine in &group.machines {
            if machine.hidden && !show_hidden {
                continue;
            }
            let pad = "  ".repeat(depth + 1);
            let address = machine.address.as_deref().unwrap_or("-");
            let _ = writeln!(out, "{pad}{}  [{}]  {}", machine.name, machine.status, address);
        }
        for child in &group.children {
            render_group(out, child, depth + 1, show_hidden);
        }
    }

    if model.top_level().is_empty() {
        return "no machines known; try 'vmfleet list --refresh'\n".to_string();
    }
    let mut out = String::new();
    for group in model.top_level() {
        render_group(&mut out, group, 0, show_hidden);
    }
    out
}
