//! portshift - port forwarding rule registry
//!
//! CLI for managing forwarding rules across four backends: a gost tunnel
//! unit, a haproxy config, an xray config and the kernel NAT table.
//!
//! # Usage
//!
//! ```bash
//! portshift status                      # All four backends
//! portshift status gost                 # One backend
//! portshift gost add --host 1.1.1.1 --port 9000
//! portshift gost remove --port 9000
//! portshift haproxy add --port 8443 --host 2.2.2.2 --dest-port 443
//! portshift haproxy remove --name tunnel-8443
//! portshift xray add --host 2.2.2.2 --port 8443 --dest-port 443
//! portshift iptables add --host 1.1.1.1 --ports 80,443
//! portshift iptables flush
//! ```

mod audit;
mod config;
mod core;
mod elevation;
mod service;
mod store;
mod utils;
mod validators;

use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use shadow_rs::shadow;

use crate::audit::AuditLog;
use crate::core::registry::{AddRequest, Backend, MutationOutcome, Registry, RemoveKey};
use crate::core::rule::ProtocolSet;
use crate::core::status::{BackendStatus, StatusAggregator};
use crate::service::{IptablesNat, SystemdControl};
use crate::store::FsStore;

shadow!(build);

#[derive(Parser)]
#[command(name = "portshift")]
#[command(about = "Port forwarding rule registry for gost, haproxy, xray and iptables", long_about = None)]
#[command(version = build::CLAP_LONG_VERSION)]
struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show unit state and declared rules, all backends by default
    Status {
        /// Restrict to one backend (gost, haproxy, xray, iptables)
        backend: Option<String>,
    },
    /// Manage gost unit-file forwards
    Gost {
        #[command(subcommand)]
        action: PortAction,
    },
    /// Manage haproxy frontend/backend stanza pairs
    Haproxy {
        #[command(subcommand)]
        action: HaproxyAction,
    },
    /// Manage xray dokodemo-door inbounds
    Xray {
        #[command(subcommand)]
        action: PortAction,
    },
    /// Manage kernel NAT forwards
    Iptables {
        #[command(subcommand)]
        action: IptablesAction,
    },
}

#[derive(Subcommand)]
enum PortAction {
    /// List the rules the live document declares
    List,
    /// Add a forward
    Add {
        /// Destination host (IP or hostname)
        #[arg(long)]
        host: String,
        /// Listen port
        #[arg(long)]
        port: u16,
        /// Destination port (defaults to the listen port)
        #[arg(long)]
        dest_port: Option<u16>,
        /// Protocols to forward: tcp, udp or tcp+udp
        #[arg(long, default_value = "tcp+udp")]
        protocol: String,
    },
    /// Remove the forward listening on a port
    Remove {
        #[arg(long)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum HaproxyAction {
    /// List the rules the live config declares
    List,
    /// Add a forward (TCP only)
    Add {
        /// Listen port
        #[arg(long)]
        port: u16,
        /// Destination host (IP or hostname)
        #[arg(long)]
        host: String,
        /// Destination port
        #[arg(long)]
        dest_port: u16,
    },
    /// Remove a forward by its frontend name (tunnel-<port>)
    Remove {
        #[arg(long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum IptablesAction {
    /// List DNAT forwards from the live kernel table
    List,
    /// Forward a port group to a host (tcp and udp)
    Add {
        /// Destination host (IPv4 address)
        #[arg(long)]
        host: String,
        /// Comma-separated listen ports, e.g. 80,443
        #[arg(long)]
        ports: String,
    },
    /// Flush all NAT rules and delete the persisted rules file
    Flush,
}

fn main() -> ExitCode {
    let _ = crate::utils::ensure_dirs();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config().await;
    let mut registry = Registry::new(FsStore, SystemdControl, IptablesNat, config);
    if let Ok(audit) = AuditLog::new() {
        registry = registry.with_audit(audit);
    }

    match command {
        Commands::Status { backend } => {
            let aggregator = StatusAggregator::new(&registry);
            let statuses = match backend {
                Some(name) => {
                    let backend = Backend::from_str(&name).map_err(|_| {
                        format!("unknown backend '{name}' (use gost, haproxy, xray or iptables)")
                    })?;
                    vec![aggregator.collect(backend).await]
                }
                None => aggregator.collect_all().await,
            };
            for status in statuses {
                print_status(&status);
            }
        }
        Commands::Gost { action } => handle_port_backend(&registry, Backend::Gost, action).await?,
        Commands::Xray { action } => handle_port_backend(&registry, Backend::Xray, action).await?,
        Commands::Haproxy { action } => match action {
            HaproxyAction::List => print_rules(&registry.list(Backend::Haproxy).await?),
            HaproxyAction::Add {
                port,
                host,
                dest_port,
            } => {
                validators::validate_port(port)?;
                validators::validate_port(dest_port)?;
                validators::validate_host(&host)?;
                let req = AddRequest {
                    ports: vec![port],
                    host,
                    dest_port: Some(dest_port),
                    protocols: ProtocolSet::single(crate::core::rule::Protocol::Tcp),
                };
                report(&registry.add(Backend::Haproxy, &req).await?);
            }
            HaproxyAction::Remove { name } => {
                report(
                    &registry
                        .remove(Backend::Haproxy, &RemoveKey::Name(name))
                        .await?,
                );
            }
        },
        Commands::Iptables { action } => match action {
            IptablesAction::List => print_rules(&registry.list(Backend::Iptables).await?),
            IptablesAction::Add { host, ports } => {
                validators::validate_host(&host)?;
                let ports = validators::validate_port_list(&ports)?;
                let req = AddRequest {
                    ports,
                    host,
                    dest_port: None,
                    protocols: ProtocolSet::both(),
                };
                report(&registry.add(Backend::Iptables, &req).await?);
            }
            IptablesAction::Flush => report(&registry.flush_nat().await?),
        },
    }
    Ok(())
}

/// gost and xray share the port-keyed action surface.
async fn handle_port_backend(
    registry: &Registry<FsStore, SystemdControl, IptablesNat>,
    backend: Backend,
    action: PortAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        PortAction::List => print_rules(&registry.list(backend).await?),
        PortAction::Add {
            host,
            port,
            dest_port,
            protocol,
        } => {
            validators::validate_port(port)?;
            if let Some(dp) = dest_port {
                validators::validate_port(dp)?;
            }
            validators::validate_host(&host)?;
            let req = AddRequest {
                ports: vec![port],
                host,
                dest_port,
                protocols: protocol.parse::<ProtocolSet>()?,
            };
            report(&registry.add(backend, &req).await?);
        }
        PortAction::Remove { port } => {
            report(&registry.remove(backend, &RemoveKey::Port(port)).await?);
        }
    }
    Ok(())
}

fn print_rules(rules: &[crate::core::rule::RuleRecord]) {
    if rules.is_empty() {
        println!("No rules declared.");
        return;
    }
    for rule in rules {
        println!("  {rule}  [{}]", rule.identity);
    }
}

fn print_status(status: &BackendStatus) {
    let state = match (status.active, status.enabled) {
        (true, true) => "active, enabled",
        (true, false) => "active, disabled",
        (false, true) => "inactive, enabled",
        (false, false) => "inactive, disabled",
    };
    println!("{} ({}): {state}", status.backend, status.unit);
    if let Some(error) = &status.error {
        println!("  ! {error}");
    }
    print_rules(&status.rules);
    println!();
}

fn report(outcome: &MutationOutcome) {
    println!("✓ {}", outcome.detail);
    if let Some(warning) = &outcome.restart_error {
        // The edit is committed; only the restart needs attention.
        eprintln!("Warning: {warning}");
    }
}
