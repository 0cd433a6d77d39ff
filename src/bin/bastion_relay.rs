// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! bastion-relay binary - SSH bastion that relays sessions to permitted hosts

use anyhow::{Context, Result};
use bastion_relay::server::config::{generate_config_template, load_config, RelayFileConfig};
use bastion_relay::server::directory::DirectoryRegistry;
use bastion_relay::server::BastionServer;
use bastion_relay::utils::logging;
use clap::{ArgAction, Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// SSH bastion relay - one login, relayed sessions to permitted hosts
#[derive(Parser, Debug)]
#[command(name = "bastion-relay")]
#[command(version)]
#[command(about = "SSH bastion that relays authenticated sessions to permitted hosts", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE", env = "BASTION_CONFIG")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay (default)
    Run,

    /// Check configuration file for errors
    CheckConfig,

    /// Generate a configuration file template
    GenConfig {
        /// Output path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Build the server directory once and print it
    ListServers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose);

    match cli.command {
        None | Some(Commands::Run) => run_server(&cli).await,
        Some(Commands::CheckConfig) => check_config(&cli),
        Some(Commands::GenConfig { output }) => gen_config(output),
        Some(Commands::ListServers) => list_servers(&cli).await,
    }
}

fn load(cli: &Cli) -> Result<RelayFileConfig> {
    match &cli.config {
        Some(path) => load_config(Some(path))
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => load_config(None).context("Failed to load configuration"),
    }
}

/// Run the relay until SIGINT or SIGTERM.
async fn run_server(cli: &Cli) -> Result<()> {
    tracing::info!("Starting bastion-relay");

    let config = load(cli)?;
    tracing::info!(
        address = %config.global.listen_path,
        servers = config.servers.len(),
        groups = config.awsinstances.len(),
        users = config.users.len(),
        "Configuration loaded"
    );

    let server = BastionServer::build(config).await?;
    let shutdown = setup_signal_handlers()?;

    server.run(shutdown).await.context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Check configuration file for errors
fn check_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    let global = &config.global;

    println!("Configuration is valid\n");
    println!("Relay:");
    println!("  Listen address: {}", global.listen_path);
    println!("  Host keys: {}", global.host_keys.len());
    for key in &global.host_keys {
        println!("    - {}", key.display());
    }
    println!("  Max connections: {}", global.max_connections);
    println!("  Max auth attempts: {}", global.max_auth_attempts);
    println!(
        "  Password auth: {}",
        if global.uses_directory_auth() {
            format!("directory ({})", global.ldap_server)
        } else {
            "disabled".to_string()
        }
    );
    println!("  Reuse password downstream: {}", global.pass_password);
    if let Some(path) = &global.log_path {
        println!("  Transcripts: {}", path.display());
    }
    if let Some(path) = &global.audit_log {
        println!("  Audit log: {}", path.display());
    }

    println!("\nDirectory:");
    println!("  Static servers: {}", config.servers.len());
    for (name, group) in &config.awsinstances {
        let regions = if group.regions.is_empty() {
            "all regions".to_string()
        } else {
            group.regions.join(", ")
        };
        println!("  Dynamic group {name}: /{}/ in {regions}", group.regex);
    }

    println!("\nAccess:");
    println!("  ACLs: {}", config.acls.len());
    println!("  Users: {}", config.users.len());

    Ok(())
}

/// Generate a configuration file template
fn gen_config(output: Option<PathBuf>) -> Result<()> {
    let template = generate_config_template();

    if let Some(path) = output {
        #[cfg(unix)]
        {
            use std::fs::OpenOptions;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .context("Failed to create configuration file")?;

            file.write_all(template.as_bytes())
                .context("Failed to write configuration file")?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, &template).context("Failed to write configuration file")?;
        }

        println!("Configuration template written to {}", path.display());
    } else {
        print!("{template}");
    }

    Ok(())
}

/// Rebuild the directory once and print every selection key.
async fn list_servers(cli: &Cli) -> Result<()> {
    let config = load(cli)?;
    let registry = DirectoryRegistry::from_config(&config)?;

    if let Err(e) = registry.rebuild().await {
        eprintln!("warning: {e}");
    }

    let Some(snapshot) = registry.snapshot().await else {
        anyhow::bail!("Directory could not be built");
    };

    let mut records: Vec<_> = snapshot.records().collect();
    records.sort_by(|a, b| a.key.cmp(&b.key));
    for record in records {
        match &record.origin {
            Some(origin) => println!("{}\t{}\t[{}]", record.key, record.connect_path, origin.group),
            None => println!("{}\t{}", record.key, record.connect_path),
        }
    }
    for group in snapshot.group_names() {
        eprintln!("group {group}: {} server(s)", snapshot.group_members(group).len());
    }
    Ok(())
}

/// Setup signal handlers for graceful shutdown
fn setup_signal_handlers() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal;

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    Ok(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["bastion-relay", "-c", "/etc/relay.yaml", "-vv", "list-servers"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/relay.yaml")));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::ListServers)));
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["bastion-relay"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_gen_config_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        gen_config(Some(path.clone())).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, generate_config_template());
    }
}
