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

//! hopgate - multi-hop SSH bastion with session recording.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hopgate::config::{generate_config_template, load_config, HopgateConfig};
use hopgate::server::BastionServer;
use hopgate::utils::logging;

/// Multi-hop SSH bastion that proxies and records session and port-forward channels
#[derive(Parser, Debug)]
#[command(name = "hopgate")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short = 'b', long, global = true, value_name = "ADDR")]
    bind_address: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true, value_name = "PORT")]
    port: Option<u16>,

    /// Host key file(s)
    #[arg(short = 'k', long = "host-key", global = true, value_name = "FILE")]
    host_keys: Vec<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bastion (default)
    Run,

    /// Check the configuration file for errors
    CheckConfig,

    /// Generate a configuration file template
    GenConfig {
        /// Output path (stdout if not specified)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init_logging(cli.verbose);

    match cli.command {
        None | Some(Commands::Run) => run_server(&cli).await,
        Some(Commands::CheckConfig) => check_config(&cli),
        Some(Commands::GenConfig { ref output }) => gen_config(output.as_ref()),
        Some(Commands::Version) => {
            println!("hopgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Load the configuration and apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<HopgateConfig> {
    let mut config = load_config(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    if let Some(bind_address) = &cli.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if !cli.host_keys.is_empty() {
        config.server.host_keys = cli.host_keys.clone();
    }
    Ok(config)
}

async fn run_server(cli: &Cli) -> Result<()> {
    tracing::info!("Starting hopgate");

    let config = resolve_config(cli)?;
    tracing::info!(
        address = %config.server.listen_address(),
        host_keys = config.server.host_keys.len(),
        logs_dir = %config.recording.logs_dir.display(),
        "Configuration loaded"
    );

    let server = BastionServer::new(config)?;
    let shutdown = server.shutdown_token();
    let shutdown_signal = setup_signal_handlers()?;

    tokio::select! {
        result = server.run() => {
            result.context("Server error")?;
        }
        _ = shutdown_signal => {
            shutdown.cancel();
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

fn check_config(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;

    println!("Configuration is valid\n");
    println!("Server:");
    println!("  Listen address: {}", config.server.listen_address());
    println!("  Host keys: {}", config.server.host_keys.len());
    for key in &config.server.host_keys {
        println!("    - {}", key.display());
    }
    println!("  Max auth attempts: {}", config.server.max_auth_attempts);

    println!("\nRecording:");
    println!("  Logs directory: {}", config.recording.logs_dir.display());
    println!("  On open failure: {:?}", config.recording.on_open_failure);

    println!("\nUsers: {}", config.users.len());
    for user in &config.users {
        println!("  - {} ({} keys)", user.name, user.authorized_keys.len());
    }

    println!("\nTargets: {}", config.targets.len());
    for (name, target) in &config.targets {
        let hops: Vec<&str> = target.hops.iter().map(|h| h.address.as_str()).collect();
        println!("  - {name}: {}", hops.join(" -> "));
    }

    Ok(())
}

fn gen_config(output: Option<&PathBuf>) -> Result<()> {
    let template = generate_config_template();

    let Some(path) = output else {
        print!("{template}");
        return Ok(());
    };

    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .context("Failed to create configuration file")?;
        file.write_all(template.as_bytes())
            .context("Failed to write configuration file")?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, &template).context("Failed to write configuration file")?;
    }

    println!("Configuration template written to {}", path.display());
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
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
                if let Err(error) = result {
                    tracing::warn!(%error, "Ctrl+C handler failed");
                }
                tracing::info!("Received SIGINT (Ctrl+C)");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM");
            }
        }
    })
}
