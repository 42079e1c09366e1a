#![deny(unsafe_code)]

//! Vigil privileged helper — command-line entry point.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use vigil_config::{HelperConfig, SOCKET_PATH_ENV};
use vigil_core::{Daemon, RulesetClient};

/// Vigil privileged helper: installs firewall rulesets on behalf of the agent.
#[derive(Parser)]
#[command(name = "vigil-helper", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "/etc/vigil/helper.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the helper daemon. Must be started as root.
    Serve,

    /// Submit a ruleset to a running helper.
    Submit {
        /// Ruleset file, or `-` to read standard input.
        file: PathBuf,

        /// Socket path; defaults to the path the helper would bind.
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Seconds to wait for the helper's answer.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, loaded) = match load_config(&cli.config).await {
        Ok(loaded) => loaded,
        Err(e) => {
            // Bring up logging at the default level so the failure is
            // reported in the helper's own log format.
            let defaults = HelperConfig::default();
            if vigil_core::logging::init(&log_filter(cli.verbose, &defaults.logging.level)).is_ok()
            {
                error!(error = %e, "invalid configuration");
            }
            return Err(e);
        }
    };

    vigil_core::logging::init(&log_filter(cli.verbose, &config.logging.level))
        .map_err(|e| anyhow::anyhow!(e))?;

    if !loaded {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command {
        Commands::Serve => cmd_serve(config).await?,
        Commands::Submit {
            file,
            socket,
            timeout,
        } => cmd_submit(&config, &file, socket, timeout).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_serve(config: HelperConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting privileged helper");

    if let Err(e) = vigil_core::privilege::require_root() {
        error!(error = %e, "refusing to start");
        return Err(e.into());
    }

    let daemon = Daemon::new(config);
    daemon
        .run()
        .await
        .inspect_err(|e| error!(error = %e, "helper failed to start"))?;

    Ok(())
}

async fn cmd_submit(
    config: &HelperConfig,
    file: &Path,
    socket: Option<PathBuf>,
    timeout_secs: u64,
) -> Result<()> {
    let ruleset = read_ruleset(file).await?;
    if ruleset.len() > config.listener.max_payload_bytes {
        warn!(
            bytes = ruleset.len(),
            limit = config.listener.max_payload_bytes,
            "ruleset exceeds the helper's payload limit and will be dropped"
        );
    }

    let socket = socket.unwrap_or_else(|| {
        config
            .resolve_socket_path(std::env::var_os(SOCKET_PATH_ENV))
            .path
    });

    let client = RulesetClient::new(&socket).with_timeout(Duration::from_secs(timeout_secs));
    let response = client.submit(&ruleset).await?;
    println!("{response}");

    if !response.is_success() {
        bail!("ruleset was not applied: {response}");
    }
    Ok(())
}

async fn read_ruleset(file: &Path) -> Result<Vec<u8>> {
    if file == Path::new("-") {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        Ok(buf)
    } else {
        Ok(tokio::fs::read(file).await?)
    }
}

fn cmd_config(config_path: &Path, config: &HelperConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// `-v` and `-vv` override the configured level.
fn log_filter(verbose: u8, configured: &str) -> String {
    match verbose {
        0 => configured.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Load the config file if it exists; the flag reports whether it did.
async fn load_config(path: &Path) -> Result<(HelperConfig, bool)> {
    if path.exists() {
        let config = HelperConfig::load(path)
            .await
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((HelperConfig::default(), false))
    }
}
