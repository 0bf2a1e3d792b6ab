use std::path::PathBuf;

use agentwall_config::ConfigLoader;
use clap::{Parser, Subcommand};

/// AgentWall — governance gateway for autonomous-agent LLM calls
#[derive(Parser)]
#[command(name = "agentwall", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to agentwall.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (blocks until shutdown)
    Serve,
    /// Show version and build info
    Version,
    /// Show or audit the resolved configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the fully-resolved configuration (file + env overrides + defaults)
    Show {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and print any warnings
    Validate,
}

impl Cli {
    pub async fn run(self) -> agentwall_core::Result<()> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(config.logging.level.as_str())
        };

        init_tracing(log_level, &config.logging.format);

        match self.command {
            Commands::Serve => cmd_serve(config, config_loader).await,
            Commands::Version => cmd_version(),
            Commands::Config { action } => match action {
                ConfigAction::Show { json } => cmd_config_show(config, json),
                ConfigAction::Validate => cmd_config_validate(config),
            },
        }
    }
}

/// Initialize `tracing` with the format the gateway's own logging config
/// names — `json` for structured production logs, anything else falls back
/// to the human-readable default.
fn init_tracing(log_level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

async fn cmd_serve(
    config: agentwall_config::AgentWallConfig,
    config_loader: ConfigLoader,
) -> agentwall_core::Result<()> {
    println!("AgentWall v{}", env!("CARGO_PKG_VERSION"));
    println!("   Listening on: {}", config.server.listen);
    println!("   DLP mode: {}", config.dlp.mode);
    println!(
        "   Default run limits: {} steps, ${:.2}, {}s timeout",
        config.run.default_max_steps, config.run.default_max_budget_usd, config.run.default_timeout_seconds
    );
    println!();

    let _watcher = match config_loader.watch() {
        Ok(w) => {
            println!("   Config hot-reload: enabled");
            Some(w)
        }
        Err(e) => {
            tracing::warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    let state = agentwall_server::AppState::from_config(&config);
    agentwall_server::start_server(state, &config)
        .await
        .map_err(agentwall_core::AgentWallError::Io)
}

fn cmd_version() -> agentwall_core::Result<()> {
    println!("AgentWall v{}", env!("CARGO_PKG_VERSION"));
    println!("   Rust edition: 2024");
    println!("   Target: {}", std::env::consts::ARCH);
    println!("   OS: {}", std::env::consts::OS);
    #[cfg(debug_assertions)]
    println!("   Profile: debug");
    #[cfg(not(debug_assertions))]
    println!("   Profile: release");
    Ok(())
}

fn cmd_config_show(config: agentwall_config::AgentWallConfig, json: bool) -> agentwall_core::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!(
            "{}",
            toml::to_string_pretty(&config).map_err(|e| agentwall_core::AgentWallError::Internal(e.to_string()))?
        );
    }
    Ok(())
}

fn cmd_config_validate(config: agentwall_config::AgentWallConfig) -> agentwall_core::Result<()> {
    println!("AgentWall — Configuration Audit");
    println!();

    let warnings = match config.validate() {
        Ok(w) => w,
        Err(e) => {
            println!("{e}");
            return Ok(());
        }
    };

    if warnings.is_empty() {
        println!("  all checks passed");
        return Ok(());
    }

    for w in &warnings {
        println!("  {w}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_subcommand() {
        let cli = Cli::try_parse_from(["agentwall", "serve"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn cli_parses_config_show_with_json_flag() {
        let cli = Cli::try_parse_from(["agentwall", "config", "show", "--json"]).unwrap();
        match cli.command {
            Commands::Config { action: ConfigAction::Show { json } } => assert!(json),
            _ => panic!("expected Config::Show"),
        }
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        let result = Cli::try_parse_from(["agentwall", "--verbose", "--quiet", "serve"]);
        assert!(result.is_err());
    }
}
