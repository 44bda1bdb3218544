use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use espejo::config::{BackendConfig, Config, ConfigError};
use espejo::utils::redact_address;
use espejo::{Espejo, PostgresDriver};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "espejo")]
#[command(
    about = "A mirroring proxy for PostgreSQL: serve from a primary, replay queries on mirrors"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Espejo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the espejo proxy
    Run {
        /// Path to configuration file; defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on, e.g. ":5432"
        #[arg(short, long)]
        listen: Option<String>,
        /// Primary connection string
        #[arg(short, long)]
        primary: Option<String>,
        /// Mirror connection string, repeat for several mirrors
        #[arg(short, long = "mirror")]
        mirrors: Vec<String>,
        /// Log level (error, warn, info, debug, trace)
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            listen,
            primary,
            mirrors,
            log_level,
        } => run_espejo(config, listen, primary, mirrors, log_level).await,
        Commands::Config { output } => generate_config(output),
        Commands::Validate { config } => validate_config(config),
        Commands::Version => {
            show_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_espejo(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    primary: Option<String>,
    mirrors: Vec<String>,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };

    // Command line flags override the file
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    if let Some(primary) = primary {
        config.primary.address = primary;
    }
    if !mirrors.is_empty() {
        config.mirrors = mirrors.into_iter().map(BackendConfig::new).collect();
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config)?;

    info!("Starting espejo v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Configuration loaded from: {:?}", path);
    }
    info!(
        "Mirroring {} -> {} mirror(s)",
        redact_address(&config.primary.address),
        config.mirrors.len()
    );

    let driver = PostgresDriver::new();
    let mut espejo = Espejo::new(config);
    espejo
        .initialize(&driver)
        .await
        .context("Failed to initialize espejo")?;

    info!("Espejo initialized, serving clients...");
    espejo.run().await.context("Failed to run espejo")?;

    info!("Espejo stopped");
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  espejo run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max connections: {}", config.server.max_connections);
            println!(
                "  Primary {}: {}",
                config.primary_name(),
                redact_address(&config.primary.address)
            );
            println!("  Mirrors: {} instances", config.mirrors.len());
            for (name, address) in config.named_mirrors() {
                println!("    {}: {}", name, redact_address(&address));
            }
            println!(
                "  Mirror timeout: {}ms, queue capacity: {}, fail fast: {}",
                config.mirroring.query_timeout_ms,
                config.mirroring.queue_capacity,
                config.mirroring.fail_fast
            );
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("espejo v{}", env!("CARGO_PKG_VERSION"));
    println!("A mirroring proxy for PostgreSQL");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Results served from a single primary");
    println!("  • Every successful query replayed on each mirror, out of band");
    println!("  • Bounded, cancellable mirror dispatch");
    println!("  • Server version announced from the primary");
}

fn init_logging(config: &Config) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.logging.level);
    Ok(())
}
