use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use voxline_call::{CallRegistry, CallServices};
use voxline_core::config::Config;
use voxline_core::credentials::{CredentialProvider, StaticCredential};
use voxline_core::types::CallDirection;
use voxline_live::{Connector, MemoryConnector, WebSocketConnector};
use voxline_media::{FileDevices, LogSynthesizer, SpeechSynthesizer};

mod call;
mod logging;
mod models;
mod probe;

#[derive(Parser)]
#[command(
    name = "voxline",
    about = "Full-duplex voice calls against a live streaming AI service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// API key (overrides live.api_key and the environment)
    #[arg(long, global = true, env = "VOXLINE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Use the in-process echo service instead of the network
    #[arg(long, global = true)]
    offline: bool,

    /// Record metrics and print them in Prometheus format on exit
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated call
    Call {
        #[command(subcommand)]
        direction: CallAction,

        /// Raw 16 kHz mono PCM16 file used as the microphone
        #[arg(long)]
        mic: Option<PathBuf>,

        /// File receiving everything the speaker plays
        #[arg(long)]
        speaker: Option<PathBuf>,
    },

    /// Connect, send one greeting and print the first reply
    Probe {
        /// Text to send
        #[arg(short, long)]
        message: Option<String>,

        /// Seconds to wait for setup and for the reply
        #[arg(long, default_value_t = 15)]
        wait: u64,
    },

    /// Model availability
    Models {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary
    Status,
}

#[derive(Subcommand)]
enum CallAction {
    /// Receive a call (screened, then auto-answered)
    Incoming {
        #[arg(long)]
        from: String,
    },
    /// Place a call
    Outgoing {
        #[arg(long)]
        to: String,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Check which models answer with the configured key
    Check { models: Vec<String> },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value (JSON, or a bare string) and save the file
    Set { key: String, value: String },
    /// Validate the configuration
    Validate,
}

fn credentials(cli_key: Option<&str>, config: &Config) -> Arc<dyn CredentialProvider> {
    match cli_key {
        Some(key) => Arc::new(StaticCredential::new(key)),
        None => Arc::new(config.live.clone()),
    }
}

fn connector(offline: bool) -> Arc<dyn Connector> {
    if offline {
        Arc::new(MemoryConnector::echo())
    } else {
        Arc::new(WebSocketConnector)
    }
}

fn require_key(credentials: &dyn CredentialProvider) -> anyhow::Result<String> {
    credentials
        .credential()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("no API key configured (use --api-key or set live.api_key)"))
}

/// Config as JSON with the API key masked.
fn redacted_json(config: &Config) -> anyhow::Result<serde_json::Value> {
    let mut config = config.clone();
    if let Some(key) = config.live.api_key.as_mut() {
        *key = models::mask_key(key);
    }
    Ok(serde_json::to_value(&config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(cli.verbose, config.logging.as_ref());

    let metrics = if cli.metrics {
        Some(voxline_call::metrics::install_prometheus_recorder()?)
    } else {
        None
    };

    let credentials = credentials(cli.api_key.as_deref(), &config);
    let offline = cli.offline;

    match cli.command {
        Commands::Call {
            direction,
            mic,
            speaker,
        } => {
            let services = CallServices {
                config: Arc::new(config),
                connector: connector(offline),
                devices: Arc::new(FileDevices::new(mic, speaker)),
                credentials,
                synthesizer: Some(Arc::new(LogSynthesizer) as Arc<dyn SpeechSynthesizer>),
            };
            let registry = CallRegistry::new(services);
            match direction {
                CallAction::Incoming { from } => {
                    call::run(&registry, CallDirection::Incoming, &from).await?;
                }
                CallAction::Outgoing { to } => {
                    call::run(&registry, CallDirection::Outgoing, &to).await?;
                }
            }
        }
        Commands::Probe { message, wait } => {
            let key = if offline {
                credentials.credential().unwrap_or_else(|| "offline".into())
            } else {
                require_key(credentials.as_ref())?
            };
            probe::run(
                config.live.clone(),
                connector(offline),
                &key,
                message.as_deref().unwrap_or(probe::DEFAULT_GREETING),
                Duration::from_secs(wait),
            )
            .await?;
        }
        Commands::Models {
            action: ModelAction::Check { models },
        } => {
            let key = require_key(credentials.as_ref())?;
            models::run(models, &key).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&redacted_json(&config)?)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) if key == "live.api_key" => {
                    let shown = value.as_str().map(models::mask_key).unwrap_or_default();
                    println!("{shown}");
                }
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at {key}"),
            },
            ConfigAction::Set { key, value } => {
                let value = serde_json::from_str(&value)
                    .unwrap_or_else(|_| serde_json::Value::String(value));
                let mut updated = config.clone();
                updated.set_path(&key, value)?;
                if let Some(dir) = config_path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                updated.save(&config_path)?;
                println!("Set {key} in {}", config_path.display());
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Configuration OK ({} warning(s))", warnings.len());
            }
        },
        Commands::Status => {
            println!("Voxline v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Endpoint: {}", config.live.endpoint);
            println!("Model: {}", config.live.model);
            println!("Voice: {}", config.live.voice);
            match credentials.credential().filter(|k| !k.trim().is_empty()) {
                Some(key) => println!("API key: {}", models::mask_key(&key)),
                None => println!("API key: not configured"),
            }
            println!(
                "Screening: {}",
                if config.call.screening.enabled {
                    config.call.screening.blocked_prefixes.join(", ")
                } else {
                    "disabled".to_string()
                }
            );
        }
    }

    if let Some(handle) = metrics {
        print!("{}", handle.render());
    }

    Ok(())
}
