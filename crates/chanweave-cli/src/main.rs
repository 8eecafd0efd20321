//! Chanweave CLI
//!
//! Thin wrapper around chanweave-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Sanitize a display name into a topic path segment
//! chanweave sanitize "Team Chat!"
//!
//! # Show both topic ids for a persistent, ephemeral or base id
//! chanweave derive 0xabc.../Team-Chat-1f2e-1
//!
//! # Print the effective configuration
//! chanweave --config engine.json config
//!
//! # Provision and exercise a channel on an in-process network
//! chanweave demo --name "Team Chat" --type password --secret hunter2
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use chanweave_core::naming::{self, TopicKind};
use chanweave_core::substrate::{Fault, MemoryNetwork, SubstrateOp};
use chanweave_core::{
    Address, ChannelEngine, ChannelType, CreateChannelRequest, DualTopicHandlers, EngineConfig,
    PayloadHandler,
};

/// Identity the demo acts as.
const DEMO_OWNER: &str = "0x00000000000000000000000000000000000000aa";

/// Storage node used by the demo when the config names none.
const DEMO_STORAGE_NODE: &str = "0x000000000000000000000000000000000000d0d0";

/// Chanweave - chat channels over a pub/sub substrate
#[derive(Parser)]
#[command(name = "chanweave")]
#[command(version)]
#[command(about = "Chanweave - chat channels over a pub/sub substrate")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sanitize a channel name into a topic path segment
    Sanitize {
        /// Display name
        name: String,
    },

    /// Show the persistent and ephemeral ids for a topic id
    Derive {
        /// Persistent (-1), ephemeral (-2) or base id
        topic_id: String,
    },

    /// Print the effective engine configuration as JSON
    Config,

    /// Provision a channel on an in-process network and exchange a few records
    Demo {
        /// Channel display name
        #[arg(short, long, default_value = "Team Chat")]
        name: String,

        /// Access model
        #[arg(short = 't', long = "type", value_enum, default_value_t = KindArg::Public)]
        channel_type: KindArg,

        /// Keep the name out of topic ids and metadata
        #[arg(long)]
        hidden: bool,

        /// Public principals may subscribe but not publish
        #[arg(long)]
        read_only: bool,

        /// Shared secret for encrypting payloads
        #[arg(short, long)]
        secret: Option<String>,

        /// Member addresses (restricted channels)
        #[arg(short, long = "member")]
        members: Vec<String>,

        /// Make every ephemeral topic creation fail
        #[arg(long)]
        fail_ephemeral: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Public,
    Password,
    Restricted,
}

impl From<KindArg> for ChannelType {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Public => ChannelType::Public,
            KindArg::Password => ChannelType::Password,
            KindArg::Restricted => ChannelType::Restricted,
        }
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

/// Handler forwarding payloads into a channel the CLI drains.
fn forwarding_handler(
    tx: mpsc::UnboundedSender<(&'static str, Value)>,
    stream: &'static str,
) -> PayloadHandler {
    Arc::new(move |value: Value| {
        let _ = tx.send((stream, value));
    })
}

fn describe(value: &Value) -> String {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("untyped");
    match kind {
        "text" => format!(
            "text {:?}",
            value.get("text").and_then(Value::as_str).unwrap_or_default()
        ),
        "presence" => format!(
            "presence {}",
            value.get("status").and_then(Value::as_str).unwrap_or_default()
        ),
        other => other.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_demo(
    config: EngineConfig,
    name: String,
    channel_type: ChannelType,
    hidden: bool,
    read_only: bool,
    secret: Option<String>,
    members: Vec<String>,
    fail_ephemeral: bool,
) -> Result<()> {
    let mut config = config;
    if config.storage_node.is_none() {
        config.storage_node = Some(DEMO_STORAGE_NODE.to_string());
    }

    let network = MemoryNetwork::new();
    if fail_ephemeral {
        network.inject_fault(
            Fault::always(SubstrateOp::CreateTopic).on_suffix(naming::EPHEMERAL_SUFFIX),
        );
    }

    let owner = Address::parse(DEMO_OWNER)?;
    let engine = ChannelEngine::connect(Arc::new(network.connect(owner.clone())), owner, config)?;
    let secret = secret.as_deref();

    let mut request = CreateChannelRequest::new(name, channel_type).with_members(members);
    if hidden {
        request = request.hidden();
    }
    if read_only {
        request = request.read_only();
    }

    let created = engine.create_channel(&request).await?;
    println!("Channel created");
    println!("  Persistent: {}", created.persistent_id);
    match &created.ephemeral_id {
        Some(id) => println!("  Ephemeral: {}", id),
        None => println!("  Ephemeral: (none, degraded)"),
    }
    println!("  State: {}", created.state);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handlers = DualTopicHandlers::new(forwarding_handler(tx.clone(), "message"))
        .with_control(forwarding_handler(tx, "control"));
    engine
        .subscribe_to_dual_topics(
            &created.persistent_id,
            created.ephemeral_id.as_deref(),
            handlers,
            secret,
            Some(0),
        )
        .await?;

    engine
        .publish_message(&created.persistent_id, "hello", secret)
        .await?;
    engine
        .publish_message(&created.persistent_id, "second message", secret)
        .await?;
    if let Some(ephemeral_id) = &created.ephemeral_id {
        engine.publish_presence(ephemeral_id, "online", secret).await?;
    }

    while let Ok((stream, value)) = rx.try_recv() {
        println!("Received [{}]: {}", stream, describe(&value));
    }

    let history = engine
        .fetch_recent_history(&created.persistent_id, 10, secret)
        .await;
    println!("History: {} records", history.len());

    let capabilities = engine
        .check_capabilities(&created.persistent_id, engine.owner().as_str())
        .await?;
    println!("Owner: {}", capabilities.is_owner);

    engine.delete_channel(&created.persistent_id).await?;
    info!(channel = %created.persistent_id, "Demo finished");
    println!("Channel deleted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Sanitize { name } => {
            println!("{}", naming::sanitize_path(&name));
        }

        Commands::Derive { topic_id } => {
            let kind = match TopicKind::of(&topic_id) {
                Some(TopicKind::Persistent) => "persistent",
                Some(TopicKind::Ephemeral) => "ephemeral",
                None => "base",
            };
            println!("Input: {}", kind);
            println!("  Base: {}", naming::base_id(&topic_id));
            println!("  Persistent: {}", naming::derive_persistent(&topic_id));
            println!("  Ephemeral: {}", naming::derive_ephemeral(&topic_id));
        }

        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Demo {
            name,
            channel_type,
            hidden,
            read_only,
            secret,
            members,
            fail_ephemeral,
        } => {
            let config = load_config(cli.config.as_ref())?;
            run_demo(
                config,
                name,
                channel_type.into(),
                hidden,
                read_only,
                secret,
                members,
                fail_ephemeral,
            )
            .await?;
        }
    }

    Ok(())
}
