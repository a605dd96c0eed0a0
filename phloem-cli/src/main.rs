use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use phloem_cli::config::{self, ConfigSources};
use phloem_cli::output::{format_nodes, format_reply, format_slots};
use phloem_cluster::{AsyncClusterClient, ClusterClient, ClusterConfig, NodeAddr};
use phloem_protocol::key_hash_slot;
use schemars::schema_for;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// phloem: Redis Cluster client
///
/// Commands are routed to the node owning their keys; MOVED, ASK and
/// TRYAGAIN replies are followed transparently.
///
/// Example usage:
///   phloem -s 127.0.0.1:7000 exec SET greeting hello
///   phloem -s 127.0.0.1:7000 exec --async MGET a b c
///   phloem -c cluster.toml --set max_retry_count=10 slots
///   phloem -s 127.0.0.1:7000 node 127.0.0.1:7001 INFO replication
///   phloem keyslot '{user:1}.profile'
///   phloem completions bash > ~/.local/share/bash-completion/completions/phloem
#[derive(Parser)]
#[command(name = "phloem")]
#[command(version, about = "Redis Cluster client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML file with client settings
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Seed nodes, `host:port[,host:port...]`; replaces the file's seeds
    #[arg(short = 's', long, global = true)]
    seeds: Option<String>,

    /// Override a client setting (can be specified multiple times)
    ///
    /// Examples:
    ///   --set max_retry_count=10
    ///   --set command_timeout=500ms
    ///   --set use_cluster_slots=true
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    set: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command, routed by its keys
    Exec {
        /// Use the tokio client
        #[arg(long = "async")]
        use_async: bool,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a command on one node, without routing
    Node {
        /// Node address (`host:port`)
        addr: NodeAddr,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the slot map
    Slots,

    /// Print the masters and their replicas
    Nodes,

    /// Print the hash slot of a key
    Keyslot {
        key: String,
    },

    /// Generate JSON Schema for configuration files
    Schema,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "phloem", &mut io::stdout());
            Ok(())
        }
        Commands::Schema => {
            let schema = schema_for!(ClusterConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Keyslot { key } => {
            println!("{}", key_hash_slot(key.as_bytes()));
            Ok(())
        }
        Commands::Exec { use_async: true, args } => exec_async(load_config(&cli)?, args),
        Commands::Exec { use_async: false, args } => {
            let mut client = connect(load_config(&cli)?)?;
            let reply = client.command(args).context("Command failed")?;
            println!("{}", format_reply(&reply));
            Ok(())
        }
        Commands::Node { addr, args } => {
            let mut client = connect(load_config(&cli)?)?;
            let reply = client.command_to_node(addr, args).context("Command failed")?;
            println!("{}", format_reply(&reply));
            Ok(())
        }
        Commands::Slots => {
            let client = connect(load_config(&cli)?)?;
            print!("{}", format_slots(&client.topology()));
            Ok(())
        }
        Commands::Nodes => {
            let client = connect(load_config(&cli)?)?;
            print!("{}", format_nodes(&client.topology()));
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    if cli.config.is_none() && cli.seeds.is_none() {
        bail!("No cluster given: pass --seeds or --config");
    }
    config::load(&ConfigSources {
        file: cli.config.as_deref(),
        overrides: &cli.set,
        seeds: cli.seeds.as_deref(),
    })
}

fn connect(config: ClusterConfig) -> Result<ClusterClient> {
    let seeds = config.seeds.join(",");
    let mut client = ClusterClient::new(config)?;
    client.connect().with_context(|| format!("Failed to connect to cluster at {seeds}"))?;
    tracing::info!(version = client.topology().version(), "connected");
    Ok(client)
}

fn exec_async(config: ClusterConfig, args: &[String]) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    runtime.block_on(async {
        let client = AsyncClusterClient::new(config)?;
        client.connect().await.context("Failed to connect to cluster")?;
        let reply = client.command(args).await.context("Command failed")?;
        println!("{}", format_reply(&reply));
        Ok::<(), anyhow::Error>(())
    })
}
