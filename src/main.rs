//! Binary entrypoint for the qmesh daemon.
//!
//! Commands:
//! - `start [--callsign <call>] [--db-path <path>]` - run the mesh chat node
//! - `init` - create a starter `config.toml`
//! - `status` - print config and store summary without starting the node
//!
//! See the library crate docs for module-level details: `qmesh::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use qmesh::chat::{ChatCallbacks, ChatEvent, ChatService};
use qmesh::config::Config;
use qmesh::storage::MessageStore;

#[derive(Parser)]
#[command(name = "qmesh")]
#[command(about = "Store-and-forward chat over half-duplex radio meshes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mesh chat node
    Start {
        /// Override node.callsign from the config file
        #[arg(long)]
        callsign: Option<String>,

        /// Override storage.db_path from the config file
        #[arg(long)]
        db_path: Option<String>,
    },
    /// Initialize a new configuration file
    Init,
    /// Show configuration and store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { callsign, db_path } => {
            let mut config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            if let Some(callsign) = callsign {
                config.node.callsign = callsign;
                config.validate()?;
            }
            if let Some(db_path) = db_path {
                config.storage.db_path = db_path;
            }
            run_node(config).await
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote {}. Edit the callsign and link settings, then run: qmesh start", cli.config);
            Ok(())
        }
        Commands::Status => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            show_status(&config)
        }
    }
}

/// Run the node until ctrl-c, printing the event stream to stdout.
async fn run_node(config: Config) -> Result<()> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<ChatEvent>();
    let callbacks = ChatCallbacks {
        events: Some(event_tx),
        ..ChatCallbacks::default()
    };

    let mut service = ChatService::new(config, callbacks)?;
    service.start().await?;
    info!("qmesh node {} running, ctrl-c to stop", service.node_id());

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => print_event(event),
                    None => break,
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("signal handler failed: {}", err);
                }
                println!("[STATUS] shutting down");
                break;
            }
        }
    }

    service.stop().await;
    // Give abandoned link workers a moment to observe the stop flag.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    Ok(())
}

fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::Message {
            channel,
            nick,
            text,
            ts,
            ..
        } => {
            let stamp = chrono::DateTime::from_timestamp(ts as i64, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "?".to_string());
            println!("[{}] {} <{}> {}", stamp, channel, nick, text);
        }
        ChatEvent::Status(text) => println!("[STATUS] {}", text),
        ChatEvent::GapNotice(text) => println!("[GAP] {}", text),
        ChatEvent::SyncApplied { channel, applied } => {
            println!("[SYNC] {} message(s) recovered on {}", applied, channel);
        }
    }
}

fn show_status(config: &Config) -> Result<()> {
    println!("qmesh node status");
    println!("  callsign:   {}", config.node.callsign);
    println!(
        "  links:      modem={} tcp-server={} tcp-links={}",
        config.modem.enabled,
        config.tcp.server.enabled,
        config.tcp.links.iter().filter(|l| l.enabled).count()
    );
    println!("  encryption: {}", config.security.enable_encryption);

    match MessageStore::open(&config.storage.db_path) {
        Ok(store) => {
            println!("  messages:   {}", store.len());
            let channels = store.channels(10)?;
            if channels.is_empty() {
                println!("  channels:   (none)");
            } else {
                println!("  channels:   {}", channels.join(", "));
            }
        }
        Err(err) => {
            // A running daemon holds the store lock; not an error worth
            // failing the command over.
            println!("  store:      unavailable ({})", err);
        }
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    let mut builder = env_logger::Builder::new();

    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug level and drowns out mesh traffic
    builder.filter_module("sled", log::LevelFilter::Warn);

    // Piped output (service managers, log collectors) gets no color codes.
    if !atty::is(atty::Stream::Stdout) {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}
