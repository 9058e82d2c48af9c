mod command;
mod event;
mod ui;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

use cooplink_core::settings::Settings;
use cooplink_engine::discovery::MulticastBinder;
use cooplink_engine::engine::{Engine, EngineConfig, EngineHandle};
use cooplink_engine::quic::{QuicConnector, QuicListenerFactory};
use cooplink_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::{Command, execute};
use crate::event::spawn_event_printer;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Transport {
    #[default]
    Tcp,
    Quic,
}

/// cooplink — pair with nearby devices, send files, share input and
/// clipboard.
///
/// Starts an engine that accepts pairing requests and discovers peers on
/// the local network. An interactive prompt lets you pair, send files and
/// answer incoming requests and offers.
#[derive(Parser, Debug)]
#[command(name = "cooplink", version, about)]
struct Args {
    /// TOML settings file; missing keys take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for pairing requests.
    #[arg(short, long, default_value = "0.0.0.0:47100")]
    listen: String,

    /// Human-readable name for this device (overrides the settings file).
    #[arg(short, long)]
    name: Option<String>,

    /// Directory where received files are stored (overrides the settings
    /// file).
    #[arg(short, long)]
    save_dir: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = Transport::Tcp)]
    transport: Transport,

    /// Do not announce or listen for peers on start.
    #[arg(long)]
    no_discovery: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(name) = &self.name {
            settings.device_name.clone_from(name);
        }
        if let Some(dir) = &self.save_dir {
            settings.save_dir.clone_from(dir);
        }
        Ok(settings)
    }
}

fn start_engine(settings: Settings, transport: Transport) -> anyhow::Result<EngineHandle> {
    let config = EngineConfig::default();
    let binder = MulticastBinder::new(config.discovery.group);
    let engine = Engine::new(settings).with_config(config);
    let handle = match transport {
        Transport::Tcp => engine.start(TcpListenerFactory, TcpConnector, binder)?,
        Transport::Quic => engine.start(QuicListenerFactory::new()?, QuicConnector::new()?, binder)?,
    };
    Ok(handle)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cooplink_cli=info,warn")),
        )
        .init();

    let settings = args.settings()?;
    std::fs::create_dir_all(&settings.save_dir).with_context(|| {
        format!(
            "failed to create save directory {}",
            settings.save_dir.display()
        )
    })?;
    let device_name = settings.device_name.clone();
    let save_dir = settings.save_dir.clone();

    let handle = start_engine(settings, args.transport)?;
    spawn_event_printer(handle.subscribe());

    let bound = handle
        .start_accepting(args.listen.as_str())
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    if !args.no_discovery {
        handle.start_discovery().await?;
    }

    // ── Banner ──────────────────────────────────────────────────
    print_banner(&bound.to_string(), &device_name, handle.local_id().as_str(), &save_dir);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    while let Some(line) = read_line(&mut stdin).await {
        if line.is_empty() {
            print_prompt();
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Help) => print_help(),
            Ok(cmd) => execute(cmd, &handle).await,
            Err(usage) => println!("  ❓ {usage}  Type 'help' for usage."),
        }
        print_prompt();
    }

    println!("\n  Shutting down...");
    if let Err(e) = handle.shutdown().await {
        tracing::warn!(error = %e, "Engine did not shut down cleanly");
    }
    println!("  Bye! 👋");
    Ok(())
}
