//! Inspect and exercise a tether engine from the command line.
//!
//! Reads an optional bearer token from the `TETHER_TOKEN` environment variable.
//!
//! # Examples
//!
//! ```sh
//! # Which transport would be used right now, and why
//! tether status
//!
//! # Models advertised by every healthy transport
//! tether --relay-url https://relay.example.com models
//!
//! # Stream a reply to stdout
//! tether chat "Why is the sky blue?" --model llama3
//!
//! # Keep the reverse tunnel up until Ctrl-C
//! tether --relay-url https://relay.example.com tunnel
//!
//! # Print every status event as a JSON line
//! tether watch
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tether_rs::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// Resilient connection engine for local and relayed inference backends.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the local backend
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Cloud relay URL
    #[arg(long, global = true)]
    relay_url: Option<String>,

    /// Prefer the local backend whenever it is healthy
    #[arg(long, global = true)]
    prefer_local: bool,

    /// Bearer token (defaults to $TETHER_TOKEN)
    #[arg(long, global = true, env = "TETHER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect every transport and print the router status
    Status,
    /// List the merged model catalog
    Models,
    /// Stream a chat reply to stdout
    Chat {
        /// Prompt to send
        prompt: String,

        /// Model to use (defaults to the first advertised model)
        #[arg(long)]
        model: Option<String>,

        /// Conversation identifier carried by every stream event
        #[arg(long, default_value = "cli")]
        conversation: String,
    },
    /// Run the reverse tunnel until Ctrl-C
    Tunnel,
    /// Print status events as JSON lines until Ctrl-C
    Watch,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "tether_rs=debug,tether=debug"
    } else {
        "tether_rs=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig, ConnectionError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(url) = &cli.backend_url {
        config = config.with_backend_url(url);
    }
    if let Some(url) = &cli.relay_url {
        config = config.with_relay_url(url);
    }
    if cli.prefer_local {
        config = config.with_prefer_local(true);
    }
    Ok(config)
}

fn build_engine(cli: &Cli) -> Result<Engine, ConnectionError> {
    let credentials: Arc<dyn CredentialProvider> = match &cli.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(NoCredentials),
    };
    EngineBuilder::new(load_config(cli)?)
        .with_credentials(credentials)
        .build()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ConnectionError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ConnectionError::Config(format!("failed to render output: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ConnectionError> {
    let engine = build_engine(&cli)?;

    match cli.command {
        Command::Status => {
            engine.start().await;
            print_json(&engine.router.status())?;
        }
        Command::Models => {
            if engine.start().await == 0 {
                return Err(ConnectionError::NoProvider);
            }
            for model in engine.router.available_models() {
                println!("{model}");
            }
        }
        Command::Chat {
            prompt,
            model,
            conversation,
        } => {
            engine.start().await;
            if let Some(model) = model {
                engine.router.select_model(model);
            }
            let mut stream = engine
                .router
                .send_chat_message(&prompt, &conversation, &[])
                .await?;
            let mut stdout = std::io::stdout();
            while let Some(event) = stream.next().await {
                match event {
                    StreamEvent::Chunk { text, .. } => {
                        print!("{text}");
                        let _ = stdout.flush();
                    }
                    StreamEvent::Complete { .. } => println!(),
                    StreamEvent::Error { message, .. } => {
                        println!();
                        return Err(ConnectionError::Connectivity(message));
                    }
                }
            }
        }
        Command::Tunnel => {
            let Some(tunnel) = engine.tunnel() else {
                return Err(ConnectionError::Config(
                    "no tunnel configured: pass --relay-url".into(),
                ));
            };
            tunnel.connect()?;
            let mut state = tunnel.subscribe();
            loop {
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = state.borrow_and_update().clone();
                        print_json(&current)?;
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            tunnel.disconnect();
        }
        Command::Watch => {
            let mut events = engine.subscribe();
            let start = engine.start();
            tokio::pin!(start);
            let mut started = false;
            loop {
                tokio::select! {
                    _ = &mut start, if !started => started = true,
                    event = events.recv() => match event {
                        Ok(event) => match serde_json::to_string(&event) {
                            Ok(line) => println!("{line}"),
                            Err(e) => tracing::warn!("Could not render event: {e}"),
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Skipped {skipped} status event(s)");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    engine.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
