use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use ws_value::transport::get_method;
use ws_value::{ClientConfig, Config, RpcClient, RpcServer, ServerConfig, SyncedValue};

#[derive(Parser)]
#[command(name = "ws-value")]
#[command(
    about = "Keep one named JSON value in sync between an authority and its mirrors",
    version
)]
#[command(after_help = "Roles:
- serve   hosts the authoritative value; it alone accepts and broadcasts writes
- watch   mirrors the value and prints every init/change event
- set     asks the authority for a change and waits for the broadcast confirming it

Values are JSON. `null` (or an empty line on `serve`) resets the value to absent.")]
struct Cli {
    /// JSON config file ({\"server\": {...}, \"client\": {...}})
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Authority endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/")]
    url: String,

    /// Value name
    #[arg(short, long, default_value = "value")]
    name: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the authoritative value; every stdin line is set as the new value
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Value name
        #[arg(short, long, default_value = "value")]
        name: String,

        /// Initial JSON value
        #[arg(long)]
        initial: Option<String>,
    },

    /// Mirror the value and print its init and change events
    Watch {
        #[command(flatten)]
        target: Target,
    },

    /// Fetch the current value once
    Get {
        #[command(flatten)]
        target: Target,
    },

    /// Request a new value and wait for the authority to confirm it
    Set {
        #[command(flatten)]
        target: Target,

        /// New JSON value
        value: String,

        /// How long to wait for the confirming broadcast
        #[arg(long, default_value = "3000")]
        wait_ms: u64,
    },

    /// Request the value to become absent
    Reset {
        #[command(flatten)]
        target: Target,

        #[arg(long, default_value = "3000")]
        wait_ms: u64,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve {
            host,
            port,
            name,
            initial,
        } => {
            let mut server_config = config.server.clone();
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            serve(server_config, name, initial).await?;
        }

        Commands::Watch { target } => watch(&config, target).await?,

        Commands::Get { target } => {
            let client = RpcClient::connect(&target.url, one_shot(&config)).await?;
            let value = client.request(&get_method(&target.name), None).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            client.close();
        }

        Commands::Set {
            target,
            value,
            wait_ms,
        } => {
            let value = parse_value(&value)?;
            request_change(&config, target, value, wait_ms).await?;
        }

        Commands::Reset { target, wait_ms } => {
            request_change(&config, target, None, wait_ms).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "ws_value=debug" } else { "ws_value=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Single-request commands give up instead of waiting for the server
fn one_shot(config: &Config) -> ClientConfig {
    ClientConfig {
        reconnect: false,
        ..config.client.clone()
    }
}

/// JSON `null` means absent
fn parse_value(text: &str) -> Result<Option<Value>> {
    let value: Value =
        serde_json::from_str(text).with_context(|| format!("`{}` is not valid JSON", text))?;
    Ok(match value {
        Value::Null => None,
        value => Some(value),
    })
}

fn show(value: Option<&Value>) -> ColoredString {
    match value {
        Some(value) => value.to_string().bright_white(),
        None => "<absent>".bright_black(),
    }
}

fn print_events(value: &SyncedValue<Value>, role: &'static str) {
    value.on_init(move |v| {
        println!("{} {} initial value {}", "●".green(), role, show(v));
    });
    value.on_change(move |v| {
        println!("{} {} changed to {}", "→".bright_blue(), role, show(v));
    });
}

async fn serve(config: ServerConfig, name: String, initial: Option<String>) -> Result<()> {
    let server = RpcServer::new(config);
    let value = SyncedValue::<Value>::authority(server.clone(), name.as_str());
    print_events(&value, "authority");

    if let Some(initial) = initial {
        if let Some(initial) = parse_value(&initial)? {
            value.set_value(initial)?;
        }
    }

    let handle = server.listen().await?;
    println!(
        "{} Serving {} at {}",
        "✓".green(),
        name.bright_yellow(),
        handle.url().bright_blue()
    );
    println!(
        "{}",
        "Type a JSON value per line to set it, an empty line to reset.".bright_black()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => value.reset_value()?,
                Some(line) => match parse_value(line.trim()) {
                    Ok(Some(next)) => value.set_value(next)?,
                    Ok(None) => value.reset_value()?,
                    Err(e) => eprintln!("{} {:#}", "✗".red(), e),
                },
                None => stdin_open = false,
            },
        }
    }

    handle.shutdown().await;
    println!("{}", "✓ Server stopped".green());
    Ok(())
}

async fn watch(config: &Config, target: Target) -> Result<()> {
    let client = RpcClient::new(&target.url, config.client.clone())?;
    let value = SyncedValue::<Value>::mirror(client.clone(), target.name.as_str());
    print_events(&value, "mirror");
    println!(
        "{} Watching {} at {}",
        "👁".cyan(),
        target.name.bright_yellow(),
        target.url.bright_blue()
    );

    tokio::signal::ctrl_c().await?;
    client.close();
    Ok(())
}

async fn request_change(
    config: &Config,
    target: Target,
    next: Option<Value>,
    wait_ms: u64,
) -> Result<()> {
    let client = RpcClient::connect(&target.url, one_shot(config)).await?;
    let value = SyncedValue::<Value>::mirror(client.clone(), target.name.as_str());

    let (tx, mut changes) = mpsc::unbounded_channel::<()>();
    value.on_change(move |_| {
        let _ = tx.send(());
    });

    match &next {
        Some(next) => value.set_value(next.clone())?,
        None => value.reset_value()?,
    }

    let confirmed = tokio::time::timeout(Duration::from_millis(wait_ms), async {
        // the initial fetch is answered before the write, so an already
        // equal value is confirmed by it
        while changes.recv().await.is_some() {
            if value.get_value() == next {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if confirmed {
        println!(
            "{} {} is now {}",
            "✓".green(),
            target.name.bright_yellow(),
            show(next.as_ref())
        );
    } else {
        println!(
            "{} No confirmation within {}ms, current value is {}",
            "⚠".yellow(),
            wait_ms,
            show(value.get_value().as_ref())
        );
    }

    client.close();
    Ok(())
}
