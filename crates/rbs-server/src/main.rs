use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rbs_bridge::ClientStore;
use rbs_server::{init_tracing, ServerConfig, StoreHost, TcpTransport};
use rbs_store::{BlobStore, InMemoryBlobStore};
use rbs_types::{RemoteRef, StoreId};

#[derive(Parser)]
#[command(
    name = "rbs-server",
    about = "Remote blob store bridge: publish a store over TCP or inspect one",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tracing filter; overrides the config file, not RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Publish an in-memory store until interrupted
    Serve(ServeArgs),
    /// Connect to a published store and print its capabilities
    Info(InfoArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Write the store's ticket to this file
    #[arg(long)]
    ticket_file: Option<PathBuf>,
}

#[derive(Args)]
struct InfoArgs {
    /// Ticket printed by `rbs-server serve`
    ticket: String,

    /// Identifier the client store reports
    #[arg(long, default_value = "urn:rbs:store:default")]
    store_id: String,

    /// Call timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args, cli.log_level).await,
        Command::Info(args) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
            info(args).await
        }
    }
}

async fn serve(args: ServeArgs, log_level: Option<String>) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.ticket_file.is_some() {
        config.ticket_path = args.ticket_file;
    }
    init_tracing(log_level.as_deref().unwrap_or(&config.log_level))?;

    let store = Arc::new(InMemoryBlobStore::new(config.store_id()?, config.store_config()));
    let host = StoreHost::start(&config, store).await?;
    println!("{}", host.ticket()?);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    host.shutdown().await?;
    Ok(())
}

async fn info(args: InfoArgs) -> anyhow::Result<()> {
    let reference = RemoteRef::from_ticket(&args.ticket).context("reading ticket")?;
    let id = StoreId::parse(&args.store_id)?;
    let transport = TcpTransport::new(std::time::Duration::from_millis(args.timeout_ms));

    let capabilities = tokio::task::spawn_blocking(move || {
        let client = ClientStore::new(id, reference, transport, None)?;
        let capabilities = client.capabilities();
        client.shutdown()?;
        anyhow::Ok(capabilities)
    })
    .await??;

    for capability in capabilities.iter() {
        println!("{capability}");
    }
    Ok(())
}
