//! Scriptgate command-line front end.
//!
//! ```bash
//! # Run one request envelope through the configured handlers
//! scriptgate --config connector.xml dispatch request.xml --user "cn=alice,o=acme"
//!
//! # Inspect and remove saved transactions
//! scriptgate --config connector.xml transactions list 'ORDER-*'
//! scriptgate --config connector.xml transactions delete ORDER-17
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use scriptgate_core::{Envelope, RequestMetadata};
use scriptgate_server::service::middleware::build_dispatch_pipeline;
use scriptgate_server::service::{ConnectorConfig, Dispatcher, InboundRequest, PreProcessorFactory};
use scriptgate_server::storage::TransactionStore;
use scriptgate_server::traits::{DisconnectedTransport, InterfaceSource};
use tower::ServiceExt;

#[derive(Parser, Debug)]
#[command(name = "scriptgate")]
#[command(about = "Route SOAP requests to script handlers", long_about = None)]
struct Args {
    /// Connector configuration document
    #[arg(short, long, env = "SCRIPTGATE_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, env = "SCRIPTGATE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dispatch one request envelope and print the response envelope
    Dispatch {
        /// File holding the request envelope
        request: PathBuf,

        /// Caller's user DN
        #[arg(long)]
        user: Option<String>,

        /// Caller's organization DN
        #[arg(long)]
        organization: Option<String>,

        /// Directory name of the operation definition
        #[arg(long)]
        method_dn: Option<String>,

        /// Interface description (WSDL) of the operation
        #[arg(long)]
        interface: Option<PathBuf>,

        /// Implementation payload of the operation
        #[arg(long)]
        implementation: Option<String>,

        /// Seconds to wait for scheduled requests before exiting
        #[arg(long, default_value_t = 5.0)]
        drain: f64,
    },
    /// Saved transaction maintenance
    Transactions {
        #[command(subcommand)]
        command: TransactionCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TransactionCommands {
    /// List saved transactions matching a pattern (`*` and `?` allowed)
    List { pattern: String },
    /// Delete the saved files of one transaction
    Delete { id: String },
}

/// Resolves interface imports as files next to the importing document.
#[derive(Debug)]
struct FileInterfaces {
    base_dir: PathBuf,
}

#[async_trait]
impl InterfaceSource for FileInterfaces {
    async fn fetch(&self, location: &str) -> Result<Option<String>> {
        let path = self.base_dir.join(location);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("unable to read {}", path.display())),
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let config = ConnectorConfig::load(&args.config)
        .with_context(|| format!("unable to load {}", args.config.display()))?;

    match args.command {
        Commands::Dispatch {
            request,
            user,
            organization,
            method_dn,
            interface,
            implementation,
            drain,
        } => {
            let metadata = RequestMetadata {
                method_dn,
                interface: interface.as_deref().map(read_file).transpose()?,
                implementation,
                user_dn: user,
                organization_dn: organization,
            };
            let base_dir = interface
                .as_deref()
                .and_then(Path::parent)
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            dispatch(config, &request, metadata, base_dir, drain).await
        }
        Commands::Transactions { command } => transactions(&config, command),
    }
}

async fn dispatch(
    config: ConnectorConfig,
    request: &Path,
    metadata: RequestMetadata,
    base_dir: PathBuf,
    drain: f64,
) -> Result<()> {
    let envelope = Envelope::parse(&read_file(request)?)
        .with_context(|| format!("{} is not a request envelope", request.display()))?;

    let dispatcher = Dispatcher::from_config(
        config,
        Arc::new(DisconnectedTransport),
        Arc::new(FileInterfaces { base_dir }),
        PreProcessorFactory::with_builtins(),
        tokio::runtime::Handle::current(),
    )?;
    let context = Arc::clone(dispatcher.context());

    let outcome = build_dispatch_pipeline(dispatcher)
        .oneshot(InboundRequest::new(envelope, metadata))
        .await?;
    println!("{}", outcome.envelope.root().to_pretty_xml());

    let drain = Duration::try_from_secs_f64(drain).unwrap_or(Duration::ZERO);
    if !context.scheduler.wait_idle(drain).await {
        tracing::warn!(
            pending = context.scheduler.pending_count(),
            "scheduled requests still pending at exit"
        );
    }
    Ok(())
}

fn transactions(config: &ConnectorConfig, command: TransactionCommands) -> Result<()> {
    let Some(folder) = &config.transaction_dir else {
        bail!("no transaction save folder is configured");
    };
    let store = TransactionStore::new(folder.clone(), config.max_files_per_transaction);

    match command {
        TransactionCommands::List { pattern } => {
            let summaries: Vec<_> = store.list(&pattern)?.iter().map(|r| r.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        TransactionCommands::Delete { id } => {
            let removed = store.delete(&id)?;
            println!("{removed}");
        }
    }
    Ok(())
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))
}
