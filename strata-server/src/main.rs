//! Strata Server - synchronization server for strata databases
//!
//! Serves the pack/fetch/push/pull/clone/bundle API over HTTP with
//! bearer-token authentication and TUS-resumable pack uploads.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{
    AuthContext, DatabaseRegistry, DatabaseSpec, OpenAuthProvider, Orchestrator,
    StaticTokenProvider, TokenAuthProvider,
};
use strata_http::{ApiHandler, Config};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-server")]
#[command(author = "Strata Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Synchronization server for strata databases", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:6363)
        #[arg(short, long, default_value = "0.0.0.0:6363")]
        addr: String,

        /// Database store root directory
        #[arg(short, long, default_value = "./strata-store")]
        store_root: PathBuf,

        /// Token file (token:user:capabilities per line); omitting it
        /// disables authentication
        #[arg(short, long)]
        tokens: Option<PathBuf>,

        /// Token used for outbound server-to-server requests
        #[arg(long)]
        service_token: Option<String>,

        /// Payload size in bytes above which outbound transfers use
        /// TUS resumable upload
        #[arg(long, default_value_t = strata_core::DEFAULT_TUS_THRESHOLD)]
        tus_threshold: usize,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Create a new, empty database
    CreateDb {
        /// Database path as org/db
        path: String,

        /// Database store root directory
        #[arg(short, long, default_value = "./strata-store")]
        store_root: PathBuf,

        /// Display label
        #[arg(long, default_value = "")]
        label: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            store_root,
            tokens,
            service_token,
            tus_threshold,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
            };
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();

            let auth: Arc<dyn TokenAuthProvider> = match tokens {
                Some(path) => {
                    let provider = StaticTokenProvider::from_file(&path)
                        .map_err(|e| anyhow!("failed to load token file: {}", e))?;
                    info!(path = %path.display(), "token authentication enabled");
                    Arc::new(provider)
                }
                None => {
                    warn!("no token file given; all requests are accepted");
                    Arc::new(OpenAuthProvider)
                }
            };

            let config = Config {
                store_root,
                service_token,
                tus_threshold,
                ..Config::default()
            };
            let handler = Arc::new(
                ApiHandler::new(config, auth).map_err(|e| anyhow!("failed to start API: {}", e))?,
            );

            serve(&addr, handler).await
        }

        Commands::CreateDb {
            path,
            store_root,
            label,
        } => {
            let spec = DatabaseSpec::parse(&path)
                .map_err(|e| anyhow!("invalid database path: {}", e))?;
            let registry = Arc::new(DatabaseRegistry::open(&store_root)?);
            let orchestrator = Orchestrator::new(registry);
            orchestrator
                .create_db(&AuthContext::superuser("admin"), &spec, &label, "", false)
                .await
                .map_err(|e| anyhow!("failed to create database: {}", e))?;
            println!("Created database {}", spec);
            Ok(())
        }
    }
}

async fn serve(addr: &str, handler: Arc<ApiHandler>) -> Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "strata server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let handler = Arc::clone(&handler);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move {
                    Ok::<_, std::convert::Infallible>(handler.handle(req).await)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}
