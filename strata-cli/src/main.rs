//! strata — repository synchronization tool.
//!
//! Supports:
//! - Cloning remote databases into a local store
//! - Incremental fetch / push / pull against registered remotes
//! - Bundling a database into a portable file and unbundling it elsewhere
//! - Commit history inspection
//!
//! # Usage
//!
//! ```bash
//! # Clone a remote database
//! strata clone http://server:6363/acme/crm acme/crm
//!
//! # Fetch and fast-forward
//! strata pull acme/crm
//!
//! # Push local commits
//! strata push acme/crm --remote origin --branch main
//!
//! # Move a database offline
//! strata bundle acme/crm --output crm.bundle
//! strata unbundle acme/backup crm.bundle
//!
//! # Inspect history
//! strata log acme/crm
//! ```
//!
//! Exit codes: 0 success, 1 user error, 2 remote/protocol error, 3 internal
//! error. Diagnostics go to stderr; `--json` prints the response envelope on
//! stdout.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use strata_core::{
    transport_for_url, AuthContext, DatabaseRegistry, DatabaseSpec, Orchestrator, PullOutcome,
    PushResult, SyncError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(author = "Strata Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Repository synchronization for strata databases")]
struct Cli {
    /// Local database store root
    #[arg(long, global = true, env = "STRATA_STORE", default_value = "./strata-store")]
    store: PathBuf,

    /// Bearer token for remote servers
    #[arg(long, global = true, env = "STRATA_TOKEN")]
    token: Option<String>,

    /// Payload size in bytes above which pushes use TUS resumable upload
    #[arg(long, global = true, default_value_t = strata_core::DEFAULT_TUS_THRESHOLD)]
    tus_threshold: usize,

    /// Print the machine-readable response envelope on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clone a remote database into the local store
    Clone {
        /// Remote database url (e.g. http://server:6363/acme/crm)
        remote_url: String,
        /// Local database path as account/db
        path: String,
        /// Display label
        #[arg(long)]
        label: Option<String>,
        /// Description
        #[arg(long, default_value = "")]
        comment: String,
        /// Mark the database as public
        #[arg(long)]
        public: bool,
    },

    /// Fetch new history from a remote
    Fetch {
        /// Database path as account/db
        path: String,
        /// Remote name
        #[arg(long, default_value = "origin")]
        remote: String,
    },

    /// Push a local branch to a remote
    Push {
        /// Database path as account/db, optionally /local/branch/<name>
        path: String,
        /// Remote name
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Branch to push (overrides a branch given in the path)
        #[arg(long)]
        branch: Option<String>,
    },

    /// Fetch and fast-forward a local branch
    Pull {
        /// Database path as account/db
        path: String,
        /// Remote name
        #[arg(long, default_value = "origin")]
        remote: String,
        /// Branch to pull into
        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Write a branch's full history to a bundle file
    Bundle {
        /// Database path as account/db
        path: String,
        /// Output file
        #[arg(long, short)]
        output: PathBuf,
        /// Branch to bundle
        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Apply a bundle file to a database
    Unbundle {
        /// Database path as account/db
        path: String,
        /// Bundle file
        file: PathBuf,
    },

    /// Show commit history of a branch
    Log {
        /// Database path as account/db
        path: String,
        /// Branch to log
        #[arg(long, default_value = "main")]
        branch: String,
        /// Maximum number of commits to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Diagnostics on stderr; stdout is reserved for command output.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let json = cli.json;
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            if json {
                println!(
                    "{}",
                    json!({
                        "api:status": "api:failure",
                        "api:message": err.to_string(),
                        "api:error_term": err.error_term(),
                    })
                );
            }
            eprintln!("error: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

/// Split `account/db[/ref…]` into the database spec and an optional ref path.
fn split_path(path: &str) -> Result<(DatabaseSpec, Option<String>), SyncError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return Err(SyncError::NotFound(format!("invalid database path {}", path)));
    }
    let spec = DatabaseSpec::new(segments[0], segments[1]);
    let rest = if segments.len() > 2 {
        Some(segments[2..].join("/"))
    } else {
        None
    };
    Ok((spec, rest))
}

async fn run(cli: Cli) -> Result<(), SyncError> {
    let registry = Arc::new(DatabaseRegistry::open(&cli.store)?);
    let api = Orchestrator::new(Arc::clone(&registry));
    let auth = AuthContext::superuser(whoami());

    match cli.command {
        Commands::Clone {
            remote_url,
            path,
            label,
            comment,
            public,
        } => {
            let spec = DatabaseSpec::parse(&path)?;
            let transport =
                transport_for_url(&remote_url, &registry, cli.token.clone(), cli.tus_threshold)?;
            let report = api
                .clone_db(
                    &auth,
                    &spec,
                    label.as_deref().unwrap_or(&spec.db),
                    &comment,
                    public,
                    &remote_url,
                    transport.as_ref(),
                )
                .await?;
            emit(
                cli.json,
                json!({
                    "api:status": "api:success",
                    "api:applied_commits": hex_ids(&report.applied_commits),
                }),
                &format!(
                    "Cloned {} into {} ({} commit(s))",
                    remote_url,
                    spec,
                    report.applied_commits.len()
                ),
            );
        }

        Commands::Fetch { path, remote } => {
            let (spec, _) = split_path(&path)?;
            let transport = remote_transport(
                &api,
                &auth,
                &spec,
                &remote,
                &registry,
                &cli.token,
                cli.tus_threshold,
            )
            .await?;
            let outcome = api.fetch(&auth, &spec, &remote, transport.as_ref()).await?;
            emit(
                cli.json,
                json!({
                    "api:status": "api:success",
                    "api:head_has_updated": outcome.head_advanced,
                    "api:head": outcome.head.map(|h| h.to_hex()),
                }),
                &if outcome.head_advanced {
                    format!("Fetched new head {}", outcome.head.expect("advanced head"))
                } else {
                    "Already up to date".to_string()
                },
            );
        }

        Commands::Push {
            path,
            remote,
            branch,
        } => {
            let (spec, target) = split_path(&path)?;
            let branch_target = branch.or(target).unwrap_or_else(|| "main".to_string());
            let transport = remote_transport(
                &api,
                &auth,
                &spec,
                &remote,
                &registry,
                &cli.token,
                cli.tus_threshold,
            )
            .await?;
            let result = api
                .push(&auth, &spec, &branch_target, &remote, transport.as_ref())
                .await?;
            match result {
                PushResult::New(head) => emit(
                    cli.json,
                    json!({
                        "api:status": "api:success",
                        "api:push_status": "api:new",
                        "api:repository_head": head.to_hex(),
                    }),
                    &format!("Pushed; remote is now at {}", head),
                ),
                PushResult::Same(head) => emit(
                    cli.json,
                    json!({
                        "api:status": "api:success",
                        "api:push_status": "api:same",
                        "api:repository_head": head.map(|h| h.to_hex()),
                    }),
                    "Remote already up to date",
                ),
            }
        }

        Commands::Pull {
            path,
            remote,
            branch,
        } => {
            let (spec, _) = split_path(&path)?;
            let transport = remote_transport(
                &api,
                &auth,
                &spec,
                &remote,
                &registry,
                &cli.token,
                cli.tus_threshold,
            )
            .await?;
            let report = api
                .pull(&auth, &spec, &branch, &remote, &branch, transport.as_ref())
                .await?;
            let (status, message) = match &report.outcome {
                PullOutcome::Unchanged => ("api:pull_unchanged", "Already up to date".to_string()),
                PullOutcome::FastForwarded(ids) => (
                    "api:pull_fast_forwarded",
                    format!("Fast-forwarded {} commit(s)", ids.len()),
                ),
                PullOutcome::Ahead => (
                    "api:pull_ahead",
                    "Local branch is ahead of the remote".to_string(),
                ),
                PullOutcome::DivergentHistory(_) => (
                    "api:pull_divergent_history",
                    "Histories diverged; rebase required".to_string(),
                ),
                PullOutcome::NoCommonHistory => (
                    "api:pull_no_common_history",
                    "No common history with the remote branch".to_string(),
                ),
            };
            emit(
                cli.json,
                json!({
                    "api:status": "api:success",
                    "api:pull_status": status,
                    "api:applied_commits": hex_ids(report.applied_commits()),
                }),
                &message,
            );
        }

        Commands::Bundle {
            path,
            output,
            branch,
        } => {
            let (spec, _) = split_path(&path)?;
            match api.bundle(&auth, &spec, Some(&branch)).await? {
                Some(payload) => {
                    std::fs::write(&output, &payload)
                        .map_err(|e| SyncError::Internal(format!("failed to write bundle: {}", e)))?;
                    emit(
                        cli.json,
                        json!({
                            "api:status": "api:success",
                            "api:bundle_bytes": payload.len(),
                        }),
                        &format!("Wrote {} bytes to {}", payload.len(), output.display()),
                    );
                }
                None => emit(
                    cli.json,
                    json!({ "api:status": "api:success", "api:bundle_bytes": 0 }),
                    "Branch is empty; nothing to bundle",
                ),
            }
        }

        Commands::Unbundle { path, file } => {
            let (spec, _) = split_path(&path)?;
            let payload = std::fs::read(&file)
                .map_err(|e| SyncError::NotFound(format!("bundle file {}: {}", file.display(), e)))?;
            let report = api
                .unbundle(&auth, &spec, bytes::Bytes::from(payload))
                .await?;
            emit(
                cli.json,
                json!({
                    "api:status": "api:success",
                    "api:applied_commits": hex_ids(report.applied_commits()),
                }),
                &format!("Applied {} commit(s)", report.applied_commits().len()),
            );
        }

        Commands::Log {
            path,
            branch,
            limit,
        } => {
            let (spec, _) = split_path(&path)?;
            let entries = api.log(&auth, &spec, &branch, limit).await?;
            if cli.json {
                let commits: Vec<_> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "commit": e.id.to_hex(),
                            "author": e.author,
                            "message": e.message,
                            "timestamp": e.timestamp,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    json!({ "api:status": "api:success", "api:log": commits })
                );
            } else {
                for entry in &entries {
                    let date = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                        .map(|d| d.to_rfc2822())
                        .unwrap_or_else(|| entry.timestamp.to_string());
                    println!("commit {}", entry.id);
                    println!("Author: {}", entry.author);
                    println!("Date:   {}", date);
                    println!();
                    println!("    {}", entry.message);
                    println!();
                }
            }
        }
    }
    Ok(())
}

/// Look up the remote's url and build a matching transport.
async fn remote_transport(
    api: &Orchestrator,
    auth: &AuthContext,
    spec: &DatabaseSpec,
    remote: &str,
    registry: &Arc<DatabaseRegistry>,
    token: &Option<String>,
    tus_threshold: usize,
) -> Result<Box<dyn strata_core::Transport>, SyncError> {
    let remotes = api.list_remotes(auth, spec).await?;
    let url = remotes
        .into_iter()
        .find(|(name, _, _)| name == remote)
        .map(|(_, url, _)| url)
        .ok_or_else(|| SyncError::NotFound(format!("remote {}", remote)))?;
    transport_for_url(&url, registry, token.clone(), tus_threshold)
}

fn hex_ids(ids: &[strata_core::CommitId]) -> Vec<String> {
    ids.iter().map(|c| c.to_hex()).collect()
}

fn emit(json: bool, envelope: serde_json::Value, message: &str) {
    if json {
        println!("{}", envelope);
    } else {
        println!("{}", message);
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_plain() {
        let (spec, rest) = split_path("acme/crm").unwrap();
        assert_eq!(spec, DatabaseSpec::new("acme", "crm"));
        assert_eq!(rest, None);
    }

    #[test]
    fn test_split_path_with_branch_ref() {
        let (spec, rest) = split_path("acme/crm/local/branch/dev").unwrap();
        assert_eq!(spec, DatabaseSpec::new("acme", "crm"));
        assert_eq!(rest.as_deref(), Some("local/branch/dev"));
    }

    #[test]
    fn test_split_path_rejects_bare_org() {
        assert!(split_path("acme").is_err());
    }
}
