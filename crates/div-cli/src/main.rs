use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

mod commands;
mod output;

use commands::Context;
use output::OutputFormat;

#[derive(Parser)]
#[command(
    name = "div",
    about = "Declarative deployments over a resource store",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true, default_value = "div.toml")]
    config: PathBuf,
    /// Namespace to operate in.
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,
    /// Output format for resources.
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display one or more resources.
    ///
    /// Without a resource type, lists the known types and fails.
    Get {
        /// Resource type (deployment, release, install, ...).
        resource: Option<String>,
        /// Resource name. Omit to list every resource of the type.
        name: Option<String>,
        /// Label selector, supports '=', '==' and '!='
        /// (e.g. -l key1=value1,key2!=value2).
        #[arg(short = 'l', long = "selector")]
        selectors: Vec<String>,
        /// After the initial listing, keep streaming changes.
        #[arg(short, long)]
        watch: bool,
    },
    /// Apply a resource from a .json or .toml file.
    Apply {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Delete a resource by name.
    Delete { resource: String, name: String },
    /// Print the logs recorded for a resource.
    Logs {
        resource: String,
        name: String,
        /// Only show lines newer than this (e.g. 30s, 10m, 2h).
        #[arg(long)]
        since: Option<String>,
        /// Keep polling for new lines.
        #[arg(short, long)]
        follow: bool,
    },
    /// Run the deployment gateway for one cluster.
    Gateway {
        /// Cluster this gateway installs into.
        #[arg(long)]
        cluster: String,
        /// Only serve this project. Empty serves every project.
        #[arg(long)]
        project: Option<String>,
        /// Only serve this application.
        #[arg(long)]
        app: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing()?;

    let cli = Cli::parse();
    let ctx = Context::open(&cli.config, &cli.namespace)?;
    let shutdown = shutdown_on_ctrl_c();
    let mut stdout = std::io::stdout();

    match cli.command {
        Commands::Get { resource: None, .. } => {
            commands::get::list_kinds(&ctx, &mut std::io::stderr()).await?;
            return Ok(ExitCode::FAILURE);
        }
        Commands::Get {
            resource: Some(resource),
            name,
            selectors,
            watch,
        } => {
            let request = commands::get::GetRequest {
                resource: &resource,
                name: name.as_deref(),
                selectors: &selectors,
                watch,
            };
            commands::get::get(&ctx, request, cli.output, shutdown, &mut stdout).await?;
        }
        Commands::Apply { file } => {
            commands::apply::apply(&ctx, &file, cli.output, &mut stdout)?;
        }
        Commands::Delete { resource, name } => {
            commands::delete::delete(&ctx, &resource, &name, &mut stdout)?;
        }
        Commands::Logs {
            resource,
            name,
            since,
            follow,
        } => {
            commands::logs::logs(
                &ctx,
                &resource,
                &name,
                since.as_deref(),
                follow,
                shutdown,
                &mut stdout,
            )
            .await?;
        }
        Commands::Gateway {
            cluster,
            project,
            app,
        } => {
            commands::gateway::gateway(
                &ctx,
                &cluster,
                project.as_deref(),
                app.as_deref(),
                shutdown,
            )
            .await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// `RUST_LOG` wins; otherwise `info`. A non-empty `DIV_DEBUG` adds
/// backend tracing on top of either.
fn init_tracing() -> anyhow::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,div=info"));
    if std::env::var("DIV_DEBUG").is_ok_and(|v| !v.is_empty()) {
        filter = filter.add_directive("div_state=trace".parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

// ── Shutdown signal ──────────────────────────────────────────────

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });
    shutdown_rx
}
