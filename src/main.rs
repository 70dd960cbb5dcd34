use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use txqueue::{config, db, Bookkeeper, ConnectionProvider, QueueFetcher, SqliteConnectionProvider};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply schema migrations
    Migrate,
    /// List failed messages
    Failed { table: Table },
    /// Show the next scheduled message
    Next { table: Table },
    /// Show one message by id
    Show { table: Table, id: i64 },
    /// Claim one queued message, then acknowledge it (or requeue it)
    Claim {
        #[arg(long)]
        requeue: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Table {
    Published,
    Received,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let provider: Arc<dyn ConnectionProvider> =
        Arc::new(SqliteConnectionProvider::from_config(&cfg.database)?);
    let bookkeeper = Bookkeeper::new(Arc::clone(&provider));

    match args.command {
        Command::Migrate => {
            db::run_migrations(provider.as_ref()).await?;
            info!("migrations applied");
        }
        Command::Failed { table } => match table {
            Table::Published => print_json(&bookkeeper.list_failed_published().await?)?,
            Table::Received => print_json(&bookkeeper.list_failed_received().await?)?,
        },
        Command::Next { table } => match table {
            Table::Published => print_json(&bookkeeper.next_scheduled_published().await?)?,
            Table::Received => print_json(&bookkeeper.next_scheduled_received().await?)?,
        },
        Command::Show { table, id } => match table {
            Table::Published => {
                let msg = bookkeeper.get_published(id).await?;
                print_json(&msg.ok_or_else(|| anyhow!("published message {id} not found"))?)?
            }
            Table::Received => {
                let msg = bookkeeper.get_received(id).await?;
                print_json(&msg.ok_or_else(|| anyhow!("received message {id} not found"))?)?
            }
        },
        Command::Claim { requeue } => {
            let fetcher = QueueFetcher::new(provider, cfg.lease_config());
            let Some(mut lease) = fetcher.fetch_next().await? else {
                info!("queue is empty");
                return Ok(());
            };
            let (message_id, message_type) = lease.identity();
            println!("{message_id}\t{message_type:?}");
            let settled = if requeue {
                lease.abandon().await
            } else {
                lease.acknowledge().await
            };
            let disposed = lease.dispose().await;
            settled?;
            disposed?;
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
