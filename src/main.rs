use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walshadow::config::{DbConfig, ReplicaConfig, CONFIG_FILE_NAME, ENV_CONFIG};
use walshadow::{Config, Db, Generation, Replica, ReplicationService, RestoreOptions};

#[derive(Parser, Debug)]
#[command(name = "walshadow")]
#[command(about = "Continuous WAL replication and point-in-time restore for SQLite", long_about = None)]
struct Args {
    /// Configuration file (defaults to $WALSHADOW_CONFIG, then ./walshadow.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replicate every configured database until interrupted
    Replicate,

    /// List generations on each replica of a database
    Generations {
        /// Database path as written in the configuration
        db: PathBuf,
    },

    /// List snapshots on each replica of a database
    Snapshots {
        db: PathBuf,
    },

    /// Take a snapshot on every replica of a database now
    Snapshot {
        db: PathBuf,
    },

    /// Restore a database from a replica
    Restore {
        db: PathBuf,

        /// Output path for the restored database
        #[arg(short, long)]
        output: PathBuf,

        /// Replica to restore from (defaults to the first configured one)
        #[arg(long)]
        replica: Option<String>,

        /// Generation to restore (defaults to the newest)
        #[arg(long)]
        generation: Option<String>,

        /// Last WAL segment index to replay
        #[arg(long)]
        index: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "walshadow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = args
        .config
        .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = Config::load(&config_path)?;

    match args.command {
        Command::Replicate => replicate(&config).await,
        Command::Generations { db } => generations(db_config(&config, &db)?).await,
        Command::Snapshots { db } => snapshots(db_config(&config, &db)?).await,
        Command::Snapshot { db } => snapshot(db_config(&config, &db)?).await,
        Command::Restore {
            db,
            output,
            replica,
            generation,
            index,
        } => {
            let db_config = db_config(&config, &db)?;
            let replica_config = match replica {
                Some(name) => db_config
                    .replicas
                    .iter()
                    .find(|r| r.name() == name)
                    .with_context(|| format!("no replica named {}", name))?,
                None => db_config
                    .replicas
                    .first()
                    .context("database has no replicas configured")?,
            };
            let opts = RestoreOptions {
                output_path: output,
                generation: generation.as_deref().map(Generation::parse).transpose()?,
                index,
            };
            let client = replica_config.build_client()?;
            let pos = walshadow::restore(client, &opts).await?;
            println!("restored {} to {}", opts.output_path.display(), pos);
            Ok(())
        }
    }
}

fn db_config<'a>(config: &'a Config, path: &Path) -> anyhow::Result<&'a DbConfig> {
    config
        .find_db(path)
        .with_context(|| format!("database {} is not in the configuration", path.display()))
}

fn build_replicas(db: &Arc<Db>, configs: &[ReplicaConfig]) -> anyhow::Result<Vec<Replica>> {
    let mut replicas = Vec::new();
    for config in configs {
        replicas.push(Replica::new(
            config.name(),
            Arc::clone(db),
            config.build_client()?,
            config.options()?,
        ));
    }
    Ok(replicas)
}

async fn replicate(config: &Config) -> anyhow::Result<()> {
    let mut service = ReplicationService::from_config(config)?;
    service.start();

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping replication...");
    service.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn generations(db_config: &DbConfig) -> anyhow::Result<()> {
    println!("{:<16} {:<34} {:>9} {:>12}", "replica", "generation", "snapshots", "wal parts");
    for config in &db_config.replicas {
        let client = config.build_client()?;
        for generation in client.generations().await? {
            let snapshots = client.snapshots(&generation).await?;
            let parts = client.wal_segments(&generation).await?;
            println!(
                "{:<16} {:<34} {:>9} {:>12}",
                config.name(),
                generation,
                snapshots.len(),
                parts.len()
            );
        }
    }
    Ok(())
}

async fn snapshots(db_config: &DbConfig) -> anyhow::Result<()> {
    println!(
        "{:<16} {:<34} {:>16} {:>12}  created",
        "replica", "generation", "index", "size"
    );
    for config in &db_config.replicas {
        let client = config.build_client()?;
        for generation in client.generations().await? {
            for snapshot in client.snapshots(&generation).await? {
                println!(
                    "{:<16} {:<34} {:016x} {:>12}  {}",
                    config.name(),
                    snapshot.generation,
                    snapshot.index,
                    snapshot.size,
                    snapshot.created_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn snapshot(db_config: &DbConfig) -> anyhow::Result<()> {
    let db = Arc::new(Db::new(&db_config.path, db_config.options()));
    // Register before the first sync so pruning waits for these replicas.
    let replicas = build_replicas(&db, &db_config.replicas)?;
    let sync_db = Arc::clone(&db);
    tokio::task::spawn_blocking(move || sync_db.sync()).await??;

    let mut result = Ok(());
    for replica in &replicas {
        // Ship first so the WAL the snapshot depends on is on the replica.
        let outcome = async {
            replica.sync().await?;
            let info = replica.snapshot().await?;
            replica.sync().await?;
            Ok::<_, walshadow::ShadowError>(info)
        }
        .await;
        match outcome {
            Ok(info) => println!("{}: snapshot {} ({} bytes)", replica.name(), info.pos(), info.size),
            Err(e) => {
                eprintln!("{}: snapshot failed: {}", replica.name(), e);
                result = Err(anyhow::anyhow!("snapshot failed on replica {}", replica.name()));
            }
        }
    }
    drop(replicas);
    db.close();
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
